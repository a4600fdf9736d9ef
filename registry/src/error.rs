use std::{error::Error, fmt};

use comms::specs::{job::JobId, worker::WorkerId};
use ledger::{AccountKey, QuotaErr};
use store::PersistErr;

/// Worker registry failures.
#[derive(Debug)]
pub enum RegistryErr {
    UnknownWorker(WorkerId),
    /// The worker already holds a non-terminal job.
    WorkerBusy { worker_id: WorkerId, held: JobId },
    /// The worker is not in a dispatchable state.
    NotDispatchable {
        worker_id: WorkerId,
        status: &'static str,
    },
    /// The worker's account is at or past its quota safety cap.
    QuotaBlocked(AccountKey),
    Quota(QuotaErr),
    Persist(PersistErr),
}

impl fmt::Display for RegistryErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownWorker(id) => write!(f, "unknown worker: {id}"),
            Self::WorkerBusy { worker_id, held } => {
                write!(f, "worker {worker_id} already holds job {held}")
            }
            Self::NotDispatchable { worker_id, status } => {
                write!(f, "worker {worker_id} is not dispatchable: {status}")
            }
            Self::QuotaBlocked(key) => {
                write!(f, "account {key} is at its quota safety cap")
            }
            Self::Quota(e) => write!(f, "{e}"),
            Self::Persist(e) => write!(f, "{e}"),
        }
    }
}

impl Error for RegistryErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Quota(e) => Some(e),
            Self::Persist(e) => Some(e),
            _ => None,
        }
    }
}

impl From<QuotaErr> for RegistryErr {
    fn from(value: QuotaErr) -> Self {
        Self::Quota(value)
    }
}

impl From<PersistErr> for RegistryErr {
    fn from(value: PersistErr) -> Self {
        Self::Persist(value)
    }
}
