use std::{error::Error, fmt, io};

use comms::specs::job::JobId;
use registry::RegistryErr;
use store::PersistErr;

/// Dispatch scheduler failures.
#[derive(Debug)]
pub enum DispatchErr {
    UnknownJob(JobId),
    /// The job is already in a terminal state.
    Terminal { job_id: JobId, status: &'static str },
    Registry(RegistryErr),
    Persist(PersistErr),
    /// The worker link could not deliver a command.
    Link(io::Error),
}

impl fmt::Display for DispatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownJob(id) => write!(f, "unknown job: {id}"),
            Self::Terminal { job_id, status } => {
                write!(f, "job {job_id} is already terminal: {status}")
            }
            Self::Registry(e) => write!(f, "{e}"),
            Self::Persist(e) => write!(f, "{e}"),
            Self::Link(e) => write!(f, "worker link error: {e}"),
        }
    }
}

impl Error for DispatchErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Registry(e) => Some(e),
            Self::Persist(e) => Some(e),
            Self::Link(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegistryErr> for DispatchErr {
    fn from(value: RegistryErr) -> Self {
        Self::Registry(value)
    }
}

impl From<PersistErr> for DispatchErr {
    fn from(value: PersistErr) -> Self {
        Self::Persist(value)
    }
}
