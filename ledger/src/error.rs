use std::{error::Error, fmt};

use store::PersistErr;

use crate::AccountKey;

/// Which quota window tripped the safety margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaWindow {
    Session,
    Weekly,
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Weekly => write!(f, "weekly"),
        }
    }
}

/// Quota accounting failures.
#[derive(Debug)]
pub enum QuotaErr {
    /// Projected usage would cross `limit × (1 − margin)`. Not retryable
    /// until the corresponding window resets.
    Exceeded {
        key: AccountKey,
        window: QuotaWindow,
        used: u64,
        cap: u64,
    },
    UnknownAccount(AccountKey),
    /// Auto-shutdown was requested for an account with no running session.
    NoActiveSession(AccountKey),
    /// The durable write failed; the mutation was aborted.
    Persist(PersistErr),
}

impl fmt::Display for QuotaErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exceeded {
                key,
                window,
                used,
                cap,
            } => write!(
                f,
                "quota exceeded for {key}: {window} usage {used}s reached the {cap}s safety cap"
            ),
            Self::UnknownAccount(key) => write!(f, "unknown quota account: {key}"),
            Self::NoActiveSession(key) => {
                write!(f, "no active session for quota account: {key}")
            }
            Self::Persist(e) => write!(f, "{e}"),
        }
    }
}

impl Error for QuotaErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Persist(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistErr> for QuotaErr {
    fn from(value: PersistErr) -> Self {
        Self::Persist(value)
    }
}
