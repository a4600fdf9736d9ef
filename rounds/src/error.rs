use std::{error::Error, fmt};

use comms::specs::job::{RoundId, TrainingJobId};
use scheduler::DispatchErr;
use store::PersistErr;

/// Round coordination failures.
#[derive(Debug)]
pub enum RoundErr {
    UnknownRound(RoundId),
    UnknownTrainingJob(TrainingJobId),
    /// The coordinator's event loop is gone.
    CoordinatorClosed,
    Dispatch(DispatchErr),
    Persist(PersistErr),
}

impl fmt::Display for RoundErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRound(id) => write!(f, "unknown round: {id}"),
            Self::UnknownTrainingJob(id) => write!(f, "unknown training job: {id}"),
            Self::CoordinatorClosed => write!(f, "round coordinator is not running"),
            Self::Dispatch(e) => write!(f, "{e}"),
            Self::Persist(e) => write!(f, "{e}"),
        }
    }
}

impl Error for RoundErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Dispatch(e) => Some(e),
            Self::Persist(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DispatchErr> for RoundErr {
    fn from(value: DispatchErr) -> Self {
        Self::Dispatch(value)
    }
}

impl From<PersistErr> for RoundErr {
    fn from(value: PersistErr) -> Self {
        Self::Persist(value)
    }
}
