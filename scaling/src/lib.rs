//! The auto-scaling policy engine.
//!
//! Free-tier sessions are short; continuous coverage comes from staggering
//! many accounts' session windows so one activates as the previous one
//! approaches its safety cap. This component only computes the schedule; an
//! external provisioning collaborator actually starts and stops sessions.

mod policy;

pub use policy::{ActivationEntry, ActivationSchedule, PolicyEngine, ScalingConfig};
