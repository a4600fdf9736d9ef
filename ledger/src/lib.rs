//! Quota accounting for the pool of ephemeral provider accounts.
//!
//! The ledger is the sole writer of quota state. Every provider imposes a
//! hard session ceiling and a weekly ceiling; crossing either risks a
//! permanent account ban, so the ledger enforces a configured safety margin
//! *below* the real limits and fails closed when a usage update would cross
//! it.

mod account;
mod error;
mod ledger;
mod shutdown;

pub use account::{AccountKey, ProviderLimits, ProviderLimitsMap, QuotaAccount};
pub use error::{QuotaErr, QuotaWindow};
pub use ledger::Ledger;
pub use shutdown::DrainSignal;

/// The ledger module's result type.
pub type Result<T> = std::result::Result<T, QuotaErr>;
