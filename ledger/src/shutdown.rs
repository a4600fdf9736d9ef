use std::{collections::HashMap, time::Duration};

use log::warn;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::AbortHandle, time};

use crate::AccountKey;

/// Emitted when an account must stop taking work: its workers finish their
/// current job and accept no new one before the external session is torn
/// down by the provisioning collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSignal {
    pub account: AccountKey,
}

/// Cancellable auto-shutdown timers, one per account.
///
/// Arming a key replaces any previous timer for it, so a session restart
/// reschedules cleanly.
#[derive(Default)]
pub(crate) struct ShutdownTimers {
    handles: Mutex<HashMap<AccountKey, AbortHandle>>,
}

impl ShutdownTimers {
    pub(crate) fn arm(&self, key: AccountKey, delay: Duration, tx: mpsc::Sender<DrainSignal>) {
        let mut handles = self.handles.lock();

        if let Some(prev) = handles.remove(&key) {
            prev.abort();
        }

        let account = key.clone();
        let task = tokio::spawn(async move {
            time::sleep(delay).await;

            if tx.send(DrainSignal { account }).await.is_err() {
                warn!("drain receiver dropped, auto-shutdown signal lost");
            }
        });

        handles.insert(key, task.abort_handle());
    }

    pub(crate) fn cancel(&self, key: &AccountKey) {
        if let Some(handle) = self.handles.lock().remove(key) {
            handle.abort();
        }
    }
}
