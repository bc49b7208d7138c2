//! Per-connection correlation table: request id -> waiting caller.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use network_shared::Packet;
use tokio::sync::oneshot;

/// Each entry is removed exactly once: by the matching response, by the
/// caller's timeout or when the connection closes.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Packet>>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Packet>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` (and registers nothing) when the caller already gave up.
    pub(crate) fn insert(&self, id: u64, waiter: oneshot::Sender<Packet>) -> bool {
        let mut waiters = self.lock();
        if waiter.is_closed() {
            return false;
        }
        waiters.insert(id, waiter);
        true
    }

    /// Hands `packet` to the caller waiting on `id`. Returns the packet back if
    /// nobody is waiting (late or unsolicited response).
    pub(crate) fn resolve(&self, id: u64, packet: Packet) -> Result<(), Packet> {
        match self.lock().remove(&id) {
            Some(waiter) => {
                // A dropped receiver means the caller gave up; nothing to do.
                let _ = waiter.send(packet);
                Ok(())
            }
            None => Err(packet),
        }
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Removes entries whose caller dropped its receiver. Returns how many.
    pub(crate) fn prune_abandoned(&self) -> usize {
        let mut waiters = self.lock();
        let before = waiters.len();
        waiters.retain(|_, waiter| !waiter.is_closed());
        before - waiters.len()
    }

    /// Drops every waiter; their callers observe a closed channel.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
