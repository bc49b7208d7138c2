//! Authentication gate of an accepting connection.
//!
//! Packets other than `Authenticate` wait here until the handshake resolved.
//! Waiters live in their own dispatch tasks, so the read loop keeps running
//! (and can deliver the `Authenticate` they are waiting for).

use std::sync::Arc;

use auth::Grant;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Granted(Arc<Grant>),
    Denied,
    Closed,
}

#[derive(Debug, Clone)]
pub struct AuthGate {
    tx: Arc<watch::Sender<AuthState>>,
}

impl AuthGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AuthState::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Only the first resolution counts; returns `false` once the gate left
    /// `Pending`.
    pub fn grant(&self, grant: Grant) -> bool {
        self.resolve(AuthState::Granted(Arc::new(grant)))
    }

    pub fn deny(&self) -> bool {
        self.resolve(AuthState::Denied)
    }

    fn resolve(&self, next: AuthState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state != AuthState::Pending {
                return false;
            }
            *state = next;
            true
        })
    }

    pub fn is_pending(&self) -> bool {
        *self.tx.borrow() == AuthState::Pending
    }

    /// Final state; wakes every waiter with a refusal.
    pub fn close(&self) {
        self.tx.send_replace(AuthState::Closed);
    }

    pub fn current(&self) -> AuthState {
        self.tx.borrow().clone()
    }

    /// Resolves once the state left `Pending`.
    pub async fn wait(&self) -> Result<Arc<Grant>, AuthState> {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|s| *s != AuthState::Pending).await {
            Ok(state) => state.clone(),
            // The sender lives in `self`, so this is unreachable in practice.
            Err(_) => AuthState::Closed,
        };
        match state {
            AuthState::Granted(grant) => Ok(grant),
            other => Err(other),
        }
    }
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}
