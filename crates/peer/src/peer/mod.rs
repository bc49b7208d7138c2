//! Uniform call / publish / subscribe interface over local and remote peers.
//!
//! [`LocalPeer`] executes in-process against its unit registry;
//! [`RemotePeer`] turns the same calls into packets on a lazily dialed
//! connection. Which one a caller holds is decided at construction.

mod local;
mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use network_shared::Payload;

pub use local::{LocalPeer, LocalPeerBuilder};
pub use remote::{RemotePeer, RemoteState, RemoteTransport};

use crate::error::PeerError;
use crate::manifest::PeerDetails;
use crate::subscription::Subscription;
use crate::unit::Unit;

#[async_trait]
pub trait Peer: Send + Sync {
    fn details(&self) -> &PeerDetails;

    /// Run `action` and return its result.
    async fn run(&self, action: &str, arg: Payload) -> Result<Payload, PeerError>;

    /// Deliver an already produced result of `action` to its subscribers.
    async fn publish(&self, action: &str, data: Payload) -> Result<(), PeerError>;

    /// Run `action`, then publish its result. Fan-out failures do not fail the run.
    async fn run_and_publish(&self, action: &str, arg: Payload) -> Result<(), PeerError>;

    async fn list_actions(&self) -> Result<Vec<String>, PeerError>;

    async fn has_action(&self, name: &str) -> Result<bool, PeerError> {
        Ok(self.list_actions().await?.iter().any(|a| a == name))
    }

    async fn register_action(&self, name: &str, unit: Arc<dyn Unit>) -> Result<(), PeerError>;

    async fn list_receivers(&self) -> Result<Vec<String>, PeerError>;

    async fn has_receiver(&self, name: &str) -> Result<bool, PeerError> {
        Ok(self.list_receivers().await?.iter().any(|r| r == name))
    }

    async fn register_receiver(&self, name: &str, unit: Arc<dyn Unit>) -> Result<(), PeerError>;

    /// Invoke `receiver` one-way.
    async fn notify(&self, receiver: &str, data: Payload) -> Result<(), PeerError>;

    async fn get_peer(&self, address: &str) -> Result<Arc<RemotePeer>, PeerError>;

    async fn list_peers(&self) -> Result<Vec<Arc<RemotePeer>>, PeerError>;

    async fn subscribe(&self, subscription: Subscription) -> Result<(), PeerError>;
}
