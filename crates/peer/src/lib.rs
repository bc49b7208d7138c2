//! Peer-to-peer remote execution.
//!
//! Every host is a [`LocalPeer`](peer::LocalPeer) that registers named
//! actions and receivers and knows a fixed set of remote peers from a
//! manifest. Remote peers are reached through the same [`Peer`](peer::Peer)
//! interface over authenticated TLS connections.
//!
//! Module overview:
//! - `connection`: multiplexed request/response over one stream
//! - `handler`:    what an inbound packet does on this host
//! - `peer`:       local / remote peer implementations
//! - `subscription`: publish/subscribe records and their stores
//! - `node`:       startup wiring used by the `peer` binary
//!
//! (C) Forge of Stories

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod listener;
pub mod manifest;
pub mod node;
pub mod peer;
pub mod subscription;
pub mod tls;
pub mod unit;

pub use config::PeerConfig;
pub use connection::{Connection, ConnectionSettings, Role};
pub use error::{ConnectionError, PeerError};
pub use manifest::{PeerDetails, PeersManifest};
pub use node::{Node, NodeError};
pub use peer::{LocalPeer, Peer, RemotePeer};
pub use subscription::Subscription;
pub use unit::{Unit, receiver_fn, unit_fn};
