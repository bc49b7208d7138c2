use std::sync::Arc;

use async_trait::async_trait;
use auth::{AuthError, AuthService, Claims, Token};
use futures::future::join_all;
use network_shared::{Payload, UnitKind};
use tracing::{debug, info, warn};

use super::Peer;
use super::remote::{RemotePeer, RemoteTransport};
use crate::connection::ConnectionSettings;
use crate::error::{FanoutFailure, PeerError};
use crate::manifest::PeerDetails;
use crate::subscription::{
    CreateOutcome, MemorySubscriptionStore, Subscription, SubscriptionStore,
};
use crate::unit::{Unit, UnitRegistry};

/// The peer this process is. Owns the unit registry, the subscription store
/// and one [`RemotePeer`] per manifest entry.
pub struct LocalPeer {
    details: PeerDetails,
    units: UnitRegistry,
    remotes: Vec<Arc<RemotePeer>>,
    subscriptions: Arc<dyn SubscriptionStore>,
    auth: Arc<AuthService>,
}

pub struct LocalPeerBuilder {
    details: PeerDetails,
    auth: Arc<AuthService>,
    peers: Vec<PeerDetails>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    transport: RemoteTransport,
}

impl LocalPeerBuilder {
    /// Known remote peers. Fixed for the lifetime of the local peer.
    pub fn peers(mut self, peers: Vec<PeerDetails>) -> Self {
        self.peers = peers;
        self
    }

    pub fn subscriptions(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = Some(store);
        self
    }

    pub fn transport(mut self, transport: RemoteTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.transport.settings = settings;
        self
    }

    pub fn build(self) -> Arc<LocalPeer> {
        let subscriptions = self
            .subscriptions
            .unwrap_or_else(|| Arc::new(MemorySubscriptionStore::new()));
        let transport = self.transport;
        let peers = self.peers;

        Arc::new_cyclic(|me| LocalPeer {
            details: self.details,
            units: UnitRegistry::new(),
            remotes: peers
                .into_iter()
                .map(|details| Arc::new(RemotePeer::new(details, me.clone(), transport.clone())))
                .collect(),
            subscriptions,
            auth: self.auth,
        })
    }
}

impl LocalPeer {
    pub fn builder(details: PeerDetails, auth: Arc<AuthService>) -> LocalPeerBuilder {
        LocalPeerBuilder {
            details,
            auth,
            peers: Vec::new(),
            subscriptions: None,
            transport: RemoteTransport::default(),
        }
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    /// Sign `claims` with this host's secret, for handing to another peer.
    pub fn issue_token(&self, claims: Claims) -> Result<Token, AuthError> {
        self.auth.issue(claims)
    }

    pub fn unit_names(&self, kind: UnitKind) -> Vec<String> {
        self.units.names(kind)
    }

    pub fn has_peer(&self, address: &str) -> bool {
        self.remote_by_address(address).is_some()
    }

    pub fn get_peer_by_id(&self, id: &str) -> Option<Arc<RemotePeer>> {
        self.remotes.iter().find(|r| r.details().id == id).cloned()
    }

    pub fn subscription_store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    fn remote_by_address(&self, address: &str) -> Option<&Arc<RemotePeer>> {
        self.remotes.iter().find(|r| r.details().address == address)
    }

    async fn execute(&self, kind: UnitKind, name: &str, arg: Payload) -> Result<Payload, PeerError> {
        let unit = self
            .units
            .get(kind, name)
            .ok_or_else(|| PeerError::UnitNotFound {
                kind,
                name: name.to_string(),
            })?;
        unit.execute(arg).await.map_err(|e| PeerError::Unit {
            kind,
            name: name.to_string(),
            message: format!("{e:#}"),
        })
    }

    async fn notify_subscriber(
        &self,
        subscription: &Subscription,
        data: Payload,
    ) -> Result<(), PeerError> {
        let remote = self
            .remote_by_address(&subscription.address)
            .ok_or_else(|| PeerError::PeerNotFound(subscription.address.clone()))?;
        remote.notify(&subscription.receiver, data).await
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn details(&self) -> &PeerDetails {
        &self.details
    }

    async fn run(&self, action: &str, arg: Payload) -> Result<Payload, PeerError> {
        self.execute(UnitKind::Action, action, arg).await
    }

    async fn publish(&self, action: &str, data: Payload) -> Result<(), PeerError> {
        if !self.units.contains(UnitKind::Action, action) {
            return Err(PeerError::UnitNotFound {
                kind: UnitKind::Action,
                name: action.to_string(),
            });
        }

        let records = self.subscriptions.find_by_action(action).await?;
        if records.is_empty() {
            debug!(target: "peer::fanout", "'{action}' has no subscribers");
            return Ok(());
        }

        let total = records.len();
        let outcomes = join_all(records.iter().map(|record| {
            let data = data.clone();
            async move {
                let sub = &record.subscription;
                self.notify_subscriber(sub, data)
                    .await
                    .map_err(|e| FanoutFailure {
                        address: sub.address.clone(),
                        receiver: sub.receiver.clone(),
                        error: e.to_string(),
                    })
            }
        }))
        .await;

        let failures: Vec<FanoutFailure> = outcomes.into_iter().filter_map(Result::err).collect();
        for f in &failures {
            warn!(
                target: "peer::fanout",
                "notify {}/{} for '{action}' failed: {}", f.address, f.receiver, f.error
            );
        }
        if failures.is_empty() {
            debug!(target: "peer::fanout", "published '{action}' to {total} subscribers");
            Ok(())
        } else {
            Err(PeerError::PartialPublish {
                action: action.to_string(),
                total,
                failures,
            })
        }
    }

    async fn run_and_publish(&self, action: &str, arg: Payload) -> Result<(), PeerError> {
        let result = self.run(action, arg).await?;
        if let Err(e) = self.publish(action, result).await {
            warn!(target: "peer::fanout", "run of '{action}' succeeded, publish failed: {e}");
        }
        Ok(())
    }

    async fn list_actions(&self) -> Result<Vec<String>, PeerError> {
        Ok(self.units.names(UnitKind::Action))
    }

    async fn has_action(&self, name: &str) -> Result<bool, PeerError> {
        Ok(self.units.contains(UnitKind::Action, name))
    }

    async fn register_action(&self, name: &str, unit: Arc<dyn Unit>) -> Result<(), PeerError> {
        self.units.register(UnitKind::Action, name, unit)?;
        debug!(target: "peer::units", "registered action '{name}'");
        Ok(())
    }

    async fn list_receivers(&self) -> Result<Vec<String>, PeerError> {
        Ok(self.units.names(UnitKind::Receiver))
    }

    async fn has_receiver(&self, name: &str) -> Result<bool, PeerError> {
        Ok(self.units.contains(UnitKind::Receiver, name))
    }

    async fn register_receiver(&self, name: &str, unit: Arc<dyn Unit>) -> Result<(), PeerError> {
        self.units.register(UnitKind::Receiver, name, unit)?;
        debug!(target: "peer::units", "registered receiver '{name}'");
        Ok(())
    }

    async fn notify(&self, receiver: &str, data: Payload) -> Result<(), PeerError> {
        self.execute(UnitKind::Receiver, receiver, data).await?;
        Ok(())
    }

    async fn get_peer(&self, address: &str) -> Result<Arc<RemotePeer>, PeerError> {
        self.remote_by_address(address)
            .cloned()
            .ok_or_else(|| PeerError::PeerNotFound(address.to_string()))
    }

    async fn list_peers(&self) -> Result<Vec<Arc<RemotePeer>>, PeerError> {
        Ok(self.remotes.clone())
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<(), PeerError> {
        if subscription.address.trim().is_empty() {
            return Err(PeerError::InvalidSubscription("address is empty"));
        }
        if subscription.action.trim().is_empty() {
            return Err(PeerError::InvalidSubscription("action is empty"));
        }
        if subscription.receiver.trim().is_empty() {
            return Err(PeerError::InvalidSubscription("receiver is empty"));
        }

        let (address, action) = (subscription.address.clone(), subscription.action.clone());
        match self.subscriptions.create(subscription).await? {
            CreateOutcome::Created(id) => info!(
                target: "peer::subscriptions",
                "{address} subscribed to '{action}' (#{id})"
            ),
            CreateOutcome::AlreadyExists(id) => debug!(
                target: "peer::subscriptions",
                "{address} already subscribed to '{action}' (#{id})"
            ),
        }
        Ok(())
    }
}
