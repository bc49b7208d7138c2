//! Startup-Sequenz eines Peer-Hosts: Konfiguration → Secret → Stores → TLS →
//! Listener. Alles, was ein `serve` braucht, hängt an [`Node`].

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use auth::{AuthError, AuthService, SecretError, SecretKey};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PeerConfig, ServiceConfig};
use crate::listener::Listener;
use crate::manifest::{PeerDetails, PeersManifest};
use crate::peer::{LocalPeer, Peer, RemoteTransport};
use crate::subscription::{
    FileSubscriptionStore, MemorySubscriptionStore, StoreError, SubscriptionStore,
};
use crate::tls::{self, TlsError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// A running peer host: the local peer plus its listener.
pub struct Node {
    local: Arc<LocalPeer>,
    listener: Listener,
}

fn auth_service(config: &PeerConfig) -> Result<Arc<AuthService>, NodeError> {
    let security = &config.security;
    let secret = SecretKey::load_or_generate(&config.resolve(&security.secret_key_path)?)?;
    let auth = Arc::new(AuthService::new(&secret));
    if security.issue_dev_token {
        let token = auth.issue_dev_token()?;
        warn!(
            target: "peer::node",
            "development token (loopback only, all permissions): {token}"
        );
    }
    Ok(auth)
}

fn remote_transport(config: &PeerConfig) -> Result<RemoteTransport, NodeError> {
    let security = &config.security;
    let trusted = security
        .trusted_certs
        .iter()
        .map(|p| config.resolve(p))
        .collect::<Result<Vec<PathBuf>, _>>()?;
    let client_tls = tls::client_config(security.accept_invalid_certs, &trusted)?;
    Ok(RemoteTransport {
        settings: config.connection_settings(),
        tls: Some(TlsConnector::from(client_tls)),
        dial_timeout: config.dial_timeout(),
    })
}

/// A local peer that only dials out: no listener, no port, subscriptions in
/// memory. Safe to use next to a running `serve` with the same config.
pub async fn dial_only(config: &PeerConfig) -> Result<Arc<LocalPeer>, NodeError> {
    let auth = auth_service(config)?;
    let manifest = PeersManifest::load(&config.resolve(&config.storage.peers_path)?)?;
    let local = LocalPeer::builder(PeerDetails::local(config.service.address()), auth)
        .peers(manifest.peers)
        .transport(remote_transport(config)?)
        .build();
    debug!(
        target: "peer::node",
        "dial-only peer with {} known peers",
        local.list_peers().await.map(|p| p.len()).unwrap_or(0)
    );
    Ok(local)
}

impl Node {
    pub async fn start(config: PeerConfig) -> Result<Self, NodeError> {
        let security = &config.security;
        let auth = auth_service(&config)?;

        let subscriptions: Arc<dyn SubscriptionStore> = match &config.storage.subscriptions_path {
            Some(path) => Arc::new(FileSubscriptionStore::open(config.resolve(path)?).await?),
            None => Arc::new(MemorySubscriptionStore::new()),
        };
        let manifest = PeersManifest::load(&config.resolve(&config.storage.peers_path)?)?;

        let transport = remote_transport(&config)?;
        let (certs, key) = tls::load_or_generate(
            &config.resolve(&security.cert_path)?,
            &config.resolve(&security.key_path)?,
            &config.service.host,
        )?;
        let server_tls = tls::server_config(certs, key)?;

        let bind = config.service.address();
        let tcp = TcpListener::bind(&bind)
            .await
            .map_err(|source| NodeError::Bind {
                address: bind.clone(),
                source,
            })?;
        let bound = tcp.local_addr().map_err(|source| NodeError::Bind {
            address: bind.clone(),
            source,
        })?;
        // Port 0 in the config means "any"; advertise the one we got.
        let address = ServiceConfig {
            port: bound.port(),
            ..config.service.clone()
        }
        .address();

        let settings = transport.settings.clone();
        let local = LocalPeer::builder(PeerDetails::local(address), auth)
            .peers(manifest.peers)
            .subscriptions(subscriptions)
            .transport(transport)
            .build();

        let listener = Listener::serve(tcp, Some(server_tls), Arc::clone(&local), settings)
            .map_err(|source| NodeError::Bind {
                address: bind,
                source,
            })?;

        info!(
            target: "peer::node",
            "peer {} ready, {} known peers",
            local.details().address,
            local.list_peers().await.map(|p| p.len()).unwrap_or(0)
        );
        Ok(Self { local, listener })
    }

    pub fn local(&self) -> &Arc<LocalPeer> {
        &self.local
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr()
    }

    /// Address this peer advertises (`host:port`).
    pub fn address(&self) -> &str {
        &self.local.details().address
    }

    /// Stop the listener and close outgoing connections.
    pub async fn shutdown(self) {
        self.listener.shutdown().await;
        if let Ok(remotes) = self.local.list_peers().await {
            for remote in remotes {
                remote.disconnect().await;
            }
        }
    }
}
