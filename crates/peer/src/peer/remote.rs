use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use network_shared::protocol::{ListUnits, Notify, PerformAction, Subscribe};
use network_shared::{ActionMode, Packet, Payload, UnitKind};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::Peer;
use super::local::LocalPeer;
use crate::connection::{Connection, ConnectionSettings};
use crate::error::PeerError;
use crate::manifest::PeerDetails;
use crate::subscription::Subscription;
use crate::unit::Unit;

/// How remote peers are dialed. Shared by every [`RemotePeer`] of a host.
#[derive(Clone)]
pub struct RemoteTransport {
    pub settings: ConnectionSettings,
    /// `None` dials plain TCP. Only meant for tests and trusted networks.
    pub tls: Option<TlsConnector>,
    pub dial_timeout: Duration,
}

impl Default for RemoteTransport {
    fn default() -> Self {
        Self {
            settings: ConnectionSettings::default(),
            tls: None,
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for RemoteTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTransport")
            .field("settings", &self.settings)
            .field("tls", &self.tls.is_some())
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Disconnected,
    Dialing,
    Handshaking,
    Ready,
}

/// What `state()` is derived from. `Ready` keeps the connection so a drop
/// on either side reads as `Disconnected` without anyone updating it.
enum Link {
    Disconnected,
    Dialing,
    Handshaking,
    Ready(Connection),
}

/// Proxy for a peer listed in the manifest. The connection is dialed on the
/// first call and re-dialed after it dropped.
pub struct RemotePeer {
    details: PeerDetails,
    local: Weak<LocalPeer>,
    transport: RemoteTransport,
    connection: tokio::sync::Mutex<Option<Connection>>,
    link: Mutex<Link>,
}

impl fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePeer")
            .field("id", &self.details.id)
            .field("address", &self.details.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Splits `host:port` / `[v6]:port` into the host part used for SNI.
fn host_of(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    host.trim_start_matches('[').trim_end_matches(']')
}

impl RemotePeer {
    pub(crate) fn new(details: PeerDetails, local: Weak<LocalPeer>, transport: RemoteTransport) -> Self {
        Self {
            details,
            local,
            transport,
            connection: tokio::sync::Mutex::new(None),
            link: Mutex::new(Link::Disconnected),
        }
    }

    pub fn state(&self) -> RemoteState {
        match &*self.link.lock().unwrap_or_else(PoisonError::into_inner) {
            Link::Ready(conn) if conn.is_connected() => RemoteState::Ready,
            Link::Ready(_) | Link::Disconnected => RemoteState::Disconnected,
            Link::Dialing => RemoteState::Dialing,
            Link::Handshaking => RemoteState::Handshaking,
        }
    }

    fn set_link(&self, link: Link) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = link;
    }

    /// Close the current connection, if any. The next call dials again.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close();
        }
        self.set_link(Link::Disconnected);
    }

    /// The live connection, dialing first when there is none.
    pub async fn connection(&self) -> Result<Connection, PeerError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
            debug!(
                target: "peer::net::dial",
                "connection {} to {} dropped, redialing", conn.id(), self.details.address
            );
        }
        *slot = None;

        match self.dial().await {
            Ok(conn) => {
                self.set_link(Link::Ready(conn.clone()));
                *slot = Some(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                self.set_link(Link::Disconnected);
                warn!(target: "peer::net::dial", "{}: {e}", self.details.address);
                Err(e)
            }
        }
    }

    async fn dial(&self) -> Result<Connection, PeerError> {
        let address = self.details.address.as_str();
        let dial_err = |reason: String| PeerError::Dial {
            address: address.to_string(),
            reason,
        };
        if self.local.strong_count() == 0 {
            return Err(PeerError::LocalGone);
        }

        self.set_link(Link::Dialing);
        let tcp = tokio::time::timeout(self.transport.dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| dial_err(format!("timed out after {:?}", self.transport.dial_timeout)))?
            .map_err(|e| dial_err(e.to_string()))?;
        tcp.set_nodelay(true).map_err(|e| dial_err(e.to_string()))?;
        let remote_addr = tcp.peer_addr().map_err(|e| dial_err(e.to_string()))?;

        self.set_link(Link::Handshaking);
        let settings = self.transport.settings.clone();
        let token = self.details.token.as_str();
        let local = self.local.clone();

        let conn = match &self.transport.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(host_of(address).to_string())
                    .map_err(|e| dial_err(format!("invalid server name: {e}")))?;
                let tls = tokio::time::timeout(
                    self.transport.dial_timeout,
                    connector.connect(server_name, tcp),
                )
                .await
                .map_err(|_| dial_err("tls handshake timed out".into()))?
                .map_err(|e| dial_err(format!("tls: {e}")))?;
                Connection::initiate(tls, remote_addr, token, local, settings).await?
            }
            None => Connection::initiate(tcp, remote_addr, token, local, settings).await?,
        };

        info!(
            target: "peer::net::dial",
            "{} connected to {} ({remote_addr})", conn.id(), self.details.id
        );
        Ok(conn)
    }

    async fn request(&self, packet: Packet) -> Result<Packet, PeerError> {
        let conn = self.connection().await?;
        Ok(conn.request(packet).await?)
    }

    async fn send(&self, packet: Packet) -> Result<(), PeerError> {
        let conn = self.connection().await?;
        conn.send(packet).await?;
        Ok(())
    }

    async fn list_units(&self, kind: UnitKind) -> Result<Vec<String>, PeerError> {
        match self.request(Packet::ListUnits(ListUnits { kind })).await? {
            Packet::ListUnitsResponse(r) => Ok(r.values),
            other => Err(PeerError::unexpected("ListUnitsResponse", &other)),
        }
    }

    fn perform(action: &str, arg: Payload, mode: ActionMode) -> Packet {
        Packet::PerformAction(PerformAction {
            action: action.to_string(),
            arg,
            mode,
        })
    }
}

#[async_trait]
impl Peer for RemotePeer {
    fn details(&self) -> &PeerDetails {
        &self.details
    }

    async fn run(&self, action: &str, arg: Payload) -> Result<Payload, PeerError> {
        match self.request(Self::perform(action, arg, ActionMode::Perform)).await? {
            Packet::ActionResponse(r) => Ok(r.data),
            other => Err(PeerError::unexpected("ActionResponse", &other)),
        }
    }

    async fn publish(&self, action: &str, data: Payload) -> Result<(), PeerError> {
        match self.request(Self::perform(action, data, ActionMode::Publish)).await? {
            Packet::Empty => Ok(()),
            other => Err(PeerError::unexpected("Empty", &other)),
        }
    }

    /// Fire-and-forget: returns once the request was written.
    async fn run_and_publish(&self, action: &str, arg: Payload) -> Result<(), PeerError> {
        self.send(Self::perform(action, arg, ActionMode::PerformAndPublish))
            .await
    }

    async fn list_actions(&self) -> Result<Vec<String>, PeerError> {
        self.list_units(UnitKind::Action).await
    }

    async fn register_action(&self, _name: &str, _unit: Arc<dyn Unit>) -> Result<(), PeerError> {
        Err(PeerError::RemoteMutation)
    }

    async fn list_receivers(&self) -> Result<Vec<String>, PeerError> {
        self.list_units(UnitKind::Receiver).await
    }

    async fn register_receiver(&self, _name: &str, _unit: Arc<dyn Unit>) -> Result<(), PeerError> {
        Err(PeerError::RemoteMutation)
    }

    async fn notify(&self, receiver: &str, data: Payload) -> Result<(), PeerError> {
        self.send(Packet::Notify(Notify {
            receiver: receiver.to_string(),
            data,
        }))
        .await
    }

    async fn get_peer(&self, _address: &str) -> Result<Arc<RemotePeer>, PeerError> {
        Err(PeerError::AccessDenied)
    }

    async fn list_peers(&self) -> Result<Vec<Arc<RemotePeer>>, PeerError> {
        Err(PeerError::AccessDenied)
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<(), PeerError> {
        let packet = Packet::Subscribe(Subscribe {
            address: subscription.address,
            action: subscription.action,
            receiver: subscription.receiver,
        });
        match self.request(packet).await? {
            Packet::Empty => Ok(()),
            other => Err(PeerError::unexpected("Empty", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_strips_port_and_brackets() {
        assert_eq!(host_of("127.0.0.1:5243"), "127.0.0.1");
        assert_eq!(host_of("[::1]:5243"), "::1");
        assert_eq!(host_of("peer.example"), "peer.example");
    }

    #[tokio::test]
    async fn dial_failure_leaves_peer_disconnected() {
        let transport = RemoteTransport {
            dial_timeout: Duration::from_millis(500),
            ..RemoteTransport::default()
        };
        // Nothing behind this Weak: dialing is refused before any I/O.
        let remote = RemotePeer::new(
            PeerDetails::new("127.0.0.1:1", "token"),
            Weak::new(),
            transport,
        );
        let err = remote.run("x", Payload::null()).await.unwrap_err();
        assert!(matches!(err, PeerError::LocalGone), "{err}");
        assert_eq!(remote.state(), RemoteState::Disconnected);
    }

    #[tokio::test]
    async fn remote_peers_refuse_registration_and_directory() {
        let remote = RemotePeer::new(
            PeerDetails::new("127.0.0.1:1", "token"),
            Weak::new(),
            RemoteTransport::default(),
        );
        let unit = crate::unit::unit_fn(|_| async { anyhow::Ok(Payload::null()) });
        assert!(matches!(
            remote.register_action("x", unit).await,
            Err(PeerError::RemoteMutation)
        ));
        assert!(matches!(remote.list_peers().await, Err(PeerError::AccessDenied)));
        assert!(matches!(
            remote.get_peer("10.0.0.1:1").await,
            Err(PeerError::AccessDenied)
        ));
    }
}
