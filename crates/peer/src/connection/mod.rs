/*!
Connection Handler

Owns one established byte stream (TLS in production, any `AsyncRead +
AsyncWrite` in tests) and multiplexes concurrent requests and responses over it.

Tasks per connection:
- output loop: the only writer. Drains a bounded queue in send order, assigns
  envelope IDs and registers correlation entries before the bytes hit the wire.
  A full queue blocks senders (backpressure).
- input loop: the only reader. Resolves responses against the correlation
  table inline; every other envelope is dispatched to its own task so a slow
  handler never stalls reading.
- one dispatch task per inbound request.

Roles:
- Acceptor: inbound packets other than `Authenticate` wait on the [`AuthGate`]
  until the handshake resolved; a refused handshake answers them with
  `AuthenticateInvalid`. Permissions of the granted token gate each handler.
- Initiator: treated as authenticated for its own traffic; `initiate` runs the
  handshake and only returns once the remote granted (or refused) the token.

Liveness: every read must complete within `idle_timeout`; expiry, EOF, or a
read error closes the connection. Undecodable frames are logged and skipped.
When either loop ends the connection is marked "not connected", pending
callers fail with [`ConnectionError::Closed`], and the other loop stops.

Logging targets:
- peer::net::connection (lifecycle)
- peer::net::handshake  (authentication)
- peer::net::packets    (per-envelope trace when `log_packets` is set)
*/

mod gate;
mod pending;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use auth::{AuthError, Permissions};
use network_shared::ids::ConnectionId;
use network_shared::messaging::{CodecError, DEFAULT_MAX_FRAME_SIZE, EnvelopeReader, EnvelopeWriter};
use network_shared::protocol::{Authenticate, AuthenticateInvalid};
use network_shared::{Envelope, Packet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use gate::{AuthGate, AuthState};
use pending::PendingRequests;

use crate::error::ConnectionError;
use crate::handler::{HandlerContext, PacketHandler};
use crate::peer::LocalPeer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Initiator => "initiator",
            Role::Acceptor => "acceptor",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub output_queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub log_packets: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            output_queue_capacity: 100,
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
            log_packets: false,
        }
    }
}

struct Outbound {
    responding_to: u64,
    packet: Packet,
    /// Registered under the assigned id before the write.
    awaiting: Option<oneshot::Sender<Packet>>,
    written: Option<oneshot::Sender<Result<u64, ConnectionError>>>,
}

struct Shared {
    id: ConnectionId,
    role: Role,
    remote_addr: SocketAddr,
    settings: ConnectionSettings,
    outbound: mpsc::Sender<Outbound>,
    pending: PendingRequests,
    gate: AuthGate,
    /// What the remote granted us (initiator only).
    granted: OnceLock<Permissions>,
    connected: AtomicBool,
    shutdown: CancellationToken,
    local: Weak<LocalPeer>,
}

impl Shared {
    fn mark_closed(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(
                target: "peer::net::connection",
                "{} ({}, {}) closed: {reason}", self.id, self.role, self.remote_addr
            );
        }
        self.shutdown.cancel();
        self.pending.clear();
        self.gate.close();
    }

    /// Queue a correlated reply. Failures only mean the connection is gone.
    async fn reply(&self, responding_to: u64, packet: Packet) {
        let op = Outbound {
            responding_to,
            packet,
            awaiting: None,
            written: None,
        };
        if self.outbound.send(op).await.is_err() {
            trace!(
                target: "peer::net::connection",
                "{} dropped reply to {responding_to}: output closed", self.id
            );
        }
    }
}

/// Handle to one live connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("remote_addr", &self.shared.remote_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Serve an inbound stream. Returns immediately; the handshake is driven
    /// by the remote's `Authenticate` packet.
    pub fn accept<S>(
        stream: S,
        remote_addr: SocketAddr,
        local: Weak<LocalPeer>,
        settings: ConnectionSettings,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(stream, Role::Acceptor, remote_addr, local, settings)
    }

    /// Start a dialed stream and authenticate with `token`.
    pub async fn initiate<S>(
        stream: S,
        remote_addr: SocketAddr,
        token: &str,
        local: Weak<LocalPeer>,
        settings: ConnectionSettings,
    ) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Self::spawn(stream, Role::Initiator, remote_addr, local, settings);
        let handshake = Packet::Authenticate(Authenticate::new(token));

        let result = match conn.request(handshake).await {
            Ok(Packet::AuthenticateResponse(r)) if r.granted => {
                let permitted = Permissions::from_bits_truncate(r.permitted);
                let _ = conn.shared.granted.set(permitted);
                info!(
                    target: "peer::net::handshake",
                    "{} authenticated to {remote_addr}, granted {permitted}", conn.shared.id
                );
                return Ok(conn);
            }
            Ok(Packet::AuthenticateResponse(r)) => Err(ConnectionError::Unauthenticated(
                r.error.unwrap_or_else(|| AuthError::OPAQUE.to_string()),
            )),
            Ok(other) => Err(ConnectionError::UnexpectedResponse {
                expected: "AuthenticateResponse",
                got: other.kind(),
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(
                target: "peer::net::handshake",
                "{} handshake with {remote_addr} failed: {e}", conn.shared.id
            );
        }
        conn.close();
        result
    }

    fn spawn<S>(
        stream: S,
        role: Role,
        remote_addr: SocketAddr,
        local: Weak<LocalPeer>,
        settings: ConnectionSettings,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = EnvelopeReader::new(read_half, settings.max_frame_bytes);
        let writer = EnvelopeWriter::new(write_half, settings.max_frame_bytes);
        let (tx, rx) = mpsc::channel(settings.output_queue_capacity.max(1));

        let shared = Arc::new(Shared {
            id: ConnectionId::next(),
            role,
            remote_addr,
            settings,
            outbound: tx,
            pending: PendingRequests::default(),
            gate: AuthGate::new(),
            granted: OnceLock::new(),
            connected: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            local,
        });

        debug!(
            target: "peer::net::connection",
            "{} ({role}) opened with {remote_addr}", shared.id
        );

        tokio::spawn(output_loop(Arc::clone(&shared), writer, rx));
        tokio::spawn(input_loop(Arc::clone(&shared), reader));

        Self { shared }
    }

    /// Send `packet` and wait for the correlated response using the default
    /// request timeout.
    pub async fn request(&self, packet: Packet) -> Result<Packet, ConnectionError> {
        self.request_with_timeout(packet, self.shared.settings.request_timeout)
            .await
    }

    /// The deadline covers queueing and writing as well as the wait for the
    /// response, so a stalled writer still ends in [`ConnectionError::Timeout`].
    pub async fn request_with_timeout(
        &self,
        packet: Packet,
        timeout: Duration,
    ) -> Result<Packet, ConnectionError> {
        let kind = packet.kind();
        let (tx, rx) = oneshot::channel();
        let mut assigned = None;
        let exchange = async {
            let id = self.enqueue(packet, Some(tx)).await?;
            assigned = Some(id);
            rx.await.map_err(|_| ConnectionError::Closed)
        };
        let outcome = tokio::time::timeout(timeout, exchange).await;

        match outcome {
            Ok(Ok(Packet::AuthenticateInvalid(invalid))) => {
                Err(ConnectionError::Unauthenticated(invalid.error))
            }
            Ok(Ok(Packet::Failure(failure))) => Err(ConnectionError::Remote(failure.message)),
            Ok(result) => result,
            Err(_) => {
                // The receiver is gone with `exchange`; drop its table entry.
                self.shared.pending.prune_abandoned();
                match assigned {
                    Some(id) => debug!(
                        target: "peer::net::connection",
                        "{} request {id} ({kind}) timed out after {timeout:?}", self.shared.id
                    ),
                    None => debug!(
                        target: "peer::net::connection",
                        "{} {kind} not written within {timeout:?}", self.shared.id
                    ),
                }
                Err(ConnectionError::Timeout {
                    packet: kind,
                    after: timeout,
                })
            }
        }
    }

    /// Fire-and-forget. Resolves once the envelope was written; returns its id.
    pub async fn send(&self, packet: Packet) -> Result<u64, ConnectionError> {
        self.enqueue(packet, None).await
    }

    async fn enqueue(
        &self,
        packet: Packet,
        awaiting: Option<oneshot::Sender<Packet>>,
    ) -> Result<u64, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let (written_tx, written_rx) = oneshot::channel();
        let op = Outbound {
            responding_to: Envelope::NOT_A_RESPONSE,
            packet,
            awaiting,
            written: Some(written_tx),
        };
        self.shared
            .outbound
            .send(op)
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        written_rx.await.map_err(|_| ConnectionError::Closed)?
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Resolves when the connection has closed for any reason.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }

    pub fn close(&self) {
        self.shared.mark_closed("closed locally");
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Initiator: permissions the remote granted during the handshake.
    /// Acceptor: permissions of the token the remote presented, once granted.
    pub fn permissions(&self) -> Option<Permissions> {
        match self.shared.role {
            Role::Initiator => self.shared.granted.get().copied(),
            Role::Acceptor => match self.shared.gate.current() {
                AuthState::Granted(grant) => Some(grant.permitted),
                _ => None,
            },
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.shared.gate.current()
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

fn log_packet(shared: &Shared, direction: &str, envelope: &Envelope) {
    if shared.settings.log_packets {
        info!(
            target: "peer::net::packets",
            "{} {direction} id={} re={} {}",
            shared.id, envelope.id, envelope.responding_to, envelope.payload
        );
    }
}

async fn output_loop<W>(
    shared: Arc<Shared>,
    mut writer: EnvelopeWriter<W>,
    mut rx: mpsc::Receiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    let reason = loop {
        let op = tokio::select! {
            _ = shared.shutdown.cancelled() => break "shutdown",
            op = rx.recv() => match op {
                Some(op) => op,
                None => break "output channel closed",
            },
        };

        let id = writer.assign_id();
        if let Some(waiter) = op.awaiting {
            if !shared.pending.insert(id, waiter) {
                trace!(
                    target: "peer::net::connection",
                    "{} skipping {}: caller gave up", shared.id, op.packet.kind()
                );
                continue;
            }
        }
        let envelope = Envelope::new(id, op.responding_to, op.packet);
        log_packet(&shared, "->", &envelope);

        match writer.write_envelope(&envelope).await {
            Ok(()) => {
                if let Some(written) = op.written {
                    let _ = written.send(Ok(id));
                }
            }
            Err(e) => {
                shared.pending.remove(id);
                let fatal = matches!(e, CodecError::Io(_));
                warn!(
                    target: "peer::net::connection",
                    "{} write of {} failed: {e}", shared.id, envelope.payload.kind()
                );
                if let Some(written) = op.written {
                    let _ = written.send(Err(ConnectionError::Write(e.to_string())));
                }
                if fatal {
                    break "write error";
                }
            }
        }
    };

    // Fail anyone still queued behind us.
    rx.close();
    let _ = writer.close().await;
    shared.mark_closed(reason);
}

async fn input_loop<R>(shared: Arc<Shared>, mut reader: EnvelopeReader<R>)
where
    R: AsyncRead + Unpin,
{
    let idle = shared.settings.idle_timeout;
    let reason = loop {
        let read = tokio::select! {
            _ = shared.shutdown.cancelled() => break "shutdown",
            read = tokio::time::timeout(idle, reader.read()) => read,
        };

        let envelope = match read {
            Err(_) => break "idle timeout",
            Ok(Ok(Some(envelope))) => envelope,
            Ok(Ok(None)) => break "eof",
            Ok(Err(e)) if e.is_recoverable() => {
                warn!(
                    target: "peer::net::connection",
                    "{} skipping malformed envelope: {e}", shared.id
                );
                continue;
            }
            Ok(Err(e)) => {
                debug!(target: "peer::net::connection", "{} read failed: {e}", shared.id);
                break "read error";
            }
        };
        log_packet(&shared, "<-", &envelope);

        let envelope = if envelope.is_response() {
            match shared.pending.resolve(envelope.responding_to, envelope.payload) {
                Ok(()) => continue,
                Err(payload) => Envelope::new(envelope.id, envelope.responding_to, payload),
            }
        } else {
            envelope
        };

        tokio::spawn(dispatch(Arc::clone(&shared), envelope));
    };

    shared.mark_closed(reason);
}

async fn dispatch(shared: Arc<Shared>, envelope: Envelope) {
    let Envelope {
        id,
        responding_to,
        payload,
    } = envelope;
    let kind = payload.kind();
    // A response nobody waits for any more (timed out, or answer to a `send`).
    let orphan = responding_to != Envelope::NOT_A_RESPONSE;

    let grant = if shared.role == Role::Acceptor && !orphan && !payload.is_authenticate() {
        match shared.gate.wait().await {
            Ok(grant) => Some(grant),
            Err(state) => {
                debug!(
                    target: "peer::net::handshake",
                    "{} refusing {kind} ({id}): {state:?}", shared.id
                );
                let invalid = Packet::AuthenticateInvalid(AuthenticateInvalid {
                    error: AuthError::OPAQUE.to_string(),
                });
                shared.reply(id, invalid).await;
                return;
            }
        }
    } else {
        None
    };

    let Some(local) = shared.local.upgrade() else {
        warn!(
            target: "peer::net::connection",
            "{} dropping {kind} ({id}): local peer is gone", shared.id
        );
        return;
    };

    let gate = (shared.role == Role::Acceptor).then(|| shared.gate.clone());
    let ctx = HandlerContext::new(local, shared.remote_addr, shared.role, grant, gate);

    match payload.handle(&ctx).await {
        Ok(Some(_)) | Err(_) if orphan => {}
        Ok(Some(response)) => shared.reply(id, response).await,
        Ok(None) => {}
        Err(e) => {
            debug!(
                target: "peer::net::connection",
                "{} handler for {kind} ({id}) failed: {e}", shared.id
            );
            shared.reply(id, Packet::failure(e.to_string())).await;
        }
    }
}
