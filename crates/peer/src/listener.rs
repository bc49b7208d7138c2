//! Accept loop for inbound peer connections.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionSettings};
use crate::peer::LocalPeer;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Running listener. Dropping it does not stop the loop; call [`Listener::shutdown`].
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    /// Spawn the accept loop on an already bound socket. `tls = None` serves
    /// plain TCP.
    pub fn serve(
        listener: TcpListener,
        tls: Option<Arc<ServerConfig>>,
        local: Arc<LocalPeer>,
        settings: ConnectionSettings,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let acceptor = tls.map(TlsAcceptor::from);

        info!(
            target: "peer::net::listener",
            "listening on {local_addr} ({})",
            if acceptor.is_some() { "tls" } else { "plain tcp" }
        );
        let task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            local,
            settings,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every connection accepted so far.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(target: "peer::net::listener", "accept loop ended abnormally: {e}");
        }
        info!(target: "peer::net::listener", "{} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    local: Arc<LocalPeer>,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) {
    loop {
        let (tcp, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(target: "peer::net::listener", "accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        debug!(target: "peer::net::listener", "inbound tcp from {addr}");

        tokio::spawn(serve_one(
            tcp,
            addr,
            acceptor.clone(),
            Arc::clone(&local),
            settings.clone(),
            shutdown.child_token(),
        ));
    }
}

async fn serve_one(
    tcp: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    local: Arc<LocalPeer>,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) {
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(target: "peer::net::listener", "{addr}: set_nodelay: {e}");
    }
    let local = Arc::downgrade(&local);

    let conn = match acceptor {
        Some(acceptor) => {
            let handshake = tokio::select! {
                _ = shutdown.cancelled() => return,
                r = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)) => r,
            };
            match handshake {
                Ok(Ok(tls)) => Connection::accept(tls, addr, local, settings),
                Ok(Err(e)) => {
                    warn!(target: "peer::net::tls", "{addr}: tls handshake failed: {e}");
                    return;
                }
                Err(_) => {
                    warn!(target: "peer::net::tls", "{addr}: tls handshake timed out");
                    return;
                }
            }
        }
        None => Connection::accept(tcp, addr, local, settings),
    };

    tokio::select! {
        _ = shutdown.cancelled() => conn.close(),
        _ = conn.closed() => {}
    }
}
