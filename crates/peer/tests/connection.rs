use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use auth::{AuthService, Claims, Permissions, SecretKey};
use futures::future::join_all;
use ipnet::IpNet;
use network_shared::messaging::{DEFAULT_MAX_FRAME_SIZE, envelope_pair};
use network_shared::protocol::{Authenticate, ListUnits, PROTOCOL_VERSION, PerformAction};
use network_shared::{ActionMode, Packet, Payload, UnitKind};
use peer::connection::AuthState;
use peer::{Connection, ConnectionError, ConnectionSettings, LocalPeer, Peer, PeerDetails, unit_fn};
use tokio::io::{AsyncWriteExt, duplex};

const CLIENT_ADDR: &str = "127.0.0.1:50000";
const SERVER_ADDR: &str = "127.0.0.1:5243";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        request_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(5),
        ..ConnectionSettings::default()
    }
}

fn auth() -> Arc<AuthService> {
    Arc::new(AuthService::new(&SecretKey::generate().unwrap()))
}

async fn server_peer(auth: Arc<AuthService>) -> Arc<LocalPeer> {
    let local = LocalPeer::builder(PeerDetails::local(SERVER_ADDR), auth).build();
    local
        .register_action(
            "test",
            unit_fn(|arg: Payload| async move {
                let name: String = arg.decode()?;
                anyhow::Ok(Payload::from(format!("Hello, {name}!")))
            }),
        )
        .await
        .unwrap();
    local
        .register_action(
            "echo",
            unit_fn(|arg: Payload| async move {
                let n: u64 = arg.decode()?;
                tokio::time::sleep(Duration::from_millis(n % 7)).await;
                anyhow::Ok(arg)
            }),
        )
        .await
        .unwrap();
    local
        .register_action(
            "slow",
            unit_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                anyhow::Ok(Payload::from("late"))
            }),
        )
        .await
        .unwrap();
    local
}

fn dev_token(auth: &AuthService) -> String {
    auth.issue_dev_token().unwrap().to_string()
}

/// Returns (initiator, acceptor) over an in-memory stream.
async fn connect(
    local: &Arc<LocalPeer>,
    token: &str,
) -> Result<(Connection, Connection), ConnectionError> {
    let (a, b) = duplex(64 * 1024);
    let server = Connection::accept(b, addr(CLIENT_ADDR), Arc::downgrade(local), settings());
    let client = Connection::initiate(a, addr(SERVER_ADDR), token, Weak::new(), settings()).await?;
    Ok((client, server))
}

fn perform(action: &str, arg: Payload) -> Packet {
    Packet::PerformAction(PerformAction {
        action: action.into(),
        arg,
        mode: ActionMode::Perform,
    })
}

fn response_data(packet: Packet) -> Payload {
    match packet {
        Packet::ActionResponse(r) => r.data,
        other => panic!("expected ActionResponse, got {other:?}"),
    }
}

#[tokio::test]
async fn hello_world_over_authenticated_connection() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let (client, server) = connect(&local, &dev_token(&auth)).await.unwrap();

    assert_eq!(client.permissions(), Some(Permissions::ALL));
    assert_eq!(server.permissions(), Some(Permissions::ALL));

    let out = client
        .request(perform("test", Payload::from("World")))
        .await
        .unwrap();
    assert_eq!(response_data(out), Payload::from("Hello, World!"));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_correlated() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let (client, _server) = connect(&local, &dev_token(&auth)).await.unwrap();

    let calls = (0u64..50).map(|n| {
        let client = client.clone();
        async move {
            let out = client
                .request(perform("echo", Payload::encode(&n).unwrap()))
                .await
                .unwrap();
            (n, response_data(out).decode::<u64>().unwrap())
        }
    });
    for (sent, got) in join_all(calls).await {
        assert_eq!(sent, got);
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn timed_out_request_discards_late_response() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let (client, _server) = connect(&local, &dev_token(&auth)).await.unwrap();

    let err = client
        .request_with_timeout(perform("slow", Payload::null()), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout { .. }), "{err}");
    assert_eq!(client.pending_requests(), 0);

    // Let the late response arrive; it must not disturb later requests.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.is_connected());
    let out = client
        .request(perform("test", Payload::from("again")))
        .await
        .unwrap();
    assert_eq!(response_data(out), Payload::from("Hello, again!"));
}

#[tokio::test]
async fn request_times_out_while_the_write_is_stalled() {
    let auth = auth();
    let local = server_peer(auth).await;
    // The remote end never reads, so a large frame cannot be flushed.
    let (_remote, stream) = duplex(64);
    let conn = Connection::accept(stream, addr(CLIENT_ADDR), Arc::downgrade(&local), settings());

    let big = Payload::from("x".repeat(4096));
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        conn.request_with_timeout(perform("test", big), Duration::from_millis(50)),
    )
    .await
    .expect("request ignored its own timeout");
    assert!(
        matches!(result, Err(ConnectionError::Timeout { .. })),
        "{result:?}"
    );
    assert_eq!(conn.pending_requests(), 0);
}

#[tokio::test]
async fn foreign_token_is_refused() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let other = AuthService::new(&SecretKey::generate().unwrap());

    let err = connect(&local, &dev_token(&other)).await.unwrap_err();
    match err {
        ConnectionError::Unauthenticated(msg) => assert_eq!(msg, "authentication failed"),
        other => panic!("unexpected {other}"),
    }
}

#[tokio::test]
async fn token_from_wrong_network_is_refused() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let net: IpNet = "10.0.0.0/8".parse().unwrap();
    let token = auth
        .issue(Claims::new(net, Permissions::ALL, time::Duration::hours(1)))
        .unwrap()
        .to_string();

    assert!(matches!(
        connect(&local, &token).await,
        Err(ConnectionError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn missing_permission_is_reported_as_remote_error() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let net: IpNet = "127.0.0.0/8".parse().unwrap();
    let token = auth
        .issue(Claims::new(net, Permissions::READ_ACTIONS, time::Duration::hours(1)))
        .unwrap()
        .to_string();
    let (client, _server) = connect(&local, &token).await.unwrap();
    assert_eq!(client.permissions(), Some(Permissions::READ_ACTIONS));

    let err = client
        .request(perform("test", Payload::from("x")))
        .await
        .unwrap_err();
    match err {
        ConnectionError::Remote(msg) => assert!(msg.contains("permission denied"), "{msg}"),
        other => panic!("unexpected {other}"),
    }

    // Listing is covered by the granted mask.
    match client
        .request(Packet::ListUnits(ListUnits {
            kind: UnitKind::Action,
        }))
        .await
        .unwrap()
    {
        Packet::ListUnitsResponse(r) => assert_eq!(r.values, ["test", "echo", "slow"]),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn unknown_action_is_reported_as_remote_error() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let (client, _server) = connect(&local, &dev_token(&auth)).await.unwrap();

    let err = client
        .request(perform("missing", Payload::null()))
        .await
        .unwrap_err();
    match err {
        ConnectionError::Remote(msg) => assert!(msg.contains("not found"), "{msg}"),
        other => panic!("unexpected {other}"),
    }
    assert!(client.is_connected());
}

/// Sends `ListUnits` and then `Authenticate` from a hand-driven client and
/// returns both responses keyed by the request they answer.
async fn list_before_authenticate(token: String) -> (HashMap<u64, Packet>, u64, u64) {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let token = if token.is_empty() { dev_token(&auth) } else { token };

    let (client, server) = duplex(64 * 1024);
    let _conn = Connection::accept(server, addr(CLIENT_ADDR), Arc::downgrade(&local), settings());
    let (r, w) = tokio::io::split(client);
    let (mut reader, mut writer) = envelope_pair(r, w, DEFAULT_MAX_FRAME_SIZE);

    let list_id = writer
        .write(
            0,
            Packet::ListUnits(ListUnits {
                kind: UnitKind::Action,
            }),
        )
        .await
        .unwrap();
    let auth_id = writer
        .write(0, Packet::Authenticate(Authenticate::new(token)))
        .await
        .unwrap();

    let mut responses = HashMap::new();
    for _ in 0..2 {
        let envelope = tokio::time::timeout(Duration::from_secs(2), reader.read())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        responses.insert(envelope.responding_to, envelope.payload);
    }
    (responses, list_id, auth_id)
}

#[tokio::test]
async fn requests_wait_for_authentication() {
    let (responses, list_id, auth_id) = list_before_authenticate(String::new()).await;
    assert!(matches!(
        &responses[&auth_id],
        Packet::AuthenticateResponse(r) if r.granted
    ));
    match &responses[&list_id] {
        Packet::ListUnitsResponse(r) => assert_eq!(r.values, ["test", "echo", "slow"]),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn requests_after_refused_authentication_are_invalid() {
    let (responses, list_id, auth_id) = list_before_authenticate("garbage".into()).await;
    match &responses[&auth_id] {
        Packet::AuthenticateResponse(r) => {
            assert!(!r.granted);
            assert_eq!(r.error.as_deref(), Some("authentication failed"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(&responses[&list_id], Packet::AuthenticateInvalid(_)));
}

/// Authenticates with each token in turn, then asks for the action list.
/// Returns whether each handshake was granted and the final reply.
async fn authenticate_in_turn(tokens: &[&str]) -> (Vec<bool>, Packet, AuthState) {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let valid = dev_token(&auth);

    let (client, server) = duplex(64 * 1024);
    let conn = Connection::accept(server, addr(CLIENT_ADDR), Arc::downgrade(&local), settings());
    let (r, w) = tokio::io::split(client);
    let (mut reader, mut writer) = envelope_pair(r, w, DEFAULT_MAX_FRAME_SIZE);

    let mut granted = Vec::new();
    for token in tokens {
        let token = if token.is_empty() { valid.clone() } else { token.to_string() };
        let id = writer
            .write(0, Packet::Authenticate(Authenticate::new(token)))
            .await
            .unwrap();
        let reply = reader.read().await.unwrap().unwrap();
        assert_eq!(reply.responding_to, id);
        match reply.payload {
            Packet::AuthenticateResponse(r) => granted.push(r.granted),
            other => panic!("unexpected {other:?}"),
        }
    }

    let list_id = writer
        .write(
            0,
            Packet::ListUnits(ListUnits {
                kind: UnitKind::Action,
            }),
        )
        .await
        .unwrap();
    let reply = reader.read().await.unwrap().unwrap();
    assert_eq!(reply.responding_to, list_id);
    (granted, reply.payload, conn.auth_state())
}

#[tokio::test]
async fn repeated_authenticate_cannot_revoke_a_grant() {
    let (granted, reply, state) = authenticate_in_turn(&["", "garbage"]).await;
    assert_eq!(granted, [true, false]);
    assert!(matches!(reply, Packet::ListUnitsResponse(_)), "{reply:?}");
    assert!(matches!(state, AuthState::Granted(_)));
}

#[tokio::test]
async fn refused_connection_stays_refused() {
    let (granted, reply, state) = authenticate_in_turn(&["garbage", ""]).await;
    assert_eq!(granted, [false, false]);
    assert!(matches!(reply, Packet::AuthenticateInvalid(_)), "{reply:?}");
    assert_eq!(state, AuthState::Denied);
}

#[tokio::test]
async fn other_protocol_version_is_refused() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let (client, server) = duplex(64 * 1024);
    let conn = Connection::accept(server, addr(CLIENT_ADDR), Arc::downgrade(&local), settings());
    let (r, w) = tokio::io::split(client);
    let (mut reader, mut writer) = envelope_pair(r, w, DEFAULT_MAX_FRAME_SIZE);

    let handshake = Authenticate {
        version: PROTOCOL_VERSION + 1,
        ..Authenticate::new(dev_token(&auth))
    };
    writer
        .write(0, Packet::Authenticate(handshake))
        .await
        .unwrap();
    let reply = reader.read().await.unwrap().unwrap();
    assert!(matches!(reply.payload, Packet::AuthenticateResponse(r) if !r.granted));
    assert_eq!(conn.auth_state(), AuthState::Denied);
}

#[tokio::test]
async fn undecodable_frame_is_skipped() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;

    let (client, server) = duplex(64 * 1024);
    let conn = Connection::accept(server, addr(CLIENT_ADDR), Arc::downgrade(&local), settings());
    let (r, mut w) = tokio::io::split(client);
    // Valid length prefix, truncated envelope.
    w.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();
    let (mut reader, mut writer) = envelope_pair(r, w, DEFAULT_MAX_FRAME_SIZE);

    let auth_id = writer
        .write(
            0,
            Packet::Authenticate(Authenticate::new(dev_token(&auth))),
        )
        .await
        .unwrap();
    let reply = reader.read().await.unwrap().unwrap();
    assert_eq!(reply.responding_to, auth_id);
    assert!(matches!(reply.payload, Packet::AuthenticateResponse(r) if r.granted));
    assert!(conn.is_connected());
    assert!(matches!(conn.auth_state(), AuthState::Granted(_)));
}

#[tokio::test]
async fn silent_remote_hits_idle_timeout() {
    let auth = auth();
    let local = server_peer(auth).await;
    let (_client, server) = duplex(1024);
    let conn = Connection::accept(
        server,
        addr(CLIENT_ADDR),
        Arc::downgrade(&local),
        ConnectionSettings {
            idle_timeout: Duration::from_millis(100),
            ..settings()
        },
    );

    tokio::time::timeout(Duration::from_secs(2), conn.closed())
        .await
        .expect("idle connection was not closed");
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn closing_fails_pending_requests() {
    let auth = auth();
    let local = server_peer(Arc::clone(&auth)).await;
    let (client, server) = connect(&local, &dev_token(&auth)).await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request(perform("slow", Payload::null())).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectionError::Closed), "{err}");
    tokio::time::timeout(Duration::from_secs(1), client.closed())
        .await
        .unwrap();
    assert!(matches!(
        client.send(Packet::Empty).await,
        Err(ConnectionError::NotConnected)
    ));
}
