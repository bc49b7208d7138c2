//! Real hosts over TCP + TLS on loopback.

use std::path::Path;
use std::time::Duration;

use auth::{Claims, Permissions};
use ipnet::IpNet;
use network_shared::Payload;
use peer::error::FanoutFailure;
use peer::peer::RemoteState;
use peer::{Node, Peer, PeerConfig, PeerDetails, PeerError, PeersManifest, Subscription};
use peer::{receiver_fn, unit_fn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

fn config(dir: &Path) -> PeerConfig {
    let mut cfg = PeerConfig::default();
    cfg.base_dir = dir.to_path_buf();
    cfg.service.port = 0;
    cfg.security.accept_invalid_certs = true;
    cfg.storage.subscriptions_path = None;
    cfg
}

/// Token `node` accepts from loopback callers.
fn token_for(node: &Node) -> String {
    let loopback: IpNet = "127.0.0.0/8".parse().unwrap();
    node.local()
        .issue_token(Claims::new(loopback, Permissions::ALL, time::Duration::hours(1)))
        .unwrap()
        .to_string()
}

/// A host with an `inbox` receiver whose deliveries show up on the channel.
async fn subscriber(dir: &Path) -> (Node, mpsc::UnboundedReceiver<Payload>) {
    subscriber_with(config(dir)).await
}

async fn subscriber_with(cfg: PeerConfig) -> (Node, mpsc::UnboundedReceiver<Payload>) {
    let node = Node::start(cfg).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    node.local()
        .register_receiver(
            "inbox",
            receiver_fn(move |data| {
                let tx = tx.clone();
                async move {
                    tx.send(data)?;
                    anyhow::Ok(())
                }
            }),
        )
        .await
        .unwrap();
    node.local()
        .register_action(
            "double",
            unit_fn(|arg: Payload| async move {
                let n: i64 = arg.decode()?;
                anyhow::Ok(Payload::encode(&(n * 2))?)
            }),
        )
        .await
        .unwrap();
    (node, rx)
}

async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Payload {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no delivery")
        .expect("channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_reaches_live_subscribers_and_reports_dead_ones() {
    let (dir_a, dir_b, dir_p) = (
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    );
    let (a, mut inbox_a) = subscriber(dir_a.path()).await;
    let (b, mut inbox_b) = subscriber(dir_b.path()).await;
    let dead = dead_address().await;

    let manifest = PeersManifest {
        peers: vec![
            PeerDetails::new(a.address(), token_for(&a)),
            PeerDetails::new(b.address(), token_for(&b)),
            PeerDetails::new(dead.clone(), token_for(&a)),
        ],
    };
    std::fs::write(
        dir_p.path().join("peers.toml"),
        toml::to_string(&manifest).unwrap(),
    )
    .unwrap();

    let p = Node::start(config(dir_p.path())).await.unwrap();
    let publisher = p.local();
    publisher
        .register_action("test", unit_fn(|arg| async move { anyhow::Ok(arg) }))
        .await
        .unwrap();
    for address in [a.address(), b.address(), dead.as_str()] {
        publisher
            .subscribe(Subscription::new(address, "test", "inbox"))
            .await
            .unwrap();
    }

    match publisher.publish("test", Payload::from("x")).await {
        Err(PeerError::PartialPublish {
            action,
            total,
            failures,
        }) => {
            assert_eq!(action, "test");
            assert_eq!(total, 3);
            assert_eq!(failures.len(), 1);
            let FanoutFailure {
                address, receiver, ..
            } = &failures[0];
            assert_eq!(address, &dead);
            assert_eq!(receiver, "inbox");
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(recv(&mut inbox_a).await, Payload::from("x"));
    assert_eq!(recv(&mut inbox_b).await, Payload::from("x"));

    // A failed publish does not fail the run that produced the data.
    publisher
        .run_and_publish("test", Payload::from("y"))
        .await
        .unwrap();
    assert_eq!(recv(&mut inbox_a).await, Payload::from("y"));
    assert_eq!(recv(&mut inbox_b).await, Payload::from("y"));

    p.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_calls_go_through_the_manifest() {
    let (dir_a, dir_p) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let (a, mut inbox_a) = subscriber(dir_a.path()).await;

    let manifest = PeersManifest {
        peers: vec![PeerDetails::new(a.address(), token_for(&a))],
    };
    std::fs::write(
        dir_p.path().join("peers.toml"),
        toml::to_string(&manifest).unwrap(),
    )
    .unwrap();
    let p = Node::start(config(dir_p.path())).await.unwrap();

    let remote = p.local().get_peer(a.address()).await.unwrap();
    assert_eq!(remote.state(), RemoteState::Disconnected);

    let out = remote.run("double", Payload::encode(&21).unwrap()).await.unwrap();
    assert_eq!(out.decode::<i64>().unwrap(), 42);
    assert_eq!(remote.state(), RemoteState::Ready);

    assert_eq!(remote.list_actions().await.unwrap(), ["double"]);
    assert_eq!(remote.list_receivers().await.unwrap(), ["inbox"]);
    assert!(remote.has_receiver("inbox").await.unwrap());

    remote.notify("inbox", Payload::from("direct")).await.unwrap();
    assert_eq!(recv(&mut inbox_a).await, Payload::from("direct"));

    // Subscriptions created remotely land in the remote's store.
    remote
        .subscribe(Subscription::new("127.0.0.1:1", "double", "inbox"))
        .await
        .unwrap();
    let stored = a.local().subscription_store().list().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].subscription.action, "double");

    // Dropped connections are re-dialed on the next call.
    remote.disconnect().await;
    assert_eq!(remote.state(), RemoteState::Disconnected);
    let out = remote.run("double", Payload::encode(&2).unwrap()).await.unwrap();
    assert_eq!(out.decode::<i64>().unwrap(), 4);

    p.shutdown().await;
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_dropped_by_the_remote_is_redialed() {
    let (dir_a, dir_p) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    // `a` hangs up on connections that stay quiet for a moment.
    let mut cfg_a = config(dir_a.path());
    cfg_a.connection.idle_timeout_ms = 200;
    let (a, _inbox) = subscriber_with(cfg_a).await;

    let manifest = PeersManifest {
        peers: vec![PeerDetails::new(a.address(), token_for(&a))],
    };
    std::fs::write(
        dir_p.path().join("peers.toml"),
        toml::to_string(&manifest).unwrap(),
    )
    .unwrap();
    let p = Node::start(config(dir_p.path())).await.unwrap();
    let remote = p.local().get_peer(a.address()).await.unwrap();

    let out = remote.run("double", Payload::encode(&5).unwrap()).await.unwrap();
    assert_eq!(out.decode::<i64>().unwrap(), 10);
    assert_eq!(remote.state(), RemoteState::Ready);

    tokio::time::timeout(Duration::from_secs(3), async {
        while remote.state() != RemoteState::Disconnected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("remote hang-up was not noticed");

    let out = remote.run("double", Payload::encode(&7).unwrap()).await.unwrap();
    assert_eq!(out.decode::<i64>().unwrap(), 14);
    assert_eq!(remote.state(), RemoteState::Ready);

    p.shutdown().await;
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dial_only_peer_does_not_take_the_port() {
    let (dir_a, dir_c) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let (a, _inbox) = subscriber(dir_a.path()).await;

    let manifest = PeersManifest {
        peers: vec![PeerDetails::new(a.address(), token_for(&a))],
    };
    std::fs::write(
        dir_c.path().join("peers.toml"),
        toml::to_string(&manifest).unwrap(),
    )
    .unwrap();
    // Same port as the running host; binding it would fail.
    let mut cfg = config(dir_c.path());
    cfg.service.port = a.local_addr().port();

    let caller = peer::node::dial_only(&cfg).await.unwrap();
    let remote = caller.get_peer(a.address()).await.unwrap();
    let out = remote.run("double", Payload::encode(&8).unwrap()).await.unwrap();
    assert_eq!(out.decode::<i64>().unwrap(), 16);

    remote.disconnect().await;
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_with_bad_token_fails_to_dial() {
    let (dir_a, dir_p) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let (a, _inbox) = subscriber(dir_a.path()).await;
    let manifest = PeersManifest {
        peers: vec![PeerDetails::new(a.address(), "not.a-token")],
    };
    std::fs::write(
        dir_p.path().join("peers.toml"),
        toml::to_string(&manifest).unwrap(),
    )
    .unwrap();
    let p = Node::start(config(dir_p.path())).await.unwrap();

    let remote = p.local().get_peer(a.address()).await.unwrap();
    let err = remote.run("double", Payload::encode(&1).unwrap()).await.unwrap_err();
    assert!(
        matches!(
            err,
            PeerError::Connection(peer::ConnectionError::Unauthenticated(_))
        ),
        "{err}"
    );
    assert_eq!(remote.state(), RemoteState::Disconnected);

    p.shutdown().await;
    a.shutdown().await;
}
