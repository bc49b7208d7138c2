use std::path::PathBuf;

use anyhow::{Context, Result};
use auth::{AuthService, Claims, Permissions, SecretKey};
use clap::{Parser, Subcommand};
use ipnet::IpNet;
use network_shared::Payload;
use peer::{Node, Peer, PeerConfig, node, receiver_fn, unit_fn};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const MAX_TTL_DAYS: i64 = 3650;

#[derive(Parser)]
#[command(name = "peer")]
#[command(about = "Peer host for remote actions, receivers and subscriptions")]
struct Args {
    /// Peer configuration file
    #[arg(short, long, default_value = "peer.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the peer host until Ctrl+C.
    Serve,
    /// Sign a token with this host's secret for another peer to present.
    IssueToken {
        /// Source network the token is valid from, e.g. 10.0.0.0/24
        #[arg(long)]
        network: IpNet,
        /// `all` or a comma separated list such as `read-actions,perform-actions`
        #[arg(long, default_value = "all")]
        permissions: Permissions,
        /// Lifetime in days, at most ten years
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(i64).range(1..=MAX_TTL_DAYS))]
        ttl_days: i64,
    },
    /// Run an action on a peer from the manifest and print the result.
    /// Does not listen, so it works next to a running `serve`.
    Call {
        /// Address of the remote peer as listed in the manifest
        peer: String,
        action: String,
        /// JSON argument
        #[arg(default_value = "null")]
        arg: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let config = PeerConfig::load(&args.config)
        .with_context(|| format!("load config '{}'", args.config.display()))?;

    match args.command {
        Command::Serve => serve(config).await,
        Command::IssueToken {
            network,
            permissions,
            ttl_days,
        } => issue_token(&config, network, permissions, ttl_days),
        Command::Call { peer, action, arg } => call(config, &peer, &action, &arg).await,
    }
}

async fn serve(config: PeerConfig) -> Result<()> {
    let node = Node::start(config).await?;
    let local = node.local();

    local
        .register_action(
            "test",
            unit_fn(|arg: Payload| async move {
                let name: Option<String> = arg.decode()?;
                let greeting = format!("Hello, {}!", name.as_deref().unwrap_or("World"));
                anyhow::Ok(Payload::from(greeting))
            }),
        )
        .await?;
    local
        .register_receiver(
            "log",
            receiver_fn(|data: Payload| async move {
                info!(target: "peer::units", "log receiver: {data}");
                anyhow::Ok(())
            }),
        )
        .await?;

    info!(target: "peer::node", "live on {}, Ctrl+C to stop", node.address());
    tokio::signal::ctrl_c().await?;
    info!(target: "peer::node", "shutting down");
    node.shutdown().await;
    Ok(())
}

fn issue_token(
    config: &PeerConfig,
    network: IpNet,
    permissions: Permissions,
    ttl_days: i64,
) -> Result<()> {
    let secret = SecretKey::load_or_generate(&config.resolve(&config.security.secret_key_path)?)?;
    let token = AuthService::new(&secret).issue(Claims::new(
        network,
        permissions,
        time::Duration::days(ttl_days),
    ))?;
    println!("{token}");
    Ok(())
}

async fn call(config: PeerConfig, address: &str, action: &str, arg: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(arg).context("argument is not JSON")?;
    let local = node::dial_only(&config).await?;
    let remote = local.get_peer(address).await?;
    let result = remote.run(action, Payload::from(value)).await;
    remote.disconnect().await;
    println!("{}", result?);
    Ok(())
}
