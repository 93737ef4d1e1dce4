use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use meshlink::config::get_nsec_path;
use meshlink::rendezvous::SignalMessage;
use meshlink::{
    start_relay_server, Config, FidelityLevel, LocalIdentity, MeshNode, PeerDirectory,
    PeerIdentifier,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Peer-to-peer data channels over a rendezvous relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rendezvous relay
    Relay {
        /// Listen address (defaults to server.bind_address)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Show the local identity, creating it if needed
    Identity,
    /// Connect to the relay and exchange lines with a peer or a room
    Chat {
        /// Session identifier of the peer to connect to
        #[arg(long)]
        peer: Option<String>,
        /// Room to join
        #[arg(long)]
        room: Option<String>,
    },
    /// Follow a public key (npub or hex)
    Follow {
        key: String,
        #[arg(long)]
        alias: Option<String>,
    },
    /// Stop following a public key
    Unfollow { key: String },
    /// Block a public key
    Block { key: String },
    /// List followed and blocked keys
    Contacts,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshlink=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Relay { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.bind_address.clone());
            let addr: SocketAddr = addr.parse().context("Invalid relay bind address")?;
            let handle = start_relay_server(addr)
                .await
                .context("Failed to start relay")?;

            println!("Rendezvous relay listening on {}", handle.ws_url());
            println!("Stats: http://{}/api/stats", handle.addr);

            tokio::signal::ctrl_c().await?;
            println!("Shutting down relay");
            handle.shutdown();
        }
        Commands::Identity => {
            let (identity, created) = LocalIdentity::load_or_create(get_nsec_path())?;
            let npub = identity.npub()?;
            if created {
                println!("Identity: {} (new)", npub);
            } else {
                println!("Identity: {}", npub);
            }
            println!("Public key: {}", identity.public_key_hex());
            println!("Key file: {}", identity.path().display());
        }
        Commands::Chat { peer, room } => {
            run_chat(&config, peer.map(PeerIdentifier::from), room).await?;
        }
        Commands::Follow { key, alias } => {
            let mut directory = PeerDirectory::open(config.directory_path())?;
            directory.follow(&key, alias)?;
            println!("Following {}", key);
        }
        Commands::Unfollow { key } => {
            let mut directory = PeerDirectory::open(config.directory_path())?;
            if directory.unfollow(&key)? {
                println!("Unfollowed {}", key);
            } else {
                println!("Not following {}", key);
            }
        }
        Commands::Block { key } => {
            let mut directory = PeerDirectory::open(config.directory_path())?;
            directory.block(&key)?;
            println!("Blocked {}", key);
        }
        Commands::Contacts => {
            let directory = PeerDirectory::open(config.directory_path())?;
            if directory.is_empty() {
                println!("No contacts");
            } else {
                println!("Contacts ({}):", directory.len());
                for (key, entry) in directory.list() {
                    match &entry.alias {
                        Some(alias) => println!("  {} {} ({})", entry.relation, key, alias),
                        None => println!("  {} {}", entry.relation, key),
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_chat(config: &Config, peer: Option<PeerIdentifier>, room: Option<String>) -> Result<()> {
    let (identity, _) = LocalIdentity::load_or_create(get_nsec_path())?;
    let node = MeshNode::with_webrtc(
        config.rendezvous_config(Some(identity.public_key_hex())),
        config.transport_config(),
    );

    let session = node
        .session_id(Duration::from_millis(config.transport.connect_timeout_ms))
        .await
        .context("Relay did not assign a session id")?;
    println!("Session: {}", session);
    println!("Identity: {}", identity.npub()?);
    println!("Commands: /connect <id>, /fidelity <level>, /peers, /quit");

    let mut target = peer;
    if let Some(peer) = &target {
        node.connect_to(peer).await?;
    }
    if let Some(room) = &room {
        node.rendezvous().join(room)?;
    }

    // Presence and room traffic come straight from the relay
    let subscription = node.rendezvous().on(|msg| match msg {
        SignalMessage::Presence { id, joined, .. } => {
            println!("* {} {}", id, if *joined { "joined" } else { "left" });
        }
        SignalMessage::Relay {
            from: Some(from),
            payload,
            ..
        } => println!("[{}] {}", from.short(), payload),
        _ => {}
    });

    let mut status_rx = node.events().subscribe_peer_status();
    let mut message_rx = node.events().subscribe_messages();
    let mut fidelity_rx = node.events().subscribe_fidelity();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(status) = status_rx.recv() => {
                let state = if status.connected { "connected" } else { "disconnected" };
                println!("* {} {}", status.peer.short(), state);
            }
            Ok(msg) = message_rx.recv() => {
                println!("<{}> {}", msg.peer.short(), String::from_utf8_lossy(&msg.data));
            }
            Ok(level) = fidelity_rx.recv() => {
                println!("* fidelity {}", level);
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                } else if line == "/peers" {
                    for p in node.manager().peers().await {
                        println!("  {} {} ({})", p.peer, p.phase, p.direction);
                    }
                } else if let Some(id) = line.strip_prefix("/connect ") {
                    let peer = PeerIdentifier::from(id.trim());
                    node.connect_to(&peer).await?;
                    target = Some(peer);
                } else if let Some(level) = line.strip_prefix("/fidelity ") {
                    match level.trim().parse::<FidelityLevel>() {
                        Ok(level) => {
                            let current = node.set_fidelity(level).await;
                            println!("* fidelity {} (requested {})", current, level);
                        }
                        Err(e) => println!("! {}", e),
                    }
                } else if let Some(peer) = &target {
                    let route = node.send(peer, Bytes::from(line.to_string())).await?;
                    tracing::debug!("Sent via {:?}", route);
                } else if let Some(room) = &room {
                    node.rendezvous()
                        .relay(room, serde_json::Value::String(line.to_string()))?;
                } else {
                    println!("! no peer or room; use /connect <id>");
                }
            }
        }
    }

    subscription.unsubscribe();
    node.teardown().await;
    Ok(())
}
