use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::info;

use peer_pilot::config::{PollingConfig, SignalingConfig, TransferConfig};
use peer_pilot::model::client::Identity;
use peer_pilot::peer::PeerNode;
use peer_pilot::session::{
    ChatMessage, FileEvent, FileEventKind, FileModule, MessageEvent, MessageModule, ProfileEvent,
    ProfileModule, UserProfile,
};
use peer_pilot::signaling::{LocalBus, PollingServer, SignalingServer};
use peer_pilot::util::{init_log, random_id};

/// Peer-to-peer rooms: signaling service and peer node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one signaling instance
    Server {
        #[arg(long, default_value = "0.0.0.0:8788", env = "PEER_PILOT_BIND")]
        bind: SocketAddr,

        /// Collect window for room directory queries, in milliseconds
        #[arg(long, default_value_t = 1000)]
        list_clients_timeout_ms: u64,

        /// Race window for cross-instance relays, in milliseconds
        #[arg(long, default_value_t = 3000)]
        relay_timeout_ms: u64,
    },

    /// Run the HTTP polling fallback
    Polling {
        #[arg(long, default_value = "0.0.0.0:8789", env = "PEER_PILOT_POLLING_BIND")]
        bind: SocketAddr,

        /// Directory freshness window, in milliseconds
        #[arg(long, default_value_t = 6000)]
        client_ttl_ms: u64,
    },

    /// Join a room and connect to every peer in it
    Peer {
        #[arg(
            long,
            default_value = "ws://127.0.0.1:8788/api/websocket",
            env = "PEER_PILOT_SIGNALING_URL"
        )]
        signaling_url: String,

        #[arg(long, env = "PEER_PILOT_ROOM")]
        room: String,

        /// Client id, random when omitted
        #[arg(long, env = "PEER_PILOT_CLIENT_ID")]
        client_id: Option<String>,

        #[arg(long, env = "PEER_PILOT_SECRET")]
        secret: Option<String>,

        /// Display name announced to peers
        #[arg(long, default_value = "anonymous")]
        name: String,

        /// Message to broadcast once connected
        #[arg(long)]
        message: Option<String>,

        /// File to offer once connected
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long, default_value_t = 2)]
        channels: usize,

        #[arg(long, default_value_t = 65535)]
        chunk_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_log();
    let args = Args::parse();

    match args.command {
        Command::Server {
            bind,
            list_clients_timeout_ms,
            relay_timeout_ms,
        } => {
            let config = SignalingConfig {
                bind_addr: bind,
                list_clients_timeout: Duration::from_millis(list_clients_timeout_ms),
                relay_timeout: Duration::from_millis(relay_timeout_ms),
                ..Default::default()
            };
            let server = SignalingServer::new(config, Arc::new(LocalBus::new()));
            server.run().await.context("signaling server stopped")?;
        }
        Command::Polling { bind, client_ttl_ms } => {
            let config = PollingConfig {
                bind_addr: bind,
                client_ttl: Duration::from_millis(client_ttl_ms),
            };
            let server = PollingServer::new(config);
            tokio::task::spawn_blocking(move || server.run())
                .await
                .context("polling server thread panicked")?
                .context("polling server stopped")?;
        }
        Command::Peer {
            signaling_url,
            room,
            client_id,
            secret,
            name,
            message,
            file,
            channels,
            chunk_size,
        } => {
            let client_id = client_id.unwrap_or_else(|| random_id(8));
            let secret = secret.unwrap_or_else(|| random_id(16));
            let transfer = TransferConfig {
                channels_per_peer: channels,
                chunk_size,
                ..Default::default()
            };
            let identity = Identity::new(&room, &client_id, &secret);
            let node = PeerNode::join(&signaling_url, identity, SignalingConfig::default(), transfer)
                .await
                .context("joining the room")?;
            info!("Joined room {} as {}", room, client_id);

            run_peer(node, name, message, file).await?;
        }
    }

    Ok(())
}

async fn run_peer(
    node: Arc<PeerNode>,
    name: String,
    message: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let session = node.session().clone();
    let profiles = ProfileModule::new(session.clone(), UserProfile { name })?;
    let messages = MessageModule::new(session.clone())?;
    let files = FileModule::new(session)?;

    let _connected = profiles.events().on(ProfileEvent::PeerConnected, |client| {
        let name = client.profile.as_ref().map(|p| p.name.as_str()).unwrap_or("?");
        info!(
            "Peer {} ({}) connected, route {:?}",
            client.client_id, name, client.connection_type
        );
    });
    let _changed = profiles.events().on(ProfileEvent::PeerChanged, |client| {
        info!(
            "Peer {} is now {:?}, route {:?}",
            client.client_id, client.profile, client.connection_type
        );
    });
    let _received = messages
        .events()
        .on(MessageEvent::Received, |msg: &ChatMessage| {
            info!("[{}] {}", msg.source_client_id, msg.text);
        });
    let _files = files.events().on(FileEventKind::Received, |event: &FileEvent| {
        if let FileEvent::Received {
            filename,
            source_client_id,
            data,
        } = event
        {
            info!("Got {} ({} bytes) from {}", filename, data.len(), source_client_id);
        }
    });
    let _failed = files.events().on(FileEventKind::Failed, |event: &FileEvent| {
        if let FileEvent::Failed {
            filename, reason, ..
        } = event
        {
            info!("Transfer of {} failed: {}", filename, reason);
        }
    });

    let runner = {
        let node = node.clone();
        tokio::spawn(async move { node.run().await })
    };

    let clients = node
        .update_peer_connections()
        .await
        .context("listing the room")?;
    info!("Room has {} client(s)", clients.len());

    if let Some(text) = message {
        let sent = messages.send(&text).await?;
        info!("Message sent to {} peer(s)", sent);
    }
    if let Some(path) = file {
        let data = tokio::task::spawn_blocking({
            let path = path.clone();
            move || std::fs::read(path)
        })
        .await?
        .with_context(|| format!("reading {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let offered = files.send(&filename, Bytes::from(data), None, None).await?;
        info!("Offered {} to {} peer(s)", filename, offered);
    }

    tokio::select! {
        result = runner => result??,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    node.close();
    Ok(())
}
