//! peerlink - Room-based P2P messaging from the terminal

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerlink::config::{clamp_max_nodes, NetworkConfig};
use peerlink::network::{
    decode_lan_code, encode_lan_code, generate_cloud_code, NetworkSession, SessionEvent,
    SessionStatus, SignalingMode, Topology,
};

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "Room-based P2P messaging with cloud and LAN signaling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true, env = "PEERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling broker URL, overrides the configuration
    #[arg(long, global = true, env = "PEERLINK_CLOUD_URL")]
    cloud_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a room
    Host {
        /// Use the LAN discovery server instead of the cloud broker
        #[arg(long)]
        local: bool,

        /// Port for the LAN discovery server (0 picks one)
        #[arg(short, long)]
        port: Option<u16>,

        /// Connect every pair of nodes directly
        #[arg(long)]
        mesh: bool,

        /// Room size including the host (2-8)
        #[arg(long)]
        max_nodes: Option<i64>,

        /// Do not forward messages between star members
        #[arg(long)]
        no_relay: bool,
    },

    /// Join a room by code
    Join {
        /// Room code (6-letter cloud code or LAN code)
        code: String,

        /// Expect a mesh room
        #[arg(long)]
        mesh: bool,

        /// Send a single message once connected and exit
        #[arg(short = 'm', long)]
        message: Option<String>,

        /// Seconds to wait for the room in non-interactive mode
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Room code utilities
    Code {
        #[command(subcommand)]
        action: CodeAction,
    },

    /// Configuration file utilities
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum CodeAction {
    /// Generate a cloud room code
    Generate,
    /// Encode an address as a LAN code
    Encode { ip: Ipv4Addr, port: u16 },
    /// Decode a LAN code
    Decode { code: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the configuration file path
    Path,
    /// Print the effective configuration
    Show,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "peerlink=debug" } else { "peerlink=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(NetworkConfig::default_path)
}

fn load_config(cli: &Cli) -> Result<NetworkConfig> {
    let mut config = match config_path(cli) {
        Some(path) if path.exists() => NetworkConfig::load(&path)?,
        _ => NetworkConfig::default(),
    };
    if let Some(url) = &cli.cloud_url {
        config.cloud.url.clone_from(url);
    }
    config.validate()?;
    Ok(config)
}

/// Parse typed input: JSON if it parses, a plain string otherwise
fn parse_payload(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn chat(text: &str) -> Value {
    json!({ "text": text })
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::RoomCreated(code) => println!("Room created. Share this code: {}", code),
        SessionEvent::PlayerJoined(id) => println!("+ {} joined", id),
        SessionEvent::PlayerLeft(id) => println!("- {} left", id),
        SessionEvent::MessageReceived { from, data } => match data.get("text").and_then(Value::as_str) {
            Some(text) => println!("[{}] {}", from, text),
            None => println!("[{}] {}", from, data),
        },
        SessionEvent::StateReceived { from, data } => println!("[{} state] {}", from, data),
        SessionEvent::ErrorOccurred(message) => println!("Error: {}", message),
        SessionEvent::StatusChanged(status) => info!("Status: {:?}", status),
    }
}

fn print_help() {
    println!("Type a message to broadcast it. Commands:");
    println!("  /state <json>       broadcast a state update");
    println!("  /to <peer> <text>   send to one peer");
    println!("  /peers              list connected nodes");
    println!("  /quit               leave and exit");
}

/// Run the interactive loop until the user quits or the session ends
async fn interactive(
    session: &NetworkSession,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();
    print_help();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if matches!(event, SessionEvent::StatusChanged(SessionStatus::Disconnected)) {
                    println!("Disconnected from room");
                    break;
                }
            }
            line_result = stdin_reader.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        if !handle_line(session, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    session.leave();
    session.flush().await;
    Ok(())
}

/// Apply one input line. Returns false to quit.
async fn handle_line(session: &NetworkSession, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/quit" => return false,
        "/help" => print_help(),
        "/peers" => {
            session.flush().await;
            let snapshot = session.snapshot();
            println!(
                "{} ({}{:?}) room {} - {}/{} nodes",
                snapshot.local_node_id,
                if snapshot.is_host { "host, " } else { "" },
                snapshot.topology,
                snapshot.room_code,
                snapshot.nodes.len() + 1,
                snapshot.max_nodes
            );
            for node in &snapshot.nodes {
                println!("  {}", node);
            }
        }
        "/state" => session.broadcast_state(parse_payload(rest.trim())),
        "/to" => match rest.trim().split_once(' ') {
            Some((peer, text)) => session.send_to(peer, chat(text.trim())),
            None => println!("Usage: /to <peer> <text>"),
        },
        _ if command.starts_with('/') => println!("Unknown command {}", command),
        _ => session.broadcast(chat(line)),
    }
    true
}

async fn run_host(
    mut config: NetworkConfig,
    local: bool,
    port: Option<u16>,
    mesh: bool,
    max_nodes: Option<i64>,
    no_relay: bool,
) -> Result<()> {
    if local {
        config.signaling_mode = SignalingMode::Local;
    }
    if let Some(port) = port {
        config.local.port = port;
    }
    if mesh {
        config.topology = Topology::Mesh;
    }
    if let Some(max_nodes) = max_nodes {
        config.max_nodes = clamp_max_nodes(max_nodes);
    }
    if no_relay {
        config.auto_relay = false;
    }

    info!(
        "Hosting {:?} room for up to {} nodes via {:?} signaling",
        config.topology, config.max_nodes, config.signaling_mode
    );
    let (session, mut events) = NetworkSession::with_tcp_transport(config);
    session.create_room();

    // The room exists once RoomCreated arrives
    loop {
        match events.recv().await {
            Some(event @ SessionEvent::RoomCreated(_)) => {
                print_event(&event);
                break;
            }
            Some(SessionEvent::ErrorOccurred(message)) => bail!("Failed to create room: {}", message),
            Some(event) => print_event(&event),
            None => bail!("Session ended"),
        }
    }

    interactive(&session, &mut events).await
}

async fn run_join(
    mut config: NetworkConfig,
    code: String,
    mesh: bool,
    message: Option<String>,
    timeout: u64,
) -> Result<()> {
    if mesh {
        config.topology = Topology::Mesh;
    }

    let (session, mut events) = NetworkSession::with_tcp_transport(config);
    session.join_room(&code);

    let joined = tokio::time::timeout(Duration::from_secs(timeout), async {
        loop {
            match events.recv().await {
                Some(SessionEvent::StatusChanged(SessionStatus::Connected)) => return Ok(()),
                Some(SessionEvent::ErrorOccurred(message)) => return Err(anyhow!(message)),
                Some(event) => print_event(&event),
                None => return Err(anyhow!("Session ended")),
            }
        }
    })
    .await;

    match joined {
        Ok(Ok(())) => println!("Joined room {} as {}", code, session.local_node_id()),
        Ok(Err(e)) => return Err(e).with_context(|| format!("Failed to join room {}", code)),
        Err(_) => {
            session.leave();
            bail!("Timed out joining room {}", code);
        }
    }

    match message {
        Some(text) => {
            session.broadcast(chat(&text));
            session.flush().await;
            // Give the channel a moment to drain before closing it
            tokio::time::sleep(Duration::from_millis(200)).await;
            session.leave();
            session.flush().await;
            Ok(())
        }
        None => interactive(&session, &mut events).await,
    }
}

fn run_code(action: &CodeAction) -> Result<()> {
    match action {
        CodeAction::Generate => println!("{}", generate_cloud_code()),
        CodeAction::Encode { ip, port } => println!("{}", encode_lan_code(*ip, *port)),
        CodeAction::Decode { code } => {
            let (ip, port) =
                decode_lan_code(code).ok_or_else(|| anyhow!("Not a LAN code: {}", code))?;
            println!("{}:{}", ip, port);
        }
    }
    Ok(())
}

fn run_config(cli: &Cli, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Path => match config_path(cli) {
            Some(path) => println!("{}", path.display()),
            None => bail!("No configuration directory on this system"),
        },
        ConfigAction::Show => print!("{}", load_config(cli)?.to_toml_string()?),
        ConfigAction::Init { force } => {
            let path = config_path(cli).ok_or_else(|| anyhow!("No configuration directory"))?;
            if path.exists() && !force {
                bail!("{} exists, use --force to overwrite", path.display());
            }
            NetworkConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match &cli.command {
        Commands::Host {
            local,
            port,
            mesh,
            max_nodes,
            no_relay,
        } => {
            let config = load_config(&cli)?;
            run_host(config, *local, *port, *mesh, *max_nodes, *no_relay).await?;
        }
        Commands::Join {
            code,
            mesh,
            message,
            timeout,
        } => {
            let config = load_config(&cli)?;
            run_join(config, code.clone(), *mesh, message.clone(), *timeout).await?;
        }
        Commands::Code { action } => run_code(action)?,
        Commands::Config { action } => run_config(&cli, action)?,
    }

    Ok(())
}
