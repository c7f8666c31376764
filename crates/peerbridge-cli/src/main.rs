//! PeerBridge CLI
//!
//! TCP relay over peer-to-peer discovery transports

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peerbridge_core::{BridgeEvent, Coordinator, PeerConnection};
use peerbridge_transport::MemoryNetwork;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::Config;

const DEMO_WAIT: Duration = Duration::from_secs(10);

/// PeerBridge - local TCP services across peer-to-peer links
#[derive(Parser)]
#[command(name = "peerbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server (the service a bridge usually fronts)
    Echo {
        /// Bind address, overriding the configuration file
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Relay a payload between two in-process nodes and verify the echo
    Demo {
        /// Payload size in bytes
        #[arg(short, long, default_value_t = 64 * 1024)]
        size: usize,

        /// Forbid the connecting node from dialing, forcing a reverse connect
        #[arg(long)]
        reverse: bool,
    },

    /// Show the effective configuration
    Config {
        /// Also write it to the default configuration path
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref())?;
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Echo { bind } => {
            let addr = match bind {
                Some(bind) => bind.parse().context("invalid --bind address")?,
                None => config.echo_addr()?,
            };
            run_echo(addr).await?;
        }
        Commands::Demo { size, reverse } => {
            run_demo(size, reverse, &config).await?;
        }
        Commands::Config { write } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if write {
                let path = Config::default_path();
                config.save(&path)?;
                println!("\nWritten to {}", path.display());
            }
        }
    }

    Ok(())
}

/// Serve echo connections until Ctrl+C
async fn run_echo(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    println!("Echo server listening on {}", listener.local_addr()?);
    println!("Press Ctrl+C to stop");

    tokio::select! {
        result = serve_echo(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down echo server");
            Ok(())
        }
    }
}

async fn serve_echo(listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (mut socket, peer) = listener.accept().await?;
        tracing::debug!("Echo connection from {}", peer);
        tokio::spawn(async move {
            let (mut rd, mut wr) = socket.split();
            match tokio::io::copy(&mut rd, &mut wr).await {
                Ok(n) => tracing::debug!("Echoed {} bytes to {}", n, peer),
                Err(e) => tracing::warn!("Echo to {} failed: {}", peer, e),
            }
        });
    }
}

/// Two coordinators over the memory transport, each fronting an echo server
async fn run_demo(size: usize, reverse: bool, config: &Config) -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let alice_transport = network.transport("alice");
    let bob_transport = network.transport("bob");
    if reverse {
        network.set_dial_allowed("alice", false);
    }

    let (alice, _alice_events) = Coordinator::new(config.bridge_config("alice")?, alice_transport)?;
    let (bob, mut bob_events) = Coordinator::new(config.bridge_config("bob")?, bob_transport)?;

    for node in [&alice, &bob] {
        let echo = TcpListener::bind("127.0.0.1:0").await?;
        let port = echo.local_addr()?.port();
        tokio::spawn(serve_echo(echo));
        node.start_advertising_and_listening(port).await?;
        node.start_listening_for_advertisements().await?;
    }

    tokio::time::timeout(DEMO_WAIT, async {
        while alice.client().session("bob").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("alice never discovered bob")?;

    let started = Instant::now();
    let connection = alice.connect_to_peer("bob").await?;
    println!("Connected in {:?}: {:?}", started.elapsed(), connection);

    // A reverse connect leaves the listening relay on bob's side
    let port = match connection {
        PeerConnection::Forward { listening_port } => listening_port,
        PeerConnection::Incoming { .. } => reverse_listening_port(&mut bob_events).await?,
    };

    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let started = Instant::now();
    let echoed = round_trip(port, &payload).await?;
    let elapsed = started.elapsed();

    if echoed != payload {
        anyhow::bail!("echo mismatch after {} bytes", echoed.len());
    }
    println!(
        "Round trip of {} bytes in {:?} ({:.1} MiB/s)",
        size,
        elapsed,
        (2 * size) as f64 / elapsed.as_secs_f64().max(1e-9) / (1024.0 * 1024.0)
    );

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

async fn reverse_listening_port(events: &mut mpsc::Receiver<BridgeEvent>) -> anyhow::Result<u16> {
    tokio::time::timeout(DEMO_WAIT, async {
        while let Some(event) = events.recv().await {
            if let BridgeEvent::ReverseConnectionListening { port, .. } = event {
                return Ok(port);
            }
        }
        anyhow::bail!("event channel closed")
    })
    .await
    .context("no reverse relay appeared")?
}

async fn round_trip(port: u16, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let socket = TcpStream::connect(("127.0.0.1", port)).await?;
    let (mut rd, mut wr) = socket.into_split();

    let outgoing = payload.to_vec();
    let writer = tokio::spawn(async move {
        wr.write_all(&outgoing).await?;
        wr.shutdown().await
    });

    let mut echoed = Vec::with_capacity(payload.len());
    rd.read_to_end(&mut echoed).await?;
    writer.await??;
    Ok(echoed)
}
