//! udsbus-node - interactive demo participant.
//!
//! Start several of these against the same socket path and secret. Each
//! line typed on stdin is broadcast to the other nodes; received lines are
//! printed. Kill the broker node and watch another one take over.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use udsbus::{Inbound, Ipc, Json, SendOptions, SessionInfo};

#[derive(Parser, Debug)]
#[command(name = "udsbus-node")]
#[command(about = "Join a udsbus message bus and chat over stdin/stdout")]
struct Args {
    /// Rendezvous socket path shared by all nodes
    #[arg(short, long, default_value = "/tmp/udsbus.sock")]
    socket: PathBuf,

    /// Shared secret proven during the handshake
    #[arg(long)]
    secret: String,

    /// Heartbeat step in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,

    /// Compress payloads larger than this many bytes (0 = off)
    #[arg(long, default_value = "0")]
    compress_over: usize,

    /// Also deliver our own messages back to us
    #[arg(long)]
    echo: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Line of chat broadcast between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatLine {
    from: u64,
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let identity = u64::from(std::process::id());
    info!(
        "Node {} joining bus at {}",
        identity,
        args.socket.display()
    );

    let ipc = Ipc::builder(&args.socket, args.secret.as_str())
        .heartbeat_step(Duration::from_millis(args.heartbeat_ms))
        .compression(args.compress_over > 0)
        .compression_threshold(args.compress_over)
        .register::<Json<ChatLine>>()
        .on_message(|msg: Inbound| match msg.downcast::<Json<ChatLine>>() {
            Ok(Json(line)) => println!("[{}] {}", line.from, line.text),
            Err(other) => warn!("Ignoring message of type {}", other.key()),
        })
        .after_handshake(|ipc: Ipc, session: SessionInfo| {
            info!(
                "Session {} up as {}",
                session.session_id,
                ipc.status().role
            );
        })
        .build()
        .context("Failed to configure bus participant")?;

    let runner = ipc.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            warn!("Bus participant stopped: {}", e);
        }
    });

    let options = SendOptions {
        self_receive: args.echo,
        wait: true,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving bus");
                break;
            }
            line = lines.next_line() => {
                let Some(text) = line.context("Failed to read stdin")? else {
                    info!("stdin closed, leaving bus");
                    break;
                };
                if text.trim().is_empty() {
                    continue;
                }
                let chat = ChatLine { from: identity, text };
                if let Err(e) = ipc.send_with(Json(chat), options).await {
                    warn!("Send failed: {}", e);
                }
            }
        }
    }

    Ok(())
}
