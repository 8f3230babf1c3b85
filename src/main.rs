//! telecall - video-call transport CLI
//!
//! Issues and validates invitation links and runs an in-process loopback
//! call for exercising the full signaling and frame-relay path without a
//! realtime service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use telecall::channel::memory::MemoryBroker;
use telecall::channel::{room_id, Role};
use telecall::config::CallConfig;
use telecall::invite::{self, CallInvite};
use telecall::media::synthetic::SyntheticBackend;
use telecall::session::{CallSession, ConnectionState};

#[derive(Parser)]
#[command(name = "telecall")]
#[command(about = "Video-call signaling and frame-relay transport", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue an invitation link token
    Encode {
        /// Participant display name
        name: String,

        /// Call id; generated when omitted
        #[arg(long)]
        call_id: Option<String>,
    },

    /// Decode and validate an invitation link token
    Decode {
        /// The token, as it appears in the link
        token: String,
    },

    /// Run a host+guest loopback call over the in-memory broker
    Loopback {
        /// Seconds to keep the call running
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &cli.config {
        Some(path) => CallConfig::load(path)?,
        None => CallConfig::default(),
    };

    match cli.command {
        Commands::Encode { name, call_id } => {
            let call_id = call_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let invite = CallInvite::new(&call_id, &name, chrono::Utc::now());
            println!("call id: {call_id}");
            println!("token:   {}", invite.encode());
        }
        Commands::Decode { token } => {
            let schema = invite::decode(&token, config.link_ttl(), chrono::Utc::now())
                .context("invitation link rejected")?;
            println!("participant: {}", schema.participant_name());
            match schema.call_id() {
                Some(id) => println!("call id:     {id}"),
                None => println!("call id:     (legacy link, none)"),
            }
            match schema.issued_at() {
                Some(at) => println!("issued at:   {at}"),
                None => println!("issued at:   (legacy link, unknown)"),
            }
        }
        Commands::Loopback { duration } => {
            run_loopback(config, Duration::from_secs(duration)).await?;
        }
    }

    Ok(())
}

/// Drive one side of the loopback call, then hang up.
async fn loopback_side(
    mut session: CallSession,
    run_for: Duration,
) -> Result<(ConnectionState, Duration)> {
    session.connect().await?;
    tokio::select! {
        _ = session.run() => {}
        _ = tokio::time::sleep(run_for) => {}
    }
    let reached = session.state();
    session.hangup().await;
    Ok((reached, session.call_duration()))
}

async fn run_loopback(config: CallConfig, run_for: Duration) -> Result<()> {
    let call_id = uuid::Uuid::new_v4().to_string();
    let room = room_id(&call_id);
    let broker = MemoryBroker::new();

    tracing::info!("loopback call {call_id} for {}s", run_for.as_secs());

    let host = CallSession::new(
        &call_id,
        Role::Host,
        "Host",
        Arc::new(broker.channel(&room)),
        SyntheticBackend::new(),
        config.clone(),
    );
    let guest = CallSession::new(
        &call_id,
        Role::Guest,
        "Guest",
        Arc::new(broker.channel(&room)),
        SyntheticBackend::new(),
        config,
    );

    let host_task = tokio::spawn(loopback_side(host, run_for));
    let guest_task = tokio::spawn(loopback_side(guest, run_for));

    let (host_state, host_up) = host_task.await??;
    let (guest_state, guest_up) = guest_task.await??;

    println!("host:  reached {host_state}, connected for {}ms", host_up.as_millis());
    println!("guest: reached {guest_state}, connected for {}ms", guest_up.as_millis());
    Ok(())
}
