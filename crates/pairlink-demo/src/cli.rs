//! Command definitions and execution.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use pairlink_core::harness::{Loopback, LoopbackMode};
use pairlink_core::progress::ProgressEvent;
use pairlink_core::{PairingConfig, PairingInvite, PairingState};
use pairlink_crypto::utils::random_bytes;
use pairlink_crypto::SharedSecret;

/// pairlink demo - QR shared-secret pairing
#[derive(Parser, Debug)]
#[command(name = "pairlink-demo")]
#[command(version, about = "pairlink demo - QR shared-secret pairing")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug mode (protocol-level tracing)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true, env = "PAIRLINK_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a fresh invite and print its QR payload
    Invite {
        /// Advertise a direct endpoint, as host:port
        #[arg(long)]
        direct: Option<String>,

        /// Host name shown to the scanning device
        #[arg(long, default_value = "pairlink-host")]
        name: String,
    },

    /// Decode a QR payload without contacting anyone
    Inspect {
        /// The scanned `pairlink://pair?...` URI
        uri: String,
    },

    /// Pair against a simulated host in this process
    Loopback {
        #[arg(long, value_enum, default_value_t = Mode::Direct)]
        mode: Mode,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Mode {
    /// Host answers on its direct endpoint
    Direct,
    /// Direct endpoint refuses; the relay answers
    DirectRefused,
    /// Invite has no direct endpoint
    RelayOnly,
    /// Nobody answers; ends in a relay timeout
    Silent,
}

impl From<Mode> for LoopbackMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Direct => LoopbackMode::Direct,
            Mode::DirectRefused => LoopbackMode::DirectRefused,
            Mode::RelayOnly => LoopbackMode::RelayOnly,
            Mode::Silent => LoopbackMode::Silent,
        }
    }
}

impl Cli {
    /// Run the command; returns whether it succeeded.
    pub async fn execute(self, config: PairingConfig) -> anyhow::Result<bool> {
        match self.command {
            Commands::Invite { direct, name } => {
                print_invite(direct.as_deref(), &name)?;
                Ok(true)
            }
            Commands::Inspect { uri } => {
                inspect(&uri)?;
                Ok(true)
            }
            Commands::Loopback { mode } => run_loopback(config, mode.into()).await,
        }
    }
}

fn print_invite(direct: Option<&str>, name: &str) -> anyhow::Result<()> {
    let session_id = hex::encode(random_bytes::<8>()?);
    let mut invite = PairingInvite::new(session_id, SharedSecret::generate()?).with_host_name(name);
    if let Some(addr) = direct {
        let (host, port) = addr
            .rsplit_once(':')
            .context("direct endpoint must be host:port")?;
        let port: u16 = port.parse().context("invalid direct port")?;
        invite = invite.with_direct_target(host, port);
    }

    println!("INVITE_URI={}", invite.to_uri());
    println!("RELAY_TOPIC={}", invite.relay_topic());
    Ok(())
}

fn inspect(uri: &str) -> anyhow::Result<()> {
    let invite = PairingInvite::parse(uri).context("not a pairlink invite")?;
    println!("version:     {}", invite.version);
    println!("session:     {}", display_or_dash(&invite.session_id));
    println!("host name:   {}", invite.host_name.as_deref().unwrap_or("-"));
    match &invite.direct_target {
        Some(target) => println!("direct:      {}:{}", target.host, target.port),
        None => println!("direct:      - (relay only)"),
    }
    println!("relay topic: {}", invite.relay_topic());
    Ok(())
}

fn display_or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

async fn run_loopback(config: PairingConfig, mode: LoopbackMode) -> anyhow::Result<bool> {
    let loopback = Loopback::new(config, mode)?;
    info!(?mode, "starting loopback pairing");

    let state = loopback.run().await;

    for event in loopback.progress.events() {
        match event {
            ProgressEvent::PhaseCompleted { phase, elapsed } => {
                println!("  [done] {:<20} {:>6} ms", phase.label(), elapsed.as_millis())
            }
            ProgressEvent::PhaseUnavailable { phase, elapsed } => {
                println!("  [fail] {:<20} {:>6} ms", phase.label(), elapsed.as_millis())
            }
            ProgressEvent::RelayRetry { attempt, max_retries } => {
                println!("  [retry] relay attempt {}/{}", attempt, max_retries)
            }
            ProgressEvent::PhaseStarted(_) => {}
        }
    }

    match state {
        PairingState::Authenticated(device_id) => {
            println!("paired with {}", device_id);
            Ok(true)
        }
        PairingState::Failed(reason) => {
            let message = loopback.lifecycle.failure_message().unwrap_or("Pairing failed");
            println!("pairing failed: {} ({})", message, reason);
            Ok(false)
        }
        other => {
            println!("pairing ended in {:?}", other);
            Ok(false)
        }
    }
}
