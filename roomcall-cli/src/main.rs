//! Roomcall CLI: runs an in-process chat room and plays calls through it

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use rand::Rng;
use roomcall_core::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

const NAMES: &[&str] = &[
    "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy", "mallory",
    "niaj", "olivia", "peggy", "rupert", "sybil", "trent", "victor", "walter",
];

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (JSON); defaults to the platform config directory
    #[arg(short, long, env = "ROOMCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a private call between two room members
    Private {
        /// Callee declines instead of accepting
        #[arg(long)]
        reject: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value_t = 2)]
        hold: u64,
    },

    /// Start a group call and have the rest of the room join it
    Group {
        /// Members joining besides the initiator
        #[arg(short, long, default_value_t = 2)]
        participants: usize,

        /// Seconds to stay in the call before everyone leaves
        #[arg(long, default_value_t = 2)]
        hold: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomcall=info")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.config.or_else(default_config_path);
    let config = load_config(path.as_deref())?;

    match cli.command {
        Commands::Private { reject, hold } => run_private(config, reject, hold).await,
        Commands::Group { participants, hold } => run_group(config, participants, hold).await,
        Commands::Config => {
            match &path {
                Some(p) => println!("# {}", p.display()),
                None => println!("# built-in defaults"),
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "roomcall", "roomcall").map(|d| d.config_dir().join("config.json"))
}

fn load_config(path: Option<&Path>) -> Result<CallConfig> {
    match path {
        Some(p) if p.exists() => {
            let json = std::fs::read_to_string(p)
                .with_context(|| format!("reading {}", p.display()))?;
            CallConfig::from_json(&json).with_context(|| format!("parsing {}", p.display()))
        }
        _ => Ok(CallConfig::default()),
    }
}

/// Relay-style ephemeral session id
fn session_id() -> SessionId {
    let n: u64 = rand::thread_rng().gen();
    SessionId::new(format!("{n:016x}"))
}

struct Room {
    relay: LocalRelay,
    network: LoopbackNetwork,
    config: CallConfig,
}

impl Room {
    fn new(config: CallConfig) -> Self {
        Self {
            relay: LocalRelay::new(),
            network: LoopbackNetwork::new(),
            config,
        }
    }

    /// Connect a member and print everything that happens to it
    fn join(&self, name: &str) -> Result<(CallService, JoinHandle<()>)> {
        let participant = Participant::new(session_id(), name);
        let (endpoint, inbound) = self.relay.connect(participant.clone());
        let service = CallService::builder(participant.clone())
            .with_config(self.config.clone())
            .with_signaling(Arc::new(endpoint), inbound)
            .with_devices(Arc::new(LoopbackDevices::new()))
            .with_engine(Arc::new(self.network.engine(participant.id.clone())))
            .build()?;

        let mut events = service.subscribe_events();
        let name = name.to_string();
        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                print_event(&name, &event);
            }
        });
        Ok((service, printer))
    }
}

fn print_event(name: &str, event: &CallEvent) {
    match event {
        CallEvent::Status(CallStatus::Cleared) => {}
        CallEvent::Status(status) => println!("[{name:>8}] {status}"),
        CallEvent::IncomingCall { caller, .. } => {
            println!("[{name:>8}] incoming call from {}", caller.display_name)
        }
        CallEvent::GroupCallAvailable { initiator } => {
            println!("[{name:>8}] {} started a group call", initiator.display_name)
        }
        CallEvent::ParticipantJoined { participant } => {
            println!("[{name:>8}] {} joined", participant.display_name)
        }
        CallEvent::CallEnded {
            reason,
            duration_secs,
            ..
        } => match duration_secs {
            Some(secs) => println!("[{name:>8}] call ended ({reason:?}) after {secs}s"),
            None => println!("[{name:>8}] call ended ({reason:?})"),
        },
        other => tracing::debug!(member = name, event = ?other, "Call event"),
    }
}

async fn wait_until(service: &CallService, pred: impl Fn(&CallSnapshot) -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(35), async {
        loop {
            if pred(&service.snapshot().await?) {
                return Ok::<_, CallError>(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("timed out waiting for the call")??;
    Ok(())
}

async fn run_private(config: CallConfig, reject: bool, hold: u64) -> Result<()> {
    let grace = config.status_grace();
    let room = Room::new(config);
    let (caller, caller_log) = room.join(NAMES[0])?;
    let (callee, callee_log) = room.join(NAMES[1])?;

    caller.start_private_call(NAMES[1]).await?;
    wait_until(&callee, |s| {
        matches!(s, CallSnapshot::Private { state: CallState::Ringing, .. })
    })
    .await?;

    if reject {
        callee.reject_call().await?;
    } else {
        callee.accept_call().await?;
        wait_until(&caller, |s| {
            matches!(
                s,
                CallSnapshot::Private {
                    state: CallState::Active | CallState::Failed,
                    ..
                }
            )
        })
        .await?;
        tokio::time::sleep(Duration::from_secs(hold)).await;
        caller.end_call().await?;
    }

    tokio::time::sleep(grace).await;
    for service in [&caller, &callee] {
        service.shutdown().await;
    }
    caller_log.abort();
    callee_log.abort();
    Ok(())
}

async fn run_group(config: CallConfig, participants: usize, hold: u64) -> Result<()> {
    let grace = config.status_grace();
    let room = Room::new(config);

    let mut members = Vec::new();
    for i in 0..=participants {
        let name = NAMES
            .get(i)
            .map_or_else(|| format!("guest{i}"), |n| (*n).to_string());
        members.push(room.join(&name)?);
    }

    let (initiator, _) = &members[0];
    initiator.start_group_call().await?;
    for (joined, (member, _)) in members.iter().skip(1).enumerate() {
        wait_until(member, |s| {
            matches!(s, CallSnapshot::Group { state: GroupCallState::AwaitingDecision, .. })
        })
        .await?;
        member.join_group_call().await?;
        wait_until(member, |s| {
            matches!(s, CallSnapshot::Group { connected, .. } if *connected == joined + 1)
        })
        .await?;
    }

    println!(
        "mesh complete: {} members, {} open links",
        members.len(),
        room.network.open_links()
    );
    tokio::time::sleep(Duration::from_secs(hold)).await;

    for (member, _) in members.iter().rev() {
        member.leave_group_call().await?;
    }
    tokio::time::sleep(grace).await;
    for (member, printer) in &members {
        member.shutdown().await;
        printer.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/roomcall.json"))).unwrap();
        assert_eq!(config, CallConfig::default());
    }

    #[test]
    fn test_session_ids_are_hex() {
        let id = session_id();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cli_parses_group() {
        let cli = Cli::try_parse_from(["roomcall", "group", "--participants", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Group { participants: 3, .. }
        ));
    }
}
