//! Saorsa Call CLI Application
//!
//! Drives a call session against the in-process loopback peer and virtual
//! capture devices, so every state of the call screen can be exercised from
//! a terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use saorsa_call_core::prelude::*;
use saorsa_call_core::{LoopbackOutcome, Permission, RecordingAnalytics};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Instrument;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Four-word identity (e.g., "alice-bob-charlie-david")
    #[arg(short, long, env = "SAORSA_IDENTITY")]
    identity: Option<String>,

    /// JSON file with call configuration overrides
    #[arg(long, env = "SAORSA_CALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a simulated peer
    Call {
        /// Peer to call (four-word address)
        peer: String,

        /// Video call instead of voice
        #[arg(long)]
        video: bool,

        /// Start with microphone and camera permission denied
        #[arg(long)]
        deny_permission: bool,

        /// Start with no capture devices attached
        #[arg(long)]
        no_devices: bool,

        /// Make the remote fail negotiation with this reason
        #[arg(long)]
        fail: Option<String>,

        /// Remote never answers
        #[arg(long)]
        no_answer: bool,

        /// Remote hangs up this many seconds after answering
        #[arg(long)]
        hangup_after: Option<u64>,

        /// Hang up locally after this many seconds and exit
        #[arg(long)]
        end_after: Option<u64>,
    },

    /// Show status and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("saorsa_call=info")),
        )
        .init();

    let cli = Cli::parse();

    let identity = cli.identity.unwrap_or_else(generate_random_identity);
    println!("🔗 Using identity: {}", identity);

    let config = match cli.config.as_deref() {
        Some(path) => load_config(path)?,
        None => CallConfig::default(),
    };

    match cli.command {
        Commands::Call {
            peer,
            video,
            deny_permission,
            no_devices,
            fail,
            no_answer,
            hangup_after,
            end_after,
        } => {
            let script = remote_script(fail, no_answer, hangup_after);
            let backend = if no_devices {
                VirtualCaptureBackend::without_devices()
            } else {
                VirtualCaptureBackend::new()
            };
            if deny_permission {
                backend.set_permission(Permission::Denied);
            }
            let call_type = if video {
                CallType::Video
            } else {
                CallType::Voice
            };
            let span = tracing::info_span!("call", local = %identity, peer = %peer);
            handle_call(config, script, backend, &identity, &peer, call_type, end_after)
                .instrument(span)
                .await?;
        }
        Commands::Status => {
            handle_status(&config);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<CallConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn parse_config(raw: &str) -> Result<CallConfig> {
    Ok(serde_json::from_str(raw)?)
}

fn remote_script(fail: Option<String>, no_answer: bool, hangup_after: Option<u64>) -> LoopbackScript {
    let mut script = match (fail, no_answer) {
        (Some(reason), _) => LoopbackScript::failing(reason),
        (None, true) => LoopbackScript::never_answering(),
        (None, false) => LoopbackScript::answering(),
    };
    if let (Some(secs), LoopbackOutcome::Answer) = (hangup_after, &script.outcome) {
        script = script.with_hangup_after(Duration::from_secs(secs));
    }
    script
}

async fn handle_call(
    config: CallConfig,
    script: LoopbackScript,
    backend: VirtualCaptureBackend,
    identity: &str,
    peer: &str,
    call_type: CallType,
    end_after: Option<u64>,
) -> Result<()> {
    println!("{}", call_banner(identity, peer, call_type));

    let analytics = Arc::new(RecordingAnalytics::new());
    let service = CallService::builder(Arc::new(LoopbackNegotiator::new(script)))
        .with_capture_backend(Arc::new(backend.clone()))
        .with_analytics(analytics.clone())
        .with_config(config)
        .build()?;

    let surface = service.control_surface();
    let mut updates = surface.subscribe();
    let call_id = surface.start(PeerContact::new(peer), call_type).await?;
    println!("📞 Call initiated with ID: {}", call_id);
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let hangup = async {
        match end_after {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(hangup);
    let mut last_state = None;
    let mut stdin_open = true;
    let mut hung_up = false;

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Some(snapshot) => {
                        if last_state != Some(snapshot.state) {
                            print_snapshot(&snapshot);
                            last_state = Some(snapshot.state);
                        }
                        if snapshot.state == CallState::Ended {
                            break;
                        }
                        if snapshot.state == CallState::Failed {
                            if !stdin_open || hung_up {
                                break;
                            }
                            println!("   Type 'r' to retry or 'q' to quit");
                        }
                    }
                    None => break,
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(input) => {
                        if !apply_key(&surface, input.trim()).await? {
                            break;
                        }
                    }
                    // stdin closed; keep following the call
                    None => {
                        stdin_open = false;
                        if surface.state() == CallState::Failed {
                            break;
                        }
                    }
                }
            }
            () = &mut hangup, if !hung_up => {
                hung_up = true;
                println!("📴 Hanging up...");
                if surface.end().await? == CommandOutcome::AlreadyEnded {
                    break;
                }
            }
        }
    }

    let last = surface.snapshot();
    surface.dispose().await;
    println!(
        "📞 Call finished: {:?} after {}s",
        last.state, last.duration_seconds
    );
    for event in analytics.events() {
        tracing::debug!(event = event.name(), "Recorded analytics event");
    }
    if backend.any_open() {
        tracing::warn!("Capture devices still open after dispose");
    }
    Ok(())
}

fn call_banner(identity: &str, peer: &str, call_type: CallType) -> String {
    format!("📞 {} calling {} ({:?})...", identity, peer, call_type)
}

/// Apply one typed command; returns false when the user asked to quit
async fn apply_key(surface: &ControlSurface, key: &str) -> Result<bool> {
    let outcome = match key {
        "m" => surface.toggle_mute().await,
        "v" => surface.toggle_video().await,
        "e" => surface.end().await,
        "f" => {
            println!("🖥  Fullscreen: {}", surface.fullscreen_toggle());
            return Ok(true);
        }
        "r" => {
            match surface.retry().await {
                Ok(call_id) => println!("🔁 Retrying as {}", call_id),
                Err(e) => println!("⚠️  {}", e),
            }
            return Ok(true);
        }
        "q" => return Ok(false),
        "" => return Ok(true),
        _ => {
            print_help();
            return Ok(true);
        }
    };
    match outcome {
        Ok(CommandOutcome::Track { kind, enabled }) => {
            println!("🎚  {} {}", kind, if enabled { "on" } else { "off" });
        }
        Ok(CommandOutcome::NotConnected) => println!("⏳ Not connected yet"),
        Ok(CommandOutcome::AlreadyEnded) => println!("📴 Call already ended"),
        Ok(CommandOutcome::Done) => {}
        Err(e) => println!("⚠️  {}", e),
    }
    Ok(true)
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    let icon = match snapshot.state {
        CallState::Idle => "💤",
        CallState::Initializing => "🎙",
        CallState::Connecting => "🔄",
        CallState::Ringing => "🔔",
        CallState::Connected => "✅",
        CallState::Ended => "📴",
        CallState::Failed => "❌",
    };
    print!("{} {:?}", icon, snapshot.state);
    if let Some(reason) = &snapshot.failure_reason {
        print!(" ({})", reason);
    }
    if let Some(reason) = &snapshot.end_reason {
        print!(" ({:?})", reason);
    }
    if let Some(quality) = snapshot.quality {
        print!(" | quality: {}", quality);
    }
    println!();
}

fn print_help() {
    println!("   Controls: m=mute  v=video  f=fullscreen  e=end  r=retry  q=quit");
}

fn handle_status(config: &CallConfig) {
    println!("📊 Saorsa Call CLI Status");
    println!("=========================");
    println!("✅ CLI interface: Ready");
    println!("✅ Remote peer: Loopback simulation");
    println!("✅ Capture devices: Virtual");
    println!(
        "   Quality interval: {}s | Connect timeout: {}",
        config.quality_interval().as_secs(),
        config
            .connect_timeout()
            .map_or_else(|| "none".to_string(), |t| format!("{}s", t.as_secs()))
    );
    println!();
    println!("Available commands:");
    println!("  saorsa-call call <peer> [options]  - Call a simulated peer");
    println!("  saorsa-call status                 - Show this status");
    println!();
    println!("Use 'saorsa-call --help' for detailed options");
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu", "atlas", "beacon",
        "comet", "dragon", "eagle", "falcon", "galaxy", "harbor", "icarus", "jupiter", "knight",
        "lunar", "meteor", "nebula", "orbit", "phoenix", "quasar", "rocket", "stellar", "titan",
        "universe", "vortex",
    ];

    let mut rng = rand::thread_rng();
    let words: Vec<&str> = (0..4)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect();
    words.join("-")
}
