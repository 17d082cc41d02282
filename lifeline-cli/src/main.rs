use clap::{Parser, Subcommand, ValueEnum};
use lifeline::{ChatOptions, Lifeline, LifelineConfig};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lifeline", about = "Inspect and drive the Lifeline resilience layer")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "LIFELINE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Print the health report as JSON
    Status {
        /// Probe the endpoints before reporting
        #[arg(long)]
        probe: bool,
    },
    /// Probe the configured endpoints now
    Probe,
    /// Inspect and manage the offline write queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Inspect and reset model health
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Override connectivity detection
    ForceOnline {
        #[arg(value_enum)]
        mode: Toggle,
    },
    /// Load a file, falling back to the local cache
    Load { path: String },
    /// Save a file, queueing it when the backend is unreachable
    Save {
        path: String,
        /// File contents; read from stdin when omitted
        content: Option<String>,
    },
    /// Send a prompt with model fallback
    Chat {
        prompt: String,
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued entries
    List,
    /// Replay pending entries against the backend
    Replay,
    /// Move a FAILED entry back to PENDING
    Retry { id: String },
    /// Drop a queued entry
    Discard { id: String },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// Print per-model health
    Stats,
    /// Clear health for one model, or all when omitted
    Reset { model: Option<String> },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(lifeline: Arc<Lifeline>, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Status { probe } => {
            if probe {
                lifeline.check_connectivity().await;
            }
            print_json(&lifeline.health_report())
        }
        Command::Probe => {
            let state = lifeline.check_connectivity().await;
            print_json(&state)
        }
        Command::Queue { action } => match action {
            QueueAction::List => print_json(&lifeline.queue_entries()),
            QueueAction::Replay => {
                let state = lifeline.check_connectivity().await;
                if !state.is_online {
                    return Err(format!("backend is {}, nothing replayed", state.status).into());
                }
                print_json(&lifeline.replay_queue().await)
            }
            QueueAction::Retry { id } => print_json(&lifeline.retry_failed_entry(&id).await?),
            QueueAction::Discard { id } => print_json(&lifeline.discard_entry(&id).await?),
        },
        Command::Models { action } => match action {
            ModelsAction::Stats => print_json(&lifeline.get_model_health_stats()),
            ModelsAction::Reset { model } => {
                lifeline.reset_model_health(model.as_deref()).await;
                print_json(&lifeline.get_model_health_stats())
            }
        },
        Command::ForceOnline { mode } => {
            lifeline.force_online_mode(matches!(mode, Toggle::On));
            print_json(&lifeline.get_connectivity_status())
        }
        Command::Load { path } => {
            lifeline.check_connectivity().await;
            print_json(&lifeline.load_file(&path).await?)
        }
        Command::Save { path, content } => {
            let content = match content {
                Some(c) => c,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            lifeline.check_connectivity().await;
            print_json(&lifeline.save_file(&path, &content).await?)
        }
        Command::Chat { prompt, model } => {
            lifeline.check_connectivity().await;
            let options = ChatOptions {
                model,
                ..ChatOptions::default()
            };
            print_json(&lifeline.chat(&prompt, options).await?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // stdout carries JSON; logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    std::fs::create_dir_all(&cli.data_dir)?;
    let config = LifelineConfig::load_or_default(&cli.data_dir);
    let lifeline = lifeline_http::connect(config).await;
    let result = run(lifeline.clone(), cli.command).await;
    lifeline.stop();
    result
}
