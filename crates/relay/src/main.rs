//! ComfyRelay - command line entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfyrelay::{RelayConfig, RelayCoordinator, RelayDeps};

#[derive(Parser)]
#[command(name = "comfyrelay", version, about = "Lock a ComfyUI server and track workflow runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every configured server and print the pool status
    Status,
    /// Submit a workflow (API-format JSON) and follow it to completion
    Submit {
        /// Path to the workflow JSON
        workflow: PathBuf,
        /// Workflow type label reported with progress
        #[arg(long, default_value = "workflow")]
        workflow_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfyrelay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::from_env()?;
    let relay = RelayCoordinator::new(config.clone(), RelayDeps::production(&config))?;

    match cli.command {
        Command::Status => {
            let statuses = relay.list_all_server_statuses().await;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Command::Submit {
            workflow,
            workflow_type,
        } => {
            let raw = std::fs::read_to_string(&workflow)
                .with_context(|| format!("reading {}", workflow.display()))?;
            let payload: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", workflow.display()))?;

            let event_loop = relay.start()?;
            let handle = relay.submit_task(&workflow_type, payload).await?;
            tracing::info!("Task {} bound to {}", handle.id(), handle.bound_server());

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let printer = handle.on_progress(move |event| {
                let _ = tx.send(event);
            });
            let mut outcome = None;
            while let Some(event) = rx.recv().await {
                println!("[{:>3}%] {} {}", event.percent, event.status, event.message);
                for artifact in &event.artifacts {
                    println!("       {}", artifact.url);
                }
                if event.is_terminal() {
                    outcome = Some(event);
                }
            }
            printer.await?;

            println!("{}", serde_json::to_string_pretty(&relay.get_server_status().await)?);
            relay.shutdown().await;
            event_loop.await?;

            match outcome {
                Some(event) if event.error.is_none() => {}
                Some(event) => anyhow::bail!(
                    "task {} failed: {}",
                    event.task_id,
                    event.error.unwrap_or_default()
                ),
                None => anyhow::bail!("progress stream closed before the task finished"),
            }
        }
    }
    Ok(())
}
