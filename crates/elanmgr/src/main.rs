//! ELAN manager daemon entry point.
//!
//! Runs the manager against the in-memory collaborators. With `--events`
//! it replays an event script and prints the resulting switch state as
//! JSON; otherwise it idles until interrupted.

use anyhow::Context;
use clap::Parser;
use elanmgr::audit::{init_logging, init_logging_pretty, AuditCategory, AuditOutcome, AuditRecord};
use elanmgr::config::DEFAULT_CONFIG_PATH;
use elanmgr::events::{apply, parse_events};
use elanmgr::interfaces::SystemClock;
use elanmgr::memory::InMemoryCollaborators;
use elanmgr::{audit_log, ElanConfig, ElanManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// ELAN L2 overlay manager
#[derive(Parser, Debug)]
#[command(name = "elanmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty_logs: bool,

    /// JSON-lines event script to replay
    #[arg(short = 'e', long)]
    events: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.pretty_logs {
        init_logging_pretty(&args.log_level);
    } else {
        init_logging(&args.log_level);
    }

    let config = ElanConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;

    let env = InMemoryCollaborators::new(&config, Arc::new(SystemClock));
    let manager = ElanManager::new(config, env.collaborators());
    manager.restore().await?;

    audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "elanmgrd", "start")
        .with_outcome(AuditOutcome::Success)
        .with_details(serde_json::json!({"config": args.config.display().to_string()})));

    match &args.events {
        Some(path) => {
            let script = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let events = parse_events(&script)?;
            info!(events = events.len(), "Replaying event script");

            for event in events {
                apply(&manager, &env, event)?;
                manager.wait_idle().await;
            }

            let stats = manager.job_stats();
            info!(submitted = stats.submitted, succeeded = stats.succeeded,
                retried = stats.retried, failed = stats.failed, "Replay complete");
            println!("{}", serde_json::to_string_pretty(&env.switch.dump())?);
        }
        None => {
            info!("elanmgrd running, waiting for shutdown signal");
            tokio::signal::ctrl_c().await?;
            manager.wait_idle().await;
        }
    }

    audit_log!(AuditRecord::new(AuditCategory::SystemLifecycle, "elanmgrd", "stop")
        .with_outcome(AuditOutcome::Success));
    Ok(())
}
