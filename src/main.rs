//! # dsched: administrative task scheduler daemon
//!
//! Usage:
//!   dsched run                              # Run the scheduler until Ctrl-C
//!   dsched check-schedule "*/15 * * * *"   # Print the next firing instants
//!   dsched tasks                            # List persisted task records

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dsched_core::DschedConfig;
use dsched_scheduler::{RecurrenceRule, Scheduler, open_store};
use dsched_security::PrivilegeAuthorizer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dsched", version, about = "🗓️ dsched: directory server task scheduler")]
struct Cli {
    /// Config file (default: ~/.dsched/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Parse a recurrence expression and print its next firing instants
    CheckSchedule {
        expression: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
    /// List task records in the configured store
    Tasks {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&str>) -> Result<DschedConfig> {
    let config = match path {
        Some(p) => DschedConfig::load_from(&PathBuf::from(shellexpand::tilde(p).to_string()))?,
        None => DschedConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "dsched=debug,dsched_scheduler=debug"
    } else {
        "dsched=info,dsched_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run(config).await,
        Command::CheckSchedule { expression, count } => {
            check_schedule(&expression, count, config.scheduler.recurrence_horizon_days)
        }
        Command::Tasks { json } => list_tasks(&config, json),
    }
}

async fn run(config: DschedConfig) -> Result<()> {
    let store = open_store(&config.store)?;
    let scheduler = Scheduler::builder()
        .config(config.scheduler.clone())
        .notify_config(config.notify.clone())
        .store(store)
        .authorizer(Arc::new(PrivilegeAuthorizer::new(&config.security)))
        .build();

    let report = scheduler.recover().await?;
    println!("🗓️ dsched v{}", env!("CARGO_PKG_VERSION"));
    println!("   💾 Store:      {:?} ({})", config.store.backend, config.store.expanded_path().display());
    println!("   👷 Workers:    {}", config.scheduler.max_workers);
    println!("   ⏱️  Tick:       {}ms", config.scheduler.tick_interval_ms);
    println!(
        "   🔄 Recovered:  {} task(s), {} recurring definition(s), {} interrupted",
        report.tasks, report.definitions, report.interrupted
    );
    println!();

    let handle = scheduler.spawn();
    tokio::signal::ctrl_c().await?;
    println!("🛑 Shutting down (grace {}s)...", config.scheduler.shutdown_grace_secs);

    let forced = scheduler.shutdown().await;
    if forced > 0 {
        tracing::warn!("⚠️ {forced} task(s) did not stop within the grace period");
    }
    handle.await?;

    let stats = scheduler.stats().await;
    tracing::info!("📊 Final state: {}", serde_json::to_string(&stats)?);
    Ok(())
}

fn check_schedule(expression: &str, count: usize, horizon_days: u32) -> Result<()> {
    let rule = RecurrenceRule::parse(expression)?;
    println!("✅ {}", rule.expression());

    let mut after = Utc::now();
    for _ in 0..count {
        match rule.next_after(after, horizon_days) {
            Some(next) => {
                println!("   {}", next.format("%Y-%m-%d %H:%M %a"));
                after = next;
            }
            None => {
                println!("   ⚠️ No occurrence within {horizon_days} days");
                break;
            }
        }
    }
    Ok(())
}

fn list_tasks(config: &DschedConfig, json: bool) -> Result<()> {
    let store = open_store(&config.store)?;
    let mut tasks = store.load_tasks()?;
    tasks.sort_by_key(|t| t.created_at());

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("📭 No tasks.");
        return Ok(());
    }
    for task in &tasks {
        let start = task
            .scheduled_start()
            .map(|s| s.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "immediate".into());
        let recurring = task
            .recurring_definition()
            .map(|d| format!(" ↻ {d}"))
            .unwrap_or_default();
        println!(
            "{:<40} {:<12} {:<28} {}{}",
            task.id().as_str(),
            task.kind(),
            task.state().as_str(),
            start,
            recurring
        );
    }
    Ok(())
}
