use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use autocheckin::config::AppConfig;
use autocheckin::report::{format_report, RunReport};
use autocheckin::scheduler::profiles;
use autocheckin::scheduler::{CronExpr, SchedulerStatus};

#[derive(Parser)]
#[command(
    name = "autocheckin",
    about = "Session-aware scheduled check-ins for third-party sites",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (otherwise $AUTOCHECKIN_CONFIG, then ./autocheckin.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled target, one after another
    RunAll,

    /// Run a single target
    RunSingle {
        /// Target id
        target_id: String,
    },

    /// Run every enabled target concurrently
    RunParallel,

    /// List configured targets and whether they are ready to run
    ListTargets,

    /// Show cached sessions and their validity
    ShowSessions,

    /// Delete cached sessions
    ClearSessions {
        /// `all` or a target id
        #[arg(default_value = "all")]
        which: String,
    },

    /// Start the daemon with the configured schedule (runs until SIGINT/SIGTERM)
    StartSchedule {
        /// 5-field cron expression (overrides config)
        #[arg(long)]
        cron: Option<String>,

        /// Run targets concurrently on each firing
        #[arg(long)]
        parallel: bool,

        /// Restrict firings to these target ids, in order (repeatable)
        #[arg(long = "target")]
        targets: Vec<String>,
    },

    /// Stop one schedule (or all) in the running daemon
    StopSchedule {
        /// Schedule id; all schedules when omitted
        id: Option<String>,
    },

    /// Show the running daemon's schedules
    ScheduleStatus,

    /// Preview when the configured schedule will fire
    SchedulePreview {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,

        /// Preview this expression instead of the configured one
        #[arg(long)]
        cron: Option<String>,
    },

    /// Run the scheduled pass immediately (no retries)
    RunNow {
        /// Run targets concurrently
        #[arg(long)]
        parallel: bool,
    },

    /// Show recent passes from the run history
    History {
        /// Number of passes to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

fn init_tracing(cfg: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        print_json(report)
    } else {
        print!("{}", format_report(report));
        Ok(())
    }
}

fn api_base(cfg: &AppConfig) -> String {
    let bind = cfg.api.bind.replace("0.0.0.0", "127.0.0.1");
    format!("http://{bind}/api/v1")
}

fn api_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build http client")
}

#[derive(serde::Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(serde::Deserialize, Serialize)]
struct Stopped {
    stopped: Vec<String>,
}

async fn run_all(cfg: &AppConfig, parallel: bool, json: bool) -> Result<()> {
    tracing::info!(parallel, "Running all targets");
    let orchestrator = autocheckin::build_orchestrator(cfg);
    let report = orchestrator.run_all(parallel).await;
    autocheckin::publish(&autocheckin::build_sinks(cfg), &report).await;
    print_report(&report, json)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&cfg);

    match cli.command {
        Commands::RunAll => run_all(&cfg, false, cli.json).await?,
        Commands::RunParallel => run_all(&cfg, true, cli.json).await?,
        Commands::RunSingle { target_id } => {
            tracing::info!(target = %target_id, "Running single target");
            let orchestrator = autocheckin::build_orchestrator(&cfg);
            let report = orchestrator.run_single(&target_id).await;
            autocheckin::publish(&autocheckin::build_sinks(&cfg), &report).await;
            print_report(&report, cli.json)?;
        }
        Commands::RunNow { parallel } => {
            let spec = profiles::from_config(&cfg.schedule)?;
            let parallel = parallel || spec.options.parallel;
            tracing::info!(parallel, targets = ?spec.options.target_filter, "Running scheduled pass now");
            let orchestrator = autocheckin::build_orchestrator(&cfg);
            let report = if spec.options.target_filter.is_empty() {
                orchestrator.run_all(parallel).await
            } else {
                orchestrator.run_filtered(&spec.options.target_filter).await
            };
            autocheckin::publish(&autocheckin::build_sinks(&cfg), &report).await;
            print_report(&report, cli.json)?;
        }
        Commands::ListTargets => {
            let statuses = autocheckin::build_orchestrator(&cfg).target_statuses();
            if cli.json {
                print_json(&statuses)?;
            } else if statuses.is_empty() {
                println!("No targets configured.");
            } else {
                println!("{:<16} | {:<24} | {:<10} | Status", "Id", "Name", "Driver");
                println!("{:-<16}-|-{:-<24}-|-{:-<10}-|-{:-<30}", "", "", "", "");
                for t in statuses {
                    let status = match (&t.problem, t.enabled) {
                        (_, false) => "disabled".to_string(),
                        (Some(problem), true) => format!("misconfigured: {problem}"),
                        (None, true) => "ready".to_string(),
                    };
                    println!("{:<16} | {:<24} | {:<10} | {}", t.id, t.display_name, t.driver, status);
                }
            }
        }
        Commands::ShowSessions => {
            let store = autocheckin::session::SessionStore::from_config(&cfg.session);
            let sessions = store.list_all().await;
            if cli.json {
                print_json(&sessions)?;
            } else if sessions.is_empty() {
                println!("No cached sessions in {}.", store.dir().display());
            } else {
                println!("{:<16} | {:<7} | Age", "Target", "Valid");
                println!("{:-<16}-|-{:-<7}-|-{:-<12}", "", "", "");
                for s in sessions {
                    let age = s
                        .age_days
                        .map(|d| format!("{d:.1} days"))
                        .unwrap_or_else(|| "unreadable".to_string());
                    let valid = if s.is_valid { "yes" } else { "no" };
                    println!("{:<16} | {:<7} | {}", s.target_id, valid, age);
                }
            }
        }
        Commands::ClearSessions { which } => {
            let store = autocheckin::session::SessionStore::from_config(&cfg.session);
            if which == "all" {
                let removed = store.purge_all().await;
                println!("Removed {removed} cached session(s).");
            } else {
                store.purge(&which).await;
                println!("Session for '{which}' cleared.");
            }
        }
        Commands::StartSchedule {
            cron,
            parallel,
            targets,
        } => {
            let mut spec = profiles::from_config(&cfg.schedule)?;
            if let Some(cron) = cron {
                spec.cron = cron;
            }
            spec.options.parallel |= parallel;
            if !targets.is_empty() {
                spec.options.target_filter = targets;
            }
            tracing::info!(schedule = %spec.id, cron = %spec.cron, "Starting autocheckin daemon");
            autocheckin::serve(&cfg, spec).await?;
        }
        Commands::StopSchedule { id } => {
            let url = match &id {
                Some(id) => format!("{}/schedules/{id}", api_base(&cfg)),
                None => format!("{}/schedules", api_base(&cfg)),
            };
            let response: Envelope<Stopped> = api_client()?
                .delete(&url)
                .send()
                .await
                .with_context(|| format!("Failed to reach daemon at {url}"))?
                .error_for_status()?
                .json()
                .await?;
            if cli.json {
                print_json(&response.data)?;
            } else if response.data.stopped.is_empty() {
                println!("No matching schedule was active.");
            } else {
                println!("Stopped: {}", response.data.stopped.join(", "));
            }
        }
        Commands::ScheduleStatus => {
            let url = format!("{}/schedules", api_base(&cfg));
            let response: Envelope<SchedulerStatus> = api_client()?
                .get(&url)
                .send()
                .await
                .with_context(|| format!("Failed to reach daemon at {url}"))?
                .error_for_status()?
                .json()
                .await?;
            let status = response.data;
            if cli.json {
                print_json(&status)?;
            } else if !status.running {
                println!("Daemon is up; no schedules active.");
            } else {
                println!("{:<16} | {:<15} | {:<8} | Next fire", "Schedule", "Cron", "Mode");
                println!("{:-<16}-|-{:-<15}-|-{:-<8}-|-{:-<25}", "", "", "", "");
                for s in &status.schedules {
                    let mode = if s.parallel { "parallel" } else { "serial" };
                    let next = s
                        .next_fire
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!("{:<16} | {:<15} | {:<8} | {}", s.id, s.cron, mode, next);
                }
                println!("\n{} pass(es) in flight", status.in_flight);
            }
        }
        Commands::SchedulePreview { hours, cron } => {
            let spec = profiles::from_config(&cfg.schedule)?;
            let expr = CronExpr::parse(cron.as_deref().unwrap_or(&spec.cron))?;
            let now = chrono::Utc::now();
            let end = now + chrono::Duration::hours(hours.min(24 * 366) as i64);
            let fires = expr.fires_between(now, end, spec.options.timezone);
            if cli.json {
                print_json(&fires)?;
            } else if fires.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs of '{}' (next {} hours):", expr, hours);
                for at in fires {
                    println!("{}", at.to_rfc3339());
                }
            }
        }
        Commands::History { limit } => {
            let store = autocheckin::storage::HistoryStore::open(&cfg.history.db_path)?;
            let reports = store.recent(limit)?;
            if cli.json {
                print_json(&reports)?;
            } else if reports.is_empty() {
                println!("No passes recorded yet.");
            } else {
                println!("{:<25} | {:<8} | {:>3} | {:>3} | Duration", "Started", "Mode", "OK", "ERR");
                println!("{:-<25}-|-{:-<8}-|-{:-<3}-|-{:-<3}-|-{:-<8}", "", "", "", "", "");
                for r in reports {
                    println!(
                        "{:<25} | {:<8} | {:>3} | {:>3} | {:.1}s",
                        r.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        r.mode.to_string(),
                        r.success_count,
                        r.failure_count,
                        r.duration_seconds
                    );
                }
            }
        }
    }

    Ok(())
}
