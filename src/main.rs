use chrono::{Duration, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use toolroute::{
    AdapterRegistry, Config, DispatchRequest, Dispatcher, EventLog, OutputNormalizer, Registry,
    RoutingEngine, TelemetryStore,
};
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "toolroute")]
#[command(author, version, about = "Route prompts to command-line LLM tools and track what they cost")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Registry directory (agents.yaml, tools.yaml, models.yaml, policies.yaml)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Telemetry database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Event log path
    #[arg(long, global = true)]
    events: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which tool and model an agent would use
    Route {
        agent: String,

        #[arg(short, long)]
        task_type: Option<String>,

        /// Prompt size used for cost optimization
        #[arg(long)]
        prompt_tokens: Option<u64>,

        #[arg(long)]
        json: bool,
    },

    /// Route a prompt, run the tool and record the invocation
    Run {
        agent: String,

        /// Prompt text ("-" reads stdin)
        prompt: String,

        #[arg(short, long)]
        task_type: Option<String>,

        /// Correlation id shared by events of one run
        #[arg(long)]
        run_id: Option<String>,

        /// Skip the ledger and event log
        #[arg(long)]
        no_telemetry: bool,

        #[arg(long)]
        json: bool,
    },

    /// List configured tools and whether they are installed
    Tools,

    /// Show recent invocations
    Invocations {
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,

        #[arg(long)]
        json: bool,
    },

    /// Show daily cost aggregates
    Costs {
        /// Only days on or after this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,

        /// Totals per agent instead of per day
        #[arg(long)]
        by_agent: bool,

        #[arg(long)]
        json: bool,
    },

    /// Replay the event log
    Events {
        #[arg(long)]
        json: bool,
    },

    /// Delete invocation rows older than the retention window
    Purge {
        /// Days to keep (defaults to telemetry.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    let config = Config::load();
    init_logging(&config.logging.level, cli.verbose);

    if let Err(e) = run(cli, &config) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli, config: &Config) -> CliResult {
    let registry_dir = cli.registry.clone().unwrap_or_else(|| config.registry_dir());
    let db_path = cli.db.clone().unwrap_or_else(|| config.db_path());
    let events_path = cli.events.clone().unwrap_or_else(|| config.events_path());

    match cli.command {
        Command::Route {
            agent,
            task_type,
            prompt_tokens,
            json,
        } => {
            let engine = build_engine(&registry_dir)?;
            let decision = engine.route(&agent, task_type.as_deref(), prompt_tokens)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                println!("{} {}:{}", "Route".green().bold(), decision.tool, decision.model);
                if decision.fallback_used {
                    println!(
                        "   {} preferred {}:{}",
                        "Fallback from".yellow(),
                        decision.original_tool,
                        decision.original_model
                    );
                }
                println!("   {}", decision.reason.dimmed());
            }
        }

        Command::Run {
            agent,
            prompt,
            task_type,
            run_id,
            no_telemetry,
            json,
        } => {
            let prompt = if prompt == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                prompt
            };

            let engine = build_engine(&registry_dir)?;
            let mut dispatcher = Dispatcher::new(engine).with_privacy(config.telemetry.privacy_level);
            if !no_telemetry {
                let mut log = EventLog::new(&events_path);
                if let Some(bytes) = config.telemetry.rotate_bytes {
                    log = log.with_rotation(bytes);
                }
                dispatcher = dispatcher
                    .with_telemetry(Arc::new(TelemetryStore::open_at(&db_path)?))
                    .with_events(Arc::new(log));
            }

            let request = DispatchRequest {
                agent,
                prompt,
                task_type,
                run_id,
                task_id: None,
            };
            let outcome = dispatcher.dispatch(&request)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else if outcome.response.is_success() {
                println!("{}", outcome.response.output);
            }
            if !outcome.response.is_success() {
                return Err(outcome
                    .response
                    .error
                    .unwrap_or_else(|| "tool call failed".to_string())
                    .into());
            }
        }

        Command::Tools => {
            let registry = Registry::load_dir(&registry_dir)?;
            let (adapters, skipped) =
                AdapterRegistry::from_tools(&registry.tools, Arc::new(OutputNormalizer::new()));
            for adapter in adapters.iter() {
                let check = match adapter.validate_config() {
                    Ok(()) => "ok".green(),
                    Err(e) => format!("invalid: {}", e).red(),
                };
                println!(
                    "{} {} [{}] {}",
                    "✓".green(),
                    adapter.tool_name().bold(),
                    adapter.supported_models().join(", "),
                    check
                );
            }
            for (name, err) in skipped {
                println!("{} {} {}", "✗".red(), name.bold(), "unavailable".red());
                for line in err.to_string().lines() {
                    println!("    {}", line.dimmed());
                }
            }
        }

        Command::Invocations { limit, json } => {
            let store = TelemetryStore::open_at(&db_path)?;
            let rows = store.recent_invocations(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No invocations recorded.");
            } else {
                for row in rows {
                    let status = if row.status == "success" {
                        row.status.green()
                    } else {
                        row.status.red()
                    };
                    println!(
                        "{} {:<12} {:<10} {:<16} {:>7} tok ${:<10.4} {:>6}ms {}",
                        row.timestamp.dimmed(),
                        row.agent,
                        row.tool,
                        row.model,
                        row.total_tokens,
                        row.cost_usd,
                        row.latency_ms,
                        status
                    );
                }
            }
        }

        Command::Costs {
            since,
            by_agent,
            json,
        } => {
            let store = TelemetryStore::open_at(&db_path)?;
            if by_agent {
                let rows = store.cost_by_agent(since.as_deref())?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                } else {
                    for row in rows {
                        println!(
                            "{:<16} {:>6} calls {:>10} tok ${:.4}",
                            row.agent, row.invocations, row.total_tokens, row.total_cost_usd
                        );
                    }
                }
            } else {
                let rows = store.daily_costs(since.as_deref())?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                } else if rows.is_empty() {
                    println!("No costs recorded.");
                } else {
                    let total: f64 = rows.iter().map(|r| r.total_cost_usd).sum();
                    for row in &rows {
                        println!(
                            "{} {:<12} {:<10} {:<16} {:>6} calls {:>10} tok ${:.4}",
                            row.date,
                            row.agent,
                            row.tool,
                            row.model,
                            row.invocations,
                            row.total_tokens,
                            row.total_cost_usd
                        );
                    }
                    println!("{} ${:.4}", "Total".bold(), total);
                }
            }
        }

        Command::Events { json } => {
            let replay = EventLog::new(&events_path).replay()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&replay.events)?);
            } else {
                for event in &replay.events {
                    println!(
                        "{} {:<16} {} {}",
                        event.timestamp.to_rfc3339().dimmed(),
                        serde_json::to_value(&event.event_type)?
                            .as_str()
                            .unwrap_or_default(),
                        event.agent.as_deref().unwrap_or("-"),
                        event.summary.as_deref().unwrap_or_default()
                    );
                }
                println!("{} events", replay.events.len());
            }
            if replay.skipped > 0 {
                eprintln!(
                    "{} skipped {} unreadable line(s)",
                    "Warning:".yellow().bold(),
                    replay.skipped
                );
            }
        }

        Command::Purge { days } => {
            let days = days.or(config.telemetry.retention_days).ok_or(
                "No retention window: pass --days or set telemetry.retention_days in .toolroute/config.toml",
            )?;
            let store = TelemetryStore::open_at(&db_path)?;
            let cutoff = Utc::now() - Duration::days(i64::from(days));
            let deleted = store.purge_invocations_before(cutoff)?;
            println!("{} {} invocation(s) older than {} day(s)", "Purged".green(), deleted, days);
        }

        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "toolroute", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Load the registry and build adapters for every installed tool
fn build_engine(dir: &Path) -> Result<RoutingEngine, Box<dyn std::error::Error>> {
    let registry = Registry::load_dir(dir)?;
    // Missing tools are logged by from_tools and simply never routed to.
    let (adapters, _skipped) =
        AdapterRegistry::from_tools(&registry.tools, Arc::new(OutputNormalizer::new()));
    Ok(RoutingEngine::from_registry(&registry, adapters))
}
