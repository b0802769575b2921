//! # LKO Agent CLI (`lko`)
//!
//! ## Usage
//!
//! ```bash
//! lko --config ./config/lko.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lko ask "<query>"` | Plan diagnostic probes for a question and run them |
//! | `lko search "<text>"` | Find similar past incidents |
//! | `lko stats` | Incident memory, runbook and log overview |
//! | `lko runbooks list` | List configured runbooks |
//! | `lko runbooks check` | Show which runbooks the current host state triggers |
//! | `lko hogs` | List processes above the CPU/memory thresholds |
//! | `lko remediate <pid>` | Escalate remediation of a process |
//! | `lko network` | Interfaces, gateway, connections and optional ping/DNS/port checks |
//! | `lko containers` | Docker container states, failures and resource hogs |
//! | `lko daemon run` | Run the monitoring loop in the foreground |
//! | `lko start\|stop\|restart\|status\|logs` | Manage the `lko-agent` systemd unit |
//!
//! Without a config file at the `--config` path, built-in defaults are used
//! (dry-run mode).

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use lko_agent::config::{self, Config};
use lko_agent::remediate_cmd::{self, TierChoice};
use lko_agent::service::{self, ServiceAction};
use lko_agent::network::{self, ReportRequest};
use lko_agent::{ask, containers, daemon, runbook_cmd, search, stats};

/// LKO Agent: local knowledge and operations assistant.
#[derive(Parser)]
#[command(name = "lko", version, about = "LKO Agent - local monitoring, incident memory and remediation")]
struct Cli {
    /// Path to configuration file.
    #[arg(long, global = true, default_value = "./config/lko.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question about the system.
    ///
    /// The planner picks diagnostic probes, which are run (or previewed in
    /// dry-run mode). The query is appended to the query log.
    Ask {
        /// The question, e.g. "Why is my disk filling up?".
        query: String,
    },

    /// Search incident memory for similar past incidents.
    Search {
        query: String,

        /// Number of results. Defaults to `[memory].default_k`.
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Show incident memory, runbook and log statistics.
    Stats,

    /// Inspect runbooks.
    Runbooks {
        #[command(subcommand)]
        action: RunbookAction,
    },

    /// List processes above the CPU or memory threshold.
    Hogs {
        /// CPU percent threshold. Defaults to `[daemon].cpu_threshold`.
        #[arg(long)]
        cpu: Option<f32>,
        /// Memory percent threshold. Defaults to `[daemon].memory_threshold`.
        #[arg(long)]
        mem: Option<f32>,
    },

    /// Remediate a process: renice, then SIGTERM, then SIGKILL.
    ///
    /// Runs in the configured mode (dry run by default) unless `--live`.
    Remediate {
        pid: u32,

        /// Act on the process even when `[safety].dry_run` is set.
        #[arg(long)]
        live: bool,

        /// Apply a single tier instead of the escalation policy.
        #[arg(long, value_enum, default_value = "smart")]
        tier: TierChoice,
    },

    /// Report network state.
    ///
    /// Always shows interfaces, the default gateway and a connection
    /// summary. The gateway and `[network].ping_hosts` are pinged and
    /// `[network].dns_names` resolved unless overridden below.
    Network {
        /// Host to ping (repeatable). Replaces `[network].ping_hosts`.
        #[arg(long = "ping")]
        ping: Vec<String>,
        /// Name to resolve (repeatable). Replaces `[network].dns_names`.
        #[arg(long = "dns")]
        dns: Vec<String>,
        /// Host whose common service ports to check (repeatable).
        #[arg(long = "ports")]
        ports: Vec<String>,
        /// Don't ping the default gateway.
        #[arg(long)]
        no_gateway: bool,
    },

    /// Report Docker container states and resource use.
    Containers,

    /// Run the monitoring daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Start the lko-agent service.
    Start,
    /// Stop the lko-agent service.
    Stop,
    /// Restart the lko-agent service.
    Restart,
    /// Show the lko-agent service status.
    Status,
    /// Show the lko-agent service journal.
    Logs {
        /// Follow new entries.
        #[arg(short, long)]
        follow: bool,
        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
}

#[derive(Subcommand)]
enum RunbookAction {
    /// List configured runbooks.
    List,
    /// Observe the host and show which runbooks would fire.
    Check {
        /// Also execute the triggered runbooks in the configured mode.
        #[arg(long)]
        run: bool,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Run in the foreground until SIGTERM or Ctrl-C.
    Run,
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!("no config at {}, using defaults", path.display());
        Ok(Config::minimal())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Service commands don't need config
    let service_action = match &cli.command {
        Commands::Start => Some(ServiceAction::Start),
        Commands::Stop => Some(ServiceAction::Stop),
        Commands::Restart => Some(ServiceAction::Restart),
        Commands::Status => Some(ServiceAction::Status),
        Commands::Logs { follow, lines } => Some(ServiceAction::Logs {
            follow: *follow,
            lines: *lines,
        }),
        _ => None,
    };
    if let Some(action) = service_action {
        return service::run_service(action);
    }

    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Ask { query } => {
            ask::run_ask(&cfg, &query).await?;
        }
        Commands::Search { query, k } => {
            search::run_search(&cfg, &query, k).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Runbooks { action } => match action {
            RunbookAction::List => runbook_cmd::run_list(&cfg)?,
            RunbookAction::Check { run } => runbook_cmd::run_check(&cfg, run).await?,
        },
        Commands::Hogs { cpu, mem } => {
            remediate_cmd::run_hogs(&cfg, cpu, mem).await?;
        }
        Commands::Remediate { pid, live, tier } => {
            remediate_cmd::run_remediate(&cfg, pid, live, tier).await?;
        }
        Commands::Network {
            ping,
            dns,
            ports,
            no_gateway,
        } => {
            let mut request = ReportRequest::from_config(&cfg.network);
            request.ping_gateway = !no_gateway;
            if !ping.is_empty() {
                request.ping_hosts = ping;
            }
            if !dns.is_empty() {
                request.dns_names = dns;
            }
            request.port_hosts = ports;
            network::run_network(&cfg, request).await?;
        }
        Commands::Containers => {
            containers::run_containers(&cfg).await?;
        }
        Commands::Daemon {
            action: DaemonAction::Run,
        } => {
            daemon::run_daemon(&cfg).await?;
        }
        Commands::Start
        | Commands::Stop
        | Commands::Restart
        | Commands::Status
        | Commands::Logs { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
