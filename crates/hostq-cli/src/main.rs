use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hostq_core::{ActivityResult, ActivityType, HostId, TargetId, TeamId};
use hostq_engine::{Engine, EngineConfig, EnqueueRequest};
use hostq_storage::Store;

#[derive(Parser)]
#[command(name = "hostq", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create .hostq/ with a default config and an empty database
    Init,

    /// Load hosts, labels and targets from a world YAML file
    Seed {
        #[arg(long)]
        file: PathBuf,
    },

    /// Show a host's queue and delivery retry counts
    Status {
        #[arg(long)]
        host: u64,
    },

    /// Queue an activity for a host without activating it
    Enqueue {
        #[arg(long)]
        host: u64,
        /// software_install, software_uninstall, script_run, mdm_command, vpp_app_install
        #[arg(long)]
        kind: String,
        /// Target id such as installer:12 or profile:<uuid>
        #[arg(long)]
        target: Option<String>,
        #[arg(long, default_value_t = false)]
        setup_experience: bool,
    },

    /// Activate the next activity for a host if none is running
    Activate {
        #[arg(long)]
        host: u64,
    },

    /// Report the result of an activated activity
    Report {
        #[arg(long)]
        execution: String,
        /// acknowledged, installed or failed
        #[arg(long)]
        result: String,
        #[arg(long)]
        detail: Option<String>,
    },

    /// Retry a failed or stuck delivery
    Retry {
        #[arg(long)]
        host: u64,
        #[arg(long)]
        target: String,
    },

    /// Send a delivery again without counting a retry
    Resend {
        #[arg(long)]
        host: u64,
        #[arg(long)]
        target: String,
    },

    /// Print the profiles a host is expected to have
    Expected {
        #[arg(long)]
        host: u64,
    },

    /// Queue profile installs and removals for one host or a whole team
    Reconcile {
        #[arg(long, conflicts_with = "team")]
        host: Option<u64>,
        #[arg(long)]
        team: Option<u64>,
    },

    /// Delete a target and cancel work that depends on it
    DeleteTarget {
        #[arg(long)]
        target: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = std::env::current_dir()?;
    init_tracing(&root);
    tracing::debug!(root = %root.display(), "hostq starting");

    match cli.cmd {
        Command::Init => {
            let config = Engine::init(&root)?;
            println!("Initialized hostq in {}", root.display());
            println!("store: {}", config.store_path(&root).display());
        }
        Command::Seed { file } => {
            let engine = Engine::open(&root)?;
            let world = hostq_engine::load_world(&file)?;
            hostq_engine::seed_store(engine.store(), &world)?;
            println!(
                "Seeded {} hosts, {} labels, {} targets",
                world.hosts.len(),
                world.labels.len(),
                world.targets.len()
            );
        }
        Command::Status { host } => {
            let engine = Engine::open(&root)?;
            let host = HostId(host);
            let queue = engine.list_upcoming(host)?;
            println!("Upcoming activities: {}", queue.len());
            for a in &queue {
                let state = if a.is_activated() { "active" } else { "queued" };
                let target = a.target.as_ref().map(|t| t.to_string()).unwrap_or_default();
                println!("- {} [{}] {} {}", a.execution_id, state, a.activity_type, target);
            }
            let past = engine.store().past_activities(host)?;
            println!("Completed activities: {}", past.len());
            for (identifier, retries) in engine.retry_counts(host)? {
                println!("retries {identifier}: {retries}");
            }
        }
        Command::Enqueue {
            host,
            kind,
            target,
            setup_experience,
        } => {
            let engine = Engine::open(&root)?;
            let activity_type = ActivityType::parse(&kind)?;
            let mut req = EnqueueRequest::new(HostId(host), activity_type).setup_experience(setup_experience);
            if let Some(t) = target {
                req = req.target(parse_target(&t)?);
            }
            let exec = engine.enqueue(req)?;
            println!("Enqueued {exec}");
        }
        Command::Activate { host } => {
            let engine = Engine::open(&root)?;
            match engine.activate_next_for_host(HostId(host))? {
                Some(exec) => println!("Activated {exec}"),
                None => println!("Nothing to activate"),
            }
        }
        Command::Report {
            execution,
            result,
            detail,
        } => {
            let engine = Engine::open(&root)?;
            let result = ActivityResult::from_parts(&result, detail)?;
            let exec = hostq_core::ExecutionId::from_str(execution);
            let done = engine.complete(&exec, result)?;
            println!("Completed {} on host {}", done.execution_id, done.host_id);
        }
        Command::Retry { host, target } => {
            let engine = Engine::open(&root)?;
            let record = engine.retry(HostId(host), &parse_target(&target)?)?;
            println!("Retrying {} (attempt {})", record.identifier, record.retries);
        }
        Command::Resend { host, target } => {
            let engine = Engine::open(&root)?;
            let record = engine.resend(HostId(host), &parse_target(&target)?)?;
            println!("Resending {}", record.identifier);
        }
        Command::Expected { host } => {
            let engine = Engine::open(&root)?;
            let expected = engine.expected_profiles_for_host(HostId(host))?;
            let out: BTreeMap<_, _> = expected
                .into_iter()
                .map(|(identifier, p)| (identifier, (p.target.to_string(), p.earliest_install_date)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Reconcile { host, team } => {
            let engine = Engine::open(&root)?;
            let report = match host {
                Some(h) => engine.reconcile_host(HostId(h))?,
                None => engine.reconcile_team(team.map(TeamId))?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::DeleteTarget { target } => {
            let engine = Engine::open(&root)?;
            let report = engine.delete_target(&parse_target(&target)?)?;
            println!(
                "Deleted {target}: {} activities cancelled, {} hosts re-activated",
                report.cancelled.len(),
                report.hosts_to_activate.len()
            );
        }
    }

    Ok(())
}

fn parse_target(s: &str) -> anyhow::Result<TargetId> {
    TargetId::parse(s).with_context(|| format!("parse target '{s}'"))
}

/// RUST_LOG wins; otherwise the config file's filter, otherwise "info".
fn init_tracing(root: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let path = EngineConfig::config_path(root);
        let configured = EngineConfig::load_from(&path)
            .map(|c| c.log.filter)
            .unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(configured)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
