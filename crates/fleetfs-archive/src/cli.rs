use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleetfs_transport::NodeService;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ArchiveConfig;
use crate::handler::{ArchiveHandler, HandlerOutcome};
use crate::job::{JobExecutor, JobManager};
use crate::namespace::DirRef;
use crate::policy::{archive_type_for, ArchiveType, PolicyContext};
use crate::registry::ArchiveRegistry;
use crate::remote::RemoteJobRunner;
use crate::snapshot::Snapshot;

#[derive(Parser)]
#[command(name = "fleetfs-archive")]
#[command(about = "FleetFS directory archiver", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate a configuration file.
    Check {
        #[arg(short, long, env = "FLEETFS_ARCHIVE_CONFIG")]
        config: PathBuf,
    },
    /// Show what the next archive cycle would do, without moving data.
    Plan {
        #[arg(short, long, env = "FLEETFS_ARCHIVE_CONFIG")]
        config: PathBuf,
        #[arg(short, long)]
        snapshot: PathBuf,
        /// Only plan this section.
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Serve transfers for a storage node.
    Node {
        #[arg(short, long, env = "FLEETFS_ARCHIVE_CONFIG")]
        config: PathBuf,
        /// Control address to listen on.
        #[arg(short, long, default_value = "0.0.0.0:7100")]
        listen: SocketAddr,
        /// Storage root of this node.
        #[arg(short, long)]
        root: PathBuf,
    },
    /// Archive every section each cycle, copying through the nodes' services.
    Run {
        #[arg(short, long, env = "FLEETFS_ARCHIVE_CONFIG")]
        config: PathBuf,
        #[arg(short, long)]
        snapshot: PathBuf,
        /// Stop after one cycle.
        #[arg(long)]
        once: bool,
    },
}

/// Planned work for one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionPlan {
    /// Section name.
    pub section: String,
    /// Next directory to archive.
    pub directory: Option<DirRef>,
    /// Destination nodes, when resolvable.
    pub destinations: Vec<String>,
    /// Files that would be copied, as `path -> node`.
    pub copies: Vec<(String, String)>,
}

/// Plans every section of `config` against a snapshot.
pub fn plan(config: &ArchiveConfig, snapshot: &Snapshot, only: Option<&str>) -> Result<Vec<SectionPlan>> {
    let (namespace, fleet) = snapshot.build();
    let ctx = PolicyContext {
        namespace,
        fleet,
        registry: Arc::new(ArchiveRegistry::new()),
    };

    let mut plans = Vec::new();
    for section in &config.sections {
        if only.is_some_and(|name| name != section.name) {
            continue;
        }
        let policy = archive_type_for(section.clone(), ctx.clone());
        plans.push(plan_section(policy.as_ref())?);
    }
    Ok(plans)
}

fn plan_section(policy: &dyn ArchiveType) -> Result<SectionPlan> {
    let mut plan = SectionPlan {
        section: policy.section().name.clone(),
        directory: None,
        destinations: Vec::new(),
        copies: Vec::new(),
    };
    let Some(directory) = policy.get_oldest_non_archived_dir()? else {
        return Ok(plan);
    };
    policy.set_directory(Some(directory.clone()));
    plan.directory = Some(directory);

    if let Some(slaves) = policy.find_destination_slaves()? {
        plan.destinations = slaves.iter().map(|s| s.name().to_string()).collect();
        policy.set_destinations(slaves)?;
        plan.copies = policy
            .send()?
            .iter()
            .map(|job| (job.file().path.clone(), job.destination().name().to_string()))
            .collect();
    }
    policy.set_directory(None);
    Ok(plan)
}

/// Runs one handler per policy and collects each section's outcome.
pub async fn run_cycle(
    policies: &[Arc<dyn ArchiveType>],
    executor: &Arc<dyn JobExecutor>,
) -> Vec<(String, HandlerOutcome)> {
    let handlers: Vec<Arc<ArchiveHandler>> = policies
        .iter()
        .map(|policy| Arc::new(ArchiveHandler::new(policy.clone(), executor.clone())))
        .collect();
    let tasks: Vec<_> = handlers.iter().map(|h| h.spawn()).collect();

    let mut outcomes = Vec::with_capacity(handlers.len());
    for (handler, task) in handlers.iter().zip(tasks) {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(_) => handler.wait_done().await,
        };
        outcomes.push((handler.section().name.clone(), outcome));
    }
    outcomes
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Check { ref config } => self.check(config),
            Command::Plan {
                ref config,
                ref snapshot,
                ref section,
                json,
            } => self.plan(config, snapshot, section.as_deref(), json),
            Command::Node {
                ref config,
                listen,
                ref root,
            } => self.node(config, listen, root).await,
            Command::Run {
                ref config,
                ref snapshot,
                once,
            } => self.run_cycles(config, snapshot, once).await,
        }
    }

    async fn node(&self, config: &Path, listen: SocketAddr, root: &Path) -> Result<()> {
        let config = ArchiveConfig::from_file(config)?;
        let listener = TcpListener::bind(listen).await?;
        let service = Arc::new(NodeService::new(
            root,
            listen.ip(),
            config.transfer.passive_ports,
            config.transfer.connection.clone(),
        ));
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(service.run(listener, shutdown.clone()));

        tokio::signal::ctrl_c().await?;
        info!("shutting down node service");
        shutdown.cancel();
        server.await??;
        Ok(())
    }

    async fn run_cycles(&self, config: &Path, snapshot: &Path, once: bool) -> Result<()> {
        let config = ArchiveConfig::from_file(config)?;
        let (namespace, fleet) = Snapshot::load(snapshot)?.build();
        let ctx = PolicyContext {
            namespace: namespace.clone(),
            fleet: fleet.clone(),
            registry: Arc::new(ArchiveRegistry::new()),
        };
        let runner = Arc::new(RemoteJobRunner::new(fleet, config.transfer.clone()));
        let executor: Arc<dyn JobExecutor> =
            Arc::new(JobManager::new(runner, namespace, config.max_concurrent_jobs));
        let policies: Vec<Arc<dyn ArchiveType>> = config
            .sections
            .iter()
            .map(|section| archive_type_for(section.clone(), ctx.clone()))
            .collect();

        let mut cycles = tokio::time::interval(Duration::from_secs(config.cycle_time_secs));
        loop {
            tokio::select! {
                _ = cycles.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("archive loop interrupted");
                    return Ok(());
                }
            }
            for (section, outcome) in run_cycle(&policies, &executor).await {
                match outcome {
                    HandlerOutcome::Completed(report) => info!(
                        section = %section,
                        directory = %report.directory,
                        done = report.jobs_done,
                        failed = report.jobs_failed,
                        archived = report.archived,
                        "archive run completed"
                    ),
                    HandlerOutcome::Failed { directory, reason } => {
                        warn!(section = %section, ?directory, reason = %reason, "archive run failed")
                    }
                    other => info!(section = %section, outcome = ?other, "archive run finished"),
                }
            }
            if once {
                return Ok(());
            }
        }
    }

    fn check(&self, path: &Path) -> Result<()> {
        let config = ArchiveConfig::from_file(path)?;
        println!("{}: ok", path.display());
        for section in &config.sections {
            println!(
                "  {:<12} {:<24} {:?} x{}",
                section.name, section.path, section.archive_type, section.num_of_slaves
            );
        }
        Ok(())
    }

    fn plan(&self, config: &Path, snapshot: &Path, section: Option<&str>, json: bool) -> Result<()> {
        let config = ArchiveConfig::from_file(config)?;
        if let Some(name) = section {
            if config.section(name).is_none() {
                anyhow::bail!("no section named {}", name);
            }
        }
        let snapshot = Snapshot::load(snapshot)?;
        let plans = plan(&config, &snapshot, section)?;

        if json {
            println!("{}", serde_json::to_string_pretty(&plans)?);
            return Ok(());
        }
        for p in &plans {
            match &p.directory {
                None => println!("{}: nothing to archive", p.section),
                Some(dir) if p.destinations.is_empty() => {
                    println!("{}: {} (no destination slaves available)", p.section, dir)
                }
                Some(dir) => {
                    println!("{}: {} -> {}", p.section, dir, p.destinations.join(", "));
                    for (file, node) in &p.copies {
                        println!("    {} -> {}", file, node);
                    }
                }
            }
        }
        Ok(())
    }
}
