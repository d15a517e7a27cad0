//! tempsync: coordinator and worker processes that average temperatures over named channels.

mod channel;
mod config;
mod coordinator;
mod error;
mod memory;
mod shutdown;
mod simulate;
mod transport;
mod worker;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tempsync_core::WorkerId;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::NodeError;
use crate::memory::MemoryHub;
use crate::shutdown::{watch_signals, RunOutcome, Shutdown};
use crate::transport::SocketHub;

#[derive(Parser, Debug)]
#[command(name = "tempsync", version)]
#[command(about = "Distributed temperature averaging: one coordinator, N workers")]
struct Cli {
    /// Config file (default: ~/.config/tempsync/config.toml, then /etc/tempsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the channel sockets
    #[arg(long, global = true)]
    runtime_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Register workers and drive rounds until they agree
    Coordinator {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, allow_hyphen_values = true)]
        seed_estimate: Option<f64>,
        #[arg(long)]
        tolerance: Option<f64>,
        /// Fail a round that takes longer than this
        #[arg(long)]
        round_timeout_ms: Option<u64>,
    },
    /// Join a running coordinator
    Worker {
        /// Worker id (default: process id)
        #[arg(long)]
        id: Option<i64>,
        /// Pick the initial temperature from the seed table
        #[arg(long, conflicts_with = "initial")]
        class: Option<usize>,
        /// Initial temperature
        #[arg(long, allow_hyphen_values = true)]
        initial: Option<f64>,
    },
    /// Run a coordinator and its workers in this process
    Simulate {
        #[arg(long)]
        workers: Option<usize>,
        /// Initial temperature per worker, in order; the rest follow the seed table
        #[arg(long = "initial", allow_hyphen_values = true)]
        initial: Vec<f64>,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !logged_by_driver(&e) {
                error!("{:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

/// Driver failures were already logged once inside the role span.
fn logged_by_driver(e: &anyhow::Error) -> bool {
    e.downcast_ref::<NodeError>().is_some()
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    let mut cfg = config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = cli.runtime_dir {
        cfg.runtime_dir = dir;
    }
    apply_role_overrides(&mut cfg, &cli.role);
    cfg.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let shutdown = Shutdown::new();
        let signals = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = watch_signals(shutdown).await {
                    warn!(error = %e, "cannot listen for signals");
                }
            }
        });
        let result = run_role(&cfg, cli.role, &shutdown).await;
        signals.abort();
        result
    })
}

fn apply_role_overrides(cfg: &mut Config, role: &Role) {
    match role {
        Role::Coordinator {
            workers,
            seed_estimate,
            tolerance,
            round_timeout_ms,
        } => {
            if let Some(n) = workers {
                cfg.coordinator.workers = *n;
            }
            if let Some(e) = seed_estimate {
                cfg.coordinator.seed_estimate = *e;
            }
            if let Some(t) = tolerance {
                cfg.coordinator.tolerance = *t;
            }
            if round_timeout_ms.is_some() {
                cfg.coordinator.round_timeout_ms = *round_timeout_ms;
            }
        }
        Role::Simulate { workers, .. } => {
            if let Some(n) = workers {
                cfg.coordinator.workers = *n;
            }
        }
        Role::Worker { .. } => {}
    }
}

async fn run_role(cfg: &Config, role: Role, shutdown: &Shutdown) -> Result<()> {
    match role {
        Role::Coordinator { .. } => {
            let hub = SocketHub::new(&cfg.runtime_dir, cfg.queue_capacity);
            info!(dir = %hub.dir().display(), "coordinator channels");
            let settings = cfg.coordinator_settings();
            let outcome = coordinator::run_coordinator(&hub, &settings, shutdown)
                .await
                .map_err(|e| channel_hint(e, hub.dir()))?;
            match outcome {
                RunOutcome::Completed(report) => {
                    for (id, value) in &report.readings {
                        info!(worker = %id, "final reading {:.4}", value);
                    }
                }
                RunOutcome::Interrupted => info!("coordinator stopped by signal"),
            }
        }
        Role::Worker { id, class, initial } => {
            let hub = SocketHub::new(&cfg.runtime_dir, cfg.queue_capacity);
            let id = id.map(WorkerId).unwrap_or_else(WorkerId::from_process);
            let settings = cfg.worker_settings(id, class, initial);
            let outcome = worker::run_worker(&hub, &settings, shutdown)
                .await
                .map_err(|e| channel_hint(e, hub.dir()))?;
            match outcome {
                RunOutcome::Completed(report) => info!(
                    worker = %report.worker_id,
                    rounds = report.rounds,
                    "finished at {:.4}",
                    report.local
                ),
                RunOutcome::Interrupted => info!("worker stopped by signal"),
            }
        }
        Role::Simulate { initial, .. } => {
            let hub = MemoryHub::new(cfg.queue_capacity);
            let workers = (0..cfg.coordinator.workers)
                .map(|i| {
                    cfg.worker_settings(WorkerId(i as i64 + 1), None, initial.get(i).copied())
                })
                .collect();
            if initial.len() > cfg.coordinator.workers {
                warn!(
                    extra = initial.len() - cfg.coordinator.workers,
                    "ignoring extra --initial values"
                );
            }
            let outcome =
                simulate::simulate(hub, cfg.coordinator_settings(), workers, shutdown).await?;
            match outcome {
                RunOutcome::Completed(report) => {
                    println!(
                        "converged after {} rounds: {:.4}",
                        report.coordinator.rounds, report.coordinator.estimate
                    );
                    for w in &report.workers {
                        println!(
                            "  worker {} (index {}): {:.4}",
                            w.worker_id, w.assigned_index, w.local
                        );
                    }
                }
                RunOutcome::Interrupted => info!("simulation stopped by signal"),
            }
        }
    }
    Ok(())
}

fn channel_hint(e: NodeError, dir: &Path) -> NodeError {
    if e.is_fatal_channel() {
        info!(dir = %dir.display(), "every role must share this runtime directory");
    }
    e
}

/// `RUST_LOG` wins when set; otherwise info, or debug with `--debug`.
fn setup_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("tempsync=debug,tempsync_core=debug,warn")
        } else {
            EnvFilter::new("tempsync=info,warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_roles_and_globals() {
        let cli = Cli::try_parse_from([
            "tempsync",
            "--runtime-dir",
            "/tmp/ts",
            "coordinator",
            "--workers",
            "2",
            "--seed-estimate",
            "-3.5",
        ])
        .unwrap();
        assert_eq!(cli.runtime_dir, Some(PathBuf::from("/tmp/ts")));
        let mut cfg = Config::default();
        apply_role_overrides(&mut cfg, &cli.role);
        assert_eq!(cfg.coordinator.workers, 2);
        assert_eq!(cfg.coordinator.seed_estimate, -3.5);

        let cli = Cli::try_parse_from([
            "tempsync", "simulate", "--initial", "10", "--initial", "20", "-d",
        ])
        .unwrap();
        assert!(cli.debug);
        assert!(matches!(
            cli.role,
            Role::Simulate { ref initial, .. } if initial == &vec![10.0, 20.0]
        ));
    }

    #[test]
    fn only_failures_outside_drivers_are_logged_at_exit() {
        let driver = anyhow::Error::new(NodeError::HandshakeTimeout {
            waiting_for: tempsync_core::MessageKind::SynAck,
            attempts: 5,
        });
        assert!(logged_by_driver(&driver));

        let config = anyhow::Error::new(config::ConfigError::Invalid("workers".into()))
            .context("loading configuration");
        assert!(!logged_by_driver(&config));
    }

    #[test]
    fn class_and_initial_conflict() {
        let r = Cli::try_parse_from(["tempsync", "worker", "--class", "1", "--initial", "3"]);
        assert!(r.is_err());
    }
}
