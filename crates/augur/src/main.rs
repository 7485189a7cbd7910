//! augur command-line front end.
//!
//! Logs go to stderr; every command prints its result as JSON on stdout.

mod batch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use augur_coordination::ensemble::Orchestrator;
use augur_coordination::events::EventBus;
use augur_coordination::router::{GlobalUpdate, TaskAssignment};
use augur_coordination::{
    AugurConfig, DualVerificationCoordinator, FailoverRouter, RetryingInvoker, TaskKind,
    TaskRouter, TextRequest,
};
use batch::BatchFile;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; without it, built-in presets are enabled by
    /// the API keys present in the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Routing record path (overrides the configuration and AUGUR_ROUTING_PATH)
    #[arg(long, global = true)]
    routing: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile a batch of pre-computed source results
    Run {
        /// Batch file (JSON)
        #[arg(long)]
        batch: PathBuf,

        /// Print progress events to stderr as they happen
        #[arg(long, default_value_t = false)]
        progress: bool,
    },

    /// One routed call for a task type
    Ask {
        task_type: String,
        prompt: String,

        /// Cross-check the answer with a second provider
        #[arg(long, default_value_t = false)]
        verify: bool,
    },

    /// Inspect or change the routing record
    Route {
        #[command(subcommand)]
        action: RouteAction,
    },

    /// List configured providers and the candidate order for a task type
    Providers {
        #[arg(long, default_value = "comprehensive_report")]
        task_type: String,
    },
}

#[derive(Subcommand, Debug)]
enum RouteAction {
    /// Print the routing record and every built-in task's resolution
    Show,

    /// Merge an override for one task type
    Set {
        task_type: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Remove the override for one task type
    Clear { task_type: String },

    /// Merge changes into the global default
    Default {
        #[arg(long)]
        primary: Option<String>,
        /// Comma-separated provider ids
        #[arg(long, value_delimiter = ',')]
        fallback: Option<Vec<String>>,
        #[arg(long)]
        dual: Option<bool>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Restore built-in routing defaults
    Reset,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AugurConfig::load_or_env(args.config.as_deref())
        .context("failed to load configuration")?;
    let routing_path = args.routing.clone().unwrap_or_else(|| config.routing_path());

    let registry = config
        .build_registry()
        .context("failed to build provider registry")?
        .shared();
    let router = TaskRouter::load(&routing_path, registry.clone()).shared();
    let failover = Arc::new(FailoverRouter::new(
        registry.clone(),
        router.clone(),
        RetryingInvoker::new(config.retry.clone()),
    ));

    info!(
        providers = registry.len(),
        enabled = registry.enabled_ids().len(),
        routing = %routing_path.display(),
        "augur starting"
    );

    match args.command {
        Command::Run { batch, progress } => {
            let file = BatchFile::load(&batch)?;
            for source in file.missing_results() {
                warn!(source, "No pre-computed result for task source");
            }

            let bus = EventBus::new().shared();
            if progress {
                let mut events = bus.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = events.recv().await {
                        eprintln!(
                            "[{:>3}%] {:<18} {} {}",
                            event.percent, event.phase, event.source_name, event.detail
                        );
                    }
                });
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling");
                    on_signal.cancel();
                }
            });

            let orchestrator = Orchestrator::from_config(&config, failover, file.catalog())
                .with_event_bus(bus);
            let report = orchestrator
                .run_cancellable(&file.batch, &file.narrative, &cancel)
                .await
                .context("orchestration failed")?;
            print_json(&report)?;
        }

        Command::Ask {
            task_type,
            prompt,
            verify,
        } => {
            if TaskKind::parse(&task_type).is_none() {
                warn!(task_type = %task_type, "Unknown task type, using global routing");
            }
            let request = TextRequest::prompt(prompt);
            if verify {
                let verifier = DualVerificationCoordinator::new(failover, config.verification.clone());
                let response = verifier
                    .call_with_verification(&task_type, &request)
                    .await
                    .context("verified call failed")?;
                print_json(&response)?;
            } else {
                let reply = failover
                    .call(&task_type, &request)
                    .await
                    .context("routed call failed")?;
                print_json(&reply)?;
            }
        }

        Command::Route { action } => {
            match action {
                RouteAction::Show => {}
                RouteAction::Set {
                    task_type,
                    provider,
                    model,
                    max_tokens,
                    temperature,
                } => {
                    let update = TaskAssignment {
                        provider,
                        model,
                        max_tokens,
                        temperature,
                    };
                    router
                        .set_override(&task_type, update)
                        .context("failed to save routing record")?;
                }
                RouteAction::Clear { task_type } => {
                    let removed = router
                        .clear_override(&task_type)
                        .context("failed to save routing record")?;
                    if !removed {
                        warn!(task_type = %task_type, "No override to clear");
                    }
                }
                RouteAction::Default {
                    primary,
                    fallback,
                    dual,
                    timeout_ms,
                    max_retries,
                } => {
                    router
                        .set_global_default(GlobalUpdate {
                            primary_provider: primary,
                            fallback_order: fallback,
                            enable_dual_verification: dual,
                            timeout_ms,
                            max_retries,
                        })
                        .context("failed to save routing record")?;
                }
                RouteAction::Reset => {
                    router
                        .reset_to_default()
                        .context("failed to save routing record")?;
                }
            }

            let resolved: Vec<_> = TaskKind::all()
                .iter()
                .map(|kind| router.resolve(kind.as_str()))
                .collect();
            print_json(&serde_json::json!({
                "path": routing_path,
                "record": router.snapshot(),
                "resolved": resolved,
            }))?;
        }

        Command::Providers { task_type } => {
            print_json(&serde_json::json!({
                "task_type": task_type,
                "candidates": failover.candidate_ids(&task_type),
                "providers": config.providers,
            }))?;
        }
    }

    Ok(())
}
