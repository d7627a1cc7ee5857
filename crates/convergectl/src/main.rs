use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use converge::db::default_database_path;
use converge::{
    load_config, Controller, ControllerConfig, CycleOutcome, Database, InMemoryProvider, StatusReport,
    SyncOptions,
};

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "GitOps reconciliation controller")]
struct Cli {
    /// Controller config file
    #[arg(short, long, env = "CONVERGE_CONFIG", default_value = "converge.yaml", global = true)]
    config: PathBuf,

    /// State database, overriding the config file
    #[arg(long, env = "CONVERGE_DATABASE", global = true)]
    database: Option<PathBuf>,

    /// JSON file holding the sandbox cluster the controller manages
    #[arg(long = "cluster-state", env = "CONVERGE_CLUSTER_STATE", global = true)]
    cluster_state: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run,
    /// Show application status
    Status {
        /// Only this application
        #[arg(long = "app")]
        application: Option<String>,
    },
    /// Run one manual sync and wait for it
    Sync {
        #[arg(long = "app")]
        application: String,
        /// Only compute the planned actions
        #[arg(long)]
        dry_run: bool,
    },
    /// Override the sync policy of an application
    SetAutoSync {
        #[arg(long = "app")]
        application: String,
        /// Enable or disable auto-sync
        #[arg(long, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
        enabled: bool,
        /// Delete owned resources that are no longer declared
        #[arg(long)]
        prune: bool,
    },
}

fn init_tracing() -> Result<()> {
    let env = std::env::var("CONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install tracing subscriber")?;
    // The library logs through `log`; route those records into tracing.
    tracing_log::LogTracer::init().context("Failed to bridge log records")?;
    Ok(())
}

struct Runtime {
    config: ControllerConfig,
    controller: Controller,
    cluster: Arc<InMemoryProvider>,
    cluster_path: PathBuf,
}

impl Runtime {
    fn open(cli: &Cli) -> Result<Self> {
        let config = load_config(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?;

        let db_path = cli
            .database
            .clone()
            .or_else(|| config.database_path())
            .or_else(default_database_path)
            .ok_or_else(|| anyhow!("No database path configured and no home directory found"))?;
        let db = Database::open(&db_path).with_context(|| format!("Failed to open {}", db_path.display()))?;

        let cluster_path = match &cli.cluster_state {
            Some(path) => path.clone(),
            None => db_path.with_file_name("cluster.json"),
        };
        let cluster = Arc::new(
            InMemoryProvider::load_from(&cluster_path)
                .with_context(|| format!("Failed to load cluster state {}", cluster_path.display()))?,
        );

        let controller = Controller::from_config(&config, db, cluster.clone())?;
        Ok(Self {
            config,
            controller,
            cluster,
            cluster_path,
        })
    }

    fn save_cluster(&self) -> Result<()> {
        self.cluster
            .save_to(&self.cluster_path)
            .with_context(|| format!("Failed to save cluster state {}", self.cluster_path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let runtime = Runtime::open(&cli)?;
    match &cli.command {
        Commands::Run => run(&runtime).await,
        Commands::Status { application } => {
            let reports = match application {
                Some(name) => vec![runtime.controller.status(name)?],
                None => runtime.controller.statuses()?,
            };
            print_statuses(&reports, cli.output)
        }
        Commands::Sync { application, dry_run } => {
            let outcome = runtime
                .controller
                .sync_now(application, SyncOptions { dry_run: *dry_run })
                .await?;
            if !dry_run {
                runtime.save_cluster()?;
            }
            print_outcome(&outcome, cli.output)
        }
        Commands::SetAutoSync {
            application,
            enabled,
            prune,
        } => {
            let report = runtime.controller.set_auto_sync(application, *enabled, *prune)?;
            print_statuses(&[report], cli.output)
        }
    }
}

async fn run(runtime: &Runtime) -> Result<()> {
    tracing::info!(
        applications = runtime.config.applications.len(),
        interval_secs = runtime.config.reconcile_interval_secs,
        "starting controller"
    );
    runtime.controller.start();

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    runtime.controller.shutdown().await;
    runtime.save_cluster()?;
    tracing::info!(path = %runtime.cluster_path.display(), "cluster state saved");
    Ok(())
}

fn print_statuses(reports: &[StatusReport], output: Output) -> Result<()> {
    if output == Output::Json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<10} {:<14} {:<9} MESSAGE",
        "APPLICATION", "SYNC", "HEALTH", "REVISION", "AUTOSYNC"
    );
    for report in reports {
        let revision = report
            .last_applied_revision
            .as_ref()
            .map(|r| r.short().to_string())
            .unwrap_or_else(|| "-".to_string());
        let message = report
            .last_error
            .as_deref()
            .or(report.message.as_deref())
            .unwrap_or("");
        println!(
            "{:<20} {:<12} {:<10} {:<14} {:<9} {}",
            report.application,
            report.sync_status.to_string(),
            report.health_status.to_string(),
            revision,
            format!("{} ({})", report.policy.auto_sync, report.policy_source),
            message
        );
        for rollout in &report.rollouts {
            println!(
                "  rollout {}: {}/{} updated, {} ready",
                rollout.reference, rollout.updated_replicas, rollout.desired_replicas, rollout.ready_replicas
            );
        }
    }
    Ok(())
}

fn print_outcome(outcome: &CycleOutcome, output: Output) -> Result<()> {
    if output == Output::Json {
        let value = serde_json::json!({
            "revision": outcome.revision,
            "dryRun": outcome.dry_run,
            "drift": outcome.drift,
            "plan": outcome.plan,
            "result": outcome.result,
            "status": outcome.status,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Revision {}", outcome.revision.short());
    if outcome.drift.is_empty() {
        println!("No drift.");
    }
    for action in &outcome.plan {
        match &action.reason {
            Some(reason) => println!("  {:<8} {} ({})", action.action.to_string(), action.reference, reason),
            None => println!("  {:<8} {}", action.action.to_string(), action.reference),
        }
    }
    if let Some(result) = &outcome.result {
        println!("Applied {} action(s)", result.applied_count());
        for failure in &result.failures {
            println!("  failed {}: {}", failure.reference, failure.message);
        }
    }
    if !outcome.dry_run {
        println!("Status: {}", outcome.status.summary());
    }
    Ok(())
}
