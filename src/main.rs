//! # Dripline: operator CLI
//!
//! Usage:
//!   dripline tick                                  # One driver pass
//!   dripline run                                   # Driver loop (driver.interval_secs)
//!   dripline start --lead L --sequence S           # Start a sequence for a lead
//!   dripline pause <instance> [--reason R]
//!   dripline migrate --plan plan.toml --mode apply # Renumber / merge live sequences
//!   dripline rollback --artifact rollback-….json   # Undo a migration run

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use dripline_core::DriplineConfig;
use dripline_core::config::expand_path;
use dripline_scheduler::migration::{
    MigrationMode, MigrationPlanFile, MigrationRunner, MigrationScope, MigrationSummary,
    RollbackReport, RunOutcome,
};
use dripline_scheduler::{
    ArtifactStore, DbLeadDirectory, DripDb, DueDriver, SequenceService, Started, dispatch,
    spawn_driver,
};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "dripline",
    version,
    about = "💧 Dripline: follow-up sequence scheduler"
)]
struct Cli {
    /// Config file (default: ~/.dripline/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overrides [database] path
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one driver pass and exit
    Tick,
    /// Run the driver every `driver.interval_secs` until Ctrl-C
    Run,
    /// Start a sequence for a lead
    Start {
        #[arg(long)]
        lead: String,
        #[arg(long)]
        sequence: String,
    },
    /// Pause an active instance
    Pause {
        instance: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Resume a paused instance
    Resume { instance: String },
    /// Cancel an instance
    Cancel {
        instance: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Approve a pending task for sending
    Approve { task: String },
    /// Dismiss a pending task
    Dismiss { task: String },
    /// Run a migration plan
    Migrate {
        /// TOML plan file
        #[arg(long)]
        plan: PathBuf,
        /// Limit to one workspace
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long, value_enum, default_value_t = Mode::DryRun)]
        mode: Mode,
    },
    /// Replay a rollback artifact
    Rollback {
        #[arg(long)]
        artifact: PathBuf,
    },
    /// List rollback artifacts not yet replayed
    Artifacts,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    DryRun,
    Apply,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "dripline=debug,dripline_scheduler=debug"
    } else {
        "dripline=info,dripline_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => DriplineConfig::load_from(path)?,
        None => DriplineConfig::load()?,
    };

    let db_path = expand_path(cli.db.as_deref().unwrap_or(&config.database.path));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(Mutex::new(DripDb::open(&db_path)?));
    tracing::debug!("🗄️ Database: {}", db_path.display());

    let service = SequenceService::new(db.clone());
    let artifact_dir = expand_path(&config.migration.artifact_dir);

    match cli.command {
        Command::Tick => {
            let driver = build_driver(&db, &config);
            let report = driver.tick(Utc::now()).await?;
            println!("⏰ Tick complete");
            println!("   Advanced:      {}", report.instances.processed);
            println!("   Skipped:       {}", report.instances.skipped);
            println!("   Failed:        {}", report.instances.failed);
            println!("   Tasks created: {}", report.tasks_created);
            println!("   Sent:          {} ({} failed)", report.sent, report.send_failed);
            if report.budget_exhausted {
                println!("   ⏳ Budget spent, the next tick continues from the cursor");
            }
        }
        Command::Run => {
            let driver = Arc::new(build_driver(&db, &config));
            println!("💧 Dripline driver v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database: {}", db_path.display());
            println!("   ⏱️  Interval: {}s", config.driver.interval_secs);
            tokio::select! {
                _ = spawn_driver(driver, config.driver.interval_secs.max(1)) => {}
                _ = tokio::signal::ctrl_c() => println!("👋 Stopping driver"),
            }
        }
        Command::Start { lead, sequence } => match service.start(&lead, &sequence, Utc::now()).await? {
            Started::Created(inst) => println!(
                "🚀 Started {} for lead {} (next due {})",
                inst.id,
                lead,
                inst.next_step_due
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_else(|| "never".into())
            ),
            Started::Existing(inst) => {
                println!("↩️ Lead {} already has {} ({})", lead, inst.id, inst.status)
            }
        },
        Command::Pause { instance, reason } => {
            let inst = service.pause(&instance, reason.as_deref()).await?;
            println!("⏸️ {} paused ({})", inst.id, inst.paused_reason.unwrap_or_default());
        }
        Command::Resume { instance } => {
            let inst = service.resume(&instance).await?;
            println!("▶️ {} resumed", inst.id);
        }
        Command::Cancel { instance, reason } => {
            let inst = service.cancel(&instance, reason.as_deref()).await?;
            println!("🛑 {} cancelled", inst.id);
        }
        Command::Approve { task } => {
            service.approve_task(&task).await?;
            println!("✅ {task} queued for sending");
        }
        Command::Dismiss { task } => {
            service.dismiss_task(&task).await?;
            println!("🗑️ {task} dismissed");
        }
        Command::Migrate { plan, workspace, mode } => {
            let text = std::fs::read_to_string(&plan)
                .with_context(|| format!("read plan {}", plan.display()))?;
            let plan_file: MigrationPlanFile =
                toml::from_str(&text).with_context(|| format!("parse plan {}", plan.display()))?;
            let scope = match workspace {
                Some(id) => MigrationScope::Workspace(id),
                None => MigrationScope::All,
            };
            let mode = match mode {
                Mode::DryRun => MigrationMode::DryRun,
                Mode::Apply => MigrationMode::Apply,
            };
            let runner = build_runner(&db, ArtifactStore::new(&artifact_dir)?, &config);
            match runner.run(&plan_file, &scope, &mode, Utc::now()).await? {
                RunOutcome::Migrated(summary) => print_summary(&plan_file.name, &summary),
                RunOutcome::RolledBack(report) => print_rollback(&report),
            }
        }
        Command::Rollback { artifact } => {
            let runner = build_runner(&db, ArtifactStore::new(&artifact_dir)?, &config);
            let report = runner.rollback(&artifact).await?;
            print_rollback(&report);
            if !report.is_clean() {
                anyhow::bail!("{} row(s) could not be restored", report.failures.len());
            }
        }
        Command::Artifacts => {
            let store = ArtifactStore::new(&artifact_dir)?;
            let files = store.list();
            if files.is_empty() {
                println!("📦 No rollback artifacts in {}", store.dir().display());
            }
            for file in files {
                println!("📦 {}", file.display());
            }
        }
    }

    Ok(())
}

fn build_driver(db: &Arc<Mutex<DripDb>>, config: &DriplineConfig) -> DueDriver {
    DueDriver::new(
        db.clone(),
        Arc::new(DbLeadDirectory::new(db.clone())),
        Arc::from(dispatch::from_config(&config.dispatch)),
        config.driver.clone(),
    )
}

fn build_runner(db: &Arc<Mutex<DripDb>>, store: ArtifactStore, config: &DriplineConfig) -> MigrationRunner {
    MigrationRunner::new(
        db.clone(),
        Arc::new(DbLeadDirectory::new(db.clone())),
        store,
        config.migration.clone(),
    )
}

fn print_summary(name: &str, s: &MigrationSummary) {
    if s.dry_run {
        println!("🔎 Migration '{name}' (dry-run, nothing written)");
    } else {
        println!("🚚 Migration '{name}' applied");
    }
    println!("   Workspaces:       {} changed, {} unchanged, {} failed", s.workspaces.processed, s.workspaces.skipped, s.workspaces.failed);
    println!("   Sequences:        {}", s.sequences);
    println!("   Steps:            {}", s.steps);
    println!("   Instances:        {} (+{} created by merge)", s.instances, s.created_instances);
    println!("   Tasks:            {}", s.tasks);
    println!("   Heuristic remaps: {}", s.heuristic_remaps);
    println!("   Merge conflicts:  {}", s.conflicts);
    for err in &s.workspaces.errors {
        println!("   ❌ {}: {}", err.id, err.message);
    }
    if let Some(path) = &s.artifact {
        println!("   💾 Rollback artifact: {}", path.display());
    }
    if s.budget_exhausted {
        println!("   ⏳ Budget spent; re-run the same command to continue");
    }
    if s.total_changes() == 0 {
        println!("   ✔️ Nothing to change");
    }
}

fn print_rollback(report: &RollbackReport) {
    println!("⏪ Rollback");
    println!("   Tasks restored:             {}", report.tasks_restored);
    println!("   Merge instances removed:    {}", report.instances_deleted);
    println!("   Instances restored:         {}", report.instances_restored);
    println!("   Sequences restored:         {}", report.sequences_restored);
    for f in &report.failures {
        println!("   ❌ {} {}: {}", f.section, f.id, f.error);
    }
}
