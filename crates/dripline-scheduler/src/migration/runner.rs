//! Administrative entry point: run a migration plan over a scope, in dry-run
//! or apply mode, or replay a rollback artifact.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dripline_core::config::MigrationConfig;
use dripline_core::error::{DriplineError, Result};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use super::apply::apply_plan;
use super::artifact::RollbackArtifact;
use super::plan::{MigrationPlanFile, Planner, WorkspacePlan, WorkspaceState};
use super::rollback::{RollbackReport, rollback};
use crate::batch::{BatchBudget, BatchSummary, ItemOutcome};
use crate::leads::LeadDirectory;
use crate::model::{StepDraft, TaskStatus, new_id};
use crate::persistence::{DripDb, SequenceStore};
use crate::store::ArtifactStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationScope {
    All,
    Workspace(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationMode {
    DryRun,
    Apply,
    Rollback { artifact: PathBuf },
}

/// Counts of rows a run touched (or would touch, in dry-run).
#[derive(Debug, Clone, Default)]
pub struct MigrationSummary {
    pub dry_run: bool,
    pub workspaces: BatchSummary,
    pub sequences: usize,
    pub steps: usize,
    pub instances: usize,
    pub created_instances: usize,
    pub tasks: usize,
    pub heuristic_remaps: usize,
    pub conflicts: usize,
    pub artifact: Option<PathBuf>,
    pub budget_exhausted: bool,
}

impl MigrationSummary {
    pub fn total_changes(&self) -> usize {
        self.sequences + self.steps + self.instances + self.created_instances + self.tasks
    }

    fn add(&mut self, plan: &WorkspacePlan) {
        self.sequences += plan.sequences.len();
        self.steps += plan.steps_touched();
        self.instances += plan.instances.len();
        self.created_instances += plan.created.len();
        self.tasks += plan.tasks.len();
        self.heuristic_remaps += plan.heuristic_remaps();
        self.conflicts += plan.conflicts();
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Migrated(MigrationSummary),
    RolledBack(RollbackReport),
}

pub struct MigrationRunner {
    db: Arc<Mutex<DripDb>>,
    leads: Arc<dyn LeadDirectory>,
    store: ArtifactStore,
    config: MigrationConfig,
}

impl MigrationRunner {
    pub fn new(
        db: Arc<Mutex<DripDb>>,
        leads: Arc<dyn LeadDirectory>,
        store: ArtifactStore,
        config: MigrationConfig,
    ) -> Self {
        Self {
            db,
            leads,
            store,
            config,
        }
    }

    /// Run `plan` over `scope`. Apply mode writes each workspace in its own
    /// transaction, after the rows it changes are in the rollback artifact.
    pub async fn run(
        &self,
        plan: &MigrationPlanFile,
        scope: &MigrationScope,
        mode: &MigrationMode,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        let apply = match mode {
            MigrationMode::Rollback { artifact } => {
                return Ok(RunOutcome::RolledBack(self.rollback(artifact).await?));
            }
            MigrationMode::Apply => true,
            MigrationMode::DryRun => false,
        };

        let job = format!("migrate:{}", plan.name);
        let pending: Vec<String> = {
            let db = self.db.lock().await;
            let workspaces = match scope {
                MigrationScope::All => db.list_workspaces()?,
                MigrationScope::Workspace(id) => vec![id.clone()],
            };
            let cursor = if apply { db.get_cursor(&job)? } else { None };
            workspaces
                .into_iter()
                .filter(|ws| cursor.as_deref().is_none_or(|c| ws.as_str() > c))
                .collect()
        };

        tracing::info!(
            "🚚 Migration '{}' ({}) over {} workspace(s)",
            plan.name,
            if apply { "apply" } else { "dry-run" },
            pending.len()
        );

        let budget = BatchBudget::from_secs(self.config.budget_secs);
        let mut summary = MigrationSummary {
            dry_run: !apply,
            ..Default::default()
        };
        let ledger = apply.then(|| Mutex::new(ArtifactLedger::new(RollbackArtifact::new(&new_id("run"), &plan.name, now))));
        let ledger_ref = ledger.as_ref();
        let chunk_size = self.config.workspace_concurrency.max(1);
        let chunks: Vec<&[String]> = pending.chunks(chunk_size).collect();
        // Set once a workspace fails; the cursor must not move past it.
        let mut cursor_held = false;

        for (i, chunk) in chunks.iter().enumerate() {
            let results: Vec<(String, Result<WorkspacePlan>)> = stream::iter(chunk.iter().cloned())
                .map(|ws| async move {
                    let result = self
                        .migrate_workspace(&ws, ledger_ref, now, |p| p.run_file(plan))
                        .await;
                    (ws, result)
                })
                .buffer_unordered(chunk_size)
                .collect()
                .await;

            let mut failed = HashSet::new();
            for (ws, result) in results {
                match result {
                    Ok(ws_plan) if ws_plan.is_empty() => {
                        summary.workspaces.record(&ws, ItemOutcome::Skipped);
                    }
                    Ok(ws_plan) => {
                        summary.add(&ws_plan);
                        summary.workspaces.record(&ws, ItemOutcome::Done);
                    }
                    Err(e @ DriplineError::Artifact(_)) => {
                        if let Some(path) = ledger_path(ledger_ref).await {
                            tracing::error!("❌ Rollback artifact unwritable; rows migrated so far are recorded in {}", path.display());
                        }
                        return Err(e);
                    }
                    Err(e) => {
                        summary.workspaces.record(&ws, ItemOutcome::Fatal(e.to_string()));
                        failed.insert(ws);
                    }
                }
            }

            if apply && !cursor_held {
                let mut reached = None;
                for ws in chunk.iter() {
                    if failed.contains(ws) {
                        cursor_held = true;
                        tracing::warn!("⚠️ Workspace {ws} failed; the cursor stays before it so a re-run retries it");
                        break;
                    }
                    reached = Some(ws);
                }
                if let Some(ws) = reached {
                    self.db.lock().await.set_cursor(&job, ws)?;
                }
            }

            if i + 1 < chunks.len() && budget.exhausted() {
                tracing::warn!("⏳ Migration budget spent; re-run to continue after {:?}", chunk.last());
                summary.budget_exhausted = true;
                break;
            }
        }

        if apply && !summary.budget_exhausted {
            self.db.lock().await.clear_cursor(&job)?;
        }
        summary.artifact = ledger_path(ledger_ref).await;

        tracing::info!(
            "🚚 Migration '{}' {}: {} sequence(s), {} step(s), {} instance(s) (+{} created), {} task(s), {} heuristic remap(s), {} conflict(s), {} workspace failure(s)",
            plan.name,
            if apply { "applied" } else { "planned" },
            summary.sequences,
            summary.steps,
            summary.instances,
            summary.created_instances,
            summary.tasks,
            summary.heuristic_remaps,
            summary.conflicts,
            summary.workspaces.failed
        );
        Ok(RunOutcome::Migrated(summary))
    }

    /// Replace the steps of one definition and remap everything on it.
    pub async fn migrate_sequence(
        &self,
        sequence_id: &str,
        drafts: &[StepDraft],
        apply: bool,
        now: DateTime<Utc>,
    ) -> Result<MigrationSummary> {
        let workspace_id = {
            let db = self.db.lock().await;
            db.get_sequence(sequence_id)?
                .ok_or_else(|| DriplineError::not_found("sequence", sequence_id))?
                .workspace_id
        };

        let ledger = apply.then(|| {
            Mutex::new(ArtifactLedger::new(RollbackArtifact::new(
                &new_id("run"),
                &format!("sequence:{sequence_id}"),
                now,
            )))
        });
        let plan = self
            .migrate_workspace(&workspace_id, ledger.as_ref(), now, |mut p| {
                p.canonical(sequence_id, drafts)?;
                Ok(p.finish())
            })
            .await?;

        let mut summary = MigrationSummary {
            dry_run: !apply,
            artifact: ledger_path(ledger.as_ref()).await,
            ..Default::default()
        };
        summary.add(&plan);
        summary.workspaces.record(
            &workspace_id,
            if plan.is_empty() {
                ItemOutcome::Skipped
            } else {
                ItemOutcome::Done
            },
        );
        Ok(summary)
    }

    /// Replay an artifact. A clean rollback marks it consumed; one with row
    /// failures stays replayable once the rows are repaired.
    pub async fn rollback(&self, path: &Path) -> Result<RollbackReport> {
        let artifact = ArtifactStore::load(path)?;
        let report = {
            let mut db = self.db.lock().await;
            rollback(&mut db, &artifact)?
        };
        if report.is_clean() {
            ArtifactStore::mark_consumed(path)?;
        } else {
            tracing::warn!(
                "⚠️ Rollback left {} row(s) unrestored; artifact {} kept",
                report.failures.len(),
                path.display()
            );
        }
        Ok(report)
    }

    /// Plan one workspace. With a ledger (apply mode) the prior state is
    /// written to the artifact first, then the plan is committed.
    async fn migrate_workspace<F>(
        &self,
        workspace_id: &str,
        ledger: Option<&Mutex<ArtifactLedger>>,
        now: DateTime<Utc>,
        build: F,
    ) -> Result<WorkspacePlan>
    where
        F: FnOnce(Planner) -> Result<WorkspacePlan>,
    {
        let lead_fields = self.lead_fields(workspace_id).await?;

        let mut db = self.db.lock().await;
        let mut state = WorkspaceState::load(&db, workspace_id)?;
        state.lead_fields = lead_fields;
        let plan = build(Planner::new(
            state,
            now,
            Duration::seconds(self.config.due_buffer_secs),
        ))?;

        let Some(ledger) = ledger.filter(|_| !plan.is_empty()) else {
            return Ok(plan);
        };
        // The db guard is held until commit, so the recorded rows cannot
        // change between the artifact write and the transaction.
        let mut ledger = ledger.lock().await;
        let previous = self.record_before_apply(&mut ledger, &plan)?;
        if let Err(e) = db.transaction(|tx| apply_plan(tx, &plan)) {
            ledger.artifact = previous;
            if let Err(restore) = self.persist(&mut ledger) {
                tracing::warn!("⚠️ Artifact still lists unapplied workspace {workspace_id}: {restore}");
            }
            return Err(e);
        }
        tracing::info!(
            "✅ Workspace {}: {} instance(s), {} task(s) migrated",
            workspace_id,
            plan.instances.len() + plan.created.len(),
            plan.tasks.len()
        );
        Ok(plan)
    }

    /// Template fields of every lead with a pending task in the workspace.
    /// A lead that cannot be read keeps its current task text.
    async fn lead_fields(&self, workspace_id: &str) -> Result<HashMap<String, HashMap<String, String>>> {
        let lead_ids: Vec<String> = {
            let db = self.db.lock().await;
            let mut ids: Vec<String> = db
                .list_workspace_tasks(workspace_id, TaskStatus::Pending)?
                .into_iter()
                .map(|t| t.lead_id)
                .collect();
            ids.sort();
            ids.dedup();
            ids
        };

        let fetched: Vec<(String, Result<HashMap<String, String>>)> = stream::iter(lead_ids)
            .map(|id| async move {
                let result = self.leads.snapshot(&id).await.map(|l| l.fields);
                (id, result)
            })
            .buffer_unordered(self.config.lead_concurrency.max(1))
            .collect()
            .await;

        let mut fields = HashMap::new();
        for (id, result) in fetched {
            match result {
                Ok(f) => {
                    fields.insert(id, f);
                }
                Err(e) => tracing::warn!("⚠️ Lead {id} unavailable, task text kept: {e}"),
            }
        }
        Ok(fields)
    }

    /// Add `plan` to the artifact and write it. Returns the artifact as it
    /// was before, which is also what stays in memory if the write fails.
    fn record_before_apply(&self, ledger: &mut ArtifactLedger, plan: &WorkspacePlan) -> Result<RollbackArtifact> {
        let previous = ledger.artifact.clone();
        ledger.artifact.record(plan);
        if let Err(e) = self.persist(ledger) {
            ledger.artifact = previous;
            return Err(DriplineError::Artifact(format!(
                "write rollback artifact for workspace {}: {e}",
                plan.workspace_id
            )));
        }
        Ok(previous)
    }

    fn persist(&self, ledger: &mut ArtifactLedger) -> Result<()> {
        if let Some(existing) = &ledger.path {
            self.store.update(existing, &ledger.artifact)?;
        } else if !ledger.artifact.is_empty() {
            ledger.path = Some(self.store.save(&ledger.artifact)?);
        }
        Ok(())
    }
}

/// Artifact of an apply run and the file it was last written to.
struct ArtifactLedger {
    artifact: RollbackArtifact,
    path: Option<PathBuf>,
}

impl ArtifactLedger {
    fn new(artifact: RollbackArtifact) -> Self {
        Self { artifact, path: None }
    }
}

async fn ledger_path(ledger: Option<&Mutex<ArtifactLedger>>) -> Option<PathBuf> {
    match ledger {
        Some(ledger) => ledger.lock().await.path.clone(),
        None => None,
    }
}
