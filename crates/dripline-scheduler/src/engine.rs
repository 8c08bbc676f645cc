//! Due-instance driver — the periodic pass that fires due waves.
//! Uses tokio::interval for ticking; each tick is a bounded batch job that
//! resumes from a stored cursor when its wall-clock budget runs out.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dripline_core::config::DriverConfig;
use dripline_core::error::Result;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::batch::{BatchBudget, BatchSummary, ItemOutcome};
use crate::dispatch::{Dispatcher, OutboundMessage};
use crate::leads::LeadDirectory;
use crate::lifecycle;
use crate::model::{Instance, InstanceStatus, LeadSnapshot, PendingTask, Step, TaskStatus, new_id};
use crate::persistence::{self, DripDb, SequenceStore};
use crate::render::{render, render_opt};

/// Cursor key of the driver in `batch_cursors`.
pub const DRIVER_JOB: &str = "driver";

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub instances: BatchSummary,
    pub tasks_created: usize,
    pub sent: usize,
    pub send_failed: usize,
    /// The budget ran out before the scan finished; the cursor is kept.
    pub budget_exhausted: bool,
}

/// Task materialized for one fired step.
pub fn task_for_step(
    instance: &Instance,
    step: &Step,
    lead: &LeadSnapshot,
    due_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> PendingTask {
    PendingTask {
        id: new_id("task"),
        instance_id: Some(instance.id.clone()),
        step_order: Some(step.order),
        lead_id: instance.lead_id.clone(),
        workspace_id: instance.workspace_id.clone(),
        channel: step.channel,
        status: if step.requires_approval {
            TaskStatus::Pending
        } else {
            TaskStatus::Queued
        },
        message: render(&step.message, &lead.fields),
        subject: render_opt(step.subject.as_deref(), &lead.fields),
        due_at,
        created_at: now,
        sent_at: None,
        error: None,
    }
}

/// Advance one instance and persist the result atomically.
///
/// Returns the number of tasks created, or `None` when the instance was not
/// due or another writer moved it first.
pub fn advance_instance(
    db: &mut DripDb,
    instance: &Instance,
    lead: &LeadSnapshot,
    now: DateTime<Utc>,
) -> Result<Option<usize>> {
    let steps = db.load_steps(&instance.sequence_id)?;
    let Some(adv) = lifecycle::advance(instance, &steps, &lead.capabilities, now) else {
        return Ok(None);
    };

    let due_at = instance.next_step_due.unwrap_or(now);
    let tasks: Vec<PendingTask> = adv
        .fired
        .iter()
        .map(|step| task_for_step(instance, step, lead, due_at, now))
        .collect();

    let committed =
        db.transaction(|tx| persistence::commit_advance(tx, instance, &adv.instance, &tasks))?;
    if !committed {
        tracing::debug!("🔁 Instance {} already advanced elsewhere", instance.id);
        return Ok(None);
    }

    if adv.skipped() {
        tracing::info!(
            "⏭️ Instance {} skipped wave ending at step {} (no eligible step)",
            instance.id,
            adv.wave_end
        );
    } else {
        tracing::info!(
            "📨 Instance {} fired {} step(s) up to step {}",
            instance.id,
            tasks.len(),
            adv.wave_end
        );
    }
    if adv.instance.status == InstanceStatus::Completed {
        tracing::info!("🏁 Instance {} completed", instance.id);
    }
    Ok(Some(tasks.len()))
}

/// Scans due instances, advances them, flushes the outbox.
pub struct DueDriver {
    db: Arc<Mutex<DripDb>>,
    leads: Arc<dyn LeadDirectory>,
    dispatcher: Arc<dyn Dispatcher>,
    config: DriverConfig,
}

impl DueDriver {
    pub fn new(
        db: Arc<Mutex<DripDb>>,
        leads: Arc<dyn LeadDirectory>,
        dispatcher: Arc<dyn Dispatcher>,
        config: DriverConfig,
    ) -> Self {
        Self {
            db,
            leads,
            dispatcher,
            config,
        }
    }

    /// One driver pass at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let budget = BatchBudget::from_secs(self.config.budget_secs);
        let limit = self.config.batch_size.max(1);
        let mut report = TickReport::default();

        loop {
            let batch = {
                let db = self.db.lock().await;
                let cursor = db.get_cursor(DRIVER_JOB)?;
                db.due_instances(now, cursor.as_deref(), limit)?
            };
            let Some(last_id) = batch.last().map(|i| i.id.clone()) else {
                self.db.lock().await.clear_cursor(DRIVER_JOB)?;
                break;
            };
            let full = batch.len() >= limit;

            let outcomes: Vec<(String, ItemOutcome, usize)> = stream::iter(batch)
                .map(|instance| async move {
                    let id = instance.id.clone();
                    let (outcome, created) = self.process_instance(instance, now).await;
                    (id, outcome, created)
                })
                .buffer_unordered(self.config.lead_concurrency.max(1))
                .collect()
                .await;

            for (id, outcome, created) in outcomes {
                report.tasks_created += created;
                report.instances.record(&id, outcome);
            }

            {
                let db = self.db.lock().await;
                if full {
                    db.set_cursor(DRIVER_JOB, &last_id)?;
                } else {
                    db.clear_cursor(DRIVER_JOB)?;
                }
            }
            if !full {
                break;
            }
            if budget.exhausted() {
                tracing::warn!("⏳ Driver budget spent, resuming after {last_id} next tick");
                report.budget_exhausted = true;
                break;
            }
        }

        let (sent, failed) = self.flush_outbox(now).await?;
        report.sent = sent;
        report.send_failed = failed;

        tracing::info!(
            "⏰ Tick done: {} advanced, {} skipped, {} failed, {} task(s) created, {} sent",
            report.instances.processed,
            report.instances.skipped,
            report.instances.failed,
            report.tasks_created,
            report.sent
        );
        Ok(report)
    }

    async fn process_instance(&self, instance: Instance, now: DateTime<Utc>) -> (ItemOutcome, usize) {
        let lead = match self.leads.snapshot(&instance.lead_id).await {
            Ok(lead) => lead,
            Err(e) => {
                return (
                    ItemOutcome::Recoverable(format!("lead {}: {e}", instance.lead_id)),
                    0,
                );
            }
        };

        let mut db = self.db.lock().await;
        match advance_instance(&mut db, &instance, &lead, now) {
            Ok(Some(created)) => (ItemOutcome::Done, created),
            Ok(None) => (ItemOutcome::Skipped, 0),
            Err(e) => (ItemOutcome::Fatal(e.to_string()), 0),
        }
    }

    /// Send queued tasks. Returns `(sent, failed)`.
    ///
    /// Tasks claimed longer than `sending_timeout_secs` ago are queued again
    /// first; a crash between send and record can therefore send twice.
    pub async fn flush_outbox(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let queued = {
            let db = self.db.lock().await;
            let stale = now - Duration::seconds(self.config.sending_timeout_secs);
            let reclaimed = db.reclaim_stale_sending(stale)?;
            if reclaimed > 0 {
                tracing::warn!("♻️ {reclaimed} task(s) stuck in sending were queued again");
            }
            db.queued_tasks(self.config.batch_size.max(1))?
        };
        if queued.is_empty() {
            return Ok((0, 0));
        }

        let results: Vec<(String, Result<Option<bool>>)> = stream::iter(queued)
            .map(|task| async move {
                let id = task.id.clone();
                (id, self.deliver(task, now).await)
            })
            .buffer_unordered(self.config.lead_concurrency.max(1))
            .collect()
            .await;

        let mut sent = 0;
        let mut failed = 0;
        for (id, result) in results {
            match result {
                Ok(Some(true)) => sent += 1,
                Ok(Some(false)) => failed += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("❌ Task {id} could not be delivered: {e}");
                    failed += 1;
                }
            }
        }
        Ok((sent, failed))
    }

    /// Claim, send, record. `None` when another flush claimed the task first.
    async fn deliver(&self, task: PendingTask, now: DateTime<Utc>) -> Result<Option<bool>> {
        let claimed = {
            let db = self.db.lock().await;
            db.claim_task(&task.id, now)?
        };
        if !claimed {
            return Ok(None);
        }

        let result = self.dispatcher.send(&OutboundMessage::from(&task)).await;
        let db = self.db.lock().await;
        match result {
            Ok(()) => {
                db.finish_task(&task.id, Ok(now))?;
                Ok(Some(true))
            }
            Err(e) => {
                tracing::warn!("⚠️ Task {} via {} failed: {e}", task.id, self.dispatcher.name());
                db.finish_task(&task.id, Err(e.to_string()))?;
                Ok(Some(false))
            }
        }
    }
}

/// Spawn the driver loop as a background tokio task.
pub async fn spawn_driver(driver: Arc<DueDriver>, check_interval_secs: u64) {
    tracing::info!("⏰ Driver started (check every {}s)", check_interval_secs);

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(check_interval_secs));

    loop {
        interval.tick().await;
        if let Err(e) = driver.tick(Utc::now()).await {
            tracing::error!("❌ Driver tick failed: {e}");
        }
    }
}
