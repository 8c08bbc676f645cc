//! Replays a rollback artifact: tasks, then merge-created instances, then
//! instances, then sequences and their steps.
//!
//! Each row is restored in its own transaction. A row that fails is logged
//! and reported; the rest still run.

use dripline_core::error::{DriplineError, Result};
use rusqlite::Transaction;

use super::artifact::{InstanceSnapshot, RollbackArtifact, SequenceSnapshot, TaskSnapshot};
use crate::persistence::{DripDb, SequenceStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub section: &'static str,
    pub id: String,
    pub error: String,
}

/// Per-section completion counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub tasks_restored: usize,
    pub instances_deleted: usize,
    pub instances_restored: usize,
    pub sequences_restored: usize,
    pub failures: Vec<RowFailure>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn track(&mut self, section: &'static str, id: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("❌ Rollback {section} {id} failed: {e}");
                self.failures.push(RowFailure {
                    section,
                    id: id.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }
}

pub fn rollback(db: &mut DripDb, artifact: &RollbackArtifact) -> Result<RollbackReport> {
    tracing::info!(
        "⏪ Rolling back run {} ('{}'): {} sequence(s), {} instance(s), {} task(s)",
        artifact.run_id,
        artifact.plan_name,
        artifact.sequences.len(),
        artifact.instances.len(),
        artifact.tasks.len()
    );
    let mut report = RollbackReport::default();

    for snap in &artifact.tasks {
        let result = db.transaction(|tx| restore_task(tx, snap));
        if report.track("task", &snap.task_id, result) {
            report.tasks_restored += 1;
        }
    }

    for snap in &artifact.instances {
        let Some(created) = &snap.created_instance_id else {
            continue;
        };
        let result = db.transaction(|tx| {
            // Tasks the driver made on the merged instance after the run.
            tx.detach_instance_tasks(created)?;
            tx.delete_instance(created)?;
            Ok(())
        });
        if report.track("created instance", created, result) {
            report.instances_deleted += 1;
        }
    }

    for snap in &artifact.instances {
        let result = db.transaction(|tx| restore_instance(tx, snap));
        if report.track("instance", &snap.instance_id, result) {
            report.instances_restored += 1;
        }
    }

    for snap in &artifact.sequences {
        let result = db.transaction(|tx| restore_sequence(tx, snap));
        if report.track("sequence", &snap.sequence_id, result) {
            report.sequences_restored += 1;
        }
    }

    tracing::info!(
        "⏪ Rollback done: {} task(s), {} instance(s) restored, {} created instance(s) removed, {} sequence(s), {} failure(s)",
        report.tasks_restored,
        report.instances_restored,
        report.instances_deleted,
        report.sequences_restored,
        report.failures.len()
    );
    Ok(report)
}

fn restore_task(tx: &Transaction<'_>, snap: &TaskSnapshot) -> Result<()> {
    let mut task = tx
        .get_task(&snap.task_id)?
        .ok_or_else(|| DriplineError::not_found("task", &snap.task_id))?;
    task.instance_id = snap.instance_id.clone();
    task.step_order = snap.step_order;
    task.message = snap.message.clone();
    task.subject = snap.subject.clone();
    tx.update_task(&task)?;
    Ok(())
}

fn restore_instance(tx: &Transaction<'_>, snap: &InstanceSnapshot) -> Result<()> {
    let mut inst = tx
        .get_instance(&snap.instance_id)?
        .ok_or_else(|| DriplineError::not_found("instance", &snap.instance_id))?;
    inst.status = snap.status;
    inst.current_step = snap.current_step;
    inst.next_step_due = snap.next_step_due;
    inst.paused_reason = snap.paused_reason.clone();
    tx.update_instance(&inst)?;
    Ok(())
}

fn restore_sequence(tx: &Transaction<'_>, snap: &SequenceSnapshot) -> Result<()> {
    let mut def = tx
        .get_sequence(&snap.sequence_id)?
        .ok_or_else(|| DriplineError::not_found("sequence", &snap.sequence_id))?;
    def.name = snap.name.clone();
    def.trigger = snap.trigger;
    def.active = snap.active;
    def.updated_at = snap.updated_at;
    tx.update_sequence(&def)?;
    tx.write_steps(&snap.sequence_id, &snap.steps)?;
    Ok(())
}
