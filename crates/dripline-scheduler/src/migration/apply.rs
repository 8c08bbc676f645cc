//! Writes a [`WorkspacePlan`] inside one transaction.

use dripline_core::error::Result;
use rusqlite::Transaction;

use super::plan::WorkspacePlan;
use crate::persistence::SequenceStore;

/// Steps and definition flags first, then merge-created instances, then
/// instance updates, then tasks (which may point at created instances).
pub fn apply_plan(tx: &Transaction<'_>, plan: &WorkspacePlan) -> Result<()> {
    for change in &plan.sequences {
        if let Some(steps) = &change.new_steps {
            tx.write_steps(&change.after.id, steps)?;
        }
        if change.before != change.after {
            tx.update_sequence(&change.after)?;
        }
    }
    for created in &plan.created {
        tx.insert_instance(&created.instance)?;
    }
    for change in &plan.instances {
        tx.update_instance(&change.after)?;
    }
    for change in &plan.tasks {
        tx.update_task(&change.after)?;
    }
    tracing::debug!(
        "✍️ Workspace {}: wrote {} sequence(s), {} step(s), {} new instance(s), {} instance(s), {} task(s)",
        plan.workspace_id,
        plan.sequences.len(),
        plan.steps_touched(),
        plan.created.len(),
        plan.instances.len(),
        plan.tasks.len()
    );
    Ok(())
}
