//! Pre-migration state of every row a run touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::WorkspacePlan;
use crate::model::{InstanceStatus, Step, TriggerType};

pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackArtifact {
    pub version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub plan_name: String,
    pub sequences: Vec<SequenceSnapshot>,
    pub instances: Vec<InstanceSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub sequence_id: String,
    pub name: String,
    pub workspace_id: String,
    pub trigger: TriggerType,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
    /// Full prior step list, ids included.
    pub steps: Vec<Step>,
    #[serde(default)]
    pub deleted_step_ids: Vec<String>,
    #[serde(default)]
    pub created_step_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub lead_id: String,
    pub sequence_id: String,
    pub status: InstanceStatus,
    pub current_step: u32,
    pub next_step_due: Option<DateTime<Utc>>,
    pub paused_reason: Option<String>,
    /// Instance created on the merge target; deleted on rollback.
    #[serde(default)]
    pub created_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub instance_id: Option<String>,
    pub step_order: Option<u32>,
    pub message: String,
    pub subject: Option<String>,
}

impl RollbackArtifact {
    pub fn new(run_id: &str, plan_name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            run_id: run_id.to_string(),
            created_at,
            plan_name: plan_name.to_string(),
            sequences: Vec::new(),
            instances: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Add the prior state of every row in `plan`.
    pub fn record(&mut self, plan: &WorkspacePlan) {
        for change in &plan.sequences {
            let before = &change.before;
            self.sequences.push(SequenceSnapshot {
                sequence_id: before.id.clone(),
                name: before.name.clone(),
                workspace_id: before.workspace_id.clone(),
                trigger: before.trigger,
                active: before.active,
                updated_at: before.updated_at,
                steps: change.prior_steps.clone(),
                deleted_step_ids: change.deleted_step_ids(),
                created_step_ids: change.created_step_ids(),
            });
        }

        for change in &plan.instances {
            let before = &change.before;
            let created_instance_id = plan
                .created
                .iter()
                .find(|c| c.merged_from == before.id)
                .map(|c| c.instance.id.clone());
            self.instances.push(InstanceSnapshot {
                instance_id: before.id.clone(),
                lead_id: before.lead_id.clone(),
                sequence_id: before.sequence_id.clone(),
                status: before.status,
                current_step: before.current_step,
                next_step_due: before.next_step_due,
                paused_reason: before.paused_reason.clone(),
                created_instance_id,
            });
        }

        for change in &plan.tasks {
            let before = &change.before;
            self.tasks.push(TaskSnapshot {
                task_id: before.id.clone(),
                instance_id: before.instance_id.clone(),
                step_order: before.step_order,
                message: before.message.clone(),
                subject: before.subject.clone(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty() && self.instances.is_empty() && self.tasks.is_empty()
    }
}
