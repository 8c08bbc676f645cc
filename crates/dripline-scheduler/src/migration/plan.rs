//! Computes every row change of a migration without
//! writing anything.
//!
//! Planning runs over an in-memory [`WorkspaceState`] and mutates it as it
//! goes, so later steps of the same plan (merges after canonicalization) see
//! the earlier results. The resulting [`WorkspacePlan`] is what dry-run
//! reports, what apply writes, and what the rollback artifact is built from.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dripline_core::error::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::correspondence::{Correspondence, Mapping, canonicalize, reuse_ids};
use crate::lifecycle::due_for_position;
use crate::model::{
    Instance, InstanceStatus, PendingTask, SequenceDefinition, Step, StepDraft, TaskStatus,
    TriggerType, new_id,
};
use crate::persistence::SequenceStore;
use crate::render::{render, render_opt};
use crate::schedule::{step_by_order, wave_end};

/// Cancel reason of a retiring instance folded into its target.
pub const MERGE_CANCEL_REASON: &str = "migrated_to_target";

// ─── Plan file ───────────────────────────────────────────────

/// Operator-supplied migration, read from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlanFile {
    pub name: String,
    #[serde(default)]
    pub canonical: Vec<CanonicalRewrite>,
    #[serde(default)]
    pub merge: Vec<MergeRule>,
}

/// New step list for every active definition with `trigger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRewrite {
    pub trigger: TriggerType,
    pub steps: Vec<StepDraft>,
}

/// Retire the definition named `from_name` into a target definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRule {
    pub from_name: String,
    #[serde(default)]
    pub into_name: Option<String>,
    #[serde(default)]
    pub into_trigger: Option<TriggerType>,
}

// ─── State ───────────────────────────────────────────────────

/// Everything a plan reads for one workspace.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceState {
    pub workspace_id: String,
    pub sequences: Vec<SequenceDefinition>,
    /// Steps by sequence id, sorted by order.
    pub steps: HashMap<String, Vec<Step>>,
    pub instances: Vec<Instance>,
    /// Pending tasks only; other statuses are never touched.
    pub tasks: Vec<PendingTask>,
    /// Template fields by lead id. A lead missing here keeps its task text.
    pub lead_fields: HashMap<String, HashMap<String, String>>,
}

impl WorkspaceState {
    pub fn load(conn: &Connection, workspace_id: &str) -> Result<Self> {
        let sequences = conn.list_sequences(Some(workspace_id))?;
        let mut steps = HashMap::new();
        for def in &sequences {
            steps.insert(def.id.clone(), conn.load_steps(&def.id)?);
        }
        Ok(Self {
            workspace_id: workspace_id.to_string(),
            sequences,
            steps,
            instances: conn.list_workspace_instances(workspace_id)?,
            tasks: conn.list_workspace_tasks(workspace_id, TaskStatus::Pending)?,
            lead_fields: HashMap::new(),
        })
    }

    /// Leads whose pending tasks may need re-rendering.
    pub fn task_leads(&self) -> Vec<String> {
        let mut leads: Vec<String> = self.tasks.iter().map(|t| t.lead_id.clone()).collect();
        leads.sort();
        leads.dedup();
        leads
    }

    fn steps_of(&self, sequence_id: &str) -> Vec<Step> {
        self.steps.get(sequence_id).cloned().unwrap_or_default()
    }
}

// ─── Plan ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceChange {
    pub before: SequenceDefinition,
    pub after: SequenceDefinition,
    pub prior_steps: Vec<Step>,
    /// `None` when only the definition row changes.
    pub new_steps: Option<Vec<Step>>,
}

impl SequenceChange {
    pub fn deleted_step_ids(&self) -> Vec<String> {
        match &self.new_steps {
            Some(new) => self
                .prior_steps
                .iter()
                .filter(|p| !new.iter().any(|n| n.id == p.id))
                .map(|p| p.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn created_step_ids(&self) -> Vec<String> {
        match &self.new_steps {
            Some(new) => new
                .iter()
                .filter(|n| !self.prior_steps.iter().any(|p| p.id == n.id))
                .map(|n| n.id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Step rows inserted, deleted, or rewritten.
    pub fn steps_touched(&self) -> usize {
        let Some(new) = &self.new_steps else {
            return 0;
        };
        let changed = new
            .iter()
            .filter(|n| self.prior_steps.iter().any(|p| p.id == n.id && p != *n))
            .count();
        changed + self.deleted_step_ids().len() + self.created_step_ids().len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceChange {
    pub before: Instance,
    pub after: Instance,
}

/// Instance created on a merge target, replacing `merged_from`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedInstance {
    pub instance: Instance,
    pub merged_from: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskChange {
    pub before: PendingTask,
    pub after: PendingTask,
}

/// Audit entries: resolved, never errors.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNote {
    /// Pointer resolved by the snap-back rule.
    HeuristicRemap {
        instance_id: String,
        from: u32,
        to: u32,
    },
    /// Lead already on the target; target wins, retiring instance cancelled.
    MergeConflict {
        lead_id: String,
        retiring_instance: String,
        target_sequence: String,
    },
    /// A merge entry that matched nothing in this workspace.
    MergeSkipped { from_name: String, reason: String },
}

/// All row changes of one workspace.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePlan {
    pub workspace_id: String,
    pub sequences: Vec<SequenceChange>,
    pub instances: Vec<InstanceChange>,
    pub created: Vec<CreatedInstance>,
    pub tasks: Vec<TaskChange>,
    pub notes: Vec<PlanNote>,
}

impl WorkspacePlan {
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
            && self.instances.is_empty()
            && self.created.is_empty()
            && self.tasks.is_empty()
    }

    pub fn steps_touched(&self) -> usize {
        self.sequences.iter().map(SequenceChange::steps_touched).sum()
    }

    pub fn heuristic_remaps(&self) -> usize {
        self.notes
            .iter()
            .filter(|n| matches!(n, PlanNote::HeuristicRemap { .. }))
            .count()
    }

    pub fn conflicts(&self) -> usize {
        self.notes
            .iter()
            .filter(|n| matches!(n, PlanNote::MergeConflict { .. }))
            .count()
    }
}

// ─── Planner ─────────────────────────────────────────────────

/// Builds a [`WorkspacePlan`] step by step.
pub struct Planner {
    state: WorkspaceState,
    now: DateTime<Utc>,
    buffer: Duration,
    plan: WorkspacePlan,
}

impl Planner {
    /// `buffer` is added to `now` for due-dates that would land in the past.
    pub fn new(state: WorkspaceState, now: DateTime<Utc>, buffer: Duration) -> Self {
        let plan = WorkspacePlan {
            workspace_id: state.workspace_id.clone(),
            ..Default::default()
        };
        Self {
            state,
            now,
            buffer,
            plan,
        }
    }

    /// Apply a whole plan file: canonical rewrites first, then merges.
    pub fn run_file(mut self, file: &MigrationPlanFile) -> Result<WorkspacePlan> {
        for rewrite in &file.canonical {
            let targets: Vec<String> = self
                .state
                .sequences
                .iter()
                .filter(|s| s.active && s.trigger == rewrite.trigger)
                .map(|s| s.id.clone())
                .collect();
            for sequence_id in targets {
                self.canonical(&sequence_id, &rewrite.steps)?;
            }
        }
        for rule in &file.merge {
            self.merge(rule);
        }
        Ok(self.finish())
    }

    pub fn finish(self) -> WorkspacePlan {
        self.plan
    }

    /// Replace the steps of `sequence_id` and remap everything on it.
    pub fn canonical(&mut self, sequence_id: &str, drafts: &[StepDraft]) -> Result<()> {
        let Some(def) = self.state.sequences.iter().find(|s| s.id == sequence_id).cloned() else {
            return Ok(());
        };
        let old = self.state.steps_of(sequence_id);
        let mut new = canonicalize(sequence_id, drafts)?;
        reuse_ids(&old, &mut new);
        if new == old {
            tracing::debug!("✔️ Sequence '{}' already canonical", def.name);
            return Ok(());
        }

        let corr = Correspondence::build(&old, &new);
        let mut after = def.clone();
        after.updated_at = self.now;
        self.record_sequence(&def, after, &old, Some(new.clone()));
        self.state.steps.insert(sequence_id.to_string(), new.clone());

        let on_sequence: Vec<Instance> = self
            .state
            .instances
            .iter()
            .filter(|i| i.sequence_id == sequence_id)
            .cloned()
            .collect();

        for inst in &on_sequence {
            if inst.status.is_in_flight() {
                let mapping = corr.map(inst.current_step);
                let position = wave_end(&new, mapping.order());
                if mapping.is_heuristic() {
                    tracing::info!(
                        "🧭 Instance {}: step {} removed, snapped to {}",
                        inst.id,
                        inst.current_step,
                        position
                    );
                    self.plan.notes.push(PlanNote::HeuristicRemap {
                        instance_id: inst.id.clone(),
                        from: inst.current_step,
                        to: position,
                    });
                }
                let mut moved = inst.clone();
                moved.current_step = position;
                self.reschedule(&mut moved, inst, &new);
                self.record_instance(inst, moved);
            }
            self.remap_tasks(&inst.id, &inst.id, &corr, &new);
        }
        Ok(())
    }

    /// Fold the definition named `rule.from_name` into its target.
    pub fn merge(&mut self, rule: &MergeRule) {
        let Some(retiring) = self
            .state
            .sequences
            .iter()
            .find(|s| s.name == rule.from_name)
            .cloned()
        else {
            self.skip_merge(rule, "no definition with that name");
            return;
        };
        let target = self
            .state
            .sequences
            .iter()
            .filter(|s| s.id != retiring.id)
            .find(|s| match (&rule.into_name, rule.into_trigger) {
                (Some(name), _) => &s.name == name,
                (None, Some(trigger)) => s.active && s.trigger == trigger,
                (None, None) => false,
            })
            .cloned();
        let Some(target) = target else {
            self.skip_merge(rule, "no target definition");
            return;
        };

        let old = self.state.steps_of(&retiring.id);
        let new = self.state.steps_of(&target.id);
        let corr = Correspondence::build(&old, &new);

        let retiring_instances: Vec<Instance> = self
            .state
            .instances
            .iter()
            .filter(|i| i.sequence_id == retiring.id && i.status.is_in_flight())
            .cloned()
            .collect();

        for inst in &retiring_instances {
            let on_target = self
                .state
                .instances
                .iter()
                .any(|i| i.lead_id == inst.lead_id && i.sequence_id == target.id);

            let mut cancelled = inst.clone();
            cancelled.status = InstanceStatus::Cancelled;
            cancelled.next_step_due = None;
            cancelled.paused_reason = Some(MERGE_CANCEL_REASON.to_string());

            if on_target {
                tracing::info!(
                    "⚖️ Lead {} already on '{}', cancelling instance {}",
                    inst.lead_id,
                    target.name,
                    inst.id
                );
                self.plan.notes.push(PlanNote::MergeConflict {
                    lead_id: inst.lead_id.clone(),
                    retiring_instance: inst.id.clone(),
                    target_sequence: target.id.clone(),
                });
                self.record_instance(inst, cancelled);
                self.detach_tasks(&inst.id);
                continue;
            }

            let mapping = corr.map(inst.current_step);
            let position = wave_end(&new, mapping.order());
            if mapping.is_heuristic() {
                self.plan.notes.push(PlanNote::HeuristicRemap {
                    instance_id: inst.id.clone(),
                    from: inst.current_step,
                    to: position,
                });
            }
            let mut created = Instance {
                id: new_id("inst"),
                workspace_id: inst.workspace_id.clone(),
                lead_id: inst.lead_id.clone(),
                sequence_id: target.id.clone(),
                status: inst.status,
                current_step: position,
                started_at: inst.started_at,
                last_step_at: inst.last_step_at,
                next_step_due: inst.next_step_due,
                paused_reason: inst.paused_reason.clone(),
            };
            self.reschedule(&mut created, inst, &new);
            tracing::info!(
                "🔀 Instance {} → {} on '{}' at step {}",
                inst.id,
                created.id,
                target.name,
                created.current_step
            );

            self.state.instances.push(created.clone());
            self.plan.created.push(CreatedInstance {
                instance: created.clone(),
                merged_from: inst.id.clone(),
            });
            self.record_instance(inst, cancelled);
            self.remap_tasks(&inst.id, &created.id, &corr, &new);
        }

        if retiring.active {
            let mut after = retiring.clone();
            after.active = false;
            after.updated_at = self.now;
            let steps = self.state.steps_of(&retiring.id);
            self.record_sequence(&retiring, after, &steps, None);
        }
    }

    fn skip_merge(&mut self, rule: &MergeRule, reason: &str) {
        tracing::debug!("⏭️ Merge of '{}' skipped: {reason}", rule.from_name);
        self.plan.notes.push(PlanNote::MergeSkipped {
            from_name: rule.from_name.clone(),
            reason: reason.to_string(),
        });
    }

    /// Due-date for `moved` at its new position: never earlier than
    /// `original` was due, never in the past. No next step completes it.
    fn reschedule(&self, moved: &mut Instance, original: &Instance, steps: &[Step]) {
        match due_for_position(moved, steps, moved.current_step) {
            Some(candidate) => {
                let mut due = match original.next_step_due {
                    Some(prev) => candidate.max(prev),
                    None => candidate,
                };
                if due < self.now {
                    due = self.now + self.buffer;
                }
                moved.next_step_due = Some(due);
            }
            None => {
                moved.next_step_due = None;
                moved.status = InstanceStatus::Completed;
            }
        }
    }

    /// Re-point pending tasks of `from_instance` at `to_instance` and remap
    /// their step order through `corr`. Text is re-rendered on exact matches.
    fn remap_tasks(&mut self, from_instance: &str, to_instance: &str, corr: &Correspondence, new: &[Step]) {
        let tasks: Vec<PendingTask> = self
            .state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.instance_id.as_deref() == Some(from_instance))
            .cloned()
            .collect();

        for task in tasks {
            let mut after = task.clone();
            after.instance_id = Some(to_instance.to_string());
            if let Some(order) = task.step_order {
                match corr.map(order) {
                    Mapping::Exact(o) => {
                        after.step_order = Some(o);
                        let fields = self.state.lead_fields.get(&task.lead_id);
                        if let (Some(step), Some(fields)) = (step_by_order(new, o), fields) {
                            after.message = render(&step.message, fields);
                            after.subject = render_opt(step.subject.as_deref(), fields);
                        }
                    }
                    Mapping::SnapBack(o) => after.step_order = Some(o),
                    Mapping::NotStarted => after.step_order = None,
                }
            }
            self.record_task(&task, after);
        }
    }

    fn detach_tasks(&mut self, instance_id: &str) {
        let tasks: Vec<PendingTask> = self
            .state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.instance_id.as_deref() == Some(instance_id))
            .cloned()
            .collect();
        for task in tasks {
            let mut after = task.clone();
            after.instance_id = None;
            after.step_order = None;
            self.record_task(&task, after);
        }
    }

    // A row touched twice keeps its first `before` and its last `after`.

    fn record_sequence(
        &mut self,
        before: &SequenceDefinition,
        after: SequenceDefinition,
        steps_now: &[Step],
        new_steps: Option<Vec<Step>>,
    ) {
        if let Some(slot) = self.state.sequences.iter_mut().find(|s| s.id == after.id) {
            *slot = after.clone();
        }
        if let Some(existing) = self.plan.sequences.iter_mut().find(|c| c.after.id == after.id) {
            existing.after = after;
            if new_steps.is_some() {
                existing.new_steps = new_steps;
            }
            return;
        }
        self.plan.sequences.push(SequenceChange {
            before: before.clone(),
            after,
            prior_steps: steps_now.to_vec(),
            new_steps,
        });
    }

    fn record_instance(&mut self, before: &Instance, after: Instance) {
        if &after == before {
            return;
        }
        if let Some(slot) = self.state.instances.iter_mut().find(|i| i.id == after.id) {
            *slot = after.clone();
        }
        if let Some(created) = self.plan.created.iter_mut().find(|c| c.instance.id == after.id) {
            created.instance = after;
            return;
        }
        match self.plan.instances.iter_mut().find(|c| c.after.id == after.id) {
            Some(existing) => existing.after = after,
            None => self.plan.instances.push(InstanceChange {
                before: before.clone(),
                after,
            }),
        }
    }

    fn record_task(&mut self, before: &PendingTask, after: PendingTask) {
        if &after == before {
            return;
        }
        if let Some(slot) = self.state.tasks.iter_mut().find(|t| t.id == after.id) {
            *slot = after.clone();
        }
        match self.plan.tasks.iter_mut().find(|c| c.after.id == after.id) {
            Some(existing) => existing.after = after,
            None => self.plan.tasks.push(TaskChange {
                before: before.clone(),
                after,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Channel, Condition};
    use chrono::TimeZone;

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn def(id: &str, name: &str, trigger: TriggerType) -> SequenceDefinition {
        SequenceDefinition {
            id: id.into(),
            workspace_id: "ws-1".into(),
            name: name.into(),
            trigger,
            active: true,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn steps_from(sequence_id: &str, drafts: &[StepDraft]) -> Vec<Step> {
        let mut steps = canonicalize(sequence_id, drafts).unwrap();
        for s in &mut steps {
            s.id = format!("{sequence_id}-s{}", s.order);
        }
        steps
    }

    fn days(drafts: &[(Channel, u32)]) -> Vec<StepDraft> {
        drafts
            .iter()
            .map(|(c, d)| StepDraft::new(*c, *d, 0, &format!("{c} on day {d} for {{{{first_name}}}}")))
            .collect()
    }

    fn instance(id: &str, lead: &str, seq: &str, current: u32, last: Option<DateTime<Utc>>, due: Option<DateTime<Utc>>) -> Instance {
        Instance {
            id: id.into(),
            workspace_id: "ws-1".into(),
            lead_id: lead.into(),
            sequence_id: seq.into(),
            status: InstanceStatus::Active,
            current_step: current,
            started_at: t0(),
            last_step_at: last,
            next_step_due: due,
            paused_reason: None,
        }
    }

    fn pending(id: &str, inst: &str, lead: &str, order: u32) -> PendingTask {
        PendingTask {
            id: id.into(),
            instance_id: Some(inst.into()),
            step_order: Some(order),
            lead_id: lead.into(),
            workspace_id: "ws-1".into(),
            channel: Channel::Email,
            status: TaskStatus::Pending,
            message: "old text".into(),
            subject: None,
            due_at: t0(),
            created_at: t0(),
            sent_at: None,
            error: None,
        }
    }

    /// One no-response definition, steps on days 1, 3, 6, 8 (offsets 0, 2, 5, 7).
    pub(crate) fn four_step_state() -> WorkspaceState {
        let seq = def("seq-a", "Nurture", TriggerType::NoResponse);
        let steps = steps_from(
            "seq-a",
            &days(&[(Channel::Email, 1), (Channel::Email, 3), (Channel::Email, 6), (Channel::Email, 8)]),
        );
        WorkspaceState {
            workspace_id: "ws-1".into(),
            sequences: vec![seq],
            steps: HashMap::from([("seq-a".to_string(), steps)]),
            instances: vec![instance(
                "inst-1",
                "lead-1",
                "seq-a",
                2,
                Some(t0() + Duration::days(2)),
                Some(t0() + Duration::days(5)),
            )],
            tasks: vec![pending("task-1", "inst-1", "lead-1", 2)],
            lead_fields: HashMap::from([(
                "lead-1".to_string(),
                HashMap::from([("first_name".to_string(), "Ha".to_string())]),
            )]),
        }
    }

    fn without_day_3() -> Vec<StepDraft> {
        days(&[(Channel::Email, 1), (Channel::Email, 6), (Channel::Email, 8)])
    }

    #[test]
    fn test_removed_step_snaps_back_and_never_earlier() {
        let now = t0() + Duration::days(3);
        let mut planner = Planner::new(four_step_state(), now, Duration::minutes(5));
        planner.canonical("seq-a", &without_day_3()).unwrap();
        let plan = planner.finish();

        assert_eq!(plan.instances.len(), 1);
        let after = &plan.instances[0].after;
        // Offset-2 step is gone: pointer goes back to the offset-0 step.
        assert_eq!(after.current_step, 1);
        // last_step_at (day 2) + delta(offset 0 → offset 5) = day 7 ≥ old due (day 5).
        assert_eq!(after.next_step_due, Some(t0() + Duration::days(7)));
        assert!(after.next_step_due >= plan.instances[0].before.next_step_due);
        assert_eq!(plan.heuristic_remaps(), 1);

        let seq = &plan.sequences[0];
        assert_eq!(seq.deleted_step_ids(), vec!["seq-a-s2".to_string()]);
        assert!(seq.created_step_ids().is_empty());
        let orders: Vec<u32> = seq.new_steps.as_ref().unwrap().iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn test_due_never_moves_earlier() {
        let mut state = four_step_state();
        // Old due far in the future; the new layout would bring it closer.
        state.instances[0].next_step_due = Some(t0() + Duration::days(30));
        let mut planner = Planner::new(state, t0() + Duration::days(3), Duration::minutes(5));
        planner.canonical("seq-a", &without_day_3()).unwrap();
        let plan = planner.finish();
        assert_eq!(plan.instances[0].after.next_step_due, Some(t0() + Duration::days(30)));
    }

    #[test]
    fn test_past_due_is_floored_to_now_plus_buffer() {
        let mut state = four_step_state();
        state.instances[0].next_step_due = Some(t0() + Duration::days(5));
        let now = t0() + Duration::days(10);
        let mut planner = Planner::new(state, now, Duration::minutes(5));
        planner.canonical("seq-a", &without_day_3()).unwrap();
        let plan = planner.finish();
        assert_eq!(plan.instances[0].after.next_step_due, Some(now + Duration::minutes(5)));
    }

    #[test]
    fn test_tasks_remapped_and_rendered() {
        let mut state = four_step_state();
        state.instances[0].current_step = 3;
        state.tasks = vec![pending("task-1", "inst-1", "lead-1", 3), pending("task-2", "inst-1", "lead-1", 2)];
        let mut sent = pending("task-3", "inst-1", "lead-1", 3);
        sent.status = TaskStatus::Sent;
        state.tasks.push(sent);

        let mut planner = Planner::new(state, t0(), Duration::minutes(5));
        planner.canonical("seq-a", &without_day_3()).unwrap();
        let plan = planner.finish();

        let t1 = plan.tasks.iter().find(|c| c.after.id == "task-1").unwrap();
        assert_eq!(t1.after.step_order, Some(2));
        assert_eq!(t1.after.message, "email on day 6 for Ha");
        let t2 = plan.tasks.iter().find(|c| c.after.id == "task-2").unwrap();
        assert_eq!(t2.after.step_order, Some(1));
        assert_eq!(t2.after.message, "old text");
        assert!(plan.tasks.iter().all(|c| c.after.id != "task-3"));
    }

    #[test]
    fn test_unchanged_steps_plan_nothing() {
        let state = four_step_state();
        let drafts = days(&[(Channel::Email, 1), (Channel::Email, 3), (Channel::Email, 6), (Channel::Email, 8)]);
        let mut planner = Planner::new(state, t0(), Duration::minutes(5));
        planner.canonical("seq-a", &drafts).unwrap();
        assert!(planner.finish().is_empty());
    }

    #[test]
    fn test_pointer_normalized_to_wave_end_and_completion() {
        let mut state = four_step_state();
        state.instances[0].current_step = 4;
        state.instances[0].next_step_due = None;
        state.instances[0].status = InstanceStatus::Paused;
        // Add a second day-8 step: the instance was past day 8 already.
        let drafts = days(&[
            (Channel::Email, 1),
            (Channel::Email, 3),
            (Channel::Email, 6),
            (Channel::Email, 8),
            (Channel::Sms, 8),
        ]);
        let mut planner = Planner::new(state, t0(), Duration::minutes(5));
        planner.canonical("seq-a", &drafts).unwrap();
        let plan = planner.finish();
        let after = &plan.instances[0].after;
        assert_eq!(after.current_step, 5);
        assert_eq!(after.status, InstanceStatus::Completed);
        assert!(after.next_step_due.is_none());
    }

    fn merge_state() -> WorkspaceState {
        let legacy = def("seq-legacy", "Legacy meeting follow-up", TriggerType::MeetingSelected);
        let target = def("seq-b", "Meeting requested", TriggerType::MeetingSelected);
        let legacy_steps = steps_from("seq-legacy", &days(&[(Channel::Email, 1), (Channel::Sms, 2), (Channel::Email, 4)]));
        let target_steps = steps_from(
            "seq-b",
            &days(&[(Channel::Email, 1), (Channel::Linkedin, 2), (Channel::Sms, 2), (Channel::Email, 4)]),
        );
        WorkspaceState {
            workspace_id: "ws-1".into(),
            sequences: vec![legacy, target],
            steps: HashMap::from([
                ("seq-legacy".to_string(), legacy_steps),
                ("seq-b".to_string(), target_steps),
            ]),
            instances: vec![
                instance("inst-l", "lead-l", "seq-legacy", 2, Some(t0() + Duration::days(1)), Some(t0() + Duration::days(3))),
                instance("inst-m", "lead-m", "seq-legacy", 1, Some(t0()), Some(t0() + Duration::days(1))),
                instance("inst-m-b", "lead-m", "seq-b", 1, Some(t0()), Some(t0() + Duration::days(1))),
            ],
            tasks: vec![pending("task-l", "inst-l", "lead-l", 2), pending("task-m", "inst-m", "lead-m", 1)],
            lead_fields: HashMap::new(),
        }
    }

    fn merge_rule() -> MergeRule {
        MergeRule {
            from_name: "Legacy meeting follow-up".into(),
            into_name: None,
            into_trigger: Some(TriggerType::MeetingSelected),
        }
    }

    #[test]
    fn test_merge_moves_lead_onto_target() {
        let mut planner = Planner::new(merge_state(), t0() + Duration::hours(30), Duration::minutes(5));
        planner.merge(&merge_rule());
        let plan = planner.finish();

        assert_eq!(plan.created.len(), 1);
        let created = &plan.created[0];
        assert_eq!(created.merged_from, "inst-l");
        assert_eq!(created.instance.sequence_id, "seq-b");
        assert_eq!(created.instance.lead_id, "lead-l");
        assert_eq!(created.instance.status, InstanceStatus::Active);
        // Legacy sms day 2 is order 2 on the target; the pointer moves to the
        // end of that wave (linkedin day 2, order 3).
        assert_eq!(created.instance.current_step, 3);
        assert_eq!(created.instance.started_at, t0());
        assert_eq!(created.instance.next_step_due, Some(t0() + Duration::days(3)));

        let retired = plan.instances.iter().find(|c| c.before.id == "inst-l").unwrap();
        assert_eq!(retired.after.status, InstanceStatus::Cancelled);
        assert_eq!(retired.after.paused_reason.as_deref(), Some(MERGE_CANCEL_REASON));

        let task = plan.tasks.iter().find(|c| c.before.id == "task-l").unwrap();
        assert_eq!(task.after.instance_id.as_deref(), Some(created.instance.id.as_str()));
        assert_eq!(task.after.step_order, Some(2));

        let seq = plan.sequences.iter().find(|c| c.before.id == "seq-legacy").unwrap();
        assert!(!seq.after.active);
        assert!(seq.new_steps.is_none());
    }

    #[test]
    fn test_merge_conflict_target_wins() {
        let mut planner = Planner::new(merge_state(), t0(), Duration::minutes(5));
        planner.merge(&merge_rule());
        let plan = planner.finish();

        assert_eq!(plan.conflicts(), 1);
        assert!(plan.created.iter().all(|c| c.merged_from != "inst-m"));
        assert!(plan.instances.iter().all(|c| c.before.id != "inst-m-b"));
        let cancelled = plan.instances.iter().find(|c| c.before.id == "inst-m").unwrap();
        assert_eq!(cancelled.after.status, InstanceStatus::Cancelled);
        let task = plan.tasks.iter().find(|c| c.before.id == "task-m").unwrap();
        assert!(task.after.instance_id.is_none());
        assert!(task.after.step_order.is_none());
    }

    #[test]
    fn test_merge_without_target_is_noted() {
        let mut planner = Planner::new(four_step_state(), t0(), Duration::minutes(5));
        planner.merge(&MergeRule {
            from_name: "Nurture".into(),
            into_name: Some("Missing".into()),
            into_trigger: None,
        });
        let plan = planner.finish();
        assert!(plan.is_empty());
        assert!(matches!(plan.notes[0], PlanNote::MergeSkipped { .. }));
    }

    #[test]
    fn test_plan_file_from_toml() {
        let file: MigrationPlanFile = toml::from_str(
            r#"
            name = "2024-q1-cleanup"

            [[canonical]]
            trigger = "no_response"
            steps = [
                { channel = "email", day_offset = 1, message = "Hi {{first_name}}" },
                { channel = "sms", day_offset = 3, message = "Ping", condition = "phone_provided" },
            ]

            [[merge]]
            from_name = "Legacy meeting follow-up"
            into_trigger = "meeting_selected"
            "#,
        )
        .unwrap();
        assert_eq!(file.canonical[0].steps[1].condition, Condition::PhoneProvided);
        assert_eq!(file.merge[0].into_trigger, Some(TriggerType::MeetingSelected));

        let plan = Planner::new(four_step_state(), t0(), Duration::minutes(5))
            .run_file(&file)
            .unwrap();
        assert_eq!(plan.sequences.len(), 1);
        assert!(matches!(plan.notes.last(), Some(PlanNote::MergeSkipped { .. })));
    }
}
