//! Operator-facing operations on definitions, instances, and tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dripline_core::error::{DriplineError, Result, TransitionError};
use tokio::sync::Mutex;

use crate::lifecycle::PAUSE_MANUAL;
use crate::migration::canonicalize;
use crate::model::{
    Instance, InstanceStatus, PendingTask, SequenceDefinition, Step, StepDraft, TaskStatus,
    TriggerType,
};
use crate::persistence::{DripDb, SequenceStore};

/// Result of `start`.
#[derive(Debug, Clone, PartialEq)]
pub enum Started {
    Created(Instance),
    /// The lead already had an instance on this definition.
    Existing(Instance),
}

impl Started {
    pub fn instance(&self) -> &Instance {
        match self {
            Started::Created(i) | Started::Existing(i) => i,
        }
    }
}

pub struct SequenceService {
    db: Arc<Mutex<DripDb>>,
}

impl SequenceService {
    pub fn new(db: Arc<Mutex<DripDb>>) -> Self {
        Self { db }
    }

    // ─── Definitions ─────────────────────────────────────────

    pub async fn create_sequence(
        &self,
        workspace_id: &str,
        name: &str,
        trigger: TriggerType,
        drafts: &[StepDraft],
    ) -> Result<(SequenceDefinition, Vec<Step>)> {
        if name.trim().is_empty() {
            return Err(DriplineError::Validation("sequence name is empty".into()));
        }
        let def = SequenceDefinition::new(workspace_id, name, trigger);
        let steps = canonicalize(&def.id, drafts)?;

        let mut db = self.db.lock().await;
        db.transaction(|tx| {
            tx.insert_sequence(&def)?;
            for step in &steps {
                tx.insert_step(step)?;
            }
            Ok(())
        })?;
        tracing::info!(
            "🆕 Sequence '{}' ({}) created in {} with {} step(s)",
            def.name,
            def.trigger.as_str(),
            workspace_id,
            steps.len()
        );
        Ok((def, steps))
    }

    /// Rename or re-trigger a definition. Steps change through migration.
    pub async fn update_sequence(
        &self,
        id: &str,
        name: Option<&str>,
        trigger: Option<TriggerType>,
    ) -> Result<SequenceDefinition> {
        let db = self.db.lock().await;
        let mut def = require_sequence(&db, id)?;
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(DriplineError::Validation("sequence name is empty".into()));
            }
            def.name = name.to_string();
        }
        if let Some(trigger) = trigger {
            def.trigger = trigger;
        }
        def.updated_at = Utc::now();
        db.update_sequence(&def)?;
        Ok(def)
    }

    pub async fn delete_sequence(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let def = require_sequence(&db, id)?;
        let live = db.count_instances(id)?;
        if live > 0 {
            return Err(DriplineError::Validation(format!(
                "sequence '{}' still has {live} instance(s); deactivate it instead",
                def.name
            )));
        }
        db.delete_sequence(id)?;
        tracing::info!("🗑️ Sequence '{}' deleted", def.name);
        Ok(())
    }

    pub async fn set_sequence_active(&self, id: &str, active: bool) -> Result<SequenceDefinition> {
        let db = self.db.lock().await;
        let mut def = require_sequence(&db, id)?;
        if def.active != active {
            def.active = active;
            def.updated_at = Utc::now();
            db.update_sequence(&def)?;
            tracing::info!(
                "{} Sequence '{}' {}",
                if active { "▶️" } else { "⏸️" },
                def.name,
                if active { "activated" } else { "deactivated" }
            );
        }
        Ok(def)
    }

    // ─── Instances ───────────────────────────────────────────

    /// Start `sequence_id` for a lead, or return the instance it already has.
    pub async fn start(&self, lead_id: &str, sequence_id: &str, now: DateTime<Utc>) -> Result<Started> {
        let db = self.db.lock().await;
        let def = require_sequence(&db, sequence_id)?;
        start_locked(&db, &def, lead_id, now)
    }

    /// Start every active definition with `trigger` in the workspace.
    pub async fn start_for_trigger(
        &self,
        workspace_id: &str,
        lead_id: &str,
        trigger: TriggerType,
        now: DateTime<Utc>,
    ) -> Result<Vec<Started>> {
        let db = self.db.lock().await;
        let defs = db.list_sequences(Some(workspace_id))?;
        defs.iter()
            .filter(|d| d.active && d.trigger == trigger)
            .map(|def| start_locked(&db, def, lead_id, now))
            .collect()
    }

    pub async fn pause(&self, instance_id: &str, reason: Option<&str>) -> Result<Instance> {
        self.transition(instance_id, |i| i.pause(reason.unwrap_or(PAUSE_MANUAL)))
            .await
    }

    /// Pause every active instance of a lead. Returns how many were paused.
    pub async fn pause_lead(&self, lead_id: &str, reason: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let mut paused = 0;
        for inst in db.list_lead_instances(lead_id)? {
            if inst.status != InstanceStatus::Active {
                continue;
            }
            let mut next = inst.clone();
            next.pause(reason)?;
            if db.swap_instance(&inst, &next)? {
                paused += 1;
            }
        }
        if paused > 0 {
            tracing::info!("⏸️ Lead {lead_id}: {paused} instance(s) paused ({reason})");
        }
        Ok(paused)
    }

    pub async fn resume(&self, instance_id: &str) -> Result<Instance> {
        self.transition(instance_id, Instance::resume).await
    }

    pub async fn cancel(&self, instance_id: &str, reason: Option<&str>) -> Result<Instance> {
        self.transition(instance_id, |i| i.cancel(reason)).await
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        let db = self.db.lock().await;
        require_instance(&db, instance_id)
    }

    async fn transition<F>(&self, instance_id: &str, apply: F) -> Result<Instance>
    where
        F: FnOnce(&mut Instance) -> std::result::Result<(), TransitionError>,
    {
        let db = self.db.lock().await;
        let before = require_instance(&db, instance_id)?;
        let mut after = before.clone();
        apply(&mut after)?;
        if !db.swap_instance(&before, &after)? {
            return Err(DriplineError::Validation(format!(
                "instance {instance_id} changed while updating, retry"
            )));
        }
        tracing::info!("🔄 Instance {}: {} → {}", instance_id, before.status, after.status);
        Ok(after)
    }

    // ─── Tasks ───────────────────────────────────────────────

    /// Pending → queued; the next outbox flush sends it.
    pub async fn approve_task(&self, task_id: &str) -> Result<PendingTask> {
        self.move_task(task_id, TaskStatus::Queued).await
    }

    /// Pending → dismissed.
    pub async fn dismiss_task(&self, task_id: &str) -> Result<PendingTask> {
        self.move_task(task_id, TaskStatus::Dismissed).await
    }

    async fn move_task(&self, task_id: &str, to: TaskStatus) -> Result<PendingTask> {
        let db = self.db.lock().await;
        let task = db
            .get_task(task_id)?
            .ok_or_else(|| DriplineError::not_found("task", task_id))?;
        if !db.transition_task(task_id, TaskStatus::Pending, to)? {
            return Err(DriplineError::Validation(format!(
                "task {task_id} is {}, only pending tasks can be {}",
                task.status,
                if to == TaskStatus::Queued { "approved" } else { "dismissed" }
            )));
        }
        tracing::info!("📝 Task {task_id}: pending → {to}");
        Ok(PendingTask { status: to, ..task })
    }
}

fn require_sequence(db: &DripDb, id: &str) -> Result<SequenceDefinition> {
    db.get_sequence(id)?
        .ok_or_else(|| DriplineError::not_found("sequence", id))
}

fn require_instance(db: &DripDb, id: &str) -> Result<Instance> {
    db.get_instance(id)?
        .ok_or_else(|| DriplineError::not_found("instance", id))
}

fn start_locked(db: &DripDb, def: &SequenceDefinition, lead_id: &str, now: DateTime<Utc>) -> Result<Started> {
    if let Some(existing) = db.find_instance(lead_id, &def.id)? {
        tracing::debug!("↩️ Lead {lead_id} already on '{}' ({})", def.name, existing.id);
        return Ok(Started::Existing(existing));
    }
    if !def.active {
        return Err(TransitionError::SequenceInactive { id: def.id.clone() }.into());
    }
    let steps = db.load_steps(&def.id)?;
    let inst = Instance::start(&def.workspace_id, lead_id, &def.id, &steps, now);
    db.insert_instance(&inst)?;
    tracing::info!(
        "🚀 Lead {} started on '{}' ({}), first due {:?}",
        lead_id,
        def.name,
        inst.id,
        inst.next_step_due
    );
    Ok(Started::Created(inst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Channel;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn service() -> SequenceService {
        SequenceService::new(Arc::new(Mutex::new(DripDb::open_in_memory().unwrap())))
    }

    fn drafts() -> Vec<StepDraft> {
        vec![
            StepDraft::new(Channel::Sms, 2, 0, "Hi {{first_name}}"),
            StepDraft::new(Channel::Email, 1, 0, "Welcome"),
            StepDraft::new(Channel::Email, 2, 0, "Day two"),
        ]
    }

    #[tokio::test]
    async fn test_create_sequence_canonicalizes() {
        let svc = service();
        let (def, steps) = svc
            .create_sequence("ws-1", "Nurture", TriggerType::NoResponse, &drafts())
            .await
            .unwrap();
        assert!(def.active);
        let order: Vec<(u32, Channel, u32)> = steps.iter().map(|s| (s.order, s.channel, s.day_offset)).collect();
        assert_eq!(
            order,
            vec![(1, Channel::Email, 1), (2, Channel::Email, 2), (3, Channel::Sms, 2)]
        );

        let empty = [StepDraft::new(Channel::Email, 1, 0, "  ")];
        let err = svc.create_sequence("ws-1", "Bad", TriggerType::Manual, &empty).await;
        assert!(matches!(err, Err(DriplineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let svc = service();
        let (def, _) = svc
            .create_sequence("ws-1", "Nurture", TriggerType::NoResponse, &drafts())
            .await
            .unwrap();

        let first = svc.start("lead-1", &def.id, t0()).await.unwrap();
        let Started::Created(inst) = &first else {
            panic!("expected a new instance");
        };
        assert_eq!(inst.current_step, 0);
        assert_eq!(inst.next_step_due, Some(t0()));

        let again = svc.start("lead-1", &def.id, t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(again, Started::Existing(inst.clone()));

        let missing = svc.start("lead-1", "seq-missing", t0()).await;
        assert!(matches!(missing, Err(DriplineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_inactive_sequence_refuses_start() {
        let svc = service();
        let (def, _) = svc
            .create_sequence("ws-1", "Nurture", TriggerType::NoResponse, &drafts())
            .await
            .unwrap();
        svc.set_sequence_active(&def.id, false).await.unwrap();
        let err = svc.start("lead-1", &def.id, t0()).await.unwrap_err();
        assert!(matches!(
            err,
            DriplineError::Transition(TransitionError::SequenceInactive { .. })
        ));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_start_for_trigger() {
        let svc = service();
        for name in ["A", "B"] {
            svc.create_sequence("ws-1", name, TriggerType::MeetingSelected, &drafts())
                .await
                .unwrap();
        }
        svc.create_sequence("ws-1", "C", TriggerType::NoResponse, &drafts())
            .await
            .unwrap();
        svc.create_sequence("ws-2", "D", TriggerType::MeetingSelected, &drafts())
            .await
            .unwrap();

        let started = svc
            .start_for_trigger("ws-1", "lead-1", TriggerType::MeetingSelected, t0())
            .await
            .unwrap();
        assert_eq!(started.len(), 2);
        assert!(started.iter().all(|s| matches!(s, Started::Created(_))));
    }

    #[tokio::test]
    async fn test_pause_resume_cancel() {
        let svc = service();
        let (def, _) = svc
            .create_sequence("ws-1", "Nurture", TriggerType::NoResponse, &drafts())
            .await
            .unwrap();
        let id = svc.start("lead-1", &def.id, t0()).await.unwrap().instance().id.clone();

        let paused = svc.pause(&id, None).await.unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);
        assert_eq!(paused.paused_reason.as_deref(), Some(PAUSE_MANUAL));
        assert_eq!(paused.next_step_due, Some(t0()));

        let err = svc.pause(&id, None).await.unwrap_err();
        assert!(matches!(err, DriplineError::Transition(TransitionError::NotActive { .. })));

        let resumed = svc.resume(&id).await.unwrap();
        assert_eq!(resumed.status, InstanceStatus::Active);
        assert!(resumed.paused_reason.is_none());

        let cancelled = svc.cancel(&id, Some("unsubscribed")).await.unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert!(cancelled.next_step_due.is_none());

        let err = svc.resume(&id).await.unwrap_err();
        assert!(matches!(err, DriplineError::Transition(TransitionError::NotPaused { .. })));
        // Nothing written by the failed transition.
        assert_eq!(svc.get_instance(&id).await.unwrap(), cancelled);
    }

    #[tokio::test]
    async fn test_pause_lead_touches_only_active() {
        let svc = service();
        let mut ids = Vec::new();
        for name in ["A", "B", "C"] {
            let (def, _) = svc
                .create_sequence("ws-1", name, TriggerType::NoResponse, &drafts())
                .await
                .unwrap();
            ids.push(svc.start("lead-1", &def.id, t0()).await.unwrap().instance().id.clone());
        }
        svc.cancel(&ids[2], None).await.unwrap();

        let paused = svc.pause_lead("lead-1", "lead_replied").await.unwrap();
        assert_eq!(paused, 2);
        let inst = svc.get_instance(&ids[0]).await.unwrap();
        assert_eq!(inst.paused_reason.as_deref(), Some("lead_replied"));
        assert_eq!(svc.get_instance(&ids[2]).await.unwrap().status, InstanceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_delete_refused_while_instances_exist() {
        let svc = service();
        let (def, _) = svc
            .create_sequence("ws-1", "Nurture", TriggerType::NoResponse, &drafts())
            .await
            .unwrap();
        svc.start("lead-1", &def.id, t0()).await.unwrap();
        let err = svc.delete_sequence(&def.id).await;
        assert!(matches!(err, Err(DriplineError::Validation(_))));

        let (empty, _) = svc
            .create_sequence("ws-1", "Unused", TriggerType::Manual, &drafts())
            .await
            .unwrap();
        svc.delete_sequence(&empty.id).await.unwrap();
        assert!(matches!(
            svc.start("lead-1", &empty.id, t0()).await,
            Err(DriplineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_sequence_metadata() {
        let svc = service();
        let (def, steps) = svc
            .create_sequence("ws-1", "Nurture", TriggerType::NoResponse, &drafts())
            .await
            .unwrap();
        let updated = svc
            .update_sequence(&def.id, Some("Nurture v2"), Some(TriggerType::Manual))
            .await
            .unwrap();
        assert_eq!(updated.name, "Nurture v2");
        assert_eq!(updated.trigger, TriggerType::Manual);
        let db = svc.db.lock().await;
        assert_eq!(db.load_steps(&def.id).unwrap(), steps);
    }

    #[tokio::test]
    async fn test_approve_and_dismiss() {
        let svc = service();
        {
            let db = svc.db.lock().await;
            for id in ["task-a", "task-b"] {
                db.insert_task(&PendingTask {
                    id: id.into(),
                    instance_id: None,
                    step_order: None,
                    lead_id: "lead-1".into(),
                    workspace_id: "ws-1".into(),
                    channel: Channel::Linkedin,
                    status: TaskStatus::Pending,
                    message: "Connect?".into(),
                    subject: None,
                    due_at: t0(),
                    created_at: t0(),
                    sent_at: None,
                    error: None,
                })
                .unwrap();
            }
        }

        assert_eq!(svc.approve_task("task-a").await.unwrap().status, TaskStatus::Queued);
        assert_eq!(svc.dismiss_task("task-b").await.unwrap().status, TaskStatus::Dismissed);
        assert!(matches!(
            svc.approve_task("task-a").await,
            Err(DriplineError::Validation(_))
        ));
        assert!(matches!(
            svc.dismiss_task("task-zzz").await,
            Err(DriplineError::NotFound { .. })
        ));
    }
}
