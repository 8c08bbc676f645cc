//! Instance lifecycle — the per-(lead, sequence) state machine.
//!
//! ```text
//! start ──► active ◄──resume── paused
//!             │   ──pause──►     │
//!             ├──advance (last wave)──► completed
//!             └──cancel──► cancelled ◄──cancel──┘
//! ```
//!
//! Transitions here are pure: they mutate an `Instance` value and the
//! caller persists it. Invalid transitions return a `TransitionError` and
//! leave the instance untouched.

use chrono::{DateTime, Utc};
use dripline_core::error::TransitionError;

use crate::conditions::select_fired;
use crate::model::{Instance, InstanceStatus, LeadCapabilities, Step, new_id};
use crate::schedule::{due_after, due_from_start, first_due, next_wave, step_by_order};

/// Reason recorded when a pause comes from an operator.
pub const PAUSE_MANUAL: &str = "manual";
/// Reason recorded when the lead answered.
pub const PAUSE_LEAD_REPLIED: &str = "lead_replied";

impl Instance {
    /// New active instance positioned before the first wave.
    /// A definition without steps yields an already-completed instance.
    pub fn start(
        workspace_id: &str,
        lead_id: &str,
        sequence_id: &str,
        steps: &[Step],
        now: DateTime<Utc>,
    ) -> Self {
        let next_step_due = first_due(steps, now);
        Self {
            id: new_id("inst"),
            workspace_id: workspace_id.to_string(),
            lead_id: lead_id.to_string(),
            sequence_id: sequence_id.to_string(),
            status: if next_step_due.is_some() {
                InstanceStatus::Active
            } else {
                InstanceStatus::Completed
            },
            current_step: 0,
            started_at: now,
            last_step_at: None,
            next_step_due,
            paused_reason: None,
        }
    }

    /// Active → paused. The due-date is kept as is, so a long pause makes
    /// the instance due immediately on resume.
    pub fn pause(&mut self, reason: &str) -> Result<(), TransitionError> {
        if self.status != InstanceStatus::Active {
            return Err(TransitionError::NotActive {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.status = InstanceStatus::Paused;
        self.paused_reason = Some(reason.to_string());
        Ok(())
    }

    /// Paused → active.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        if self.status != InstanceStatus::Paused {
            return Err(TransitionError::NotPaused {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.status = InstanceStatus::Active;
        self.paused_reason = None;
        Ok(())
    }

    /// Active or paused → cancelled. Terminal.
    pub fn cancel(&mut self, reason: Option<&str>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.status = InstanceStatus::Cancelled;
        self.next_step_due = None;
        if let Some(reason) = reason {
            self.paused_reason = Some(reason.to_string());
        }
        Ok(())
    }

    /// Has the next step come due?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == InstanceStatus::Active && self.next_step_due.is_some_and(|due| due <= now)
    }
}

/// Result of evaluating one wave for a due instance.
#[derive(Debug, Clone)]
pub struct Advance {
    /// Steps that fire now. Empty when the whole wave was ineligible.
    pub fired: Vec<Step>,
    /// Order of the last step in the evaluated wave.
    pub wave_end: u32,
    /// Instance after the move.
    pub instance: Instance,
}

impl Advance {
    pub fn skipped(&self) -> bool {
        self.fired.is_empty()
    }
}

/// Evaluate the next wave and move the instance past it.
///
/// `None` when the instance is not due. The pointer lands on the last order
/// of the wave, `last_step_at` becomes `now`, and the due-date moves to the
/// following wave or to `None` (status `completed`).
pub fn advance(
    instance: &Instance,
    steps: &[Step],
    caps: &LeadCapabilities,
    now: DateTime<Utc>,
) -> Option<Advance> {
    if !instance.is_due(now) {
        return None;
    }

    let mut next = instance.clone();
    next.last_step_at = Some(now);

    let Some(wave) = next_wave(steps, instance.current_step) else {
        next.status = InstanceStatus::Completed;
        next.next_step_due = None;
        return Some(Advance {
            fired: Vec::new(),
            wave_end: instance.current_step,
            instance: next,
        });
    };

    let fired: Vec<Step> = select_fired(wave, caps).into_iter().cloned().collect();
    let last = &wave[wave.len() - 1];
    next.current_step = last.order;

    match next_wave(steps, last.order) {
        Some(following) => {
            next.next_step_due = Some(due_after(now, last, &following[0]));
        }
        None => {
            next.next_step_due = None;
            next.status = InstanceStatus::Completed;
        }
    }

    Some(Advance {
        fired,
        wave_end: last.order,
        instance: next,
    })
}

/// Due-date for an instance that sits on `current_step` of `steps`,
/// measured from its own history. `None` when no step remains.
pub fn due_for_position(
    instance: &Instance,
    steps: &[Step],
    current_step: u32,
) -> Option<DateTime<Utc>> {
    let following = next_wave(steps, current_step)?;
    let next = &following[0];
    let current = step_by_order(steps, current_step);
    match (current, instance.last_step_at) {
        (Some(current), Some(last)) => Some(due_after(last, current, next)),
        _ => Some(due_from_start(instance.started_at, next)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, Condition};
    use crate::schedule::tests::step;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn three_waves() -> Vec<Step> {
        let mut linkedin = step(3, 3, 0, Channel::Linkedin);
        linkedin.condition = Condition::LinkedinConnected;
        vec![
            step(1, 1, 0, Channel::Email),
            step(2, 1, 0, Channel::Sms),
            linkedin,
            step(4, 5, 0, Channel::Email),
        ]
    }

    #[test]
    fn test_start_schedules_first_wave() {
        let inst = Instance::start("ws", "lead-1", "seq-1", &three_waves(), t0());
        assert_eq!(inst.status, InstanceStatus::Active);
        assert_eq!(inst.current_step, 0);
        assert_eq!(inst.next_step_due, Some(t0()));
    }

    #[test]
    fn test_start_without_steps_completes() {
        let inst = Instance::start("ws", "lead-1", "seq-1", &[], t0());
        assert_eq!(inst.status, InstanceStatus::Completed);
        assert!(inst.next_step_due.is_none());
    }

    #[test]
    fn test_pause_keeps_due_and_resume_clears_reason() {
        let mut inst = Instance::start("ws", "lead-1", "seq-1", &three_waves(), t0());
        inst.pause(PAUSE_LEAD_REPLIED).unwrap();
        assert_eq!(inst.status, InstanceStatus::Paused);
        assert_eq!(inst.next_step_due, Some(t0()));
        assert!(inst.pause(PAUSE_MANUAL).is_err());

        inst.resume().unwrap();
        assert_eq!(inst.status, InstanceStatus::Active);
        assert!(inst.paused_reason.is_none());
    }

    #[test]
    fn test_invalid_transitions_are_named_and_harmless() {
        let mut inst = Instance::start("ws", "lead-1", "seq-1", &three_waves(), t0());
        inst.cancel(None).unwrap();
        let before = inst.clone();

        assert!(matches!(inst.resume(), Err(TransitionError::NotPaused { .. })));
        assert!(matches!(inst.cancel(None), Err(TransitionError::AlreadyTerminal { .. })));
        assert!(matches!(inst.pause("x"), Err(TransitionError::NotActive { .. })));
        assert_eq!(inst, before);
    }

    #[test]
    fn test_advance_fires_whole_wave() {
        let steps = three_waves();
        let inst = Instance::start("ws", "lead-1", "seq-1", &steps, t0());
        let adv = advance(&inst, &steps, &LeadCapabilities::default(), t0()).unwrap();
        assert_eq!(adv.fired.iter().map(|s| s.order).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(adv.instance.current_step, 2);
        assert_eq!(adv.instance.last_step_at, Some(t0()));
        assert_eq!(adv.instance.next_step_due, Some(t0() + chrono::Duration::days(2)));
    }

    #[test]
    fn test_ineligible_wave_is_skipped_and_next_wave_scheduled() {
        let steps = three_waves();
        let mut inst = Instance::start("ws", "lead-1", "seq-1", &steps, t0());
        inst.current_step = 2;
        inst.last_step_at = Some(t0());
        let now = t0() + chrono::Duration::days(2);
        inst.next_step_due = Some(now);

        let adv = advance(&inst, &steps, &LeadCapabilities::default(), now).unwrap();
        assert!(adv.skipped());
        assert_eq!(adv.instance.current_step, 3);
        assert_eq!(adv.instance.next_step_due, Some(now + chrono::Duration::days(2)));
        assert_eq!(adv.instance.status, InstanceStatus::Active);
    }

    #[test]
    fn test_last_wave_completes() {
        let steps = three_waves();
        let mut inst = Instance::start("ws", "lead-1", "seq-1", &steps, t0());
        inst.current_step = 3;
        let now = t0() + chrono::Duration::days(4);
        inst.next_step_due = Some(now);

        let adv = advance(&inst, &steps, &LeadCapabilities::default(), now).unwrap();
        assert_eq!(adv.fired.len(), 1);
        assert_eq!(adv.instance.status, InstanceStatus::Completed);
        assert!(adv.instance.next_step_due.is_none());
    }

    #[test]
    fn test_not_due_does_not_advance() {
        let steps = three_waves();
        let mut inst = Instance::start("ws", "lead-1", "seq-1", &steps, t0());
        inst.next_step_due = Some(t0() + chrono::Duration::hours(1));
        assert!(advance(&inst, &steps, &LeadCapabilities::default(), t0()).is_none());

        inst.next_step_due = Some(t0());
        inst.pause(PAUSE_MANUAL).unwrap();
        assert!(advance(&inst, &steps, &LeadCapabilities::default(), t0()).is_none());
    }

    #[test]
    fn test_due_for_position() {
        let steps = three_waves();
        let mut inst = Instance::start("ws", "lead-1", "seq-1", &steps, t0());
        assert_eq!(due_for_position(&inst, &steps, 0), Some(t0()));

        inst.last_step_at = Some(t0() + chrono::Duration::hours(3));
        assert_eq!(
            due_for_position(&inst, &steps, 2),
            Some(t0() + chrono::Duration::hours(3) + chrono::Duration::days(2))
        );
        assert_eq!(due_for_position(&inst, &steps, 4), None);
    }
}
