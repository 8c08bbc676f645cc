//! Step canonicalization and the old-order → new-order correspondence map.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::Duration;
use dripline_core::error::{DriplineError, Result};

use crate::conditions::validate_fallbacks;
use crate::model::{Step, StepDraft, new_id};
use crate::schedule::{MAX_OFFSET_DAYS, offset_duration, step_offset_duration};

/// Commit `drafts` as steps of `sequence_id`: sorted by offset, then channel
/// priority, then raw day offset, then input position; numbered densely from 1.
///
/// Step ids are fresh. Callers that want stable ids reuse them by key.
pub fn canonicalize(sequence_id: &str, drafts: &[StepDraft]) -> Result<Vec<Step>> {
    for (i, draft) in drafts.iter().enumerate() {
        if draft.message.trim().is_empty() {
            return Err(DriplineError::Validation(format!(
                "step #{} ({} day {}) has an empty message",
                i + 1,
                draft.channel,
                draft.day_offset
            )));
        }
        if offset_duration(draft.day_offset, draft.minute_offset) > Duration::days(MAX_OFFSET_DAYS) {
            return Err(DriplineError::Validation(format!(
                "step #{} ({} day {} +{}m) is more than {MAX_OFFSET_DAYS} days out",
                i + 1,
                draft.channel,
                draft.day_offset,
                draft.minute_offset
            )));
        }
    }

    let mut indexed: Vec<(usize, &StepDraft)> = drafts.iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        offset_duration(a.day_offset, a.minute_offset)
            .cmp(&offset_duration(b.day_offset, b.minute_offset))
            .then(a.channel.priority().cmp(&b.channel.priority()))
            .then(a.day_offset.cmp(&b.day_offset))
            .then(ia.cmp(ib))
    });

    let mut steps: Vec<Step> = indexed
        .iter()
        .enumerate()
        .map(|(pos, (_, d))| Step {
            id: new_id("step"),
            sequence_id: sequence_id.to_string(),
            order: pos as u32 + 1,
            day_offset: d.day_offset,
            minute_offset: d.minute_offset,
            channel: d.channel,
            message: d.message.clone(),
            subject: d.subject.clone(),
            condition: d.condition,
            condition_value: d.condition_value.clone(),
            requires_approval: d.requires_approval,
            fallback_step: None,
        })
        .collect();

    // Fallbacks are named by channel; resolve them to orders inside the wave.
    for (pos, (_, draft)) in indexed.iter().enumerate() {
        let Some(channel) = draft.fallback_channel else {
            continue;
        };
        let offset = step_offset_duration(&steps[pos]);
        let target = steps
            .iter()
            .find(|s| s.channel == channel && s.order != steps[pos].order && step_offset_duration(s) == offset)
            .map(|s| s.order)
            .ok_or_else(|| {
                DriplineError::Validation(format!(
                    "step {} ({}) names a {} fallback that is not in its wave",
                    steps[pos].order, steps[pos].channel, channel
                ))
            })?;
        steps[pos].fallback_step = Some(target);
    }

    validate_fallbacks(&steps)?;
    Ok(steps)
}

/// Give `new` steps the ids of old steps with the same key, first match wins.
pub fn reuse_ids(old: &[Step], new: &mut [Step]) {
    let mut taken: HashSet<&str> = HashSet::new();
    for step in new.iter_mut() {
        let key = step.key();
        if let Some(prev) = old.iter().find(|o| o.key() == key && !taken.contains(o.id.as_str())) {
            taken.insert(prev.id.as_str());
            step.id = prev.id.clone();
        }
    }
}

/// Where an old step order lands in the new numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// Same `(channel, day, minute)` step exists in the new list.
    Exact(u32),
    /// Step removed; nearest prior surviving step (treated as done).
    SnapBack(u32),
    /// Step removed and nothing survives before it.
    NotStarted,
}

impl Mapping {
    pub fn order(&self) -> u32 {
        match self {
            Mapping::Exact(o) | Mapping::SnapBack(o) => *o,
            Mapping::NotStarted => 0,
        }
    }

    /// Resolved by the snap-back rule rather than a key match.
    pub fn is_heuristic(&self) -> bool {
        !matches!(self, Mapping::Exact(_))
    }
}

/// Old-order → new-order map between two step lists.
#[derive(Debug, Clone, Default)]
pub struct Correspondence {
    map: HashMap<u32, Mapping>,
    last_new: u32,
}

impl Correspondence {
    pub fn build(old: &[Step], new: &[Step]) -> Self {
        let mut map = HashMap::new();
        let mut claimed: HashSet<u32> = HashSet::new();

        for step in old {
            let key = step.key();
            let exact = new
                .iter()
                .find(|n| n.key() == key && !claimed.contains(&n.order))
                .or_else(|| new.iter().find(|n| n.key() == key));
            let mapping = match exact {
                Some(n) => {
                    claimed.insert(n.order);
                    Mapping::Exact(n.order)
                }
                None => {
                    let offset = step_offset_duration(step);
                    new.iter()
                        .filter(|n| step_offset_duration(n).cmp(&offset) != Ordering::Greater)
                        .map(|n| n.order)
                        .max()
                        .map(Mapping::SnapBack)
                        .unwrap_or(Mapping::NotStarted)
                }
            };
            map.insert(step.order, mapping);
        }

        Self {
            map,
            last_new: new.iter().map(|s| s.order).max().unwrap_or(0),
        }
    }

    /// Map an old order. `0` stays `0`; an order past the old list counts as
    /// past the new one too.
    pub fn map(&self, order: u32) -> Mapping {
        if order == 0 {
            return Mapping::Exact(0);
        }
        self.map
            .get(&order)
            .copied()
            .unwrap_or(Mapping::SnapBack(self.last_new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Channel;
    use crate::schedule::tests::step;

    #[test]
    fn test_canonical_order_is_dense_and_monotonic() {
        let drafts = vec![
            StepDraft::new(Channel::Sms, 3, 0, "c"),
            StepDraft::new(Channel::Email, 3, 0, "b"),
            StepDraft::new(Channel::Voice, 1, 0, "a"),
            StepDraft::new(Channel::Email, 0, 0, "legacy"),
            StepDraft::new(Channel::Email, 1, 30, "d"),
        ];
        let steps = canonicalize("seq-1", &drafts).unwrap();
        assert_eq!(steps.iter().map(|s| s.order).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            steps.iter().map(|s| s.message.as_str()).collect::<Vec<_>>(),
            vec!["legacy", "a", "d", "b", "c"]
        );
        for pair in steps.windows(2) {
            assert!(step_offset_duration(&pair[0]) <= step_offset_duration(&pair[1]));
        }
    }

    #[test]
    fn test_fallback_resolved_within_wave() {
        let drafts = vec![
            StepDraft::new(Channel::Linkedin, 2, 0, "connect")
                .with_condition(crate::model::Condition::LinkedinConnected)
                .with_fallback(Channel::Email),
            StepDraft::new(Channel::Email, 2, 0, "mail"),
        ];
        let steps = canonicalize("seq-1", &drafts).unwrap();
        assert_eq!(steps[1].channel, Channel::Linkedin);
        assert_eq!(steps[1].fallback_step, Some(1));

        let bad = vec![StepDraft::new(Channel::Sms, 2, 0, "x").with_fallback(Channel::Email)];
        assert!(canonicalize("seq-1", &bad).is_err());
    }

    #[test]
    fn test_empty_message_rejected() {
        assert!(canonicalize("seq-1", &[StepDraft::new(Channel::Email, 1, 0, "  ")]).is_err());
    }

    #[test]
    fn test_out_of_range_offset_rejected() {
        let err = canonicalize("seq-1", &[StepDraft::new(Channel::Email, u32::MAX, 0, "later")]);
        assert!(matches!(err, Err(DriplineError::Validation(_))));
        let err = canonicalize("seq-1", &[StepDraft::new(Channel::Sms, 3650, 2 * 24 * 60, "later")]);
        assert!(matches!(err, Err(DriplineError::Validation(_))));
        assert!(canonicalize("seq-1", &[StepDraft::new(Channel::Email, 3651, 0, "ten years")]).is_ok());
    }

    #[test]
    fn test_removed_step_snaps_back_to_prior_offset() {
        // Offsets 0, 2, 5, 7 days; the day-2 step goes away.
        let old = vec![
            step(1, 1, 0, Channel::Email),
            step(2, 3, 0, Channel::Email),
            step(3, 6, 0, Channel::Email),
            step(4, 8, 0, Channel::Email),
        ];
        let new = vec![
            step(1, 1, 0, Channel::Email),
            step(2, 6, 0, Channel::Email),
            step(3, 8, 0, Channel::Email),
        ];
        let corr = Correspondence::build(&old, &new);
        assert_eq!(corr.map(2), Mapping::SnapBack(1));
        assert_eq!(corr.map(3), Mapping::Exact(2));
        assert_eq!(corr.map(4), Mapping::Exact(3));
        assert_eq!(corr.map(0), Mapping::Exact(0));
    }

    #[test]
    fn test_removed_first_step_is_not_started() {
        let old = vec![step(1, 1, 0, Channel::Sms), step(2, 3, 0, Channel::Email)];
        let new = vec![step(1, 3, 0, Channel::Email)];
        let corr = Correspondence::build(&old, &new);
        assert_eq!(corr.map(1), Mapping::NotStarted);
        assert!(corr.map(1).is_heuristic());
        assert_eq!(corr.map(2), Mapping::Exact(1));
        assert_eq!(corr.map(9), Mapping::SnapBack(1));
    }

    #[test]
    fn test_duplicate_keys_first_match_wins() {
        let old = vec![step(1, 2, 0, Channel::Email), step(2, 2, 0, Channel::Email)];
        let new = vec![step(1, 2, 0, Channel::Email), step(2, 2, 0, Channel::Email)];
        let corr = Correspondence::build(&old, &new);
        assert_eq!(corr.map(1), Mapping::Exact(1));
        assert_eq!(corr.map(2), Mapping::Exact(2));
    }

    #[test]
    fn test_reuse_ids_by_key() {
        let old = vec![step(1, 1, 0, Channel::Email), step(2, 3, 0, Channel::Sms)];
        let mut new = canonicalize(
            "seq-1",
            &[
                StepDraft::new(Channel::Sms, 3, 0, "x"),
                StepDraft::new(Channel::Voice, 2, 0, "y"),
            ],
        )
        .unwrap();
        reuse_ids(&old, &mut new);
        assert!(new[0].id.starts_with("step-") && new[0].id != "step-1");
        assert_eq!(new[1].id, "step-2");
    }
}
