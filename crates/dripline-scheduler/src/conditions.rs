//! Step eligibility — decides which steps of a wave fire for a lead.
//!
//! Every eligible step in a wave fires, one per channel. A step named as
//! another step's fallback only fires in place of that step, when the
//! referencing step is ineligible and the fallback itself is eligible.

use std::collections::HashSet;

use dripline_core::error::{DriplineError, Result};

use crate::model::{Condition, LeadCapabilities, Step};
use crate::schedule::step_offset_duration;

/// Is `step` allowed to fire for a lead with these capabilities?
pub fn is_eligible(caps: &LeadCapabilities, step: &Step) -> bool {
    match step.condition {
        Condition::Always => true,
        Condition::PhoneProvided => caps.has_phone,
        Condition::LinkedinConnected => caps.has_linkedin_connection,
        Condition::NoResponse => !caps.has_replied,
        Condition::EmailOpened => caps.has_opened_email,
    }
}

/// Steps of `wave` that fire, in wave order. Empty means the wave is skipped.
pub fn select_fired<'a>(wave: &'a [Step], caps: &LeadCapabilities) -> Vec<&'a Step> {
    let fallback_only: HashSet<u32> = wave.iter().filter_map(|s| s.fallback_step).collect();
    let mut fired: Vec<&Step> = Vec::new();

    for step in wave.iter().filter(|s| !fallback_only.contains(&s.order)) {
        if is_eligible(caps, step) {
            fired.push(step);
            continue;
        }
        let fallback = step
            .fallback_step
            .and_then(|order| wave.iter().find(|s| s.order == order));
        if let Some(fb) = fallback {
            if is_eligible(caps, fb) && !fired.iter().any(|f| f.order == fb.order) {
                tracing::debug!(
                    "↪️ Step {} ineligible, firing fallback step {} ({})",
                    step.order,
                    fb.order,
                    fb.channel
                );
                fired.push(fb);
            }
        }
    }

    fired.sort_by_key(|s| s.order);
    fired
}

/// Fallback references must stay inside the referencing step's wave.
pub fn validate_fallbacks(steps: &[Step]) -> Result<()> {
    for step in steps {
        let Some(target) = step.fallback_step else {
            continue;
        };
        if target == step.order {
            return Err(DriplineError::Validation(format!(
                "step {} names itself as fallback",
                step.order
            )));
        }
        let same_wave = steps.iter().any(|s| {
            s.order == target && step_offset_duration(s) == step_offset_duration(step)
        });
        if !same_wave {
            return Err(DriplineError::Validation(format!(
                "fallback of step {} must be a step in the same wave (got {})",
                step.order, target
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Channel;
    use crate::schedule::tests::step;

    fn gated(order: u32, day: u32, channel: Channel, condition: Condition) -> Step {
        let mut s = step(order, day, 0, channel);
        s.condition = condition;
        s
    }

    #[test]
    fn test_condition_table() {
        let nothing = LeadCapabilities::default();
        let everything = LeadCapabilities {
            has_phone: true,
            has_linkedin_connection: true,
            has_replied: true,
            has_opened_email: true,
        };
        let cases = [
            (Condition::Always, true, true),
            (Condition::PhoneProvided, false, true),
            (Condition::LinkedinConnected, false, true),
            (Condition::NoResponse, true, false),
            (Condition::EmailOpened, false, true),
        ];
        for (condition, for_nothing, for_everything) in cases {
            let s = gated(1, 1, Channel::Email, condition);
            assert_eq!(is_eligible(&nothing, &s), for_nothing, "{condition:?}");
            assert_eq!(is_eligible(&everything, &s), for_everything, "{condition:?}");
        }
    }

    #[test]
    fn test_phone_gated_step_never_fires_without_phone() {
        let wave = vec![
            gated(1, 2, Channel::Email, Condition::Always),
            gated(2, 2, Channel::Sms, Condition::PhoneProvided),
        ];
        let caps = LeadCapabilities::default();
        let fired = select_fired(&wave, &caps);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].channel, Channel::Email);
    }

    #[test]
    fn test_all_eligible_steps_in_wave_fire() {
        let wave = vec![
            gated(3, 2, Channel::Email, Condition::Always),
            gated(4, 2, Channel::Sms, Condition::PhoneProvided),
            gated(5, 2, Channel::Linkedin, Condition::LinkedinConnected),
        ];
        let caps = LeadCapabilities {
            has_phone: true,
            has_linkedin_connection: true,
            ..Default::default()
        };
        let orders: Vec<u32> = select_fired(&wave, &caps).iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![3, 4, 5]);
    }

    #[test]
    fn test_fallback_fires_only_in_place_of_ineligible_step() {
        let mut linkedin = gated(2, 3, Channel::Linkedin, Condition::LinkedinConnected);
        linkedin.fallback_step = Some(1);
        let email = gated(1, 3, Channel::Email, Condition::Always);
        let wave = vec![email, linkedin];

        let disconnected = LeadCapabilities::default();
        let fired = select_fired(&wave, &disconnected);
        assert_eq!(fired.iter().map(|s| s.order).collect::<Vec<_>>(), vec![1]);

        let connected = LeadCapabilities {
            has_linkedin_connection: true,
            ..Default::default()
        };
        let fired = select_fired(&wave, &connected);
        assert_eq!(fired.iter().map(|s| s.order).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_wave_with_no_eligible_step_is_empty() {
        let wave = vec![gated(2, 2, Channel::Linkedin, Condition::LinkedinConnected)];
        assert!(select_fired(&wave, &LeadCapabilities::default()).is_empty());
    }

    #[test]
    fn test_fallback_validation() {
        let mut a = step(1, 2, 0, Channel::Linkedin);
        a.fallback_step = Some(2);
        let b = step(2, 2, 0, Channel::Email);
        assert!(validate_fallbacks(&[a.clone(), b]).is_ok());

        let later = step(2, 4, 0, Channel::Email);
        assert!(validate_fallbacks(&[a.clone(), later]).is_err());

        a.fallback_step = Some(1);
        assert!(validate_fallbacks(&[a]).is_err());
    }
}
