//! Step offset math and wave lookup.
//!
//! Day offsets are 1-based: `1` = immediately, `2` = one day after the
//! sequence start. `0` comes from an older zero-based scheme and also means
//! immediately. Minute offsets sit on top of the day granularity.
//!
//! A wave is the run of consecutive steps sharing the same offset. Steps
//! are kept sorted by offset, so a wave is always contiguous.

use chrono::{DateTime, Duration, Utc};

use crate::model::Step;

/// Largest offset a step may have, in days.
pub const MAX_OFFSET_DAYS: i64 = 3650;

/// Offset of a `(day_offset, minute_offset)` pair from the sequence start.
pub fn offset_duration(day_offset: u32, minute_offset: u32) -> Duration {
    let days = i64::from(day_offset.saturating_sub(1));
    Duration::days(days) + Duration::minutes(i64::from(minute_offset))
}

/// Offset of a step from the sequence start.
pub fn step_offset_duration(step: &Step) -> Duration {
    offset_duration(step.day_offset, step.minute_offset)
}

/// Time between two steps, never negative.
///
/// A negative gap means the definition is out of order. It is logged and the
/// later step fires immediately instead of blocking the instance.
pub fn step_delta(current: &Step, next: &Step) -> Duration {
    let raw = step_offset_duration(next) - step_offset_duration(current);
    if raw < Duration::zero() {
        tracing::warn!(
            "⚠️ Negative step delta in sequence {}: step {} → {} ({} min), clamped to 0",
            current.sequence_id,
            current.order,
            next.order,
            raw.num_minutes()
        );
        return Duration::zero();
    }
    raw
}

/// Due-date of `step` for an instance started at `anchor`.
pub fn due_from_start(anchor: DateTime<Utc>, step: &Step) -> DateTime<Utc> {
    shift(anchor, step_offset_duration(step))
}

/// Due-date of `next` when the instance last moved at `last_step_at` on `current`.
pub fn due_after(last_step_at: DateTime<Utc>, current: &Step, next: &Step) -> DateTime<Utc> {
    shift(last_step_at, step_delta(current, next))
}

/// `at + offset`, saturating at the last representable instant. Rows
/// written before offsets were bounded can still hold huge day offsets.
fn shift(at: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    at.checked_add_signed(offset).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Step with the given order. `steps` must be sorted by order.
pub fn step_by_order(steps: &[Step], order: u32) -> Option<&Step> {
    steps.iter().find(|s| s.order == order)
}

/// The wave that starts at the first step after `current_step`.
/// Returns `None` when every step has been handled.
pub fn next_wave(steps: &[Step], current_step: u32) -> Option<&[Step]> {
    let start = steps.iter().position(|s| s.order > current_step)?;
    let offset = step_offset_duration(&steps[start]);
    let len = steps[start..]
        .iter()
        .take_while(|s| step_offset_duration(s) == offset)
        .count();
    Some(&steps[start..start + len])
}

/// Last order of the wave containing `order`. `0` stays `0`.
pub fn wave_end(steps: &[Step], order: u32) -> u32 {
    let Some(step) = step_by_order(steps, order) else {
        return order;
    };
    let offset = step_offset_duration(step);
    steps
        .iter()
        .filter(|s| s.order >= order && step_offset_duration(s) == offset)
        .map(|s| s.order)
        .max()
        .unwrap_or(order)
}

/// Due-date of the first wave for an instance starting at `started_at`.
pub fn first_due(steps: &[Step], started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_wave(steps, 0).map(|wave| due_from_start(started_at, &wave[0]))
}
