use chrono::{NaiveTime, Timelike};

use crate::model::*;

use super::EngineError;

/// Reject slots that cannot be booked: empty, reversed (overnight) or not on
/// whole minutes.
pub fn validate_slot(slot: &Slot) -> Result<(), EngineError> {
    if !on_whole_minute(slot.start) || !on_whole_minute(slot.end) {
        return Err(EngineError::InvalidInput(
            "times must be whole minutes".into(),
        ));
    }
    if slot.start == slot.end {
        return Err(EngineError::InvalidInput(format!(
            "empty slot [{}, {})",
            slot.start, slot.end
        )));
    }
    if slot.end < slot.start {
        return Err(EngineError::InvalidInput(format!(
            "slot [{}, {}) crosses midnight; bookings must start and end on the same day",
            slot.start, slot.end
        )));
    }
    Ok(())
}

fn on_whole_minute(t: NaiveTime) -> bool {
    t.second() == 0 && t.nanosecond() == 0
}

pub fn is_available(schedule: &DaySchedule, slot: &Slot) -> bool {
    check_no_conflict(schedule, slot).is_ok()
}

/// Fails with the first pending or confirmed booking that intersects `slot`.
/// Cancelled bookings never block.
pub(crate) fn check_no_conflict(schedule: &DaySchedule, slot: &Slot) -> Result<(), EngineError> {
    debug_assert_eq!(schedule.date, slot.date);
    match schedule.overlapping(slot).find(|b| b.state.is_active()) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
