//! Capacity reconciliation: the only code allowed to write an event's
//! `registered_count` and derived status.

use chrono::{DateTime, Duration, Utc};
use log::info;

use crate::error::{AppError, AppResult};
use crate::models::{Event, EventStatus};
use crate::store::EventScope;

/// Users may cancel until this long before the event starts.
pub const CANCELLATION_WINDOW_HOURS: i64 = 24;

/// Status an event should carry for `registered_count` against `capacity`.
/// Cancelled and completed events keep their status.
pub fn derive_status(current: EventStatus, capacity: i32, registered_count: i32) -> EventStatus {
    if current.is_terminal() {
        current
    } else if registered_count >= capacity {
        EventStatus::Full
    } else {
        EventStatus::Scheduled
    }
}

/// Sets the counter to `new_count` and re-derives the status.
///
/// The count is supplied by the caller; this never recounts reservations.
/// Runs inside the event transaction, so the event is known to exist.
pub fn reconcile(
    scope: &mut dyn EventScope,
    new_count: i32,
    now: DateTime<Utc>,
) -> AppResult<EventStatus> {
    if new_count < 0 {
        return Err(AppError::InvalidState(format!(
            "registered count cannot be negative (got {new_count})"
        )));
    }
    let event = scope.event();
    let status = derive_status(event.status, event.capacity, new_count);
    let (event_id, previous) = (event.id, event.registered_count);
    scope.write_tally(new_count, status, now)?;
    info!("event {event_id}: registered count {previous} -> {new_count}, status {status}");
    Ok(status)
}

/// Moves the event to `target`, keeping the counter. Non-terminal targets
/// are re-derived from the counter, so an admin cannot mark an event with
/// free seats as full or reopen one that is at capacity as scheduled.
pub fn transition(
    scope: &mut dyn EventScope,
    target: EventStatus,
    now: DateTime<Utc>,
) -> AppResult<EventStatus> {
    let event = scope.event();
    let status = resolve_target(target, event.capacity, event.registered_count);
    let count = event.registered_count;
    scope.write_tally(count, status, now)?;
    Ok(status)
}

/// The status an admin-requested `target` lands on for the given counter.
pub fn resolve_target(target: EventStatus, capacity: i32, registered_count: i32) -> EventStatus {
    if target.is_terminal() {
        target
    } else {
        derive_status(EventStatus::Scheduled, capacity, registered_count)
    }
}

/// Rejects anything but a schedulable event with a free seat.
pub fn ensure_open(event: &Event) -> AppResult<()> {
    if event.status.is_terminal() {
        return Err(AppError::InvalidState(format!(
            "event {} is {} and accepts no registrations",
            event.id, event.status
        )));
    }
    if event.is_full() {
        return Err(AppError::EventFull(event.id));
    }
    Ok(())
}

/// Enforces the cancellation window against the event's start instant.
pub fn ensure_cancellable(event: &Event, now: DateTime<Utc>) -> AppResult<()> {
    let remaining = event.starts_at() - now;
    if remaining < Duration::hours(CANCELLATION_WINDOW_HOURS) {
        return Err(AppError::PolicyViolation(format!(
            "reservations cannot be cancelled within {CANCELLATION_WINDOW_HOURS} hours of the event"
        )));
    }
    Ok(())
}
