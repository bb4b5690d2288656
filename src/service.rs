//! The registry: every state-changing operation of the reservation core.
//!
//! Operations that move a seat (register, cancel, remove, delete, resync,
//! completion) run inside one event transaction and write the counter only
//! through [`capacity`]. Check-in and payment facts are single-reservation
//! writes and never touch the event.

use chrono::{DateTime, Months, NaiveDate, Utc};
use log::{info, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::capacity;
use crate::error::{AppError, AppResult};
use crate::models::{
    BulkCheckInFailure, BulkCheckInReport, CheckInRecord, DeleteEventResponse, Event,
    EventChanges, EventListQuery, EventStatus, NewEventRequest, PaymentRecord, PaymentStatus,
    RecordPaymentRequest, Reservation, ReservationStatus, TimeSlot, User,
};
use crate::store::{EventDetails, EventQuery, ReservationPatch, Store};

const MAX_TITLE_LEN: usize = 200;
const MAX_NOTES_LEN: usize = 1000;
/// Events may be scheduled at most this far ahead.
const SCHEDULING_HORIZON_MONTHS: u32 = 2;

#[derive(Clone)]
pub struct Registry<S: Store> {
    pub(crate) store: S,
}

/// Trims free text and drops it when nothing is left.
pub(crate) fn clean_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_title(title: &str) -> AppResult<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(AppError::Validation("title is required".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(AppError::Validation(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(title.to_string())
}

fn validate_capacity(capacity: i32) -> AppResult<()> {
    if capacity < 1 {
        return Err(AppError::Validation("capacity must be at least 1".to_string()));
    }
    Ok(())
}

fn validate_date(date: NaiveDate, now: DateTime<Utc>) -> AppResult<()> {
    let today = now.date_naive();
    let horizon = today
        .checked_add_months(Months::new(SCHEDULING_HORIZON_MONTHS))
        .ok_or_else(|| AppError::Validation("date out of range".to_string()))?;
    if date < today || date > horizon {
        return Err(AppError::Validation(format!(
            "date must be between {today} and {horizon}"
        )));
    }
    Ok(())
}

fn validate_notes(notes: Option<String>) -> AppResult<Option<String>> {
    let notes = clean_text(notes);
    if notes.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTES_LEN) {
        return Err(AppError::Validation(format!(
            "notes must be at most {MAX_NOTES_LEN} characters"
        )));
    }
    Ok(notes)
}

fn validate_limit(limit: Option<i64>) -> AppResult<Option<i64>> {
    match limit {
        Some(l) if l < 1 => Err(AppError::Validation("limit must be positive".to_string())),
        other => Ok(other),
    }
}

impl<S: Store> Registry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Resolves a caller uid against its role record.
    pub fn principal(&self, uid: &str) -> AppResult<Principal> {
        self.store
            .find_user(uid)?
            .map(Principal::from)
            .ok_or_else(|| AppError::Unauthenticated(format!("no role record for '{uid}'")))
    }

    // ---- events --------------------------------------------------------

    pub fn create_event(
        &self,
        caller: &Principal,
        request: NewEventRequest,
        now: DateTime<Utc>,
    ) -> AppResult<Event> {
        caller.require_admin()?;
        let title = validate_title(&request.title)?;
        validate_capacity(request.capacity)?;
        validate_date(request.date, now)?;

        let event = Event {
            id: Uuid::new_v4(),
            title,
            description: clean_text(request.description),
            date: request.date,
            time_slot: request.time_slot,
            duration_hours: TimeSlot::DURATION_HOURS,
            capacity: request.capacity,
            registered_count: 0,
            status: EventStatus::Scheduled,
            location: clean_text(request.location),
            created_by: caller.uid().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_event(&event)?;
        info!("event {} '{}' created by {}", event.id, event.title, caller.uid());
        Ok(event)
    }

    pub fn update_event(
        &self,
        caller: &Principal,
        event_id: Uuid,
        changes: EventChanges,
        now: DateTime<Utc>,
    ) -> AppResult<Event> {
        caller.require_admin()?;
        self.store.in_event_transaction(event_id, |scope| {
            let current = scope.event().clone();
            let mut details = EventDetails::from(&current);

            if let Some(title) = changes.title {
                details.title = validate_title(&title)?;
            }
            if let Some(description) = changes.description {
                details.description = clean_text(Some(description));
            }
            if let Some(location) = changes.location {
                details.location = clean_text(Some(location));
            }
            if let Some(time_slot) = changes.time_slot {
                details.time_slot = time_slot;
            }
            if let Some(date) = changes.date {
                if date != current.date {
                    validate_date(date, now)?;
                }
                details.date = date;
            }
            if let Some(capacity) = changes.capacity {
                validate_capacity(capacity)?;
                if capacity < current.registered_count {
                    return Err(AppError::InvalidState(format!(
                        "capacity {capacity} is below the {} confirmed reservations",
                        current.registered_count
                    )));
                }
                details.capacity = capacity;
            }

            let status = match changes.status {
                Some(target) => {
                    capacity::resolve_target(target, details.capacity, current.registered_count)
                }
                None => capacity::derive_status(
                    current.status,
                    details.capacity,
                    current.registered_count,
                ),
            };
            scope.write_details(&details, status, now)?;
            Ok(scope.event().clone())
        })
    }

    /// Deletes the event and cancels its confirmed reservations in the same
    /// transaction. The reservation records themselves are kept.
    pub fn delete_event(
        &self,
        caller: &Principal,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<DeleteEventResponse> {
        caller.require_admin()?;
        let cancelled = self.store.in_event_transaction(event_id, |scope| {
            let cancelled = scope.cancel_all_confirmed(now)?;
            scope.delete_event()?;
            Ok(cancelled)
        })?;
        info!("event {event_id} deleted by {}, {cancelled} reservation(s) cancelled", caller.uid());
        Ok(DeleteEventResponse {
            event_id,
            cancelled_reservations: cancelled,
        })
    }

    pub fn event(&self, event_id: Uuid) -> AppResult<Event> {
        self.store
            .find_event(event_id)?
            .ok_or_else(|| AppError::NotFound(format!("event {event_id}")))
    }

    pub fn events(&self, filter: &EventListQuery) -> AppResult<Vec<Event>> {
        if let (Some(start), Some(end)) = (filter.start_date, filter.end_date) {
            if start > end {
                return Err(AppError::Validation(
                    "start_date must not be after end_date".to_string(),
                ));
            }
        }
        self.store.query_events(&EventQuery {
            start_date: filter.start_date,
            end_date: filter.end_date,
            status: filter.status,
            time_slot: filter.time_slot,
            limit: validate_limit(filter.limit)?,
            ..EventQuery::default()
        })
    }

    /// Scheduled events from today on, soonest first.
    pub fn upcoming_events(&self, limit: Option<i64>, now: DateTime<Utc>) -> AppResult<Vec<Event>> {
        self.store.query_events(&EventQuery {
            start_date: Some(now.date_naive()),
            status: Some(EventStatus::Scheduled),
            limit: validate_limit(limit)?,
            ..EventQuery::default()
        })
    }

    pub fn events_created_by(
        &self,
        caller: &Principal,
        limit: Option<i64>,
    ) -> AppResult<Vec<Event>> {
        caller.require_admin()?;
        self.store.query_events(&EventQuery {
            created_by: Some(caller.uid().to_string()),
            limit: validate_limit(limit)?,
            newest_first: true,
            ..EventQuery::default()
        })
    }

    /// Marks an event completed once its end has passed. Returns whether the
    /// status changed; cancelled, already completed and still running events
    /// are left alone.
    pub fn complete_event(&self, event_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        self.store.in_event_transaction(event_id, |scope| {
            let event = scope.event();
            if event.status.is_terminal() || event.ends_at() > now {
                return Ok(false);
            }
            capacity::transition(scope, EventStatus::Completed, now)?;
            info!("event {event_id} completed");
            Ok(true)
        })
    }

    /// Completes every finished event. Events deleted while the sweep runs
    /// are skipped.
    pub fn complete_past_events(
        &self,
        caller: &Principal,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        caller.require_admin()?;
        let candidates = self.store.query_events(&EventQuery {
            end_date: Some(now.date_naive()),
            ..EventQuery::default()
        })?;

        let mut completed = Vec::new();
        for event in candidates
            .into_iter()
            .filter(|e| !e.status.is_terminal() && e.ends_at() <= now)
        {
            match self.complete_event(event.id, now) {
                Ok(true) => completed.push(event.id),
                Ok(false) | Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(completed)
    }

    /// Recounts confirmed reservations and writes the result through the
    /// counter choke point.
    pub fn resync_event(
        &self,
        caller: &Principal,
        event_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Event> {
        caller.require_admin()?;
        self.store.in_event_transaction(event_id, |scope| {
            let counted = scope.count_confirmed()?;
            let counted = i32::try_from(counted)
                .map_err(|_| {
                    AppError::Internal(format!("confirmed count {counted} out of range"))
                })?;
            let previous = scope.event().registered_count;
            if previous != counted {
                warn!("event {event_id}: counter drift, stored {previous}, counted {counted}");
            }
            capacity::reconcile(scope, counted, now)?;
            Ok(scope.event().clone())
        })
    }

    // ---- registration and cancellation ----------------------------------

    /// Registers the caller into the event.
    pub fn register(
        &self,
        caller: &Principal,
        event_id: Uuid,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        self.reserve(event_id, caller.user(), validate_notes(notes)?, now)
    }

    /// Admin path: registers an existing user record into the event.
    pub fn register_user(
        &self,
        caller: &Principal,
        event_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        caller.require_admin()?;
        let user = self
            .store
            .find_user(user_id)?
            .ok_or_else(|| AppError::NotFound(format!("user '{user_id}'")))?;
        self.reserve(event_id, &user, None, now)
    }

    fn reserve(
        &self,
        event_id: Uuid,
        user: &User,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        let reservation = self.store.in_event_transaction(event_id, |scope| {
            if scope.confirmed_reservation_for(&user.uid)?.is_some() {
                return Err(AppError::DuplicateReservation {
                    event_id,
                    user_id: user.uid.clone(),
                });
            }
            capacity::ensure_open(scope.event())?;

            let reservation = Reservation::confirmed(event_id, user, notes, now);
            scope.insert_reservation(&reservation)?;
            let next = scope.event().registered_count + 1;
            capacity::reconcile(scope, next, now)?;
            Ok(reservation)
        })?;
        info!(
            "reservation {} confirmed for user {} on event {event_id}",
            reservation.id, user.uid
        );
        Ok(reservation)
    }

    /// The caller cancels their own reservation, subject to the 24 hour
    /// window.
    pub fn cancel(
        &self,
        caller: &Principal,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        let reservation = self.find_reservation(reservation_id)?;
        if reservation.user_id != caller.uid() {
            return Err(AppError::PermissionDenied(
                "only the holder may cancel a reservation".to_string(),
            ));
        }
        self.release(reservation, now, true)
    }

    /// Admin override of [`Registry::cancel`]: no cancellation window.
    pub fn remove_participant(
        &self,
        caller: &Principal,
        event_id: Uuid,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        caller.require_admin()?;
        let reservation = self.find_reservation(reservation_id)?;
        if reservation.event_id != event_id {
            return Err(AppError::NotFound(format!(
                "reservation {reservation_id} on event {event_id}"
            )));
        }
        self.release(reservation, now, false)
    }

    fn release(
        &self,
        reservation: Reservation,
        now: DateTime<Utc>,
        enforce_window: bool,
    ) -> AppResult<Reservation> {
        if !reservation.is_confirmed() {
            return Err(not_confirmed(&reservation));
        }
        let reservation_id = reservation.id;

        self.store.in_event_transaction(reservation.event_id, |scope| {
            // Re-read under the event lock; a concurrent cancel may have won.
            let mut current = scope
                .reservation(reservation_id)?
                .ok_or_else(|| AppError::NotFound(format!("reservation {reservation_id}")))?;
            if !current.is_confirmed() {
                return Err(not_confirmed(&current));
            }
            if enforce_window {
                capacity::ensure_cancellable(scope.event(), now)?;
            }

            scope.set_reservation_status(reservation_id, ReservationStatus::Cancelled, now)?;
            let next = (scope.event().registered_count - 1).max(0);
            capacity::reconcile(scope, next, now)?;

            current.status = ReservationStatus::Cancelled;
            current.updated_at = now;
            Ok(current)
        })
    }

    // ---- check-in and payment ---------------------------------------------

    pub fn check_in(
        &self,
        caller: &Principal,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        caller.require_admin()?;
        self.apply_check_in(caller, reservation_id, now)
    }

    fn apply_check_in(
        &self,
        caller: &Principal,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        let record = CheckInRecord {
            checked_in_at: now,
            checked_in_by: caller.uid().to_string(),
            checked_in_by_name: caller.display_name().map(str::to_string),
        };
        self.store
            .update_reservation(reservation_id, &ReservationPatch::CheckIn(Some(record)), now)
    }

    /// Clears the check-in record. Succeeds when there was none.
    pub fn undo_check_in(
        &self,
        caller: &Principal,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        caller.require_admin()?;
        self.store
            .update_reservation(reservation_id, &ReservationPatch::CheckIn(None), now)
    }

    /// Checks in each reservation independently; one failure never stops
    /// the rest.
    pub fn bulk_check_in(
        &self,
        caller: &Principal,
        reservation_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> AppResult<BulkCheckInReport> {
        caller.require_admin()?;
        let mut report = BulkCheckInReport::default();
        for &reservation_id in reservation_ids {
            match self.apply_check_in(caller, reservation_id, now) {
                Ok(reservation) => report.checked_in.push(reservation),
                Err(e) => {
                    warn!("bulk check-in of {reservation_id} failed: {e}");
                    report.failed.push(BulkCheckInFailure {
                        reservation_id,
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Replaces the payment record and marks the reservation paid.
    pub fn record_payment(
        &self,
        caller: &Principal,
        reservation_id: Uuid,
        request: RecordPaymentRequest,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        caller.require_admin()?;
        if request.amount_cents <= 0 {
            return Err(AppError::Validation("payment amount must be positive".to_string()));
        }
        let record = PaymentRecord {
            amount_cents: request.amount_cents,
            method: request.method,
            paid_at: now,
            processed_by: caller.uid().to_string(),
            processed_by_name: caller.display_name().map(str::to_string),
            transaction_id: clean_text(request.transaction_id),
            notes: validate_notes(request.notes)?,
        };
        let updated = self
            .store
            .update_reservation(reservation_id, &ReservationPatch::Payment(record), now)?;
        info!(
            "payment of {} cents recorded on reservation {reservation_id} by {}",
            request.amount_cents,
            caller.uid()
        );
        Ok(updated)
    }

    /// Any status may follow any other; the payment record is kept.
    pub fn update_payment_status(
        &self,
        caller: &Principal,
        reservation_id: Uuid,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        caller.require_admin()?;
        self.store
            .update_reservation(reservation_id, &ReservationPatch::PaymentStatus(status), now)
    }

    pub fn reservation(&self, caller: &Principal, reservation_id: Uuid) -> AppResult<Reservation> {
        let reservation = self.find_reservation(reservation_id)?;
        caller.require_owner_or_admin(&reservation.user_id)?;
        Ok(reservation)
    }

    fn find_reservation(&self, reservation_id: Uuid) -> AppResult<Reservation> {
        self.store
            .find_reservation(reservation_id)?
            .ok_or_else(|| AppError::NotFound(format!("reservation {reservation_id}")))
    }
}

fn not_confirmed(reservation: &Reservation) -> AppError {
    AppError::InvalidState(format!(
        "reservation {} is {}, not CONFIRMED",
        reservation.id, reservation.status
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::{PaymentMethod, UserRole};
    use chrono::{Duration, TimeZone};

    pub(crate) fn clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    pub(crate) fn event_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
    }

    pub(crate) fn add_user(
        registry: &Registry<MemoryStore>,
        uid: &str,
        role: UserRole,
    ) -> Principal {
        let user = User {
            uid: uid.to_string(),
            email: format!("{uid}@example.com"),
            phone: None,
            display_name: Some(uid.to_uppercase()),
            role,
            password_hash: None,
            created_at: clock(),
            updated_at: clock(),
        };
        registry.store.insert_user(&user).unwrap();
        Principal::from(user)
    }

    pub(crate) fn setup() -> (Registry<MemoryStore>, Principal) {
        let registry = Registry::new(MemoryStore::new());
        let admin = add_user(&registry, "admin", UserRole::Admin);
        (registry, admin)
    }

    pub(crate) fn new_event(
        registry: &Registry<MemoryStore>,
        admin: &Principal,
        capacity: i32,
    ) -> Event {
        registry
            .create_event(
                admin,
                NewEventRequest {
                    title: "Pottery workshop".into(),
                    description: None,
                    date: event_day(),
                    time_slot: TimeSlot::Morning,
                    capacity,
                    location: Some("Studio 2".into()),
                },
                clock(),
            )
            .unwrap()
    }

    fn count(registry: &Registry<MemoryStore>, event_id: Uuid) -> i32 {
        registry.event(event_id).unwrap().registered_count
    }

    #[test]
    fn seat_lifecycle_on_a_single_seat_event() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let b = add_user(&registry, "bob", UserRole::Guest);
        let event = new_event(&registry, &admin, 1);

        let ra = registry.register(&a, event.id, None, clock()).unwrap();
        let after = registry.event(event.id).unwrap();
        assert_eq!(after.registered_count, 1);
        assert_eq!(after.status, EventStatus::Full);

        assert!(matches!(
            registry.register(&b, event.id, None, clock()),
            Err(AppError::EventFull(_))
        ));

        registry.cancel(&a, ra.id, clock()).unwrap();
        let after = registry.event(event.id).unwrap();
        assert_eq!(after.registered_count, 0);
        assert_eq!(after.status, EventStatus::Scheduled);

        registry.register(&b, event.id, None, clock()).unwrap();
        assert_eq!(count(&registry, event.id), 1);
    }

    #[test]
    fn full_event_rejects_without_writing() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let b = add_user(&registry, "bob", UserRole::Guest);
        let event = new_event(&registry, &admin, 1);
        registry.register(&a, event.id, None, clock()).unwrap();
        let before = registry.event(event.id).unwrap();

        let err = registry.register(&b, event.id, None, clock()).unwrap_err();
        assert!(matches!(err, AppError::EventFull(_)));
        assert_eq!(registry.event(event.id).unwrap(), before);
        assert_eq!(registry.store.reservations_for_event(event.id).unwrap().len(), 1);
    }

    #[test]
    fn second_registration_is_a_duplicate() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 5);
        registry.register(&a, event.id, Some("  vegetarian ".into()), clock()).unwrap();

        assert!(matches!(
            registry.register(&a, event.id, None, clock()),
            Err(AppError::DuplicateReservation { .. })
        ));
        assert_eq!(count(&registry, event.id), 1);
    }

    #[test]
    fn missing_event_is_not_found() {
        let (registry, _) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        assert!(matches!(
            registry.register(&a, Uuid::new_v4(), None, clock()),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn closed_events_take_no_registrations() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 5);
        registry
            .update_event(
                &admin,
                event.id,
                EventChanges {
                    status: Some(EventStatus::Cancelled),
                    ..EventChanges::default()
                },
                clock(),
            )
            .unwrap();

        assert!(matches!(
            registry.register(&a, event.id, None, clock()),
            Err(AppError::InvalidState(_))
        ));
    }

    #[test]
    fn concurrent_registrations_never_overbook() {
        let (registry, admin) = setup();
        let event = new_event(&registry, &admin, 5);
        let guests: Vec<Principal> = (0..20)
            .map(|i| add_user(&registry, &format!("guest{i}"), UserRole::Guest))
            .collect();

        let results: Vec<AppResult<Reservation>> = std::thread::scope(|s| {
            let handles: Vec<_> = guests
                .iter()
                .map(|g| {
                    let registry = registry.clone();
                    s.spawn(move || registry.register(g, event.id, None, clock()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let won = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(won, 5);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AppError::EventFull(_))));

        let after = registry.event(event.id).unwrap();
        assert_eq!(after.registered_count, 5);
        assert_eq!(after.status, EventStatus::Full);
    }

    #[test]
    fn two_racers_for_the_last_seat() {
        let (registry, admin) = setup();
        let event = new_event(&registry, &admin, 2);
        let first = add_user(&registry, "first", UserRole::Guest);
        registry.register(&first, event.id, None, clock()).unwrap();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let b = add_user(&registry, "bob", UserRole::Guest);

        let (ra, rb) = std::thread::scope(|s| {
            let ha = s.spawn(|| registry.register(&a, event.id, None, clock()));
            let hb = s.spawn(|| registry.register(&b, event.id, None, clock()));
            (ha.join().unwrap(), hb.join().unwrap())
        });

        assert!(ra.is_ok() ^ rb.is_ok());
        assert_eq!(count(&registry, event.id), 2);
    }

    #[test]
    fn cancellation_window_closes_a_day_before_start() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();
        let starts = event.starts_at();

        let late = starts - Duration::hours(23) - Duration::minutes(59);
        assert!(matches!(
            registry.cancel(&a, reservation.id, late),
            Err(AppError::PolicyViolation(_))
        ));
        assert_eq!(count(&registry, event.id), 1);

        let in_time = starts - Duration::hours(24) - Duration::minutes(1);
        let cancelled = registry.cancel(&a, reservation.id, in_time).unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        assert_eq!(count(&registry, event.id), 0);
    }

    #[test]
    fn admins_remove_inside_the_window() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();
        let an_hour_before = event.starts_at() - Duration::hours(1);

        registry
            .remove_participant(&admin, event.id, reservation.id, an_hour_before)
            .unwrap();
        assert_eq!(count(&registry, event.id), 0);

        assert!(matches!(
            registry.remove_participant(&admin, Uuid::new_v4(), reservation.id, clock()),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_cancels_decrement_once() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let b = add_user(&registry, "bob", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();
        registry.register(&b, event.id, None, clock()).unwrap();

        let (first, second) = std::thread::scope(|s| {
            let h1 = s.spawn(|| registry.cancel(&a, reservation.id, clock()));
            let h2 = s.spawn(|| registry.cancel(&a, reservation.id, clock()));
            (h1.join().unwrap(), h2.join().unwrap())
        });

        assert!(first.is_ok() ^ second.is_ok());
        let loser = if first.is_err() { first } else { second };
        assert!(matches!(loser, Err(AppError::InvalidState(_))));
        assert_eq!(count(&registry, event.id), 1);
    }

    #[test]
    fn cancelling_twice_is_invalid_state() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();
        registry.cancel(&a, reservation.id, clock()).unwrap();

        assert!(matches!(
            registry.cancel(&a, reservation.id, clock()),
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(count(&registry, event.id), 0);
    }

    #[test]
    fn guests_cannot_cancel_for_others() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let b = add_user(&registry, "bob", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();

        assert!(matches!(
            registry.cancel(&b, reservation.id, clock()),
            Err(AppError::PermissionDenied(_))
        ));
        assert!(matches!(
            registry.reservation(&b, reservation.id),
            Err(AppError::PermissionDenied(_))
        ));
        assert!(registry.reservation(&admin, reservation.id).is_ok());
    }

    #[test]
    fn check_in_round_trip_leaves_the_counter_alone() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 1);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();
        let before = registry.event(event.id).unwrap();

        let checked = registry.check_in(&admin, reservation.id, clock()).unwrap();
        assert!(checked.is_checked_in());
        assert_eq!(
            checked.check_in.as_ref().map(|c| c.checked_in_by.as_str()),
            Some("admin")
        );

        let undone = registry.undo_check_in(&admin, reservation.id, clock()).unwrap();
        assert!(!undone.is_checked_in());
        let again = registry.undo_check_in(&admin, reservation.id, clock()).unwrap();
        assert!(!again.is_checked_in());

        let after = registry.event(event.id).unwrap();
        assert_eq!(after.registered_count, before.registered_count);
        assert_eq!(after.status, before.status);
    }

    #[test]
    fn bulk_check_in_isolates_failures() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let b = add_user(&registry, "bob", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let ra = registry.register(&a, event.id, None, clock()).unwrap();
        let rb = registry.register(&b, event.id, None, clock()).unwrap();
        let bogus = Uuid::new_v4();

        let report = registry
            .bulk_check_in(&admin, &[ra.id, bogus, rb.id], clock())
            .unwrap();
        let done: Vec<Uuid> = report.checked_in.iter().map(|r| r.id).collect();
        assert_eq!(done, vec![ra.id, rb.id]);
        assert!(report.checked_in.iter().all(Reservation::is_checked_in));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].reservation_id, bogus);
        assert_eq!(report.failed[0].code, "NOT_FOUND");

        assert!(matches!(
            registry.bulk_check_in(&a, &[ra.id], clock()),
            Err(AppError::PermissionDenied(_))
        ));
    }

    #[test]
    fn refund_keeps_the_payment_record() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();

        let paid = registry
            .record_payment(
                &admin,
                reservation.id,
                RecordPaymentRequest {
                    amount_cents: 50,
                    method: PaymentMethod::Cash,
                    transaction_id: None,
                    notes: None,
                },
                clock(),
            )
            .unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);
        assert_eq!(paid.payment.as_ref().map(|p| p.amount_cents), Some(50));

        let refunded = registry
            .update_payment_status(&admin, reservation.id, PaymentStatus::Refunded, clock())
            .unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
        assert_eq!(refunded.payment.as_ref().map(|p| p.amount_cents), Some(50));
    }

    #[test]
    fn non_positive_payments_are_rejected() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();

        for amount_cents in [0, -100] {
            let result = registry.record_payment(
                &admin,
                reservation.id,
                RecordPaymentRequest {
                    amount_cents,
                    method: PaymentMethod::Other,
                    transaction_id: None,
                    notes: None,
                },
                clock(),
            );
            assert!(matches!(result, Err(AppError::Validation(_))));
        }
    }

    #[test]
    fn event_creation_is_validated_and_admin_only() {
        let (registry, admin) = setup();
        let guest = add_user(&registry, "alice", UserRole::Guest);
        let request = |title: &str, capacity: i32, date: NaiveDate| NewEventRequest {
            title: title.into(),
            description: None,
            date,
            time_slot: TimeSlot::Afternoon,
            capacity,
            location: None,
        };

        assert!(matches!(
            registry.create_event(&guest, request("Yoga", 5, event_day()), clock()),
            Err(AppError::PermissionDenied(_))
        ));
        assert!(matches!(
            registry.create_event(&admin, request("   ", 5, event_day()), clock()),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            registry.create_event(&admin, request("Yoga", 0, event_day()), clock()),
            Err(AppError::Validation(_))
        ));
        let yesterday = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        assert!(registry.create_event(&admin, request("Yoga", 5, yesterday), clock()).is_err());
        let too_far = NaiveDate::from_ymd_opt(2026, 5, 2).unwrap();
        assert!(registry.create_event(&admin, request("Yoga", 5, too_far), clock()).is_err());

        let event = registry
            .create_event(&admin, request(" Yoga ", 5, event_day()), clock())
            .unwrap();
        assert_eq!(event.title, "Yoga");
        assert_eq!(event.duration_hours, 3);
        assert_eq!(event.status, EventStatus::Scheduled);
        assert_eq!(event.created_by, "admin");
    }

    #[test]
    fn capacity_edits_follow_the_counter() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let b = add_user(&registry, "bob", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        registry.register(&a, event.id, None, clock()).unwrap();
        registry.register(&b, event.id, None, clock()).unwrap();

        let shrink = |capacity| EventChanges {
            capacity: Some(capacity),
            ..EventChanges::default()
        };
        assert!(matches!(
            registry.update_event(&admin, event.id, shrink(1), clock()),
            Err(AppError::InvalidState(_))
        ));

        let full = registry.update_event(&admin, event.id, shrink(2), clock()).unwrap();
        assert_eq!(full.status, EventStatus::Full);

        let reopened = registry.update_event(&admin, event.id, shrink(4), clock()).unwrap();
        assert_eq!(reopened.status, EventStatus::Scheduled);
        assert_eq!(reopened.registered_count, 2);
    }

    #[test]
    fn deletion_cancels_confirmed_reservations() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let event = new_event(&registry, &admin, 3);
        let reservation = registry.register(&a, event.id, None, clock()).unwrap();

        let deleted = registry.delete_event(&admin, event.id, clock()).unwrap();
        assert_eq!(deleted.cancelled_reservations, 1);
        assert!(matches!(registry.event(event.id), Err(AppError::NotFound(_))));

        let kept = registry.reservation(&a, reservation.id).unwrap();
        assert_eq!(kept.status, ReservationStatus::Cancelled);
    }

    #[test]
    fn resync_repairs_counter_drift() {
        let (registry, admin) = setup();
        let a = add_user(&registry, "alice", UserRole::Guest);
        let b = add_user(&registry, "bob", UserRole::Guest);
        let event = new_event(&registry, &admin, 2);
        registry.register(&a, event.id, None, clock()).unwrap();

        // Write a reservation behind the counter's back.
        registry
            .store
            .in_event_transaction(event.id, |scope| {
                scope.insert_reservation(&Reservation::confirmed(event.id, b.user(), None, clock()))
            })
            .unwrap();
        assert_eq!(count(&registry, event.id), 1);

        let repaired = registry.resync_event(&admin, event.id, clock()).unwrap();
        assert_eq!(repaired.registered_count, 2);
        assert_eq!(repaired.status, EventStatus::Full);
    }

    #[test]
    fn events_complete_after_they_end() {
        let (registry, admin) = setup();
        let event = new_event(&registry, &admin, 2);

        assert!(!registry.complete_event(event.id, event.starts_at()).unwrap());

        let later = event.ends_at() + Duration::minutes(1);
        assert_eq!(registry.complete_past_events(&admin, later).unwrap(), vec![event.id]);
        assert_eq!(registry.event(event.id).unwrap().status, EventStatus::Completed);
        assert!(!registry.complete_event(event.id, later).unwrap());
    }

    #[test]
    fn listings_filter_and_order() {
        let (registry, admin) = setup();
        let later = registry
            .create_event(
                &admin,
                NewEventRequest {
                    title: "Later".into(),
                    description: None,
                    date: NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
                    time_slot: TimeSlot::Morning,
                    capacity: 1,
                    location: None,
                },
                clock(),
            )
            .unwrap();
        let sooner = new_event(&registry, &admin, 4);

        let all = registry.events(&EventListQuery::default()).unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![sooner.id, later.id]);

        let mine = registry.events_created_by(&admin, Some(1)).unwrap();
        assert_eq!(mine.iter().map(|e| e.id).collect::<Vec<_>>(), vec![later.id]);

        let bad = EventListQuery {
            limit: Some(0),
            ..EventListQuery::default()
        };
        assert!(matches!(registry.events(&bad), Err(AppError::Validation(_))));

        let upcoming = registry.upcoming_events(None, clock()).unwrap();
        assert_eq!(upcoming.len(), 2);
    }
}
