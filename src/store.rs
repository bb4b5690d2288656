//! The persistence contract the registry runs against.
//!
//! Two shapes of write exist. Anything that touches an event's counter runs
//! inside [`Store::in_event_transaction`], which serializes all such work per
//! event and commits it atomically. Check-in and payment facts only touch a
//! single reservation and go through [`Store::update_reservation`].

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    CheckInRecord, Event, EventStatus, PaymentRecord, PaymentStatus, Reservation,
    ReservationStatus, TimeSlot, User,
};

/// Equality/range filter over the events collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: Option<EventStatus>,
    pub time_slot: Option<TimeSlot>,
    pub created_by: Option<String>,
    pub limit: Option<i64>,
    /// Date descending instead of the default ascending order.
    pub newest_first: bool,
}

impl EventQuery {
    pub fn matches(&self, event: &Event) -> bool {
        self.start_date.map_or(true, |d| event.date >= d)
            && self.end_date.map_or(true, |d| event.date <= d)
            && self.status.map_or(true, |s| event.status == s)
            && self.time_slot.map_or(true, |s| event.time_slot == s)
            && self.created_by.as_deref().map_or(true, |c| event.created_by == c)
    }
}

/// Editable event attributes, already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDetails {
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub capacity: i32,
    pub location: Option<String>,
}

impl From<&Event> for EventDetails {
    fn from(event: &Event) -> Self {
        Self {
            title: event.title.clone(),
            description: event.description.clone(),
            date: event.date,
            time_slot: event.time_slot,
            capacity: event.capacity,
            location: event.location.clone(),
        }
    }
}

/// Single-document mutation of a reservation's sub-ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationPatch {
    CheckIn(Option<CheckInRecord>),
    /// Replaces the payment record and marks the reservation paid.
    Payment(PaymentRecord),
    PaymentStatus(PaymentStatus),
}

impl ReservationPatch {
    pub fn apply(&self, reservation: &mut Reservation, now: DateTime<Utc>) {
        match self {
            ReservationPatch::CheckIn(record) => reservation.check_in = record.clone(),
            ReservationPatch::Payment(record) => {
                reservation.payment = Some(record.clone());
                reservation.payment_status = PaymentStatus::Paid;
            }
            ReservationPatch::PaymentStatus(status) => reservation.payment_status = *status,
        }
        reservation.updated_at = now;
    }
}

/// Work scoped to one locked event. Nothing written through a scope is
/// visible to other writers until the surrounding transaction commits, and
/// nothing is kept if the work returns an error.
pub trait EventScope {
    /// The locked event, reflecting writes made through this scope.
    fn event(&self) -> &Event;

    fn reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>>;

    fn confirmed_reservation_for(&mut self, user_id: &str) -> AppResult<Option<Reservation>>;

    fn count_confirmed(&mut self) -> AppResult<i64>;

    fn insert_reservation(&mut self, reservation: &Reservation) -> AppResult<()>;

    fn set_reservation_status(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Moves every confirmed reservation of the event to cancelled.
    fn cancel_all_confirmed(&mut self, now: DateTime<Utc>) -> AppResult<usize>;

    /// Raw counter write. Only `capacity::reconcile` and
    /// `capacity::transition` call this.
    fn write_tally(
        &mut self,
        registered_count: i32,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    fn write_details(
        &mut self,
        details: &EventDetails,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    fn delete_event(&mut self) -> AppResult<()>;
}

pub trait Store: Clone + Send + Sync + 'static {
    /// Runs `work` with the event locked against every other event
    /// transaction on the same id. Fails with `NotFound` if the event does
    /// not exist when the lock is taken.
    fn in_event_transaction<T, F>(&self, event_id: Uuid, work: F) -> AppResult<T>
    where
        F: FnOnce(&mut dyn EventScope) -> AppResult<T>;

    fn insert_event(&self, event: &Event) -> AppResult<()>;

    fn find_event(&self, id: Uuid) -> AppResult<Option<Event>>;

    fn query_events(&self, query: &EventQuery) -> AppResult<Vec<Event>>;

    fn find_reservation(&self, id: Uuid) -> AppResult<Option<Reservation>>;

    /// Oldest first.
    fn reservations_for_event(&self, event_id: Uuid) -> AppResult<Vec<Reservation>>;

    /// Newest first.
    fn reservations_for_user(&self, user_id: &str) -> AppResult<Vec<Reservation>>;

    /// Atomically applies `patch` to one reservation and returns the result.
    fn update_reservation(
        &self,
        id: Uuid,
        patch: &ReservationPatch,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation>;

    fn find_user(&self, uid: &str) -> AppResult<Option<User>>;

    fn insert_user(&self, user: &User) -> AppResult<()>;

    fn list_users(&self) -> AppResult<Vec<User>>;
}
