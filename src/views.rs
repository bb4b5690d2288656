//! Read-only projections over events and reservations. Nothing here gates a
//! write; the numbers may trail concurrent mutations.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::AppResult;
use crate::models::{
    Event, EventStatus, MyReservationsQuery, PaymentStatus, Reservation, ReservationStatus,
    TimeSlot, User,
};
use crate::service::Registry;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusFilter {
    All,
    #[default]
    Confirmed,
    Cancelled,
    Waitlist,
}

impl StatusFilter {
    fn matches(self, status: ReservationStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Confirmed => status == ReservationStatus::Confirmed,
            StatusFilter::Cancelled => status == ReservationStatus::Cancelled,
            StatusFilter::Waitlist => status == ReservationStatus::Waitlist,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckInFilter {
    #[default]
    All,
    CheckedIn,
    NotCheckedIn,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentFilter {
    #[default]
    All,
    Unpaid,
    Paid,
    Pending,
    Refunded,
}

impl PaymentFilter {
    fn matches(self, status: PaymentStatus) -> bool {
        match self {
            PaymentFilter::All => true,
            PaymentFilter::Unpaid => status == PaymentStatus::Unpaid,
            PaymentFilter::Paid => status == PaymentStatus::Paid,
            PaymentFilter::Pending => status == PaymentStatus::Pending,
            PaymentFilter::Refunded => status == PaymentStatus::Refunded,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParticipantQuery {
    #[serde(default)]
    pub status: StatusFilter,
    #[serde(default)]
    pub check_in: CheckInFilter,
    #[serde(default)]
    pub payment: PaymentFilter,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub search: Option<String>,
}

fn contains_term(haystack: Option<&str>, term: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(term))
}

fn search_term(search: Option<&str>) -> Option<String> {
    search
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// Applies the participant filters, keeping creation order.
pub fn filter_participants(
    reservations: Vec<Reservation>,
    query: &ParticipantQuery,
) -> Vec<Reservation> {
    let term = search_term(query.search.as_deref());
    reservations
        .into_iter()
        .filter(|r| query.status.matches(r.status))
        .filter(|r| match query.check_in {
            CheckInFilter::All => true,
            CheckInFilter::CheckedIn => r.is_checked_in(),
            CheckInFilter::NotCheckedIn => !r.is_checked_in(),
        })
        .filter(|r| query.payment.matches(r.payment_status))
        .filter(|r| {
            term.as_deref().map_or(true, |t| {
                contains_term(r.user_display_name.as_deref(), t)
                    || contains_term(Some(r.user_email.as_str()), t)
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStatistics {
    pub total_confirmed: usize,
    pub checked_in: usize,
    pub not_checked_in: usize,
    pub paid: usize,
    pub unpaid: usize,
    pub pending: usize,
    pub total_revenue_cents: i64,
}

/// Check-in and payment figures over the confirmed reservations.
pub fn statistics_of(reservations: &[Reservation]) -> EventStatistics {
    let confirmed: Vec<&Reservation> = reservations.iter().filter(|r| r.is_confirmed()).collect();
    let checked_in = confirmed.iter().filter(|r| r.is_checked_in()).count();
    let with_status = |s: PaymentStatus| confirmed.iter().filter(|r| r.payment_status == s).count();

    EventStatistics {
        total_confirmed: confirmed.len(),
        checked_in,
        not_checked_in: confirmed.len() - checked_in,
        paid: with_status(PaymentStatus::Paid),
        unpaid: with_status(PaymentStatus::Unpaid),
        pending: with_status(PaymentStatus::Pending),
        total_revenue_cents: confirmed
            .iter()
            .filter_map(|r| r.payment.as_ref())
            .map(|p| p.amount_cents)
            .sum(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub event_id: Uuid,
    pub capacity: i32,
    pub registered_count: i32,
    pub available_seats: i32,
    pub is_full: bool,
    pub status: EventStatus,
}

impl From<&Event> for Availability {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.id,
            capacity: event.capacity,
            registered_count: event.registered_count,
            available_seats: event.available_seats(),
            is_full: event.is_full(),
            status: event.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSummary {
    pub id: Uuid,
    pub title: String,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub time_slot_label: &'static str,
    pub location: Option<String>,
    pub status: EventStatus,
}

impl From<&Event> for EventSummary {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            title: event.title.clone(),
            date: event.date,
            time_slot: event.time_slot,
            time_slot_label: event.time_slot.label(),
            location: event.location.clone(),
            status: event.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservationWithEvent {
    #[serde(flatten)]
    pub reservation: Reservation,
    /// Absent once the event has been deleted.
    pub event: Option<EventSummary>,
}

impl<S: Store> Registry<S> {
    pub fn participants(
        &self,
        caller: &Principal,
        event_id: Uuid,
        query: &ParticipantQuery,
    ) -> AppResult<Vec<Reservation>> {
        caller.require_admin()?;
        self.event(event_id)?;
        let all = self.store.reservations_for_event(event_id)?;
        Ok(filter_participants(all, query))
    }

    pub fn statistics(&self, caller: &Principal, event_id: Uuid) -> AppResult<EventStatistics> {
        caller.require_admin()?;
        self.event(event_id)?;
        Ok(statistics_of(&self.store.reservations_for_event(event_id)?))
    }

    pub fn availability(&self, event_id: Uuid) -> AppResult<Availability> {
        Ok(Availability::from(&self.event(event_id)?))
    }

    /// The caller's reservations, newest first, each with its event.
    pub fn my_reservations(
        &self,
        caller: &Principal,
        query: &MyReservationsQuery,
    ) -> AppResult<Vec<ReservationWithEvent>> {
        let reservations = self.store.reservations_for_user(caller.uid())?;
        reservations
            .into_iter()
            .filter(|r| !query.active_only || r.is_confirmed())
            .map(|reservation| {
                let event = self.store.find_event(reservation.event_id)?;
                Ok(ReservationWithEvent {
                    event: event.as_ref().map(EventSummary::from),
                    reservation,
                })
            })
            .collect()
    }

    /// Users who could still be added to the event by an admin.
    pub fn candidates(
        &self,
        caller: &Principal,
        event_id: Uuid,
        search: Option<&str>,
    ) -> AppResult<Vec<User>> {
        caller.require_admin()?;
        self.event(event_id)?;
        let registered: Vec<String> = self
            .store
            .reservations_for_event(event_id)?
            .into_iter()
            .filter(Reservation::is_confirmed)
            .map(|r| r.user_id)
            .collect();
        let term = search_term(search);

        Ok(self
            .store
            .list_users()?
            .into_iter()
            .filter(|u| !registered.contains(&u.uid))
            .filter(|u| {
                term.as_deref().map_or(true, |t| {
                    contains_term(u.display_name.as_deref(), t)
                        || contains_term(Some(u.email.as_str()), t)
                        || contains_term(u.phone.as_deref(), t)
                })
            })
            .collect())
    }
}
