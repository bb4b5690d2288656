//! In-process `Store`. Capacity-affecting work is serialized by a mutex per
//! event id; writes made inside an event transaction are staged and applied
//! in one step when the work succeeds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Event, EventStatus, Reservation, ReservationStatus, User};
use crate::store::{EventDetails, EventQuery, EventScope, ReservationPatch, Store};

#[derive(Debug, Default)]
struct Tables {
    events: HashMap<Uuid, Event>,
    reservations: HashMap<Uuid, Reservation>,
    users: HashMap<String, User>,
}

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    event_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
    /// Longest wait for an event lock before the transaction gives up.
    lock_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

fn poisoned<T>(_: T) -> AppError {
    AppError::Internal("in-memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            tables: Arc::default(),
            event_locks: Arc::default(),
            lock_timeout,
        }
    }

    fn tables(&self) -> AppResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(poisoned)
    }

    /// Lock entries exist only for stored events.
    fn event_lock(&self, event_id: Uuid) -> AppResult<Arc<Mutex<()>>> {
        if !self.tables()?.events.contains_key(&event_id) {
            return Err(AppError::NotFound(format!("event {event_id}")));
        }
        let mut locks = self.event_locks.lock().map_err(poisoned)?;
        Ok(locks.entry(event_id).or_default().clone())
    }

    fn forget_event_lock(&self, event_id: Uuid) -> AppResult<()> {
        self.event_locks.lock().map_err(poisoned)?.remove(&event_id);
        Ok(())
    }

    /// Waits for `lock` until the lock timeout passes. Nothing has been read
    /// or staged when this fails.
    fn acquire<'l>(&self, event_id: Uuid, lock: &'l Mutex<()>) -> AppResult<MutexGuard<'l, ()>> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match lock.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(e)) => return Err(poisoned(e)),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                    return Err(AppError::Timeout(format!(
                        "event {event_id} stayed locked for {}ms",
                        self.lock_timeout.as_millis()
                    )));
                }
                Err(TryLockError::WouldBlock) => thread::sleep(LOCK_RETRY_INTERVAL),
            }
        }
    }
}

/// A status change staged inside an event transaction.
#[derive(Debug, Clone, Copy)]
struct StatusChange {
    id: Uuid,
    status: ReservationStatus,
    at: DateTime<Utc>,
}

struct MemoryScope<'s> {
    store: &'s MemoryStore,
    event: Event,
    deleted: bool,
    inserted: Vec<Reservation>,
    changes: Vec<StatusChange>,
}

impl MemoryScope<'_> {
    fn overlay(&self, mut reservation: Reservation) -> Reservation {
        for change in self.changes.iter().filter(|c| c.id == reservation.id) {
            reservation.status = change.status;
            reservation.updated_at = change.at;
        }
        reservation
    }

    /// The event's reservations as this transaction sees them.
    fn visible(&self) -> AppResult<Vec<Reservation>> {
        let committed: Vec<Reservation> = self
            .store
            .tables()?
            .reservations
            .values()
            .filter(|r| r.event_id == self.event.id)
            .cloned()
            .collect();
        Ok(committed
            .into_iter()
            .chain(self.inserted.iter().cloned())
            .map(|r| self.overlay(r))
            .collect())
    }

    fn commit(self) -> AppResult<()> {
        let store = self.store;
        let event_id = self.event.id;
        let deleted = self.deleted;
        let mut tables = store.tables()?;
        for reservation in self.inserted {
            tables.reservations.insert(reservation.id, reservation);
        }
        for change in &self.changes {
            if let Some(stored) = tables.reservations.get_mut(&change.id) {
                stored.status = change.status;
                stored.updated_at = change.at;
            }
        }
        if deleted {
            tables.events.remove(&event_id);
        } else {
            tables.events.insert(event_id, self.event);
        }
        drop(tables);

        if deleted {
            store.forget_event_lock(event_id)?;
        }
        Ok(())
    }
}

impl EventScope for MemoryScope<'_> {
    fn event(&self) -> &Event {
        &self.event
    }

    fn reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>> {
        Ok(self.visible()?.into_iter().find(|r| r.id == id))
    }

    fn confirmed_reservation_for(&mut self, user_id: &str) -> AppResult<Option<Reservation>> {
        Ok(self
            .visible()?
            .into_iter()
            .find(|r| r.user_id == user_id && r.is_confirmed()))
    }

    fn count_confirmed(&mut self) -> AppResult<i64> {
        Ok(self.visible()?.iter().filter(|r| r.is_confirmed()).count() as i64)
    }

    fn insert_reservation(&mut self, reservation: &Reservation) -> AppResult<()> {
        if reservation.is_confirmed()
            && self.confirmed_reservation_for(&reservation.user_id)?.is_some()
        {
            return Err(AppError::DuplicateReservation {
                event_id: self.event.id,
                user_id: reservation.user_id.clone(),
            });
        }
        self.inserted.push(reservation.clone());
        Ok(())
    }

    fn set_reservation_status(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if self.reservation(id)?.is_none() {
            return Err(AppError::NotFound(format!("reservation {id}")));
        }
        self.changes.push(StatusChange { id, status, at: now });
        Ok(())
    }

    fn cancel_all_confirmed(&mut self, now: DateTime<Utc>) -> AppResult<usize> {
        let confirmed: Vec<Uuid> = self
            .visible()?
            .into_iter()
            .filter(Reservation::is_confirmed)
            .map(|r| r.id)
            .collect();
        for id in &confirmed {
            self.changes.push(StatusChange {
                id: *id,
                status: ReservationStatus::Cancelled,
                at: now,
            });
        }
        Ok(confirmed.len())
    }

    fn write_tally(
        &mut self,
        registered_count: i32,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.event.registered_count = registered_count;
        self.event.status = status;
        self.event.updated_at = now;
        Ok(())
    }

    fn write_details(
        &mut self,
        details: &EventDetails,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.event.title = details.title.clone();
        self.event.description = details.description.clone();
        self.event.date = details.date;
        self.event.time_slot = details.time_slot;
        self.event.capacity = details.capacity;
        self.event.location = details.location.clone();
        self.event.status = status;
        self.event.updated_at = now;
        Ok(())
    }

    fn delete_event(&mut self) -> AppResult<()> {
        self.deleted = true;
        Ok(())
    }
}

impl Store for MemoryStore {
    fn in_event_transaction<T, F>(&self, event_id: Uuid, work: F) -> AppResult<T>
    where
        F: FnOnce(&mut dyn EventScope) -> AppResult<T>,
    {
        let lock = self.event_lock(event_id)?;
        let _held = self.acquire(event_id, &lock)?;

        let event = self
            .tables()?
            .events
            .get(&event_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("event {event_id}")))?;

        let mut scope = MemoryScope {
            store: self,
            event,
            deleted: false,
            inserted: Vec::new(),
            changes: Vec::new(),
        };
        let out = work(&mut scope)?;
        scope.commit()?;
        Ok(out)
    }

    fn insert_event(&self, event: &Event) -> AppResult<()> {
        let mut tables = self.tables()?;
        if tables.events.contains_key(&event.id) {
            return Err(AppError::AlreadyExists(format!("event {}", event.id)));
        }
        tables.events.insert(event.id, event.clone());
        Ok(())
    }

    fn find_event(&self, id: Uuid) -> AppResult<Option<Event>> {
        Ok(self.tables()?.events.get(&id).cloned())
    }

    fn query_events(&self, query: &EventQuery) -> AppResult<Vec<Event>> {
        let mut found: Vec<Event> = self
            .tables()?
            .events
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.date, e.time_slot.start_hour(), e.created_at));
        if query.newest_first {
            found.reverse();
        }
        if let Some(limit) = query.limit {
            found.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        }
        Ok(found)
    }

    fn find_reservation(&self, id: Uuid) -> AppResult<Option<Reservation>> {
        Ok(self.tables()?.reservations.get(&id).cloned())
    }

    fn reservations_for_event(&self, event_id: Uuid) -> AppResult<Vec<Reservation>> {
        let mut found: Vec<Reservation> = self
            .tables()?
            .reservations
            .values()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    fn reservations_for_user(&self, user_id: &str) -> AppResult<Vec<Reservation>> {
        let mut found: Vec<Reservation> = self
            .tables()?
            .reservations
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    fn update_reservation(
        &self,
        id: Uuid,
        patch: &ReservationPatch,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        let mut tables = self.tables()?;
        let stored = tables
            .reservations
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("reservation {id}")))?;
        patch.apply(stored, now);
        Ok(stored.clone())
    }

    fn find_user(&self, uid: &str) -> AppResult<Option<User>> {
        Ok(self.tables()?.users.get(uid).cloned())
    }

    fn insert_user(&self, user: &User) -> AppResult<()> {
        let mut tables = self.tables()?;
        if tables.users.contains_key(&user.uid) {
            return Err(AppError::AlreadyExists(format!("user {}", user.uid)));
        }
        if tables.users.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(AppError::AlreadyExists(format!("user with email {}", user.email)));
        }
        tables.users.insert(user.uid.clone(), user.clone());
        Ok(())
    }

    fn list_users(&self) -> AppResult<Vec<User>> {
        let mut users: Vec<User> = self.tables()?.users.values().cloned().collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentStatus, TimeSlot, UserRole};
    use chrono::NaiveDate;

    fn seed_event(store: &MemoryStore, capacity: i32) -> Event {
        let now = Utc::now();
        let event = Event {
            id: Uuid::new_v4(),
            title: "Choir".into(),
            description: None,
            date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            time_slot: TimeSlot::Afternoon,
            duration_hours: 3,
            capacity,
            registered_count: 0,
            status: EventStatus::Scheduled,
            location: None,
            created_by: "admin".into(),
            created_at: now,
            updated_at: now,
        };
        store.insert_event(&event).unwrap();
        event
    }

    fn guest(uid: &str) -> User {
        let now = Utc::now();
        User {
            uid: uid.into(),
            email: format!("{uid}@example.com"),
            phone: None,
            display_name: None,
            role: UserRole::Guest,
            password_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn failed_work_leaves_no_trace() {
        let store = MemoryStore::new();
        let event = seed_event(&store, 3);
        let reservation = Reservation::confirmed(event.id, &guest("u1"), None, Utc::now());

        let result: AppResult<()> = store.in_event_transaction(event.id, |scope| {
            scope.insert_reservation(&reservation)?;
            scope.write_tally(1, EventStatus::Scheduled, Utc::now())?;
            Err(AppError::Internal("boom".into()))
        });

        assert!(result.is_err());
        assert!(store.find_reservation(reservation.id).unwrap().is_none());
        assert_eq!(store.find_event(event.id).unwrap().unwrap().registered_count, 0);
    }

    #[test]
    fn staged_writes_are_visible_inside_the_transaction() {
        let store = MemoryStore::new();
        let event = seed_event(&store, 3);
        let reservation = Reservation::confirmed(event.id, &guest("u1"), None, Utc::now());

        store
            .in_event_transaction(event.id, |scope| {
                scope.insert_reservation(&reservation)?;
                assert_eq!(scope.count_confirmed()?, 1);
                scope.set_reservation_status(
                    reservation.id,
                    ReservationStatus::Cancelled,
                    Utc::now(),
                )?;
                assert_eq!(scope.count_confirmed()?, 0);
                Ok(())
            })
            .unwrap();

        let stored = store.find_reservation(reservation.id).unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Cancelled);
    }

    #[test]
    fn second_confirmed_insert_for_same_user_is_rejected() {
        let store = MemoryStore::new();
        let event = seed_event(&store, 3);
        let user = guest("u1");

        let result = store.in_event_transaction(event.id, |scope| {
            scope.insert_reservation(&Reservation::confirmed(event.id, &user, None, Utc::now()))?;
            scope.insert_reservation(&Reservation::confirmed(event.id, &user, None, Utc::now()))
        });
        assert!(matches!(result, Err(AppError::DuplicateReservation { .. })));
    }

    #[test]
    fn missing_event_is_not_found() {
        let store = MemoryStore::new();
        let result = store.in_event_transaction(Uuid::new_v4(), |_| Ok(()));
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn missing_events_leave_no_lock_entries() {
        let store = MemoryStore::new();
        for _ in 0..1000 {
            let result = store.in_event_transaction(Uuid::new_v4(), |_| Ok(()));
            assert!(matches!(result, Err(AppError::NotFound(_))));
        }
        assert!(store.event_locks.lock().unwrap().is_empty());
    }

    #[test]
    fn deleting_an_event_drops_its_lock_entry() {
        let store = MemoryStore::new();
        let event = seed_event(&store, 3);
        store.in_event_transaction(event.id, |_| Ok(())).unwrap();
        assert_eq!(store.event_locks.lock().unwrap().len(), 1);

        store.in_event_transaction(event.id, |scope| scope.delete_event()).unwrap();
        assert!(store.event_locks.lock().unwrap().is_empty());
        assert!(store.find_event(event.id).unwrap().is_none());
    }

    #[test]
    fn lock_wait_times_out_before_any_work() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));
        let event = seed_event(&store, 3);
        let reservation = Reservation::confirmed(event.id, &guest("u1"), None, Utc::now());
        let (entered, wait_for_holder) = std::sync::mpsc::channel();

        thread::scope(|s| {
            let holder = store.clone();
            s.spawn(move || {
                holder
                    .in_event_transaction(event.id, |_| {
                        entered.send(()).unwrap();
                        thread::sleep(Duration::from_millis(300));
                        Ok(())
                    })
                    .unwrap();
            });
            wait_for_holder.recv().unwrap();

            let mut ran = false;
            let result = store.in_event_transaction(event.id, |scope| {
                ran = true;
                scope.insert_reservation(&reservation)?;
                scope.write_tally(1, EventStatus::Scheduled, Utc::now())
            });
            assert!(matches!(result, Err(AppError::Timeout(_))));
            assert!(!ran);
        });

        assert!(store.find_reservation(reservation.id).unwrap().is_none());
        assert_eq!(store.find_event(event.id).unwrap().unwrap().registered_count, 0);
    }

    #[test]
    fn patches_touch_only_the_sub_ledger() {
        let store = MemoryStore::new();
        let event = seed_event(&store, 3);
        let reservation = Reservation::confirmed(event.id, &guest("u1"), None, Utc::now());
        store
            .in_event_transaction(event.id, |scope| scope.insert_reservation(&reservation))
            .unwrap();

        let updated = store
            .update_reservation(
                reservation.id,
                &ReservationPatch::PaymentStatus(PaymentStatus::Pending),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(updated.payment_status, PaymentStatus::Pending);
        assert_eq!(updated.status, ReservationStatus::Confirmed);
    }

    #[test]
    fn duplicate_user_email_is_rejected() {
        let store = MemoryStore::new();
        store.insert_user(&guest("u1")).unwrap();
        let mut other = guest("u2");
        other.email = "U1@example.com".into();
        assert!(matches!(store.insert_user(&other), Err(AppError::AlreadyExists(_))));
    }
}
