//! Postgres `Store`. Event transactions take a row lock on the event
//! (`SELECT ... FOR UPDATE`), so every capacity-affecting write for one event
//! runs strictly one after another while other events proceed in parallel.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use diesel::{
    prelude::*,
    r2d2::{self, ConnectionManager, PooledConnection},
    result::{DatabaseErrorKind, Error as DieselError},
};
use log::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    Event, EventStatus, PaymentStatus, Reservation, ReservationRow, ReservationStatus, User,
};
use crate::schema::{events, reservations, users};
use crate::store::{EventDetails, EventQuery, EventScope, ReservationPatch, Store};

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Name of the partial unique index guarding one confirmed seat per user.
const ONE_CONFIRMED_INDEX: &str = "reservations_one_confirmed_per_user";

/// Applies the per-statement and lock-wait bounds to every pooled session,
/// so reads outside event transactions cannot hang either.
#[derive(Debug, Clone, Copy)]
struct SessionTimeouts {
    millis: u128,
}

impl r2d2::CustomizeConnection<PgConnection, r2d2::Error> for SessionTimeouts {
    fn on_acquire(&self, conn: &mut PgConnection) -> Result<(), r2d2::Error> {
        let millis = self.millis;
        diesel::sql_query(format!("SET lock_timeout = '{millis}ms'"))
            .execute(conn)
            .map_err(r2d2::Error::QueryError)?;
        diesel::sql_query(format!("SET statement_timeout = '{millis}ms'"))
            .execute(conn)
            .map_err(r2d2::Error::QueryError)?;
        Ok(())
    }
}

/// Every store call is bounded: checkout by `connection_timeout`, each
/// statement and lock wait by `statement_timeout`.
pub fn initialize_db_pool(
    database_url: &str,
    max_size: u32,
    connection_timeout: StdDuration,
    statement_timeout: StdDuration,
) -> AppResult<DbPool> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    r2d2::Pool::builder()
        .max_size(max_size)
        .connection_timeout(connection_timeout)
        .connection_customizer(Box::new(SessionTimeouts {
            millis: statement_timeout.as_millis(),
        }))
        .build(manager)
        .map_err(AppError::from)
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    transaction_timeout: StdDuration,
}

impl PgStore {
    pub fn new(pool: DbPool, transaction_timeout: StdDuration) -> Self {
        Self { pool, transaction_timeout }
    }

    fn conn(&self) -> AppResult<PooledConnection<ConnectionManager<PgConnection>>> {
        Ok(self.pool.get()?)
    }

    /// Bounds lock waits and statements for the current transaction only.
    fn set_local_timeouts(&self, conn: &mut PgConnection) -> AppResult<()> {
        let millis = self.transaction_timeout.as_millis();
        diesel::sql_query(format!("SET LOCAL lock_timeout = '{millis}ms'")).execute(conn)?;
        diesel::sql_query(format!("SET LOCAL statement_timeout = '{millis}ms'")).execute(conn)?;
        Ok(())
    }
}

struct PgScope<'c> {
    conn: &'c mut PgConnection,
    event: Event,
}

impl EventScope for PgScope<'_> {
    fn event(&self) -> &Event {
        &self.event
    }

    fn reservation(&mut self, id: Uuid) -> AppResult<Option<Reservation>> {
        let row = reservations::table
            .filter(reservations::id.eq(id))
            .filter(reservations::event_id.eq(self.event.id))
            .select(ReservationRow::as_select())
            .for_update()
            .first::<ReservationRow>(self.conn)
            .optional()?;
        Ok(row.map(Reservation::from))
    }

    fn confirmed_reservation_for(&mut self, user_id: &str) -> AppResult<Option<Reservation>> {
        let row = reservations::table
            .filter(reservations::event_id.eq(self.event.id))
            .filter(reservations::user_id.eq(user_id))
            .filter(reservations::status.eq(ReservationStatus::Confirmed))
            .select(ReservationRow::as_select())
            .first::<ReservationRow>(self.conn)
            .optional()?;
        Ok(row.map(Reservation::from))
    }

    fn count_confirmed(&mut self) -> AppResult<i64> {
        let count = reservations::table
            .filter(reservations::event_id.eq(self.event.id))
            .filter(reservations::status.eq(ReservationStatus::Confirmed))
            .count()
            .get_result::<i64>(self.conn)?;
        Ok(count)
    }

    fn insert_reservation(&mut self, reservation: &Reservation) -> AppResult<()> {
        let row = ReservationRow::from(reservation);
        match diesel::insert_into(reservations::table).values(&row).execute(self.conn) {
            Ok(_) => Ok(()),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info))
                if info.constraint_name() == Some(ONE_CONFIRMED_INDEX) =>
            {
                Err(AppError::DuplicateReservation {
                    event_id: reservation.event_id,
                    user_id: reservation.user_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_reservation_status(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let updated = diesel::update(reservations::table.find(id))
            .set((reservations::status.eq(status), reservations::updated_at.eq(now)))
            .execute(self.conn)?;
        if updated < 1 {
            return Err(AppError::NotFound(format!("reservation {id}")));
        }
        Ok(())
    }

    fn cancel_all_confirmed(&mut self, now: DateTime<Utc>) -> AppResult<usize> {
        let cancelled = diesel::update(reservations::table)
            .filter(reservations::event_id.eq(self.event.id))
            .filter(reservations::status.eq(ReservationStatus::Confirmed))
            .set((
                reservations::status.eq(ReservationStatus::Cancelled),
                reservations::updated_at.eq(now),
            ))
            .execute(self.conn)?;
        Ok(cancelled)
    }

    fn write_tally(
        &mut self,
        registered_count: i32,
        status: EventStatus,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        diesel::update(events::table.find(self.event.id))
            .set((
                events::registered_count.eq(registered_count),
                events::status.eq(status),
                events::updated_at.eq(now),
            ))
            .execute(self.conn)?;
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
        diesel::update(events::table.find(self.event.id))
            .set((
                events::title.eq(&details.title),
                events::description.eq(&details.description),
                events::date.eq(details.date),
                events::time_slot.eq(details.time_slot),
                events::capacity.eq(details.capacity),
                events::location.eq(&details.location),
                events::status.eq(status),
                events::updated_at.eq(now),
            ))
            .execute(self.conn)?;
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
        diesel::delete(events::table.find(self.event.id)).execute(self.conn)?;
        Ok(())
    }
}

impl Store for PgStore {
    fn in_event_transaction<T, F>(&self, event_id: Uuid, work: F) -> AppResult<T>
    where
        F: FnOnce(&mut dyn EventScope) -> AppResult<T>,
    {
        let mut pooled = self.conn()?;
        let conn: &mut PgConnection = &mut pooled;
        conn.transaction::<T, AppError, _>(|conn| {
            self.set_local_timeouts(conn)?;

            // Lock the event row; concurrent work on this event waits here.
            let event = events::table
                .filter(events::id.eq(event_id))
                .select(Event::as_select())
                .for_update()
                .first::<Event>(conn)
                .optional()?
                .ok_or_else(|| AppError::NotFound(format!("event {event_id}")))?;
            debug!("locked event {event_id} (registered {})", event.registered_count);

            let mut scope = PgScope { conn, event };
            work(&mut scope)
        })
    }

    fn insert_event(&self, event: &Event) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(events::table).values(event).execute(&mut conn)?;
        Ok(())
    }

    fn find_event(&self, id: Uuid) -> AppResult<Option<Event>> {
        let mut conn = self.conn()?;
        let event = events::table
            .find(id)
            .select(Event::as_select())
            .first::<Event>(&mut conn)
            .optional()?;
        Ok(event)
    }

    fn query_events(&self, query: &EventQuery) -> AppResult<Vec<Event>> {
        let mut conn = self.conn()?;
        let mut q = events::table.select(Event::as_select()).into_boxed();

        if let Some(start) = query.start_date {
            q = q.filter(events::date.ge(start));
        }
        if let Some(end) = query.end_date {
            q = q.filter(events::date.le(end));
        }
        if let Some(status) = query.status {
            q = q.filter(events::status.eq(status));
        }
        if let Some(slot) = query.time_slot {
            q = q.filter(events::time_slot.eq(slot));
        }
        if let Some(creator) = &query.created_by {
            q = q.filter(events::created_by.eq(creator.clone()));
        }
        q = if query.newest_first {
            q.order((events::date.desc(), events::time_slot.desc(), events::created_at.desc()))
        } else {
            q.order((events::date.asc(), events::time_slot.asc(), events::created_at.asc()))
        };
        if let Some(limit) = query.limit {
            q = q.limit(limit.max(0));
        }

        Ok(q.load::<Event>(&mut conn)?)
    }

    fn find_reservation(&self, id: Uuid) -> AppResult<Option<Reservation>> {
        let mut conn = self.conn()?;
        let row = reservations::table
            .find(id)
            .select(ReservationRow::as_select())
            .first::<ReservationRow>(&mut conn)
            .optional()?;
        Ok(row.map(Reservation::from))
    }

    fn reservations_for_event(&self, event_id: Uuid) -> AppResult<Vec<Reservation>> {
        let mut conn = self.conn()?;
        let rows = reservations::table
            .filter(reservations::event_id.eq(event_id))
            .order(reservations::created_at.asc())
            .select(ReservationRow::as_select())
            .load::<ReservationRow>(&mut conn)?;
        Ok(rows.into_iter().map(Reservation::from).collect())
    }

    fn reservations_for_user(&self, user_id: &str) -> AppResult<Vec<Reservation>> {
        let mut conn = self.conn()?;
        let rows = reservations::table
            .filter(reservations::user_id.eq(user_id))
            .order(reservations::created_at.desc())
            .select(ReservationRow::as_select())
            .load::<ReservationRow>(&mut conn)?;
        Ok(rows.into_iter().map(Reservation::from).collect())
    }

    fn update_reservation(
        &self,
        id: Uuid,
        patch: &ReservationPatch,
        now: DateTime<Utc>,
    ) -> AppResult<Reservation> {
        let mut conn = self.conn()?;
        // A single UPDATE per patch keeps the document write atomic.
        let target = reservations::table.find(id);
        let updated = match patch {
            ReservationPatch::CheckIn(record) => diesel::update(target)
                .set((
                    reservations::checked_in_at.eq(record.as_ref().map(|r| r.checked_in_at)),
                    reservations::checked_in_by
                        .eq(record.as_ref().map(|r| r.checked_in_by.clone())),
                    reservations::checked_in_by_name
                        .eq(record.as_ref().and_then(|r| r.checked_in_by_name.clone())),
                    reservations::updated_at.eq(now),
                ))
                .returning(ReservationRow::as_returning())
                .get_result::<ReservationRow>(&mut conn),
            ReservationPatch::Payment(record) => diesel::update(target)
                .set((
                    reservations::payment_status.eq(PaymentStatus::Paid),
                    reservations::payment_amount_cents.eq(Some(record.amount_cents)),
                    reservations::payment_method.eq(Some(record.method)),
                    reservations::paid_at.eq(Some(record.paid_at)),
                    reservations::payment_processed_by.eq(Some(record.processed_by.clone())),
                    reservations::payment_processed_by_name.eq(record.processed_by_name.clone()),
                    reservations::payment_transaction_id.eq(record.transaction_id.clone()),
                    reservations::payment_notes.eq(record.notes.clone()),
                    reservations::updated_at.eq(now),
                ))
                .returning(ReservationRow::as_returning())
                .get_result::<ReservationRow>(&mut conn),
            ReservationPatch::PaymentStatus(status) => diesel::update(target)
                .set((
                    reservations::payment_status.eq(*status),
                    reservations::updated_at.eq(now),
                ))
                .returning(ReservationRow::as_returning())
                .get_result::<ReservationRow>(&mut conn),
        };

        match updated {
            Ok(row) => Ok(row.into()),
            Err(DieselError::NotFound) => Err(AppError::NotFound(format!("reservation {id}"))),
            Err(e) => Err(e.into()),
        }
    }

    fn find_user(&self, uid: &str) -> AppResult<Option<User>> {
        let mut conn = self.conn()?;
        let user = users::table
            .find(uid)
            .select(User::as_select())
            .first::<User>(&mut conn)
            .optional()?;
        Ok(user)
    }

    fn insert_user(&self, user: &User) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(users::table).values(user).execute(&mut conn)?;
        Ok(())
    }

    fn list_users(&self) -> AppResult<Vec<User>> {
        let mut conn = self.conn()?;
        let all = users::table
            .order(users::email.asc())
            .select(User::as_select())
            .load::<User>(&mut conn)?;
        Ok(all)
    }
}
