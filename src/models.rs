use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use diesel::{
    deserialize::{self, FromSql},
    pg::{Pg, PgValue},
    serialize::{self, Output, ToSql},
    sql_types::Text,
    Insertable, Queryable, Selectable,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{events, reservations, users};

/// Wires a fieldless enum to a Postgres enum type stored as its text label.
macro_rules! pg_text_enum {
    ($ty:ident, $sql:ty, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($ty::$variant),)+
                    other => Err(format!("Unrecognized {} value: {}", stringify!($ty), other)),
                }
            }
        }

        impl ToSql<$sql, Pg> for $ty {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
            }
        }

        impl FromSql<$sql, Pg> for $ty {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
                raw.parse::<$ty>().map_err(Into::into)
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::TimeSlot)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeSlot {
    Morning,
    Afternoon,
}

pg_text_enum!(TimeSlot, crate::schema::sql_types::TimeSlot, {
    Morning => "MORNING",
    Afternoon => "AFTERNOON",
});

impl TimeSlot {
    /// Every slot is a fixed three hour session.
    pub const DURATION_HOURS: i32 = 3;

    pub const fn start_hour(&self) -> u32 {
        match self {
            TimeSlot::Morning => 9,
            TimeSlot::Afternoon => 14,
        }
    }

    pub fn start_time(&self) -> NaiveTime {
        NaiveTime::MIN + Duration::hours(i64::from(self.start_hour()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeSlot::Morning => "Morning (09:00 - 12:00)",
            TimeSlot::Afternoon => "Afternoon (14:00 - 17:00)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::EventStatus)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Scheduled,
    Full,
    Cancelled,
    Completed,
}

pg_text_enum!(EventStatus, crate::schema::sql_types::EventStatus, {
    Scheduled => "SCHEDULED",
    Full => "FULL",
    Cancelled => "CANCELLED",
    Completed => "COMPLETED",
});

impl EventStatus {
    /// Statuses the capacity counter never overwrites.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Cancelled | EventStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::ReservationStatus)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
    /// Modelled for compatibility; no operation produces it.
    Waitlist,
}

pg_text_enum!(ReservationStatus, crate::schema::sql_types::ReservationStatus, {
    Confirmed => "CONFIRMED",
    Cancelled => "CANCELLED",
    Waitlist => "WAITLIST",
});

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
)]
#[diesel(sql_type = crate::schema::sql_types::PaymentStatus)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Paid,
    Pending,
    Refunded,
}

pg_text_enum!(PaymentStatus, crate::schema::sql_types::PaymentStatus, {
    Unpaid => "UNPAID",
    Paid => "PAID",
    Pending => "PENDING",
    Refunded => "REFUNDED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::PaymentMethod)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    CreditCard,
    DebitCard,
    BankTransfer,
    DigitalWallet,
    Other,
}

pg_text_enum!(PaymentMethod, crate::schema::sql_types::PaymentMethod, {
    Cash => "CASH",
    CreditCard => "CREDIT_CARD",
    DebitCard => "DEBIT_CARD",
    BankTransfer => "BANK_TRANSFER",
    DigitalWallet => "DIGITAL_WALLET",
    Other => "OTHER",
});

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsExpression,
    FromSqlRow,
)]
#[diesel(sql_type = crate::schema::sql_types::UserRole)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    Guest,
}

pg_text_enum!(UserRole, crate::schema::sql_types::UserRole, {
    Admin => "ADMIN",
    Guest => "GUEST",
});

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = events)]
#[diesel(check_for_backend(Pg))]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub duration_hours: i32,
    pub capacity: i32,
    pub registered_count: i32,
    pub status: EventStatus,
    pub location: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Events run on UTC wall-clock slots.
    pub fn starts_at(&self) -> DateTime<Utc> {
        let naive = NaiveDateTime::new(self.date, self.time_slot.start_time());
        DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.starts_at() + Duration::hours(i64::from(self.duration_hours))
    }

    pub fn is_full(&self) -> bool {
        self.registered_count >= self.capacity
    }

    pub fn available_seats(&self) -> i32 {
        (self.capacity - self.registered_count).max(0)
    }
}

/// Partial admin edit of an event. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub time_slot: Option<TimeSlot>,
    pub capacity: Option<i32>,
    pub status: Option<EventStatus>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub checked_in_at: DateTime<Utc>,
    pub checked_in_by: String,
    pub checked_in_by_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
    pub processed_by: String,
    pub processed_by_name: Option<String>,
    pub transaction_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: String,
    pub user_email: String,
    pub user_display_name: Option<String>,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub check_in: Option<CheckInRecord>,
    pub payment_status: PaymentStatus,
    pub payment: Option<PaymentRecord>,
}

impl Reservation {
    pub fn confirmed(
        event_id: Uuid,
        user: &User,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id,
            user_id: user.uid.clone(),
            user_email: user.email.clone(),
            user_display_name: user.display_name.clone(),
            status: ReservationStatus::Confirmed,
            notes,
            created_at: now,
            updated_at: now,
            check_in: None,
            payment_status: PaymentStatus::Unpaid,
            payment: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }

    pub fn is_checked_in(&self) -> bool {
        self.check_in.is_some()
    }
}

/// Flat row shape of a reservation; the check-in and payment sub-records
/// live in nullable column groups.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = reservations)]
#[diesel(check_for_backend(Pg))]
pub struct ReservationRow {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: String,
    pub user_email: String,
    pub user_display_name: Option<String>,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_in_by: Option<String>,
    pub checked_in_by_name: Option<String>,
    pub payment_status: PaymentStatus,
    pub payment_amount_cents: Option<i64>,
    pub payment_method: Option<PaymentMethod>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_processed_by: Option<String>,
    pub payment_processed_by_name: Option<String>,
    pub payment_transaction_id: Option<String>,
    pub payment_notes: Option<String>,
}

impl From<ReservationRow> for Reservation {
    fn from(row: ReservationRow) -> Self {
        let check_in = match (row.checked_in_at, row.checked_in_by) {
            (Some(checked_in_at), Some(checked_in_by)) => Some(CheckInRecord {
                checked_in_at,
                checked_in_by,
                checked_in_by_name: row.checked_in_by_name,
            }),
            _ => None,
        };
        let payment = match (
            row.payment_amount_cents,
            row.payment_method,
            row.paid_at,
            row.payment_processed_by,
        ) {
            (Some(amount_cents), Some(method), Some(paid_at), Some(processed_by)) => {
                Some(PaymentRecord {
                    amount_cents,
                    method,
                    paid_at,
                    processed_by,
                    processed_by_name: row.payment_processed_by_name,
                    transaction_id: row.payment_transaction_id,
                    notes: row.payment_notes,
                })
            }
            _ => None,
        };
        Self {
            id: row.id,
            event_id: row.event_id,
            user_id: row.user_id,
            user_email: row.user_email,
            user_display_name: row.user_display_name,
            status: row.status,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
            check_in,
            payment_status: row.payment_status,
            payment,
        }
    }
}

impl From<&Reservation> for ReservationRow {
    fn from(r: &Reservation) -> Self {
        let check_in = r.check_in.clone();
        let payment = r.payment.clone();
        Self {
            id: r.id,
            event_id: r.event_id,
            user_id: r.user_id.clone(),
            user_email: r.user_email.clone(),
            user_display_name: r.user_display_name.clone(),
            status: r.status,
            notes: r.notes.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
            checked_in_at: check_in.as_ref().map(|c| c.checked_in_at),
            checked_in_by: check_in.as_ref().map(|c| c.checked_in_by.clone()),
            checked_in_by_name: check_in.and_then(|c| c.checked_in_by_name),
            payment_status: r.payment_status,
            payment_amount_cents: payment.as_ref().map(|p| p.amount_cents),
            payment_method: payment.as_ref().map(|p| p.method),
            paid_at: payment.as_ref().map(|p| p.paid_at),
            payment_processed_by: payment.as_ref().map(|p| p.processed_by.clone()),
            payment_processed_by_name: payment.as_ref().and_then(|p| p.processed_by_name.clone()),
            payment_transaction_id: payment.as_ref().and_then(|p| p.transaction_id.clone()),
            payment_notes: payment.and_then(|p| p.notes),
        }
    }
}

/// Role record of an identity. Credentials themselves belong to the
/// identity provider; provisioned accounts keep a bcrypt hash here.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(Pg))]
pub struct User {
    pub uid: String,
    pub email: String,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    pub role: UserRole,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Request/Response models for API
#[derive(Debug, Clone, Deserialize)]
pub struct NewEventRequest {
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub capacity: i32,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddParticipantRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentStatusRequest {
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkCheckInRequest {
    pub reservation_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkCheckInFailure {
    pub reservation_id: Uuid,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkCheckInReport {
    pub checked_in: Vec<Reservation>,
    pub failed: Vec<BulkCheckInFailure>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventListQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: Option<EventStatus>,
    pub time_slot: Option<TimeSlot>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MyReservationsQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteEventResponse {
    pub event_id: Uuid,
    pub cancelled_reservations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(slot: TimeSlot) -> Event {
        let now = Utc::now();
        Event {
            id: Uuid::new_v4(),
            title: "Yoga".into(),
            description: None,
            date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            time_slot: slot,
            duration_hours: TimeSlot::DURATION_HOURS,
            capacity: 2,
            registered_count: 0,
            status: EventStatus::Scheduled,
            location: None,
            created_by: "admin".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn slots_start_and_end_on_the_hour() {
        let morning = sample_event(TimeSlot::Morning);
        assert_eq!(morning.starts_at().to_rfc3339(), "2026-03-10T09:00:00+00:00");
        assert_eq!(morning.ends_at().to_rfc3339(), "2026-03-10T12:00:00+00:00");

        let afternoon = sample_event(TimeSlot::Afternoon);
        assert_eq!(afternoon.starts_at().to_rfc3339(), "2026-03-10T14:00:00+00:00");
        assert_eq!(afternoon.ends_at().to_rfc3339(), "2026-03-10T17:00:00+00:00");
    }

    #[test]
    fn enum_labels_parse_back() {
        for status in PaymentMethod::ALL {
            assert_eq!(status.as_str().parse::<PaymentMethod>().unwrap(), *status);
        }
        assert!("LATE".parse::<EventStatus>().is_err());
    }

    #[test]
    fn wire_names_are_screaming_case() {
        let json = serde_json::to_string(&PaymentMethod::BankTransfer).unwrap();
        assert_eq!(json, "\"BANK_TRANSFER\"");
        let role: UserRole = serde_json::from_str("\"admin\"").unwrap();
        assert_eq!(role, UserRole::Admin);
    }

    #[test]
    fn row_conversion_keeps_sub_records() {
        let now = Utc::now();
        let mut reservation = Reservation {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            user_id: "u1".into(),
            user_email: "u1@example.com".into(),
            user_display_name: None,
            status: ReservationStatus::Confirmed,
            notes: None,
            created_at: now,
            updated_at: now,
            check_in: None,
            payment_status: PaymentStatus::Unpaid,
            payment: None,
        };
        let bare = Reservation::from(ReservationRow::from(&reservation));
        assert_eq!(bare, reservation);

        reservation.check_in = Some(CheckInRecord {
            checked_in_at: now,
            checked_in_by: "admin".into(),
            checked_in_by_name: Some("Ada".into()),
        });
        reservation.payment = Some(PaymentRecord {
            amount_cents: 50,
            method: PaymentMethod::Cash,
            paid_at: now,
            processed_by: "admin".into(),
            processed_by_name: None,
            transaction_id: Some("tx-1".into()),
            notes: None,
        });
        let full = Reservation::from(ReservationRow::from(&reservation));
        assert_eq!(full, reservation);
    }
}
