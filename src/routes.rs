//! HTTP surface. Store work runs on the blocking pool and is awaited to the
//! end; the stores bound their own lock waits and statements, so a `TIMEOUT`
//! answer means nothing was committed. Change notices go out after the
//! response is decided and never fail it.

use actix_web::{rt, web, HttpResponse};
use chrono::Utc;
use log::{error, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{Caller, Principal};
use crate::error::{AppError, AppResult};
use crate::models::{
    AddParticipantRequest, BulkCheckInRequest, EventChanges, EventListQuery, LimitQuery,
    MyReservationsQuery, NewEventRequest, PaymentStatusRequest, RecordPaymentRequest,
    RegisterRequest,
};
use crate::provisioning::{EmailUserRequest, PhoneUserRequest, SignUpRequest};
use crate::queue::{ChangeKind, ChangeNotice, QueueService};
use crate::service::Registry;
use crate::store::Store;
use crate::views::{ParticipantQuery, SearchQuery};

pub struct AppState<S: Store> {
    pub registry: Registry<S>,
    pub queue: QueueService<S>,
}

impl<S: Store> AppState<S> {
    pub fn new(registry: Registry<S>, queue: QueueService<S>) -> Self {
        Self { registry, queue }
    }

    /// Runs `work` on the blocking pool with the registry and the resolved
    /// caller.
    async fn run<T, F>(&self, operation: &'static str, caller: Caller, work: F) -> AppResult<T>
    where
        F: FnOnce(&Registry<S>, &Principal) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        let result = web::block(move || {
            let principal = registry.principal(caller.uid())?;
            work(&registry, &principal)
        })
        .await
        .map_err(AppError::from)
        .and_then(|r| r);
        log_failure(operation, &result);
        result
    }

    fn notify(&self, notice: ChangeNotice) {
        let queue = self.queue.clone();
        rt::spawn(async move {
            let key = notice.routing_key();
            if let Err(e) = queue.publish_change(notice).await {
                error!("Failed to publish change {}: {:?}", key, e);
            }
        });
    }

    fn schedule_end(&self, event_id: Uuid, ends_at: chrono::DateTime<Utc>) {
        let queue = self.queue.clone();
        rt::spawn(async move {
            if let Err(e) = queue.schedule_event_end(event_id, ends_at).await {
                error!("Failed to schedule end of event {}: {:?}", event_id, e);
            }
        });
    }
}

fn log_failure<T>(operation: &str, result: &AppResult<T>) {
    if let Err(e) = result {
        match e {
            AppError::Internal(_) | AppError::Unavailable(_) | AppError::Timeout(_) => {
                error!("{operation} failed: {e}")
            }
            _ => warn!("{operation} rejected: {e}"),
        }
    }
}

type State<S> = web::Data<AppState<S>>;

#[derive(Debug, Serialize)]
struct CompletedEvents {
    completed: Vec<Uuid>,
}

// ---- users ------------------------------------------------------------------

async fn sign_up<S: Store>(
    state: State<S>,
    caller: Caller,
    form: web::Json<SignUpRequest>,
) -> AppResult<HttpResponse> {
    // No role record exists yet, so this one cannot go through `run`.
    let registry = state.registry.clone();
    let request = form.into_inner();
    let result = web::block(move || registry.sign_up(caller.uid(), request, Utc::now()))
        .await
        .map_err(AppError::from)
        .and_then(|r| r);
    log_failure("sign up", &result);
    Ok(HttpResponse::Created().json(result?))
}

async fn me<S: Store>(state: State<S>, caller: Caller) -> AppResult<HttpResponse> {
    let user = state
        .run("me", caller, |_, principal| Ok(principal.user().clone()))
        .await?;
    Ok(HttpResponse::Ok().json(user))
}

async fn list_users<S: Store>(state: State<S>, caller: Caller) -> AppResult<HttpResponse> {
    let users = state
        .run("list users", caller, |registry, principal| registry.users(principal))
        .await?;
    Ok(HttpResponse::Ok().json(users))
}

async fn create_email_user<S: Store>(
    state: State<S>,
    caller: Caller,
    form: web::Json<EmailUserRequest>,
) -> AppResult<HttpResponse> {
    let request = form.into_inner();
    let created = state
        .run("create email user", caller, move |registry, principal| {
            registry.create_email_user(principal, request, Utc::now())
        })
        .await?;
    Ok(HttpResponse::Created().json(created))
}

async fn create_phone_user<S: Store>(
    state: State<S>,
    caller: Caller,
    form: web::Json<PhoneUserRequest>,
) -> AppResult<HttpResponse> {
    let request = form.into_inner();
    let created = state
        .run("create phone user", caller, move |registry, principal| {
            registry.create_phone_user(principal, request, Utc::now())
        })
        .await?;
    Ok(HttpResponse::Created().json(created))
}

// ---- events -----------------------------------------------------------------

async fn create_event<S: Store>(
    state: State<S>,
    caller: Caller,
    form: web::Json<NewEventRequest>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let request = form.into_inner();
    let event = state
        .run("create event", caller, move |registry, principal| {
            registry.create_event(principal, request, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_event(
        ChangeKind::EventCreated,
        &event,
        Some(&actor),
        Utc::now(),
    ));
    state.schedule_end(event.id, event.ends_at());
    Ok(HttpResponse::Created().json(event))
}

async fn list_events<S: Store>(
    state: State<S>,
    caller: Caller,
    query: web::Query<EventListQuery>,
) -> AppResult<HttpResponse> {
    let query = query.into_inner();
    let events = state
        .run("list events", caller, move |registry, _| registry.events(&query))
        .await?;
    Ok(HttpResponse::Ok().json(events))
}

async fn upcoming_events<S: Store>(
    state: State<S>,
    caller: Caller,
    query: web::Query<LimitQuery>,
) -> AppResult<HttpResponse> {
    let limit = query.limit;
    let events = state
        .run("upcoming events", caller, move |registry, _| {
            registry.upcoming_events(limit, Utc::now())
        })
        .await?;
    Ok(HttpResponse::Ok().json(events))
}

async fn created_events<S: Store>(
    state: State<S>,
    caller: Caller,
    query: web::Query<LimitQuery>,
) -> AppResult<HttpResponse> {
    let limit = query.limit;
    let events = state
        .run("created events", caller, move |registry, principal| {
            registry.events_created_by(principal, limit)
        })
        .await?;
    Ok(HttpResponse::Ok().json(events))
}

async fn complete_events<S: Store>(state: State<S>, caller: Caller) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let completed = state
        .run("complete events", caller, |registry, principal| {
            registry.complete_past_events(principal, Utc::now())
        })
        .await?;

    for event_id in &completed {
        state.notify(ChangeNotice::new(
            ChangeKind::EventCompleted,
            *event_id,
            Some(&actor),
            Utc::now(),
        ));
    }
    Ok(HttpResponse::Ok().json(CompletedEvents { completed }))
}

async fn get_event<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let event_id = path.into_inner();
    let event = state
        .run("get event", caller, move |registry, _| registry.event(event_id))
        .await?;
    Ok(HttpResponse::Ok().json(event))
}

async fn update_event<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
    form: web::Json<EventChanges>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let event_id = path.into_inner();
    let changes = form.into_inner();
    let reschedule = changes.date.is_some() || changes.time_slot.is_some();
    let event = state
        .run("update event", caller, move |registry, principal| {
            registry.update_event(principal, event_id, changes, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_event(
        ChangeKind::EventUpdated,
        &event,
        Some(&actor),
        Utc::now(),
    ));
    if reschedule {
        // The earlier timer still fires but finds the event unfinished.
        state.schedule_end(event.id, event.ends_at());
    }
    Ok(HttpResponse::Ok().json(event))
}

async fn delete_event<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let event_id = path.into_inner();
    let deleted = state
        .run("delete event", caller, move |registry, principal| {
            registry.delete_event(principal, event_id, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::new(ChangeKind::EventDeleted, event_id, Some(&actor), Utc::now()));
    Ok(HttpResponse::Ok().json(deleted))
}

async fn availability<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let event_id = path.into_inner();
    let seats = state
        .run("availability", caller, move |registry, _| registry.availability(event_id))
        .await?;
    Ok(HttpResponse::Ok().json(seats))
}

async fn register<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
    form: Option<web::Json<RegisterRequest>>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let event_id = path.into_inner();
    let notes = form.and_then(|f| f.into_inner().notes);
    let reservation = state
        .run("register", caller, move |registry, principal| {
            registry.register(principal, event_id, notes, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_reservation(
        ChangeKind::ReservationCreated,
        &reservation,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Created().json(reservation))
}

async fn resync_event<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let event_id = path.into_inner();
    let event = state
        .run("resync event", caller, move |registry, principal| {
            registry.resync_event(principal, event_id, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_event(
        ChangeKind::CounterResynced,
        &event,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Ok().json(event))
}

async fn participants<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
    query: web::Query<ParticipantQuery>,
) -> AppResult<HttpResponse> {
    let event_id = path.into_inner();
    let query = query.into_inner();
    let found = state
        .run("participants", caller, move |registry, principal| {
            registry.participants(principal, event_id, &query)
        })
        .await?;
    Ok(HttpResponse::Ok().json(found))
}

async fn add_participant<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
    form: web::Json<AddParticipantRequest>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let event_id = path.into_inner();
    let user_id = form.into_inner().user_id;
    let reservation = state
        .run("add participant", caller, move |registry, principal| {
            registry.register_user(principal, event_id, &user_id, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_reservation(
        ChangeKind::ReservationCreated,
        &reservation,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Created().json(reservation))
}

async fn remove_participant<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<(Uuid, Uuid)>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let (event_id, reservation_id) = path.into_inner();
    let reservation = state
        .run("remove participant", caller, move |registry, principal| {
            registry.remove_participant(principal, event_id, reservation_id, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_reservation(
        ChangeKind::ReservationCancelled,
        &reservation,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Ok().json(reservation))
}

async fn statistics<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let event_id = path.into_inner();
    let stats = state
        .run("statistics", caller, move |registry, principal| {
            registry.statistics(principal, event_id)
        })
        .await?;
    Ok(HttpResponse::Ok().json(stats))
}

async fn candidates<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
    query: web::Query<SearchQuery>,
) -> AppResult<HttpResponse> {
    let event_id = path.into_inner();
    let search = query.into_inner().search;
    let users = state
        .run("candidates", caller, move |registry, principal| {
            registry.candidates(principal, event_id, search.as_deref())
        })
        .await?;
    Ok(HttpResponse::Ok().json(users))
}

// ---- reservations -----------------------------------------------------------

async fn my_reservations<S: Store>(
    state: State<S>,
    caller: Caller,
    query: web::Query<MyReservationsQuery>,
) -> AppResult<HttpResponse> {
    let query = query.into_inner();
    let mine = state
        .run("my reservations", caller, move |registry, principal| {
            registry.my_reservations(principal, &query)
        })
        .await?;
    Ok(HttpResponse::Ok().json(mine))
}

async fn get_reservation<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let reservation_id = path.into_inner();
    let reservation = state
        .run("get reservation", caller, move |registry, principal| {
            registry.reservation(principal, reservation_id)
        })
        .await?;
    Ok(HttpResponse::Ok().json(reservation))
}

async fn cancel_reservation<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let reservation_id = path.into_inner();
    let reservation = state
        .run("cancel reservation", caller, move |registry, principal| {
            registry.cancel(principal, reservation_id, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_reservation(
        ChangeKind::ReservationCancelled,
        &reservation,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Ok().json(reservation))
}

async fn check_in<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let reservation_id = path.into_inner();
    let reservation = state
        .run("check in", caller, move |registry, principal| {
            registry.check_in(principal, reservation_id, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_reservation(
        ChangeKind::CheckedIn,
        &reservation,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Ok().json(reservation))
}

async fn undo_check_in<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let reservation_id = path.into_inner();
    let reservation = state
        .run("undo check in", caller, move |registry, principal| {
            registry.undo_check_in(principal, reservation_id, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_reservation(
        ChangeKind::CheckInUndone,
        &reservation,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Ok().json(reservation))
}

async fn bulk_check_in<S: Store>(
    state: State<S>,
    caller: Caller,
    form: web::Json<BulkCheckInRequest>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let ids = form.into_inner().reservation_ids;
    let report = state
        .run("bulk check in", caller, move |registry, principal| {
            registry.bulk_check_in(principal, &ids, Utc::now())
        })
        .await?;

    for reservation in &report.checked_in {
        state.notify(ChangeNotice::for_reservation(
            ChangeKind::CheckedIn,
            reservation,
            Some(&actor),
            Utc::now(),
        ));
    }
    Ok(HttpResponse::Ok().json(report))
}

async fn record_payment<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
    form: web::Json<RecordPaymentRequest>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let reservation_id = path.into_inner();
    let request = form.into_inner();
    let reservation = state
        .run("record payment", caller, move |registry, principal| {
            registry.record_payment(principal, reservation_id, request, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_reservation(
        ChangeKind::PaymentRecorded,
        &reservation,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Ok().json(reservation))
}

async fn update_payment_status<S: Store>(
    state: State<S>,
    caller: Caller,
    path: web::Path<Uuid>,
    form: web::Json<PaymentStatusRequest>,
) -> AppResult<HttpResponse> {
    let actor = caller.uid().to_string();
    let reservation_id = path.into_inner();
    let status = form.status;
    let reservation = state
        .run("update payment status", caller, move |registry, principal| {
            registry.update_payment_status(principal, reservation_id, status, Utc::now())
        })
        .await?;

    state.notify(ChangeNotice::for_reservation(
        ChangeKind::PaymentStatusChanged,
        &reservation,
        Some(&actor),
        Utc::now(),
    ));
    Ok(HttpResponse::Ok().json(reservation))
}

// ---- wiring -----------------------------------------------------------------

/// Malformed bodies, queries and paths are validation errors.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| AppError::Validation(err.to_string()).into())
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _req| AppError::Validation(err.to_string()).into())
}

fn path_config() -> web::PathConfig {
    web::PathConfig::default()
        .error_handler(|err, _req| AppError::Validation(err.to_string()).into())
}

/// Literal segments are registered before `{id}` so they win the match.
pub fn configure<S: Store>(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .app_data(path_config())
        .route("/signup", web::post().to(sign_up::<S>))
        .route("/users/me", web::get().to(me::<S>))
        .route("/users", web::get().to(list_users::<S>))
        .route("/users/email", web::post().to(create_email_user::<S>))
        .route("/users/phone", web::post().to(create_phone_user::<S>))
        .service(
            web::resource("/events")
                .route(web::post().to(create_event::<S>))
                .route(web::get().to(list_events::<S>)),
        )
        .route("/events/upcoming", web::get().to(upcoming_events::<S>))
        .route("/events/created", web::get().to(created_events::<S>))
        .route("/events/complete", web::post().to(complete_events::<S>))
        .service(
            web::resource("/events/{id}")
                .route(web::get().to(get_event::<S>))
                .route(web::patch().to(update_event::<S>))
                .route(web::delete().to(delete_event::<S>)),
        )
        .route("/events/{id}/availability", web::get().to(availability::<S>))
        .route("/events/{id}/register", web::post().to(register::<S>))
        .route("/events/{id}/resync", web::post().to(resync_event::<S>))
        .service(
            web::resource("/events/{id}/participants")
                .route(web::get().to(participants::<S>))
                .route(web::post().to(add_participant::<S>)),
        )
        .route(
            "/events/{id}/participants/{reservation_id}",
            web::delete().to(remove_participant::<S>),
        )
        .route("/events/{id}/statistics", web::get().to(statistics::<S>))
        .route("/events/{id}/candidates", web::get().to(candidates::<S>))
        .route("/reservations/mine", web::get().to(my_reservations::<S>))
        .route("/reservations/check-in", web::post().to(bulk_check_in::<S>))
        .route("/reservations/{id}", web::get().to(get_reservation::<S>))
        .route("/reservations/{id}/cancel", web::post().to(cancel_reservation::<S>))
        .service(
            web::resource("/reservations/{id}/check-in")
                .route(web::post().to(check_in::<S>))
                .route(web::delete().to(undo_check_in::<S>)),
        )
        .route("/reservations/{id}/payment", web::post().to(record_payment::<S>))
        .route(
            "/reservations/{id}/payment-status",
            web::put().to(update_payment_status::<S>),
        );
}
