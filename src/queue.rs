use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments,
        Channel, ExchangeDeclareArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
    consumer::AsyncConsumer,
    BasicProperties, Deliver, FieldTable,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AmqpConfig;
use crate::error::AppError;
use crate::models::{Event, EventStatus, Reservation};
use crate::service::Registry;
use crate::store::Store;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    EventCreated,
    EventUpdated,
    EventDeleted,
    EventCompleted,
    CounterResynced,
    ReservationCreated,
    ReservationCancelled,
    CheckedIn,
    CheckInUndone,
    PaymentRecorded,
    PaymentStatusChanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::EventCreated => "event_created",
            ChangeKind::EventUpdated => "event_updated",
            ChangeKind::EventDeleted => "event_deleted",
            ChangeKind::EventCompleted => "event_completed",
            ChangeKind::CounterResynced => "counter_resynced",
            ChangeKind::ReservationCreated => "reservation_created",
            ChangeKind::ReservationCancelled => "reservation_cancelled",
            ChangeKind::CheckedIn => "checked_in",
            ChangeKind::CheckInUndone => "check_in_undone",
            ChangeKind::PaymentRecorded => "payment_recorded",
            ChangeKind::PaymentStatusChanged => "payment_status_changed",
        }
    }
}

// Published after a mutation commits; subscribers refresh their views from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub kind: ChangeKind,
    pub event_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub registered_count: Option<i32>,
    pub event_status: Option<EventStatus>,
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

impl ChangeNotice {
    pub fn new(kind: ChangeKind, event_id: Uuid, actor: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            event_id,
            reservation_id: None,
            registered_count: None,
            event_status: None,
            actor: actor.map(str::to_string),
            at,
        }
    }

    pub fn for_event(
        kind: ChangeKind,
        event: &Event,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            registered_count: Some(event.registered_count),
            event_status: Some(event.status),
            ..Self::new(kind, event.id, actor, at)
        }
    }

    pub fn for_reservation(
        kind: ChangeKind,
        reservation: &Reservation,
        actor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            reservation_id: Some(reservation.id),
            ..Self::new(kind, reservation.event_id, actor, at)
        }
    }

    pub fn routing_key(&self) -> String {
        format!("event.{}.{}", self.event_id, self.kind.as_str())
    }
}

// Delayed message that completes an event once it has ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EventEndMessage {
    event_id: Uuid,
    ends_at: DateTime<Utc>,
}

/// Milliseconds to hold a timer message; never zero.
fn timer_ttl_ms(ends_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
    let delay = (ends_at - now).num_milliseconds();
    (delay > 0).then_some(delay.max(1))
}

// Consumer for event end timers
struct EventEndConsumer<S: Store> {
    registry: Registry<S>,
}

#[async_trait::async_trait]
impl<S: Store> AsyncConsumer for EventEndConsumer<S> {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        if let Err(e) = self.handle_event_end(channel, deliver, content).await {
            error!("Failed to process event end message: {:?}", e);
        }
    }
}

impl<S: Store> EventEndConsumer<S> {
    async fn handle_event_end(
        &self,
        channel: &Channel,
        deliver: Deliver,
        content: Vec<u8>,
    ) -> Result<()> {
        let tag = deliver.delivery_tag();
        let message = match serde_json::from_slice::<EventEndMessage>(&content) {
            Ok(message) => message,
            Err(e) => {
                // Malformed, never requeue
                channel.basic_nack(BasicNackArguments::new(tag, false, false)).await?;
                return Err(e.into());
            }
        };

        let registry = self.registry.clone();
        let event_id = message.event_id;
        let outcome =
            tokio::task::spawn_blocking(move || registry.complete_event(event_id, Utc::now()))
                .await;

        match outcome {
            Ok(Ok(true)) => {
                info!("Event {} completed by end timer", event_id);
                channel.basic_ack(BasicAckArguments::new(tag, false)).await?;
            }
            Ok(Ok(false)) => {
                debug!("Event {} needed no completion", event_id);
                channel.basic_ack(BasicAckArguments::new(tag, false)).await?;
            }
            Ok(Err(AppError::NotFound(_))) => {
                info!("Event {} was deleted before it ended", event_id);
                channel.basic_ack(BasicAckArguments::new(tag, false)).await?;
            }
            Ok(Err(e)) if e.is_transient() => {
                warn!("Completing event {} failed, requeueing: {}", event_id, e);
                channel.basic_nack(BasicNackArguments::new(tag, false, true)).await?;
            }
            Ok(Err(e)) => {
                channel.basic_nack(BasicNackArguments::new(tag, false, false)).await?;
                return Err(e.into());
            }
            Err(join_error) => {
                channel.basic_nack(BasicNackArguments::new(tag, false, true)).await?;
                return Err(join_error.into());
            }
        }
        Ok(())
    }
}

pub struct QueueService<S: Store> {
    registry: Registry<S>,
    connection: Option<Arc<Connection>>,
    change_exchange: String,
    event_end_timer_queue: String,
    event_end_queue: String,
}

impl<S: Store> QueueService<S> {
    pub fn new(registry: Registry<S>) -> Self {
        Self {
            registry,
            connection: None,
            change_exchange: "auroranet.changes".to_string(),
            event_end_timer_queue: "event.end.timer".to_string(),
            event_end_queue: "event.ends".to_string(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub async fn initialize(&mut self, amqp: &AmqpConfig) -> Result<()> {
        info!("Connecting to RabbitMQ at {}:{}", amqp.host, amqp.port);

        let connection = Connection::open(&OpenConnectionArguments::new(
            &amqp.host,
            amqp.port,
            &amqp.user,
            &amqp.password,
        ))
        .await?;
        connection.register_callback(DefaultConnectionCallback).await?;

        let setup_channel = connection.open_channel(None).await?;
        setup_channel.register_callback(DefaultChannelCallback).await?;

        // Change feed, routed by event id and change kind
        setup_channel
            .exchange_declare(
                ExchangeDeclareArguments::new(&self.change_exchange, "topic")
                    .durable(true)
                    .finish(),
            )
            .await?;

        setup_channel
            .queue_declare(
                QueueDeclareArguments::new(&self.event_end_queue)
                    .durable(true)
                    .finish(),
            )
            .await?;

        // Expired timers are dead-lettered through the default exchange
        // straight into the event end queue
        let mut args = FieldTable::new();
        args.insert("x-dead-letter-exchange".try_into()?, "".into());
        args.insert(
            "x-dead-letter-routing-key".try_into()?,
            self.event_end_queue.clone().into(),
        );
        setup_channel
            .queue_declare(
                QueueDeclareArguments::new(&self.event_end_timer_queue)
                    .durable(true)
                    .arguments(args)
                    .finish(),
            )
            .await?;

        self.connection = Some(Arc::new(connection));
        let _ = setup_channel.close().await;

        info!("Connected to RabbitMQ and declared change feed and timer queues");
        Ok(())
    }

    async fn get_fresh_channel(&self) -> Result<Channel> {
        match &self.connection {
            Some(connection) => {
                let channel = connection.open_channel(None).await?;
                channel.register_callback(DefaultChannelCallback).await?;
                Ok(channel)
            }
            None => Err("RabbitMQ connection not initialized".into()),
        }
    }

    // Bounded retry with backoff; gives up quietly since the mutation has
    // already committed
    async fn safe_queue_operation<F, Fut>(&self, operation: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let max_retries = 2;
        let mut delay_ms = 25;

        for attempt in 1..=max_retries {
            match operation().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    warn!(
                        "Queue operation failed (attempt {}/{}), retrying: {:?}",
                        attempt, max_retries, e
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    delay_ms *= 2;
                }
                Err(e) => {
                    error!(
                        "Queue operation failed after {} attempts, giving up: {:?}",
                        max_retries, e
                    );
                }
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<()> {
        let channel = self.get_fresh_channel().await?;
        channel
            .basic_publish(properties, content, BasicPublishArguments::new(exchange, routing_key))
            .await?;
        let _ = channel.close().await;
        Ok(())
    }

    /// Best effort; does nothing without a broker.
    pub async fn publish_change(&self, notice: ChangeNotice) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let routing_key = notice.routing_key();
        let content = serde_json::to_vec(&notice)?;

        self.safe_queue_operation(|| {
            let content = content.clone();
            let routing_key = routing_key.clone();
            async move {
                let properties = BasicProperties::default()
                    .with_content_type("application/json")
                    .finish();
                self.publish(&self.change_exchange, &routing_key, content, properties)
                    .await?;
                debug!("Published change {}", routing_key);
                Ok(())
            }
        })
        .await
    }

    /// Schedules completion of the event at `ends_at` via the TTL timer
    /// queue, or right away when the end has already passed.
    pub async fn schedule_event_end(&self, event_id: Uuid, ends_at: DateTime<Utc>) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let content = serde_json::to_vec(&EventEndMessage { event_id, ends_at })?;

        self.safe_queue_operation(|| {
            let content = content.clone();
            async move {
                match timer_ttl_ms(ends_at, Utc::now()) {
                    Some(ttl_ms) => {
                        let properties = BasicProperties::default()
                            .with_delivery_mode(2)
                            .with_expiration(&ttl_ms.to_string())
                            .finish();
                        self.publish("", &self.event_end_timer_queue, content, properties)
                            .await?;
                        info!("Scheduled end of event {} in {}ms", event_id, ttl_ms);
                    }
                    None => {
                        let properties = BasicProperties::default().with_delivery_mode(2).finish();
                        self.publish("", &self.event_end_queue, content, properties)
                            .await?;
                        info!("Event {} already ended, queued for completion", event_id);
                    }
                }
                Ok(())
            }
        })
        .await
    }

    pub async fn start_consuming_event_ends(&self) -> Result<()> {
        let connection = match &self.connection {
            Some(connection) => connection,
            None => return Err("RabbitMQ connection not initialized".into()),
        };

        let channel = connection.open_channel(None).await?;
        channel.register_callback(DefaultChannelCallback).await?;

        let consumer_tag = format!("event_end_consumer_{}", Uuid::new_v4());
        let args = BasicConsumeArguments::new(&self.event_end_queue, &consumer_tag)
            .manual_ack(true)
            .finish();
        let consumer = EventEndConsumer {
            registry: self.registry.clone(),
        };
        let queue = self.event_end_queue.clone();

        tokio::spawn(async move {
            match channel.basic_consume(consumer, args).await {
                Ok(_) => {
                    info!("Consuming event end timers from {}", queue);
                    // Keep the channel alive for the consumer
                    loop {
                        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                    }
                }
                Err(e) => error!("Failed to start event end consumer: {:?}", e),
            }
        });
        Ok(())
    }
}

impl<S: Store> Clone for QueueService<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            connection: self.connection.clone(),
            change_exchange: self.change_exchange.clone(),
            event_end_timer_queue: self.event_end_timer_queue.clone(),
            event_end_queue: self.event_end_queue.clone(),
        }
    }
}
