use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::topology::{ERROR_EXCHANGE, VALIDATION_ERROR_ROUTING_KEY};
use super::Publish;
use crate::error::Result;

/// Acknowledgement handle of a single delivery. Consuming the box makes a
/// second acknowledgement impossible.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Hand the delivery back to the broker, which redelivers it when
    /// `requeue` is set.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

/// A message as handed over by the broker.
pub struct RawDelivery {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub acker: Box<dyn Acknowledge>,
}

impl From<Delivery> for RawDelivery {
    fn from(delivery: Delivery) -> Self {
        RawDelivery {
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            payload: delivery.data,
            delivery_tag: delivery.delivery_tag,
            acker: Box::new(LapinAcker(delivery.acker)),
        }
    }
}

/// Shape and content rules for a queue's payload.
///
/// Deserialization is the shape check; unknown fields are accepted unless
/// the type opts into `#[serde(deny_unknown_fields)]`. Override `check` for
/// rules serde cannot express.
pub trait MessageSchema: DeserializeOwned + Send + 'static {
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl MessageSchema for Value {}

/// A payload that passed validation and still waits for its acknowledgement.
pub struct ValidatedMessage<T> {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub message: T,
    acker: Box<dyn Acknowledge>,
}

impl<T> ValidatedMessage<T> {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        message: T,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            delivery_tag,
            message,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

/// Body published to the error exchange for a rejected delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error_type: String,
    pub error_message: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub message: Value,
}

struct Rejection {
    reason: String,
    received: Value,
}

fn parse<T: MessageSchema>(payload: &[u8]) -> std::result::Result<T, Rejection> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| Rejection {
        reason: e.to_string(),
        received: Value::String(String::from_utf8_lossy(payload).into_owned()),
    })?;

    let message = match T::deserialize(&value) {
        Ok(message) => message,
        Err(e) => {
            return Err(Rejection {
                reason: e.to_string(),
                received: value,
            })
        }
    };

    match message.check() {
        Ok(()) => Ok(message),
        Err(reason) => Err(Rejection {
            reason,
            received: value,
        }),
    }
}

async fn redirect(raw: RawDelivery, rejection: Rejection, publisher: &dyn Publish) {
    let RawDelivery {
        exchange,
        routing_key,
        delivery_tag,
        acker,
        ..
    } = raw;

    warn!(
        %exchange,
        %routing_key,
        delivery_tag,
        reason = %rejection.reason,
        "message failed validation"
    );

    let envelope = ErrorEnvelope {
        error_type: VALIDATION_ERROR_ROUTING_KEY.to_owned(),
        error_message: rejection.reason,
        exchange_name: exchange,
        routing_key,
        message: rejection.received,
    };

    let published = match serde_json::to_vec(&envelope) {
        Ok(body) => {
            publisher
                .publish_bytes(ERROR_EXCHANGE, VALIDATION_ERROR_ROUTING_KEY, body, None)
                .await
        }
        Err(e) => Err(e.into()),
    };

    match published {
        Ok(()) => {
            if let Err(e) = acker.ack().await {
                error!(%e, delivery_tag, "failed to ack redirected message");
            }
        }
        // Without the error record the delivery must not be acked. Requeue it
        // so it does not hold a prefetch slot until the channel closes.
        Err(e) => {
            error!(
                %e,
                exchange = %envelope.exchange_name,
                routing_key = %envelope.routing_key,
                delivery_tag,
                "failed to publish to error exchange, requeueing message"
            );
            if let Err(e) = acker.nack(true).await {
                error!(%e, delivery_tag, "failed to requeue rejected message");
            }
        }
    }
}

/// Validate every delivery of `deliveries` against `T`.
///
/// Valid payloads are emitted unacknowledged, in arrival order. Invalid ones
/// are published to the error exchange, acknowledged and filtered out.
pub fn validate<T: MessageSchema>(
    deliveries: BoxStream<'static, RawDelivery>,
    queue: &str,
    publisher: Arc<dyn Publish>,
) -> BoxStream<'static, ValidatedMessage<T>> {
    let queue = queue.to_owned();
    deliveries
        .filter_map(move |raw| {
            let queue = queue.clone();
            let publisher = publisher.clone();
            async move {
                match parse::<T>(&raw.payload) {
                    Ok(message) => {
                        debug!(queue = %queue, delivery_tag = raw.delivery_tag, "message accepted");
                        Some(ValidatedMessage {
                            exchange: raw.exchange,
                            queue,
                            routing_key: raw.routing_key,
                            delivery_tag: raw.delivery_tag,
                            message,
                            acker: raw.acker,
                        })
                    }
                    Err(rejection) => {
                        redirect(raw, rejection, publisher.as_ref()).await;
                        None
                    }
                }
            }
        })
        .boxed()
}
