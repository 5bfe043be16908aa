//! RabbitMQ helpers: short-lived channels for publishing and topology,
//! long-lived prefetch-limited channels for consuming.
//!
//! Consumption is a chain of stream stages:
//! [`RabbitMq::subscribe`] → [`validate`] → (optionally) [`batch`].
//! Every delivery is acknowledged exactly once, either by whoever consumes
//! the validated stream or by the validation stage after redirecting the
//! message to the [`ERROR_EXCHANGE`].

mod batch;
mod delivery;
mod topology;

pub use batch::{batch, Batch, BatchOptions};
pub use delivery::{
    validate, Acknowledge, ErrorEnvelope, MessageSchema, RawDelivery, ValidatedMessage,
};
pub use topology::{
    BindingConfig, TopologyPlan, ERROR_EXCHANGE, VALIDATION_ERROR_QUEUE,
    VALIDATION_ERROR_ROUTING_KEY,
};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;
use crate::error::Result;

const CLOSE_OK: u16 = 200;

/// Publishing seam used by the validation stage.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        priority: Option<u8>,
    ) -> Result<()>;
}

/// A channel together with the connection that owns it.
pub struct AliveChannel {
    pub connection: Connection,
    pub channel: Channel,
}

#[derive(Debug, Clone)]
pub struct RabbitMq {
    settings: BrokerSettings,
}

impl RabbitMq {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub async fn connect(&self) -> Result<Connection> {
        let connection =
            Connection::connect(&self.settings.url, ConnectionProperties::default()).await?;
        Ok(connection)
    }

    /// Open a channel with the configured prefetch applied.
    pub async fn alive_channel(&self) -> Result<AliveChannel> {
        let connection = self.connect().await?;
        match self.prefetch_channel(&connection).await {
            Ok(channel) => Ok(AliveChannel {
                connection,
                channel,
            }),
            Err(e) => {
                close_connection(&connection).await;
                Err(e)
            }
        }
    }

    async fn prefetch_channel(&self, connection: &Connection) -> Result<Channel> {
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.settings.prefetch, BasicQosOptions::default())
            .await?;
        Ok(channel)
    }

    /// Run `handler` on a fresh channel and close channel and connection
    /// afterwards, whether the handler succeeded or not.
    pub async fn with_channel<T, F>(&self, handler: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c Channel) -> BoxFuture<'c, Result<T>>,
    {
        let connection = self.connect().await?;
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(&connection).await;
                return Err(e.into());
            }
        };

        let result = handler(&channel).await;

        if let Err(e) = channel.close(CLOSE_OK, "OK").await {
            debug!(%e, "closing channel failed");
        }
        close_connection(&connection).await;
        result
    }

    /// Declare every exchange, queue and binding, plus the error binding.
    pub async fn declare_topology(&self, bindings: &[BindingConfig]) -> Result<TopologyPlan> {
        let plan = TopologyPlan::new(bindings);
        let to_apply = plan.clone();
        self.with_channel(move |channel| Box::pin(async move { to_apply.apply(channel).await }))
            .await?;
        Ok(plan)
    }

    /// Serialize `message` as JSON and publish it to `exchange`.
    pub async fn publish<M: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &M,
        priority: Option<u8>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.publish_bytes(exchange, routing_key, payload, priority)
            .await
    }

    /// Publish `message` straight to `queue` through the default exchange.
    pub async fn send_to_queue<M: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &M,
        priority: Option<u8>,
    ) -> Result<()> {
        self.publish("", queue, message, priority).await
    }

    /// Start consuming `queue`.
    ///
    /// The returned stream yields deliveries in broker order and ends when
    /// `cancel` fires or the stream is dropped; either closes the channel,
    /// so the broker requeues whatever was not acknowledged yet.
    pub async fn subscribe(
        &self,
        queue: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, RawDelivery>> {
        let AliveChannel {
            connection,
            channel,
        } = self.alive_channel().await?;

        let consumer = match channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(%e, queue, "basic.consume failed");
                close_connection(&connection).await;
                return Err(e.into());
            }
        };
        info!(queue, prefetch = self.settings.prefetch, "consuming");

        let queue_name = queue.to_owned();
        let close = async move {
            if let Err(e) = channel.close(CLOSE_OK, "consumer cancelled").await {
                warn!(%e, queue = %queue_name, "closing consumer channel failed");
            }
            close_connection(&connection).await;
            info!(queue = %queue_name, "consumer closed");
        };

        Ok(until_cancelled(consumer, queue, &cancel, close))
    }

    /// [`subscribe`](Self::subscribe) followed by [`validate`].
    pub async fn consume<T: MessageSchema>(
        &self,
        queue: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, ValidatedMessage<T>>> {
        let deliveries = self.subscribe(queue, cancel).await?;
        let publisher: Arc<dyn Publish> = Arc::new(self.clone());
        Ok(validate(deliveries, queue, publisher))
    }

    /// [`consume`](Self::consume) followed by [`batch`].
    pub async fn batch_consume<T: MessageSchema>(
        &self,
        queue: &str,
        options: BatchOptions,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Batch<T>>> {
        let messages = self.consume::<T>(queue, cancel).await?;
        Ok(batch(messages, options))
    }
}

#[async_trait]
impl Publish for RabbitMq {
    async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        priority: Option<u8>,
    ) -> Result<()> {
        let exchange = exchange.to_owned();
        let routing_key = routing_key.to_owned();
        self.with_channel(move |channel| {
            Box::pin(async move {
                let mut properties =
                    BasicProperties::default().with_content_type("application/json".into());
                if let Some(priority) = priority {
                    properties = properties.with_priority(priority);
                }
                channel
                    .basic_publish(
                        &exchange,
                        &routing_key,
                        BasicPublishOptions::default(),
                        &payload,
                        properties,
                    )
                    .await?
                    .await?;
                debug!(%exchange, %routing_key, bytes = payload.len(), "published");
                Ok(())
            })
        })
        .await
    }
}

async fn close_connection(connection: &Connection) {
    if let Err(e) = connection.close(CLOSE_OK, "OK").await {
        debug!(%e, "closing connection failed");
    }
}

/// Turn a consumer into a delivery stream that ends once `cancel` fires or
/// the stream is dropped. Either way `close` runs exactly once. Consumer
/// errors are logged and skipped.
fn until_cancelled<S, D, C>(
    consumer: S,
    queue: &str,
    cancel: &CancellationToken,
    close: C,
) -> BoxStream<'static, RawDelivery>
where
    S: Stream<Item = lapin::Result<D>> + Send + 'static,
    D: Into<RawDelivery> + Send + 'static,
    C: Future<Output = ()> + Send + 'static,
{
    let stop = cancel.child_token();
    let guard = stop.clone().drop_guard();

    let closing = stop.clone();
    tokio::spawn(async move {
        closing.cancelled().await;
        close.await;
    });

    let queue = queue.to_owned();
    consumer
        .take_until(stop.cancelled_owned())
        .filter_map(move |delivery| {
            let _alive = &guard;
            let outcome = match delivery {
                Ok(delivery) => Some(delivery.into()),
                Err(e) => {
                    warn!(%e, queue = %queue, "consumer error");
                    None
                }
            };
            futures::future::ready(outcome)
        })
        .boxed()
}
