use std::time::Duration;

use backbone::config::Settings;
use backbone::db::build_pool;
use backbone::logging::init_logging;
use backbone::rabbitmq::{Batch, BatchOptions, BindingConfig, MessageSchema, RabbitMq};
use backbone::transaction::TransactionRunner;
use backbone::AppError;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::{PgPool, Postgres, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

fn default_exchange() -> String {
    "events".into()
}

fn default_queue() -> String {
    "events.archive".into()
}

fn default_routing_pattern() -> String {
    "#".into()
}

fn default_window_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
struct ArchiverSettings {
    #[serde(default = "default_exchange")]
    exchange: String,
    #[serde(default = "default_queue")]
    queue: String,
    #[serde(default = "default_routing_pattern")]
    routing_pattern: String,
    #[serde(default = "default_window_ms")]
    window_ms: u64,
    #[serde(default = "default_window_ms")]
    creation_interval_ms: u64,
}

impl ArchiverSettings {
    fn new() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("ARCHIVER"))
            .build()?
            .try_deserialize()
    }

    fn binding(&self) -> BindingConfig {
        BindingConfig::new(&self.exchange, &self.queue, &self.routing_pattern)
    }

    fn batch_options(&self) -> backbone::Result<BatchOptions> {
        BatchOptions::new(
            Duration::from_millis(self.window_ms),
            Duration::from_millis(self.creation_interval_ms),
        )
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ArchivedEvent {
    event_id: Uuid,
    event_type: String,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
    /// Fields beyond the known ones, archived as they arrived.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl MessageSchema for ArchivedEvent {
    fn check(&self) -> Result<(), String> {
        if self.event_type.trim().is_empty() {
            return Err("eventType must not be empty".into());
        }
        Ok(())
    }
}

struct ArchiveRow {
    routing_key: String,
    event: ArchivedEvent,
}

fn rows(batch: &Batch<ArchivedEvent>) -> Vec<ArchiveRow> {
    batch
        .messages()
        .iter()
        .map(|m| ArchiveRow {
            routing_key: m.routing_key.clone(),
            event: m.message.clone(),
        })
        .collect()
}

async fn ensure_schema(runner: &TransactionRunner<PgPool>) -> Result<(), AppError> {
    runner
        .run(|tx| {
            Box::pin(async move {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS archived_events (
                        event_id UUID PRIMARY KEY,
                        event_type TEXT NOT NULL,
                        routing_key TEXT NOT NULL,
                        occurred_at TIMESTAMPTZ NOT NULL,
                        payload JSONB NOT NULL,
                        attributes JSONB NOT NULL DEFAULT '{}'::jsonb,
                        archived_at TIMESTAMPTZ DEFAULT now()
                    )",
                )
                .execute(&mut **tx)
                .await?;
                Ok::<_, AppError>(())
            })
        })
        .await?;
    info!("database schema ensured");
    Ok(())
}

async fn insert_rows(
    tx: &mut Transaction<'static, Postgres>,
    rows: Vec<ArchiveRow>,
) -> Result<(), AppError> {
    for row in &rows {
        // redelivered batches must not fail on rows that already made it
        sqlx::query(
            "INSERT INTO archived_events
                (event_id, event_type, routing_key, occurred_at, payload, attributes)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(row.event.event_id)
        .bind(&row.event.event_type)
        .bind(&row.routing_key)
        .bind(row.event.occurred_at)
        .bind(&row.event.payload)
        .bind(sqlx::types::Json(&row.event.extra))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new()?;
    init_logging(&settings.logging());

    let archiver = ArchiverSettings::new()?;
    let options = archiver.batch_options()?;

    let runner = TransactionRunner::new(build_pool(&settings.database()));
    ensure_schema(&runner).await?;

    let mq = RabbitMq::new(settings.broker());
    mq.declare_topology(&[archiver.binding()]).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "listening for ctrl-c failed");
        }
        info!("shutdown requested");
        shutdown.cancel();
    });

    let mut batches = mq
        .batch_consume::<ArchivedEvent>(&archiver.queue, options, cancel.clone())
        .await?;
    info!(queue = %archiver.queue, exchange = %archiver.exchange, "event-archiver started");

    while let Some(batch) = batches.next().await {
        let pending = rows(&batch);
        let count = pending.len();

        if let Err(e) = runner
            .run(move |tx| Box::pin(insert_rows(tx, pending)))
            .await
        {
            // unacked messages go back to the queue once the channel closes
            error!(%e, count, "archiving batch failed, stopping consumer");
            cancel.cancel();
            return Err(e.into());
        }

        match batch.ack_all().await {
            Ok(()) => info!(count, "batch archived"),
            Err(e) => error!(%e, count, "batch archived but acknowledgement incomplete"),
        }
    }

    info!("event-archiver stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_accepts_extra_fields() {
        let raw = json!({
            "eventId": "7f0c2f6e-3b7a-4c55-9d8e-0c1b2f3a4d5e",
            "eventType": "order.created",
            "occurredAt": "2026-03-01T10:15:00Z",
            "payload": {"orderId": 7},
            "source": "checkout"
        });
        let event: ArchivedEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.payload, json!({"orderId": 7}));
        assert_eq!(Value::Object(event.extra.clone()), json!({"source": "checkout"}));
        assert!(event.check().is_ok());
    }

    #[test]
    fn blank_event_type_fails_check() {
        let raw = json!({
            "eventId": "7f0c2f6e-3b7a-4c55-9d8e-0c1b2f3a4d5e",
            "eventType": "  ",
            "occurredAt": "2026-03-01T10:15:00Z"
        });
        let event: ArchivedEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.payload, Value::Null);
        assert!(event.extra.is_empty());
        assert!(event.check().is_err());
    }

    #[test]
    fn missing_timestamp_is_a_shape_error() {
        let raw = json!({
            "eventId": "7f0c2f6e-3b7a-4c55-9d8e-0c1b2f3a4d5e",
            "eventType": "order.created"
        });
        assert!(serde_json::from_value::<ArchivedEvent>(raw).is_err());
    }

    #[test]
    fn archiver_defaults() -> anyhow::Result<()> {
        let archiver: ArchiverSettings = config::Config::builder()
            .build()?
            .try_deserialize()?;
        assert_eq!(archiver.binding(), BindingConfig::new("events", "events.archive", "#"));
        assert_eq!(archiver.batch_options()?, BatchOptions::default());
        Ok(())
    }
}
