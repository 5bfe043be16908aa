use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backbone::rabbitmq::{
    validate, Acknowledge, ErrorEnvelope, MessageSchema, Publish, RawDelivery, ValidatedMessage,
    ERROR_EXCHANGE, VALIDATION_ERROR_ROUTING_KEY,
};
use backbone::{AppError, Result};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct OrderCreated {
    order_id: u64,
    amount_cents: i64,
}

impl MessageSchema for OrderCreated {
    fn check(&self) -> std::result::Result<(), String> {
        if self.amount_cents <= 0 {
            return Err(format!("amountCents must be positive, got {}", self.amount_cents));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Acks {
    acked: Mutex<Vec<u64>>,
    requeued: Mutex<Vec<u64>>,
}

struct RecordingAck {
    tag: u64,
    acks: Arc<Acks>,
}

#[async_trait]
impl Acknowledge for RecordingAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acks.acked.lock().unwrap().push(self.tag);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        assert!(requeue, "rejected deliveries must be requeued");
        self.acks.requeued.lock().unwrap().push(self.tag);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    fail: bool,
    published: Mutex<Vec<(String, String, Vec<u8>)>>,
}

#[async_trait]
impl Publish for RecordingPublisher {
    async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        _priority: Option<u8>,
    ) -> Result<()> {
        if self.fail {
            return Err(AppError::Publish {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                reason: "connection refused".into(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((exchange.into(), routing_key.into(), payload));
        Ok(())
    }
}

fn delivery(tag: u64, payload: &[u8], acks: &Arc<Acks>) -> RawDelivery {
    RawDelivery {
        exchange: "orders".into(),
        routing_key: "order.created".into(),
        payload: payload.to_vec(),
        delivery_tag: tag,
        acker: Box::new(RecordingAck {
            tag,
            acks: acks.clone(),
        }),
    }
}

async fn run(
    deliveries: Vec<RawDelivery>,
    publisher: Arc<RecordingPublisher>,
) -> Vec<ValidatedMessage<OrderCreated>> {
    let input = stream::iter(deliveries).boxed();
    validate::<OrderCreated>(input, "orders.audit", publisher)
        .collect()
        .await
}

fn envelopes(publisher: &RecordingPublisher) -> Vec<ErrorEnvelope> {
    publisher
        .published
        .lock()
        .unwrap()
        .iter()
        .map(|(exchange, routing_key, body)| {
            assert_eq!(exchange, ERROR_EXCHANGE);
            assert_eq!(routing_key, VALIDATION_ERROR_ROUTING_KEY);
            serde_json::from_slice(body).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn valid_message_is_emitted_unacknowledged() {
    let acks = Arc::new(Acks::default());
    let publisher = Arc::new(RecordingPublisher::default());

    let out = run(
        vec![delivery(1, br#"{"orderId":7,"amountCents":1250}"#, &acks)],
        publisher.clone(),
    )
    .await;

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].message, OrderCreated { order_id: 7, amount_cents: 1250 });
    assert_eq!(out[0].queue, "orders.audit");
    assert_eq!(out[0].exchange, "orders");
    assert_eq!(out[0].routing_key, "order.created");
    assert!(acks.acked.lock().unwrap().is_empty());
    assert!(publisher.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn caller_acknowledges_exactly_once() {
    let acks = Arc::new(Acks::default());
    let publisher = Arc::new(RecordingPublisher::default());

    let out = run(
        vec![delivery(4, br#"{"orderId":1,"amountCents":10}"#, &acks)],
        publisher,
    )
    .await;

    for message in out {
        message.ack().await.unwrap();
    }
    assert_eq!(*acks.acked.lock().unwrap(), vec![4]);
}

#[tokio::test]
async fn unknown_fields_are_allowed() {
    let acks = Arc::new(Acks::default());
    let publisher = Arc::new(RecordingPublisher::default());

    let out = run(
        vec![delivery(
            2,
            br#"{"orderId":9,"amountCents":5,"channel":"web"}"#,
            &acks,
        )],
        publisher.clone(),
    )
    .await;

    assert_eq!(out.len(), 1);
    assert!(publisher.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn shape_mismatch_is_redirected_and_acked() {
    let acks = Arc::new(Acks::default());
    let publisher = Arc::new(RecordingPublisher::default());

    let out = run(vec![delivery(3, br#"{"orderId":"seven"}"#, &acks)], publisher.clone()).await;

    assert!(out.is_empty());
    assert_eq!(*acks.acked.lock().unwrap(), vec![3]);

    let sent = envelopes(&publisher);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].error_type, "ValidationError");
    assert_eq!(sent[0].exchange_name, "orders");
    assert_eq!(sent[0].routing_key, "order.created");
    assert_eq!(sent[0].message, json!({"orderId": "seven"}));
    assert!(!sent[0].error_message.is_empty());
}

#[tokio::test]
async fn rule_violation_is_redirected() {
    let acks = Arc::new(Acks::default());
    let publisher = Arc::new(RecordingPublisher::default());

    let out = run(
        vec![delivery(5, br#"{"orderId":7,"amountCents":-3}"#, &acks)],
        publisher.clone(),
    )
    .await;

    assert!(out.is_empty());
    let sent = envelopes(&publisher);
    assert_eq!(sent[0].error_message, "amountCents must be positive, got -3");
    assert_eq!(*acks.acked.lock().unwrap(), vec![5]);
}

#[tokio::test]
async fn non_json_payload_keeps_raw_text() {
    let acks = Arc::new(Acks::default());
    let publisher = Arc::new(RecordingPublisher::default());

    let out = run(vec![delivery(6, b"not json at all", &acks)], publisher.clone()).await;

    assert!(out.is_empty());
    let sent = envelopes(&publisher);
    assert_eq!(sent[0].message, json!("not json at all"));
    assert_eq!(*acks.acked.lock().unwrap(), vec![6]);
}

#[tokio::test]
async fn failed_redirect_requeues_instead_of_acking() {
    let acks = Arc::new(Acks::default());
    let publisher = Arc::new(RecordingPublisher {
        fail: true,
        ..RecordingPublisher::default()
    });

    let out = run(vec![delivery(8, br#"{}"#, &acks)], publisher).await;

    assert!(out.is_empty());
    assert!(acks.acked.lock().unwrap().is_empty());
    assert_eq!(*acks.requeued.lock().unwrap(), vec![8]);
}

#[tokio::test]
async fn order_is_preserved_across_rejections() {
    let acks = Arc::new(Acks::default());
    let publisher = Arc::new(RecordingPublisher::default());

    let out = run(
        vec![
            delivery(10, br#"{"orderId":1,"amountCents":1}"#, &acks),
            delivery(11, br#"{"orderId":2}"#, &acks),
            delivery(12, br#"{"orderId":3,"amountCents":3}"#, &acks),
            delivery(13, br#"{"orderId":4,"amountCents":4}"#, &acks),
        ],
        publisher.clone(),
    )
    .await;

    let tags: Vec<u64> = out.iter().map(|m| m.delivery_tag).collect();
    assert_eq!(tags, vec![10, 12, 13]);
    assert_eq!(*acks.acked.lock().unwrap(), vec![11]);
    assert_eq!(envelopes(&publisher).len(), 1);
}
