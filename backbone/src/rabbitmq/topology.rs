//! Exchange/queue declarations for durable topic bindings.

use futures::future::try_join_all;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};
use serde::Deserialize;
use tracing::info;

use crate::error::Result;

/// Exchange that receives every message rejected by validation.
pub const ERROR_EXCHANGE: &str = "errors";
/// Routing key (and `errorType`) used for rejected messages.
pub const VALIDATION_ERROR_ROUTING_KEY: &str = "ValidationError";
/// Queue bound to [`ERROR_EXCHANGE`] that keeps rejected messages around.
pub const VALIDATION_ERROR_QUEUE: &str = "errors.ValidationError";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct BindingConfig {
    pub exchange: String,
    pub queue: String,
    pub routing_pattern: String,
}

impl BindingConfig {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_pattern: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_pattern: routing_pattern.into(),
        }
    }

    fn validation_errors() -> Self {
        Self::new(
            ERROR_EXCHANGE,
            VALIDATION_ERROR_QUEUE,
            VALIDATION_ERROR_ROUTING_KEY,
        )
    }
}

/// Everything that has to exist on the broker for a set of bindings,
/// with duplicates removed and first-seen order kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub exchanges: Vec<String>,
    pub queues: Vec<String>,
    pub bindings: Vec<BindingConfig>,
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

impl TopologyPlan {
    /// The error binding is always part of the plan.
    pub fn new(bindings: &[BindingConfig]) -> Self {
        let mut plan = TopologyPlan {
            exchanges: Vec::new(),
            queues: Vec::new(),
            bindings: Vec::new(),
        };
        for binding in bindings
            .iter()
            .cloned()
            .chain(std::iter::once(BindingConfig::validation_errors()))
        {
            push_unique(&mut plan.exchanges, binding.exchange.clone());
            push_unique(&mut plan.queues, binding.queue.clone());
            push_unique(&mut plan.bindings, binding);
        }
        plan
    }

    /// Declare exchanges and queues, then bind. Every step is an assertion,
    /// so applying the same plan again changes nothing on the broker.
    pub async fn apply(&self, channel: &Channel) -> Result<()> {
        let exchanges = self.exchanges.iter().map(|exchange| {
            channel.exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
        });
        try_join_all(exchanges).await?;

        let queues = self.queues.iter().map(|queue| {
            channel.queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
        });
        try_join_all(queues).await?;

        let binds = self.bindings.iter().map(|b| {
            channel.queue_bind(
                &b.queue,
                &b.exchange,
                &b.routing_pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
        });
        try_join_all(binds).await?;

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "topology declared"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> Vec<BindingConfig> {
        vec![
            BindingConfig::new("orders", "orders.created", "order.created"),
            BindingConfig::new("orders", "orders.audit", "order.#"),
            BindingConfig::new("payments", "orders.audit", "payment.settled"),
        ]
    }

    #[test]
    fn plan_includes_error_binding() {
        let plan = TopologyPlan::new(&orders());
        assert_eq!(plan.exchanges, vec!["orders", "payments", "errors"]);
        assert_eq!(
            plan.queues,
            vec!["orders.created", "orders.audit", "errors.ValidationError"]
        );
        assert_eq!(plan.bindings.len(), 4);
        assert_eq!(
            plan.bindings.last(),
            Some(&BindingConfig::new(
                "errors",
                "errors.ValidationError",
                "ValidationError"
            ))
        );
    }

    #[test]
    fn repeated_bindings_collapse() {
        let mut doubled = orders();
        doubled.extend(orders());
        doubled.push(BindingConfig::validation_errors());

        assert_eq!(TopologyPlan::new(&doubled), TopologyPlan::new(&orders()));
    }

    #[test]
    fn planning_is_stable() {
        let first = TopologyPlan::new(&orders());
        let second = TopologyPlan::new(&orders());
        assert_eq!(first, second);
        assert_eq!(TopologyPlan::new(&first.bindings), first);
    }
}
