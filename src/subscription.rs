// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Configuration
//!
//! A consumer subscribes either to a plain queue on the default exchange or to
//! a queue bound to a direct exchange on a routing key. This module holds that
//! choice ([`SubscriptionConfig`]), the retry policy applied to failed
//! deliveries ([`RetryPolicy`]), the names of the dead-letter pair derived from
//! the subscription ([`DeadLetterConfig`]) and the raw option set a service
//! provides ([`ConsumerOptions`]).

use crate::errors::AmqpError;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Suffix of the dead-letter exchange name.
pub const DEAD_LETTER_EXCHANGE_SUFFIX: &str = ".dlx";
/// Suffix of the dead-letter queue name.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dlq";
/// Suffix of the routing key used to reach the dead-letter queue.
pub const DEAD_LETTER_ROUTING_KEY_SUFFIX: &str = ".failed";

/// The topology a consumer subscribes to. Exactly one form is valid at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionConfig {
    /// Consume straight from a queue published to through the default exchange.
    Queue { queue_name: String },
    /// Consume from a queue bound to a direct exchange on `routing_key`.
    Exchange {
        exchange_name: String,
        routing_key: String,
        queue_name: String,
    },
}

impl SubscriptionConfig {
    pub fn queue(queue_name: impl Into<String>) -> Self {
        SubscriptionConfig::Queue {
            queue_name: queue_name.into(),
        }
    }

    pub fn exchange(
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        SubscriptionConfig::Exchange {
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            queue_name: queue_name.into(),
        }
    }

    /// Resolves a subscription from loosely provided option fields.
    ///
    /// Empty strings count as absent. Either `queue` alone or the full
    /// `exchange`/`routing_key`/`queue` triple must be present.
    pub fn from_parts(
        queue: Option<&str>,
        exchange: Option<&str>,
        routing_key: Option<&str>,
    ) -> Result<Self, AmqpError> {
        fn present(v: Option<&str>) -> Option<&str> {
            v.filter(|s| !s.trim().is_empty())
        }

        match (present(queue), present(exchange), present(routing_key)) {
            (Some(q), None, None) => Ok(SubscriptionConfig::queue(q)),
            (Some(q), Some(e), Some(k)) => Ok(SubscriptionConfig::exchange(e, k, q)),
            (None, None, None) => Err(AmqpError::ConfigurationError(
                "either a queue name or an exchange, routing key and queue name must be provided"
                    .to_owned(),
            )),
            (None, _, _) => Err(AmqpError::ConfigurationError(
                "exchange mode requires a queue name".to_owned(),
            )),
            (Some(_), Some(_), None) => Err(AmqpError::ConfigurationError(
                "exchange mode requires a routing key".to_owned(),
            )),
            (Some(_), None, Some(_)) => Err(AmqpError::ConfigurationError(
                "exchange mode requires an exchange name".to_owned(),
            )),
        }
    }

    pub fn queue_name(&self) -> &str {
        match self {
            SubscriptionConfig::Queue { queue_name } => queue_name,
            SubscriptionConfig::Exchange { queue_name, .. } => queue_name,
        }
    }

    pub fn exchange_name(&self) -> Option<&str> {
        match self {
            SubscriptionConfig::Queue { .. } => None,
            SubscriptionConfig::Exchange { exchange_name, .. } => Some(exchange_name),
        }
    }

    /// The routing key messages arrive with. On the default exchange this is
    /// the queue name.
    pub fn routing_key(&self) -> &str {
        match self {
            SubscriptionConfig::Queue { queue_name } => queue_name,
            SubscriptionConfig::Exchange { routing_key, .. } => routing_key,
        }
    }
}

/// Bounded exponential backoff applied to failed handler invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay,
        }
    }

    /// Handler invocations allowed for a single delivery.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    /// Delay before retry `attempt` (1-indexed): `base_delay * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Names of the dead-letter exchange/queue pair of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl DeadLetterConfig {
    /// Derives the dead-letter names from a subscription.
    ///
    /// The exchange is named after the subscription exchange, or after the
    /// queue in simple-queue mode.
    pub fn for_subscription(subscription: &SubscriptionConfig, enabled: bool) -> Self {
        let origin = subscription
            .exchange_name()
            .unwrap_or_else(|| subscription.queue_name());

        DeadLetterConfig {
            enabled,
            exchange: format!("{origin}{DEAD_LETTER_EXCHANGE_SUFFIX}"),
            queue: format!(
                "{}{DEAD_LETTER_QUEUE_SUFFIX}",
                subscription.queue_name()
            ),
            routing_key: format!(
                "{}{DEAD_LETTER_ROUTING_KEY_SUFFIX}",
                subscription.routing_key()
            ),
        }
    }
}

/// Consumer options as a service declares them.
///
/// Either `queue_name` alone (simple-queue mode) or `exchange_name`,
/// `routing_key` and `queue_name` together (exchange mode) must be set.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsumerOptions {
    pub queue_name: Option<String>,
    pub exchange_name: Option<String>,
    pub routing_key: Option<String>,
    pub enable_dead_letter_queue: bool,
    pub max_retry_attempts: u32,
    #[serde(rename = "retry_base_delay_ms", deserialize_with = "millis")]
    pub retry_base_delay: Duration,
    /// Identifier recorded in dead-letter envelopes and used as consumer tag.
    pub consumer_name: Option<String>,
    pub prefetch_count: u16,
    #[serde(rename = "reconnect_delay_ms", deserialize_with = "millis")]
    pub reconnect_delay: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            queue_name: None,
            exchange_name: None,
            routing_key: None,
            enable_dead_letter_queue: true,
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(5),
            consumer_name: None,
            prefetch_count: 1,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl ConsumerOptions {
    /// Options for a simple-queue subscription.
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        ConsumerOptions {
            queue_name: Some(queue_name.into()),
            ..Default::default()
        }
    }

    /// Options for an exchange-mode subscription.
    pub fn for_exchange(
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        ConsumerOptions {
            queue_name: Some(queue_name.into()),
            exchange_name: Some(exchange_name.into()),
            routing_key: Some(routing_key.into()),
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, max_retry_attempts: u32, retry_base_delay: Duration) -> Self {
        self.max_retry_attempts = max_retry_attempts;
        self.retry_base_delay = retry_base_delay;
        self
    }

    pub fn with_dead_letter_queue(mut self, enabled: bool) -> Self {
        self.enable_dead_letter_queue = enabled;
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn subscription(&self) -> Result<SubscriptionConfig, AmqpError> {
        SubscriptionConfig::from_parts(
            self.queue_name.as_deref(),
            self.exchange_name.as_deref(),
            self.routing_key.as_deref(),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry_attempts, self.retry_base_delay)
    }

    pub fn dead_letter(&self) -> Result<DeadLetterConfig, AmqpError> {
        let subscription = self.subscription()?;
        Ok(DeadLetterConfig::for_subscription(
            &subscription,
            self.enable_dead_letter_queue,
        ))
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_only_is_simple_mode() {
        let sub = SubscriptionConfig::from_parts(Some("orders"), None, None).unwrap();
        assert_eq!(sub, SubscriptionConfig::queue("orders"));
        assert_eq!(sub.routing_key(), "orders");
        assert_eq!(sub.exchange_name(), None);
    }

    #[test]
    fn full_triple_is_exchange_mode() {
        let sub =
            SubscriptionConfig::from_parts(Some("orders"), Some("shop"), Some("order.created"))
                .unwrap();
        assert_eq!(sub.queue_name(), "orders");
        assert_eq!(sub.exchange_name(), Some("shop"));
        assert_eq!(sub.routing_key(), "order.created");
    }

    #[test]
    fn neither_form_is_a_configuration_error() {
        let err = SubscriptionConfig::from_parts(None, None, None).unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));

        let err = SubscriptionConfig::from_parts(Some("  "), Some(""), None).unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[test]
    fn partial_exchange_form_is_a_configuration_error() {
        for (q, e, k) in [
            (Some("q"), Some("ex"), None),
            (Some("q"), None, Some("rk")),
            (None, Some("ex"), Some("rk")),
            (None, Some("ex"), None),
        ] {
            let err = SubscriptionConfig::from_parts(q, e, k).unwrap_err();
            assert!(matches!(err, AmqpError::ConfigurationError(_)), "{q:?} {e:?} {k:?}");
        }
    }

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.total_attempts(), 4);
    }

    #[test]
    fn retry_delay_saturates() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1));
        assert_eq!(policy.delay_for(64), Duration::from_secs(u32::MAX as u64));
        assert_eq!(policy.total_attempts(), u32::MAX);
    }

    #[test]
    fn dead_letter_names_in_exchange_mode() {
        let sub = SubscriptionConfig::exchange("shop", "order.created", "orders");
        let dlq = DeadLetterConfig::for_subscription(&sub, true);

        assert_eq!(dlq.exchange, "shop.dlx");
        assert_eq!(dlq.queue, "orders.dlq");
        assert_eq!(dlq.routing_key, "order.created.failed");
    }

    #[test]
    fn dead_letter_names_in_queue_mode() {
        let dlq = DeadLetterConfig::for_subscription(&SubscriptionConfig::queue("rewards"), false);

        assert!(!dlq.enabled);
        assert_eq!(dlq.exchange, "rewards.dlx");
        assert_eq!(dlq.queue, "rewards.dlq");
        assert_eq!(dlq.routing_key, "rewards.failed");
    }

    #[test]
    fn options_derive_dead_letter_config() {
        let opts = ConsumerOptions::for_exchange("shop", "order.paid", "payments")
            .with_dead_letter_queue(false);
        let dlq = opts.dead_letter().unwrap();

        assert!(!dlq.enabled);
        assert_eq!(dlq.routing_key, "order.paid.failed");
        assert!(ConsumerOptions::default().dead_letter().is_err());
    }

    #[test]
    fn options_defaults() {
        let opts = ConsumerOptions::default();
        assert!(opts.enable_dead_letter_queue);
        assert_eq!(opts.retry_policy(), RetryPolicy::default());
        assert!(opts.subscription().is_err());
    }

    #[test]
    fn options_deserialize_durations_in_millis() {
        let opts: ConsumerOptions = serde_json::from_str(
            r#"{"queue_name": "notifications", "max_retry_attempts": 2, "retry_base_delay_ms": 250}"#,
        )
        .unwrap();

        assert_eq!(opts.retry_policy(), RetryPolicy::new(2, Duration::from_millis(250)));
        assert_eq!(opts.reconnect_delay, Duration::from_secs(1));
        assert_eq!(
            opts.subscription().unwrap(),
            SubscriptionConfig::queue("notifications")
        );
    }
}
