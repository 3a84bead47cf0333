// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The boundary between the framework and business logic. A service supplies
//! a [`ConsumerHandler`], either by implementing the trait or by wrapping an
//! async closure with [`handler_fn`].

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData};

/// A delivered message as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    /// Queue the message was consumed from.
    pub queue: String,
    pub routing_key: String,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub fn new(queue: &str, routing_key: &str, data: &[u8]) -> Self {
        ConsumerMessage {
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
        }
    }

    /// Deserializes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Business logic invoked for every delivered message.
///
/// An `Err` is treated as retryable; after the retry budget is spent the
/// message is dead-lettered or rejected.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Handler built from an async closure.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wraps `f` into a [`ConsumerHandler`].
///
/// ```ignore
/// let handler = handler_fn(|msg: ConsumerMessage| async move {
///     let event: OrderCreated = msg.json()?;
///     notify(event).await
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F, Fut>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.f)(msg.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct OrderStatusChanged {
        order_id: u64,
        status: String,
    }

    #[test]
    fn json_body() {
        let msg = ConsumerMessage::new(
            "orders",
            "orders",
            br#"{"order_id": 7, "status": "paid"}"#,
        );

        assert_eq!(
            msg.json::<OrderStatusChanged>().unwrap(),
            OrderStatusChanged {
                order_id: 7,
                status: "paid".into()
            }
        );
    }

    #[test]
    fn malformed_json_is_a_handler_error() {
        let msg = ConsumerMessage::new("orders", "orders", b"not json");
        let err = msg.json::<OrderStatusChanged>().unwrap_err();
        assert_eq!(err.reason(), "failure to deserialize message body");
    }

    #[tokio::test]
    async fn closure_handler() {
        let handler = handler_fn(|msg: ConsumerMessage| async move {
            if msg.data.is_empty() {
                Err(HandlerError::new("empty body"))
            } else {
                Ok(())
            }
        });

        let ctx = Context::new();
        assert!(handler
            .exec(&ctx, &ConsumerMessage::new("q", "q", b"{}"))
            .await
            .is_ok());
        assert_eq!(
            handler
                .exec(&ctx, &ConsumerMessage::new("q", "q", b""))
                .await
                .unwrap_err(),
            HandlerError::new("empty body")
        );
    }
}
