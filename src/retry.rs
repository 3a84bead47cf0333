// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Retry with Exponential Backoff
//!
//! [`RetryExecutor`] invokes a handler up to `max_attempts + 1` times, sleeping
//! `base_delay * 2^(n-1)` before retry `n`. Every handler error is retryable.
//! A backoff sleep is cut short when the consumer's shutdown signal fires; a
//! handler invocation already in progress is always allowed to finish.

use crate::{
    errors::HandlerError,
    handler::{ConsumerHandler, ConsumerMessage},
    subscription::RetryPolicy,
};
use opentelemetry::Context;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Result of running a handler under a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The handler succeeded on attempt `attempts`.
    Success { attempts: u32 },
    /// Every allowed attempt failed.
    Exhausted { attempts: u32, last_error: HandlerError },
    /// Shutdown was signalled while waiting to retry.
    Interrupted { attempts: u32, last_error: HandlerError },
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, shutdown: watch::Receiver<bool>) -> Self {
        RetryExecutor { policy, shutdown }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run(
        &self,
        handler: &dyn ConsumerHandler,
        ctx: &Context,
        msg: &ConsumerMessage,
    ) -> RetryOutcome {
        let total = self.policy.total_attempts();
        let mut attempt = 1;

        loop {
            let err = match handler.exec(ctx, msg).await {
                Ok(()) => {
                    debug!(queue = msg.queue, attempt, "message successfully processed");
                    return RetryOutcome::Success { attempts: attempt };
                }
                Err(err) => err,
            };

            if attempt >= total {
                warn!(
                    queue = msg.queue,
                    attempts = attempt,
                    error = err.to_string(),
                    "retry attempts exhausted"
                );
                return RetryOutcome::Exhausted {
                    attempts: attempt,
                    last_error: err,
                };
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                queue = msg.queue,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = err.to_string(),
                "error while handling msg, retrying"
            );

            if !self.backoff(delay).await {
                debug!(queue = msg.queue, attempt, "retry interrupted by shutdown");
                return RetryOutcome::Interrupted {
                    attempts: attempt,
                    last_error: err,
                };
            }

            attempt += 1;
        }
    }

    /// Sleeps for `delay`. Returns `false` if shutdown was signalled first.
    async fn backoff(&self, delay: std::time::Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return false;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = shutdown.changed() => match changed {
                    Ok(()) if *shutdown.borrow_and_update() => return false,
                    Ok(()) => continue,
                    // sender gone, nobody can signal shutdown anymore
                    Err(_) => {
                        sleep.await;
                        return true;
                    }
                },
            }
        }
    }
}
