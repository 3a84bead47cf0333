// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Health Tracking
//!
//! Each consumer owns one [`HealthTracker`]. The tracker counts processed and
//! failed messages and derives a three-level [`HealthStatus`] from the failure
//! rate and the liveness of the broker connection and channel.
//!
//! All reads and writes go through a single mutex; callers only ever receive
//! [`HealthSnapshot`] copies. There is no process-wide health state:
//! [`aggregate`] combines snapshots of several consumers into a fleet view.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Failure rate above which a consumer is unhealthy.
pub const UNHEALTHY_FAILURE_RATE: f64 = 0.20;
/// Failure rate above which a consumer is degraded.
pub const DEGRADED_FAILURE_RATE: f64 = 0.10;
/// How recent the last success must be for a consumer to count as actively
/// processing.
pub const ACTIVE_PROCESSING_WINDOW_SECS: i64 = 5 * 60;

/// Health level, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn from_failure_rate(rate: f64) -> Option<HealthStatus> {
        if rate > UNHEALTHY_FAILURE_RATE {
            Some(HealthStatus::Unhealthy)
        } else if rate > DEGRADED_FAILURE_RATE {
            Some(HealthStatus::Degraded)
        } else {
            None
        }
    }
}

/// Point-in-time copy of a consumer's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub connection_open: bool,
    pub channel_open: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub failure_rate: f64,
    pub is_actively_processing: bool,
    #[serde(rename = "lastSuccessTimestamp")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastCheckTimestamp")]
    pub last_check_at: DateTime<Utc>,
}

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    connection_open: bool,
    channel_open: bool,
    success_count: u64,
    failure_count: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_check_at: DateTime<Utc>,
}

impl HealthState {
    fn failure_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.failure_count as f64 / total as f64
        }
    }

    fn is_actively_processing(&self, now: DateTime<Utc>) -> bool {
        self.last_success_at
            .map(|at| now - at <= Duration::seconds(ACTIVE_PROCESSING_WINDOW_SECS))
            .unwrap_or(false)
    }
}

/// Processing counters and derived status of one consumer.
#[derive(Debug)]
pub struct HealthTracker {
    state: Mutex<HealthState>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        HealthTracker::new()
    }
}

impl HealthTracker {
    /// A fresh tracker is healthy with closed connection and channel until
    /// told otherwise.
    pub fn new() -> HealthTracker {
        HealthTracker {
            state: Mutex::new(HealthState {
                status: HealthStatus::Healthy,
                connection_open: false,
                channel_open: false,
                success_count: 0,
                failure_count: 0,
                last_success_at: None,
                last_check_at: Utc::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the broker liveness last observed by the consumer.
    pub fn set_connection_state(&self, connection_open: bool, channel_open: bool) {
        let mut state = self.lock();
        state.connection_open = connection_open;
        state.channel_open = channel_open;
    }

    pub fn record_success(&self) {
        self.record_success_at(Utc::now());
    }

    pub(crate) fn record_success_at(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.success_count += 1;
        state.last_success_at = Some(now);

        if state.connection_open && state.channel_open {
            state.status = HealthStatus::Healthy;
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.failure_count += 1;

        if let Some(status) = HealthStatus::from_failure_rate(state.failure_rate()) {
            state.status = status;
        }
    }

    /// Re-derives the status from the given broker liveness and the current
    /// failure rate.
    pub fn evaluate(&self, connection_open: bool, channel_open: bool) -> HealthStatus {
        self.evaluate_at(connection_open, channel_open, Utc::now())
    }

    pub(crate) fn evaluate_at(
        &self,
        connection_open: bool,
        channel_open: bool,
        now: DateTime<Utc>,
    ) -> HealthStatus {
        let mut state = self.lock();
        state.connection_open = connection_open;
        state.channel_open = channel_open;
        state.last_check_at = now;

        state.status = if !connection_open || !channel_open {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::from_failure_rate(state.failure_rate()).unwrap_or(HealthStatus::Healthy)
        };

        state.status
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub(crate) fn snapshot_at(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let state = self.lock();

        HealthSnapshot {
            status: state.status,
            connection_open: state.connection_open,
            channel_open: state.channel_open,
            success_count: state.success_count,
            failure_count: state.failure_count,
            failure_rate: state.failure_rate(),
            is_actively_processing: state.is_actively_processing(now),
            last_success_at: state.last_success_at,
            last_check_at: state.last_check_at,
        }
    }
}

/// Worst-of status over several consumers. An empty fleet is healthy.
pub fn aggregate<'a, I>(snapshots: I) -> HealthStatus
where
    I: IntoIterator<Item = &'a HealthSnapshot>,
{
    snapshots
        .into_iter()
        .map(|s| s.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}
