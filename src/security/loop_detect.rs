//! Reconnect loop detection.
//!
//! Records connect attempts per (os, device, app) and reports when a device
//! keeps reconnecting inside a short window. Purely observational: nothing
//! here ever refuses a connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::LoopDetectionConfig;
use crate::observability::metrics;
use crate::protocol::ConnectMessage;

/// Observations between sweeps of keys whose attempts have all aged out.
const SWEEP_EVERY: u64 = 256;

/// Reported when the attempt count inside the window reaches the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDetected {
    pub key: String,
    pub attempts: usize,
    pub window: Duration,
}

impl std::fmt::Display for LoopDetected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection loop detected with {}. Connected {} times within {}s.",
            self.key,
            self.attempts,
            self.window.as_secs()
        )
    }
}

/// Sliding-window attempt log keyed by `os-device-app`.
#[derive(Debug)]
pub struct AttemptTracker {
    attempts: DashMap<String, Vec<Instant>>,
    window: Duration,
    threshold: usize,
    observations: AtomicU64,
}

impl AttemptTracker {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            attempts: DashMap::new(),
            window,
            threshold,
            observations: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &LoopDetectionConfig) -> Self {
        Self::new(Duration::from_secs(config.window_secs), config.threshold)
    }

    /// Record an attempt happening now.
    pub fn log_connection_attempt(&self, connect: &ConnectMessage) -> Option<LoopDetected> {
        self.log_connection_attempt_at(connect, Instant::now())
    }

    /// Record an attempt at `now`.
    pub fn log_connection_attempt_at(&self, connect: &ConnectMessage, now: Instant) -> Option<LoopDetected> {
        let key = connect.attempt_key();

        let retained = {
            let mut entry = self.attempts.entry(key.clone()).or_default();
            entry.push(now);
            entry.retain(|t| now.saturating_duration_since(*t) <= self.window);
            entry.len()
        };

        if self.observations.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.prune_at(now);
        }

        if retained < self.threshold {
            return None;
        }

        let detected = LoopDetected {
            key,
            attempts: self.threshold,
            window: self.window,
        };
        tracing::warn!(
            attempt_key = %detected.key,
            attempts = retained,
            window_secs = self.window.as_secs(),
            "{}",
            detected
        );
        metrics::record_loop_detected();
        Some(detected)
    }

    /// Forget keys with no attempt inside the window as of `now`.
    pub fn prune_at(&self, now: Instant) {
        self.attempts.retain(|_, times| {
            times.retain(|t| now.saturating_duration_since(*t) <= self.window);
            !times.is_empty()
        });
    }

    /// Number of keys currently holding attempts.
    pub fn tracked_keys(&self) -> usize {
        self.attempts.len()
    }

    /// Attempts currently retained for `connect`'s key.
    pub fn attempts_in_window(&self, connect: &ConnectMessage) -> usize {
        self.attempts
            .get(&connect.attempt_key())
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}
