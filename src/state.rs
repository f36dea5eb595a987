//! # Application State
//!
//! State shared by every HTTP handler and every playback session.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>>
//! - **Arc**: each worker thread and each WebSocket actor holds a clone of
//!   `AppState`; the data lives as long as the last clone
//! - **RwLock**: many readers (health checks, new sessions reading config)
//!   or one writer (config updates, counter bumps)
//!
//! ### Lock poisoning
//! A panic while a lock is held "poisons" it. Counters and config stay
//! usable after such a panic, so the guards are recovered with
//! `PoisonError::into_inner` instead of propagating the panic.

use crate::config::AppConfig;
use crate::playback::engine::EngineStats;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Runtime-updatable configuration; sessions copy it when they start
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters across all HTTP requests and playback sessions.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Playback sessions currently connected
    pub active_sessions: usize,
    pub sessions_started: u64,
    /// Upgrades refused because the session limit was reached
    pub sessions_rejected: u64,

    pub playback: PlaybackTotals,

    /// Keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Sums of every session's engine counters.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PlaybackTotals {
    pub fragments_received: u64,
    pub fragments_ignored: u64,
    pub units_scheduled: u64,
    pub decode_errors: u64,
    pub device_errors: u64,
    pub sequence_anomalies: u64,
    pub context_switches: u64,
    pub contexts_drained: u64,
    pub duplicate_completions: u64,
    pub interrupts: u64,
    pub underruns: u64,
}

impl PlaybackTotals {
    fn add(&mut self, delta: &EngineStats) {
        self.fragments_received += delta.fragments_received;
        self.fragments_ignored += delta.fragments_ignored;
        self.units_scheduled += delta.units_scheduled;
        self.decode_errors += delta.decode_errors;
        self.device_errors += delta.device_errors;
        self.sequence_anomalies += delta.sequence_anomalies;
        self.context_switches += delta.context_switches;
        self.contexts_drained += delta.contexts_drained;
        self.duplicate_completions += delta.duplicate_completions;
        self.interrupts += delta.interrupts;
        self.underruns += delta.underruns;
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current configuration. Cloning releases the lock right away.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a session slot. Check and increment happen under one write
    /// lock, so concurrent upgrades cannot overshoot `max_sessions`.
    pub fn try_acquire_session(&self, max_sessions: usize) -> bool {
        let mut metrics = self.metrics_write();
        if metrics.active_sessions >= max_sessions {
            metrics.sessions_rejected += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.sessions_started += 1;
        true
    }

    pub fn release_session(&self) {
        let mut metrics = self.metrics_write();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    /// Fold one session's engine counters (a delta) into the totals.
    pub fn record_playback(&self, delta: &EngineStats) {
        if *delta == EngineStats::default() {
            return;
        }
        self.metrics_write().playback.add(delta);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
