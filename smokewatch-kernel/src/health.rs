use crate::ports::StoreInfo;
use crate::subscription::ConnectionState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: ConnectionState,
    pub mqtt_reconnects: u64,
    pub messages_received: u64,
    pub parse_rejections: u64,
    pub readings_stored: u64,
    pub store_failures: u64,
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    pub store: StoreInfo,
}

#[derive(Debug, Default)]
struct Counters {
    reconnects: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    stored: AtomicU64,
    store_failures: AtomicU64,
    alerts_sent: AtomicU64,
    alerts_failed: AtomicU64,
}

/// Compteurs d'ingestion partagés entre dispatch, notifications et API
#[derive(Debug, Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn increment_reconnects(&self) {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.counters.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_sent(&self) {
        self.counters.alerts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_failed(&self) {
        self.counters.alerts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnects(&self) -> u64 {
        self.counters.reconnects.load(Ordering::Relaxed)
    }

    pub fn alerts_sent(&self) -> u64 {
        self.counters.alerts_sent.load(Ordering::Relaxed)
    }

    pub fn alerts_failed(&self) -> u64 {
        self.counters.alerts_failed.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, mqtt_status: ConnectionState, store: StoreInfo) -> IngestHealth {
        let c = &self.counters;
        IngestHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status,
            mqtt_reconnects: c.reconnects.load(Ordering::Relaxed),
            messages_received: c.received.load(Ordering::Relaxed),
            parse_rejections: c.rejected.load(Ordering::Relaxed),
            readings_stored: c.stored.load(Ordering::Relaxed),
            store_failures: c.store_failures.load(Ordering::Relaxed),
            alerts_sent: c.alerts_sent.load(Ordering::Relaxed),
            alerts_failed: c.alerts_failed.load(Ordering::Relaxed),
            store,
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}
