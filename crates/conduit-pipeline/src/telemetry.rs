//! Pipeline metrics registration and per-stage counters.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use conduit_types::Result;
use serde::Serialize;

/// Metrics sink for a pipeline.
pub trait Telemetry: Send + Sync {
    /// Register pipeline-level metrics. Idempotent; failure is non-fatal to callers.
    fn register(&self) -> Result<()>;

    /// Account for one stage batch.
    fn record_stage(&self, instance_name: &str, records: usize, error_records: usize);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounters {
    pub batches: u64,
    pub records: u64,
    pub error_records: u64,
}

/// In-process metrics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    registered: OnceLock<chrono::DateTime<chrono::Utc>>,
    stages: Mutex<BTreeMap<String, StageCounters>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.get().is_some()
    }

    pub fn registered_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.registered.get().copied()
    }

    pub fn counters(&self, instance_name: &str) -> StageCounters {
        self.stages
            .lock()
            .map(|s| s.get(instance_name).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Snapshot of every stage's counters, ordered by instance name.
    pub fn snapshot(&self) -> BTreeMap<String, StageCounters> {
        self.stages.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Telemetry for MetricsRegistry {
    fn register(&self) -> Result<()> {
        self.registered.get_or_init(|| {
            tracing::debug!("Registered pipeline metrics");
            chrono::Utc::now()
        });
        Ok(())
    }

    fn record_stage(&self, instance_name: &str, records: usize, error_records: usize) {
        match self.stages.lock() {
            Ok(mut stages) => {
                let counters = stages.entry(instance_name.to_string()).or_default();
                counters.batches += 1;
                counters.records += records as u64;
                counters.error_records += error_records as u64;
            }
            Err(_) => tracing::warn!(stage = instance_name, "Metrics registry poisoned; dropping sample"),
        }
    }
}
