//! Per-target metric set: a path-to-gauge table populated from JSON payloads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::registry::{Gauge, MetricName, Registry, RegistryError};

struct Entry {
    metric: String,
    gauge: Gauge,
}

/// The gauges extracted from one target's payloads.
///
/// Registrations go through the shared [`Registry`]; this set owns the
/// handles it created and is the only party that unregisters them.
pub struct TargetMetrics {
    registry: Arc<Registry>,
    gauges: Mutex<HashMap<String, Entry>>,
}

impl TargetMetrics {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Register a gauge for the value at `path`.
    ///
    /// A path that is already registered is left untouched and reported as
    /// success; reload races may legitimately attempt re-registration. A name
    /// the shared registry rejects is the one error propagated to the caller.
    pub fn add_metric(&self, path: &str, metric_id: &str, help: &str) -> Result<(), RegistryError> {
        let mut gauges = self.gauges.lock();
        if gauges.contains_key(path) {
            warn!(path, "duplicate path registration ignored");
            return Ok(());
        }

        let name = MetricName::parse(metric_id);
        let help = format!("{help} (from {path})");
        let gauge = self.registry.register_gauge(&name, &help)?;

        debug!(path, metric = %name.full(), "new gauge");
        gauges.insert(
            path.to_string(),
            Entry {
                metric: name.full(),
                gauge,
            },
        );
        Ok(())
    }

    /// Extract every registered path from `json` in one batched pass.
    ///
    /// Numeric values set the corresponding gauge; a path that fails to
    /// resolve or holds a non-numeric value leaves the prior gauge value
    /// unchanged.
    pub fn export(&self, json: &str) {
        let gauges = self.gauges.lock();
        for (path, entry) in gauges.iter() {
            let value = gjson::get(json, path);
            if !value.exists() || value.kind() != gjson::Kind::Number {
                warn!(path = %path, metric = %entry.metric, "path missing or non-numeric in payload");
                continue;
            }
            entry.gauge.set(value.f64());
            trace!(path = %path, value = value.f64(), "gauge updated");
        }
    }

    /// Unregister every managed gauge. Best-effort: a series that is already
    /// gone is logged and skipped.
    pub fn close(&self) {
        let mut gauges = self.gauges.lock();
        for (path, entry) in gauges.drain() {
            if !self.registry.unregister(&entry.metric) {
                warn!(path = %path, metric = %entry.metric, "gauge was not registered at teardown");
            }
        }
    }
}
