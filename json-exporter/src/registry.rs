//! Process-wide metric registry.
//!
//! One [`Registry`] is shared by every scraper and target metric set. Each
//! owner registers the series it needs, holds the returned handle, and is the
//! only party that unregisters it again. The HTTP layer renders the whole
//! registry in the Prometheus text exposition format.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised when a series cannot be registered.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("metric {name:?} is already registered")]
    Duplicate { name: String },

    #[error("invalid metric name {name:?}")]
    InvalidName { name: String },
}

/// The namespace/subsystem/name triple behind a metric identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricName {
    pub namespace: String,
    pub subsystem: String,
    pub name: String,
}

impl MetricName {
    /// Split an identifier on its first two `_` separators. Missing segments
    /// are left empty.
    pub fn parse(id: &str) -> Self {
        let mut parts = id.splitn(3, '_');
        Self {
            namespace: parts.next().unwrap_or_default().to_string(),
            subsystem: parts.next().unwrap_or_default().to_string(),
            name: parts.next().unwrap_or_default().to_string(),
        }
    }

    /// Rebuild the full metric name, skipping empty segments.
    pub fn full(&self) -> String {
        let mut out = String::new();
        for part in [&self.namespace, &self.subsystem, &self.name] {
            if part.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('_');
            }
            out.push_str(part);
        }
        out
    }
}

/// A gauge handle. Cloneable; all clones point at the same series.
#[derive(Clone, Debug)]
pub struct Gauge {
    value: Arc<AtomicU64>,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: Arc::new(AtomicU64::new(f64::to_bits(0.0))),
        }
    }

    pub fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// A monotonically increasing counter handle.
#[derive(Clone)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A unique identifier for one time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    /// Sorted label key-value pairs.
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn plain(name: &str) -> Self {
        Self {
            name: name.to_string(),
            labels: Vec::new(),
        }
    }

    fn with_labels(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            labels,
        }
    }
}

enum Handle {
    Gauge(Gauge),
    Counter(Counter),
}

impl Handle {
    fn kind(&self) -> &'static str {
        match self {
            Handle::Gauge(_) => "gauge",
            Handle::Counter(_) => "counter",
        }
    }
}

struct Series {
    help: String,
    handle: Handle,
}

/// Thread-safe series table shared by the whole process.
pub struct Registry {
    series: RwLock<HashMap<SeriesKey, Series>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Register a label-less gauge under the rebuilt full name.
    ///
    /// Fails when the name is not a valid Prometheus metric name or is
    /// already taken, whichever registry instance took it.
    pub fn register_gauge(&self, name: &MetricName, help: &str) -> Result<Gauge, RegistryError> {
        let full = name.full();
        if !is_valid_metric_name(&full) {
            return Err(RegistryError::InvalidName { name: full });
        }

        let key = SeriesKey::plain(&full);
        let mut series = self.series.write();
        if series.contains_key(&key) {
            return Err(RegistryError::Duplicate { name: full });
        }

        let gauge = Gauge::new();
        debug!(metric = %full, "registered gauge");
        series.insert(
            key,
            Series {
                help: help.to_string(),
                handle: Handle::Gauge(gauge.clone()),
            },
        );
        Ok(gauge)
    }

    /// Remove the label-less series `name`. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.series.write().remove(&SeriesKey::plain(name)).is_some()
    }

    /// Get or create a labelled counter. Used for self-instrumentation
    /// series, which are never unregistered.
    pub fn counter(&self, name: &str, help: &str, labels: &[(&str, &str)]) -> Counter {
        let key = SeriesKey::with_labels(name, labels);
        let mut series = self.series.write();
        match series.entry(key) {
            Entry::Occupied(entry) => match &entry.get().handle {
                Handle::Counter(counter) => counter.clone(),
                Handle::Gauge(_) => {
                    warn!(metric = %name, "series already registered as a gauge");
                    Counter::new()
                }
            },
            Entry::Vacant(slot) => {
                let counter = Counter::new();
                slot.insert(Series {
                    help: help.to_string(),
                    handle: Handle::Counter(counter.clone()),
                });
                counter
            }
        }
    }

    /// Get or create a labelled gauge for self-instrumentation.
    pub fn gauge(&self, name: &str, help: &str, labels: &[(&str, &str)]) -> Gauge {
        let key = SeriesKey::with_labels(name, labels);
        let mut series = self.series.write();
        match series.entry(key) {
            Entry::Occupied(entry) => match &entry.get().handle {
                Handle::Gauge(gauge) => gauge.clone(),
                Handle::Counter(_) => {
                    warn!(metric = %name, "series already registered as a counter");
                    Gauge::new()
                }
            },
            Entry::Vacant(slot) => {
                let gauge = Gauge::new();
                slot.insert(Series {
                    help: help.to_string(),
                    handle: Handle::Gauge(gauge.clone()),
                });
                gauge
            }
        }
    }

    /// The current value of the label-less gauge `name`, if registered.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        match &self.series.read().get(&SeriesKey::plain(name))?.handle {
            Handle::Gauge(gauge) => Some(gauge.get()),
            Handle::Counter(_) => None,
        }
    }

    /// The current value of the labelled counter, if registered.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        let key = SeriesKey::with_labels(name, labels);
        match &self.series.read().get(&key)?.handle {
            Handle::Counter(counter) => Some(counter.get()),
            Handle::Gauge(_) => None,
        }
    }

    /// Number of registered series.
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Render every series in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let series = self.series.read();

        let mut keys: Vec<&SeriesKey> = series.keys().collect();
        keys.sort();

        let mut out = String::with_capacity(series.len() * 100);
        let mut last_name: Option<&str> = None;
        for key in keys {
            let entry = &series[key];
            if last_name != Some(key.name.as_str()) {
                if !entry.help.is_empty() {
                    let _ = writeln!(out, "# HELP {} {}", key.name, escape_help(&entry.help));
                }
                let _ = writeln!(out, "# TYPE {} {}", key.name, entry.handle.kind());
                last_name = Some(key.name.as_str());
            }

            let value = match &entry.handle {
                Handle::Gauge(gauge) => format_value(gauge.get()),
                Handle::Counter(counter) => counter.get().to_string(),
            };
            let _ = writeln!(out, "{}{} {}", key.name, format_labels(&key.labels), value);
        }
        out
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape help text for `# HELP` lines.
fn escape_help(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for the exposition format.
fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_parse_three_segments() {
        let name = MetricName::parse("ns_sub_name");
        assert_eq!(name.namespace, "ns");
        assert_eq!(name.subsystem, "sub");
        assert_eq!(name.name, "name");
        assert_eq!(name.full(), "ns_sub_name");
    }

    #[test]
    fn test_metric_name_parse_missing_segments() {
        let name = MetricName::parse("solo");
        assert_eq!(name.namespace, "solo");
        assert_eq!(name.subsystem, "");
        assert_eq!(name.name, "");
        assert_eq!(name.full(), "solo");

        let name = MetricName::parse("ns_sub");
        assert_eq!(name.subsystem, "sub");
        assert_eq!(name.full(), "ns_sub");
    }

    #[test]
    fn test_metric_name_extra_separators_stay_in_name() {
        let name = MetricName::parse("a_b_c_d");
        assert_eq!(name.name, "c_d");
        assert_eq!(name.full(), "a_b_c_d");
    }

    #[test]
    fn test_register_and_render_gauge() {
        let registry = Registry::new();
        let gauge = registry
            .register_gauge(&MetricName::parse("ns_sub_name"), "a test value")
            .unwrap();
        gauge.set(5.0);

        let output = registry.render();
        assert!(output.contains("# HELP ns_sub_name a test value"));
        assert!(output.contains("# TYPE ns_sub_name gauge"));
        assert!(output.contains("ns_sub_name 5\n"));
    }

    #[test]
    fn test_register_duplicate_name_fails() {
        let registry = Registry::new();
        registry
            .register_gauge(&MetricName::parse("ns_sub_name"), "first")
            .unwrap();
        let err = registry
            .register_gauge(&MetricName::parse("ns_sub_name"), "second")
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
    }

    #[test]
    fn test_register_invalid_name_fails() {
        let registry = Registry::new();
        let err = registry
            .register_gauge(&MetricName::parse("9starts_with_digit"), "")
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName { .. }));

        let err = registry
            .register_gauge(&MetricName::parse("has_a_sp ace"), "")
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName { .. }));
    }

    #[test]
    fn test_unregister_removes_series() {
        let registry = Registry::new();
        registry
            .register_gauge(&MetricName::parse("ns_sub_name"), "")
            .unwrap();
        assert_eq!(registry.series_count(), 1);

        assert!(registry.unregister("ns_sub_name"));
        assert_eq!(registry.series_count(), 0);
        assert!(!registry.render().contains("ns_sub_name"));

        // Second removal reports the absence.
        assert!(!registry.unregister("ns_sub_name"));
    }

    #[test]
    fn test_labelled_counter_get_or_create() {
        let registry = Registry::new();
        let first = registry.counter("app_fetches_total", "fetches", &[("url", "http://x/")]);
        first.inc();
        first.inc();

        // Same name and labels: same underlying series.
        let again = registry.counter("app_fetches_total", "fetches", &[("url", "http://x/")]);
        again.inc();
        assert_eq!(
            registry.counter_value("app_fetches_total", &[("url", "http://x/")]),
            Some(3)
        );

        let output = registry.render();
        assert!(output.contains("# TYPE app_fetches_total counter"));
        assert!(output.contains("app_fetches_total{url=\"http://x/\"} 3"));
    }

    #[test]
    fn test_render_sorts_and_groups_by_name() {
        let registry = Registry::new();
        registry.counter("b_total", "b", &[("url", "2")]).inc();
        registry.counter("b_total", "b", &[("url", "1")]).inc();
        registry
            .register_gauge(&MetricName::parse("a_gauge"), "a")
            .unwrap();

        let output = registry.render();
        let a_pos = output.find("# TYPE a_gauge gauge").unwrap();
        let b_pos = output.find("# TYPE b_total counter").unwrap();
        assert!(a_pos < b_pos);
        // One TYPE header covers both labelled series.
        assert_eq!(output.matches("# TYPE b_total").count(), 1);
        let url1 = output.find("b_total{url=\"1\"} 1").unwrap();
        let url2 = output.find("b_total{url=\"2\"} 1").unwrap();
        assert!(url1 < url2);
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("simple"), "simple");
        assert_eq!(escape_label_value("with\"quote"), "with\\\"quote");
        assert_eq!(escape_label_value("with\\backslash"), "with\\\\backslash");
        assert_eq!(escape_label_value("with\nnewline"), "with\\nnewline");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(3.14), "3.14");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
    }
}
