//! Configuration model for the exporter.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Semantic configuration error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(String);

/// Complete exporter configuration: the set of targets to poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// One polled endpoint and the metrics extracted from its payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Display name used in logs. Not required to be unique.
    #[serde(default)]
    pub name: String,

    /// Endpoint to poll.
    pub url: String,

    /// Poll cadence, e.g. "30s", "500ms", or a bare number of seconds.
    /// The scraper default applies when absent.
    #[serde(default, with = "duration_option", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,

    /// Extra request headers sent with every poll.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Retries per fetch. The scraper default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Values to extract from each payload.
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

/// One extracted value: where to find it and what to call it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Path expression into the JSON payload, e.g. "a.b".
    pub path: String,

    /// Metric identifier, conventionally `namespace_subsystem_name`.
    pub name: String,

    /// Help text for the exposition output.
    #[serde(default)]
    pub help: String,
}

impl ExporterConfig {
    /// Check the decoded configuration for values that could never work.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (i, target) in self.targets.iter().enumerate() {
            let label = if target.name.is_empty() {
                format!("target #{i}")
            } else {
                format!("target {:?}", target.name)
            };

            if target.url.is_empty() {
                return Err(ValidationError(format!("{label} has no url")));
            }
            if let Some(interval) = target.interval {
                if interval.is_zero() {
                    return Err(ValidationError(format!("{label} has a zero interval")));
                }
            }
            for spec in &target.metrics {
                if spec.path.is_empty() {
                    return Err(ValidationError(format!(
                        "{label} has a metric with an empty path"
                    )));
                }
                if spec.name.is_empty() {
                    return Err(ValidationError(format!(
                        "{label} metric {:?} has no name",
                        spec.path
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parse a duration literal: a bare number of seconds or a number with an
/// `ms`, `s`, `m`, or `h` suffix.
pub(crate) fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("invalid duration {input:?}"))?;
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration {input:?}"));
    }

    let duration = match unit {
        "ms" => Duration::from_secs_f64(value / 1000.0),
        "s" => Duration::from_secs_f64(value),
        "m" => Duration::from_secs_f64(value * 60.0),
        "h" => Duration::from_secs_f64(value * 3600.0),
        other => return Err(format!("unknown duration unit {other:?} in {input:?}")),
    };
    Ok(duration)
}

mod duration_option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::parse_duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Repr::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(Repr::Text(text)) => parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            None => serializer.serialize_none(),
            Some(d) if d.subsec_nanos() == 0 => serializer.serialize_str(&format!("{}s", d.as_secs())),
            Some(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
        }
    }
}
