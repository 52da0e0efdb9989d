//! Metric kinds, values, and the per-kind merge rule.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Type of metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            other => Err(Error::invalid_kind(other)),
        }
    }
}

/// A stored metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Counter(i64),
    Gauge(f64),
}

impl MetricValue {
    #[must_use]
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Parse a raw payload: an integer delta for counters, a float for gauges.
    ///
    /// Non-finite gauges are rejected; they have no JSON representation.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self> {
        match kind {
            MetricKind::Counter => raw
                .parse::<i64>()
                .map(Self::Counter)
                .map_err(|_| Error::invalid_value(kind, raw)),
            MetricKind::Gauge => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Self::Gauge(v)),
                _ => Err(Error::invalid_value(kind, raw)),
            },
        }
    }

    /// Apply `incoming` on top of `existing`.
    ///
    /// Counters add the incoming delta (an absent counter starts at 0),
    /// gauges take the incoming value.
    pub fn merge(existing: Option<MetricValue>, incoming: MetricValue) -> Result<MetricValue> {
        match (existing, incoming) {
            (None, incoming) => Ok(incoming),
            (Some(Self::Counter(current)), Self::Counter(delta)) => current
                .checked_add(delta)
                .map(Self::Counter)
                .ok_or_else(|| {
                    Error::invalid_value(MetricKind::Counter, format!("{current} + {delta} overflows"))
                }),
            (Some(Self::Gauge(_)), Self::Gauge(value)) => Ok(Self::Gauge(value)),
            (Some(existing), incoming) => Err(Error::invalid_kind(format!(
                "cannot merge {} into {}",
                incoming.kind(),
                existing.kind()
            ))),
        }
    }
}

impl fmt::Display for MetricValue {
    /// `f64`'s `Display` is the shortest string that parses back to the same bits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter(v) => write!(f, "{v}"),
            Self::Gauge(v) => write!(f, "{v}"),
        }
    }
}

/// One validated update headed for a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricUpdate {
    pub name: String,
    pub value: MetricValue,
}

impl MetricUpdate {
    pub fn new(name: impl Into<String>, value: MetricValue) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidMetricName);
        }
        Ok(Self { name, value })
    }

    /// Validate the three raw fields of a single-update request.
    pub fn parse(name: &str, kind: &str, raw: &str) -> Result<Self> {
        let kind: MetricKind = kind.parse()?;
        let value = MetricValue::parse(kind, raw)?;
        Self::new(name, value)
    }

    #[must_use]
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// JSON wire form shared by the HTTP API, the agent, and the snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metric {
    #[must_use]
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self::from_value(id, MetricValue::Counter(delta))
    }

    #[must_use]
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self::from_value(id, MetricValue::Gauge(value))
    }

    #[must_use]
    pub fn from_value(id: impl Into<String>, value: MetricValue) -> Self {
        let (delta, gauge) = match value {
            MetricValue::Counter(d) => (Some(d), None),
            MetricValue::Gauge(v) => (None, Some(v)),
        };
        Self {
            id: id.into(),
            kind: value.kind(),
            delta,
            value: gauge,
        }
    }

    /// Convert into a typed update.
    ///
    /// The payload field must match the type: a counter needs `delta`,
    /// a gauge needs a finite `value`.
    pub fn into_update(self) -> Result<MetricUpdate> {
        let value = match (self.kind, self.delta, self.value) {
            (MetricKind::Counter, Some(delta), _) => MetricValue::Counter(delta),
            (MetricKind::Gauge, _, Some(v)) if v.is_finite() => MetricValue::Gauge(v),
            (MetricKind::Gauge, _, Some(v)) => {
                return Err(Error::invalid_value(MetricKind::Gauge, v.to_string()));
            },
            (MetricKind::Counter, None, _) => {
                return Err(Error::invalid_kind("counter without delta"));
            },
            (MetricKind::Gauge, _, None) => {
                return Err(Error::invalid_kind("gauge without value"));
            },
        };
        MetricUpdate::new(self.id, value)
    }
}

impl From<MetricUpdate> for Metric {
    fn from(update: MetricUpdate) -> Self {
        Self::from_value(update.name, update.value)
    }
}

/// Point-in-time image of every stored metric, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, i64>,
    pub gauges: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.gauges.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str, kind: MetricKind) -> Option<MetricValue> {
        match kind {
            MetricKind::Counter => self.counters.get(name).copied().map(MetricValue::Counter),
            MetricKind::Gauge => self.gauges.get(name).copied().map(MetricValue::Gauge),
        }
    }

    /// Overwrite the stored value for `name`.
    pub fn set(&mut self, name: impl Into<String>, value: MetricValue) {
        match value {
            MetricValue::Counter(v) => {
                self.counters.insert(name.into(), v);
            },
            MetricValue::Gauge(v) => {
                self.gauges.insert(name.into(), v);
            },
        }
    }

    /// Merge one update into the snapshot and return the new stored value.
    pub fn apply(&mut self, update: &MetricUpdate) -> Result<MetricValue> {
        let current = self.get(&update.name, update.kind());
        let merged = MetricValue::merge(current, update.value)?;
        self.set(update.name.clone(), merged);
        Ok(merged)
    }

    /// Counters first, then gauges, each sorted by name.
    #[must_use]
    pub fn to_metrics(&self) -> Vec<Metric> {
        let counters = self
            .counters
            .iter()
            .map(|(name, v)| Metric::counter(name.clone(), *v));
        let gauges = self
            .gauges
            .iter()
            .map(|(name, v)| Metric::gauge(name.clone(), *v));
        counters.chain(gauges).collect()
    }

    /// Rebuild a snapshot from stored records. Later duplicates overwrite earlier ones.
    pub fn from_metrics(metrics: Vec<Metric>) -> Result<Self> {
        let mut snapshot = Self::default();
        for metric in metrics {
            let update = metric.into_update()?;
            snapshot.set(update.name, update.value);
        }
        Ok(snapshot)
    }
}
