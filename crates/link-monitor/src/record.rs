//! The canonical measurement record and the helpers shared by every stage
//! of the pipeline.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Column layout of the persisted store, in order.
pub const STORE_COLUMNS: [&str; 7] = [
    "timestamp",
    "throughput_mbps",
    "retransmits",
    "lost_percent",
    "jitter_ms",
    "latency_ms",
    "predicted_degraded",
];

/// Zone-less timestamp formats written by older tooling, interpreted as UTC.
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// One measurement cycle.
///
/// Field order matches [`STORE_COLUMNS`]. Optional fields are `None` when the
/// underlying probe returned nothing; a zero is a real measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
    pub throughput_mbps: f64,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub retransmits: Option<u64>,
    pub lost_percent: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub latency_ms: Option<f64>,
    #[serde(
        default,
        serialize_with = "serialize_flag",
        deserialize_with = "deserialize_flag"
    )]
    pub predicted_degraded: Option<bool>,
}

impl MetricRecord {
    pub fn new(timestamp: DateTime<Utc>, throughput_mbps: f64) -> Self {
        Self {
            timestamp,
            throughput_mbps,
            retransmits: None,
            lost_percent: None,
            jitter_ms: None,
            latency_ms: None,
            predicted_degraded: None,
        }
    }
}

/// The metrics subject to anomaly detection and classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ThroughputMbps,
    LatencyMs,
    JitterMs,
    LostPercent,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::ThroughputMbps,
        Metric::LatencyMs,
        Metric::JitterMs,
        Metric::LostPercent,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::ThroughputMbps => "throughput_mbps",
            Metric::LatencyMs => "latency_ms",
            Metric::JitterMs => "jitter_ms",
            Metric::LostPercent => "lost_percent",
        }
    }

    pub fn value(&self, record: &MetricRecord) -> Option<f64> {
        match self {
            Metric::ThroughputMbps => Some(record.throughput_mbps),
            Metric::LatencyMs => record.latency_ms,
            Metric::JitterMs => record.jitter_ms,
            Metric::LostPercent => record.lost_percent,
        }
    }

    /// Values of this metric across `records`, positions preserved.
    pub fn series(&self, records: &[MetricRecord]) -> Vec<Option<f64>> {
        records.iter().map(|r| self.value(r)).collect()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classifier input: `[throughput_mbps, latency_ms, jitter_ms, lost_percent]`.
///
/// Absent values are substituted with [`FeatureVector::MISSING`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; 4]);

impl FeatureVector {
    pub const LEN: usize = 4;
    pub const MISSING: f64 = 0.0;

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl From<&MetricRecord> for FeatureVector {
    fn from(record: &MetricRecord) -> Self {
        FeatureVector([
            record.throughput_mbps,
            record.latency_ms.unwrap_or(Self::MISSING),
            record.jitter_ms.unwrap_or(Self::MISSING),
            record.lost_percent.unwrap_or(Self::MISSING),
        ])
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NAIVE_TIMESTAMP_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
                .map(|naive| naive.and_utc())
        })
}

fn serialize_timestamp<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_timestamp(ts))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

/// Counts may have been written as floats (`12.0`) by older tooling.
fn deserialize_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Ok(count) = raw.parse::<u64>() {
        return Ok(Some(count));
    }
    match raw.parse::<f64>() {
        Ok(value) if value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 => {
            Ok(Some(value as u64))
        }
        _ => Err(serde::de::Error::custom(format!("invalid count: {raw}"))),
    }
}

fn serialize_flag<S>(flag: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    flag.map(u8::from).serialize(serializer)
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some("1") | Some("1.0") | Some("true") => Ok(Some(true)),
        Some("0") | Some("0.0") | Some("false") => Ok(Some(false)),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid degraded flag: {other}"
        ))),
    }
}
