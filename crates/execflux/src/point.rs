//! Point model: one timestamped, tagged measurement set.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use thiserror::Error;

/// Tag key injected on every point.
pub const HOST_TAG: &str = "host";
/// Tag key distinguishing sampler points from the summary point.
pub const ETYPE_TAG: &str = "etype";

const RESERVED_TAGS: [&str; 2] = [HOST_TAG, ETYPE_TAG];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PointError {
    #[error("measurement must not be empty")]
    EmptyMeasurement,

    #[error("point `{0}` has no values")]
    NoValues(String),

    #[error("duplicate tag key `{0}`")]
    DuplicateTag(String),

    #[error("tag `{0}` must have a non-empty key and value")]
    EmptyTag(String),

    #[error("tag key `{0}` is reserved")]
    ReservedTag(String),

    #[error("malformed tag `{0}`, expected key=value")]
    MalformedTag(String),

    #[error("value `{0}` is not a finite number")]
    NonFinite(String),

    #[error("`{0}` contains a line break")]
    LineBreak(String),
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

fn check_line_break(name: &str) -> Result<(), PointError> {
    if name.contains(['\n', '\r']) {
        return Err(PointError::LineBreak(name.to_string()));
    }
    Ok(())
}

/// Ordered tag list with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(Vec<(String, String)>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses static tags given as `foo=bar,fizz=buzz`.
    ///
    /// Empty segments (including stray leading or trailing commas) are skipped.
    /// The reserved keys `host` and `etype` are rejected since they are injected
    /// by the tool itself.
    pub fn parse(raw: &str) -> Result<Self, PointError> {
        let mut tags = Self::new();
        for segment in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| PointError::MalformedTag(segment.to_string()))?;
            if RESERVED_TAGS.contains(&key) {
                return Err(PointError::ReservedTag(key.to_string()));
            }
            tags.insert(key, value)?;
        }
        Ok(tags)
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), PointError> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || value.is_empty() {
            return Err(PointError::EmptyTag(format!("{key}={value}")));
        }
        check_line_break(&key)?;
        check_line_break(&value)?;
        if self.get(&key).is_some() {
            return Err(PointError::DuplicateTag(key));
        }
        self.0.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Appends every tag of `other`, failing on the first duplicate key.
    pub fn extend(&mut self, other: &TagSet) -> Result<(), PointError> {
        for (key, value) in other.iter() {
            self.insert(key, value)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// A single timestamped measurement set. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: TagSet,
    values: BTreeMap<String, f64>,
    timestamp: i64,
}

impl Point {
    /// Validates and builds a point. `timestamp` defaults to [`current_time`].
    pub fn new(
        measurement: impl Into<String>,
        tags: TagSet,
        values: BTreeMap<String, f64>,
        timestamp: Option<i64>,
    ) -> Result<Self, PointError> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(PointError::EmptyMeasurement);
        }
        check_line_break(&measurement)?;
        if values.is_empty() {
            return Err(PointError::NoValues(measurement));
        }
        for (name, value) in &values {
            check_line_break(name)?;
            if !value.is_finite() {
                return Err(PointError::NonFinite(name.clone()));
            }
        }

        Ok(Self {
            measurement,
            tags,
            values,
            timestamp: timestamp.unwrap_or_else(current_time),
        })
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Field values, ordered by field name. Never empty.
    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Kind of point, carried in the `etype` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Periodic resource sample.
    Metric,
    /// Final summary of the run.
    Event,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Metric => "metric",
            EventType::Event => "event",
        }
    }
}

/// Builds points sharing the same measurement, host and static tags.
///
/// Tag order is always `host`, then the static tags, then `etype`.
#[derive(Debug, Clone)]
pub struct PointFactory {
    measurement: String,
    base_tags: TagSet,
}

impl PointFactory {
    pub fn new(
        measurement: impl Into<String>,
        host: &str,
        static_tags: &TagSet,
    ) -> Result<Self, PointError> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(PointError::EmptyMeasurement);
        }
        check_line_break(&measurement)?;

        let mut base_tags = TagSet::new();
        base_tags.insert(HOST_TAG, host)?;
        base_tags.extend(static_tags)?;

        Ok(Self {
            measurement,
            base_tags,
        })
    }

    pub fn build(
        &self,
        etype: EventType,
        values: BTreeMap<String, f64>,
        timestamp: Option<i64>,
    ) -> Result<Point, PointError> {
        let mut tags = self.base_tags.clone();
        tags.insert(ETYPE_TAG, etype.as_str())?;
        Point::new(self.measurement.clone(), tags, values, timestamp)
    }

    /// Resource sample taken by the sampler.
    pub fn metric(
        &self,
        cpu_percent: f64,
        memory_bytes: u64,
        timestamp: i64,
    ) -> Result<Point, PointError> {
        let values = BTreeMap::from([
            ("cpu".to_string(), cpu_percent),
            ("mem".to_string(), memory_bytes as f64),
        ]);
        self.build(EventType::Metric, values, Some(timestamp))
    }

    /// Summary of the whole run.
    pub fn event(&self, duration_secs: f64, status: i32) -> Result<Point, PointError> {
        let values = BTreeMap::from([
            ("duration".to_string(), duration_secs),
            ("status".to_string(), f64::from(status)),
        ]);
        self.build(EventType::Event, values, None)
    }
}
