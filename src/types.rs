use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Timestamp type (milliseconds since the Unix epoch).
pub type Timestamp = u64;

/// Resolved host identifier.
pub type HostId = u32;

/// Resolved metric-category identifier.
pub type CategoryId = u32;

/// Resolved metric-kind identifier (unique within a host/category).
pub type SampleKindId = u32;

/// Identifier of a persisted or in-flight time range.
pub type TimeRangeId = u64;

/// Key of a host/category accumulator.
pub type AccumulatorKey = (HostId, CategoryId);

/// A single sample value: integer, floating point, or explicitly missing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SampleValue {
    Int(i64),
    Float(f64),
    Null,
}

impl SampleValue {
    /// Returns true when `other` would decode to the exact same value.
    ///
    /// Floats compare by bit pattern: NaN repeats itself and `-0.0` differs from `0.0`.
    pub fn is_identical(&self, other: &SampleValue) -> bool {
        match (self, other) {
            (SampleValue::Int(a), SampleValue::Int(b)) => a == b,
            (SampleValue::Float(a), SampleValue::Float(b)) => a.to_bits() == b.to_bits(),
            (SampleValue::Null, SampleValue::Null) => true,
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SampleValue::Null)
    }
}

impl PartialEq for SampleValue {
    fn eq(&self, other: &Self) -> bool {
        self.is_identical(other)
    }
}

impl From<i64> for SampleValue {
    fn from(v: i64) -> Self {
        SampleValue::Int(v)
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Float(v)
    }
}

/// A single metric kind's value at one timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub sample_kind_id: SampleKindId,
    pub value: SampleValue,
}

/// Inbound event before identifier resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub host: String,
    pub category: String,
    pub timestamp: Timestamp,
    pub samples: BTreeMap<String, SampleValue>,
}

impl Event {
    pub fn new(host: impl Into<String>, category: impl Into<String>, timestamp: Timestamp) -> Self {
        Event {
            host: host.into(),
            category: category.into(),
            timestamp,
            samples: BTreeMap::new(),
        }
    }

    /// Builder-style helper for tests and load generators.
    pub fn with_sample(mut self, name: impl Into<String>, value: impl Into<SampleValue>) -> Self {
        self.samples.insert(name.into(), value.into());
        self
    }
}

/// All samples of one host/category at one timestamp, after identifier resolution.
///
/// This is also the backing-log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSampleBatch {
    pub host_id: HostId,
    pub category_id: CategoryId,
    pub timestamp: Timestamp,
    pub samples: BTreeMap<SampleKindId, SampleValue>,
}

impl HostSampleBatch {
    pub fn key(&self) -> AccumulatorKey {
        (self.host_id, self.category_id)
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.samples.iter().map(|(kind, value)| Sample {
            sample_kind_id: *kind,
            value: *value,
        })
    }
}

/// Encoded samples of one metric kind over one time range. Immutable once extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedChunk {
    pub host_id: HostId,
    pub sample_kind_id: SampleKindId,
    pub time_range_id: TimeRangeId,
    pub encoded_samples: Vec<u8>,
    pub sample_count: u32,
}

/// Shared timestamp sequence of the chunks cut together for one host/category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub id: TimeRangeId,
    pub host_id: HostId,
    pub category_id: CategoryId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub encoded_times: Vec<u8>,
    pub sample_count: u32,
    pub aggregation_level: u8,
    pub valid: bool,
}

impl TimeRange {
    /// Inclusive overlap test against optional bounds.
    pub fn overlaps(&self, start: Option<Timestamp>, end: Option<Timestamp>) -> bool {
        start.map_or(true, |s| self.end_time >= s) && end.map_or(true, |e| self.start_time <= e)
    }
}

/// A time range together with one chunk per metric kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSet {
    pub time_range: TimeRange,
    pub chunks: Vec<EncodedChunk>,
}

impl ChunkSet {
    pub fn chunk_for(&self, kind: SampleKindId) -> Option<&EncodedChunk> {
        self.chunks.iter().find(|c| c.sample_kind_id == kind)
    }
}

/// Chunks cut at the same moment from one accumulator, tagged with a per-accumulator sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    pub sequence_id: u64,
    pub chunk_set: ChunkSet,
}

impl PendingBatch {
    pub fn chunk_count(&self) -> usize {
        self.chunk_set.chunks.len()
    }

    pub fn key(&self) -> AccumulatorKey {
        (
            self.chunk_set.time_range.host_id,
            self.chunk_set.time_range.category_id,
        )
    }
}
