//! Per-metric-kind streaming encoder.

use crate::encoding::{encode_repeat, encode_sample, MAX_REPEAT_COUNT};
use crate::types::{EncodedChunk, HostId, SampleKindId, SampleValue, TimeRangeId};

/// Streams the samples of one (host, category, kind) into an encoded chunk.
///
/// The last value is encoded eagerly as a scalar or null unit. Identical follow-ups only bump a
/// pending repeat counter, which is written out when the value changes, when the counter hits
/// [`MAX_REPEAT_COUNT`], or on extraction.
#[derive(Debug, Clone)]
pub struct ChunkAccumulator {
    host_id: HostId,
    sample_kind_id: SampleKindId,
    encoded: Vec<u8>,
    sample_count: u32,
    last_value: Option<SampleValue>,
    pending_repeats: u32,
}

impl ChunkAccumulator {
    pub fn new(host_id: HostId, sample_kind_id: SampleKindId) -> Self {
        ChunkAccumulator {
            host_id,
            sample_kind_id,
            encoded: Vec::new(),
            sample_count: 0,
            last_value: None,
            pending_repeats: 0,
        }
    }

    pub fn sample_kind_id(&self) -> SampleKindId {
        self.sample_kind_id
    }

    /// Number of samples added since the last reset.
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Adds one sample, extending the open repeat run when it is identical to the last one.
    pub fn add_sample(&mut self, value: SampleValue) {
        match self.last_value {
            Some(last) if last.is_identical(&value) => self.extend_run(1),
            _ => {
                self.flush_repeats();
                encode_sample(&mut self.encoded, &value);
                self.last_value = Some(value);
            }
        }
        self.sample_count += 1;
    }

    /// Adds `count` null placeholders, keeping this kind index-aligned with its siblings.
    pub fn add_placeholders(&mut self, count: u32) {
        if count == 0 {
            return;
        }
        self.add_sample(SampleValue::Null);
        if count > 1 {
            self.extend_run(count - 1);
            self.sample_count += count - 1;
        }
    }

    fn extend_run(&mut self, mut count: u32) {
        while count > 0 {
            let room = MAX_REPEAT_COUNT - self.pending_repeats;
            let step = count.min(room);
            self.pending_repeats += step;
            count -= step;
            if self.pending_repeats == MAX_REPEAT_COUNT {
                self.flush_repeats();
            }
        }
    }

    fn flush_repeats(&mut self) {
        if self.pending_repeats > 0 {
            encode_repeat(&mut self.encoded, self.pending_repeats);
            self.pending_repeats = 0;
        }
    }

    /// Closes the open run, hands out the encoded chunk and resets for the next window.
    pub fn extract_and_reset(&mut self, time_range_id: TimeRangeId) -> EncodedChunk {
        self.flush_repeats();
        let chunk = EncodedChunk {
            host_id: self.host_id,
            sample_kind_id: self.sample_kind_id,
            time_range_id,
            encoded_samples: std::mem::take(&mut self.encoded),
            sample_count: self.sample_count,
        };
        self.sample_count = 0;
        self.last_value = None;
        chunk
    }

    /// Deep copy of the chunk encoded so far, leaving the accumulator untouched.
    pub fn snapshot(&self, time_range_id: TimeRangeId) -> EncodedChunk {
        let mut encoded = self.encoded.clone();
        encode_repeat(&mut encoded, self.pending_repeats);
        EncodedChunk {
            host_id: self.host_id,
            sample_kind_id: self.sample_kind_id,
            time_range_id,
            encoded_samples: encoded,
            sample_count: self.sample_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode_chunk, decode_units, EncodedUnit};

    #[test]
    fn test_identical_values_become_a_repeat_unit() {
        let mut acc = ChunkAccumulator::new(1, 2);
        acc.add_sample(SampleValue::Int(5));
        acc.add_sample(SampleValue::Int(5));
        acc.add_sample(SampleValue::Int(7));
        let chunk = acc.extract_and_reset(10);
        assert_eq!(chunk.sample_count, 3);
        assert_eq!(
            decode_units(&chunk.encoded_samples).unwrap(),
            vec![
                EncodedUnit::Scalar(SampleValue::Int(5)),
                EncodedUnit::Repeat(1),
                EncodedUnit::Scalar(SampleValue::Int(7)),
            ]
        );
    }

    #[test]
    fn test_mixed_sequences_roundtrip() {
        let input = vec![
            SampleValue::Null,
            SampleValue::Null,
            SampleValue::Int(1),
            SampleValue::Int(1),
            SampleValue::Int(1),
            SampleValue::Float(1.0),
            SampleValue::Float(2.5),
            SampleValue::Float(f64::NAN),
            SampleValue::Float(f64::NAN),
            SampleValue::Int(i64::MAX),
            SampleValue::Null,
            SampleValue::Int(-70_000),
        ];
        let mut acc = ChunkAccumulator::new(1, 1);
        for v in &input {
            acc.add_sample(*v);
        }
        let decoded = decode_chunk(&acc.extract_and_reset(1)).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_runs_longer_than_one_unit_are_split() {
        let mut acc = ChunkAccumulator::new(1, 1);
        let total = MAX_REPEAT_COUNT * 2 + 5;
        for _ in 0..total {
            acc.add_sample(SampleValue::Int(3));
        }
        let chunk = acc.extract_and_reset(1);
        let units = decode_units(&chunk.encoded_samples).unwrap();
        assert_eq!(units.len(), 4, "scalar + 3 repeat units: {:?}", units);
        let decoded = decode_chunk(&chunk).unwrap();
        assert_eq!(decoded.len(), total as usize);
        assert!(decoded.iter().all(|v| *v == SampleValue::Int(3)));
    }

    #[test]
    fn test_placeholders_backfill_nulls() {
        let mut acc = ChunkAccumulator::new(1, 1);
        acc.add_placeholders(3);
        acc.add_sample(SampleValue::Int(4));
        assert_eq!(acc.sample_count(), 4);
        let decoded = decode_chunk(&acc.extract_and_reset(1)).unwrap();
        assert_eq!(
            decoded,
            vec![SampleValue::Null, SampleValue::Null, SampleValue::Null, SampleValue::Int(4)]
        );
    }

    #[test]
    fn test_snapshot_does_not_reset_and_extract_does() {
        let mut acc = ChunkAccumulator::new(1, 1);
        acc.add_sample(SampleValue::Int(8));
        acc.add_sample(SampleValue::Int(8));

        let snap = acc.snapshot(3);
        assert_eq!(decode_chunk(&snap).unwrap(), vec![SampleValue::Int(8); 2]);
        assert_eq!(acc.sample_count(), 2);

        acc.add_sample(SampleValue::Int(8));
        let chunk = acc.extract_and_reset(3);
        assert_eq!(decode_chunk(&chunk).unwrap(), vec![SampleValue::Int(8); 3]);
        assert!(acc.is_empty());

        // A reused accumulator must not repeat a value from the previous window.
        acc.add_sample(SampleValue::Int(8));
        let next = acc.extract_and_reset(4);
        assert_eq!(
            decode_units(&next.encoded_samples).unwrap(),
            vec![EncodedUnit::Scalar(SampleValue::Int(8))]
        );
    }

    #[test]
    fn test_extracting_an_empty_accumulator_yields_an_empty_chunk() {
        let mut acc = ChunkAccumulator::new(1, 1);
        let chunk = acc.extract_and_reset(1);
        assert_eq!(chunk.sample_count, 0);
        assert!(chunk.encoded_samples.is_empty());
    }
}
