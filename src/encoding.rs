//! Sample codec: opcode-tagged scalar, repeat and null units, plus the byte helpers shared by the
//! timestamp codec and the on-disk formats.

use crate::error::{Result, TimelineError};
use crate::types::{EncodedChunk, SampleValue};

use crc32fast::Hasher as Crc32;
use std::io::{Cursor, Read};

// --- Opcodes ---
//
// Every unit starts with one opcode byte. Integer and float widths are picked by magnitude and
// are never visible to callers; they only have to round-trip bit-exactly.

const OP_BYTE: u8 = 0x01;
const OP_SHORT: u8 = 0x02;
const OP_INT: u8 = 0x03;
const OP_LONG: u8 = 0x04;
const OP_FLOAT: u8 = 0x05;
const OP_DOUBLE: u8 = 0x06;
const OP_NULL: u8 = 0x08;
const OP_BYTE_FOR_DOUBLE: u8 = 0x0C;
const OP_SHORT_FOR_DOUBLE: u8 = 0x0D;
const OP_DOUBLE_ZERO: u8 = 0x0F;
const OP_INT_ZERO: u8 = 0x10;
const OP_REPEAT_SHORT: u8 = 0xFE;
const OP_REPEAT_BYTE: u8 = 0xFF;

/// Largest repeat count a single `Repeat` unit can carry. Longer runs are split.
pub const MAX_REPEAT_COUNT: u32 = u16::MAX as u32;

/// One decoded unit of a sample stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodedUnit {
    /// A concrete integer or float value.
    Scalar(SampleValue),
    /// The previously decoded value occurs `count` more times.
    Repeat(u32),
    /// An explicitly missing value.
    Null,
}

/// Appends a single scalar or null unit for `value`.
pub fn encode_sample(out: &mut Vec<u8>, value: &SampleValue) {
    match *value {
        SampleValue::Null => out.push(OP_NULL),
        SampleValue::Int(v) => encode_int(out, v),
        SampleValue::Float(v) => encode_float(out, v),
    }
}

/// Appends one or more repeat units totalling `count` extra occurrences of the previous value.
pub fn encode_repeat(out: &mut Vec<u8>, mut count: u32) {
    while count > 0 {
        let unit = count.min(MAX_REPEAT_COUNT);
        if unit <= u8::MAX as u32 {
            out.push(OP_REPEAT_BYTE);
            out.push(unit as u8);
        } else {
            out.push(OP_REPEAT_SHORT);
            out.extend_from_slice(&(unit as u16).to_le_bytes());
        }
        count -= unit;
    }
}

/// Appends a run of `count` nulls.
pub fn encode_null_run(out: &mut Vec<u8>, count: u32) {
    if count == 0 {
        return;
    }
    out.push(OP_NULL);
    encode_repeat(out, count - 1);
}

fn encode_int(out: &mut Vec<u8>, v: i64) {
    if v == 0 {
        out.push(OP_INT_ZERO);
    } else if let Ok(b) = i8::try_from(v) {
        out.push(OP_BYTE);
        out.extend_from_slice(&b.to_le_bytes());
    } else if let Ok(s) = i16::try_from(v) {
        out.push(OP_SHORT);
        out.extend_from_slice(&s.to_le_bytes());
    } else if let Ok(i) = i32::try_from(v) {
        out.push(OP_INT);
        out.extend_from_slice(&i.to_le_bytes());
    } else {
        out.push(OP_LONG);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn encode_float(out: &mut Vec<u8>, v: f64) {
    if v.to_bits() == 0 {
        out.push(OP_DOUBLE_ZERO);
        return;
    }
    // Integral values in small ranges. The bit comparison keeps -0.0 out.
    if v.is_finite() && v.fract() == 0.0 && v >= i16::MIN as f64 && v <= i16::MAX as f64 {
        let i = v as i16;
        if (i as f64).to_bits() == v.to_bits() {
            if let Ok(b) = i8::try_from(i) {
                out.push(OP_BYTE_FOR_DOUBLE);
                out.extend_from_slice(&b.to_le_bytes());
            } else {
                out.push(OP_SHORT_FOR_DOUBLE);
                out.extend_from_slice(&i.to_le_bytes());
            }
            return;
        }
    }
    let narrowed = v as f32;
    if (narrowed as f64).to_bits() == v.to_bits() {
        out.push(OP_FLOAT);
        out.extend_from_slice(&narrowed.to_le_bytes());
    } else {
        out.push(OP_DOUBLE);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Decodes a sample stream into its units without expanding repeats.
pub fn decode_units(bytes: &[u8]) -> Result<Vec<EncodedUnit>> {
    let mut cur = Cursor::new(bytes);
    let mut units = Vec::new();
    let mut has_previous = false;
    while (cur.position() as usize) < bytes.len() {
        let offset = cur.position();
        let unit = decode_unit(&mut cur).map_err(|e| {
            TimelineError::corrupt(format!("sample stream at offset {}: {}", offset, e))
        })?;
        if let EncodedUnit::Repeat(count) = unit {
            if !has_previous {
                return Err(TimelineError::corrupt(format!(
                    "repeat unit at offset {} has no preceding value",
                    offset
                )));
            }
            if count == 0 {
                return Err(TimelineError::corrupt(format!(
                    "zero repeat count at offset {}",
                    offset
                )));
            }
        }
        has_previous = true;
        units.push(unit);
    }
    Ok(units)
}

fn decode_unit(cur: &mut Cursor<&[u8]>) -> std::result::Result<EncodedUnit, String> {
    let op = read_array::<1>(cur)?[0];
    let unit = match op {
        OP_NULL => EncodedUnit::Null,
        OP_INT_ZERO => EncodedUnit::Scalar(SampleValue::Int(0)),
        OP_BYTE => {
            EncodedUnit::Scalar(SampleValue::Int(i8::from_le_bytes(read_array(cur)?) as i64))
        }
        OP_SHORT => {
            EncodedUnit::Scalar(SampleValue::Int(i16::from_le_bytes(read_array(cur)?) as i64))
        }
        OP_INT => {
            EncodedUnit::Scalar(SampleValue::Int(i32::from_le_bytes(read_array(cur)?) as i64))
        }
        OP_LONG => EncodedUnit::Scalar(SampleValue::Int(i64::from_le_bytes(read_array(cur)?))),
        OP_DOUBLE_ZERO => EncodedUnit::Scalar(SampleValue::Float(0.0)),
        OP_BYTE_FOR_DOUBLE => {
            EncodedUnit::Scalar(SampleValue::Float(i8::from_le_bytes(read_array(cur)?) as f64))
        }
        OP_SHORT_FOR_DOUBLE => {
            EncodedUnit::Scalar(SampleValue::Float(i16::from_le_bytes(read_array(cur)?) as f64))
        }
        OP_FLOAT => {
            EncodedUnit::Scalar(SampleValue::Float(f32::from_le_bytes(read_array(cur)?) as f64))
        }
        OP_DOUBLE => EncodedUnit::Scalar(SampleValue::Float(f64::from_le_bytes(read_array(cur)?))),
        OP_REPEAT_BYTE => EncodedUnit::Repeat(read_array::<1>(cur)?[0] as u32),
        OP_REPEAT_SHORT => EncodedUnit::Repeat(u16::from_le_bytes(read_array(cur)?) as u32),
        other => return Err(format!("unknown opcode 0x{:02X}", other)),
    };
    Ok(unit)
}

fn read_array<const N: usize>(cur: &mut Cursor<&[u8]>) -> std::result::Result<[u8; N], String> {
    let mut b = [0u8; N];
    cur.read_exact(&mut b)
        .map_err(|_| format!("truncated payload, wanted {} bytes", N))?;
    Ok(b)
}

/// Decodes and expands a sample stream into one value per sample.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<SampleValue>> {
    let units = decode_units(bytes)?;
    let mut out = Vec::with_capacity(units.len());
    let mut previous = SampleValue::Null;
    for unit in units {
        match unit {
            EncodedUnit::Scalar(v) => {
                out.push(v);
                previous = v;
            }
            EncodedUnit::Null => {
                out.push(SampleValue::Null);
                previous = SampleValue::Null;
            }
            EncodedUnit::Repeat(count) => {
                out.extend(std::iter::repeat(previous).take(count as usize));
            }
        }
    }
    Ok(out)
}

/// Number of samples a stream decodes to, without materializing them.
pub fn count_samples(bytes: &[u8]) -> Result<u32> {
    let mut total: u64 = 0;
    for unit in decode_units(bytes)? {
        total += match unit {
            EncodedUnit::Repeat(count) => count as u64,
            _ => 1,
        };
    }
    u32::try_from(total).map_err(|_| TimelineError::corrupt("sample count overflows u32"))
}

/// Decodes a stored chunk, attaching its identity to any error and checking its declared count.
pub fn decode_chunk(chunk: &EncodedChunk) -> Result<Vec<SampleValue>> {
    let with_context = |details: String| TimelineError::CorruptEncoding {
        details,
        host_id: Some(chunk.host_id),
        sample_kind_id: Some(chunk.sample_kind_id),
        time_range_id: Some(chunk.time_range_id),
    };
    let samples = decode_samples(&chunk.encoded_samples).map_err(|e| match e {
        TimelineError::CorruptEncoding { details, .. } => with_context(details),
        other => other,
    })?;
    if samples.len() != chunk.sample_count as usize {
        return Err(with_context(format!(
            "decoded {} samples, chunk declares {}",
            samples.len(),
            chunk.sample_count
        )));
    }
    Ok(samples)
}

// --- Byte helpers shared with the timestamp codec and file formats ---

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

pub(crate) fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(crate) fn read_var_u64<R: Read>(r: &mut R) -> std::result::Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)
            .map_err(|e| format!("Truncated varint: {}", e))?;
        let byte = b[0];
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err("Varint too long".to_string())
}
