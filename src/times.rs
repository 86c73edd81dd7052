//! Timestamp codec for the shared timeline of a time range.
//!
//! An encoded timeline is an absolute `FULL_TIME` unit followed by delta units. Every timeline
//! starts with `FULL_TIME`, so encoded timelines concatenate into a valid timeline as long as the
//! parts are in time order. Aggregation relies on this.

use crate::encoding::{read_var_u64, write_u64, write_var_u64};
use crate::error::{Result, TimelineError};
use crate::types::Timestamp;

use std::io::{Cursor, Read};

const OP_FULL_TIME: u8 = 0x01;
const OP_DELTA: u8 = 0x02;
const OP_REPEATED_DELTA: u8 = 0x03;

/// Encodes a non-decreasing sequence of timestamps.
pub fn encode_times(times: &[Timestamp]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(9 + times.len());
    let Some((&first, rest)) = times.split_first() else {
        return Ok(out);
    };
    out.push(OP_FULL_TIME);
    write_u64(&mut out, first);

    let mut previous = first;
    let mut run_delta: Option<u64> = None;
    let mut run_len: u64 = 0;
    for &t in rest {
        if t < previous {
            return Err(TimelineError::corrupt(format!(
                "timestamp {} precedes {} in timeline",
                t, previous
            )));
        }
        let delta = t - previous;
        previous = t;
        match run_delta {
            Some(d) if d == delta => run_len += 1,
            _ => {
                flush_delta_run(&mut out, run_delta, run_len);
                run_delta = Some(delta);
                run_len = 1;
            }
        }
    }
    flush_delta_run(&mut out, run_delta, run_len);
    Ok(out)
}

fn flush_delta_run(out: &mut Vec<u8>, delta: Option<u64>, count: u64) {
    let Some(delta) = delta else { return };
    match count {
        0 => {}
        1 => {
            out.push(OP_DELTA);
            write_var_u64(out, delta);
        }
        n => {
            out.push(OP_REPEATED_DELTA);
            write_var_u64(out, n);
            write_var_u64(out, delta);
        }
    }
}

/// Walks an encoded timeline, calling `f` once per timestamp.
fn walk_times(bytes: &[u8], mut f: impl FnMut(Timestamp)) -> Result<u64> {
    let mut cur = Cursor::new(bytes);
    let mut current: Option<Timestamp> = None;
    let mut count: u64 = 0;
    while (cur.position() as usize) < bytes.len() {
        let offset = cur.position();
        let corrupt = |details: String| {
            TimelineError::corrupt(format!("timeline at offset {}: {}", offset, details))
        };
        let mut op = [0u8; 1];
        cur.read_exact(&mut op).map_err(|e| corrupt(e.to_string()))?;
        match op[0] {
            OP_FULL_TIME => {
                let mut b = [0u8; 8];
                cur.read_exact(&mut b)
                    .map_err(|_| corrupt("truncated full time".to_string()))?;
                let t = u64::from_le_bytes(b);
                if let Some(prev) = current {
                    if t < prev {
                        return Err(corrupt(format!("time goes backwards: {} after {}", t, prev)));
                    }
                }
                current = Some(t);
                count += 1;
                f(t);
            }
            OP_DELTA | OP_REPEATED_DELTA => {
                let repeats = if op[0] == OP_REPEATED_DELTA {
                    read_var_u64(&mut cur).map_err(corrupt)?
                } else {
                    1
                };
                if repeats == 0 {
                    return Err(corrupt("repeated delta with a zero count".to_string()));
                }
                if count.saturating_add(repeats) > u32::MAX as u64 {
                    return Err(corrupt(format!(
                        "repeat count {} overflows the timeline length",
                        repeats
                    )));
                }
                let delta = read_var_u64(&mut cur).map_err(corrupt)?;
                let mut t = current.ok_or_else(|| corrupt("delta before full time".to_string()))?;
                for _ in 0..repeats {
                    t = t
                        .checked_add(delta)
                        .ok_or_else(|| corrupt("timestamp overflow".to_string()))?;
                    f(t);
                }
                current = Some(t);
                count += repeats;
            }
            other => return Err(corrupt(format!("unknown time opcode 0x{:02X}", other))),
        }
    }
    Ok(count)
}

/// Decodes an encoded timeline back into its timestamps.
pub fn decode_times(bytes: &[u8]) -> Result<Vec<Timestamp>> {
    let mut out = Vec::new();
    walk_times(bytes, |t| out.push(t))?;
    Ok(out)
}

/// Number of timestamps in an encoded timeline.
pub fn count_times(bytes: &[u8]) -> Result<u32> {
    let count = walk_times(bytes, |_| {})?;
    u32::try_from(count).map_err(|_| TimelineError::corrupt("timeline count overflows u32"))
}

/// First and last timestamp of an encoded timeline, `None` when it is empty.
pub fn time_bounds(bytes: &[u8]) -> Result<Option<(Timestamp, Timestamp)>> {
    let mut bounds: Option<(Timestamp, Timestamp)> = None;
    walk_times(bytes, |t| {
        bounds = Some(match bounds {
            None => (t, t),
            Some((first, _)) => (first, t),
        });
    })?;
    Ok(bounds)
}

/// Concatenates time-ordered encoded timelines into one, validating every part.
pub fn combine_times<'a, I>(parts: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    let mut last: Option<Timestamp> = None;
    for part in parts {
        if let Some((first, end)) = time_bounds(part)? {
            if let Some(prev) = last {
                if first <= prev {
                    return Err(TimelineError::corrupt(format!(
                        "timelines overlap: part starting at {} follows {}",
                        first, prev
                    )));
                }
            }
            last = Some(end);
            out.extend_from_slice(part);
        }
    }
    Ok(out)
}
