//! Encoded value blocks: the datapoint payload of an UPDATE record.
//!
//! A [`ValueBlock`] is a batch of datapoints encoded against an explicit
//! base timestamp. Timestamps are stored as deltas from the base so a
//! block can be shipped and replayed without rebasing; values are raw
//! IEEE-754 doubles.

use crate::error::CodecError;
use bytes::{Buf, BufMut};

/// One timestamped value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    /// Absolute timestamp, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// The measured value.
    pub value: f64,
}

impl DataPoint {
    /// Create a datapoint.
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// A batch of datapoints encoded against a base timestamp.
///
/// The encoded form is `u32` count followed by `(i64 delta, f64 value)`
/// pairs, all big-endian. Decoding a block re-applies the base, so
/// encode/decode round-trips exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueBlock {
    /// Time base all encoded deltas are relative to, in milliseconds.
    pub base_timestamp_ms: i64,
    /// Encoded datapoints.
    pub encoded: Vec<u8>,
}

impl ValueBlock {
    /// Encode a batch of datapoints against the given base timestamp.
    pub fn encode(base_timestamp_ms: i64, points: &[DataPoint]) -> Self {
        let mut encoded = Vec::with_capacity(4 + points.len() * 16);
        encoded.put_u32(points.len() as u32);
        for p in points {
            encoded.put_i64(p.timestamp_ms - base_timestamp_ms);
            encoded.put_f64(p.value);
        }
        Self {
            base_timestamp_ms,
            encoded,
        }
    }

    /// Decode the datapoints back out of the block.
    pub fn decode(&self) -> Result<Vec<DataPoint>, CodecError> {
        let mut buf = &self.encoded[..];
        if buf.remaining() < 4 {
            return Err(CodecError::Truncated {
                needed: 4 - buf.remaining(),
                field: "value block count",
            });
        }
        let count = buf.get_u32() as usize;
        // The count is untrusted; never pre-allocate beyond what the
        // remaining bytes could actually hold.
        let mut points = Vec::with_capacity(count.min(buf.remaining() / 16));
        for _ in 0..count {
            if buf.remaining() < 16 {
                return Err(CodecError::Truncated {
                    needed: 16 - buf.remaining(),
                    field: "value block datapoint",
                });
            }
            let delta = buf.get_i64();
            let value = buf.get_f64();
            points.push(DataPoint::new(self.base_timestamp_ms + delta, value));
        }
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes {
                remaining: buf.remaining(),
            });
        }
        Ok(points)
    }

    /// Number of datapoints in the block without decoding them all.
    pub fn len(&self) -> usize {
        if self.encoded.len() < 4 {
            return 0;
        }
        u32::from_be_bytes([
            self.encoded[0],
            self.encoded[1],
            self.encoded[2],
            self.encoded[3],
        ]) as usize
    }

    /// True if the block holds no datapoints.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
