//! Replication wire protocol.
//!
//! A consumer dials a feeder over TCP and the two exchange
//! length-prefixed bincode [`Frame`]s: the consumer opens with
//! [`Frame::Hello`] carrying its resume offset and optional shard
//! subscription, the feeder streams [`Frame::Record`]s interleaved
//! with [`Frame::Heartbeat`]s, and the consumer periodically sends
//! [`Frame::Ack`] with its durably persisted offset.

use crate::error::{DatalogError, DatalogResult};
use crate::offsets::LogOffset;
use crate::workers::partition_key;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version carried in [`Frame::Hello`]; mismatches reject the
/// session.
pub const PROTOCOL_VERSION: u32 = 1;

/// Hard ceiling on an encoded frame. Record payloads are bounded well
/// below this; anything larger is a broken or hostile peer.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Subscription to a subset of series partitions.
///
/// The feeder only streams records whose series falls in one of the
/// subscribed shards, computed from the same id mix the apply workers
/// partition by. Records with both ids zero carry no series and always
/// match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFilter {
    /// Total number of shards the key space is split into.
    pub num_shards: u32,
    /// Shards this consumer subscribes to.
    pub shards: Vec<u32>,
}

impl ShardFilter {
    /// Whether a series belongs to one of the subscribed shards.
    pub fn matches(&self, class_id: u64, labels_id: u64) -> bool {
        if self.num_shards == 0 {
            return true;
        }
        if class_id == 0 && labels_id == 0 {
            return true;
        }
        let shard = partition_key(class_id, labels_id) % self.num_shards;
        self.shards.contains(&shard)
    }
}

/// One replication protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Session opener, consumer to feeder.
    Hello {
        /// Must equal [`PROTOCOL_VERSION`].
        protocol_version: u32,
        /// Consumer identity, for feeder-side logging and offsets.
        consumer_id: String,
        /// Where to resume; `None` streams from the earliest segment.
        resume: Option<LogOffset>,
        /// Optional shard subscription; `None` streams everything.
        shards: Option<ShardFilter>,
    },
    /// One log entry, feeder to consumer.
    Record {
        /// Segment the entry came from.
        segment: String,
        /// Offset of the entry that follows, i.e. the position to
        /// resume from once this record is processed.
        position: u64,
        /// The encoded record bytes as stored in the log.
        payload: Vec<u8>,
    },
    /// Liveness signal while the feeder has nothing to stream.
    Heartbeat {
        /// The feeder's active segment, if any.
        current_segment: Option<String>,
    },
    /// Durable progress report, consumer to feeder.
    Ack {
        /// Offset the consumer has persisted.
        offset: LogOffset,
    },
}

/// Write one frame with a big-endian u32 length prefix.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> DatalogResult<()> {
    let payload = bincode::serialize(frame)?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(DatalogError::protocol(format!(
            "outgoing frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. A peer that closes the connection
/// cleanly between frames yields `Ok(None)`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> DatalogResult<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(DatalogError::protocol(format!(
            "incoming frame of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}
