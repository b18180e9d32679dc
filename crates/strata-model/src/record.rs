//! The mutation record: the unit of durability and replication.

use crate::metadata::SeriesMetadata;
use crate::values::ValueBlock;
use bytes::BufMut;

/// Length in bytes of the segment key derived from a record.
pub const RECORD_KEY_LEN: usize = 24;

/// The four mutation kinds a record can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A series was registered in the directory.
    Register,
    /// A series was removed from the directory.
    Unregister,
    /// Datapoints were written to a series.
    Update,
    /// A time range of a series was deleted.
    Delete,
}

/// Type-specific payload of a record.
///
/// Closed tagged union: dispatch over record kinds is an exhaustive
/// `match`, so adding a kind is a compile-checked change.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    /// Metadata snapshot of the registered series.
    Register {
        /// The series being registered.
        metadata: SeriesMetadata,
    },
    /// Metadata snapshot of the unregistered series.
    Unregister {
        /// The series being unregistered.
        metadata: SeriesMetadata,
    },
    /// An encoded value block with its explicit time base.
    Update {
        /// The series the datapoints belong to.
        metadata: SeriesMetadata,
        /// The encoded datapoints.
        values: ValueBlock,
    },
    /// A deletion over `[start, end]` (inclusive, milliseconds).
    Delete {
        /// The series the deletion applies to.
        metadata: SeriesMetadata,
        /// Start of the deleted range.
        start_ms: i64,
        /// End of the deleted range.
        end_ms: i64,
    },
}

/// An immutable unit of replication.
///
/// Created once by the instance that first observed the mutation,
/// appended to that instance's log, and re-appended verbatim by every
/// downstream instance that applies it. `origin` is never rewritten;
/// `store_timestamp_ms` is assigned at local append time.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Identifier of the instance that first created the record.
    pub origin: String,
    /// Wall-clock time assigned when the record was appended locally.
    pub store_timestamp_ms: i64,
    /// The mutation payload.
    pub body: RecordBody,
}

impl Record {
    /// Build a REGISTER record.
    pub fn register(origin: impl Into<String>, metadata: SeriesMetadata) -> Self {
        Self {
            origin: origin.into(),
            store_timestamp_ms: 0,
            body: RecordBody::Register { metadata },
        }
    }

    /// Build an UNREGISTER record.
    pub fn unregister(origin: impl Into<String>, metadata: SeriesMetadata) -> Self {
        Self {
            origin: origin.into(),
            store_timestamp_ms: 0,
            body: RecordBody::Unregister { metadata },
        }
    }

    /// Build an UPDATE record.
    pub fn update(origin: impl Into<String>, metadata: SeriesMetadata, values: ValueBlock) -> Self {
        Self {
            origin: origin.into(),
            store_timestamp_ms: 0,
            body: RecordBody::Update { metadata, values },
        }
    }

    /// Build a DELETE record.
    pub fn delete(
        origin: impl Into<String>,
        metadata: SeriesMetadata,
        start_ms: i64,
        end_ms: i64,
    ) -> Self {
        Self {
            origin: origin.into(),
            store_timestamp_ms: 0,
            body: RecordBody::Delete {
                metadata,
                start_ms,
                end_ms,
            },
        }
    }

    /// The kind discriminant of this record.
    pub fn kind(&self) -> RecordKind {
        match self.body {
            RecordBody::Register { .. } => RecordKind::Register,
            RecordBody::Unregister { .. } => RecordKind::Unregister,
            RecordBody::Update { .. } => RecordKind::Update,
            RecordBody::Delete { .. } => RecordKind::Delete,
        }
    }

    /// The series metadata the record concerns.
    pub fn metadata(&self) -> &SeriesMetadata {
        match &self.body {
            RecordBody::Register { metadata }
            | RecordBody::Unregister { metadata }
            | RecordBody::Update { metadata, .. }
            | RecordBody::Delete { metadata, .. } => metadata,
        }
    }

    /// Class id of the series the record concerns.
    pub fn class_id(&self) -> u64 {
        self.metadata().class_id
    }

    /// Labels id of the series the record concerns.
    pub fn labels_id(&self) -> u64 {
        self.metadata().labels_id
    }

    /// The 24-byte segment key: big-endian
    /// `store_timestamp (8) | class_id (8) | labels_id (8)`.
    ///
    /// Keys sort by store timestamp first, and carry the series identity
    /// so consumers can shard without deserializing the value.
    pub fn key(&self) -> [u8; RECORD_KEY_LEN] {
        let mut key = [0u8; RECORD_KEY_LEN];
        {
            let mut buf = &mut key[..];
            buf.put_i64(self.store_timestamp_ms);
            buf.put_u64(self.class_id());
            buf.put_u64(self.labels_id());
        }
        key
    }
}
