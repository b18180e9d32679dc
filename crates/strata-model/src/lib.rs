#![warn(missing_docs)]

//! Strata data model: series metadata, mutation records and their binary codec.
//!
//! This crate is pure and stateless. It defines the unit of replication
//! (a [`Record`]), the 24-byte segment key derived from it, and the
//! tagged binary encoding that must round-trip byte-for-byte between
//! append, replay and the feeder/consumer wire.

pub mod codec;
pub mod error;
pub mod metadata;
pub mod record;
pub mod values;

pub use codec::{decode_record, encode_record, MAX_FIELD_LEN};
pub use error::CodecError;
pub use metadata::SeriesMetadata;
pub use record::{Record, RecordBody, RecordKind, RECORD_KEY_LEN};
pub use values::{DataPoint, ValueBlock};
