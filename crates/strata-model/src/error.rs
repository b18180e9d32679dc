//! Error types for the record codec.

use thiserror::Error;

/// Errors produced while encoding or decoding a record.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before the field being decoded was complete.
    #[error("truncated input: needed {needed} more bytes for {field}")]
    Truncated {
        /// Number of missing bytes.
        needed: usize,
        /// The field being decoded when input ran out.
        field: &'static str,
    },

    /// The record type tag is not one of the known discriminants.
    #[error("unknown record tag {tag:#04x}")]
    UnknownTag {
        /// The unrecognized tag byte.
        tag: u8,
    },

    /// The codec version byte is not supported.
    #[error("unsupported codec version {version}, expected {expected}")]
    UnsupportedVersion {
        /// Version found in the input.
        version: u8,
        /// Version this build understands.
        expected: u8,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 {
        /// The field containing the invalid bytes.
        field: &'static str,
    },

    /// Decoding consumed fewer bytes than were provided.
    #[error("trailing garbage: {remaining} bytes left after record")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },

    /// A field is too large for its length prefix. Rejected at encode
    /// time; bytes that decode cannot read must never be produced.
    #[error("{field} of {len} bytes/entries exceeds the {max} limit")]
    Oversize {
        /// The offending field.
        field: &'static str,
        /// Actual size of the field.
        len: usize,
        /// Largest size the encoding can carry.
        max: usize,
    },
}
