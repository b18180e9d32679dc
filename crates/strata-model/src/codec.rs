//! Binary record codec.
//!
//! A compact tagged encoding, independent of any serialization
//! framework: one version byte, one type tag, then typed big-endian
//! fields. The same bytes are written to segment files and framed over
//! the feeder/consumer wire, and must round-trip exactly so a record
//! re-appended downstream is byte-identical to the original.

use crate::error::CodecError;
use crate::metadata::SeriesMetadata;
use crate::record::{Record, RecordBody};
use crate::values::ValueBlock;
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

/// Version byte written at the head of every encoded record.
pub const CODEC_VERSION: u8 = 1;

const TAG_REGISTER: u8 = 0;
const TAG_UNREGISTER: u8 = 1;
const TAG_UPDATE: u8 = 2;
const TAG_DELETE: u8 = 3;

/// Largest string or map a 16-bit length prefix can carry.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Encode a record to its canonical byte form.
///
/// Fails with [`CodecError::Oversize`] when a string or map does not
/// fit its length prefix; an encoding that decode cannot read back
/// must never reach the log.
pub fn encode_record(record: &Record) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(64);
    buf.put_u8(CODEC_VERSION);
    buf.put_u8(match record.body {
        RecordBody::Register { .. } => TAG_REGISTER,
        RecordBody::Unregister { .. } => TAG_UNREGISTER,
        RecordBody::Update { .. } => TAG_UPDATE,
        RecordBody::Delete { .. } => TAG_DELETE,
    });
    buf.put_i64(record.store_timestamp_ms);
    put_string(&mut buf, &record.origin, "origin")?;
    match &record.body {
        RecordBody::Register { metadata } | RecordBody::Unregister { metadata } => {
            put_metadata(&mut buf, metadata)?;
        }
        RecordBody::Update { metadata, values } => {
            put_metadata(&mut buf, metadata)?;
            buf.put_i64(values.base_timestamp_ms);
            if values.encoded.len() > u32::MAX as usize {
                return Err(CodecError::Oversize {
                    field: "value block",
                    len: values.encoded.len(),
                    max: u32::MAX as usize,
                });
            }
            buf.put_u32(values.encoded.len() as u32);
            buf.extend_from_slice(&values.encoded);
        }
        RecordBody::Delete {
            metadata,
            start_ms,
            end_ms,
        } => {
            put_metadata(&mut buf, metadata)?;
            buf.put_i64(*start_ms);
            buf.put_i64(*end_ms);
        }
    }
    Ok(buf)
}

/// Decode a record, requiring the input to be exactly one record.
pub fn decode_record(input: &[u8]) -> Result<Record, CodecError> {
    let mut buf = input;
    let version = get_u8(&mut buf, "version")?;
    if version != CODEC_VERSION {
        return Err(CodecError::UnsupportedVersion {
            version,
            expected: CODEC_VERSION,
        });
    }
    let tag = get_u8(&mut buf, "tag")?;
    let store_timestamp_ms = get_i64(&mut buf, "store timestamp")?;
    let origin = get_string(&mut buf, "origin")?;
    let body = match tag {
        TAG_REGISTER => RecordBody::Register {
            metadata: get_metadata(&mut buf)?,
        },
        TAG_UNREGISTER => RecordBody::Unregister {
            metadata: get_metadata(&mut buf)?,
        },
        TAG_UPDATE => {
            let metadata = get_metadata(&mut buf)?;
            let base_timestamp_ms = get_i64(&mut buf, "base timestamp")?;
            let len = get_u32(&mut buf, "value block length")? as usize;
            let encoded = get_bytes(&mut buf, len, "value block")?;
            RecordBody::Update {
                metadata,
                values: ValueBlock {
                    base_timestamp_ms,
                    encoded,
                },
            }
        }
        TAG_DELETE => {
            let metadata = get_metadata(&mut buf)?;
            let start_ms = get_i64(&mut buf, "delete start")?;
            let end_ms = get_i64(&mut buf, "delete end")?;
            RecordBody::Delete {
                metadata,
                start_ms,
                end_ms,
            }
        }
        tag => return Err(CodecError::UnknownTag { tag }),
    };
    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: buf.len(),
        });
    }
    Ok(Record {
        origin,
        store_timestamp_ms,
        body,
    })
}

fn put_string(buf: &mut Vec<u8>, s: &str, field: &'static str) -> Result<(), CodecError> {
    if s.len() > MAX_FIELD_LEN {
        return Err(CodecError::Oversize {
            field,
            len: s.len(),
            max: MAX_FIELD_LEN,
        });
    }
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_map(
    buf: &mut Vec<u8>,
    map: &BTreeMap<String, String>,
    field: &'static str,
) -> Result<(), CodecError> {
    if map.len() > MAX_FIELD_LEN {
        return Err(CodecError::Oversize {
            field,
            len: map.len(),
            max: MAX_FIELD_LEN,
        });
    }
    buf.put_u16(map.len() as u16);
    for (k, v) in map {
        put_string(buf, k, field)?;
        put_string(buf, v, field)?;
    }
    Ok(())
}

fn put_metadata(buf: &mut Vec<u8>, metadata: &SeriesMetadata) -> Result<(), CodecError> {
    buf.put_u64(metadata.class_id);
    buf.put_u64(metadata.labels_id);
    put_string(buf, &metadata.name, "series name")?;
    put_map(buf, &metadata.labels, "labels")?;
    put_map(buf, &metadata.attributes, "attributes")?;
    Ok(())
}

fn need(buf: &[u8], n: usize, field: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < n {
        Err(CodecError::Truncated {
            needed: n - buf.remaining(),
            field,
        })
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, CodecError> {
    need(buf, 1, field)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16, CodecError> {
    need(buf, 2, field)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8], field: &'static str) -> Result<u32, CodecError> {
    need(buf, 4, field)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8], field: &'static str) -> Result<u64, CodecError> {
    need(buf, 8, field)?;
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut &[u8], field: &'static str) -> Result<i64, CodecError> {
    need(buf, 8, field)?;
    Ok(buf.get_i64())
}

fn get_bytes(buf: &mut &[u8], len: usize, field: &'static str) -> Result<Vec<u8>, CodecError> {
    need(buf, len, field)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn get_string(buf: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    let len = get_u16(buf, field)? as usize;
    let bytes = get_bytes(buf, len, field)?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8 { field })
}

fn get_map(buf: &mut &[u8], field: &'static str) -> Result<BTreeMap<String, String>, CodecError> {
    let count = get_u16(buf, field)?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let k = get_string(buf, field)?;
        let v = get_string(buf, field)?;
        map.insert(k, v);
    }
    Ok(map)
}

fn get_metadata(buf: &mut &[u8]) -> Result<SeriesMetadata, CodecError> {
    let class_id = get_u64(buf, "class id")?;
    let labels_id = get_u64(buf, "labels id")?;
    let name = get_string(buf, "series name")?;
    let labels = get_map(buf, "labels")?;
    let attributes = get_map(buf, "attributes")?;
    Ok(SeriesMetadata {
        class_id,
        labels_id,
        name,
        labels,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::DataPoint;
    use proptest::prelude::*;

    fn meta() -> SeriesMetadata {
        SeriesMetadata::new(7, 9, "mem.free")
            .with_label("host", "db-01")
            .with_attribute("unit", "bytes")
    }

    #[test]
    fn test_register_roundtrip() {
        let mut rec = Record::register("alpha", meta());
        rec.store_timestamp_ms = 1_700_000_000_000;
        let bytes = encode_record(&rec).unwrap();
        assert_eq!(decode_record(&bytes).unwrap(), rec);
    }

    #[test]
    fn test_update_roundtrip_preserves_value_block() {
        let block = ValueBlock::encode(
            1_700_000_000_000,
            &[
                DataPoint::new(1_700_000_000_000, 1.0),
                DataPoint::new(1_700_000_000_500, 2.0),
            ],
        );
        let mut rec = Record::update("alpha", meta(), block.clone());
        rec.store_timestamp_ms = 42;
        let decoded = decode_record(&encode_record(&rec).unwrap()).unwrap();
        match decoded.body {
            RecordBody::Update { values, .. } => {
                assert_eq!(values.base_timestamp_ms, block.base_timestamp_ms);
                assert_eq!(values.encoded, block.encoded);
            }
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn test_delete_roundtrip() {
        let mut rec = Record::delete("alpha", meta(), -100, 1_700_000_000_000);
        rec.store_timestamp_ms = 5;
        assert_eq!(decode_record(&encode_record(&rec).unwrap()).unwrap(), rec);
    }

    #[test]
    fn test_reencode_is_byte_identical() {
        // A re-appended record must serialize to the same bytes it
        // arrived as, so chained replication forwards it unchanged.
        let mut rec = Record::unregister("alpha", meta());
        rec.store_timestamp_ms = 99;
        let first = encode_record(&rec).unwrap();
        let second = encode_record(&decode_record(&first).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut rec_bytes = encode_record(&Record::register("a", meta())).unwrap();
        rec_bytes[1] = 0x7F;
        assert!(matches!(
            decode_record(&rec_bytes),
            Err(CodecError::UnknownTag { tag: 0x7F })
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut rec_bytes = encode_record(&Record::register("a", meta())).unwrap();
        rec_bytes[0] = 9;
        assert!(matches!(
            decode_record(&rec_bytes),
            Err(CodecError::UnsupportedVersion { version: 9, .. })
        ));
    }

    #[test]
    fn test_truncation_rejected() {
        let rec_bytes = encode_record(&Record::register("a", meta())).unwrap();
        for cut in 1..rec_bytes.len() {
            assert!(decode_record(&rec_bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut rec_bytes = encode_record(&Record::register("a", meta())).unwrap();
        rec_bytes.push(0);
        assert!(matches!(
            decode_record(&rec_bytes),
            Err(CodecError::TrailingBytes { remaining: 1 })
        ));
    }

    #[test]
    fn test_name_at_length_limit_roundtrips() {
        let metadata = SeriesMetadata::new(1, 2, "x".repeat(MAX_FIELD_LEN));
        let rec = Record::register("a", metadata);
        assert_eq!(decode_record(&encode_record(&rec).unwrap()).unwrap(), rec);
    }

    #[test]
    fn test_oversize_name_rejected_at_encode() {
        // A name longer than the u16 prefix would wrap and produce
        // bytes that decode reads back truncated.
        let metadata = SeriesMetadata::new(1, 2, "x".repeat(MAX_FIELD_LEN + 1));
        let rec = Record::register("a", metadata);
        assert!(matches!(
            encode_record(&rec),
            Err(CodecError::Oversize {
                field: "series name",
                len,
                ..
            }) if len == MAX_FIELD_LEN + 1
        ));
    }

    #[test]
    fn test_oversize_origin_rejected_at_encode() {
        let rec = Record::register("o".repeat(MAX_FIELD_LEN + 1), meta());
        assert!(matches!(
            encode_record(&rec),
            Err(CodecError::Oversize { field: "origin", .. })
        ));
    }

    #[test]
    fn test_oversize_label_value_rejected_at_encode() {
        let metadata = meta().with_label("big", "v".repeat(MAX_FIELD_LEN + 1));
        let rec = Record::register("a", metadata);
        assert!(matches!(
            encode_record(&rec),
            Err(CodecError::Oversize { field: "labels", .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_roundtrip_any_record(
            origin in "[a-z]{1,12}",
            ts in any::<i64>(),
            class_id in any::<u64>(),
            labels_id in any::<u64>(),
            name in "[a-z.]{1,24}",
            start in any::<i64>(),
            end in any::<i64>(),
        ) {
            let metadata = SeriesMetadata::new(class_id, labels_id, name);
            let mut rec = Record::delete(origin, metadata, start, end);
            rec.store_timestamp_ms = ts;
            prop_assert_eq!(decode_record(&encode_record(&rec).unwrap()).unwrap(), rec);
        }
    }
}
