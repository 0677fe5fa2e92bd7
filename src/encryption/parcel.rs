//! Parcel serialization
//!
//! The parcel is the plaintext that gets encrypted: a version byte, a
//! bitmap naming which record fields it carries, then the fields in bitmap
//! order, each length-prefixed.
//!
//! Layout (V1):
//!
//! ```text
//! u8       parcel version
//! u16      field bitmap (bit 0 = record value, bit 1 = header values)
//! [uvarint length | bytes]          record value, when bit 0 is set
//! [uvarint length | header blob]    header values, when bit 1 is set
//! ```
//!
//! The header blob is `uvarint count` followed by, per header,
//! `uvarint key_length | key | uvarint value_length_plus_one | value`
//! where a length-plus-one of zero encodes a null header value.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::indexmap::IndexMap;
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::Record;

use super::scheme::{ParcelVersion, RecordFieldSet};
use crate::error::EncryptionError;

/// The decoded contents of a parcel
#[derive(Debug)]
pub struct ParcelContents {
    pub fields: RecordFieldSet,
    pub value: Option<Bytes>,
    pub headers: Option<IndexMap<StrBytes, Option<Bytes>>>,
}

/// Serialized size of the parcel for one record
pub fn size_of_parcel(version: ParcelVersion, fields: RecordFieldSet, record: &Record) -> usize {
    match version {
        ParcelVersion::V1 => {
            let mut size = 1 + 2; // version byte + field bitmap
            if fields.contains(RecordFieldSet::RECORD_VALUE) {
                let len = record.value.as_ref().map(|v| v.len()).unwrap_or(0);
                size += size_of_uvarint(len as u64) + len;
            }
            if fields.contains(RecordFieldSet::RECORD_HEADER_VALUES) {
                let blob = size_of_header_blob(&record.headers);
                size += size_of_uvarint(blob as u64) + blob;
            }
            size
        }
    }
}

/// Write the parcel for one record into `out`
pub fn write_parcel(
    version: ParcelVersion,
    fields: RecordFieldSet,
    record: &Record,
    out: &mut BytesMut,
) -> Result<(), EncryptionError> {
    match version {
        ParcelVersion::V1 => {
            out.put_u8(version.code());
            out.put_u16(fields.bits());
            if fields.contains(RecordFieldSet::RECORD_VALUE) {
                let value = record.value.as_ref().ok_or_else(|| {
                    EncryptionError::Truncated("parcel for a record without a value".to_string())
                })?;
                put_uvarint(out, value.len() as u64);
                out.put_slice(value);
            }
            if fields.contains(RecordFieldSet::RECORD_HEADER_VALUES) {
                put_uvarint(out, size_of_header_blob(&record.headers) as u64);
                write_header_blob(&record.headers, out);
            }
            Ok(())
        }
    }
}

/// Read a parcel back into its contents
pub fn read_parcel(
    version: ParcelVersion,
    parcel: &[u8],
) -> Result<ParcelContents, EncryptionError> {
    match version {
        ParcelVersion::V1 => {
            let mut pos = 0usize;
            let code = read_u8(parcel, &mut pos)?;
            if code != version.code() {
                return Err(EncryptionError::Truncated(format!(
                    "parcel version byte {code} does not match expected {}",
                    version.code()
                )));
            }
            let bits = read_u16(parcel, &mut pos)?;
            let fields = RecordFieldSet::from_bits(bits)?;

            let value = if fields.contains(RecordFieldSet::RECORD_VALUE) {
                let len = get_uvarint(parcel, &mut pos)? as usize;
                Some(Bytes::copy_from_slice(read_slice(parcel, &mut pos, len)?))
            } else {
                None
            };

            let headers = if fields.contains(RecordFieldSet::RECORD_HEADER_VALUES) {
                let blob_len = get_uvarint(parcel, &mut pos)? as usize;
                let blob = read_slice(parcel, &mut pos, blob_len)?;
                Some(read_header_blob(blob)?)
            } else {
                None
            };

            Ok(ParcelContents {
                fields,
                value,
                headers,
            })
        }
    }
}

fn size_of_header_blob(headers: &IndexMap<StrBytes, Option<Bytes>>) -> usize {
    let mut size = size_of_uvarint(headers.len() as u64);
    for (key, value) in headers {
        size += size_of_uvarint(key.len() as u64) + key.len();
        match value {
            Some(value) => size += size_of_uvarint(value.len() as u64 + 1) + value.len(),
            None => size += size_of_uvarint(0),
        }
    }
    size
}

fn write_header_blob(headers: &IndexMap<StrBytes, Option<Bytes>>, out: &mut BytesMut) {
    put_uvarint(out, headers.len() as u64);
    for (key, value) in headers {
        put_uvarint(out, key.len() as u64);
        out.put_slice(key.as_bytes());
        match value {
            Some(value) => {
                put_uvarint(out, value.len() as u64 + 1);
                out.put_slice(value);
            }
            None => put_uvarint(out, 0),
        }
    }
}

fn read_header_blob(blob: &[u8]) -> Result<IndexMap<StrBytes, Option<Bytes>>, EncryptionError> {
    let mut pos = 0usize;
    let count = get_uvarint(blob, &mut pos)? as usize;
    let mut headers = IndexMap::with_capacity(count);
    for _ in 0..count {
        let key_len = get_uvarint(blob, &mut pos)? as usize;
        let key_bytes = read_slice(blob, &mut pos, key_len)?;
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|_| EncryptionError::Truncated("header key is not UTF-8".to_string()))?;
        let marker = get_uvarint(blob, &mut pos)?;
        let value = if marker == 0 {
            None
        } else {
            let len = (marker - 1) as usize;
            Some(Bytes::copy_from_slice(read_slice(blob, &mut pos, len)?))
        };
        headers.insert(StrBytes::from_string(key), value);
    }
    Ok(headers)
}

pub(super) fn size_of_uvarint(mut value: u64) -> usize {
    let mut size = 1;
    while value >= 0x80 {
        value >>= 7;
        size += 1;
    }
    size
}

pub(super) fn put_uvarint(out: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

pub(super) fn get_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64, EncryptionError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(buf, pos)?;
        if shift >= 63 && byte > 1 {
            return Err(EncryptionError::Truncated("uvarint overflow".to_string()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8, EncryptionError> {
    let byte = *buf
        .get(*pos)
        .ok_or_else(|| EncryptionError::Truncated("unexpected end of parcel".to_string()))?;
    *pos += 1;
    Ok(byte)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, EncryptionError> {
    let high = read_u8(buf, pos)?;
    let low = read_u8(buf, pos)?;
    Ok(u16::from_be_bytes([high, low]))
}

fn read_slice<'a>(
    buf: &'a [u8],
    pos: &mut usize,
    len: usize,
) -> Result<&'a [u8], EncryptionError> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| EncryptionError::Truncated("unexpected end of parcel".to_string()))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::records::TimestampType;

    fn record(value: Option<&[u8]>, headers: Vec<(&str, Option<&[u8]>)>) -> Record {
        let mut header_map = IndexMap::new();
        for (key, value) in headers {
            header_map.insert(
                StrBytes::from_string(key.to_string()),
                value.map(Bytes::copy_from_slice),
            );
        }
        Record {
            transactional: false,
            control: false,
            partition_leader_epoch: 0,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: TimestampType::Creation,
            offset: 0,
            sequence: -1,
            timestamp: 0,
            key: None,
            value: value.map(Bytes::copy_from_slice),
            headers: header_map,
        }
    }

    #[test]
    fn test_value_only_roundtrip() {
        let record = record(Some(b"hello world"), vec![("h", Some(b"v"))]);
        let fields = RecordFieldSet::value_only();
        let mut out = BytesMut::new();
        write_parcel(ParcelVersion::V1, fields, &record, &mut out).unwrap();
        assert_eq!(out.len(), size_of_parcel(ParcelVersion::V1, fields, &record));

        let contents = read_parcel(ParcelVersion::V1, &out).unwrap();
        assert_eq!(contents.fields, fields);
        assert_eq!(contents.value.as_deref(), Some(b"hello world".as_ref()));
        assert!(contents.headers.is_none());
    }

    #[test]
    fn test_value_and_headers_roundtrip() {
        let record = record(
            Some(b"payload"),
            vec![("alpha", Some(b"one")), ("beta", None), ("gamma", Some(b""))],
        );
        let fields = RecordFieldSet::value_and_headers();
        let mut out = BytesMut::new();
        write_parcel(ParcelVersion::V1, fields, &record, &mut out).unwrap();
        assert_eq!(out.len(), size_of_parcel(ParcelVersion::V1, fields, &record));

        let contents = read_parcel(ParcelVersion::V1, &out).unwrap();
        assert_eq!(contents.value.as_deref(), Some(b"payload".as_ref()));
        let headers = contents.headers.unwrap();
        assert_eq!(headers.len(), 3);
        assert_eq!(
            headers
                .get(&StrBytes::from_static_str("alpha"))
                .unwrap()
                .as_deref(),
            Some(b"one".as_ref())
        );
        assert_eq!(
            headers.get(&StrBytes::from_static_str("beta")).unwrap(),
            &None
        );
        assert_eq!(
            headers
                .get(&StrBytes::from_static_str("gamma"))
                .unwrap()
                .as_deref(),
            Some(b"".as_ref())
        );
    }

    #[test]
    fn test_empty_value_roundtrip() {
        let record = record(Some(b""), vec![]);
        let fields = RecordFieldSet::value_only();
        let mut out = BytesMut::new();
        write_parcel(ParcelVersion::V1, fields, &record, &mut out).unwrap();
        let contents = read_parcel(ParcelVersion::V1, &out).unwrap();
        assert_eq!(contents.value.as_deref(), Some(b"".as_ref()));
    }

    #[test]
    fn test_truncated_parcel_is_rejected() {
        let record = record(Some(b"hello world"), vec![]);
        let mut out = BytesMut::new();
        write_parcel(ParcelVersion::V1, RecordFieldSet::value_only(), &record, &mut out).unwrap();
        assert!(read_parcel(ParcelVersion::V1, &out[..out.len() - 3]).is_err());
        assert!(read_parcel(ParcelVersion::V1, &[]).is_err());
    }

    #[test]
    fn test_unknown_field_bits_are_rejected() {
        let mut out = BytesMut::new();
        out.put_u8(1);
        out.put_u16(0b0100);
        assert!(read_parcel(ParcelVersion::V1, &out).is_err());
    }

    #[test]
    fn test_uvarint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64] {
            let mut out = BytesMut::new();
            put_uvarint(&mut out, value);
            assert_eq!(out.len(), size_of_uvarint(value));
            let mut pos = 0;
            assert_eq!(get_uvarint(&out, &mut pos).unwrap(), value);
            assert_eq!(pos, out.len());
        }
    }
}
