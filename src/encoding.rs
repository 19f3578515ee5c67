//! Canonical wire format for metric keys and shared-region records.
//!
//! Keys serialize to a deterministic, injective byte string: length-prefixed
//! fields with an explicit scalar discriminator per label value, all
//! little-endian. The storage layer treats encoded keys as opaque bytes; the
//! symmetric decoder is used during iteration and debugging.
//!
//! The shared region itself is laid out as a 14-byte header (`used` u32 at
//! offset 0, a 10-byte random `sign` at offset 4) followed by tightly packed
//! records of the form `key_len: u32 | key_bytes | value: f64`. Records are
//! self-delimiting; there is no alignment padding.

use bytes::{Buf, BufMut};

use crate::key::{Label, LabelValue, MetricKey, SampleKind};
use crate::{DecodeError, EncodeError};

/// Byte offset of the `used` header field.
pub const USED_OFFSET: usize = 0;
/// Width of the `used` header field.
pub const USED_LEN: usize = 4;
/// Byte offset of the `sign` header field.
pub const SIGN_OFFSET: usize = 4;
/// Width of the `sign` header field.
pub const SIGN_LEN: usize = 10;
/// Total header width; records start here.
pub const HEADER_LEN: usize = USED_LEN + SIGN_LEN;

/// Width of a record's `key_len` prefix.
pub const KEY_LEN_LEN: usize = 4;
/// Width of a record's value slot.
pub const VALUE_LEN: usize = 8;

const STR_TAG: u8 = 0;
const INT_TAG: u8 = 1;
const FLOAT_TAG: u8 = 2;

/// Returns the total on-region size of a record holding `key_len` key bytes.
#[inline]
pub fn record_len(key_len: usize) -> usize {
    KEY_LEN_LEN + key_len + VALUE_LEN
}

/// Encodes one record (`key_len`, key bytes, value) to the buffer.
#[inline]
pub fn encode_record(key: &[u8], value: f64, buf: &mut impl BufMut) {
    buf.put_u32_le(key.len() as u32);
    buf.put_slice(key);
    buf.put_f64_le(value);
}

fn put_len_prefixed(bytes: &[u8], buf: &mut impl BufMut) -> Result<(), EncodeError> {
    if bytes.len() > u16::MAX as usize {
        return Err(EncodeError::new(bytes.len(), u16::MAX as usize));
    }
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

fn encode_label_value(value: &LabelValue, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    match value {
        LabelValue::Str(s) => {
            buf.put_u8(STR_TAG);
            put_len_prefixed(s.as_bytes(), buf)?;
        }
        LabelValue::Int(i) => {
            buf.put_u8(INT_TAG);
            buf.put_i64_le(*i);
        }
        LabelValue::Float(f) => {
            buf.put_u8(FLOAT_TAG);
            buf.put_f64_le(*f);
        }
    }
    Ok(())
}

/// Serializes a structured key to its canonical byte form.
///
/// Two structurally equal keys yield byte-equal encodings across processes
/// and restarts. Fails with [`EncodeError`] if a field exceeds the width of
/// its length prefix.
pub fn encode_key(key: &MetricKey, buf: &mut impl BufMut) -> Result<(), EncodeError> {
    buf.put_u8(key.kind() as u8);
    put_len_prefixed(key.name().as_bytes(), buf)?;
    put_len_prefixed(key.postfix().as_bytes(), buf)?;
    if key.labels().len() > u16::MAX as usize {
        return Err(EncodeError::new(key.labels().len(), u16::MAX as usize));
    }
    buf.put_u16_le(key.labels().len() as u16);
    for label in key.labels() {
        put_len_prefixed(label.name.as_bytes(), buf)?;
        encode_label_value(&label.value, buf)?;
    }
    Ok(())
}

/// Serializes a structured key to a newly allocated byte string.
pub fn encode_key_to_vec(key: &MetricKey) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::with_capacity(32);
    encode_key(key, &mut buf)?;
    Ok(buf)
}

fn get_len_prefixed(buf: &mut impl Buf) -> Result<Vec<u8>, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::new("buffer underflow"));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::new("buffer underflow"));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn get_string(buf: &mut impl Buf) -> Result<String, DecodeError> {
    String::from_utf8(get_len_prefixed(buf)?)
        .map_err(|_| DecodeError::new("invalid string value: data is not UTF-8 encoded"))
}

fn decode_label_value(buf: &mut impl Buf) -> Result<LabelValue, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::new("buffer underflow"));
    }
    match buf.get_u8() {
        STR_TAG => Ok(LabelValue::Str(get_string(buf)?)),
        INT_TAG => {
            if buf.remaining() < 8 {
                return Err(DecodeError::new("buffer underflow"));
            }
            Ok(LabelValue::Int(buf.get_i64_le()))
        }
        FLOAT_TAG => {
            if buf.remaining() < 8 {
                return Err(DecodeError::new("buffer underflow"));
            }
            Ok(LabelValue::Float(buf.get_f64_le()))
        }
        tag => Err(DecodeError::new(format!(
            "invalid label value discriminator: {tag}"
        ))),
    }
}

/// Decodes a structured key from its canonical byte form.
///
/// The entire buffer must be consumed; trailing bytes are an error since no
/// valid encoding has them.
pub fn decode_key(mut buf: impl Buf) -> Result<MetricKey, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::new("buffer underflow"));
    }
    let kind = SampleKind::try_from(buf.get_u8())?;
    let name = get_string(&mut buf)?;
    let postfix = get_string(&mut buf)?;
    if buf.remaining() < 2 {
        return Err(DecodeError::new("buffer underflow"));
    }
    let count = buf.get_u16_le() as usize;
    let mut labels = Vec::with_capacity(count);
    for _ in 0..count {
        let label_name = get_string(&mut buf)?;
        let value = decode_label_value(&mut buf)?;
        labels.push(Label { name: label_name, value });
    }
    if buf.has_remaining() {
        return Err(DecodeError::new("trailing bytes after key"));
    }
    Ok(MetricKey::from_parts(kind, name, postfix, labels))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::key::BUCKET_LABEL;

    #[test]
    fn key_encoding_is_byte_exact() {
        let key = MetricKey::new(
            SampleKind::Counter,
            "req",
            "",
            vec![Label::new("code", LabelValue::Int(200))],
        );
        let bytes = encode_key_to_vec(&key).unwrap();
        let expected: Vec<u8> = [
            &[3u8][..],
            &[3, 0][..],
            b"req",
            &[0, 0][..],
            &[1, 0][..],
            &[4, 0][..],
            b"code",
            &[INT_TAG][..],
            &200u64.to_le_bytes()[..],
        ]
        .concat();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn key_roundtrip() {
        let key = MetricKey::new(
            SampleKind::Gauge,
            "metric_gauge_name",
            "",
            vec![
                Label::new("label1", "value1"),
                Label::new("label2", "value2"),
            ],
        );
        let bytes = encode_key_to_vec(&key).unwrap();
        assert_eq!(decode_key(&bytes[..]).unwrap(), key);
    }

    #[test]
    fn bucket_key_roundtrip_keeps_threshold_first() {
        let key = MetricKey::bucket("h", f64::INFINITY, vec![Label::new("l", "v")]);
        let bytes = encode_key_to_vec(&key).unwrap();
        let decoded = decode_key(&bytes[..]).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(decoded.labels()[0].name, BUCKET_LABEL);
    }

    #[test]
    fn oversized_field_fails() {
        let key = MetricKey::new(
            SampleKind::Counter,
            "x".repeat(u16::MAX as usize + 1),
            "",
            vec![],
        );
        let err = encode_key_to_vec(&key).unwrap_err();
        assert_eq!(err.max_len(), u16::MAX as usize);
    }

    #[test]
    fn truncated_key_fails() {
        let key = MetricKey::new(SampleKind::Counter, "req", "", vec![]);
        let bytes = encode_key_to_vec(&key).unwrap();
        for cut in 0..bytes.len() {
            assert!(decode_key(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn record_layout() {
        let mut buf = Vec::new();
        encode_record(b"keyname", 0.0, &mut buf);
        assert_eq!(buf.len(), record_len(7));
        assert_eq!(buf.len(), 19);
        assert_eq!(&buf[..4], &7u32.to_le_bytes());
        assert_eq!(&buf[4..11], b"keyname");
        assert_eq!(&buf[11..19], &0.0f64.to_le_bytes());
    }

    fn label_value_strategy() -> impl Strategy<Value = LabelValue> {
        prop_oneof![
            "[a-z0-9_./-]{0,12}".prop_map(LabelValue::Str),
            any::<i64>().prop_map(LabelValue::Int),
            any::<f64>().prop_map(LabelValue::Float),
        ]
    }

    proptest! {
        #[test]
        fn check_roundtrip(
            name in "[a-z_][a-z0-9_:]{0,24}",
            postfix in prop_oneof![
                Just(String::new()),
                Just("_sum".to_owned()),
                Just("_count".to_owned()),
            ],
            labels in proptest::collection::vec(
                ("[a-z_][a-z0-9_]{0,12}", label_value_strategy()),
                0..4,
            ),
        ) {
            let labels = labels
                .into_iter()
                .map(|(n, v)| Label { name: n, value: v })
                .collect();
            let key = MetricKey::new(SampleKind::Counter, name, postfix, labels);
            let bytes = encode_key_to_vec(&key).unwrap();
            prop_assert_eq!(decode_key(&bytes[..]).unwrap(), key);
        }
    }
}
