//! Collation encoding: a bytewise-sortable tuple codec.
//!
//! Values are encoded with one tag byte per type, chosen so that comparing
//! two encoded tuples byte-by-byte gives the same ordering as comparing the
//! logical tuples field-by-field. The expiry index relies on this to turn a
//! time-bounded sweep into a plain key-range scan.
//!
//! Doubles use the IEEE 754 sortable transform: negative values have all
//! bits flipped, positive values only the sign bit, so the big-endian bytes
//! order numerically. Strings are terminated with a 0x00 byte, which orders
//! a prefix before its extensions; container end markers are 0xFF so a
//! truncated tuple (used as a range bound) orders after every completed
//! tuple sharing its prefix.

use crate::error::{Error, Result};

/// Type tag preceding each encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Double = 0x03,
    String = 0x05,
    Array = 0x06,
    Map = 0x07,
}

/// Terminates string payloads.
const STRING_END: u8 = 0x00;

/// Terminates arrays and maps.
const CONTAINER_END: u8 = 0xff;

/// Encodes an f64 so its big-endian bytes sort in numeric order.
#[inline]
const fn encode_f64_sortable(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits ^ 0x8000_0000_0000_0000
    }
}

#[inline]
const fn decode_f64_sortable(sortable: u64) -> f64 {
    let bits = if sortable & 0x8000_0000_0000_0000 != 0 {
        sortable ^ 0x8000_0000_0000_0000
    } else {
        !sortable
    };
    f64::from_bits(bits)
}

/// Builds a collation-encoded byte sequence.
#[derive(Debug, Default)]
pub struct CollatableBuilder {
    buf: Vec<u8>,
}

impl CollatableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_array(&mut self) -> &mut Self {
        self.buf.push(Tag::Array as u8);
        self
    }

    pub fn end_array(&mut self) -> &mut Self {
        self.buf.push(CONTAINER_END);
        self
    }

    pub fn begin_map(&mut self) -> &mut Self {
        self.buf.push(Tag::Map as u8);
        self
    }

    pub fn end_map(&mut self) -> &mut Self {
        self.buf.push(CONTAINER_END);
        self
    }

    pub fn add_double(&mut self, value: f64) -> &mut Self {
        self.buf.push(Tag::Double as u8);
        self.buf
            .extend_from_slice(&encode_f64_sortable(value).to_be_bytes());
        self
    }

    /// Appends a string value. The payload must not contain the 0x00
    /// terminator byte.
    pub fn add_string(&mut self, value: &[u8]) -> Result<&mut Self> {
        if value.contains(&STRING_END) {
            return Err(Error::BadRequest(
                "string value may not contain a NUL byte".into(),
            ));
        }
        self.buf.push(Tag::String as u8);
        self.buf.extend_from_slice(value);
        self.buf.push(STRING_END);
        Ok(self)
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Parses a collation-encoded byte sequence.
#[derive(Debug)]
pub struct CollatableReader<'a> {
    buf: &'a [u8],
}

impl<'a> CollatableReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// The tag of the next value, if any.
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    fn expect(&mut self, byte: u8, what: &str) -> Result<()> {
        match self.buf.first() {
            Some(&b) if b == byte => {
                self.buf = &self.buf[1..];
                Ok(())
            }
            _ => Err(Error::Corrupt(format!("expected {what} in collatable key"))),
        }
    }

    /// Skips a single container-open tag (array or map).
    pub fn skip_tag(&mut self) -> Result<()> {
        match self.buf.first() {
            Some(&b) if b == Tag::Array as u8 || b == Tag::Map as u8 => {
                self.buf = &self.buf[1..];
                Ok(())
            }
            _ => Err(Error::Corrupt("expected container tag".into())),
        }
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.expect(Tag::Double as u8, "double tag")?;
        if self.buf.len() < 8 {
            return Err(Error::Corrupt("truncated double".into()));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[..8]);
        self.buf = &self.buf[8..];
        Ok(decode_f64_sortable(u64::from_be_bytes(raw)))
    }

    /// Skips an empty map (`beginMap` immediately followed by `endMap`).
    pub fn skip_empty_map(&mut self) -> Result<()> {
        self.expect(Tag::Map as u8, "map tag")?;
        self.expect(CONTAINER_END, "map end")
    }

    pub fn read_string(&mut self) -> Result<&'a [u8]> {
        self.expect(Tag::String as u8, "string tag")?;
        let end = self
            .buf
            .iter()
            .position(|&b| b == STRING_END)
            .ok_or_else(|| Error::Corrupt("unterminated string".into()))?;
        let value = &self.buf[..end];
        self.buf = &self.buf[end + 1..];
        Ok(value)
    }

    pub fn skip_container_end(&mut self) -> Result<()> {
        self.expect(CONTAINER_END, "container end")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expiry_key(ts: f64, doc_id: &[u8]) -> Vec<u8> {
        let mut b = CollatableBuilder::new();
        b.begin_array();
        b.add_double(ts);
        b.begin_map();
        b.end_map();
        b.add_string(doc_id).unwrap();
        b.end_array();
        b.into_bytes()
    }

    #[test]
    fn test_double_roundtrip() {
        for v in [-1e12, -1.5, -0.0, 0.0, 0.25, 1.0, 1466864350.0, 1e300] {
            let mut b = CollatableBuilder::new();
            b.add_double(v);
            let mut r = CollatableReader::new(b.data());
            assert_eq!(r.read_double().unwrap(), v);
        }
    }

    #[test]
    fn test_expiry_key_decodes() {
        let key = expiry_key(1466864350.0, b"doc1");
        let mut r = CollatableReader::new(&key);
        r.skip_tag().unwrap();
        assert_eq!(r.read_double().unwrap(), 1466864350.0);
        r.skip_empty_map().unwrap();
        assert_eq!(r.read_string().unwrap(), b"doc1");
        r.skip_container_end().unwrap();
    }

    #[test]
    fn test_timestamp_orders_before_doc_id() {
        let a = expiry_key(100.0, b"zzz");
        let b = expiry_key(200.0, b"aaa");
        assert!(a < b);
    }

    #[test]
    fn test_doc_id_breaks_timestamp_ties() {
        let a = expiry_key(100.0, b"aaa");
        let b = expiry_key(100.0, b"aab");
        assert!(a < b);
    }

    #[test]
    fn test_truncated_bound_covers_equal_timestamps() {
        // The range bound used by the expiry sweep: an array holding only
        // the timestamp and the reserved map. Every complete key with the
        // same timestamp must order below it.
        let mut bound = CollatableBuilder::new();
        bound.begin_array();
        bound.add_double(100.0);
        bound.begin_map();
        bound.end_map();
        bound.end_array();
        let bound = bound.into_bytes();

        let same_ts = expiry_key(100.0, b"any-doc-id");
        let later = expiry_key(100.5, b"a");
        assert!(same_ts < bound);
        assert!(expiry_key(99.0, b"zzz") < same_ts);
        assert!(later > bound);
    }

    #[test]
    fn test_nul_in_string_rejected() {
        let mut b = CollatableBuilder::new();
        assert!(b.add_string(b"bad\0id").is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn double_roundtrip(value in prop::num::f64::NORMAL | prop::num::f64::ZERO) {
            let mut b = CollatableBuilder::new();
            b.add_double(value);
            let mut r = CollatableReader::new(b.data());
            prop_assert_eq!(r.read_double().unwrap(), value);
        }

        #[test]
        fn encoded_order_matches_tuple_order(
            ts_a in -1.0e15f64..1.0e15,
            ts_b in -1.0e15f64..1.0e15,
            id_a in "[a-z]{1,12}",
            id_b in "[a-z]{1,12}",
        ) {
            let key = |ts: f64, id: &str| {
                let mut b = CollatableBuilder::new();
                b.begin_array();
                b.add_double(ts);
                b.begin_map();
                b.end_map();
                b.add_string(id.as_bytes()).unwrap();
                b.end_array();
                b.into_bytes()
            };
            let ka = key(ts_a, &id_a);
            let kb = key(ts_b, &id_b);
            // The double encoding realizes IEEE 754 total order.
            let logical = ts_a
                .total_cmp(&ts_b)
                .then(id_a.as_bytes().cmp(id_b.as_bytes()));
            prop_assert_eq!(ka.cmp(&kb), logical);
        }
    }
}
