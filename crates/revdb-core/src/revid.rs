//! Revision identifiers.
//!
//! A revision id pairs a generation number with an opaque digest. The ASCII
//! form is `<gen>-<digest>` (e.g. `2-bb87a380`); the compact binary form is
//! a varint generation followed by the digest bytes, and is what the
//! serialized rev-tree stores.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};
use crate::varint::{get_uvarint, put_uvarint};

/// A parsed, immutable revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId {
    generation: u64,
    digest: Vec<u8>,
}

impl RevId {
    /// Parses the ASCII form `<gen>-<digest>`.
    pub fn parse(ascii: &[u8]) -> Result<Self> {
        let sep = ascii
            .iter()
            .position(|&b| b == b'-')
            .ok_or_else(|| malformed(ascii))?;
        let (gen_part, digest_part) = (&ascii[..sep], &ascii[sep + 1..]);
        if gen_part.is_empty() || gen_part.len() > 19 || !gen_part.iter().all(u8::is_ascii_digit) {
            return Err(malformed(ascii));
        }
        let mut generation = 0u64;
        for &b in gen_part {
            generation = generation * 10 + u64::from(b - b'0');
        }
        if generation == 0 {
            return Err(malformed(ascii));
        }
        Self::from_parts(generation, digest_part.to_vec()).map_err(|_| malformed(ascii))
    }

    /// Parses the compact binary form `<varint gen><digest>`.
    pub fn from_compact(bytes: &[u8]) -> Result<Self> {
        let (generation, consumed) = get_uvarint(bytes)
            .ok_or_else(|| Error::Corrupt("truncated revision id".into()))?;
        Self::from_parts(generation, bytes[consumed..].to_vec())
            .map_err(|_| Error::Corrupt("invalid stored revision id".into()))
    }

    fn from_parts(generation: u64, digest: Vec<u8>) -> Result<Self> {
        if generation == 0
            || digest.is_empty()
            || !digest.iter().all(u8::is_ascii_alphanumeric)
        {
            return Err(Error::BadRequest("invalid revision id".into()));
        }
        Ok(Self { generation, digest })
    }

    /// Encodes the compact binary form.
    pub fn to_compact(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + self.digest.len());
        put_uvarint(&mut buf, self.generation);
        buf.extend_from_slice(&self.digest);
        buf
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }
}

fn malformed(ascii: &[u8]) -> Error {
    Error::BadRequest(format!(
        "malformed revision id: {:?}",
        String::from_utf8_lossy(ascii)
    ))
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.generation,
            String::from_utf8_lossy(&self.digest)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ascii() {
        let rev = RevId::parse(b"2-bb87a380").unwrap();
        assert_eq!(rev.generation(), 2);
        assert_eq!(rev.digest(), b"bb87a380");
        assert_eq!(rev.to_string(), "2-bb87a380");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            &b""[..],
            b"1",
            b"-aa",
            b"0-aa",
            b"1-",
            b"x-aa",
            b"1-a b",
            b"12345678901234567890-aa",
        ] {
            assert!(matches!(RevId::parse(bad), Err(Error::BadRequest(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_compact_roundtrip() {
        for ascii in [&b"1-aa"[..], b"300-deadbeef", b"2-xx"] {
            let rev = RevId::parse(ascii).unwrap();
            let compact = rev.to_compact();
            assert_eq!(RevId::from_compact(&compact).unwrap(), rev);
        }
    }

    #[test]
    fn test_ordering_generation_first() {
        let r1 = RevId::parse(b"1-zz").unwrap();
        let r2 = RevId::parse(b"2-aa").unwrap();
        assert!(r1 < r2);
    }

    #[test]
    fn test_ordering_digest_breaks_ties() {
        let bb = RevId::parse(b"2-bb").unwrap();
        let xx = RevId::parse(b"2-xx").unwrap();
        assert!(bb < xx);
    }
}
