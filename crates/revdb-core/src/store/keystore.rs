//! Named ordered key stores.
//!
//! A `KeyStore` is a named mapping from byte keys to `(meta, body)` record
//! pairs, each write stamped with a per-store monotonically increasing
//! sequence. It is backed by two sled trees: `<name>` holds the record
//! envelopes, `<name>.seq` maps big-endian sequence numbers back to keys.
//! Store watermarks share one tree so they never pollute key enumeration.

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tree holding the last-sequence watermark of every store.
const WATERMARKS_TREE: &str = "__watermarks";

/// Suffix of the sequence-index tree backing a store.
const SEQ_TREE_SUFFIX: &str = ".seq";

/// On-disk record envelope.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
    pub sequence: u64,
    pub deleted: bool,
}

impl StoredRecord {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Corrupt(format!("record encoding failed: {e}")))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Corrupt(format!("record decoding failed: {e}")))
    }
}

/// A record read from a key store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub meta: Vec<u8>,
    pub body: Vec<u8>,
    pub sequence: u64,
    pub deleted: bool,
}

impl Record {
    pub(crate) fn from_stored(key: Vec<u8>, stored: StoredRecord) -> Self {
        Self {
            key,
            meta: stored.meta,
            body: stored.body,
            sequence: stored.sequence,
            deleted: stored.deleted,
        }
    }
}

/// Encodes a sequence number as a big-endian sequence-index key.
#[inline]
pub(crate) fn seq_key(sequence: u64) -> [u8; 8] {
    sequence.to_be_bytes()
}

/// A handle on one named store. Handles are cheap clones of the
/// underlying tree references.
#[derive(Clone)]
pub struct KeyStore {
    name: String,
    pub(crate) records: sled::Tree,
    pub(crate) seq_index: sled::Tree,
    pub(crate) watermarks: sled::Tree,
    pub(crate) seq_enabled: bool,
}

impl KeyStore {
    pub(crate) fn open(db: &sled::Db, name: &str, seq_enabled: bool) -> Result<Self> {
        if name.is_empty() || name.starts_with("__") || name.ends_with(SEQ_TREE_SUFFIX) {
            return Err(Error::BadRequest(format!("invalid store name: {name:?}")));
        }
        let records = db.open_tree(name)?;
        let seq_index = db.open_tree(format!("{name}{SEQ_TREE_SUFFIX}"))?;
        let watermarks = db.open_tree(WATERMARKS_TREE)?;
        Ok(Self {
            name: name.to_string(),
            records,
            seq_index,
            watermarks,
            seq_enabled,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sequence watermark: the highest sequence committed to this store.
    pub fn last_sequence(&self) -> Result<u64> {
        match self.watermarks.get(self.name.as_bytes())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Corrupt("invalid sequence watermark".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Fetch a record by key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        match self.records.get(key)? {
            Some(bytes) => {
                let stored = StoredRecord::from_bytes(&bytes)?;
                Ok(Some(Record::from_stored(key.to_vec(), stored)))
            }
            None => Ok(None),
        }
    }

    /// Fetch a record by the sequence it was last written at.
    pub fn get_by_sequence(&self, sequence: u64) -> Result<Option<Record>> {
        if !self.seq_enabled {
            return Err(Error::Unsupported(
                "sequence index disabled for this database".into(),
            ));
        }
        let key = match self.seq_index.get(seq_key(sequence))? {
            Some(key) => key.to_vec(),
            None => return Ok(None),
        };
        match self.get(&key)? {
            // A sequence entry pointing at a record with a newer sequence is
            // stale; the write path removes these, so treat it as corruption.
            Some(record) if record.sequence == sequence => Ok(Some(record)),
            Some(_) => Err(Error::Corrupt("stale sequence index entry".into())),
            None => Err(Error::Corrupt("dangling sequence index entry".into())),
        }
    }
}
