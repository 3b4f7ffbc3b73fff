//! Document expiration: a time-indexed sweep over the `expiry` store.
//!
//! The index is bi-directional. Forward keys are collation-encoded
//! `[timestamp, {}, doc id]` tuples mapping to empty markers, so a plain
//! key-range scan up to `now` yields exactly the expired ids in timestamp
//! order. Reverse records map each raw doc id to its current forward key,
//! which is how a re-set expiration finds and replaces the stale entry.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::collatable::{CollatableBuilder, CollatableReader, Tag};
use crate::database::{Database, EXPIRY_STORE};
use crate::error::Result;
use crate::store::{ContentOption, DocEnumerator, EnumeratorOptions};

/// Seconds since the Unix epoch.
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Encodes the forward index key for `(timestamp, doc_id)`.
fn forward_key(timestamp: u64, doc_id: &[u8]) -> Result<Vec<u8>> {
    let mut builder = CollatableBuilder::new();
    builder.begin_array();
    builder.add_double(timestamp as f64);
    builder.begin_map();
    builder.end_map();
    builder.add_string(doc_id)?;
    builder.end_array();
    Ok(builder.into_bytes())
}

/// Encodes the range bound covering every forward key with a timestamp at
/// or below `timestamp`: the tuple truncated after the reserved map.
fn range_bound(timestamp: u64) -> Vec<u8> {
    let mut builder = CollatableBuilder::new();
    builder.begin_array();
    builder.add_double(timestamp as f64);
    builder.begin_map();
    builder.end_map();
    builder.end_array();
    builder.into_bytes()
}

/// Decodes a forward key back to `(timestamp, doc_id)`.
fn decode_forward_key(key: &[u8]) -> Result<(u64, Vec<u8>)> {
    let mut reader = CollatableReader::new(key);
    reader.skip_tag()?;
    let timestamp = reader.read_double()? as u64;
    reader.skip_empty_map()?;
    let doc_id = reader.read_string()?.to_vec();
    reader.skip_container_end()?;
    Ok((timestamp, doc_id))
}

/// One expired entry: the decoded doc id and the raw forward key to
/// delete.
#[derive(Debug, Clone)]
struct ExpiredEntry {
    doc_id: Vec<u8>,
    key: Vec<u8>,
}

fn collect_expired(db: &Database, end_timestamp: u64) -> Result<VecDeque<ExpiredEntry>> {
    let expiry = db.key_store(EXPIRY_STORE)?;
    let bound = range_bound(end_timestamp);
    let options = EnumeratorOptions {
        include_deleted: true,
        content: ContentOption::MetaOnly,
        ..Default::default()
    };
    let mut e = DocEnumerator::by_key_range(&expiry, None, Some(&bound), options);
    let mut entries = VecDeque::new();
    while let Some(record) = e.next()? {
        if record.key.first() != Some(&(Tag::Array as u8)) {
            // Reverse records (raw doc ids) can stray into the range when
            // an id happens to sort below the bound; they are not index
            // entries.
            continue;
        }
        match decode_forward_key(&record.key) {
            Ok((_, doc_id)) => entries.push_back(ExpiredEntry {
                doc_id,
                key: record.key,
            }),
            Err(_) => continue,
        }
    }
    Ok(entries)
}

/// Iterates the doc ids whose expiration timestamp is at or below the
/// `now` captured at construction (or the latest `reset`). The range is
/// snapshotted eagerly, so purging while iterating never observes its own
/// deletes.
pub struct ExpiryEnumerator<'db> {
    db: &'db Database,
    end_timestamp: u64,
    entries: VecDeque<ExpiredEntry>,
    current: Option<ExpiredEntry>,
}

impl<'db> ExpiryEnumerator<'db> {
    pub(crate) fn new(db: &'db Database) -> Result<Self> {
        let mut enumerator = Self {
            db,
            end_timestamp: now_secs(),
            entries: VecDeque::new(),
            current: None,
        };
        enumerator.entries = collect_expired(db, enumerator.end_timestamp)?;
        Ok(enumerator)
    }

    /// Advances to the next expired entry; false at the end.
    pub fn next(&mut self) -> bool {
        self.current = self.entries.pop_front();
        self.current.is_some()
    }

    /// The current entry's doc id.
    pub fn doc_id(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.doc_id.as_slice())
    }

    /// The current entry's raw index key.
    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.key.as_slice())
    }

    /// The `now` snapshot this enumeration is bounded by.
    pub fn end_timestamp(&self) -> u64 {
        self.end_timestamp
    }

    /// Rebuilds the enumeration against a fresh `now` snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.end_timestamp = now_secs();
        self.entries = collect_expired(self.db, self.end_timestamp)?;
        self.current = None;
        Ok(())
    }

    /// Deletes every expired entry, forward and reverse, within one
    /// transaction. Commits on success, aborts on failure. Returns the
    /// number of documents purged.
    pub fn purge(&mut self) -> Result<u64> {
        let db = self.db;
        db.begin_transaction()?;
        let result = (|| {
            self.reset()?;
            let expiry = db.key_store(EXPIRY_STORE)?;
            let entries = std::mem::take(&mut self.entries);
            db.with_writer(&expiry, |writer| {
                let mut count = 0u64;
                for entry in &entries {
                    writer.del(&entry.key);
                    writer.del(&entry.doc_id);
                    count += 1;
                }
                Ok(count)
            })
        })();
        match result {
            Ok(count) => {
                db.end_transaction(true)?;
                debug!(count, "purged expired documents");
                Ok(count)
            }
            Err(e) => {
                let _ = db.end_transaction(false);
                Err(e)
            }
        }
    }
}

impl Database {
    /// Records (or replaces) the expiration timestamp of a document id.
    pub fn set_expiration(&self, doc_id: &[u8], timestamp: u64) -> Result<()> {
        let forward = forward_key(timestamp, doc_id)?;
        let expiry = self.key_store(EXPIRY_STORE)?;
        let previous = expiry.get(doc_id)?.map(|record| record.body);

        self.begin_transaction()?;
        let result = self.with_writer(&expiry, |writer| {
            if let Some(old_forward) = &previous {
                writer.del(old_forward);
            }
            writer.set(&forward, &[], &[])?;
            writer.set(doc_id, &[], &forward)?;
            Ok(())
        });
        match result {
            Ok(()) => self.end_transaction(true),
            Err(e) => {
                self.end_transaction(false)?;
                Err(e)
            }
        }
    }

    /// The expiration timestamp recorded for a document id, if any.
    pub fn expiration_of(&self, doc_id: &[u8]) -> Result<Option<u64>> {
        let expiry = self.key_store(EXPIRY_STORE)?;
        match expiry.get(doc_id)? {
            Some(record) => {
                let (timestamp, _) = decode_forward_key(&record.body)?;
                Ok(Some(timestamp))
            }
            None => Ok(None),
        }
    }

    /// Enumerates documents whose expiration is due as of now.
    pub fn enumerate_expired(&self) -> Result<ExpiryEnumerator<'_>> {
        ExpiryEnumerator::new(self)
    }

    /// Purges every due expiry entry; see [`ExpiryEnumerator::purge`].
    pub fn purge_expired(&self) -> Result<u64> {
        self.enumerate_expired()?.purge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DatabaseConfig;

    fn open_db() -> Database {
        Database::open_with_config(DatabaseConfig::temporary()).unwrap()
    }

    fn expiry_count(db: &Database) -> usize {
        let expiry = db.key_store(EXPIRY_STORE).unwrap();
        let options = EnumeratorOptions {
            include_deleted: true,
            ..Default::default()
        };
        let mut e = DocEnumerator::by_key_range(&expiry, None, None, options);
        let mut count = 0;
        while e.next().unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[test]
    fn test_forward_key_roundtrip() {
        let key = forward_key(1466864350, b"doc1").unwrap();
        let (ts, doc_id) = decode_forward_key(&key).unwrap();
        assert_eq!(ts, 1466864350);
        assert_eq!(doc_id, b"doc1");
    }

    #[test]
    fn test_enumerates_only_due_entries() {
        let db = open_db();
        let now = now_secs();
        db.set_expiration(b"a", now - 10).unwrap();
        db.set_expiration(b"b", now + 1000).unwrap();

        let mut e = db.enumerate_expired().unwrap();
        assert!(e.next());
        assert_eq!(e.doc_id().unwrap(), b"a");
        assert!(!e.next());
    }

    #[test]
    fn test_entries_yield_in_timestamp_order() {
        let db = open_db();
        let now = now_secs();
        db.set_expiration(b"late", now - 1).unwrap();
        db.set_expiration(b"early", now - 500).unwrap();
        db.set_expiration(b"mid", now - 50).unwrap();

        let mut e = db.enumerate_expired().unwrap();
        let mut order = Vec::new();
        while e.next() {
            order.push(e.doc_id().unwrap().to_vec());
        }
        assert_eq!(order, vec![b"early".to_vec(), b"mid".to_vec(), b"late".to_vec()]);
    }

    #[test]
    fn test_purge_removes_forward_and_reverse() {
        let db = open_db();
        let now = now_secs();
        db.set_expiration(b"a", now - 10).unwrap();
        db.set_expiration(b"b", now + 1000).unwrap();
        assert_eq!(expiry_count(&db), 4);

        let purged = db.purge_expired().unwrap();
        assert_eq!(purged, 1);

        // Only the unexpired doc's forward and reverse entries remain.
        assert_eq!(expiry_count(&db), 2);
        assert_eq!(db.expiration_of(b"a").unwrap(), None);
        assert_eq!(db.expiration_of(b"b").unwrap(), Some(now + 1000));
    }

    #[test]
    fn test_reset_expiration_replaces_entry() {
        let db = open_db();
        db.set_expiration(b"a", 100).unwrap();
        db.set_expiration(b"a", 200).unwrap();

        assert_eq!(db.expiration_of(b"a").unwrap(), Some(200));
        // One forward plus one reverse entry; the stale forward key is
        // gone.
        assert_eq!(expiry_count(&db), 2);
    }

    #[test]
    fn test_expiration_of_unknown_doc() {
        let db = open_db();
        assert_eq!(db.expiration_of(b"nope").unwrap(), None);
    }
}
