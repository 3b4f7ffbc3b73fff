//! Ordered enumeration over a key store.

use std::ops::Bound;

use super::keystore::{seq_key, KeyStore, Record, StoredRecord};
use crate::error::{Error, Result};

/// How much of each record an enumerator materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentOption {
    /// Meta and body.
    #[default]
    Full,
    /// Meta only; bodies are left empty.
    MetaOnly,
}

/// Enumeration options.
#[derive(Debug, Clone)]
pub struct EnumeratorOptions {
    /// Number of matching records to drop before yielding.
    pub skip: usize,
    /// Iterate from the start bound downward.
    pub descending: bool,
    /// Whether the end bound itself is yielded.
    pub inclusive_end: bool,
    /// Whether records whose deleted flag is set are yielded.
    pub include_deleted: bool,
    pub content: ContentOption,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        Self {
            skip: 0,
            descending: false,
            inclusive_end: true,
            include_deleted: false,
            content: ContentOption::Full,
        }
    }
}

enum Source {
    /// Iterating record keys directly.
    Keys(sled::Iter),
    /// Iterating the sequence index; values are record keys.
    Sequences(sled::Iter),
}

/// Lazy iterator over the records of one store, by key range or by
/// sequence range. Reaching the end is not an error.
pub struct DocEnumerator {
    source: Source,
    records: sled::Tree,
    options: EnumeratorOptions,
    to_skip: usize,
}

fn end_bound(end: Option<&[u8]>, inclusive: bool) -> Bound<Vec<u8>> {
    match end {
        None => Bound::Unbounded,
        Some(key) if inclusive => Bound::Included(key.to_vec()),
        Some(key) => Bound::Excluded(key.to_vec()),
    }
}

fn start_bound(start: Option<&[u8]>) -> Bound<Vec<u8>> {
    match start {
        None => Bound::Unbounded,
        Some(key) => Bound::Included(key.to_vec()),
    }
}

impl DocEnumerator {
    /// Enumerates `[start, end]` in key order. `None` bounds are open.
    /// When descending, iteration begins at `start` and walks down to
    /// `end`.
    pub fn by_key_range(
        store: &KeyStore,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        options: EnumeratorOptions,
    ) -> Self {
        let range = if options.descending {
            (end_bound(end, options.inclusive_end), start_bound(start))
        } else {
            (start_bound(start), end_bound(end, options.inclusive_end))
        };
        let to_skip = options.skip;
        Self {
            source: Source::Keys(store.records.range::<Vec<u8>, _>(range)),
            records: store.records.clone(),
            options,
            to_skip,
        }
    }

    /// Enumerates records whose sequence falls in `[start, end]`. As with
    /// key ranges, a descending enumeration begins at `start` and walks
    /// down to `end`.
    pub fn by_sequence_range(
        store: &KeyStore,
        start: u64,
        end: u64,
        options: EnumeratorOptions,
    ) -> Result<Self> {
        if !store.seq_enabled {
            return Err(Error::Unsupported(
                "sequence index disabled for this database".into(),
            ));
        }
        let start_key = seq_key(start).to_vec();
        let end_key = seq_key(end).to_vec();
        let range = if options.descending {
            (
                end_bound(Some(&end_key), options.inclusive_end),
                Bound::Included(start_key),
            )
        } else {
            (
                Bound::Included(start_key),
                end_bound(Some(&end_key), options.inclusive_end),
            )
        };
        let to_skip = options.skip;
        Ok(Self {
            source: Source::Sequences(store.seq_index.range::<Vec<u8>, _>(range)),
            records: store.records.clone(),
            options,
            to_skip,
        })
    }

    /// The next matching record, or `None` at the end of the range.
    pub fn next(&mut self) -> Result<Option<Record>> {
        loop {
            let descending = self.options.descending;
            let item = match &mut self.source {
                Source::Keys(iter) | Source::Sequences(iter) => {
                    if descending {
                        iter.next_back()
                    } else {
                        iter.next()
                    }
                }
            };
            let (key, value) = match item {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(pair)) => pair,
            };

            let mut record = match &self.source {
                Source::Keys(_) => {
                    let stored = StoredRecord::from_bytes(&value)?;
                    Record::from_stored(key.to_vec(), stored)
                }
                Source::Sequences(_) => {
                    let raw: [u8; 8] = key
                        .as_ref()
                        .try_into()
                        .map_err(|_| Error::Corrupt("invalid sequence index key".into()))?;
                    let sequence = u64::from_be_bytes(raw);
                    let stored = match self.records.get(&value)? {
                        Some(bytes) => StoredRecord::from_bytes(&bytes)?,
                        None => {
                            return Err(Error::Corrupt("dangling sequence index entry".into()))
                        }
                    };
                    if stored.sequence != sequence {
                        return Err(Error::Corrupt("stale sequence index entry".into()));
                    }
                    Record::from_stored(value.to_vec(), stored)
                }
            };

            if !self.options.include_deleted && record.deleted {
                continue;
            }
            if self.to_skip > 0 {
                self.to_skip -= 1;
                continue;
            }
            if self.options.content == ContentOption::MetaOnly {
                record.body.clear();
            }
            return Ok(Some(record));
        }
    }
}
