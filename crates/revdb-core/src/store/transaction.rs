//! Transactions: scoped, staged write contexts.
//!
//! Writes are staged in memory per store and assigned their sequence
//! numbers immediately, seeded from the store watermark. Nothing touches
//! the engine until `commit`, which applies the staging of every touched
//! store through one sled transaction spanning all of their record,
//! sequence-index, and watermark trees, so a commit that writes several
//! stores lands atomically. Aborting simply drops the staging, so
//! watermarks never move for writes that were never committed.

use std::collections::HashMap;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};

use super::keystore::{seq_key, KeyStore, StoredRecord};
use crate::error::{Error, Result};

#[derive(Debug)]
enum StagedOp {
    Set {
        key: Vec<u8>,
        sequence: u64,
        envelope: Vec<u8>,
    },
    Del {
        key: Vec<u8>,
    },
}

struct StoreTxn {
    store: KeyStore,
    base_sequence: u64,
    next_sequence: u64,
    ops: Vec<StagedOp>,
}

/// A write context over one database's stores.
///
/// Owned by the `Database` and created only at the outermost nesting
/// frame. Obtain a `KeyStoreWriter` through [`Transaction::writer`] to
/// stage writes.
#[derive(Default)]
pub struct Transaction {
    stores: HashMap<String, StoreTxn>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A write façade over the named store.
    pub fn writer(&mut self, store: &KeyStore) -> Result<KeyStoreWriter<'_>> {
        if !self.stores.contains_key(store.name()) {
            let base = store.last_sequence()?;
            self.stores.insert(
                store.name().to_string(),
                StoreTxn {
                    store: store.clone(),
                    base_sequence: base,
                    next_sequence: base,
                    ops: Vec::new(),
                },
            );
        }
        let txn = self
            .stores
            .get_mut(store.name())
            .ok_or_else(|| Error::unknown("store staging vanished"))?;
        Ok(KeyStoreWriter { txn })
    }

    /// Number of staged operations across all stores.
    pub(crate) fn staged_ops(&self) -> u64 {
        self.stores.values().map(|s| s.ops.len() as u64).sum()
    }

    /// Applies all staged writes across every touched store in a single
    /// engine transaction. Returns the number of records applied.
    pub(crate) fn commit(self) -> Result<u64> {
        let stores: Vec<StoreTxn> = self
            .stores
            .into_values()
            .filter(|s| !s.ops.is_empty())
            .collect();
        if stores.is_empty() {
            return Ok(0);
        }

        // Every store of a database shares the one watermark tree;
        // include it once, then each store's record and sequence trees.
        let watermarks = stores[0].store.watermarks.clone();
        let mut trees: Vec<&Tree> = Vec::with_capacity(1 + stores.len() * 2);
        trees.push(&watermarks);
        for store_txn in &stores {
            trees.push(&store_txn.store.records);
            trees.push(&store_txn.store.seq_index);
        }

        let result: std::result::Result<(), TransactionError<Error>> =
            trees.as_slice().transaction(|views| {
                let marks = &views[0];
                for (i, store_txn) in stores.iter().enumerate() {
                    let records = &views[1 + 2 * i];
                    let seqs = &views[2 + 2 * i];
                    let seq_enabled = store_txn.store.seq_enabled;
                    for op in &store_txn.ops {
                        match op {
                            StagedOp::Set {
                                key,
                                sequence,
                                envelope,
                            } => {
                                if seq_enabled {
                                    if let Some(old) = records.get(key.as_slice())? {
                                        let old = StoredRecord::from_bytes(&old)
                                            .map_err(ConflictableTransactionError::Abort)?;
                                        seqs.remove(&seq_key(old.sequence)[..])?;
                                    }
                                    seqs.insert(&seq_key(*sequence)[..], key.as_slice())?;
                                }
                                records.insert(key.as_slice(), envelope.clone())?;
                            }
                            StagedOp::Del { key } => {
                                if let Some(old) = records.get(key.as_slice())? {
                                    if seq_enabled {
                                        let old = StoredRecord::from_bytes(&old)
                                            .map_err(ConflictableTransactionError::Abort)?;
                                        seqs.remove(&seq_key(old.sequence)[..])?;
                                    }
                                    records.remove(key.as_slice())?;
                                }
                            }
                        }
                    }
                    if store_txn.next_sequence > store_txn.base_sequence {
                        marks.insert(
                            store_txn.store.name().as_bytes(),
                            &store_txn.next_sequence.to_be_bytes()[..],
                        )?;
                    }
                }
                Ok(())
            });

        match result {
            Ok(()) => Ok(stores.iter().map(|s| s.ops.len() as u64).sum()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Engine(e)),
        }
    }

    /// Discards all staged writes.
    pub(crate) fn abort(self) {
        drop(self.stores);
    }
}

/// Write façade for one store inside a transaction.
pub struct KeyStoreWriter<'a> {
    txn: &'a mut StoreTxn,
}

impl KeyStoreWriter<'_> {
    /// Claims the next sequence number without staging a write. Used when
    /// several logical revisions are persisted under one record.
    pub(crate) fn reserve_sequence(&mut self) -> u64 {
        self.txn.next_sequence += 1;
        self.txn.next_sequence
    }

    /// Stages a write of `(meta, body)` under `key`, returning the
    /// sequence the record will carry once committed.
    pub fn set(&mut self, key: &[u8], meta: &[u8], body: &[u8]) -> Result<u64> {
        let sequence = self.reserve_sequence();
        self.set_record(key, meta, body, false, sequence)?;
        Ok(sequence)
    }

    /// Stages a write with an explicit record-level deleted flag and an
    /// already-reserved sequence.
    pub(crate) fn set_record(
        &mut self,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
        deleted: bool,
        sequence: u64,
    ) -> Result<()> {
        let envelope = StoredRecord {
            meta: meta.to_vec(),
            body: body.to_vec(),
            sequence,
            deleted,
        }
        .to_bytes()?;
        self.txn.ops.push(StagedOp::Set {
            key: key.to_vec(),
            sequence,
            envelope,
        });
        Ok(())
    }

    /// Stages a removal of `key`.
    pub fn del(&mut self, key: &[u8]) {
        self.txn.ops.push(StagedOp::Del { key: key.to_vec() });
    }
}
