//! Versioned documents.
//!
//! A `VersionedDocument` is the in-memory form of one logical document: its
//! id, revision tree, aggregate flags, and doc type. It serializes to a
//! single store record under the document id, with the rev-tree as the
//! record's metadata blob and the winning revision's body as the record
//! body. Mutations stay in memory until `save` stages them into a
//! transaction.

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::revid::RevId;
use crate::revtree::{RevBody, RevTree, Revision};
use crate::store::{KeyStore, Record, Transaction};
use crate::varint::put_uvarint;

/// Bodies up to this size stay inline with the document metadata; larger
/// ones go to the body-overflow store.
pub(crate) const MAX_INLINE_BODY_SIZE: usize = 4096;

/// Key of an overflow body: the document id followed by the varint
/// sequence of the revision that owns the body.
pub(crate) fn overflow_key(doc_id: &[u8], sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_id.len() + 10);
    key.extend_from_slice(doc_id);
    put_uvarint(&mut key, sequence);
    key
}

/// Aggregate document flags, recomputed from the revision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentFlags {
    /// The document has been saved (or was loaded from the store).
    pub exists: bool,
    /// The winning revision is a deletion.
    pub deleted: bool,
    /// More than one non-deleted leaf.
    pub conflicted: bool,
    /// Some leaf revision carries attachments.
    pub has_attachments: bool,
}

/// Persisted body location of one revision.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
enum MetaBody {
    Absent,
    Inline(Vec<u8>),
    InRecord,
    External,
}

/// Persisted form of one revision node.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
struct MetaRev {
    rev_id: Vec<u8>,
    parent: Option<u32>,
    sequence: u64,
    deleted: bool,
    leaf: bool,
    has_attachments: bool,
    body: MetaBody,
}

/// The opaque metadata blob stored with a document record.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
struct MetaBlob {
    doc_type: Option<Vec<u8>>,
    revs: Vec<MetaRev>,
}

impl MetaBlob {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Corrupt(format!("rev-tree encoding failed: {e}")))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Corrupt(format!("rev-tree decoding failed: {e}")))
    }
}

/// Overflow-store keys still referenced by leaf revisions of the given
/// document record. Bodies of interior revisions are fair game for the
/// compaction sweep.
pub(crate) fn live_overflow_keys(record: &Record) -> Result<Vec<Vec<u8>>> {
    let blob = MetaBlob::from_bytes(&record.meta)?;
    Ok(blob
        .revs
        .iter()
        .filter(|r| r.leaf && r.body == MetaBody::External)
        .map(|r| overflow_key(&record.key, r.sequence))
        .collect())
}

/// One logical document with its revision tree.
#[derive(Debug, Clone)]
pub struct VersionedDocument {
    doc_id: Vec<u8>,
    tree: RevTree,
    flags: DocumentFlags,
    doc_type: Option<Vec<u8>>,
    sequence: u64,
    dirty: bool,
    /// Loaded without the record body (meta-only); such a document cannot
    /// be mutated and saved.
    partial: bool,
}

impl VersionedDocument {
    /// An empty document that does not exist in the store yet.
    pub(crate) fn empty(doc_id: Vec<u8>) -> Self {
        Self {
            doc_id,
            tree: RevTree::new(),
            flags: DocumentFlags::default(),
            doc_type: None,
            sequence: 0,
            dirty: false,
            partial: false,
        }
    }

    /// Rebuilds a document from its store record. `full` says whether the
    /// record carries its body (meta-only enumerations pass `false`).
    pub(crate) fn from_record(record: &Record, full: bool) -> Result<Self> {
        let blob = MetaBlob::from_bytes(&record.meta)?;
        let mut tree = RevTree::new();
        for meta_rev in &blob.revs {
            let parent = match meta_rev.parent {
                Some(p) if (p as usize) < blob.revs.len() => Some(p as usize),
                Some(_) => return Err(Error::Corrupt("revision parent out of range".into())),
                None => None,
            };
            let body = match &meta_rev.body {
                MetaBody::Absent => RevBody::Absent,
                MetaBody::Inline(bytes) => RevBody::Inline(bytes.clone()),
                MetaBody::InRecord if full => RevBody::Inline(record.body.clone()),
                MetaBody::InRecord => RevBody::InRecord,
                MetaBody::External => RevBody::External,
            };
            tree.push_loaded(
                RevId::from_compact(&meta_rev.rev_id)?,
                parent,
                meta_rev.sequence,
                meta_rev.deleted,
                meta_rev.leaf,
                meta_rev.has_attachments,
                body,
            );
        }

        let mut doc = Self {
            doc_id: record.key.clone(),
            tree,
            flags: DocumentFlags::default(),
            doc_type: blob.doc_type,
            sequence: record.sequence,
            dirty: false,
            partial: !full,
        };
        doc.update_flags();
        doc.flags.exists = true;
        Ok(doc)
    }

    pub fn doc_id(&self) -> &[u8] {
        &self.doc_id
    }

    pub fn flags(&self) -> DocumentFlags {
        self.flags
    }

    pub fn doc_type(&self) -> Option<&[u8]> {
        self.doc_type.as_deref()
    }

    /// The sequence of the winning revision as of the last save.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn exists(&self) -> bool {
        self.flags.exists
    }

    pub fn tree(&self) -> &RevTree {
        &self.tree
    }

    /// Index of the current (winning) revision.
    pub fn current_index(&self) -> Option<usize> {
        self.tree.current_index()
    }

    /// The current revision's id, or `None` for an empty document.
    pub fn rev_id(&self) -> Option<&RevId> {
        self.current_index()
            .and_then(|i| self.tree.get(i))
            .map(|r| r.rev_id())
    }

    pub fn revision(&self, index: usize) -> Option<&Revision> {
        self.tree.get(index)
    }

    pub fn set_doc_type(&mut self, doc_type: Option<&[u8]>) {
        self.doc_type = doc_type.map(|t| t.to_vec());
        self.dirty = true;
    }

    /// Inserts a revision as a child of the revision at `parent`.
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Vec<u8>,
        deleted: bool,
        has_attachments: bool,
        parent: Option<usize>,
        allow_conflict: bool,
    ) -> Result<usize> {
        self.ensure_mutable()?;
        let index =
            self.tree
                .insert(rev_id, body, deleted, has_attachments, parent, allow_conflict)?;
        self.mark_changed();
        Ok(index)
    }

    /// Grafts a newest-to-oldest revision history; see
    /// [`RevTree::insert_history`].
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Vec<u8>,
        deleted: bool,
        has_attachments: bool,
    ) -> Result<usize> {
        self.ensure_mutable()?;
        let common = self
            .tree
            .insert_history(history, body, deleted, has_attachments)?;
        if common > 0 {
            self.mark_changed();
        }
        Ok(common)
    }

    /// Prunes ancestry deeper than `max_depth` below the nearest leaf.
    pub fn prune(&mut self, max_depth: u64) -> usize {
        let removed = self.tree.prune(max_depth);
        if removed > 0 {
            self.dirty = true;
            self.update_flags();
        }
        removed
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.partial {
            return Err(Error::BadRequest(
                "document was loaded without its body and cannot be mutated".into(),
            ));
        }
        Ok(())
    }

    fn mark_changed(&mut self) {
        self.dirty = true;
        self.update_flags();
        self.flags.exists = true;
    }

    fn update_flags(&mut self) {
        let winner = self.tree.current_index();
        self.flags.deleted = winner
            .and_then(|i| self.tree.get(i))
            .is_some_and(|r| r.is_deleted());
        self.flags.conflicted = self.tree.is_conflicted();
        self.flags.has_attachments = self.tree.any_leaf_has_attachments();
    }

    /// Stages this document into `txn`. Idempotent when clean.
    ///
    /// New revisions are assigned sequences in insertion order and the
    /// winner's sequence becomes the document's. Bodies that no longer
    /// belong inline (large, or owned by a revision that stopped being a
    /// leaf) are staged into the body-overflow store.
    pub(crate) fn save(
        &mut self,
        txn: &mut Transaction,
        docs: &KeyStore,
        bodies: &KeyStore,
    ) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.ensure_mutable()?;

        {
            let mut writer = txn.writer(docs)?;
            for rev in self.tree.revisions_mut() {
                if rev.is_new() {
                    rev.sequence = writer.reserve_sequence();
                }
            }
        }

        let winner = self.tree.current_index();
        let mut record_body: Vec<u8> = Vec::new();
        let mut metas = Vec::with_capacity(self.tree.len());
        let mut relocated: Vec<(usize, u64, Vec<u8>)> = Vec::new();

        for (index, rev) in self.tree.revisions().enumerate() {
            let meta_body = match rev.body() {
                RevBody::Inline(bytes) => {
                    if Some(index) == winner && bytes.len() <= MAX_INLINE_BODY_SIZE {
                        record_body = bytes.clone();
                        MetaBody::InRecord
                    } else if rev.is_leaf() && bytes.len() <= MAX_INLINE_BODY_SIZE {
                        MetaBody::Inline(bytes.clone())
                    } else {
                        relocated.push((index, rev.sequence(), bytes.clone()));
                        MetaBody::External
                    }
                }
                RevBody::InRecord => MetaBody::InRecord,
                RevBody::External => MetaBody::External,
                RevBody::Absent => MetaBody::Absent,
            };
            metas.push(MetaRev {
                rev_id: rev.rev_id().to_compact(),
                parent: rev.parent().map(|p| p as u32),
                sequence: rev.sequence(),
                deleted: rev.is_deleted(),
                leaf: rev.is_leaf(),
                has_attachments: rev.has_attachments(),
                body: meta_body,
            });
        }

        if !relocated.is_empty() {
            let mut writer = txn.writer(bodies)?;
            for (index, sequence, bytes) in relocated {
                writer.set(&overflow_key(&self.doc_id, sequence), &[], &bytes)?;
                if let Some(rev) = self.tree.get_mut(index) {
                    rev.body = RevBody::External;
                }
            }
        }

        let winner_rev = winner.and_then(|i| self.tree.get(i));
        let deleted = winner_rev.is_some_and(|r| r.is_deleted());
        self.sequence = winner_rev.map_or(0, |r| r.sequence());

        let blob = MetaBlob {
            doc_type: self.doc_type.clone(),
            revs: metas,
        };
        let meta_bytes = blob.to_bytes()?;
        txn.writer(docs)?
            .set_record(&self.doc_id, &meta_bytes, &record_body, deleted, self.sequence)?;

        for rev in self.tree.revisions_mut() {
            rev.new = false;
        }
        self.dirty = false;
        self.flags.exists = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevId {
        RevId::parse(s.as_bytes()).unwrap()
    }

    fn stores() -> (sled::Db, KeyStore, KeyStore) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let docs = KeyStore::open(&db, "docs", true).unwrap();
        let bodies = KeyStore::open(&db, "bodies", true).unwrap();
        (db, docs, bodies)
    }

    fn save(doc: &mut VersionedDocument, docs: &KeyStore, bodies: &KeyStore) {
        let mut txn = Transaction::new();
        doc.save(&mut txn, docs, bodies).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_save_and_reload() {
        let (_db, docs, bodies) = stores();
        let mut doc = VersionedDocument::empty(b"a".to_vec());
        doc.insert(rev("1-aa"), b"{}".to_vec(), false, false, None, false)
            .unwrap();
        doc.set_doc_type(Some(b"note"));
        save(&mut doc, &docs, &bodies);

        assert!(!doc.is_dirty());
        assert_eq!(doc.sequence(), 1);
        assert_eq!(docs.last_sequence().unwrap(), 1);

        let record = docs.get(b"a").unwrap().unwrap();
        let loaded = VersionedDocument::from_record(&record, true).unwrap();
        assert!(loaded.exists());
        assert!(!loaded.is_dirty());
        assert_eq!(loaded.rev_id().unwrap(), &rev("1-aa"));
        assert_eq!(loaded.doc_type(), Some(&b"note"[..]));
        assert_eq!(loaded.sequence(), 1);
        let winner = loaded.current_index().unwrap();
        assert_eq!(
            loaded.revision(winner).unwrap().body().inline(),
            Some(&b"{}"[..])
        );
    }

    #[test]
    fn test_save_clean_is_noop() {
        let (_db, docs, bodies) = stores();
        let mut doc = VersionedDocument::empty(b"a".to_vec());
        doc.insert(rev("1-aa"), b"{}".to_vec(), false, false, None, false)
            .unwrap();
        save(&mut doc, &docs, &bodies);
        save(&mut doc, &docs, &bodies);
        assert_eq!(docs.last_sequence().unwrap(), 1);
    }

    #[test]
    fn test_chain_save_assigns_increasing_sequences() {
        let (_db, docs, bodies) = stores();
        let mut doc = VersionedDocument::empty(b"a".to_vec());
        let root = doc
            .insert(rev("1-aa"), b"{}".to_vec(), false, false, None, false)
            .unwrap();
        let mid = doc
            .insert(rev("2-bb"), b"{}".to_vec(), false, false, Some(root), false)
            .unwrap();
        doc.insert(rev("3-cc"), b"{}".to_vec(), false, false, Some(mid), false)
            .unwrap();
        save(&mut doc, &docs, &bodies);

        assert_eq!(doc.sequence(), 3);
        assert_eq!(docs.last_sequence().unwrap(), 3);
        let record = docs.get(b"a").unwrap().unwrap();
        assert_eq!(record.sequence, 3);

        let loaded = VersionedDocument::from_record(&record, true).unwrap();
        let seqs: Vec<u64> = loaded.tree().revisions().map(|r| r.sequence()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_deleted_winner_marks_record_deleted() {
        let (_db, docs, bodies) = stores();
        let mut doc = VersionedDocument::empty(b"a".to_vec());
        let root = doc
            .insert(rev("1-aa"), b"{}".to_vec(), false, false, None, false)
            .unwrap();
        doc.insert(rev("2-bb"), Vec::new(), true, false, Some(root), false)
            .unwrap();
        assert!(doc.flags().deleted);
        save(&mut doc, &docs, &bodies);

        let record = docs.get(b"a").unwrap().unwrap();
        assert!(record.deleted);
    }

    #[test]
    fn test_large_winner_body_goes_to_overflow() {
        let (_db, docs, bodies) = stores();
        let big = vec![0x42u8; MAX_INLINE_BODY_SIZE + 1];
        let mut doc = VersionedDocument::empty(b"a".to_vec());
        doc.insert(rev("1-aa"), big.clone(), false, false, None, false)
            .unwrap();
        save(&mut doc, &docs, &bodies);

        let record = docs.get(b"a").unwrap().unwrap();
        assert!(record.body.is_empty());
        let overflow = bodies.get(&overflow_key(b"a", 1)).unwrap().unwrap();
        assert_eq!(overflow.body, big);

        let loaded = VersionedDocument::from_record(&record, true).unwrap();
        let winner = loaded.current_index().unwrap();
        assert_eq!(loaded.revision(winner).unwrap().body(), &RevBody::External);
    }

    #[test]
    fn test_parent_body_relocates_when_no_longer_leaf() {
        let (_db, docs, bodies) = stores();
        let mut doc = VersionedDocument::empty(b"a".to_vec());
        doc.insert(rev("1-aa"), b"{\"v\":1}".to_vec(), false, false, None, false)
            .unwrap();
        save(&mut doc, &docs, &bodies);

        let record = docs.get(b"a").unwrap().unwrap();
        let mut doc = VersionedDocument::from_record(&record, true).unwrap();
        let root = doc.current_index().unwrap();
        doc.insert(rev("2-bb"), b"{\"v\":2}".to_vec(), false, false, Some(root), false)
            .unwrap();
        save(&mut doc, &docs, &bodies);

        // The old winner's body is now reachable only through the
        // overflow store, under the sequence it was saved at.
        let overflow = bodies.get(&overflow_key(b"a", 1)).unwrap().unwrap();
        assert_eq!(overflow.body, b"{\"v\":1}");

        let record = docs.get(b"a").unwrap().unwrap();
        assert_eq!(record.body, b"{\"v\":2}");
        let loaded = VersionedDocument::from_record(&record, true).unwrap();
        let old = loaded.tree().find(&rev("1-aa")).unwrap();
        assert_eq!(loaded.revision(old).unwrap().body(), &RevBody::External);
    }

    #[test]
    fn test_meta_only_document_rejects_mutation() {
        let (_db, docs, bodies) = stores();
        let mut doc = VersionedDocument::empty(b"a".to_vec());
        doc.insert(rev("1-aa"), b"{}".to_vec(), false, false, None, false)
            .unwrap();
        save(&mut doc, &docs, &bodies);

        let record = docs.get(b"a").unwrap().unwrap();
        let mut partial = VersionedDocument::from_record(&record, false).unwrap();
        let root = partial.current_index();
        let err = partial
            .insert(rev("2-bb"), b"{}".to_vec(), false, false, root, false)
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_pruned_revisions_do_not_reach_disk() {
        let (_db, docs, bodies) = stores();
        let mut doc = VersionedDocument::empty(b"a".to_vec());
        let mut parent = None;
        for id in ["1-aa", "2-bb", "3-cc", "4-dd"] {
            parent = Some(
                doc.insert(rev(id), b"{}".to_vec(), false, false, parent, false)
                    .unwrap(),
            );
        }
        doc.prune(2);
        save(&mut doc, &docs, &bodies);

        let record = docs.get(b"a").unwrap().unwrap();
        let loaded = VersionedDocument::from_record(&record, true).unwrap();
        assert_eq!(loaded.tree().len(), 2);
        assert!(loaded.tree().find(&rev("3-cc")).is_some());
        assert!(loaded.tree().find(&rev("4-dd")).is_some());
        assert!(loaded.tree().find(&rev("1-aa")).is_none());
    }
}
