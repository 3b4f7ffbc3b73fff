//! The database handle: named stores, nested transactions, documents,
//! and enumeration entry points.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::document::{live_overflow_keys, DocumentFlags, VersionedDocument};
use crate::error::{Error, Result};
use crate::revid::RevId;
use crate::revtree::{RevBody, Revision};
use crate::store::{
    ContentOption, DatabaseConfig, DocEnumerator, EnumeratorOptions, KeyStore, KeyStoreWriter,
    Record, Transaction,
};

/// Store holding document records.
pub(crate) const DEFAULT_STORE: &str = "docs";

/// Store holding overflow revision bodies under `doc_id ‖ varint(seq)`.
pub(crate) const BODIES_STORE: &str = "bodies";

/// Store holding the expiry index.
pub(crate) const EXPIRY_STORE: &str = "expiry";

/// Result of an overflow-body sweep.
#[derive(Debug, Clone, Default)]
pub struct CompactionResult {
    /// Overflow bodies no longer referenced by a leaf revision.
    pub bodies_removed: u64,
    /// Duration of the sweep.
    pub duration: Duration,
}

struct DbInner {
    stores: HashMap<String, KeyStore>,
    txn: Option<Transaction>,
    txn_depth: u32,
    commit_on_end: bool,
    last_compact_probe: Instant,
}

/// A handle on one database: a default document store plus named
/// auxiliary stores, with a nested-transaction counter.
///
/// All public operations serialize on an internal per-database mutex, so
/// a `Database` can be shared across threads; transactions themselves
/// must still be serialized by the caller.
pub struct Database {
    db: sled::Db,
    config: DatabaseConfig,
    inner: Mutex<DbInner>,
}

impl Database {
    /// Opens (or, unless read-only, creates) the database at `path`.
    pub fn open(path: impl Into<std::path::PathBuf>, read_only: bool) -> Result<Self> {
        Self::open_with_config(DatabaseConfig::new(path).read_only(read_only))
    }

    /// Opens a database with explicit configuration.
    pub fn open_with_config(config: DatabaseConfig) -> Result<Self> {
        if config.read_only && !config.temporary && !config.path.exists() {
            return Err(Error::NotFound);
        }
        let db = config.to_sled_config().open()?;
        let database = Self {
            db,
            config,
            inner: Mutex::new(DbInner {
                stores: HashMap::new(),
                txn: None,
                txn_depth: 0,
                commit_on_end: true,
                last_compact_probe: Instant::now(),
            }),
        };
        // Open the built-in stores eagerly so open reports corruption
        // up front.
        for name in [DEFAULT_STORE, BODIES_STORE, EXPIRY_STORE] {
            database.key_store(name)?;
        }
        debug!(path = %database.config.path.display(), "database opened");
        Ok(database)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Closes the database, flushing buffered writes.
    ///
    /// # Panics
    /// Panics if a transaction is still open.
    pub fn close(self) -> Result<()> {
        {
            let inner = self.inner.lock();
            assert!(
                inner.txn_depth == 0,
                "database closed with an open transaction"
            );
        }
        self.db.flush()?;
        Ok(())
    }

    /// Handle on a named store, opened on first use.
    pub fn key_store(&self, name: &str) -> Result<KeyStore> {
        let mut inner = self.inner.lock();
        self.key_store_locked(&mut inner, name)
    }

    fn key_store_locked(&self, inner: &mut DbInner, name: &str) -> Result<KeyStore> {
        if let Some(store) = inner.stores.get(name) {
            return Ok(store.clone());
        }
        let store = KeyStore::open(&self.db, name, self.config.sequence_index)?;
        inner.stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    /// The default store's sequence watermark.
    pub fn last_sequence(&self) -> Result<u64> {
        self.key_store(DEFAULT_STORE)?.last_sequence()
    }

    /// Number of documents whose winning revision is not a deletion.
    pub fn document_count(&self) -> Result<u64> {
        let docs = self.key_store(DEFAULT_STORE)?;
        let options = EnumeratorOptions {
            content: ContentOption::MetaOnly,
            include_deleted: false,
            ..Default::default()
        };
        let mut e = DocEnumerator::by_key_range(&docs, None, None, options);
        let mut count = 0;
        while e.next()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.lock().txn_depth > 0
    }

    /// Enters a transaction frame. Only the outermost frame creates the
    /// write context; nesting is a counter.
    pub fn begin_transaction(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let mut inner = self.inner.lock();
        inner.txn_depth += 1;
        if inner.txn_depth == 1 {
            inner.txn = Some(Transaction::new());
            inner.commit_on_end = true;
        }
        Ok(())
    }

    /// Leaves a transaction frame. A nested `commit = false` poisons the
    /// outer frame; the actual commit or abort happens when the depth
    /// returns to zero.
    ///
    /// # Panics
    /// Panics when no transaction is open.
    pub fn end_transaction(&self, commit: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        assert!(inner.txn_depth > 0, "end_transaction without begin");
        if !commit {
            inner.commit_on_end = false;
        }
        inner.txn_depth -= 1;
        if inner.txn_depth > 0 {
            return Ok(());
        }
        let txn = inner
            .txn
            .take()
            .ok_or_else(|| Error::unknown("transaction missing at depth 0"))?;
        if !inner.commit_on_end {
            txn.abort();
            return Ok(());
        }
        let staged = txn.staged_ops();
        txn.commit()?;
        if self.config.flush_before_commit || staged >= self.config.wal_threshold {
            self.db.flush()?;
        }
        if inner.last_compact_probe.elapsed() >= self.config.compactor_interval {
            inner.last_compact_probe = Instant::now();
            match self.compact_locked(&mut inner) {
                Ok(result) if result.bodies_removed > 0 => {
                    info!(bodies_removed = result.bodies_removed, "auto-compaction ran");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "auto-compaction failed"),
            }
        }
        Ok(())
    }

    /// Runs `f` with a writer on `store` inside the current transaction.
    ///
    /// # Panics
    /// Panics when no transaction is open; writes outside a transaction
    /// are a programming error.
    pub(crate) fn with_writer<T>(
        &self,
        store: &KeyStore,
        f: impl FnOnce(&mut KeyStoreWriter<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        assert!(inner.txn_depth > 0, "write outside a transaction");
        let txn = inner
            .txn
            .as_mut()
            .ok_or_else(|| Error::unknown("transaction missing at depth > 0"))?;
        let mut writer = txn.writer(store)?;
        f(&mut writer)
    }

    // ---- Raw records ----

    /// Fetches an opaque record from a named store.
    pub fn raw_get(&self, store_name: &str, key: &[u8]) -> Result<Record> {
        self.key_store(store_name)?
            .get(key)?
            .ok_or(Error::NotFound)
    }

    /// Writes an opaque record in its own transaction. Empty meta and
    /// empty body together delete the record.
    pub fn raw_put(&self, store_name: &str, key: &[u8], meta: &[u8], body: &[u8]) -> Result<()> {
        let store = self.key_store(store_name)?;
        self.begin_transaction()?;
        let result = self.with_writer(&store, |writer| {
            if meta.is_empty() && body.is_empty() {
                writer.del(key);
            } else {
                writer.set(key, meta, body)?;
            }
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

    // ---- Documents ----

    /// Loads the document stored under `doc_id`, or an empty in-memory
    /// document when it is absent and `must_exist` is false.
    pub fn get_document(&self, doc_id: &[u8], must_exist: bool) -> Result<Document<'_>> {
        let docs = self.key_store(DEFAULT_STORE)?;
        let versioned = match docs.get(doc_id)? {
            Some(record) => VersionedDocument::from_record(&record, true)?,
            None if must_exist => return Err(Error::NotFound),
            None => VersionedDocument::empty(doc_id.to_vec()),
        };
        Ok(Document::new(self, versioned))
    }

    /// Wraps a record yielded by an enumerator. `full` must reflect the
    /// enumerator's content option: meta-only records produce documents
    /// that can be inspected but not mutated.
    pub fn document_from_record(&self, record: &Record, full: bool) -> Result<Document<'_>> {
        let versioned = VersionedDocument::from_record(record, full)?;
        Ok(Document::new(self, versioned))
    }

    /// Documents changed since `since` (exclusive), in sequence order.
    pub fn enumerate_changes(&self, since: u64, with_bodies: bool) -> Result<DocEnumerator> {
        let docs = self.key_store(DEFAULT_STORE)?;
        let options = EnumeratorOptions {
            inclusive_end: true,
            include_deleted: false,
            content: if with_bodies {
                ContentOption::Full
            } else {
                ContentOption::MetaOnly
            },
            ..Default::default()
        };
        DocEnumerator::by_sequence_range(&docs, since.saturating_add(1), u64::MAX, options)
    }

    /// All documents in id order within `[start, end]`.
    pub fn enumerate_all_docs(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        options: EnumeratorOptions,
    ) -> Result<DocEnumerator> {
        let docs = self.key_store(DEFAULT_STORE)?;
        Ok(DocEnumerator::by_key_range(&docs, start, end, options))
    }

    // ---- Compaction ----

    /// Sweeps the body-overflow store, deleting bodies no longer
    /// referenced by any leaf revision. Runs automatically when a commit
    /// lands after the configured probe interval has elapsed.
    #[instrument(skip(self))]
    pub fn compact(&self) -> Result<CompactionResult> {
        let mut inner = self.inner.lock();
        if inner.txn_depth > 0 {
            return Err(Error::BadRequest(
                "compaction cannot run inside a transaction".into(),
            ));
        }
        let result = self.compact_locked(&mut inner)?;
        if result.bodies_removed > 0 {
            info!(
                bodies_removed = result.bodies_removed,
                duration_ms = result.duration.as_millis() as u64,
                "compaction completed"
            );
        }
        Ok(result)
    }

    fn compact_locked(&self, inner: &mut DbInner) -> Result<CompactionResult> {
        let start = Instant::now();
        let docs = self.key_store_locked(inner, DEFAULT_STORE)?;
        let bodies = self.key_store_locked(inner, BODIES_STORE)?;

        let mut live: HashSet<Vec<u8>> = HashSet::new();
        let options = EnumeratorOptions {
            include_deleted: true,
            content: ContentOption::MetaOnly,
            ..Default::default()
        };
        let mut e = DocEnumerator::by_key_range(&docs, None, None, options);
        while let Some(record) = e.next()? {
            live.extend(live_overflow_keys(&record)?);
        }

        let mut txn = Transaction::new();
        let mut removed = 0u64;
        {
            let mut writer = txn.writer(&bodies)?;
            let options = EnumeratorOptions {
                include_deleted: true,
                content: ContentOption::MetaOnly,
                ..Default::default()
            };
            let mut e = DocEnumerator::by_key_range(&bodies, None, None, options);
            while let Some(record) = e.next()? {
                if !live.contains(&record.key) {
                    writer.del(&record.key);
                    removed += 1;
                }
            }
        }
        txn.commit()?;
        self.db.flush()?;

        Ok(CompactionResult {
            bodies_removed: removed,
            duration: start.elapsed(),
        })
    }
}

/// A document handle with a selected-revision cursor, borrowed from its
/// database.
pub struct Document<'db> {
    db: &'db Database,
    doc: VersionedDocument,
    selected: Option<usize>,
}

impl<'db> Document<'db> {
    fn new(db: &'db Database, doc: VersionedDocument) -> Self {
        let selected = doc.current_index();
        Self { db, doc, selected }
    }

    pub fn doc_id(&self) -> &[u8] {
        self.doc.doc_id()
    }

    /// The current (winning) revision's id.
    pub fn rev_id(&self) -> Option<&RevId> {
        self.doc.rev_id()
    }

    pub fn flags(&self) -> DocumentFlags {
        self.doc.flags()
    }

    pub fn exists(&self) -> bool {
        self.doc.exists()
    }

    pub fn sequence(&self) -> u64 {
        self.doc.sequence()
    }

    pub fn doc_type(&self) -> Option<&[u8]> {
        self.doc.doc_type()
    }

    /// Sets the doc type; persisted with the next save.
    ///
    /// # Panics
    /// Panics when no transaction is open.
    pub fn set_doc_type(&mut self, doc_type: Option<&[u8]>) {
        assert!(
            self.db.in_transaction(),
            "document mutation outside a transaction"
        );
        self.doc.set_doc_type(doc_type);
    }

    pub fn versioned(&self) -> &VersionedDocument {
        &self.doc
    }

    // ---- Revision selection ----

    pub fn selected(&self) -> Option<&Revision> {
        self.selected.and_then(|i| self.doc.revision(i))
    }

    pub fn selected_rev_id(&self) -> Option<&RevId> {
        self.selected().map(|r| r.rev_id())
    }

    /// Selects the winning revision. Returns false on an empty document.
    pub fn select_current(&mut self) -> bool {
        self.selected = self.doc.current_index();
        self.selected.is_some()
    }

    /// Selects the revision with the given id.
    pub fn select_revision(&mut self, rev_id: &RevId) -> Result<()> {
        match self.doc.tree().find(rev_id) {
            Some(index) => {
                self.selected = Some(index);
                Ok(())
            }
            None => {
                self.selected = None;
                Err(Error::NotFound)
            }
        }
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    /// Moves the cursor to the parent revision.
    pub fn select_parent(&mut self) -> bool {
        self.selected = self
            .selected
            .and_then(|i| self.doc.revision(i))
            .and_then(|r| r.parent());
        self.selected.is_some()
    }

    /// Moves the cursor to the pre-order successor.
    pub fn select_next(&mut self) -> bool {
        self.selected = self
            .selected
            .and_then(|i| self.doc.tree().next_in_preorder(i));
        self.selected.is_some()
    }

    /// Moves the cursor forward to the next leaf revision.
    pub fn select_next_leaf(&mut self, include_deleted: bool) -> bool {
        self.selected = self
            .selected
            .and_then(|i| self.doc.tree().next_leaf(i, include_deleted));
        self.selected.is_some()
    }

    /// The selected revision's body, loading it from the store when it is
    /// not inline. A body that was compacted away reports `Gone`.
    pub fn load_body(&self) -> Result<Vec<u8>> {
        match self.selected {
            Some(index) => self.body_at(index),
            None => Err(Error::NotFound),
        }
    }

    fn body_at(&self, index: usize) -> Result<Vec<u8>> {
        let (body, sequence) = match self.doc.revision(index) {
            Some(rev) => (rev.body().clone(), rev.sequence()),
            None => return Err(Error::NotFound),
        };
        match body {
            RevBody::Inline(bytes) => Ok(bytes),
            RevBody::InRecord => {
                let docs = self.db.key_store(DEFAULT_STORE)?;
                match docs.get(self.doc.doc_id())? {
                    Some(record) => Ok(record.body),
                    None => Err(Error::Gone),
                }
            }
            RevBody::External => {
                let bodies = self.db.key_store(BODIES_STORE)?;
                let key = crate::document::overflow_key(self.doc.doc_id(), sequence);
                match bodies.get(&key)? {
                    Some(record) => Ok(record.body),
                    None => Err(Error::Gone),
                }
            }
            RevBody::Absent => Err(Error::Gone),
        }
    }

    // ---- Mutation ----

    /// Inserts a revision as a child of the selected revision and selects
    /// it. Re-inserting an existing id is idempotent success when the
    /// stored body matches, and a conflict when it differs.
    ///
    /// # Panics
    /// Panics when no transaction is open.
    pub fn insert_revision(
        &mut self,
        rev_id: RevId,
        body: Vec<u8>,
        deleted: bool,
        has_attachments: bool,
        allow_conflict: bool,
    ) -> Result<()> {
        assert!(
            self.db.in_transaction(),
            "document mutation outside a transaction"
        );
        if let Some(existing) = self.doc.tree().find(&rev_id) {
            return match self.body_at(existing) {
                Ok(stored) if stored == body => {
                    self.selected = Some(existing);
                    Ok(())
                }
                Ok(_) => Err(Error::Conflict),
                // A compacted-away body cannot be compared; the id match
                // decides.
                Err(Error::Gone) => {
                    self.selected = Some(existing);
                    Ok(())
                }
                Err(e) => Err(e),
            };
        }
        let index = self.doc.insert(
            rev_id,
            body,
            deleted,
            has_attachments,
            self.selected,
            allow_conflict,
        )?;
        self.selected = Some(index);
        Ok(())
    }

    /// Grafts a newest-to-oldest history onto the tree, returning the
    /// common-ancestor index, and selects the newest revision.
    ///
    /// # Panics
    /// Panics when no transaction is open.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Vec<u8>,
        deleted: bool,
        has_attachments: bool,
    ) -> Result<usize> {
        assert!(
            self.db.in_transaction(),
            "document mutation outside a transaction"
        );
        let common = self
            .doc
            .insert_history(history, body, deleted, has_attachments)?;
        if let Some(newest) = history.first() {
            self.selected = self.doc.tree().find(newest);
        }
        Ok(common)
    }

    /// Prunes the tree to `max_depth` and stages the document into the
    /// open transaction. Pruning invalidates the cursor, which is moved
    /// back to the winning revision.
    ///
    /// # Panics
    /// Panics when no transaction is open.
    pub fn save(&mut self, max_depth: u64) -> Result<()> {
        let mut inner = self.db.inner.lock();
        assert!(inner.txn_depth > 0, "document save outside a transaction");
        self.doc.prune(max_depth);
        let docs = self.db.key_store_locked(&mut inner, DEFAULT_STORE)?;
        let bodies = self.db.key_store_locked(&mut inner, BODIES_STORE)?;
        let txn = inner
            .txn
            .as_mut()
            .ok_or_else(|| Error::unknown("transaction missing at depth > 0"))?;
        self.doc.save(txn, &docs, &bodies)?;
        self.selected = self.doc.current_index();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revid::RevId;

    fn rev(s: &str) -> RevId {
        RevId::parse(s.as_bytes()).unwrap()
    }

    fn open_db() -> Database {
        Database::open_with_config(DatabaseConfig::temporary()).unwrap()
    }

    #[test]
    fn test_get_missing_document() {
        let db = open_db();
        assert!(matches!(
            db.get_document(b"nope", true),
            Err(Error::NotFound)
        ));
        let doc = db.get_document(b"nope", false).unwrap();
        assert!(!doc.exists());
        assert!(doc.rev_id().is_none());
    }

    #[test]
    fn test_insert_save_reload() {
        let db = open_db();
        db.begin_transaction().unwrap();
        let mut doc = db.get_document(b"a", false).unwrap();
        doc.insert_revision(rev("1-aa"), b"{}".to_vec(), false, false, false)
            .unwrap();
        doc.save(20).unwrap();
        db.end_transaction(true).unwrap();

        assert_eq!(db.document_count().unwrap(), 1);
        assert_eq!(db.last_sequence().unwrap(), 1);

        let mut doc = db.get_document(b"a", true).unwrap();
        assert_eq!(doc.rev_id().unwrap(), &rev("1-aa"));
        assert!(doc.exists());
        assert_eq!(doc.sequence(), 1);
        assert_eq!(doc.load_body().unwrap(), b"{}");
    }

    #[test]
    fn test_nested_transaction_abort_poisons_outer() {
        let db = open_db();
        db.begin_transaction().unwrap();
        {
            let mut doc = db.get_document(b"a", false).unwrap();
            doc.insert_revision(rev("1-aa"), b"{}".to_vec(), false, false, false)
                .unwrap();
            doc.save(20).unwrap();
        }
        db.begin_transaction().unwrap();
        db.end_transaction(false).unwrap();
        db.end_transaction(true).unwrap();

        assert_eq!(db.document_count().unwrap(), 0);
        assert_eq!(db.last_sequence().unwrap(), 0);
        assert!(!db.in_transaction());
    }

    #[test]
    #[should_panic(expected = "end_transaction without begin")]
    fn test_end_without_begin_panics() {
        let db = open_db();
        let _ = db.end_transaction(true);
    }

    #[test]
    fn test_raw_records() {
        let db = open_db();
        db.raw_put("local", b"k", b"m", b"b").unwrap();
        let record = db.raw_get("local", b"k").unwrap();
        assert_eq!(record.meta, b"m");
        assert_eq!(record.body, b"b");
        assert_eq!(record.sequence, 1);

        db.raw_put("local", b"k", b"", b"").unwrap();
        assert!(matches!(db.raw_get("local", b"k"), Err(Error::NotFound)));
    }

    #[test]
    fn test_read_only_rejects_transactions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path().join("db"), false).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(dir.path().join("db"), true).unwrap();
        assert!(matches!(db.begin_transaction(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_read_only_refuses_create() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Database::open(dir.path().join("absent"), true),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_enumerate_changes_and_all_docs() {
        let db = open_db();
        db.begin_transaction().unwrap();
        for id in [&b"a"[..], b"b", b"c"] {
            let mut doc = db.get_document(id, false).unwrap();
            doc.insert_revision(rev("1-aa"), b"{}".to_vec(), false, false, false)
                .unwrap();
            doc.save(20).unwrap();
        }
        db.end_transaction(true).unwrap();

        let mut changes = db.enumerate_changes(0, true).unwrap();
        let mut ids = Vec::new();
        while let Some(record) = changes.next().unwrap() {
            ids.push(record.key);
        }
        assert_eq!(ids, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let mut changes = db.enumerate_changes(2, true).unwrap();
        let record = changes.next().unwrap().unwrap();
        assert_eq!(record.key, b"c");
        assert!(changes.next().unwrap().is_none());

        let mut all = db
            .enumerate_all_docs(Some(b"b"), None, EnumeratorOptions::default())
            .unwrap();
        let record = all.next().unwrap().unwrap();
        assert_eq!(record.key, b"b");
        let doc = db.document_from_record(&record, true).unwrap();
        assert_eq!(doc.rev_id().unwrap(), &rev("1-aa"));
    }

    #[test]
    fn test_deleted_document_excluded_from_count() {
        let db = open_db();
        db.begin_transaction().unwrap();
        let mut doc = db.get_document(b"a", false).unwrap();
        doc.insert_revision(rev("1-aa"), b"{}".to_vec(), false, false, false)
            .unwrap();
        doc.insert_revision(rev("2-bb"), Vec::new(), true, false, false)
            .unwrap();
        doc.save(20).unwrap();
        db.end_transaction(true).unwrap();

        assert_eq!(db.document_count().unwrap(), 0);
        let doc = db.get_document(b"a", true).unwrap();
        assert!(doc.flags().deleted);
    }

    #[test]
    fn test_reinsert_relocated_revision_is_idempotent() {
        let db = open_db();
        db.begin_transaction().unwrap();
        let mut doc = db.get_document(b"a", false).unwrap();
        doc.insert_revision(rev("1-aa"), b"{\"v\":1}".to_vec(), false, false, false)
            .unwrap();
        doc.save(20).unwrap();
        db.end_transaction(true).unwrap();

        db.begin_transaction().unwrap();
        let mut doc = db.get_document(b"a", true).unwrap();
        doc.insert_revision(rev("2-bb"), b"{\"v\":2}".to_vec(), false, false, false)
            .unwrap();
        doc.save(20).unwrap();
        db.end_transaction(true).unwrap();

        // "1-aa"'s body now lives only in the overflow store. Re-playing
        // its insert with the identical body must succeed without adding
        // a node; a differing body is a conflict.
        db.begin_transaction().unwrap();
        let mut doc = db.get_document(b"a", true).unwrap();
        doc.insert_revision(rev("1-aa"), b"{\"v\":1}".to_vec(), false, false, false)
            .unwrap();
        assert_eq!(doc.selected_rev_id().unwrap(), &rev("1-aa"));
        assert_eq!(doc.versioned().tree().len(), 2);

        let err = doc
            .insert_revision(rev("1-aa"), b"{\"v\":9}".to_vec(), false, false, false)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict));
        db.end_transaction(false).unwrap();
    }

    #[test]
    fn test_compact_drops_orphaned_bodies() {
        let db = open_db();
        db.begin_transaction().unwrap();
        let mut doc = db.get_document(b"a", false).unwrap();
        doc.insert_revision(rev("1-aa"), b"{\"v\":1}".to_vec(), false, false, false)
            .unwrap();
        doc.save(20).unwrap();
        db.end_transaction(true).unwrap();

        db.begin_transaction().unwrap();
        let mut doc = db.get_document(b"a", true).unwrap();
        doc.insert_revision(rev("2-bb"), b"{\"v\":2}".to_vec(), false, false, false)
            .unwrap();
        doc.save(20).unwrap();
        db.end_transaction(true).unwrap();

        // The old winner's body moved to the overflow store.
        let mut doc = db.get_document(b"a", true).unwrap();
        doc.select_revision(&rev("1-aa")).unwrap();
        assert_eq!(doc.load_body().unwrap(), b"{\"v\":1}");

        let result = db.compact().unwrap();
        assert_eq!(result.bodies_removed, 1);

        let mut doc = db.get_document(b"a", true).unwrap();
        doc.select_revision(&rev("1-aa")).unwrap();
        assert!(matches!(doc.load_body(), Err(Error::Gone)));
    }
}
