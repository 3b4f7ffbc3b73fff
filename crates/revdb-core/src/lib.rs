//! revdb core - document storage with revision trees over sled.
//!
//! This crate provides a document-oriented façade over an ordered
//! key-value engine. Each document carries a full revision tree with
//! conflict detection, history grafting, and depth-bounded pruning, bound
//! to the engine through nested transactions. An auxiliary expiry store
//! indexes documents by collation-encoded `(timestamp, doc id)` keys for
//! time-bounded sweeps.
//!
//! # Key Concepts
//!
//! - **Database**: the entry point; owns the default document store and
//!   named auxiliary stores, and tracks nested-transaction depth.
//! - **Document**: a handle on one document's revision tree with a
//!   selected-revision cursor; mutations stage into the open transaction
//!   on save.
//! - **DocEnumerator**: ordered iteration by doc id range or by sequence.
//! - **ExpiryEnumerator**: yields and purges documents whose expiration
//!   timestamp has passed.
//!
//! # Example
//!
//! ```no_run
//! use revdb_core::{Database, RevId};
//!
//! let db = Database::open("/tmp/revdb", false)?;
//! db.begin_transaction()?;
//! let mut doc = db.get_document(b"greeting", false)?;
//! doc.insert_revision(
//!     RevId::parse(b"1-1a2b3c")?,
//!     b"{\"text\":\"hello\"}".to_vec(),
//!     false,
//!     false,
//!     false,
//! )?;
//! doc.save(20)?;
//! db.end_transaction(true)?;
//! # Ok::<(), revdb_core::Error>(())
//! ```

pub mod collatable;
mod database;
mod document;
mod error;
mod expiry;
mod revid;
mod revtree;
pub mod store;
mod varint;

pub use database::{CompactionResult, Database, Document};
pub use document::{DocumentFlags, VersionedDocument};
pub use error::{Error, ErrorDomain, Result};
pub use expiry::ExpiryEnumerator;
pub use revid::RevId;
pub use revtree::{RevBody, RevTree, Revision};
pub use store::{
    ContentOption, DatabaseConfig, DocEnumerator, EnumeratorOptions, KeyStore, KeyStoreWriter,
    Record, Transaction,
};
