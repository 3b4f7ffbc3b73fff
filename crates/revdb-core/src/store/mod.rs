//! Storage layer: named ordered key stores over sled, with staged
//! transactions and range enumeration.

mod config;
mod enumerator;
mod keystore;
mod transaction;

pub use config::DatabaseConfig;
pub use enumerator::{ContentOption, DocEnumerator, EnumeratorOptions};
pub use keystore::{KeyStore, Record};
pub use transaction::{KeyStoreWriter, Transaction};
