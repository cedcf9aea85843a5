//! tally-core — task records and local persistence for the tally app.
//!
//! The store keeps one envelope of task records in a size-constrained
//! key-value backend, coalesces writes through a batch window, reacts to
//! quota exhaustion with cleanup-then-retry, and upgrades or salvages
//! whatever it finds on load. Remote backup lives in `tally-sync`.

pub mod batch;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod kv;
pub mod migrate;
pub mod quota;
pub mod recover;
pub mod store;
pub mod task;

pub use batch::{BatchConfig, BatchWriter};
pub use envelope::{Envelope, SCHEMA_VERSION};
pub use error::StoreError;
pub use kv::{FileStore, KeyValueStore, KvError, MemoryStore};
pub use quota::{QuotaConfig, QuotaGuard, TrimHandler};
pub use store::{TaskStore, TaskStoreConfig};
pub use task::{sanitize_text, validate_text, StatusFilter, Task, TaskPatch, TaskQuery};
