//! tally-sync — best-effort remote backup for the tally task store.
//!
//! The coordinator is eventually consistent by design: pushes retry with
//! exponential backoff, rate limits are honored, and anything that cannot
//! be delivered right now waits in a durable pending-sync slot or the
//! in-memory operation queue until connectivity returns.

pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod queue;
pub mod transport;

pub use connectivity::Connectivity;
pub use coordinator::{SyncCoordinator, SyncOptions, SyncState, SyncStats};
pub use error::SyncError;
pub use queue::{OpQueue, PendingOp, SyncAction};
pub use transport::{BackupPayload, BackupTransport, HttpBackup, PushError};
