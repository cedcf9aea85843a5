/// Errors from the sync coordinator.
///
/// Retryability is explicit per variant; callers switch on it via
/// [`SyncError::is_retryable`] instead of inspecting error types. Every
/// retryable failure guarantees the record set was durably written to the
/// pending-sync slot first, so retrying later cannot lose data.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("offline, will sync later")]
    Offline,

    #[error("backup rejected the push: http {status}")]
    Rejected { status: u16 },

    #[error("sync cancelled")]
    Cancelled,

    #[error("backup unreachable after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    #[error("a sync is already in progress")]
    Busy,

    #[error("cannot retry pending sync while offline")]
    StillOffline,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Offline | SyncError::Exhausted { .. } | SyncError::Busy => true,
            SyncError::Rejected { .. } | SyncError::Cancelled | SyncError::StillOffline => false,
        }
    }
}
