//! Well-known keys in the underlying key-value store.

/// The single envelope holding all task records.
pub const RECORDS_KEY: &str = "tally.records";

/// Task records awaiting remote backup acknowledgement. Owned by the sync
/// coordinator; the task store never writes to it.
pub const PENDING_SYNC_KEY: &str = "tally.pending_sync";

/// UI theme selection.
pub const THEME_KEY: &str = "tally.theme";

/// User preferences blob.
pub const PREFERENCES_KEY: &str = "tally.preferences";

/// Keys that quota cleanup must never remove.
pub const PROTECTED_KEYS: &[&str] = &[RECORDS_KEY, PENDING_SYNC_KEY, THEME_KEY, PREFERENCES_KEY];
