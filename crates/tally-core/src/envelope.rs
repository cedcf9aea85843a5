use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Current envelope schema version. Rewritten onto the envelope whenever
/// the migration engine runs.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// The single persisted unit: all task records plus schema metadata.
/// Exactly one envelope exists per store, under
/// [`crate::keys::RECORDS_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub records: Vec<Task>,
    pub schema_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_timestamp: Option<String>,
}

impl Envelope {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            schema_version: SCHEMA_VERSION.to_string(),
            last_sync_timestamp: None,
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::empty()
    }
}
