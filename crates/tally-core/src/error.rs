use crate::kv::KvError;

/// Errors from the task store.
///
/// Recoverability is an explicit property of the variant rather than
/// something derived from the error's type identity; callers switch on
/// the variant or ask [`StoreError::is_recoverable`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid task text: {reason}")]
    Validation { reason: String },

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("storage failure: {message}")]
    Storage { message: String, recoverable: bool },
}

impl StoreError {
    pub fn validation(reason: impl Into<String>) -> Self {
        StoreError::Validation {
            reason: reason.into(),
        }
    }

    /// Whether the caller can usefully retry the operation that produced
    /// this error. Only storage errors caused by quota exhaustion qualify:
    /// cleanup already ran and whatever fit was kept, so retrying after
    /// freeing space (or accepting the trimmed set) is meaningful.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::Storage {
                recoverable: true,
                ..
            }
        )
    }

    pub(crate) fn from_kv(err: &KvError) -> Self {
        match err {
            KvError::QuotaExceeded { .. } => StoreError::Storage {
                message: "storage quota exhausted; older completed tasks were trimmed to make room"
                    .into(),
                recoverable: true,
            },
            other => StoreError::Storage {
                message: other.to_string(),
                recoverable: false,
            },
        }
    }
}

impl From<KvError> for StoreError {
    fn from(err: KvError) -> Self {
        StoreError::from_kv(&err)
    }
}
