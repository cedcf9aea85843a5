use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Maximum task text length in characters, measured after sanitization.
pub const MAX_TEXT_LEN: usize = 500;

/// A single task record.
///
/// `pending` marks a write that has not yet been confirmed by the remote
/// backup. It is in-memory state only and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub text: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub pending: bool,
}

impl Task {
    /// Build a fresh record with a v4 UUID id. The text must already have
    /// passed [`sanitize_text`] and [`validate_text`].
    pub fn new(text: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            text,
            completed: false,
            created_at: now,
            updated_at: now,
            pending: false,
        }
    }
}

/// Partial update applied by [`crate::store::TaskStore::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub text: Option<String>,
    pub completed: Option<bool>,
}

/// Completion-status filter for [`crate::store::TaskStore::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Only completed tasks.
    Completed,
    /// Only tasks not yet completed.
    Open,
}

/// Read-side query: optional status filter plus case-insensitive substring
/// match on the task text. No filters means "everything".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub status: Option<StatusFilter>,
    pub search_text: Option<String>,
}

impl TaskQuery {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            let want_completed = status == StatusFilter::Completed;
            if task.completed != want_completed {
                return false;
            }
        }
        if let Some(needle) = &self.search_text {
            if !task
                .text
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Normalize raw user input: trim, collapse internal whitespace runs to a
/// single space (which also removes line breaks), strip remaining control
/// characters, and truncate to [`MAX_TEXT_LEN`] characters.
pub fn sanitize_text(raw: &str) -> String {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_TEXT_LEN)
        .collect()
}

/// Check the sanitize contract: non-empty, within length, no line breaks.
/// Sanitized input normally passes; this guards direct callers.
pub fn validate_text(text: &str) -> Result<(), StoreError> {
    if text.trim().is_empty() {
        return Err(StoreError::validation("text is empty"));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(StoreError::validation(format!(
            "text exceeds {MAX_TEXT_LEN} characters"
        )));
    }
    if text.contains('\n') || text.contains('\r') {
        return Err(StoreError::validation("text contains line breaks"));
    }
    Ok(())
}
