//! Backup transport: how a record set reaches the remote endpoint.
//!
//! The coordinator only sees [`BackupTransport`] and [`PushError`];
//! whether the other side is a real HTTP endpoint or a scripted test
//! double is decided at construction.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use tally_core::Task;

/// Push failure classification, as the retry loop consumes it.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Transport failure or 5xx: worth retrying with backoff.
    #[error("transient push failure: {message}")]
    Transient { message: String },

    /// HTTP 429. `retry_after` is the server's `Retry-After` hint in
    /// seconds, honored in place of the computed backoff when present.
    #[error("rate limited by the backup endpoint")]
    RateLimited { retry_after: Option<u64> },

    /// Any other 4xx: the push is permanently rejected, do not retry.
    #[error("push rejected: http {status}")]
    Rejected { status: u16 },
}

/// Wire body of the backup POST.
#[derive(Debug, Serialize)]
pub struct BackupPayload<'a> {
    pub records: &'a [Task],
    pub timestamp: String,
}

#[async_trait]
pub trait BackupTransport: Send + Sync {
    async fn push(&self, records: &[Task]) -> Result<(), PushError>;
}

#[async_trait]
impl<T: BackupTransport + ?Sized> BackupTransport for std::sync::Arc<T> {
    async fn push(&self, records: &[Task]) -> Result<(), PushError> {
        (**self).push(records).await
    }
}

/// HTTP transport posting `{ records, timestamp }` to a backup endpoint.
pub struct HttpBackup {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBackup {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl BackupTransport for HttpBackup {
    async fn push(&self, records: &[Task]) -> Result<(), PushError> {
        let payload = BackupPayload {
            records,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PushError::Transient {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(PushError::RateLimited { retry_after });
        }
        if status.is_client_error() {
            return Err(PushError::Rejected {
                status: status.as_u16(),
            });
        }
        Err(PushError::Transient {
            message: format!("http {}", status.as_u16()),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted transport: plays back a queue of outcomes and counts
    /// calls. An empty script means every push succeeds.
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Result<(), PushError>>>,
        calls: AtomicU32,
        /// Simulated network latency per push.
        pub latency: Option<Duration>,
    }

    impl ScriptedTransport {
        pub fn always_ok() -> Self {
            Self::with_script(Vec::new())
        }

        pub fn with_script(outcomes: Vec<Result<(), PushError>>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
                latency: None,
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackupTransport for ScriptedTransport {
        async fn push(&self, _records: &[Task]) -> Result<(), PushError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.script
                .lock()
                .expect("scripted transport lock poisoned")
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }
}
