//! The task-record CRUD surface.
//!
//! `TaskStore` owns the envelope and is its only writer. Every mutation
//! persists the whole envelope through the batch writer, which sits on a
//! quota guard over the injected key-value backend. Quota trims are
//! mirrored back into the live envelope so reads keep matching the disk,
//! and background flush failures are held for the caller in a last-error
//! slot. Loading runs the migration and recovery engines; corruption on
//! disk is never an error, only best-effort record loss that gets logged.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;

use crate::batch::{BatchConfig, BatchWriter};
use crate::envelope::Envelope;
use crate::error::StoreError;
use crate::keys;
use crate::kv::KeyValueStore;
use crate::migrate;
use crate::quota::{QuotaConfig, QuotaGuard};
use crate::recover;
use crate::task::{sanitize_text, validate_text, Task, TaskPatch, TaskQuery};

/// Record sets at least this large skip the batch window and flush on
/// every persist.
const FORCE_FLUSH_THRESHOLD: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct TaskStoreConfig {
    pub batch: BatchConfig,
    pub quota: QuotaConfig,
}

pub struct TaskStore<S: KeyValueStore + 'static> {
    writer: BatchWriter<QuotaGuard<S>>,
    envelope: Arc<Mutex<Envelope>>,
    flush_error: Arc<Mutex<Option<StoreError>>>,
}

impl<S: KeyValueStore + 'static> TaskStore<S> {
    /// Open a store over the given backend, loading (and if necessary
    /// migrating or recovering) the persisted envelope.
    pub async fn open(store: S) -> Self {
        Self::open_with(store, TaskStoreConfig::default()).await
    }

    pub async fn open_with(store: S, config: TaskStoreConfig) -> Self {
        let envelope = Arc::new(Mutex::new(Envelope::empty()));
        let guarded = QuotaGuard::with_config(store, config.quota);

        // Quota cleanup rewrites the payload on its way to disk; mirror
        // every trim into the live envelope so reads keep matching what
        // was actually persisted.
        let live = Arc::clone(&envelope);
        guarded.on_trim(Box::new(move |ids| {
            let mut env = live.lock().expect("task store lock poisoned");
            env.records.retain(|t| !ids.contains(&t.id));
        }));

        let writer = BatchWriter::with_config(guarded, config.batch);

        // Timer-path flush failures land here; mutations only buffer, so
        // this slot is how a failed background write becomes observable.
        let flush_error: Arc<Mutex<Option<StoreError>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&flush_error);
        writer.on_flush_error(Box::new(move |_key, err| {
            *sink.lock().expect("task store lock poisoned") = Some(StoreError::from_kv(err));
        }));

        let (loaded, changed) = Self::load(&writer).await;
        *envelope.lock().expect("task store lock poisoned") = loaded;

        let store = Self {
            writer,
            envelope,
            flush_error,
        };
        if changed {
            // Stamp the upgraded envelope back immediately. Failure here
            // is logged, never surfaced; the in-memory result stands.
            if let Err(err) = store.persist_now().await {
                tracing::error!("could not persist migrated envelope: {err}");
            }
        }
        store
    }

    /// Create a task from raw input. The text is sanitized first; input
    /// that is empty (or whitespace-only) after sanitization fails
    /// validation and appends nothing.
    pub async fn create(&mut self, text: &str) -> Result<Task, StoreError> {
        let text = sanitize_text(text);
        validate_text(&text)?;

        let task = Task::new(text);
        self.envelope
            .lock()
            .expect("task store lock poisoned")
            .records
            .push(task.clone());
        self.persist().await?;
        tracing::debug!("created task {}", task.id);
        Ok(task)
    }

    /// All records matching the query, newest first. No side effects.
    pub fn read(&self, query: &TaskQuery) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .envelope
            .lock()
            .expect("task store lock poisoned")
            .records
            .iter()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub async fn update(&mut self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let new_text = match patch.text {
            Some(raw) => {
                let text = sanitize_text(&raw);
                validate_text(&text)?;
                Some(text)
            }
            None => None,
        };

        let updated = {
            let mut env = self.envelope.lock().expect("task store lock poisoned");
            let task = env
                .records
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            if let Some(text) = new_text {
                task.text = text;
            }
            if let Some(completed) = patch.completed {
                task.completed = completed;
            }
            task.updated_at = Utc::now().max(task.created_at);
            task.clone()
        };

        self.persist().await?;
        Ok(updated)
    }

    /// Flip a task's completion state.
    pub async fn toggle(&mut self, id: &str) -> Result<Task, StoreError> {
        let completed = self
            .envelope
            .lock()
            .expect("task store lock poisoned")
            .records
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.completed)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.update(
            id,
            TaskPatch {
                text: None,
                completed: Some(!completed),
            },
        )
        .await
    }

    pub async fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        {
            let mut env = self.envelope.lock().expect("task store lock poisoned");
            let index = env
                .records
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            env.records.remove(index);
        }
        self.persist().await?;
        tracing::debug!("deleted task {id}");
        Ok(())
    }

    pub async fn clear_all(&mut self) -> Result<(), StoreError> {
        self.envelope
            .lock()
            .expect("task store lock poisoned")
            .records
            .clear();
        self.persist().await
    }

    /// Record a successful remote backup acknowledgement on the envelope.
    pub async fn mark_synced(&mut self, timestamp: &str) -> Result<(), StoreError> {
        self.envelope
            .lock()
            .expect("task store lock poisoned")
            .last_sync_timestamp = Some(timestamp.to_string());
        self.persist().await
    }

    /// Snapshot of the in-memory records, in storage order.
    pub fn tasks(&self) -> Vec<Task> {
        self.envelope
            .lock()
            .expect("task store lock poisoned")
            .records
            .clone()
    }

    pub fn last_sync_timestamp(&self) -> Option<String> {
        self.envelope
            .lock()
            .expect("task store lock poisoned")
            .last_sync_timestamp
            .clone()
    }

    /// The most recent background-flush failure, clearing it. Mutations
    /// report success once their write is buffered; when the deferred
    /// flush then fails, the error waits here. A recoverable error means
    /// retrying the mutation (or calling [`TaskStore::suspend`]) can still
    /// persist the data.
    pub fn take_flush_error(&self) -> Option<StoreError> {
        self.flush_error
            .lock()
            .expect("task store lock poisoned")
            .take()
    }

    /// Flush buffered writes. Call on application suspend, visibility
    /// loss, or unload so the batch window cannot swallow a write.
    pub async fn suspend(&self) -> Result<(), StoreError> {
        self.writer.force_flush().await?;
        Ok(())
    }

    /// Cancel the batch timer. Pending writes are flushed first.
    pub async fn dispose(&self) {
        if let Err(err) = self.writer.force_flush().await {
            tracing::error!("final flush failed on dispose: {err}");
        }
        self.writer.dispose();
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let (json, count) = {
            let env = self.envelope.lock().expect("task store lock poisoned");
            let json = serde_json::to_string(&*env).map_err(|e| StoreError::Storage {
                message: format!("envelope serialization failed: {e}"),
                recoverable: false,
            })?;
            (json, env.records.len())
        };
        self.writer.set(keys::RECORDS_KEY, json).await?;
        if count >= FORCE_FLUSH_THRESHOLD {
            self.writer.force_flush().await?;
        }
        Ok(())
    }

    async fn persist_now(&self) -> Result<(), StoreError> {
        self.persist().await?;
        self.writer.force_flush().await?;
        Ok(())
    }

    /// Read and upgrade the persisted envelope. The returned flag is true
    /// when the result differs from what is on disk and must be written
    /// back.
    async fn load(writer: &BatchWriter<QuotaGuard<S>>) -> (Envelope, bool) {
        let raw = match writer.get(keys::RECORDS_KEY) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!("could not read task envelope, starting empty: {err}");
                return (Envelope::empty(), false);
            }
        };
        let Some(raw) = raw else {
            return (Envelope::empty(), false);
        };

        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("task envelope is not valid JSON, starting empty: {err}");
                return (Envelope::empty(), false);
            }
        };

        let (value, migrated) = migrate::migrate(value);
        let (envelope, salvaged) = recover::salvage(&value);
        (envelope, migrated || salvaged)
    }
}
