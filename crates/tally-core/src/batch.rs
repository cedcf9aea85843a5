//! Write coalescing for the underlying key-value store.
//!
//! Rapid writes within one batch window collapse to a single underlying
//! write per key. The writer is the sole gate to the store for its owner,
//! so partial writes from different call sites never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::kv::{KeyValueStore, KvError};

/// Callback invoked when a background flush fails to write one key.
/// Failures of other keys in the same flush are unaffected.
pub type FlushErrorHandler = dyn Fn(&str, &KvError) + Send + Sync;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long writes are coalesced before the scheduled flush fires.
    pub flush_delay: Duration,
    /// Distinct pending keys that trigger an immediate flush instead.
    pub max_pending_keys: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(100),
            max_pending_keys: 10,
        }
    }
}

struct BatchInner<S: KeyValueStore> {
    store: S,
    config: BatchConfig,
    pending: Mutex<HashMap<String, String>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    on_error: Mutex<Option<Box<FlushErrorHandler>>>,
}

impl<S: KeyValueStore> BatchInner<S> {
    /// Drain the pending map and write every entry. Returns the first
    /// per-key error after attempting all keys; each failure is also
    /// reported through the error handler.
    fn flush_pending(&self) -> Result<(), KvError> {
        let snapshot: HashMap<String, String> = {
            let mut pending = self.pending.lock().expect("batch writer lock poisoned");
            std::mem::take(&mut *pending)
        };
        if let Some(handle) = self.timer.lock().expect("batch writer lock poisoned").take() {
            handle.abort();
        }

        let mut first_error = None;
        for (key, value) in snapshot {
            if let Err(err) = self.store.set(&key, &value) {
                tracing::warn!("batched write of {key} failed: {err}");
                if let Some(handler) = self
                    .on_error
                    .lock()
                    .expect("batch writer lock poisoned")
                    .as_ref()
                {
                    handler(&key, &err);
                }
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Coalesces writes into time-boxed flushes. Construct once, pass by
/// reference, and call [`BatchWriter::dispose`] when done so the timer
/// task does not outlive its owner.
pub struct BatchWriter<S: KeyValueStore + 'static> {
    inner: Arc<BatchInner<S>>,
}

impl<S: KeyValueStore + 'static> BatchWriter<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, BatchConfig::default())
    }

    pub fn with_config(store: S, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                store,
                config,
                pending: Mutex::new(HashMap::new()),
                timer: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
        }
    }

    /// Register a handler for per-key failures during background flushes.
    pub fn on_flush_error(&self, handler: Box<FlushErrorHandler>) {
        *self
            .inner
            .on_error
            .lock()
            .expect("batch writer lock poisoned") = Some(handler);
    }

    /// Buffer a write. The last `set` for a key within the current window
    /// wins. Flushes immediately once `max_pending_keys` distinct keys are
    /// buffered, otherwise after `flush_delay`.
    pub async fn set(&self, key: &str, value: String) -> Result<(), KvError> {
        let over_limit = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .expect("batch writer lock poisoned");
            pending.insert(key.to_string(), value);
            pending.len() >= self.inner.config.max_pending_keys
        };
        if over_limit {
            self.flush().await
        } else {
            self.schedule_flush();
            Ok(())
        }
    }

    /// Read-your-writes: a pending (unflushed) value is returned before the
    /// underlying store is consulted.
    pub fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        if let Some(value) = self
            .inner
            .pending
            .lock()
            .expect("batch writer lock poisoned")
            .get(key)
        {
            return Ok(Some(value.clone()));
        }
        self.inner.store.get(key)
    }

    /// Drop a key from both the pending map and the underlying store.
    pub fn remove(&self, key: &str) -> Result<(), KvError> {
        self.inner
            .pending
            .lock()
            .expect("batch writer lock poisoned")
            .remove(key);
        self.inner.store.remove(key)
    }

    /// Drain all pending writes now, cancelling any scheduled timer.
    pub async fn flush(&self) -> Result<(), KvError> {
        self.inner.flush_pending()
    }

    /// Immediate drain for durability-critical points (suspend, unload,
    /// large record sets). Identical to [`BatchWriter::flush`] but named
    /// for the call sites that must not rely on the timer.
    pub async fn force_flush(&self) -> Result<(), KvError> {
        self.inner.flush_pending()
    }

    /// Number of distinct keys currently buffered.
    pub fn pending_len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .expect("batch writer lock poisoned")
            .len()
    }

    /// Cancel the flush timer. Buffered writes are not flushed; call
    /// [`BatchWriter::force_flush`] first if durability matters.
    pub fn dispose(&self) {
        if let Some(handle) = self
            .inner
            .timer
            .lock()
            .expect("batch writer lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    fn schedule_flush(&self) {
        let mut timer = self.inner.timer.lock().expect("batch writer lock poisoned");
        if timer.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.config.flush_delay).await;
            // Clear our own handle first so flush_pending does not abort
            // the task that is running it.
            inner
                .timer
                .lock()
                .expect("batch writer lock poisoned")
                .take();
            let _ = inner.flush_pending();
        }));
    }
}
