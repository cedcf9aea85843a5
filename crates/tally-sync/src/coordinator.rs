//! Opportunistic synchronization to the remote backup.
//!
//! The coordinator pushes record sets with retry and exponential backoff,
//! honors server rate-limit hints, and never discards unsynced data: any
//! retryable failure writes the records to the durable pending-sync slot
//! before it is raised. A watcher task drains that slot (and the deferred
//! operation queue) whenever connectivity returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tally_core::{keys, KeyValueStore, Task};

use crate::error::SyncError;
use crate::queue::{OpQueue, PendingOp, SyncAction};
use crate::transport::{BackupTransport, PushError};

/// Where the coordinator currently is. Purely observational; the busy
/// guard, not this value, is what prevents overlapping syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    /// Backing off between retry attempts.
    Waiting,
}

/// Per-call knobs for [`SyncCoordinator::sync_now`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub cancel: Option<CancellationToken>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            cancel: None,
        }
    }
}

/// Counters over the coordinator's lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    pub total_synced: u64,
    pub total_failed: u64,
    pub last_sync_at: Option<String>,
}

struct Inner<S: KeyValueStore, T: BackupTransport> {
    store: S,
    transport: T,
    online: watch::Receiver<bool>,
    syncing: AtomicBool,
    state: Mutex<SyncState>,
    queue: Mutex<OpQueue>,
    stats: Mutex<SyncStats>,
}

/// Releases the at-most-one-sync guard when dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S: KeyValueStore, T: BackupTransport> Inner<S, T> {
    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().expect("sync state lock poisoned") = state;
    }

    fn note_success(&self) {
        let mut stats = self.stats.lock().expect("sync stats lock poisoned");
        stats.total_synced += 1;
        stats.last_sync_at = Some(chrono::Utc::now().to_rfc3339());
    }

    fn note_failure(&self) {
        self.stats
            .lock()
            .expect("sync stats lock poisoned")
            .total_failed += 1;
    }

    /// Write the record set to the durable pending-sync slot. Called
    /// before every retryable failure so a crash afterwards loses nothing.
    fn persist_pending(&self, records: &[Task]) {
        match serde_json::to_string(records) {
            Ok(json) => {
                if let Err(err) = self.store.set(keys::PENDING_SYNC_KEY, &json) {
                    tracing::error!("could not persist pending-sync slot: {err}");
                } else {
                    tracing::info!("queued {} records for later sync", records.len());
                }
            }
            Err(err) => tracing::error!("could not serialize pending-sync records: {err}"),
        }
    }

    fn clear_pending(&self) {
        if let Err(err) = self.store.remove(keys::PENDING_SYNC_KEY) {
            tracing::warn!("could not clear pending-sync slot: {err}");
        }
    }

    fn has_pending_slot(&self) -> bool {
        self.store
            .get(keys::PENDING_SYNC_KEY)
            .ok()
            .flatten()
            .is_some()
    }

    async fn wait_or_cancelled(
        &self,
        delay: Duration,
        options: &SyncOptions,
    ) -> Result<(), SyncError> {
        match &options.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    /// One logical sync: push with retry/backoff until success, a
    /// non-retryable failure, cancellation, or exhausted attempts. The
    /// caller must hold the busy guard.
    async fn run_push(&self, records: &[Task], options: &SyncOptions) -> Result<(), SyncError> {
        if !self.is_online() {
            self.persist_pending(records);
            return Err(SyncError::Offline);
        }

        let max_attempts = options.max_retries.max(1);
        let mut attempt: u32 = 1;
        loop {
            if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(SyncError::Cancelled);
            }
            self.set_state(SyncState::Syncing);
            match self.transport.push(records).await {
                Ok(()) => {
                    self.clear_pending();
                    self.note_success();
                    tracing::info!("synced {} records to backup", records.len());
                    return Ok(());
                }
                Err(PushError::Rejected { status }) => {
                    self.note_failure();
                    return Err(SyncError::Rejected { status });
                }
                Err(err) => {
                    if attempt >= max_attempts {
                        self.note_failure();
                        self.persist_pending(records);
                        return Err(SyncError::Exhausted {
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = match &err {
                        PushError::RateLimited {
                            retry_after: Some(secs),
                        } => Duration::from_secs(*secs),
                        _ => options.base_delay * 2u32.saturating_pow(attempt - 1),
                    };
                    tracing::debug!(
                        "push attempt {attempt} failed ({err}), retrying in {delay:?}"
                    );
                    self.set_state(SyncState::Waiting);
                    self.wait_or_cancelled(delay, options).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Flush the durable slot, then the deferred operation queue. The
    /// caller must hold the busy guard.
    async fn drain(&self, options: &SyncOptions) -> Result<(), SyncError> {
        match self.store.get(keys::PENDING_SYNC_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<Vec<Task>>(&json) {
                Ok(records) => self.run_push(&records, options).await?,
                Err(err) => {
                    tracing::warn!("pending-sync slot is corrupt, discarding: {err}");
                    self.clear_pending();
                }
            },
            Ok(None) => {}
            Err(err) => tracing::warn!("could not read pending-sync slot: {err}"),
        }

        let groups = self
            .queue
            .lock()
            .expect("sync queue lock poisoned")
            .drain_groups();
        let mut groups = groups.into_iter();
        while let Some((action, ops)) = groups.next() {
            if !self.is_online() {
                let remaining = collect_remaining(ops, &mut groups);
                let count = remaining.len();
                self.queue
                    .lock()
                    .expect("sync queue lock poisoned")
                    .requeue_front(remaining);
                tracing::info!("connectivity dropped mid-drain, re-queued {count} operations");
                return Err(SyncError::Offline);
            }

            let records: Vec<Task> = ops.iter().filter_map(|op| op.task.clone()).collect();
            if records.is_empty() {
                // Delete operations carry no snapshot; the next full
                // backup supersedes them remotely.
                tracing::debug!("{} {action:?} operations need no push", ops.len());
                continue;
            }

            match self.transport.push(&records).await {
                Ok(()) => self.note_success(),
                Err(PushError::Rejected { status }) => {
                    // Permanent rejection: retrying the same batch would
                    // fail forever, so it is dropped, loudly.
                    self.note_failure();
                    tracing::error!(
                        "backup rejected {} queued {action:?} operations (http {status})",
                        ops.len()
                    );
                }
                Err(err) => {
                    self.note_failure();
                    let remaining = collect_remaining(ops, &mut groups);
                    self.queue
                        .lock()
                        .expect("sync queue lock poisoned")
                        .requeue_front(remaining);
                    return Err(SyncError::Exhausted {
                        attempts: 1,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn collect_remaining(
    current: Vec<PendingOp>,
    rest: &mut impl Iterator<Item = (SyncAction, Vec<PendingOp>)>,
) -> Vec<PendingOp> {
    let mut remaining = current;
    for (_, ops) in rest {
        remaining.extend(ops);
    }
    remaining
}

/// Coordinates pushes to the remote backup. Construct once with the
/// storage, transport, and connectivity capabilities; call
/// [`SyncCoordinator::dispose`] to stop the connectivity watcher.
pub struct SyncCoordinator<S: KeyValueStore + 'static, T: BackupTransport + 'static> {
    inner: Arc<Inner<S, T>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: KeyValueStore + 'static, T: BackupTransport + 'static> SyncCoordinator<S, T> {
    pub fn new(store: S, transport: T, online: watch::Receiver<bool>) -> Self {
        let inner = Arc::new(Inner {
            store,
            transport,
            online: online.clone(),
            syncing: AtomicBool::new(false),
            state: Mutex::new(SyncState::Idle),
            queue: Mutex::new(OpQueue::new()),
            stats: Mutex::new(SyncStats::default()),
        });

        // Drain pending work on every offline -> online transition. The
        // watcher holds only a weak handle so a dropped coordinator is not
        // kept alive by its own task.
        let weak = Arc::downgrade(&inner);
        let mut rx = online;
        let watcher = tokio::spawn(async move {
            let mut was_online = *rx.borrow();
            while rx.changed().await.is_ok() {
                let now_online = *rx.borrow_and_update();
                if now_online && !was_online {
                    let Some(inner) = weak.upgrade() else { break };
                    tracing::info!("connectivity restored, draining pending sync");
                    let Some(_guard) = BusyGuard::acquire(&inner.syncing) else {
                        was_online = now_online;
                        continue;
                    };
                    let result = inner.drain(&SyncOptions::default()).await;
                    inner.set_state(SyncState::Idle);
                    if let Err(err) = result {
                        tracing::warn!("automatic sync drain failed: {err}");
                    }
                }
                was_online = now_online;
            }
        });

        Self {
            inner,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    /// Push `records` to the backup now. Offline or exhausted-retry
    /// failures durably queue the records first and come back retryable;
    /// 4xx rejections and cancellations are terminal. A sync already in
    /// flight yields [`SyncError::Busy`] without touching the network.
    pub async fn sync_now(
        &self,
        records: &[Task],
        options: SyncOptions,
    ) -> Result<(), SyncError> {
        let Some(_guard) = BusyGuard::acquire(&self.inner.syncing) else {
            return Err(SyncError::Busy);
        };
        let result = self.inner.run_push(records, &options).await;
        self.inner.set_state(SyncState::Idle);
        result
    }

    /// Defer an operation until the next drain.
    pub fn enqueue(&self, op: PendingOp) {
        self.inner
            .queue
            .lock()
            .expect("sync queue lock poisoned")
            .enqueue(op);
    }

    /// Queued operations plus one if a durable pending payload exists.
    pub fn pending_sync_count(&self) -> usize {
        let queued = self
            .inner
            .queue
            .lock()
            .expect("sync queue lock poisoned")
            .len();
        queued + usize::from(self.inner.has_pending_slot())
    }

    pub fn is_network_online(&self) -> bool {
        self.inner.is_online()
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.lock().expect("sync state lock poisoned")
    }

    pub fn stats(&self) -> SyncStats {
        self.inner
            .stats
            .lock()
            .expect("sync stats lock poisoned")
            .clone()
    }

    /// Manually drain pending work. Fails immediately (non-retryable)
    /// when offline: a manual trigger with no connectivity is caller
    /// error, unlike the automatic queue-and-wait path.
    pub async fn retry_pending_sync(&self) -> Result<(), SyncError> {
        if !self.inner.is_online() {
            return Err(SyncError::StillOffline);
        }
        let Some(_guard) = BusyGuard::acquire(&self.inner.syncing) else {
            return Err(SyncError::Busy);
        };
        let result = self.inner.drain(&SyncOptions::default()).await;
        self.inner.set_state(SyncState::Idle);
        result
    }

    /// Stop the connectivity watcher.
    pub fn dispose(&self) {
        if let Some(handle) = self
            .watcher
            .lock()
            .expect("sync watcher lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Connectivity;
    use crate::transport::testing::ScriptedTransport;
    use async_trait::async_trait;
    use tally_core::MemoryStore;

    fn records(n: usize) -> Vec<Task> {
        (0..n).map(|i| Task::new(format!("task {i}"))).collect()
    }

    fn coordinator(
        online: bool,
        transport: Arc<ScriptedTransport>,
    ) -> (
        Connectivity,
        Arc<MemoryStore>,
        SyncCoordinator<Arc<MemoryStore>, Arc<ScriptedTransport>>,
    ) {
        let signal = Connectivity::new(online);
        let store = Arc::new(MemoryStore::new());
        let coord = SyncCoordinator::new(Arc::clone(&store), transport, signal.subscribe());
        (signal, store, coord)
    }

    #[tokio::test(start_paused = true)]
    async fn offline_sync_queues_durably_and_fails_retryable() {
        let transport = Arc::new(ScriptedTransport::always_ok());
        let (_signal, store, coord) = coordinator(false, Arc::clone(&transport));

        let err = coord
            .sync_now(&records(2), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        assert!(err.is_retryable());
        assert_eq!(transport.calls(), 0);
        assert_eq!(coord.pending_sync_count(), 1);
        assert!(store.get(keys::PENDING_SYNC_KEY).unwrap().is_some());
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_the_pending_slot() {
        let transport = Arc::new(ScriptedTransport::always_ok());
        let (_signal, store, coord) = coordinator(true, Arc::clone(&transport));
        store.set(keys::PENDING_SYNC_KEY, "[]").unwrap();

        coord
            .sync_now(&records(1), SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(transport.calls(), 1);
        assert!(store.get(keys::PENDING_SYNC_KEY).unwrap().is_none());
        assert_eq!(coord.pending_sync_count(), 0);
        assert_eq!(coord.stats().total_synced, 1);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_header_overrides_backoff() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Err(PushError::RateLimited {
                retry_after: Some(2),
            }),
            Ok(()),
        ]));
        let (_signal, _store, coord) = coordinator(true, Arc::clone(&transport));

        let start = tokio::time::Instant::now();
        coord
            .sync_now(&records(1), SyncOptions::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(transport.calls(), 2);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_exponentially() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Err(PushError::Transient {
                message: "connection reset".into(),
            }),
            Err(PushError::Transient {
                message: "connection reset".into(),
            }),
            Ok(()),
        ]));
        let (_signal, _store, coord) = coordinator(true, Arc::clone(&transport));

        let start = tokio::time::Instant::now();
        coord
            .sync_now(&records(1), SyncOptions::default())
            .await
            .unwrap();
        // 1s after the first failure, 2s after the second.
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(transport.calls(), 3);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn client_rejection_fails_after_exactly_one_attempt() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![Err(
            PushError::Rejected { status: 400 },
        )]));
        let (_signal, store, coord) = coordinator(true, Arc::clone(&transport));

        let err = coord
            .sync_now(&records(1), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: 400 }));
        assert!(!err.is_retryable());
        assert_eq!(transport.calls(), 1);
        // Rejection is not a retryable failure, so nothing was queued.
        assert!(store.get(keys::PENDING_SYNC_KEY).unwrap().is_none());
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_queue_durably() {
        let failure = || {
            Err(PushError::Transient {
                message: "gateway timeout".into(),
            })
        };
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            failure(),
            failure(),
            failure(),
        ]));
        let (_signal, store, coord) = coordinator(true, Arc::clone(&transport));

        let err = coord
            .sync_now(&records(1), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Exhausted { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(transport.calls(), 3);
        assert!(store.get(keys::PENDING_SYNC_KEY).unwrap().is_some());
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_mid_backoff_stops_immediately() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![Err(
            PushError::Transient {
                message: "flaky".into(),
            },
        )]));
        let (_signal, _store, coord) = coordinator(true, Arc::clone(&transport));
        let coord = Arc::new(coord);

        let token = CancellationToken::new();
        let options = SyncOptions {
            cancel: Some(token.clone()),
            ..Default::default()
        };
        let task_records = records(1);
        let runner = Arc::clone(&coord);
        let handle =
            tokio::spawn(async move { runner.sync_now(&task_records, options).await });

        // Let the first attempt fail and enter its backoff wait.
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(!err.is_retryable());
        assert_eq!(transport.calls(), 1);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_sync_is_rejected_as_busy() {
        let mut slow = ScriptedTransport::always_ok();
        slow.latency = Some(Duration::from_secs(5));
        let transport = Arc::new(slow);
        let (_signal, _store, coord) = coordinator(true, Arc::clone(&transport));
        let coord = Arc::new(coord);

        let first_records = records(1);
        let runner = Arc::clone(&coord);
        let first =
            tokio::spawn(async move { runner.sync_now(&first_records, SyncOptions::default()).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = coord
            .sync_now(&records(1), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Busy));

        first.await.unwrap().unwrap();
        assert_eq!(transport.calls(), 1);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnecting_drains_the_pending_slot() {
        let transport = Arc::new(ScriptedTransport::always_ok());
        let (signal, store, coord) = coordinator(false, Arc::clone(&transport));

        let err = coord
            .sync_now(&records(1), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        assert_eq!(coord.pending_sync_count(), 1);

        signal.set_online(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.calls(), 1);
        assert!(store.get(keys::PENDING_SYNC_KEY).unwrap().is_none());
        assert_eq!(coord.pending_sync_count(), 0);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_pushes_op_groups_in_fifo_order() {
        let transport = Arc::new(ScriptedTransport::always_ok());
        let (_signal, _store, coord) = coordinator(true, Arc::clone(&transport));

        coord.enqueue(PendingOp::create(Task::new("a".into())));
        coord.enqueue(PendingOp::delete("gone"));
        coord.enqueue(PendingOp::update(Task::new("c".into())));
        assert_eq!(coord.pending_sync_count(), 3);

        coord.retry_pending_sync().await.unwrap();
        // Creates and updates each pushed as one batch; deletes carry no
        // payload and need no push.
        assert_eq!(transport.calls(), 2);
        assert_eq!(coord.pending_sync_count(), 0);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_drain_failure_requeues_everything() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![Err(
            PushError::Transient {
                message: "dns".into(),
            },
        )]));
        let (_signal, _store, coord) = coordinator(true, Arc::clone(&transport));

        coord.enqueue(PendingOp::create(Task::new("a".into())));
        coord.enqueue(PendingOp::update(Task::new("b".into())));

        let err = coord.retry_pending_sync().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(coord.pending_sync_count(), 2);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_drop_mid_drain_requeues_remaining_groups() {
        /// Succeeds, but knocks the connection offline as a side effect.
        struct FlippingTransport {
            signal: Arc<Connectivity>,
            calls: std::sync::atomic::AtomicU32,
        }

        #[async_trait]
        impl BackupTransport for FlippingTransport {
            async fn push(&self, _records: &[Task]) -> Result<(), PushError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.signal.set_online(false);
                Ok(())
            }
        }

        let signal = Arc::new(Connectivity::new(true));
        let transport = Arc::new(FlippingTransport {
            signal: Arc::clone(&signal),
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let coord = SyncCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            signal.subscribe(),
        );

        coord.enqueue(PendingOp::create(Task::new("first group".into())));
        coord.enqueue(PendingOp::update(Task::new("second group".into())));

        let err = coord.retry_pending_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        // The first group was pushed; the second was re-queued untouched.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coord.pending_sync_count(), 1);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_retry_while_offline_is_terminal() {
        let transport = Arc::new(ScriptedTransport::always_ok());
        let (_signal, _store, coord) = coordinator(false, Arc::clone(&transport));

        let err = coord.retry_pending_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::StillOffline));
        assert!(!err.is_retryable());
        assert_eq!(transport.calls(), 0);
        coord.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_successes_and_failures() {
        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Err(PushError::Rejected { status: 403 }),
            Ok(()),
        ]));
        let (_signal, _store, coord) = coordinator(true, Arc::clone(&transport));

        let _ = coord.sync_now(&records(1), SyncOptions::default()).await;
        coord
            .sync_now(&records(1), SyncOptions::default())
            .await
            .unwrap();

        let stats = coord.stats();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_synced, 1);
        assert!(stats.last_sync_at.is_some());
        assert_eq!(coord.state(), SyncState::Idle);
        coord.dispose();
    }
}
