//! Lifecycle controller
//!
//! [`SyncContext`] is the explicitly constructed top-level object consumers
//! share. The first [`SyncContext::acquire`] starts the transport and engine;
//! dropping the last [`ConsumerGuard`] tears them down after a grace window,
//! so a remount inside the window keeps the store running.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crm_common::config::SyncConfig;
use crm_common::error::{Error, Result};
use crm_common::types::{
    ChannelKey, Conversation, EntityId, EntityRecord, Job, Lead, Message, SessionScope,
};

use crate::cdc::Normalizer;
use crate::channel::{ChannelStatus, Degradation, SyncState};
use crate::driver::{drive, SnapshotFetcher};
use crate::engine::{Batch, SyncEngine};
use crate::selector::{Selector, SelectorRegistry, SubscriptionHandle};
use crate::store::StoreSnapshot;
use crate::transport::{RealtimeBackend, TransportAdapter};

/// Lifecycle state of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    /// Transport and engine running, first sync in progress
    Starting,
    /// Every channel finished its first sync attempt
    Ready,
    /// Shut down for good
    Stopped,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    consumers: usize,
    run: Option<Running>,
    /// Bumped on every acquire and release; a scheduled teardown only runs
    /// if nothing happened since it was scheduled
    teardown_generation: u64,
    /// Last data kept across a teardown while subscriptions remain
    retained: Option<Arc<StoreSnapshot>>,
}

/// Shared store context
pub struct SyncContext {
    config: SyncConfig,
    scope: SessionScope,
    workspace: EntityId,
    backend: Arc<dyn RealtimeBackend>,
    registry: Arc<SelectorRegistry>,
    state: watch::Sender<LifecycleState>,
    inner: Mutex<Inner>,
    /// Generation of the running engine; batches from older runs are dropped
    run_generation: AtomicU64,
    seed: Option<u64>,
}

impl SyncContext {
    /// Create a context. Nothing connects until the first `acquire`.
    ///
    /// # Errors
    /// Returns `ConfigError` when the configuration is invalid.
    pub fn new(config: SyncConfig, backend: Arc<dyn RealtimeBackend>) -> Result<Arc<Self>> {
        Self::build(config, backend, None)
    }

    /// Like [`SyncContext::new`] with deterministic retry jitter
    ///
    /// # Errors
    /// Returns `ConfigError` when the configuration is invalid.
    pub fn seeded(
        config: SyncConfig,
        backend: Arc<dyn RealtimeBackend>,
        seed: u64,
    ) -> Result<Arc<Self>> {
        Self::build(config, backend, Some(seed))
    }

    fn build(
        config: SyncConfig,
        backend: Arc<dyn RealtimeBackend>,
        seed: Option<u64>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let scope = config.scope();
        let (state, _) = watch::channel(LifecycleState::Uninitialized);
        Ok(Arc::new(Self {
            workspace: EntityId::new(scope.workspace_id.clone()),
            scope,
            config,
            backend,
            registry: Arc::new(SelectorRegistry::new()),
            state,
            inner: Mutex::new(Inner::default()),
            run_generation: AtomicU64::new(0),
            seed,
        }))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register a consumer, starting the store if needed. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `Lifecycle` after [`SyncContext::shutdown`].
    pub fn acquire(self: &Arc<Self>) -> Result<ConsumerGuard> {
        let mut inner = self.inner.lock();
        if self.state() == LifecycleState::Stopped {
            return Err(Error::Lifecycle("store is stopped".into()));
        }
        inner.consumers += 1;
        inner.teardown_generation += 1;
        self.start_locked(&mut inner);
        debug!("Consumer acquired ({} active)", inner.consumers);
        Ok(ConsumerGuard {
            ctx: Arc::clone(self),
        })
    }

    /// Start the transport and engine. A second call while running is a no-op.
    ///
    /// # Errors
    /// Returns `Lifecycle` after [`SyncContext::shutdown`].
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.state() == LifecycleState::Stopped {
            return Err(Error::Lifecycle("store is stopped".into()));
        }
        self.start_locked(&mut inner);
        Ok(())
    }

    fn start_locked(self: &Arc<Self>, inner: &mut Inner) {
        if inner.run.is_some() {
            return;
        }
        let generation = self.run_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channels: HashSet<ChannelKey> = self.config.transport.channels.iter().copied().collect();

        let engine = match inner.retained.take() {
            Some(baseline) => {
                info!("Starting sync store from retained data");
                SyncEngine::with_baseline(&self.config.engine, channels.iter().copied(), &baseline)
            }
            None => {
                info!("Starting sync store for workspace {}", self.scope.workspace_id);
                SyncEngine::new(&self.config.engine, channels.iter().copied())
            }
        };

        let mut adapter = TransportAdapter::new(
            Arc::clone(&self.backend),
            self.scope.clone(),
            self.config.transport.clone(),
            Normalizer::new(self.config.engine.version_column.clone()),
        );
        if let Some(seed) = self.seed {
            adapter = adapter.with_seed(seed);
        }
        let connection = adapter.connect(channels);

        let cancel = CancellationToken::new();
        let (fetcher, snapshots) = SnapshotFetcher::new(
            Arc::clone(&self.backend),
            self.scope.clone(),
            &self.config.engine,
            cancel.child_token(),
        );

        let ctx = Arc::downgrade(self);
        let publish = move |batch: Batch| {
            if let Some(ctx) = Weak::upgrade(&ctx) {
                ctx.publish(generation, &batch);
            }
        };
        let task = tokio::spawn(drive(
            engine,
            connection,
            fetcher,
            snapshots,
            self.config.engine.batch_window(),
            cancel.clone(),
            publish,
        ));

        inner.run = Some(Running { cancel, task });
        self.state.send_replace(LifecycleState::Starting);
    }

    fn publish(&self, generation: u64, batch: &Batch) {
        if self.run_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.registry.notify(batch);
        if all_settled(&batch.snapshot.channels) {
            self.state.send_if_modified(|state| {
                if *state == LifecycleState::Starting {
                    info!("Sync store ready");
                    *state = LifecycleState::Ready;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn release(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.consumers = inner.consumers.saturating_sub(1);
        inner.teardown_generation += 1;
        debug!("Consumer released ({} active)", inner.consumers);
        if inner.consumers > 0 || inner.run.is_none() {
            return;
        }

        let generation = inner.teardown_generation;
        let grace = self.config.lifecycle.teardown_grace();
        let ctx = Arc::downgrade(self);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to schedule teardown on");
            return;
        };
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(ctx) = ctx.upgrade() else {
                return;
            };
            let due = {
                let inner = ctx.inner.lock();
                inner.teardown_generation == generation && inner.consumers == 0
            };
            if due {
                ctx.teardown().await;
            }
        });
    }

    /// Close every connection and drop the tables. While selector
    /// subscriptions remain, the last published data is kept (flagged stale)
    /// and seeds the next start.
    pub async fn teardown(&self) {
        let run = {
            let mut inner = self.inner.lock();
            let Some(run) = inner.run.take() else {
                return;
            };
            self.run_generation.fetch_add(1, Ordering::SeqCst);
            if !self.registry.is_empty() {
                inner.retained = Some(Arc::new((*self.registry.current()).clone().into_stale()));
            }
            self.state.send_if_modified(|state| {
                if *state == LifecycleState::Stopped {
                    false
                } else {
                    *state = LifecycleState::Uninitialized;
                    true
                }
            });
            run
        };

        run.cancel.cancel();
        if let Err(e) = run.task.await {
            warn!("Sync engine task ended abnormally: {}", e);
        }

        let replacement = {
            let mut inner = self.inner.lock();
            if inner.run.is_some() {
                // Restarted while the old engine was stopping
                return;
            }
            if self.state() != LifecycleState::Stopped && !self.registry.is_empty() {
                let retained = Arc::new((*self.registry.current()).clone().into_stale());
                inner.retained = Some(Arc::clone(&retained));
                retained
            } else {
                inner.retained = None;
                Arc::new(StoreSnapshot::empty())
            }
        };
        self.registry.replace(replacement);
        info!("Sync store torn down");
    }

    /// Stop permanently; later `acquire`/`initialize` calls fail
    pub async fn shutdown(&self) {
        self.state.send_replace(LifecycleState::Stopped);
        self.teardown().await;
        self.inner.lock().retained = None;
        info!("Sync store stopped");
    }

    /// Resolve once every channel has finished its first sync attempt
    ///
    /// # Errors
    /// Returns `Lifecycle` if the store stops first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, LifecycleState::Ready | LifecycleState::Stopped))
            .await
            .map_err(|_| Error::Lifecycle("context dropped".into()))?;
        match *state {
            LifecycleState::Ready => Ok(()),
            _ => Err(Error::Lifecycle("store stopped before becoming ready".into())),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn consumers(&self) -> usize {
        self.inner.lock().consumers
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Subscribe to a selector; see [`SelectorRegistry::subscribe`]
    pub fn subscribe<S, F>(&self, selector: S, callback: F) -> SubscriptionHandle<S::Output>
    where
        S: Selector,
        F: Fn(&S::Output) + Send + Sync + 'static,
    {
        self.registry.subscribe(selector, callback)
    }

    /// Evaluate a selector once
    pub fn select<S: Selector>(&self, selector: &S) -> S::Output {
        self.registry.select(selector)
    }

    /// Current published snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.registry.current()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SelectorRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn lead(&self, id: &EntityId) -> Option<Arc<EntityRecord<Lead>>> {
        self.snapshot().lead(id).cloned()
    }

    #[must_use]
    pub fn conversation(&self, id: &EntityId) -> Option<Arc<EntityRecord<Conversation>>> {
        self.snapshot().conversation(id).cloned()
    }

    #[must_use]
    pub fn job(&self, id: &EntityId) -> Option<Arc<EntityRecord<Job>>> {
        self.snapshot().job(id).cloned()
    }

    #[must_use]
    pub fn message(&self, id: &EntityId) -> Option<Arc<EntityRecord<Message>>> {
        self.snapshot().message(id).cloned()
    }

    /// Leads of the session workspace
    #[must_use]
    pub fn leads(&self) -> Vec<Arc<EntityRecord<Lead>>> {
        self.snapshot().leads_in(&self.workspace).cloned().collect()
    }

    /// Conversations of the session workspace
    #[must_use]
    pub fn conversations(&self) -> Vec<Arc<EntityRecord<Conversation>>> {
        self.snapshot().conversations_in(&self.workspace).cloned().collect()
    }

    /// Jobs of the session workspace
    #[must_use]
    pub fn jobs(&self) -> Vec<Arc<EntityRecord<Job>>> {
        self.snapshot().jobs_in(&self.workspace).cloned().collect()
    }

    /// Messages of the session workspace
    #[must_use]
    pub fn messages(&self) -> Vec<Arc<EntityRecord<Message>>> {
        self.snapshot().messages_in(&self.workspace).cloned().collect()
    }

    #[must_use]
    pub fn status(&self, channel: ChannelKey) -> Option<ChannelStatus> {
        self.snapshot().status(channel).cloned()
    }

    /// Channels currently reporting a degradation
    #[must_use]
    pub fn degraded(&self) -> BTreeMap<ChannelKey, Degradation> {
        self.snapshot()
            .channels
            .iter()
            .filter_map(|(k, s)| s.degraded.clone().map(|d| (*k, d)))
            .collect()
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Some(run) = self.inner.get_mut().run.take() {
            run.cancel.cancel();
        }
    }
}

/// A channel has settled once it went live (fresh or stale) or its transport
/// gave up
fn all_settled(channels: &BTreeMap<ChannelKey, ChannelStatus>) -> bool {
    !channels.is_empty()
        && channels.values().all(|s| {
            s.state == SyncState::Live || matches!(s.degraded, Some(Degradation::Transport { .. }))
        })
}

/// Keeps the store running while alive
#[must_use = "dropping the guard releases the consumer immediately"]
pub struct ConsumerGuard {
    ctx: Arc<SyncContext>,
}

impl ConsumerGuard {
    #[must_use]
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.ctx.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crm_common::config::{Jitter, RetryPolicy};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.session.workspace_id = "w1".into();
        config.transport.retry = RetryPolicy {
            jitter: Jitter::None,
            ..RetryPolicy::default()
        };
        config
    }

    fn context(backend: &MemoryBackend) -> Arc<SyncContext> {
        SyncContext::seeded(config(), Arc::new(backend.clone()), 7).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_is_idempotent() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend);
        assert_eq!(ctx.state(), LifecycleState::Uninitialized);

        ctx.initialize().unwrap();
        ctx.initialize().unwrap();
        let _a = ctx.acquire().unwrap();
        let _b = ctx.acquire().unwrap();
        ctx.wait_ready().await.unwrap();

        assert_eq!(ctx.state(), LifecycleState::Ready);
        assert_eq!(backend.subscribe_count(ChannelKey::Leads), 1);
        assert_eq!(backend.snapshot_count(ChannelKey::Leads), 1);
        assert_eq!(ctx.consumers(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_grace() {
        let backend = MemoryBackend::new();
        backend.set_snapshot(
            ChannelKey::Leads,
            vec![json!({"id": "a", "version": 1, "workspace_id": "w1"})],
        );
        let ctx = context(&backend);
        let guard = ctx.acquire().unwrap();
        ctx.wait_ready().await.unwrap();
        assert_eq!(ctx.leads().len(), 1);

        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.state(), LifecycleState::Ready);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ctx.state(), LifecycleState::Uninitialized);
        // No subscriptions remained, so nothing is retained
        assert!(ctx.leads().is_empty());
        assert_eq!(backend.active_subscriptions(ChannelKey::Leads), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remount_within_grace_keeps_running() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend);
        let guard = ctx.acquire().unwrap();
        ctx.wait_ready().await.unwrap();

        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _guard = ctx.acquire().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(ctx.state(), LifecycleState::Ready);
        assert_eq!(backend.subscribe_count(ChannelKey::Jobs), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_final() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend);
        let guard = ctx.acquire().unwrap();
        ctx.shutdown().await;
        assert_eq!(ctx.state(), LifecycleState::Stopped);
        assert!(matches!(ctx.acquire(), Err(Error::Lifecycle(_))));
        assert!(matches!(ctx.initialize(), Err(Error::Lifecycle(_))));
        assert!(ctx.wait_ready().await.is_err());
        drop(guard);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let backend = MemoryBackend::new();
        let result = SyncContext::new(SyncConfig::default(), Arc::new(backend));
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}
