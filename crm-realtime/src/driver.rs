//! Async driver around [`SyncEngine`]
//!
//! Reads transport events and snapshot results, feeds them to the engine one
//! at a time, and hands out one [`Batch`] per batch window. Snapshot results
//! are taken ahead of queued transport events so a busy feed cannot hold a
//! channel in `Syncing`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crm_common::config::{EngineConfig, RetryPolicy};
use crm_common::error::Result;
use crm_common::types::{ChannelKey, SessionScope};

use crate::backoff::{RetryDecision, RetrySchedule};
use crate::engine::{Batch, EngineCommand, EngineInput, SyncEngine};
use crate::transport::{Connection, RealtimeBackend};

/// Runs snapshot fetches, at most one per channel
pub struct SnapshotFetcher {
    backend: Arc<dyn RealtimeBackend>,
    scope: SessionScope,
    policy: RetryPolicy,
    max_attempts: u32,
    tx: mpsc::UnboundedSender<EngineInput>,
    pending: HashMap<ChannelKey, CancellationToken>,
    cancel: CancellationToken,
}

impl SnapshotFetcher {
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        scope: SessionScope,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<EngineInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fetcher = Self {
            backend,
            scope,
            policy: config.snapshot_retry.clone(),
            max_attempts: config.snapshot_max_attempts,
            tx,
            pending: HashMap::new(),
            cancel,
        };
        (fetcher, rx)
    }

    /// Start fetching `channel` for `epoch`, replacing any fetch in flight
    pub fn fetch(&mut self, channel: ChannelKey, epoch: u64) {
        self.cancel(channel);
        let token = self.cancel.child_token();
        self.pending.insert(channel, token.clone());

        let backend = Arc::clone(&self.backend);
        let scope = self.scope.clone();
        let tx = self.tx.clone();
        let mut schedule = RetrySchedule::new(self.policy.clone(), self.max_attempts);

        tokio::spawn(async move {
            loop {
                let result: Result<Vec<Value>> = tokio::select! {
                    () = token.cancelled() => return,
                    result = backend.fetch_snapshot(channel, &scope) => result,
                };
                let input = match result {
                    Ok(rows) => EngineInput::SnapshotLoaded {
                        channel,
                        epoch,
                        rows,
                    },
                    Err(e) if !e.is_transient() => {
                        warn!("Snapshot of {} rejected, not retrying: {}", channel, e);
                        EngineInput::SnapshotFailed {
                            channel,
                            epoch,
                            attempts: schedule.failures() + 1,
                            reason: e.to_string(),
                        }
                    }
                    Err(e) => match schedule.on_failure(Instant::now()) {
                        RetryDecision::Retry { attempt, delay } => {
                            debug!(
                                "Snapshot of {} failed (attempt {}), retrying in {:?}: {}",
                                channel, attempt, delay, e
                            );
                            tokio::select! {
                                () = token.cancelled() => return,
                                () = tokio::time::sleep(delay) => continue,
                            }
                        }
                        RetryDecision::Exhausted { attempts } => EngineInput::SnapshotFailed {
                            channel,
                            epoch,
                            attempts,
                            reason: e.to_string(),
                        },
                    },
                };
                if !token.is_cancelled() {
                    let _ = tx.send(input);
                }
                return;
            }
        });
    }

    /// Cancel the fetch in flight for `channel`, if any
    pub fn cancel(&mut self, channel: ChannelKey) {
        if let Some(token) = self.pending.remove(&channel) {
            token.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, token) in self.pending.drain() {
            token.cancel();
        }
    }

    fn execute(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::FetchSnapshot { channel, epoch } => self.fetch(channel, epoch),
            EngineCommand::CancelSnapshot { channel } => self.cancel(channel),
        }
    }
}

/// Drive `engine` until `cancel` fires or the connection closes.
///
/// Inputs arriving within `window` of the first one are coalesced into a
/// single batch passed to `publish`.
pub async fn drive<F>(
    mut engine: SyncEngine,
    mut connection: Connection,
    mut fetcher: SnapshotFetcher,
    mut snapshots: mpsc::UnboundedReceiver<EngineInput>,
    window: Duration,
    cancel: CancellationToken,
    mut publish: F,
) where
    F: FnMut(Batch) + Send,
{
    if let Some(batch) = engine.take_batch() {
        publish(batch);
    }

    'run: loop {
        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => break 'run,
            input = next_input(&mut connection, &mut snapshots) => match input {
                Some(input) => input,
                None => break 'run,
            },
        };
        for command in engine.handle(first) {
            fetcher.execute(command);
        }

        let deadline = Instant::now() + window;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break 'run,
                () = tokio::time::sleep_until(deadline) => break,
                input = next_input(&mut connection, &mut snapshots) => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            for command in engine.handle(next) {
                fetcher.execute(command);
            }
        }

        if let Some(batch) = engine.take_batch() {
            publish(batch);
        }
    }

    fetcher.cancel_all();
    if let Some(batch) = engine.take_batch() {
        publish(batch);
    }
    connection.close().await;
    if !cancel.is_cancelled() {
        warn!("Transport closed, sync engine stopped");
    }
}

/// Next input, snapshot results first; `None` once the transport closed
async fn next_input(
    connection: &mut Connection,
    snapshots: &mut mpsc::UnboundedReceiver<EngineInput>,
) -> Option<EngineInput> {
    tokio::select! {
        biased;
        Some(input) = snapshots.recv() => Some(input),
        event = connection.recv() => event.map(EngineInput::Transport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crm_common::config::{Jitter, TransportConfig};
    use serde_json::json;

    use crate::cdc::{Normalizer, RawChange};
    use crate::memory::MemoryBackend;
    use crate::transport::{TransportAdapter, TransportEvent};

    fn fetcher(backend: &MemoryBackend) -> (SnapshotFetcher, mpsc::UnboundedReceiver<EngineInput>) {
        let mut config = EngineConfig::default();
        config.snapshot_retry.jitter = Jitter::None;
        SnapshotFetcher::new(
            Arc::new(backend.clone()),
            SessionScope::workspace("w1"),
            &config,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_snapshot_failure_is_retried() {
        let backend = MemoryBackend::new();
        backend.set_snapshot(ChannelKey::Leads, vec![json!({"id": 1, "version": 1})]);
        backend.fail_snapshots(ChannelKey::Leads, 2);
        let (mut fetcher, mut rx) = fetcher(&backend);

        fetcher.fetch(ChannelKey::Leads, 3);
        match rx.recv().await.unwrap() {
            EngineInput::SnapshotLoaded { epoch, rows, .. } => {
                assert_eq!(epoch, 3);
                assert_eq!(rows.len(), 1);
            }
            other => panic!("unexpected input {other:?}"),
        }
        assert_eq!(backend.snapshot_count(ChannelKey::Leads), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_snapshot_fails_without_retry() {
        let backend = MemoryBackend::new();
        backend.reject_snapshots(ChannelKey::Jobs, 1);
        let (mut fetcher, mut rx) = fetcher(&backend);

        fetcher.fetch(ChannelKey::Jobs, 1);
        match rx.recv().await.unwrap() {
            EngineInput::SnapshotFailed {
                channel, attempts, ..
            } => {
                assert_eq!(channel, ChannelKey::Jobs);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected input {other:?}"),
        }
        assert_eq!(backend.snapshot_count(ChannelKey::Jobs), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_results_ahead_of_queued_events() {
        let backend = MemoryBackend::new();
        let adapter = TransportAdapter::new(
            Arc::new(backend.clone()),
            SessionScope::workspace("w1"),
            TransportConfig::default(),
            Normalizer::new("version"),
        );
        let mut connection = adapter.connect(HashSet::from([ChannelKey::Leads]));
        assert!(matches!(
            connection.recv().await,
            Some(TransportEvent::Connected { .. })
        ));

        for id in 1..=5 {
            backend.push(RawChange::insert("leads", json!({"id": id, "version": 1})));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (tx, mut snapshots) = mpsc::unbounded_channel();
        tx.send(EngineInput::SnapshotLoaded {
            channel: ChannelKey::Leads,
            epoch: 1,
            rows: Vec::new(),
        })
        .unwrap();

        assert!(matches!(
            next_input(&mut connection, &mut snapshots).await,
            Some(EngineInput::SnapshotLoaded { .. })
        ));
        for _ in 0..5 {
            assert!(matches!(
                next_input(&mut connection, &mut snapshots).await,
                Some(EngineInput::Transport(TransportEvent::Change { .. }))
            ));
        }
        connection.close().await;
    }
}
