//! Transport adapter
//!
//! Keeps one backend subscription per channel alive, normalizes raw payloads
//! and forwards them to the engine. Delivery is at-least-once: duplicates are
//! passed through untouched and resolved by the entity tables.
//!
//! After an unexpected disconnect the adapter reconnects with exponential
//! backoff. Once `max_connect_attempts` consecutive attempts fail it reports
//! [`TransportEvent::Degraded`], cools down for one maximum delay and keeps
//! trying. A join that drops before delivering an event or outliving one
//! maximum delay counts as a failed attempt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crm_common::config::TransportConfig;
use crm_common::error::Result;
use crm_common::types::{ChangeEvent, ChannelKey, SessionScope};

use crate::backoff::{Backoff, RetryDecision, RetrySchedule};
use crate::cdc::{Normalizer, RawChange};

/// Live change feed of one channel. Ends (or yields an error) on disconnect.
pub type RawChangeStream = BoxStream<'static, Result<RawChange>>;

/// Backend providing change feeds and snapshot queries
#[async_trait]
pub trait RealtimeBackend: Send + Sync + 'static {
    /// Open the change feed of a channel, scoped to the session
    async fn subscribe(&self, channel: ChannelKey, scope: &SessionScope) -> Result<RawChangeStream>;

    /// Fetch every row of the channel visible to the session
    async fn fetch_snapshot(&self, channel: ChannelKey, scope: &SessionScope) -> Result<Vec<Value>>;
}

/// Event emitted by a connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Subscription established; `reconnect` is set after a previous drop
    Connected { channel: ChannelKey, reconnect: bool },
    Change { channel: ChannelKey, event: ChangeEvent },
    Malformed { channel: ChannelKey, reason: String },
    Disconnected { channel: ChannelKey, reason: String },
    /// Bounded reconnect attempts exhausted
    Degraded { channel: ChannelKey, attempts: u32 },
}

impl TransportEvent {
    #[must_use]
    pub fn channel(&self) -> ChannelKey {
        match self {
            Self::Connected { channel, .. }
            | Self::Change { channel, .. }
            | Self::Malformed { channel, .. }
            | Self::Disconnected { channel, .. }
            | Self::Degraded { channel, .. } => *channel,
        }
    }
}

/// Opens connections against a backend
pub struct TransportAdapter {
    backend: Arc<dyn RealtimeBackend>,
    scope: SessionScope,
    config: TransportConfig,
    normalizer: Normalizer,
    seed: Option<u64>,
}

impl TransportAdapter {
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        scope: SessionScope,
        config: TransportConfig,
        normalizer: Normalizer,
    ) -> Self {
        Self {
            backend,
            scope,
            config,
            normalizer,
            seed: None,
        }
    }

    /// Seed the retry jitter (per channel, offset by channel index)
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Subscribe to every channel in `channels`
    pub fn connect(&self, channels: HashSet<ChannelKey>) -> Connection {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let cancel = CancellationToken::new();

        let mut channels: Vec<_> = channels.into_iter().collect();
        channels.sort();

        let tasks = channels
            .into_iter()
            .enumerate()
            .map(|(index, channel)| {
                let backoff = match self.seed {
                    Some(seed) => {
                        Backoff::with_seed(self.config.retry.clone(), seed.wrapping_add(index as u64))
                    }
                    None => Backoff::new(self.config.retry.clone()),
                };
                let worker = ChannelWorker {
                    channel,
                    backend: Arc::clone(&self.backend),
                    scope: self.scope.clone(),
                    normalizer: self.normalizer.clone(),
                    schedule: RetrySchedule::from_backoff(backoff, self.config.max_connect_attempts),
                    tx: tx.clone(),
                    cancel: cancel.child_token(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Connection {
            events: Some(rx),
            cancel,
            tasks,
        }
    }
}

/// Open set of channel subscriptions
pub struct Connection {
    events: Option<mpsc::Receiver<TransportEvent>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Next event; `None` once closed or handed to [`Connection::on_event`]
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Deliver every event to `handler` from a background task
    pub fn on_event<F>(&mut self, mut handler: F)
    where
        F: FnMut(TransportEvent) + Send + 'static,
    {
        let Some(mut events) = self.events.take() else {
            return;
        };
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => handler(event),
                        None => break,
                    },
                }
            }
        }));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close every subscription and wait for the channel tasks to stop
    pub async fn close(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ChannelWorker {
    channel: ChannelKey,
    backend: Arc<dyn RealtimeBackend>,
    scope: SessionScope,
    normalizer: Normalizer,
    schedule: RetrySchedule,
    tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl ChannelWorker {
    async fn run(mut self) {
        let mut connected_before = false;
        loop {
            let subscribed = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.backend.subscribe(self.channel, &self.scope) => result,
            };

            match subscribed {
                Ok(stream) => {
                    info!("Subscribed to channel {}", self.channel);
                    let connected = TransportEvent::Connected {
                        channel: self.channel,
                        reconnect: connected_before,
                    };
                    connected_before = true;
                    if !self.send(connected).await {
                        return;
                    }
                    let Some(reason) = self.pump(stream).await else {
                        return;
                    };
                    let dropped = TransportEvent::Disconnected {
                        channel: self.channel,
                        reason,
                    };
                    if !self.send(dropped).await {
                        return;
                    }
                }
                Err(e) => {
                    debug!("Subscribe to {} failed: {}", self.channel, e);
                }
            }

            let delay = match self.schedule.on_failure(Instant::now()) {
                RetryDecision::Retry { attempt, delay } => {
                    debug!(
                        "Reconnecting {} in {:?} (attempt {})",
                        self.channel, delay, attempt
                    );
                    delay
                }
                RetryDecision::Exhausted { attempts } => {
                    warn!(
                        "Channel {} degraded after {} connection attempts",
                        self.channel, attempts
                    );
                    let degraded = TransportEvent::Degraded {
                        channel: self.channel,
                        attempts,
                    };
                    if !self.send(degraded).await {
                        return;
                    }
                    self.schedule.reset();
                    self.schedule.cool_down()
                }
            };
            if !self.sleep(delay).await {
                return;
            }
        }
    }

    /// Forward events until the stream ends. Returns the disconnect reason,
    /// or `None` when the connection was closed.
    async fn pump(&mut self, mut stream: RawChangeStream) -> Option<String> {
        let window = tokio::time::sleep(self.schedule.cool_down());
        tokio::pin!(window);
        let mut stable = false;
        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = &mut window, if !stable => None,
                item = stream.next() => Some(item),
            };
            let Some(item) = item else {
                stable = self.mark_stable();
                continue;
            };
            if !stable && matches!(item, Some(Ok(_))) {
                stable = self.mark_stable();
            }
            let event = match item {
                Some(Ok(raw)) => match self.normalizer.normalize(&raw) {
                    Ok(event) => TransportEvent::Change {
                        channel: self.channel,
                        event,
                    },
                    Err(e) => TransportEvent::Malformed {
                        channel: self.channel,
                        reason: e.to_string(),
                    },
                },
                Some(Err(e)) => return Some(e.to_string()),
                None => return Some("stream ended".to_string()),
            };
            if !self.send(event).await {
                return None;
            }
        }
    }

    /// The connection proved itself; the next drop starts from the base delay
    fn mark_stable(&mut self) -> bool {
        if self.schedule.failures() > 0 {
            debug!("Channel {} is stable, resetting backoff", self.channel);
        }
        self.schedule.on_success();
        true
    }

    async fn send(&self, event: TransportEvent) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crm_common::config::{Jitter, RetryPolicy};
    use crm_common::error::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Accepts every join, then ends the feed with an error straight away
    #[derive(Default)]
    struct FlappingBackend {
        subscribes: AtomicU32,
    }

    #[async_trait]
    impl RealtimeBackend for FlappingBackend {
        async fn subscribe(&self, channel: ChannelKey, _scope: &SessionScope) -> Result<RawChangeStream> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let reset = Err(Error::Transport(format!("{channel}: reset by peer")));
            Ok(futures::stream::iter([reset]).boxed())
        }

        async fn fetch_snapshot(&self, _channel: ChannelKey, _scope: &SessionScope) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    fn adapter(backend: &MemoryBackend, max_attempts: u32) -> TransportAdapter {
        adapter_for(Arc::new(backend.clone()), max_attempts)
    }

    fn adapter_for(backend: Arc<dyn RealtimeBackend>, max_attempts: u32) -> TransportAdapter {
        let config = TransportConfig {
            retry: RetryPolicy {
                jitter: Jitter::None,
                ..RetryPolicy::default()
            },
            max_connect_attempts: max_attempts,
            ..TransportConfig::default()
        };
        TransportAdapter::new(
            backend,
            SessionScope::workspace("w1"),
            config,
            Normalizer::new("version"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_forward_changes() {
        let backend = MemoryBackend::new();
        let mut conn = adapter(&backend, 3).connect(HashSet::from([ChannelKey::Leads]));

        let first = conn.recv().await.unwrap();
        assert!(matches!(
            first,
            TransportEvent::Connected {
                channel: ChannelKey::Leads,
                reconnect: false
            }
        ));

        backend.push(RawChange::insert("leads", json!({"id": 1, "version": 1})));
        backend.push(RawChange::insert("leads", json!({"id": 1, "version": 1})));
        backend.push(RawChange::insert("leads", json!({"version": 1})));

        // Duplicates pass through untouched
        for _ in 0..2 {
            assert!(matches!(
                conn.recv().await.unwrap(),
                TransportEvent::Change { .. }
            ));
        }
        assert!(matches!(
            conn.recv().await.unwrap(),
            TransportEvent::Malformed { .. }
        ));
        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_drop() {
        let backend = MemoryBackend::new();
        let mut conn = adapter(&backend, 3).connect(HashSet::from([ChannelKey::Jobs]));
        assert!(matches!(
            conn.recv().await.unwrap(),
            TransportEvent::Connected { .. }
        ));

        backend.drop_connections();
        assert!(matches!(
            conn.recv().await.unwrap(),
            TransportEvent::Disconnected {
                channel: ChannelKey::Jobs,
                ..
            }
        ));
        let started = Instant::now();
        assert!(matches!(
            conn.recv().await.unwrap(),
            TransportEvent::Connected {
                reconnect: true,
                ..
            }
        ));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(backend.subscribe_count(ChannelKey::Jobs), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_after_bounded_attempts() {
        let backend = MemoryBackend::new();
        backend.fail_subscribes(ChannelKey::Messages, 3);
        let mut conn = adapter(&backend, 3).connect(HashSet::from([ChannelKey::Messages]));

        assert!(matches!(
            conn.recv().await.unwrap(),
            TransportEvent::Degraded {
                channel: ChannelKey::Messages,
                attempts: 3
            }
        ));
        // Keeps trying after the cool-down and recovers
        assert!(matches!(
            conn.recv().await.unwrap(),
            TransportEvent::Connected { .. }
        ));
        assert_eq!(backend.subscribe_count(ChannelKey::Messages), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_connection_backs_off_and_degrades() {
        let backend = Arc::new(FlappingBackend::default());
        let mut conn = adapter_for(backend.clone(), 3).connect(HashSet::from([ChannelKey::Leads]));

        let deadline = Instant::now() + Duration::from_secs(60);
        let mut degraded = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, conn.recv()).await {
            if let TransportEvent::Degraded { attempts, .. } = event {
                degraded.push(attempts);
            }
        }

        // Joins at 0s, 0.5s and 1.5s, then again after each 30s cool-down
        assert_eq!(degraded, vec![3, 3]);
        assert_eq!(backend.subscribes.load(Ordering::SeqCst), 6);
        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_connection_resets_backoff() {
        let backend = MemoryBackend::new();
        let mut conn = adapter(&backend, 8).connect(HashSet::from([ChannelKey::Leads]));
        assert!(matches!(conn.recv().await.unwrap(), TransportEvent::Connected { .. }));

        // Two quick drops back off to 1s
        for expected in [500, 1000] {
            backend.drop_connections();
            assert!(matches!(conn.recv().await.unwrap(), TransportEvent::Disconnected { .. }));
            let started = Instant::now();
            assert!(matches!(conn.recv().await.unwrap(), TransportEvent::Connected { .. }));
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_millis(expected), "{elapsed:?}");
            assert!(elapsed < Duration::from_millis(expected + 100), "{elapsed:?}");
        }

        // A delivered event proves the join, so the next drop starts over
        backend.push(RawChange::insert("leads", json!({"id": 1, "version": 1})));
        assert!(matches!(conn.recv().await.unwrap(), TransportEvent::Change { .. }));
        backend.drop_connections();
        assert!(matches!(conn.recv().await.unwrap(), TransportEvent::Disconnected { .. }));
        let started = Instant::now();
        assert!(matches!(conn.recv().await.unwrap(), TransportEvent::Connected { .. }));
        assert!(started.elapsed() < Duration::from_millis(1000));
        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_event_handler() {
        let backend = MemoryBackend::new();
        let mut conn = adapter(&backend, 3).connect(HashSet::from([ChannelKey::Leads]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.on_event(move |event| {
            let _ = tx.send(event.channel());
        });
        assert_eq!(rx.recv().await, Some(ChannelKey::Leads));
        assert!(conn.recv().await.is_none());
        conn.close().await;
    }
}
