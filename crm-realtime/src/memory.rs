//! In-process backend
//!
//! Scripted snapshots, pushed changes, forced drops and injected failures.
//! Rows carrying a `workspace_id` are only visible to sessions of that
//! workspace, like the managed backend's row filter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crm_common::error::{Error, Result};
use crm_common::types::{ChannelKey, EntityId, EntityKind, SessionScope};

use crate::cdc::RawChange;
use crate::transport::{RawChangeStream, RealtimeBackend};

struct Subscriber {
    channel: ChannelKey,
    scope: SessionScope,
    tx: mpsc::UnboundedSender<Result<RawChange>>,
}

#[derive(Default)]
struct Inner {
    snapshots: HashMap<ChannelKey, Vec<Value>>,
    subscribers: Vec<Subscriber>,
    subscribe_failures: HashMap<ChannelKey, u32>,
    snapshot_failures: HashMap<ChannelKey, u32>,
    snapshot_rejections: HashMap<ChannelKey, u32>,
    subscribe_calls: HashMap<ChannelKey, u32>,
    snapshot_calls: HashMap<ChannelKey, u32>,
    snapshot_delay: Option<Duration>,
}

/// Backend living entirely in memory
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned by the next snapshot fetches of `channel`
    pub fn set_snapshot(&self, channel: ChannelKey, rows: Vec<Value>) {
        self.inner.lock().snapshots.insert(channel, rows);
    }

    /// Deliver a change to every open subscription of its table's channel.
    /// Changes for unknown tables go to every subscription.
    pub fn push(&self, change: RawChange) {
        let target = EntityKind::from_table(&change.table).map(EntityKind::channel);
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| {
            if target.is_some_and(|c| c != s.channel) || !change_visible(&s.scope, &change) {
                return !s.tx.is_closed();
            }
            s.tx.send(Ok(change.clone())).is_ok()
        });
    }

    /// Deliver a change to the subscriptions of one channel, unfiltered
    pub fn push_to(&self, channel: ChannelKey, change: RawChange) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| {
            if s.channel != channel {
                return !s.tx.is_closed();
            }
            s.tx.send(Ok(change.clone())).is_ok()
        });
    }

    /// End every open subscription
    pub fn drop_connections(&self) {
        self.inner.lock().subscribers.clear();
    }

    /// End the subscriptions of one channel with an error
    pub fn fail_channel(&self, channel: ChannelKey, reason: &str) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|s| {
            if s.channel == channel {
                let _ = s.tx.send(Err(Error::Transport(reason.to_string())));
                false
            } else {
                true
            }
        });
    }

    /// Make the next `n` subscribe calls for `channel` fail
    pub fn fail_subscribes(&self, channel: ChannelKey, n: u32) {
        self.inner.lock().subscribe_failures.insert(channel, n);
    }

    /// Make the next `n` snapshot fetches for `channel` fail
    pub fn fail_snapshots(&self, channel: ChannelKey, n: u32) {
        self.inner.lock().snapshot_failures.insert(channel, n);
    }

    /// Make the next `n` snapshot fetches for `channel` fail permanently
    pub fn reject_snapshots(&self, channel: ChannelKey, n: u32) {
        self.inner.lock().snapshot_rejections.insert(channel, n);
    }

    /// Delay every snapshot fetch
    pub fn set_snapshot_delay(&self, delay: Option<Duration>) {
        self.inner.lock().snapshot_delay = delay;
    }

    /// Subscribe calls made for `channel`, failed ones included
    #[must_use]
    pub fn subscribe_count(&self, channel: ChannelKey) -> u32 {
        self.inner
            .lock()
            .subscribe_calls
            .get(&channel)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot fetches started for `channel`, failed ones included
    #[must_use]
    pub fn snapshot_count(&self, channel: ChannelKey) -> u32 {
        self.inner
            .lock()
            .snapshot_calls
            .get(&channel)
            .copied()
            .unwrap_or(0)
    }

    /// Currently open subscriptions of `channel`
    #[must_use]
    pub fn active_subscriptions(&self, channel: ChannelKey) -> usize {
        self.inner
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.channel == channel && !s.tx.is_closed())
            .count()
    }
}

#[async_trait]
impl RealtimeBackend for MemoryBackend {
    async fn subscribe(&self, channel: ChannelKey, scope: &SessionScope) -> Result<RawChangeStream> {
        let mut inner = self.inner.lock();
        *inner.subscribe_calls.entry(channel).or_default() += 1;
        if take_failure(&mut inner.subscribe_failures, channel) {
            return Err(Error::Transport(format!("{channel}: connection refused")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push(Subscriber {
            channel,
            scope: scope.clone(),
            tx,
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn fetch_snapshot(&self, channel: ChannelKey, scope: &SessionScope) -> Result<Vec<Value>> {
        let delay = {
            let mut inner = self.inner.lock();
            *inner.snapshot_calls.entry(channel).or_default() += 1;
            inner.snapshot_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if take_failure(&mut inner.snapshot_rejections, channel) {
            return Err(Error::SnapshotRejected(format!("{channel}: permission denied")));
        }
        if take_failure(&mut inner.snapshot_failures, channel) {
            return Err(Error::Snapshot(format!("{channel}: service unavailable")));
        }
        Ok(inner
            .snapshots
            .get(&channel)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row_visible(scope, row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn take_failure(failures: &mut HashMap<ChannelKey, u32>, channel: ChannelKey) -> bool {
    match failures.get_mut(&channel) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

fn row_visible(scope: &SessionScope, row: &Value) -> bool {
    match row.get("workspace_id").filter(|v| !v.is_null()) {
        Some(value) => EntityId::from_json(value)
            .is_some_and(|id| id.as_str() == scope.workspace_id),
        None => true,
    }
}

fn change_visible(scope: &SessionScope, change: &RawChange) -> bool {
    [change.record.as_ref(), change.old_record.as_ref()]
        .into_iter()
        .flatten()
        .all(|row| row_visible(scope, row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_snapshot_scoped_to_workspace() {
        let backend = MemoryBackend::new();
        backend.set_snapshot(
            ChannelKey::Leads,
            vec![
                json!({"id": 1, "version": 1, "workspace_id": "w1"}),
                json!({"id": 2, "version": 1, "workspace_id": "w2"}),
                json!({"id": 3, "version": 1}),
            ],
        );
        let rows = backend
            .fetch_snapshot(ChannelKey::Leads, &SessionScope::workspace("w1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(backend.snapshot_count(ChannelKey::Leads), 1);
    }

    #[tokio::test]
    async fn test_push_routes_by_table() {
        let backend = MemoryBackend::new();
        let scope = SessionScope::workspace("w1");
        let mut leads = backend.subscribe(ChannelKey::Leads, &scope).await.unwrap();
        let mut jobs = backend.subscribe(ChannelKey::Jobs, &scope).await.unwrap();

        backend.push(RawChange::insert("leads", json!({"id": 1, "version": 1})));
        backend.push(RawChange::insert(
            "leads",
            json!({"id": 2, "version": 1, "workspace_id": "w2"}),
        ));
        backend.drop_connections();

        let received: Vec<_> = leads.by_ref().collect().await;
        assert_eq!(received.len(), 1);
        assert!(jobs.next().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MemoryBackend::new();
        let scope = SessionScope::workspace("w1");
        backend.fail_subscribes(ChannelKey::Messages, 1);
        backend.fail_snapshots(ChannelKey::Messages, 1);

        assert!(backend.subscribe(ChannelKey::Messages, &scope).await.is_err());
        assert!(backend.subscribe(ChannelKey::Messages, &scope).await.is_ok());
        assert!(backend
            .fetch_snapshot(ChannelKey::Messages, &scope)
            .await
            .is_err());
        assert!(backend
            .fetch_snapshot(ChannelKey::Messages, &scope)
            .await
            .is_ok());
        assert_eq!(backend.subscribe_count(ChannelKey::Messages), 2);
        assert_eq!(backend.active_subscriptions(ChannelKey::Messages), 1);
    }
}
