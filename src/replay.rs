//! Offline replay of recorded channel traffic
//!
//! Each input line is one JSON object:
//!
//! - `{"channel": "leads", "snapshot": [...]}` sets the rows served on the
//!   channel's next sync
//! - `{"channel": "leads", "change": {...}}` delivers one raw change payload
//! - `{"channel": "leads", "drop": true}` drops the connection; the channel
//!   reconnects and resyncs from the current snapshot rows
//!
//! A channel connects the first time a change or drop names it. Channels
//! never named connect once the input is exhausted. Snapshot rows are served
//! by a [`MemoryBackend`], scoped like the managed backend scopes them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crm_common::config::SyncConfig;
use crm_common::error::{Error, Result};
use crm_common::types::{ChannelKey, EntityId, SessionScope};
use crm_realtime::engine::EngineCommand;
use crm_realtime::selectors::{
    ChannelStatuses, ConversationMessages, ConversationsByActivity, JobsBySchedule,
    JobsWithConversations, LeadsByStage,
};
use crm_realtime::store::SyncStats;
use crm_realtime::{
    EngineInput, MemoryBackend, RawChange, RealtimeBackend, Selector, SelectorRegistry,
    SyncEngine, TransportEvent,
};

/// One line of a replay file
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReplayLine {
    Snapshot {
        channel: ChannelKey,
        snapshot: Vec<Value>,
    },
    Change {
        channel: ChannelKey,
        change: RawChange,
    },
    Drop {
        channel: ChannelKey,
        drop: bool,
    },
}

impl ReplayLine {
    /// Parse one line
    ///
    /// # Errors
    /// Returns `MalformedEvent` naming the line number.
    pub fn parse(line_no: usize, line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|e| Error::malformed(format!("replay line {line_no}: {e}")))
    }
}

/// Final selector outputs of a replay
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub workspace_id: EntityId,
    pub inbox: <ConversationsByActivity as Selector>::Output,
    pub pipeline: <LeadsByStage as Selector>::Output,
    pub schedule: <JobsBySchedule as Selector>::Output,
    pub dispatch: <JobsWithConversations as Selector>::Output,
    /// Messages per inbox conversation
    pub threads: BTreeMap<EntityId, <ConversationMessages as Selector>::Output>,
    pub channels: <ChannelStatuses as Selector>::Output,
    pub stats: SyncStats,
    /// Batches published during the replay
    pub batches: u64,
}

/// Replays recorded traffic through the sync engine
pub struct Replayer {
    backend: MemoryBackend,
    scope: SessionScope,
    engine: SyncEngine,
    registry: Arc<SelectorRegistry>,
    channels: Vec<ChannelKey>,
    connected: HashSet<ChannelKey>,
    batches: u64,
}

impl Replayer {
    /// Create a replayer for the configured session
    ///
    /// # Errors
    /// Returns `ConfigError` when the configuration is invalid.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let channels = config.transport.channels.clone();
        Ok(Self {
            backend: MemoryBackend::new(),
            scope: config.scope(),
            engine: SyncEngine::new(&config.engine, channels.iter().copied()),
            registry: Arc::new(SelectorRegistry::new()),
            channels,
            connected: HashSet::new(),
            batches: 0,
        })
    }

    /// Registry notified after every line
    #[must_use]
    pub fn registry(&self) -> &Arc<SelectorRegistry> {
        &self.registry
    }

    /// Apply one line and publish the resulting batch
    ///
    /// # Errors
    /// Returns an error when the backend cannot serve a snapshot.
    pub async fn feed(&mut self, line: ReplayLine) -> Result<()> {
        match line {
            ReplayLine::Snapshot { channel, snapshot } => {
                debug!("Replay: {} snapshot rows for {}", snapshot.len(), channel);
                self.backend.set_snapshot(channel, snapshot);
            }
            ReplayLine::Change { channel, change } => {
                self.ensure_connected(channel).await?;
                let event = match self.engine.normalizer().normalize(&change) {
                    Ok(event) => TransportEvent::Change { channel, event },
                    Err(e) => TransportEvent::Malformed {
                        channel,
                        reason: e.to_string(),
                    },
                };
                self.dispatch(EngineInput::Transport(event)).await?;
            }
            ReplayLine::Drop { channel, drop } => {
                if !drop {
                    return Ok(());
                }
                if self.connected.contains(&channel) {
                    self.dispatch(EngineInput::Transport(TransportEvent::Disconnected {
                        channel,
                        reason: "replayed drop".into(),
                    }))
                    .await?;
                    self.dispatch(EngineInput::Transport(TransportEvent::Connected {
                        channel,
                        reconnect: true,
                    }))
                    .await?;
                } else {
                    self.ensure_connected(channel).await?;
                }
            }
        }
        self.publish();
        Ok(())
    }

    /// Connect the channels no line named, then collect the selector outputs
    ///
    /// # Errors
    /// Returns an error when the backend cannot serve a snapshot.
    pub async fn finish(mut self) -> Result<ReplayReport> {
        for channel in self.channels.clone() {
            self.ensure_connected(channel).await?;
        }
        self.publish();

        let workspace_id = EntityId::new(self.scope.workspace_id.clone());
        let store = self.registry.current();
        let inbox = ConversationsByActivity {
            workspace_id: workspace_id.clone(),
        }
        .select(&store);
        let threads = inbox
            .iter()
            .map(|c| {
                let thread = ConversationMessages {
                    conversation_id: c.id.clone(),
                }
                .select(&store);
                (c.id.clone(), thread)
            })
            .collect();

        info!(
            "Replay finished after {} batches ({} applied, {} stale, {} malformed)",
            self.batches, store.stats.applied, store.stats.stale_discarded, store.stats.malformed
        );
        Ok(ReplayReport {
            pipeline: LeadsByStage {
                workspace_id: workspace_id.clone(),
            }
            .select(&store),
            schedule: JobsBySchedule {
                workspace_id: workspace_id.clone(),
            }
            .select(&store),
            dispatch: JobsWithConversations {
                workspace_id: workspace_id.clone(),
            }
            .select(&store),
            channels: ChannelStatuses.select(&store),
            stats: store.stats,
            batches: self.batches,
            inbox,
            threads,
            workspace_id,
        })
    }

    async fn ensure_connected(&mut self, channel: ChannelKey) -> Result<()> {
        if !self.connected.insert(channel) {
            return Ok(());
        }
        self.dispatch(EngineInput::Transport(TransportEvent::Connected {
            channel,
            reconnect: false,
        }))
        .await
    }

    /// Feed an input and run the snapshot fetches it asks for to completion
    async fn dispatch(&mut self, input: EngineInput) -> Result<()> {
        let mut pending = vec![input];
        while let Some(input) = pending.pop() {
            for command in self.engine.handle(input) {
                if let EngineCommand::FetchSnapshot { channel, epoch } = command {
                    let loaded = match self.backend.fetch_snapshot(channel, &self.scope).await {
                        Ok(rows) => EngineInput::SnapshotLoaded {
                            channel,
                            epoch,
                            rows,
                        },
                        Err(e) => {
                            warn!("Replay snapshot for {} failed: {}", channel, e);
                            EngineInput::SnapshotFailed {
                                channel,
                                epoch,
                                attempts: 1,
                                reason: e.to_string(),
                            }
                        }
                    };
                    pending.push(loaded);
                }
            }
        }
        Ok(())
    }

    fn publish(&mut self) {
        if let Some(batch) = self.engine.take_batch() {
            self.batches += 1;
            self.registry.notify(&batch);
        }
    }
}

/// Replay a whole JSON-lines document. Blank lines and `#` comments are
/// skipped.
///
/// # Errors
/// Returns the first unparseable line or backend failure.
pub async fn replay(config: &SyncConfig, input: &str) -> Result<ReplayReport> {
    let mut replayer = Replayer::new(config)?;
    for (index, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        replayer.feed(ReplayLine::parse(index + 1, line)?).await?;
    }
    replayer.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.session.workspace_id = "w1".into();
        config
    }

    #[test]
    fn test_parse_lines() {
        assert!(matches!(
            ReplayLine::parse(1, r#"{"channel": "leads", "snapshot": []}"#).unwrap(),
            ReplayLine::Snapshot { channel: ChannelKey::Leads, .. }
        ));
        assert!(matches!(
            ReplayLine::parse(
                2,
                r#"{"channel": "jobs", "change": {"table": "dispatch_jobs", "type": "INSERT", "record": {"id": "j1", "version": 1}}}"#
            )
            .unwrap(),
            ReplayLine::Change { channel: ChannelKey::Jobs, .. }
        ));
        assert!(matches!(
            ReplayLine::parse(3, r#"{"channel": "messages", "drop": true}"#).unwrap(),
            ReplayLine::Drop { drop: true, .. }
        ));
        let err = ReplayLine::parse(4, r#"{"channel": "leads"}"#).unwrap_err();
        assert!(err.to_string().contains("replay line 4"));
    }

    #[tokio::test]
    async fn test_replay_snapshot_then_changes() {
        let input = r#"
# pipeline with one late update
{"channel": "leads", "snapshot": [{"id": "1", "version": 1, "workspace_id": "w1", "stage": "new"}, {"id": "2", "version": 1, "workspace_id": "w2"}]}
{"channel": "leads", "change": {"table": "leads", "type": "UPDATE", "record": {"id": "1", "version": 3, "workspace_id": "w1", "stage": "won"}}}
{"channel": "leads", "change": {"table": "leads", "type": "UPDATE", "record": {"id": "1", "version": 2, "workspace_id": "w1", "stage": "lost"}}}
"#;
        let report = replay(&config(), input).await.unwrap();

        assert_eq!(report.pipeline.len(), 1);
        let won = &report.pipeline["won"];
        assert_eq!(won.len(), 1);
        assert_eq!(won[0].version, 3);
        assert_eq!(report.stats.stale_discarded, 1);
        assert!(report.channels.values().all(|s| s.is_live()));
    }

    #[tokio::test]
    async fn test_replay_drop_resyncs() {
        let input = r#"
{"channel": "conversations", "snapshot": [{"id": "c1", "version": 1, "workspace_id": "w1"}, {"id": "c2", "version": 1, "workspace_id": "w1"}]}
{"channel": "conversations", "drop": true}
{"channel": "conversations", "snapshot": [{"id": "c1", "version": 2, "workspace_id": "w1"}]}
{"channel": "conversations", "drop": true}
"#;
        let report = replay(&config(), input).await.unwrap();

        let ids: Vec<_> = report.inbox.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1"]);
        assert_eq!(report.inbox[0].version, 2);
        assert_eq!(report.channels[&ChannelKey::Conversations].resyncs, 2);
    }

    #[tokio::test]
    async fn test_replay_counts_malformed() {
        let input = r#"
{"channel": "messages", "change": {"table": "messages", "type": "INSERT", "record": {"version": 1}}}
{"channel": "messages", "change": {"table": "messages", "type": "INSERT", "record": {"id": "m1", "version": 1, "workspace_id": "w1", "conversation_id": "c1"}}}
"#;
        let report = replay(&config(), input).await.unwrap();
        assert_eq!(report.stats.malformed, 1);
        assert!(report.threads.is_empty());
        assert_eq!(report.channels[&ChannelKey::Messages].resyncs, 1);
    }
}
