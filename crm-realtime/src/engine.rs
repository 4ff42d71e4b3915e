//! Synchronization engine
//!
//! Owns the entity tables and the per-channel state machines. The engine is a
//! plain state machine: inputs go in through [`SyncEngine::handle`], snapshot
//! fetches come out as [`EngineCommand`]s, and applied work is drained as one
//! [`Batch`] per scheduling tick. The async plumbing around it lives in
//! [`crate::driver`].

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crm_common::config::EngineConfig;
use crm_common::error::{Error, Result};
use crm_common::types::{
    ChangeEvent, ChannelKey, Entity, EntityId, EntityKind, Operation,
};
use crm_common::types::{Conversation, Job, Lead, Message};

use crate::cdc::Normalizer;
use crate::channel::{ChannelSet, ChannelStatus};
use crate::store::{StoreSnapshot, SyncStats};
use crate::table::{ApplyOutcome, EntityTable};
use crate::transport::TransportEvent;

/// Input to the engine
#[derive(Debug, Clone)]
pub enum EngineInput {
    Transport(TransportEvent),
    SnapshotLoaded {
        channel: ChannelKey,
        epoch: u64,
        rows: Vec<Value>,
    },
    SnapshotFailed {
        channel: ChannelKey,
        epoch: u64,
        attempts: u32,
        reason: String,
    },
}

/// Side effect requested by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    FetchSnapshot { channel: ChannelKey, epoch: u64 },
    CancelSnapshot { channel: ChannelKey },
}

/// What a batch changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Touched {
    kinds: BTreeSet<EntityKind>,
    ids: HashSet<(EntityKind, EntityId)>,
    channels: BTreeSet<ChannelKey>,
}

impl Touched {
    /// Every channel's status changed; used when a whole store is swapped
    #[must_use]
    pub fn all_channels() -> Self {
        Self {
            channels: ChannelKey::ALL.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, kind: EntityKind, id: EntityId) {
        self.kinds.insert(kind);
        self.ids.insert((kind, id));
    }

    pub fn status_changed(&mut self, channel: ChannelKey) {
        self.channels.insert(channel);
    }

    #[must_use]
    pub fn touches_kind(&self, kind: EntityKind) -> bool {
        self.kinds.contains(&kind)
    }

    #[must_use]
    pub fn contains(&self, kind: EntityKind, id: &EntityId) -> bool {
        self.ids.contains(&(kind, id.clone()))
    }

    /// Ids of one kind touched in this batch
    pub fn ids(&self, kind: EntityKind) -> impl Iterator<Item = &EntityId> {
        self.ids
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, id)| id)
    }

    #[must_use]
    pub fn channel_changed(&self, channel: ChannelKey) -> bool {
        self.channels.contains(&channel)
    }

    #[must_use]
    pub fn kinds(&self) -> &BTreeSet<EntityKind> {
        &self.kinds
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty() && self.channels.is_empty()
    }
}

/// One coalesced notification: everything applied since the previous batch,
/// published as a single consistent snapshot
#[derive(Debug, Clone)]
pub struct Batch {
    pub seq: u64,
    pub touched: Touched,
    pub snapshot: Arc<StoreSnapshot>,
}

/// Applies change events and snapshots to the entity tables
#[derive(Debug)]
pub struct SyncEngine {
    normalizer: Normalizer,
    malformed_threshold: u32,
    leads: EntityTable<Lead>,
    conversations: EntityTable<Conversation>,
    jobs: EntityTable<Job>,
    messages: EntityTable<Message>,
    channels: ChannelSet,
    stats: SyncStats,
    touched: Touched,
    dirty: bool,
    seq: u64,
}

impl SyncEngine {
    pub fn new(config: &EngineConfig, channels: impl IntoIterator<Item = ChannelKey>) -> Self {
        let capacity = config.tombstone_capacity;
        Self {
            normalizer: Normalizer::new(config.version_column.clone()),
            malformed_threshold: config.malformed_threshold.max(1),
            leads: EntityTable::new().with_tombstone_capacity(capacity),
            conversations: EntityTable::new().with_tombstone_capacity(capacity),
            jobs: EntityTable::new().with_tombstone_capacity(capacity),
            messages: EntityTable::new().with_tombstone_capacity(capacity),
            channels: ChannelSet::new(channels),
            stats: SyncStats::default(),
            touched: Touched::default(),
            dirty: true,
            seq: 0,
        }
    }

    /// Start from a previously published snapshot. Its records are served
    /// (flagged stale) until each channel resyncs.
    pub fn with_baseline(
        config: &EngineConfig,
        channels: impl IntoIterator<Item = ChannelKey>,
        baseline: &StoreSnapshot,
    ) -> Self {
        let capacity = config.tombstone_capacity;
        let mut engine = Self::new(config, channels);
        engine.leads = EntityTable::from_view(&baseline.leads).with_tombstone_capacity(capacity);
        engine.conversations =
            EntityTable::from_view(&baseline.conversations).with_tombstone_capacity(capacity);
        engine.jobs = EntityTable::from_view(&baseline.jobs).with_tombstone_capacity(capacity);
        engine.messages =
            EntityTable::from_view(&baseline.messages).with_tombstone_capacity(capacity);
        engine.seq = baseline.seq;
        for channel in engine.channels.iter_mut() {
            channel.mark_stale();
        }
        engine
    }

    /// Feed one input; returns the snapshot fetches to start or cancel
    pub fn handle(&mut self, input: EngineInput) -> Vec<EngineCommand> {
        match input {
            EngineInput::Transport(event) => self.on_transport(event),
            EngineInput::SnapshotLoaded {
                channel,
                epoch,
                rows,
            } => {
                if self.accepts_snapshot(channel, epoch) {
                    self.load_snapshot(channel, &rows);
                } else {
                    debug!("Discarding snapshot for {} from epoch {}", channel, epoch);
                }
                Vec::new()
            }
            EngineInput::SnapshotFailed {
                channel,
                epoch,
                attempts,
                reason,
            } => {
                if self.accepts_snapshot(channel, epoch) {
                    self.snapshot_exhausted(channel, attempts, reason);
                }
                Vec::new()
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> Vec<EngineCommand> {
        match event {
            TransportEvent::Connected { channel, reconnect } => {
                let Some(sync) = self.channels.get_mut(channel) else {
                    return Vec::new();
                };
                let epoch = sync.begin_sync();
                info!(
                    "Channel {} {}, syncing (epoch {})",
                    channel,
                    if reconnect { "reconnected" } else { "connected" },
                    epoch
                );
                self.status_changed(channel);
                vec![EngineCommand::FetchSnapshot { channel, epoch }]
            }
            TransportEvent::Change { channel, event } => {
                self.on_change(channel, event);
                Vec::new()
            }
            TransportEvent::Malformed { channel, reason } => {
                self.on_malformed(channel, &reason);
                Vec::new()
            }
            TransportEvent::Disconnected { channel, reason } => {
                let Some(sync) = self.channels.get_mut(channel) else {
                    return Vec::new();
                };
                sync.disconnect();
                warn!("Channel {} disconnected: {}", channel, reason);
                self.status_changed(channel);
                vec![EngineCommand::CancelSnapshot { channel }]
            }
            TransportEvent::Degraded { channel, attempts } => {
                let Some(sync) = self.channels.get_mut(channel) else {
                    return Vec::new();
                };
                sync.mark_transport_degraded(attempts);
                let err = Error::TransportDegraded {
                    channel: channel.to_string(),
                    attempts,
                };
                warn!(code = err.error_code(), "{}", err);
                self.status_changed(channel);
                Vec::new()
            }
        }
    }

    fn on_change(&mut self, arrived_on: ChannelKey, event: ChangeEvent) {
        let target = event.channel();
        let Some(sync) = self.channels.get_mut(target) else {
            self.on_malformed(arrived_on, &format!("event for untracked channel {target}"));
            return;
        };
        if sync.should_buffer() {
            sync.buffer(event);
            self.stats.buffered += 1;
            self.dirty = true;
            return;
        }
        // Failures are already counted against the channel
        let _ = self.apply_event(event);
    }

    fn accepts_snapshot(&self, channel: ChannelKey, epoch: u64) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|c| c.accepts_snapshot(epoch))
    }

    /// Apply one event to its table under the version rule.
    ///
    /// # Errors
    /// Returns `MalformedEvent` when the payload does not decode into the
    /// entity type; the failure is counted against the event's channel.
    pub fn apply_event(&mut self, event: ChangeEvent) -> Result<ApplyOutcome> {
        let kind = event.entity_kind;
        let result = match kind {
            EntityKind::Lead => apply_to(&mut self.leads, &event),
            EntityKind::Conversation => apply_to(&mut self.conversations, &event),
            EntityKind::Job => apply_to(&mut self.jobs, &event),
            EntityKind::Message => apply_to(&mut self.messages, &event),
        };
        match result {
            Ok(outcome) => {
                self.record_outcome(&event, outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.on_malformed(kind.channel(), &e.to_string());
                Err(e)
            }
        }
    }

    fn record_outcome(&mut self, event: &ChangeEvent, outcome: ApplyOutcome) {
        let channel = event.channel();
        if self
            .channels
            .get_mut(channel)
            .is_some_and(|c| c.record_valid())
        {
            info!("Channel {} recovered from malformed payloads", channel);
            self.status_changed(channel);
        }
        match outcome {
            ApplyOutcome::Stale { stored } => {
                self.stats.stale_discarded += 1;
                let stale = Error::StaleEvent {
                    kind: event.entity_kind.to_string(),
                    id: event.entity_id.to_string(),
                    incoming: event.server_version.unwrap_or_default(),
                    stored,
                };
                debug!("{}", stale);
            }
            outcome if outcome.is_mutation() => {
                self.stats.applied += 1;
                self.touched
                    .record(event.entity_kind, event.entity_id.clone());
                self.dirty = true;
            }
            _ => {}
        }
    }

    fn on_malformed(&mut self, channel: ChannelKey, reason: &str) {
        self.stats.malformed += 1;
        self.dirty = true;
        warn!("Dropping malformed event on {}: {}", channel, reason);
        let threshold = self.malformed_threshold;
        if self
            .channels
            .get_mut(channel)
            .is_some_and(|c| c.record_malformed(threshold))
        {
            warn!(
                "Channel {} degraded after {} consecutive malformed events",
                channel, threshold
            );
            self.status_changed(channel);
        }
    }

    /// Merge a snapshot: prune records the backend no longer has, load the
    /// rows, replay buffered events, then go live.
    fn load_snapshot(&mut self, channel: ChannelKey, rows: &[Value]) {
        let kind = channel.kind();
        let mut events = Vec::with_capacity(rows.len());
        // A row with a readable id still exists on the backend even when the
        // rest of it is unreadable, so its record is kept.
        let mut keep: HashSet<EntityId> = HashSet::with_capacity(rows.len());
        for row in rows {
            if let Some(id) = row.get("id").and_then(EntityId::from_json) {
                keep.insert(id);
            }
            match self.normalizer.snapshot_row(kind, row) {
                Ok(event) => events.push(event),
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!("Skipping snapshot row on {}: {}", channel, e);
                }
            }
        }

        let (forgotten, pruned) = match kind {
            EntityKind::Lead => (self.leads.compact_tombstones(), self.leads.retain_ids(&keep)),
            EntityKind::Conversation => (
                self.conversations.compact_tombstones(),
                self.conversations.retain_ids(&keep),
            ),
            EntityKind::Job => (self.jobs.compact_tombstones(), self.jobs.retain_ids(&keep)),
            EntityKind::Message => (
                self.messages.compact_tombstones(),
                self.messages.retain_ids(&keep),
            ),
        };
        if forgotten > 0 {
            debug!("Forgot {} {} tombstones from before the previous snapshot", forgotten, kind);
        }
        if !pruned.is_empty() {
            debug!("Pruned {} {} records absent from snapshot", pruned.len(), kind);
        }
        for id in pruned {
            self.touched.record(kind, id);
        }

        let loaded = events.len();
        for event in events {
            let _ = self.apply_event(event);
        }

        let replay = self
            .channels
            .get_mut(channel)
            .map(crate::channel::ChannelSync::take_buffer)
            .unwrap_or_default();
        let replayed = replay.len();
        for event in replay {
            let _ = self.apply_event(event);
        }

        if let Some(sync) = self.channels.get_mut(channel) {
            sync.go_live(Utc::now());
        }
        self.stats.snapshots_loaded += 1;
        self.status_changed(channel);
        info!(
            "Channel {} live: {} snapshot rows, {} buffered events replayed",
            channel, loaded, replayed
        );
    }

    fn snapshot_exhausted(&mut self, channel: ChannelKey, attempts: u32, reason: String) {
        let err = Error::ChannelDesynced {
            channel: channel.to_string(),
            reason: format!("snapshot failed after {attempts} attempts: {reason}"),
        };
        warn!(code = err.error_code(), "{}", err);

        let replay = match self.channels.get_mut(channel) {
            Some(sync) => {
                sync.go_live_stale(reason);
                sync.take_buffer()
            }
            None => return,
        };
        for event in replay {
            let _ = self.apply_event(event);
        }
        self.status_changed(channel);
    }

    fn status_changed(&mut self, channel: ChannelKey) {
        self.touched.status_changed(channel);
        self.dirty = true;
    }

    /// Drain the work applied since the last call as one batch
    pub fn take_batch(&mut self) -> Option<Batch> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.seq += 1;
        Some(Batch {
            seq: self.seq,
            touched: std::mem::take(&mut self.touched),
            snapshot: Arc::new(self.snapshot()),
        })
    }

    /// Current contents as an immutable snapshot
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            leads: self.leads.view(),
            conversations: self.conversations.view(),
            jobs: self.jobs.view(),
            messages: self.messages.view(),
            channels: self.channels.statuses(),
            stats: self.stats,
            seq: self.seq,
        }
    }

    #[must_use]
    pub fn status(&self, channel: ChannelKey) -> Option<&ChannelStatus> {
        self.channels.get(channel).map(crate::channel::ChannelSync::status)
    }

    /// Events waiting for a channel's snapshot
    #[must_use]
    pub fn buffered(&self, channel: ChannelKey) -> usize {
        self.channels
            .get(channel)
            .map_or(0, crate::channel::ChannelSync::buffered)
    }

    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Every channel finished its first sync attempt
    #[must_use]
    pub fn all_settled(&self) -> bool {
        self.channels.all_settled()
    }

    #[must_use]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}

fn apply_to<T: Entity>(table: &mut EntityTable<T>, event: &ChangeEvent) -> Result<ApplyOutcome> {
    match event.operation {
        Operation::Delete => Ok(table.remove(&event.entity_id, event.server_version)),
        Operation::Insert | Operation::Update => {
            let version = event.server_version.ok_or_else(|| {
                Error::malformed(format!("{} {}: no version", T::KIND, event.entity_id))
            })?;
            let payload = event.payload.as_ref().ok_or_else(|| {
                Error::malformed(format!("{} {}: no payload", T::KIND, event.entity_id))
            })?;
            let data: T = serde_json::from_value(payload.clone()).map_err(|e| {
                Error::malformed(format!("{} {}: {}", T::KIND, event.entity_id, e))
            })?;
            Ok(table.upsert(event.entity_id.clone(), version, data, event.received_at))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Degradation, SyncState};
    use serde_json::json;

    fn engine() -> SyncEngine {
        SyncEngine::new(&EngineConfig::default(), ChannelKey::ALL)
    }

    fn connect(engine: &mut SyncEngine, channel: ChannelKey) -> u64 {
        let cmds = engine.handle(EngineInput::Transport(TransportEvent::Connected {
            channel,
            reconnect: false,
        }));
        match cmds.as_slice() {
            [EngineCommand::FetchSnapshot { epoch, .. }] => *epoch,
            other => panic!("unexpected commands {other:?}"),
        }
    }

    fn change(event: ChangeEvent) -> EngineInput {
        EngineInput::Transport(TransportEvent::Change {
            channel: event.channel(),
            event,
        })
    }

    fn loaded(channel: ChannelKey, epoch: u64, rows: Vec<Value>) -> EngineInput {
        EngineInput::SnapshotLoaded {
            channel,
            epoch,
            rows,
        }
    }

    fn conv_state(engine: &SyncEngine, id: &str) -> Option<(u64, String)> {
        engine
            .snapshot()
            .conversation(&EntityId::from(id))
            .map(|r| (r.version, r.data.state.clone().unwrap_or_default()))
    }

    #[test]
    fn test_snapshot_then_duplicate_version() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Conversations);
        engine.handle(loaded(
            ChannelKey::Conversations,
            epoch,
            vec![json!({"id": 1, "version": 1, "state": "open"})],
        ));
        engine.handle(change(ChangeEvent::update(
            EntityKind::Conversation,
            "1",
            2,
            json!({"id": 1, "version": 2, "state": "closed"}),
        )));
        engine.handle(change(ChangeEvent::update(
            EntityKind::Conversation,
            "1",
            2,
            json!({"id": 1, "version": 2, "state": "open"}),
        )));

        assert_eq!(conv_state(&engine, "1"), Some((2, "closed".to_string())));
        assert_eq!(engine.stats().stale_discarded, 1);
    }

    #[test]
    fn test_stale_reordered_insert_after_delete() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(ChannelKey::Leads, epoch, vec![]));

        let lead = json!({"id": 5, "version": 1, "name": "Ada"});
        engine.handle(change(ChangeEvent::insert(EntityKind::Lead, "5", 1, lead.clone())));
        engine.handle(change(ChangeEvent::delete(EntityKind::Lead, "5", Some(2))));
        engine.handle(change(ChangeEvent::insert(EntityKind::Lead, "5", 1, lead)));

        assert!(engine.snapshot().lead(&EntityId::from("5")).is_none());
    }

    #[test]
    fn test_events_buffered_until_snapshot() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Conversations);
        engine.handle(change(ChangeEvent::update(
            EntityKind::Conversation,
            "1",
            3,
            json!({"id": 1, "state": "closed"}),
        )));
        assert_eq!(engine.buffered(ChannelKey::Conversations), 1);
        assert_eq!(conv_state(&engine, "1"), None);

        // Snapshot is older than the buffered event; the event must win
        engine.handle(loaded(
            ChannelKey::Conversations,
            epoch,
            vec![json!({"id": 1, "version": 2, "state": "open"})],
        ));
        assert_eq!(conv_state(&engine, "1"), Some((3, "closed".to_string())));
        assert_eq!(engine.buffered(ChannelKey::Conversations), 0);
        assert!(engine.status(ChannelKey::Conversations).unwrap().is_live());
    }

    #[test]
    fn test_buffered_event_older_than_snapshot_is_discarded() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Conversations);
        engine.handle(change(ChangeEvent::update(
            EntityKind::Conversation,
            "1",
            2,
            json!({"id": 1, "state": "open"}),
        )));
        engine.handle(loaded(
            ChannelKey::Conversations,
            epoch,
            vec![json!({"id": 1, "version": 4, "state": "archived"})],
        ));
        assert_eq!(conv_state(&engine, "1"), Some((4, "archived".to_string())));
    }

    #[test]
    fn test_snapshot_from_cancelled_epoch_never_merges() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Jobs);
        let cmds = engine.handle(EngineInput::Transport(TransportEvent::Disconnected {
            channel: ChannelKey::Jobs,
            reason: "socket closed".into(),
        }));
        assert_eq!(
            cmds,
            vec![EngineCommand::CancelSnapshot {
                channel: ChannelKey::Jobs
            }]
        );
        engine.handle(loaded(
            ChannelKey::Jobs,
            epoch,
            vec![json!({"id": "j1", "version": 1})],
        ));
        assert!(engine.snapshot().job(&EntityId::from("j1")).is_none());
        assert_eq!(
            engine.status(ChannelKey::Jobs).unwrap().state,
            SyncState::Disconnected
        );
    }

    #[test]
    fn test_resync_prunes_absent_records() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(
            ChannelKey::Leads,
            epoch,
            vec![
                json!({"id": "a", "version": 1}),
                json!({"id": "b", "version": 1}),
            ],
        ));
        engine.handle(EngineInput::Transport(TransportEvent::Disconnected {
            channel: ChannelKey::Leads,
            reason: "drop".into(),
        }));
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(
            ChannelKey::Leads,
            epoch,
            vec![json!({"id": "a", "version": 1})],
        ));

        let snapshot = engine.snapshot();
        assert!(snapshot.lead(&EntityId::from("a")).is_some());
        assert!(snapshot.lead(&EntityId::from("b")).is_none());
        assert_eq!(snapshot.status(ChannelKey::Leads).unwrap().resyncs, 2);
    }

    #[test]
    fn test_resync_keeps_record_behind_unreadable_row() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(
            ChannelKey::Leads,
            epoch,
            vec![json!({"id": "a", "version": 3})],
        ));
        engine.handle(EngineInput::Transport(TransportEvent::Disconnected {
            channel: ChannelKey::Leads,
            reason: "drop".into(),
        }));
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(
            ChannelKey::Leads,
            epoch,
            vec![json!({"id": "a", "version": "n/a"})],
        ));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.lead(&EntityId::from("a")).unwrap().version, 3);
        assert_eq!(snapshot.stats.malformed, 1);
        assert!(snapshot.status(ChannelKey::Leads).unwrap().is_live());
    }

    #[test]
    fn test_resyncs_compact_old_tombstones() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(ChannelKey::Leads, epoch, vec![json!({"id": "a", "version": 1})]));
        engine.handle(change(ChangeEvent::delete(EntityKind::Lead, "a", Some(2))));
        let a = EntityId::from("a");

        for expected in [Some(2), None] {
            engine.handle(EngineInput::Transport(TransportEvent::Disconnected {
                channel: ChannelKey::Leads,
                reason: "drop".into(),
            }));
            let epoch = connect(&mut engine, ChannelKey::Leads);
            engine.handle(loaded(ChannelKey::Leads, epoch, vec![]));
            assert_eq!(engine.leads.tombstone(&a), expected);
        }
        assert!(engine.snapshot().lead(&a).is_none());
    }

    #[test]
    fn test_snapshot_exhaustion_keeps_data_and_flags_stale() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(
            ChannelKey::Leads,
            epoch,
            vec![json!({"id": "a", "version": 1})],
        ));
        engine.handle(EngineInput::Transport(TransportEvent::Disconnected {
            channel: ChannelKey::Leads,
            reason: "drop".into(),
        }));
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(EngineInput::SnapshotFailed {
            channel: ChannelKey::Leads,
            epoch,
            attempts: 5,
            reason: "503".into(),
        });

        let status = engine.status(ChannelKey::Leads).unwrap().clone();
        assert_eq!(status.state, SyncState::Live);
        assert!(status.stale);
        assert!(matches!(status.degraded, Some(Degradation::Desynced { .. })));
        assert!(engine.snapshot().lead(&EntityId::from("a")).is_some());
        // Other channels are unaffected
        assert!(engine.status(ChannelKey::Jobs).unwrap().degraded.is_none());
    }

    #[test]
    fn test_malformed_threshold_degrades_then_recovers() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(ChannelKey::Leads, epoch, vec![]));

        for _ in 0..3 {
            engine.handle(EngineInput::Transport(TransportEvent::Malformed {
                channel: ChannelKey::Leads,
                reason: "no id".into(),
            }));
        }
        assert_eq!(
            engine.status(ChannelKey::Leads).unwrap().degraded,
            Some(Degradation::Malformed { count: 3 })
        );
        assert_eq!(engine.stats().malformed, 3);

        engine.handle(change(ChangeEvent::insert(
            EntityKind::Lead,
            "x",
            1,
            json!({"id": "x"}),
        )));
        assert_eq!(engine.status(ChannelKey::Leads).unwrap().degraded, None);
    }

    #[test]
    fn test_undecodable_payload_is_malformed() {
        let mut engine = engine();
        let epoch = connect(&mut engine, ChannelKey::Conversations);
        engine.handle(loaded(ChannelKey::Conversations, epoch, vec![]));
        let result = engine.apply_event(ChangeEvent::insert(
            EntityKind::Conversation,
            "1",
            1,
            json!({"id": 1, "unread_count": "many"}),
        ));
        assert!(matches!(result, Err(Error::MalformedEvent(_))));
        assert_eq!(engine.stats().malformed, 1);
    }

    #[test]
    fn test_batch_coalesces_and_reports_touched() {
        let mut engine = engine();
        assert!(engine.take_batch().is_some());
        assert!(engine.take_batch().is_none());

        let epoch = connect(&mut engine, ChannelKey::Leads);
        engine.handle(loaded(
            ChannelKey::Leads,
            epoch,
            vec![json!({"id": "a", "version": 1})],
        ));
        engine.handle(change(ChangeEvent::update(
            EntityKind::Lead,
            "a",
            2,
            json!({"id": "a", "stage": "won"}),
        )));

        let batch = engine.take_batch().unwrap();
        assert!(batch.touched.touches_kind(EntityKind::Lead));
        assert!(batch.touched.contains(EntityKind::Lead, &EntityId::from("a")));
        assert!(batch.touched.channel_changed(ChannelKey::Leads));
        assert!(!batch.touched.touches_kind(EntityKind::Message));
        assert_eq!(batch.snapshot.lead(&EntityId::from("a")).unwrap().version, 2);
        assert!(engine.take_batch().is_none());
    }

    #[test]
    fn test_baseline_served_stale_until_resync() {
        let mut first = engine();
        let epoch = connect(&mut first, ChannelKey::Leads);
        first.handle(loaded(
            ChannelKey::Leads,
            epoch,
            vec![json!({"id": "a", "version": 3})],
        ));
        let baseline = first.take_batch().unwrap().snapshot;

        let mut second =
            SyncEngine::with_baseline(&EngineConfig::default(), ChannelKey::ALL, &baseline);
        let snapshot = second.snapshot();
        assert!(snapshot.lead(&EntityId::from("a")).is_some());
        assert!(snapshot.is_stale(ChannelKey::Leads));

        let epoch = connect(&mut second, ChannelKey::Leads);
        second.handle(loaded(
            ChannelKey::Leads,
            epoch,
            vec![json!({"id": "a", "version": 3})],
        ));
        assert!(second.snapshot().is_live(ChannelKey::Leads));
    }
}
