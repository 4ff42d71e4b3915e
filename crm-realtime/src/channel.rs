//! Per-channel synchronization state
//!
//! Each channel runs `Disconnected -> Syncing -> Live -> (Disconnected on drop)`.
//! Events that arrive while a snapshot is pending are buffered in receipt order.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crm_common::types::{ChangeEvent, ChannelKey};

/// Channel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Disconnected,
    Syncing,
    Live,
}

/// Why a channel is degraded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Degradation {
    /// Connection retries exhausted
    Transport { attempts: u32 },
    /// Snapshot retries exhausted; data may be missing or outdated
    Desynced { reason: String },
    /// Repeated malformed payloads
    Malformed { count: u32 },
}

/// Status exposed to consumers next to the data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub state: SyncState,
    pub connected: bool,
    /// Data may not reflect the latest backend state
    pub stale: bool,
    pub degraded: Option<Degradation>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Completed snapshot loads, initial one included
    pub resyncs: u64,
}

impl ChannelStatus {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state == SyncState::Live && !self.stale
    }
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Disconnected,
            connected: false,
            stale: true,
            degraded: None,
            last_synced_at: None,
            resyncs: 0,
        }
    }
}

/// Sync bookkeeping of a single channel
#[derive(Debug)]
pub struct ChannelSync {
    key: ChannelKey,
    status: ChannelStatus,
    buffer: VecDeque<ChangeEvent>,
    /// Bumped on every (re)connect and drop; snapshot results from an older
    /// epoch are discarded.
    epoch: u64,
    consecutive_malformed: u32,
    /// First sync attempt finished (loaded or given up)
    settled: bool,
}

impl ChannelSync {
    pub fn new(key: ChannelKey) -> Self {
        Self {
            key,
            status: ChannelStatus::default(),
            buffer: VecDeque::new(),
            epoch: 0,
            consecutive_malformed: 0,
            settled: false,
        }
    }

    #[must_use]
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    #[must_use]
    pub fn status(&self) -> &ChannelStatus {
        &self.status
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.status.state
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Transport is up: start syncing. Returns the epoch the snapshot must carry.
    pub fn begin_sync(&mut self) -> u64 {
        self.epoch += 1;
        self.status.state = SyncState::Syncing;
        self.status.connected = true;
        if matches!(self.status.degraded, Some(Degradation::Transport { .. })) {
            self.status.degraded = None;
        }
        self.epoch
    }

    /// Transport dropped
    pub fn disconnect(&mut self) {
        self.epoch += 1;
        self.status.state = SyncState::Disconnected;
        self.status.connected = false;
        self.status.stale = true;
    }

    pub fn mark_transport_degraded(&mut self, attempts: u32) {
        self.status.connected = false;
        self.status.stale = true;
        self.status.degraded = Some(Degradation::Transport { attempts });
        self.settled = true;
    }

    /// Whether a snapshot result for `epoch` may still be merged
    #[must_use]
    pub fn accepts_snapshot(&self, epoch: u64) -> bool {
        self.status.state == SyncState::Syncing && self.epoch == epoch
    }

    /// Live events are applied directly; anything else waits for the snapshot
    #[must_use]
    pub fn should_buffer(&self) -> bool {
        self.status.state != SyncState::Live
    }

    pub fn buffer(&mut self, event: ChangeEvent) {
        self.buffer.push_back(event);
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drain buffered events in receipt order
    pub fn take_buffer(&mut self) -> Vec<ChangeEvent> {
        self.buffer.drain(..).collect()
    }

    /// Snapshot merged: the channel is live and fresh
    pub fn go_live(&mut self, at: DateTime<Utc>) {
        self.status.state = SyncState::Live;
        self.status.stale = false;
        self.status.last_synced_at = Some(at);
        self.status.resyncs += 1;
        if matches!(self.status.degraded, Some(Degradation::Desynced { .. })) {
            self.status.degraded = None;
        }
        self.settled = true;
    }

    /// Snapshot retries exhausted: serve what we have, flagged stale
    pub fn go_live_stale(&mut self, reason: String) {
        self.status.state = SyncState::Live;
        self.status.stale = true;
        self.status.degraded = Some(Degradation::Desynced { reason });
        self.settled = true;
    }

    /// Count a malformed event; returns true when this crosses `threshold`
    pub fn record_malformed(&mut self, threshold: u32) -> bool {
        self.consecutive_malformed = self.consecutive_malformed.saturating_add(1);
        if self.consecutive_malformed >= threshold && self.status.degraded.is_none() {
            self.status.degraded = Some(Degradation::Malformed {
                count: self.consecutive_malformed,
            });
            return true;
        }
        false
    }

    /// A valid event arrived; clears malformed degradation. Returns true if
    /// the status changed.
    pub fn record_valid(&mut self) -> bool {
        self.consecutive_malformed = 0;
        if matches!(self.status.degraded, Some(Degradation::Malformed { .. })) {
            self.status.degraded = None;
            return true;
        }
        false
    }

    /// Seeded from retained data: nothing is fresh yet
    pub fn mark_stale(&mut self) {
        self.status.stale = true;
    }
}

/// All channels of one engine, in deterministic order
#[derive(Debug, Default)]
pub struct ChannelSet {
    channels: BTreeMap<ChannelKey, ChannelSync>,
}

impl ChannelSet {
    pub fn new(keys: impl IntoIterator<Item = ChannelKey>) -> Self {
        Self {
            channels: keys.into_iter().map(|k| (k, ChannelSync::new(k))).collect(),
        }
    }

    pub fn get(&self, key: ChannelKey) -> Option<&ChannelSync> {
        self.channels.get(&key)
    }

    pub fn get_mut(&mut self, key: ChannelKey) -> Option<&mut ChannelSync> {
        self.channels.get_mut(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelSync> {
        self.channels.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChannelSync> {
        self.channels.values_mut()
    }

    /// Status of every channel
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<ChannelKey, ChannelStatus> {
        self.channels
            .iter()
            .map(|(k, c)| (*k, c.status.clone()))
            .collect()
    }

    /// Every channel finished its first sync attempt
    #[must_use]
    pub fn all_settled(&self) -> bool {
        self.channels.values().all(ChannelSync::is_settled)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.channels.len()
    }
}
