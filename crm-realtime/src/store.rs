//! Published, immutable view of every entity table

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crm_common::types::{
    ChannelKey, Conversation, EntityId, EntityRecord, Job, Lead, Message,
};

use crate::channel::ChannelStatus;
use crate::table::TableView;

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Mutations applied to tables (snapshot rows included)
    pub applied: u64,
    /// Stale or duplicate events discarded
    pub stale_discarded: u64,
    /// Malformed payloads dropped
    pub malformed: u64,
    /// Events buffered while a channel was syncing
    pub buffered: u64,
    pub snapshots_loaded: u64,
}

/// Everything a selector can read, frozen at one batch boundary.
///
/// All tables in a snapshot reflect the same set of applied events, so two
/// selectors evaluated against it never see a partial batch.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub leads: TableView<Lead>,
    pub conversations: TableView<Conversation>,
    pub jobs: TableView<Job>,
    pub messages: TableView<Message>,
    pub channels: BTreeMap<ChannelKey, ChannelStatus>,
    pub stats: SyncStats,
    /// Batch sequence number that produced this snapshot
    pub seq: u64,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl StoreSnapshot {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            leads: TableView::empty(),
            conversations: TableView::empty(),
            jobs: TableView::empty(),
            messages: TableView::empty(),
            channels: BTreeMap::new(),
            stats: SyncStats::default(),
            seq: 0,
        }
    }

    #[must_use]
    pub fn lead(&self, id: &EntityId) -> Option<&Arc<EntityRecord<Lead>>> {
        self.leads.get(id)
    }

    #[must_use]
    pub fn conversation(&self, id: &EntityId) -> Option<&Arc<EntityRecord<Conversation>>> {
        self.conversations.get(id)
    }

    #[must_use]
    pub fn job(&self, id: &EntityId) -> Option<&Arc<EntityRecord<Job>>> {
        self.jobs.get(id)
    }

    #[must_use]
    pub fn message(&self, id: &EntityId) -> Option<&Arc<EntityRecord<Message>>> {
        self.messages.get(id)
    }

    pub fn leads_in<'a>(
        &'a self,
        workspace_id: &'a EntityId,
    ) -> impl Iterator<Item = &'a Arc<EntityRecord<Lead>>> + 'a {
        self.leads.in_workspace(workspace_id)
    }

    pub fn conversations_in<'a>(
        &'a self,
        workspace_id: &'a EntityId,
    ) -> impl Iterator<Item = &'a Arc<EntityRecord<Conversation>>> + 'a {
        self.conversations.in_workspace(workspace_id)
    }

    pub fn jobs_in<'a>(
        &'a self,
        workspace_id: &'a EntityId,
    ) -> impl Iterator<Item = &'a Arc<EntityRecord<Job>>> + 'a {
        self.jobs.in_workspace(workspace_id)
    }

    pub fn messages_in<'a>(
        &'a self,
        workspace_id: &'a EntityId,
    ) -> impl Iterator<Item = &'a Arc<EntityRecord<Message>>> + 'a {
        self.messages.in_workspace(workspace_id)
    }

    #[must_use]
    pub fn status(&self, channel: ChannelKey) -> Option<&ChannelStatus> {
        self.channels.get(&channel)
    }

    /// Channel is live and fresh. Channels not tracked by this store are not.
    #[must_use]
    pub fn is_live(&self, channel: ChannelKey) -> bool {
        self.status(channel).is_some_and(ChannelStatus::is_live)
    }

    /// Data for the channel may be outdated (or was never loaded)
    #[must_use]
    pub fn is_stale(&self, channel: ChannelKey) -> bool {
        self.status(channel).map_or(true, |s| s.stale)
    }

    /// Copy of this snapshot with every channel flagged stale and disconnected
    #[must_use]
    pub fn into_stale(mut self) -> Self {
        for status in self.channels.values_mut() {
            status.stale = true;
            status.connected = false;
        }
        self
    }
}
