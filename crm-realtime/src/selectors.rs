//! Built-in CRM selectors

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crm_common::types::{
    ChannelKey, Conversation, EntityId, EntityKind, EntityRecord, Job, Lead, Message,
};

use crate::channel::ChannelStatus;
use crate::selector::Selector;
use crate::store::StoreSnapshot;

/// Stage key for leads without one
pub const UNSTAGED: &str = "unstaged";

/// Inbox: conversations of a workspace, most recent activity first
#[derive(Debug, Clone)]
pub struct ConversationsByActivity {
    pub workspace_id: EntityId,
}

impl Selector for ConversationsByActivity {
    type Output = Vec<Arc<EntityRecord<Conversation>>>;

    fn kinds(&self) -> &[EntityKind] {
        &[EntityKind::Conversation]
    }

    fn select(&self, store: &StoreSnapshot) -> Self::Output {
        let mut rows: Vec<_> = store
            .conversations_in(&self.workspace_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.data
                .last_activity()
                .cmp(&a.data.last_activity())
                .then_with(|| a.id.cmp(&b.id))
        });
        rows
    }
}

/// Pipeline board: leads of a workspace per stage, in drag-and-drop order
#[derive(Debug, Clone)]
pub struct LeadsByStage {
    pub workspace_id: EntityId,
}

impl Selector for LeadsByStage {
    type Output = BTreeMap<String, Vec<Arc<EntityRecord<Lead>>>>;

    fn kinds(&self) -> &[EntityKind] {
        &[EntityKind::Lead]
    }

    fn select(&self, store: &StoreSnapshot) -> Self::Output {
        let mut board: Self::Output = BTreeMap::new();
        for lead in store.leads_in(&self.workspace_id) {
            let stage = lead.data.stage.clone().unwrap_or_else(|| UNSTAGED.to_string());
            board.entry(stage).or_default().push(Arc::clone(lead));
        }
        for column in board.values_mut() {
            column.sort_by(|a, b| {
                cmp_position(a.data.position, b.data.position).then_with(|| a.id.cmp(&b.id))
            });
        }
        board
    }
}

/// Unpositioned leads sort last
fn cmp_position(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Dispatch schedule: jobs of a workspace by scheduled time, unscheduled last
#[derive(Debug, Clone)]
pub struct JobsBySchedule {
    pub workspace_id: EntityId,
}

impl Selector for JobsBySchedule {
    type Output = Vec<Arc<EntityRecord<Job>>>;

    fn kinds(&self) -> &[EntityKind] {
        &[EntityKind::Job]
    }

    fn select(&self, store: &StoreSnapshot) -> Self::Output {
        let mut rows: Vec<_> = store.jobs_in(&self.workspace_id).cloned().collect();
        rows.sort_by(|a, b| {
            match (a.data.scheduled_at, b.data.scheduled_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
            .then_with(|| a.id.cmp(&b.id))
        });
        rows
    }
}

/// Chat thread: messages of one conversation in chronological order
#[derive(Debug, Clone)]
pub struct ConversationMessages {
    pub conversation_id: EntityId,
}

impl Selector for ConversationMessages {
    type Output = Vec<Arc<EntityRecord<Message>>>;

    fn kinds(&self) -> &[EntityKind] {
        &[EntityKind::Message]
    }

    fn select(&self, store: &StoreSnapshot) -> Self::Output {
        let mut rows: Vec<_> = store
            .messages
            .iter()
            .filter(|m| m.data.conversation_id.as_ref() == Some(&self.conversation_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.data
                .created_at
                .cmp(&b.data.created_at)
                .then_with(|| a.version.cmp(&b.version))
                .then_with(|| a.id.cmp(&b.id))
        });
        rows
    }
}

/// A job with the conversation it is dispatched through
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobWithConversation {
    pub job: Arc<EntityRecord<Job>>,
    pub conversation: Option<Arc<EntityRecord<Conversation>>>,
}

/// Jobs of a workspace joined with their conversations. Both sides are read
/// from the same snapshot.
#[derive(Debug, Clone)]
pub struct JobsWithConversations {
    pub workspace_id: EntityId,
}

impl Selector for JobsWithConversations {
    type Output = Vec<JobWithConversation>;

    fn kinds(&self) -> &[EntityKind] {
        &[EntityKind::Job, EntityKind::Conversation]
    }

    fn select(&self, store: &StoreSnapshot) -> Self::Output {
        JobsBySchedule {
            workspace_id: self.workspace_id.clone(),
        }
        .select(store)
        .into_iter()
        .map(|job| {
            let conversation = job
                .data
                .conversation_id
                .as_ref()
                .and_then(|id| store.conversation(id))
                .or_else(|| {
                    store
                        .conversations
                        .iter()
                        .filter(|c| c.data.job_id.as_ref() == Some(&job.id))
                        .min_by(|a, b| a.id.cmp(&b.id))
                })
                .cloned();
            JobWithConversation { job, conversation }
        })
        .collect()
    }
}

/// Status of every tracked channel
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStatuses;

impl Selector for ChannelStatuses {
    type Output = BTreeMap<ChannelKey, ChannelStatus>;

    fn kinds(&self) -> &[EntityKind] {
        &EntityKind::ALL
    }

    fn touches(&self, _kind: EntityKind, _id: &EntityId) -> bool {
        false
    }

    fn select(&self, store: &StoreSnapshot) -> Self::Output {
        store.channels.clone()
    }
}
