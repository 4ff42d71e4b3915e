//! CRM real-time sync store
//!
//! In-memory mirror of a workspace's leads, dispatch conversations, dispatch
//! jobs and messages, kept consistent with the backend's change feed.
//!
//! # Features
//!
//! - **Transport** - Supabase Realtime subscriptions with reconnect backoff
//! - **Entity tables** - Version-ordered, tolerant of duplicate and reordered events
//! - **Selectors** - Memoized derived views, notified once per batch
//! - **Lifecycle** - Reference-counted start/teardown with a grace window

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use crm_common as common;
pub use crm_realtime as realtime;

pub mod replay;

use std::sync::Arc;

use tracing::info;

use crm_common::config::SyncConfig;
use crm_common::error::Result;
use crm_common::types::EntityId;
use crm_realtime::selectors::{
    ChannelStatuses, ConversationsByActivity, JobsBySchedule, LeadsByStage,
};
use crm_realtime::{
    RealtimeBackend, Selector, SubscriptionHandle, SupabaseBackend, SyncContext, Tracked,
};

/// Sync store service for one workspace session
pub struct CrmSyncService {
    config: SyncConfig,
    context: Arc<SyncContext>,
}

impl CrmSyncService {
    /// Create a service against the configured managed backend
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SyncConfig) -> Result<Self> {
        info!("Initializing CRM sync store");
        let backend = Arc::new(SupabaseBackend::new(config.backend.clone())?);
        Self::with_backend(config, backend)
    }

    /// Create a service against any backend
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn with_backend(config: SyncConfig, backend: Arc<dyn RealtimeBackend>) -> Result<Self> {
        let context = SyncContext::new(config.clone(), backend)?;
        Ok(Self { config, context })
    }

    /// Shared store context handed to consumers
    #[must_use]
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.context
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Keep the store running and log every change of the built-in views.
    /// Runs until the future is dropped.
    ///
    /// # Errors
    /// Returns an error if the store was already shut down.
    pub async fn run(&self) -> Result<()> {
        let _guard = self.context.acquire()?;
        let workspace = EntityId::new(self.config.session.workspace_id.clone());
        info!("Syncing workspace {}", workspace);
        info!(
            "  - Channels: {}",
            self.config
                .transport
                .channels
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let _handles = watch_workspace(&self.context, &workspace);
        self.context.wait_ready().await?;
        info!("Initial sync complete");

        std::future::pending::<()>().await;
        Ok(())
    }

    /// Shutdown the store
    ///
    /// # Errors
    /// Returns an error if shutdown fails.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down CRM sync store");
        self.context.shutdown().await;
        Ok(())
    }
}

type Output<S> = <S as Selector>::Output;

/// Logging subscriptions; dropping this unsubscribes them
struct Watchers {
    _inbox: SubscriptionHandle<Output<Tracked<ConversationsByActivity>>>,
    _pipeline: SubscriptionHandle<Output<Tracked<LeadsByStage>>>,
    _schedule: SubscriptionHandle<Output<Tracked<JobsBySchedule>>>,
    _channels: SubscriptionHandle<Output<ChannelStatuses>>,
}

/// Subscribe logging callbacks to the built-in views of a workspace
fn watch_workspace(context: &SyncContext, workspace: &EntityId) -> Watchers {
    let inbox = context.subscribe(
        Tracked(ConversationsByActivity {
            workspace_id: workspace.clone(),
        }),
        |view| {
            info!(
                "Inbox: {} conversations (stale: {})",
                view.value.len(),
                view.stale
            );
        },
    );
    let pipeline = context.subscribe(
        Tracked(LeadsByStage {
            workspace_id: workspace.clone(),
        }),
        |view| {
            let total: usize = view.value.values().map(Vec::len).sum();
            info!(
                "Pipeline: {} leads in {} stages (stale: {})",
                total,
                view.value.len(),
                view.stale
            );
        },
    );
    let schedule = context.subscribe(
        Tracked(JobsBySchedule {
            workspace_id: workspace.clone(),
        }),
        |view| info!("Schedule: {} jobs (stale: {})", view.value.len(), view.stale),
    );
    let channels = context.subscribe(ChannelStatuses, |statuses| {
        for (channel, status) in statuses {
            info!(
                "Channel {}: {:?} connected={} stale={} degraded={:?}",
                channel, status.state, status.connected, status.stale, status.degraded
            );
        }
    });
    Watchers {
        _inbox: inbox,
        _pipeline: pipeline,
        _schedule: schedule,
        _channels: channels,
    }
}
