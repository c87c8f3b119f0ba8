use std::sync::Arc;
use std::time::Duration;

use parley_core::config::FeedConfig;
use parley_core::error::FeedError;
use parley_core::event::{
    ChangeEvent, ChangeFeed, FeedItem, FeedSubscription, MessageRow, SubscriptionFilter,
    SubscriptionStatus,
};
use parley_core::model::{ConnectionState, MessageId};
use parley_gateway::Gateway;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classify::{Reconcile, classify};
use crate::error::SyncError;
use crate::ops::ChatSession;
use crate::store::Action;
use crate::unread::counts_as_new_unread;

/// Stops a running [`SyncEngine`].
#[derive(Clone)]
pub struct EngineHandle {
    shutdown: Arc<Notify>,
}

impl EngineHandle {
    /// Ask the engine loop to stop. Safe to call before the loop starts.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

enum Pump {
    Shutdown,
    FeedGone,
    Dropped,
}

/// Applies change notifications to a [`ChatSession`]'s store.
pub struct SyncEngine<G: Gateway> {
    session: Arc<ChatSession<G>>,
    feed: Arc<dyn ChangeFeed>,
    config: FeedConfig,
    filter: SubscriptionFilter,
    reload_debounce: Duration,
    shutdown: Arc<Notify>,
}

impl<G: Gateway> SyncEngine<G> {
    pub fn new(session: Arc<ChatSession<G>>, feed: Arc<dyn ChangeFeed>, config: FeedConfig) -> Self {
        let reload_debounce = session.config().reload_debounce();
        Self {
            session,
            feed,
            config,
            filter: SubscriptionFilter::all(),
            reload_debounce,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn session(&self) -> &Arc<ChatSession<G>> {
        &self.session
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Drive the subscription until shutdown or until the feed goes away.
    ///
    /// Dropped subscriptions are retried with exponential backoff; the first
    /// successful resubscription after a drop triggers a full resync.
    pub async fn run(self: Arc<Self>) -> Result<(), SyncError> {
        let mut attempt: u32 = 0;
        let mut needs_resync = false;

        loop {
            self.session
                .set_connection_state(ConnectionState::Connecting);
            let mut sub = match self.feed.subscribe(&self.filter) {
                Ok(sub) => sub,
                Err(FeedError::Closed) => {
                    info!("change feed closed, sync engine stopping");
                    self.session
                        .set_connection_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "subscribe failed");
                    self.session
                        .set_connection_state(ConnectionState::Disconnected);
                    return Err(e.into());
                }
            };

            match self.pump(&mut sub, &mut attempt, &mut needs_resync).await {
                Pump::Shutdown => {
                    debug!("sync engine shutting down");
                    self.session
                        .set_connection_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Pump::FeedGone => {
                    info!("change feed closed, sync engine stopping");
                    self.session
                        .set_connection_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Pump::Dropped => drop(sub),
            }

            needs_resync = true;
            self.session
                .set_connection_state(ConnectionState::Connecting);
            let delay = self.config.backoff(attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "subscription dropped, resubscribing"
            );
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("sync engine shut down during backoff");
                    self.session
                        .set_connection_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(
        &self,
        sub: &mut FeedSubscription,
        attempt: &mut u32,
        needs_resync: &mut bool,
    ) -> Pump {
        let mut reload_at: Option<Instant> = None;

        loop {
            let deadline = reload_at;
            let reload_due = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => return Pump::Shutdown,

                _ = reload_due => {
                    reload_at = None;
                    self.reload_channels().await;
                }

                item = sub.recv() => match item {
                    Ok(FeedItem::Status(SubscriptionStatus::Subscribed)) => {
                        *attempt = 0;
                        self.session
                            .set_connection_state(ConnectionState::Subscribed);
                        info!("subscribed to change feed");
                        if std::mem::take(needs_resync) {
                            self.resync().await;
                        }
                    }
                    Ok(FeedItem::Status(status)) => {
                        warn!(status = ?status, "subscription dropped");
                        return Pump::Dropped;
                    }
                    Ok(FeedItem::Change(event)) => match classify(&event, self.session.user_id()) {
                        Reconcile::ReloadChannels => {
                            debug!("channel reload scheduled");
                            if reload_at.is_none() {
                                reload_at = Some(Instant::now() + self.reload_debounce);
                            }
                        }
                        intent => self.apply(intent).await,
                    },
                    Err(FeedError::Lagged(count)) => {
                        warn!(count, "sync engine lagged, some events dropped; resyncing");
                        self.resync().await;
                    }
                    Err(FeedError::Closed) => return Pump::FeedGone,
                    Err(e) => {
                        error!(error = %e, "change feed error");
                        return Pump::Dropped;
                    }
                },
            }
        }
    }

    async fn reload_channels(&self) {
        if let Err(e) = self.session.load_channels().await {
            warn!(error = %e, "channel reload failed");
        }
    }

    async fn resync(&self) {
        if let Err(e) = self.session.resync().await {
            warn!(error = %e, "resync failed");
        }
    }

    /// Classify and apply one change immediately, without debouncing.
    /// Returns the intent that was applied. Never fails; errors are logged.
    pub async fn handle_change(&self, event: &ChangeEvent) -> Reconcile {
        let intent = classify(event, self.session.user_id());
        match &intent {
            Reconcile::ReloadChannels => self.reload_channels().await,
            other => self.apply(other.clone()).await,
        }
        intent
    }

    async fn apply(&self, intent: Reconcile) {
        let name = intent.name();
        if let Err(e) = self.try_apply(intent).await {
            warn!(intent = name, error = %e, "failed to apply change");
        }
    }

    async fn try_apply(&self, intent: Reconcile) -> Result<(), SyncError> {
        let session = &self.session;
        let store = session.store();

        match intent {
            Reconcile::RefreshMessage {
                message_id,
                channel_id,
                inserted,
            } => {
                if let Some(channel_id) = channel_id {
                    if !session.check_membership(channel_id).await? {
                        debug!(channel_id = %channel_id, "ignoring change for non-member channel");
                        return Ok(());
                    }
                }
                self.refresh_message(message_id, inserted.as_deref()).await
            }

            Reconcile::DropMessage {
                channel_id,
                message_id,
            } => {
                store.dispatch(Action::RemoveMessage {
                    channel_id,
                    key: message_id.into(),
                });
                let inactive = store.read(|s| s.active_channel()) != Some(channel_id);
                if inactive && session.is_member_cached(channel_id) {
                    session.recompute_unread(channel_id).await?;
                }
                Ok(())
            }

            Reconcile::VerifyChannel(channel) => {
                let membership = match store.read(|s| s.membership(channel.id).cloned()) {
                    Some(membership) => Some(membership),
                    None => session.fetch_own_membership(channel.id).await?,
                };
                let Some(membership) = membership else {
                    debug!(channel_id = %channel.id, "ignoring channel the user does not belong to");
                    return Ok(());
                };
                let channel_id = channel.id;
                let known = store.read(|s| s.has_channel(channel_id));
                store.dispatch(Action::UpsertChannel(*channel));
                if !known {
                    store.dispatch(Action::UpsertMembership(membership));
                    session.recompute_unread(channel_id).await?;
                }
                Ok(())
            }

            Reconcile::RemoveChannel(channel_id) => {
                debug!(channel_id = %channel_id, "removing channel");
                store.dispatch(Action::RemoveChannel(channel_id));
                Ok(())
            }

            Reconcile::ReloadChannels => {
                session.load_channels().await?;
                Ok(())
            }

            Reconcile::RecountUnread(membership) => {
                let channel_id = membership.channel_id;
                if !store.read(|s| s.has_channel(channel_id)) {
                    return Ok(());
                }
                store.dispatch(Action::UpsertMembership(*membership));
                session.recompute_unread(channel_id).await?;
                Ok(())
            }

            Reconcile::RefreshMembers(channel_id) => {
                session.refresh_members_if_active(channel_id).await;
                Ok(())
            }

            Reconcile::Ignore => Ok(()),
        }
    }

    async fn refresh_message(
        &self,
        message_id: MessageId,
        inserted: Option<&MessageRow>,
    ) -> Result<(), SyncError> {
        let Some(message) = self.session.fetch_joined(message_id).await? else {
            debug!(message_id = %message_id, "message gone before refresh");
            return Ok(());
        };
        if !self.session.is_member_cached(message.channel_id) {
            debug!(channel_id = %message.channel_id, "membership revoked during refresh");
            return Ok(());
        }

        let user_id = self.session.user_id();
        self.session.store().transact(|s| {
            let mut actions = Vec::with_capacity(2);
            if inserted.is_some_and(|row| counts_as_new_unread(row, s, user_id)) {
                actions.push(Action::AdjustUnreadCount {
                    channel_id: message.channel_id,
                    delta: 1,
                });
            }
            actions.push(Action::MergeMessage(message));
            (actions, ())
        });
        Ok(())
    }
}
