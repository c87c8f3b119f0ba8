//! Chat operations for one signed-in user.
//!
//! [`ChatSession`] owns the store for a session and is the only writer besides
//! the sync engine. Every gateway call is bounded by the configured fetch
//! timeout and every `.await` is followed by a membership re-check before the
//! result is committed to the store.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::future::join_all;
use parley_core::config::SyncConfig;
use parley_core::model::{
    Channel, ChannelId, ConnectionState, LocalId, MemberRole, Membership, Message, MessageId,
    MessageKey, MessageKind, SearchResults, UserId,
};
use parley_gateway::{
    Gateway, GatewayError, MessagePageQuery, NewMessage, SearchQuery, UnreadQuery,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::profiles::ProfileCache;
use crate::store::{Action, Store, StoreState};

pub struct ChatSession<G: Gateway> {
    gateway: Arc<G>,
    store: Arc<Store>,
    profiles: ProfileCache,
    config: SyncConfig,
    user_id: UserId,
    next_local_id: AtomicU64,
    search_generation: AtomicU64,
}

impl<G: Gateway> ChatSession<G> {
    pub fn new(gateway: Arc<G>, config: SyncConfig) -> Self {
        Self::with_store(gateway, Arc::new(Store::new()), config)
    }

    pub fn with_store(gateway: Arc<G>, store: Arc<Store>, config: SyncConfig) -> Self {
        let user_id = gateway.current_user();
        Self {
            gateway,
            store,
            profiles: ProfileCache::new(),
            config,
            user_id,
            next_local_id: AtomicU64::new(1),
            search_generation: AtomicU64::new(0),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn profiles(&self) -> &ProfileCache {
        &self.profiles
    }

    pub fn snapshot(&self) -> StoreState {
        self.store.snapshot()
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        if self.store.read(|s| s.connection_state()) != state {
            debug!(state = state.label(), "connection state changed");
            self.store.dispatch(Action::SetConnectionState(state));
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.config.fetch_timeout(), call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.config.fetch_timeout_ms,
                    "gateway call timed out"
                );
                Err(GatewayError::Timeout(self.config.fetch_timeout_ms))
            }
        }
    }

    // ── Membership ───────────────────────────────────────────────────

    pub fn is_member_cached(&self, channel_id: ChannelId) -> bool {
        self.store.read(|s| s.membership(channel_id).is_some())
    }

    /// True when the store still lists the channel but no longer holds a
    /// membership for it, i.e. access was revoked while we were waiting.
    fn membership_revoked(&self, channel_id: ChannelId) -> bool {
        self.store
            .read(|s| s.has_channel(channel_id) && s.membership(channel_id).is_none())
    }

    pub(crate) async fn fetch_own_membership(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<Membership>, SyncError> {
        Ok(self
            .bounded(
                "fetch_membership",
                self.gateway.fetch_membership(channel_id, self.user_id),
            )
            .await?)
    }

    /// Membership check: store cache first, gateway on a miss.
    pub async fn check_membership(&self, channel_id: ChannelId) -> Result<bool, SyncError> {
        if self.is_member_cached(channel_id) {
            return Ok(true);
        }
        match self.fetch_own_membership(channel_id).await? {
            Some(membership) => {
                if self.store.read(|s| s.has_channel(channel_id)) {
                    self.store.dispatch(Action::UpsertMembership(membership));
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Channels ─────────────────────────────────────────────────────

    pub async fn load_channels(&self) -> Result<Vec<Channel>, SyncError> {
        let memberships = self
            .bounded(
                "fetch_memberships",
                self.gateway.fetch_memberships(self.user_id),
            )
            .await?;
        let ids: Vec<ChannelId> = memberships.iter().map(|m| m.channel_id).collect();
        let channels: Vec<Channel> = if ids.is_empty() {
            Vec::new()
        } else {
            self.bounded("fetch_channels", self.gateway.fetch_channels(&ids))
                .await?
        };
        let channels: Vec<Channel> = channels.into_iter().filter(|c| !c.archived).collect();
        let memberships: Vec<Membership> = memberships
            .into_iter()
            .filter(|m| channels.iter().any(|c| c.id == m.channel_id))
            .collect();

        info!(count = channels.len(), "channels loaded");
        self.store.dispatch(Action::ReplaceChannels(channels.clone()));
        self.store.dispatch(Action::SetMemberships(memberships));

        if self.config.load_previews {
            self.load_previews(&channels).await;
        }
        if let Err(e) = self.recompute_all_unread().await {
            warn!(error = %e, "unread recount after channel load failed");
        }
        Ok(self.store.read(|s| s.channels().to_vec()))
    }

    async fn load_previews(&self, channels: &[Channel]) {
        let fetches = channels.iter().map(|channel| {
            let query = MessagePageQuery::latest(channel.id, 1);
            async move {
                let result = self
                    .bounded("fetch_messages", self.gateway.fetch_messages(&query))
                    .await;
                (query.channel_id, result)
            }
        });

        let mut latest = Vec::new();
        for (channel_id, result) in join_all(fetches).await {
            match result {
                Ok(page) => latest.extend(page.into_iter().next()),
                Err(e) => debug!(channel_id = %channel_id, error = %e, "preview fetch failed"),
            }
        }
        self.profiles
            .attach_authors(&*self.gateway, &mut latest, self.config.fetch_timeout())
            .await;
        for message in latest {
            if self.is_member_cached(message.channel_id) {
                self.store.dispatch(Action::MergeMessage(message));
            }
        }
    }

    pub async fn join_channel(&self, channel_id: ChannelId) -> Result<Channel, SyncError> {
        let membership = match self
            .bounded(
                "insert_membership",
                self.gateway
                    .insert_membership(channel_id, self.user_id, MemberRole::Member),
            )
            .await
        {
            Ok(membership) => membership,
            Err(GatewayError::Conflict(_)) => self
                .fetch_own_membership(channel_id)
                .await?
                .ok_or(SyncError::NotMember(channel_id))?,
            Err(e) => return Err(e.into()),
        };
        let channel = self
            .bounded("fetch_channel", self.gateway.fetch_channel(channel_id))
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("channel {channel_id}")))?;

        if channel.archived {
            return Ok(channel);
        }
        info!(channel_id = %channel_id, "joined channel");
        self.store.dispatch(Action::UpsertChannel(channel.clone()));
        self.store.dispatch(Action::UpsertMembership(membership));
        if let Err(e) = self.recompute_unread(channel_id).await {
            warn!(channel_id = %channel_id, error = %e, "unread recount after join failed");
        }
        Ok(channel)
    }

    pub async fn leave_channel(&self, channel_id: ChannelId) -> Result<(), SyncError> {
        match self
            .bounded(
                "delete_membership",
                self.gateway.delete_membership(channel_id, self.user_id),
            )
            .await
        {
            Ok(()) | Err(GatewayError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(channel_id = %channel_id, "left channel");
        self.store.dispatch(Action::RemoveChannel(channel_id));
        Ok(())
    }

    // ── Members ──────────────────────────────────────────────────────

    fn ensure_can_manage(&self, channel_id: ChannelId, target: UserId) -> Result<(), SyncError> {
        self.store.read(|s| {
            let membership = s
                .membership(channel_id)
                .ok_or(SyncError::NotMember(channel_id))?;
            let creator = s.channel(channel_id).map(|c| c.created_by);
            if membership.role != MemberRole::Manager && creator != Some(self.user_id) {
                return Err(SyncError::NotAuthorized(
                    "only managers and the channel creator can manage members".to_string(),
                ));
            }
            if creator == Some(target) {
                return Err(SyncError::NotAuthorized(
                    "the channel creator's membership cannot be changed".to_string(),
                ));
            }
            Ok(())
        })
    }

    pub async fn add_member(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<Membership, SyncError> {
        self.ensure_can_manage(channel_id, user_id)?;
        let membership = self
            .bounded(
                "insert_membership",
                self.gateway.insert_membership(channel_id, user_id, role),
            )
            .await?;
        self.refresh_members_if_active(channel_id).await;
        Ok(membership)
    }

    pub async fn remove_member(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<(), SyncError> {
        if user_id == self.user_id {
            return self.leave_channel(channel_id).await;
        }
        self.ensure_can_manage(channel_id, user_id)?;
        match self
            .bounded(
                "delete_membership",
                self.gateway.delete_membership(channel_id, user_id),
            )
            .await
        {
            Ok(()) | Err(GatewayError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.refresh_members_if_active(channel_id).await;
        Ok(())
    }

    pub async fn set_member_role(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<Membership, SyncError> {
        self.ensure_can_manage(channel_id, user_id)?;
        let membership = self
            .bounded(
                "update_member_role",
                self.gateway.update_member_role(channel_id, user_id, role),
            )
            .await?;
        if user_id == self.user_id && self.is_member_cached(channel_id) {
            self.store
                .dispatch(Action::UpsertMembership(membership.clone()));
        }
        self.refresh_members_if_active(channel_id).await;
        Ok(membership)
    }

    pub async fn load_channel_members(
        &self,
        channel_id: ChannelId,
    ) -> Result<Vec<Membership>, SyncError> {
        if !self.check_membership(channel_id).await? {
            return Err(SyncError::NotMember(channel_id));
        }
        let members = self
            .bounded(
                "fetch_channel_members",
                self.gateway.fetch_channel_members(channel_id),
            )
            .await?;
        if self.membership_revoked(channel_id) {
            return Ok(Vec::new());
        }
        self.store.dispatch(Action::SetChannelMembers {
            channel_id,
            members: members.clone(),
        });
        Ok(members)
    }

    pub(crate) async fn refresh_members_if_active(&self, channel_id: ChannelId) {
        if self.store.read(|s| s.active_channel()) != Some(channel_id) {
            return;
        }
        if let Err(e) = self.load_channel_members(channel_id).await {
            warn!(channel_id = %channel_id, error = %e, "member refresh failed");
        }
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Replace the channel's window with its newest page.
    ///
    /// Fails closed: for a non-member the window is emptied and marked as
    /// having no older history.
    pub async fn load_messages(&self, channel_id: ChannelId) -> Result<Vec<Message>, SyncError> {
        if !self.check_membership(channel_id).await? {
            debug!(channel_id = %channel_id, "not a member, clearing window");
            self.store.dispatch(Action::ReplaceMessageWindow {
                channel_id,
                messages: Vec::new(),
                has_more_older: false,
            });
            return Ok(Vec::new());
        }

        let limit = self.config.page_size;
        let mut page = self
            .bounded(
                "fetch_messages",
                self.gateway
                    .fetch_messages(&MessagePageQuery::latest(channel_id, limit)),
            )
            .await?;
        let has_more_older = page.len() >= limit;
        page.reverse();
        self.profiles
            .attach_authors(&*self.gateway, &mut page, self.config.fetch_timeout())
            .await;

        if self.membership_revoked(channel_id) {
            debug!(channel_id = %channel_id, "membership revoked during load, discarding page");
            return Ok(Vec::new());
        }
        debug!(channel_id = %channel_id, count = page.len(), has_more_older, "messages loaded");
        self.store.dispatch(Action::ReplaceMessageWindow {
            channel_id,
            messages: page,
            has_more_older,
        });
        Ok(self.store.read(|s| s.messages(channel_id)))
    }

    /// Fetch the page before the oldest committed message. Returns how many
    /// messages the gateway returned; zero when there was nothing to do.
    pub async fn load_older_messages(&self, channel_id: ChannelId) -> Result<usize, SyncError> {
        let cursor = self.store.transact(|s| {
            let cursor = s.window(channel_id).and_then(|w| {
                if w.is_empty() || w.is_loading_older() || !w.has_more_older() {
                    return None;
                }
                w.oldest_committed().map(|m| m.created_at)
            });
            let actions = match cursor {
                Some(_) => vec![Action::SetWindowLoading {
                    channel_id,
                    loading: true,
                }],
                None => Vec::new(),
            };
            (actions, cursor)
        });
        let Some(before) = cursor else {
            return Ok(0);
        };

        let result = self.fetch_older(channel_id, before).await;
        self.store.dispatch(Action::SetWindowLoading {
            channel_id,
            loading: false,
        });
        let page = result?;

        if self.membership_revoked(channel_id) {
            return Ok(0);
        }
        let fetched = page.len();
        debug!(channel_id = %channel_id, fetched, "older messages loaded");
        self.store.dispatch(Action::PrependOlderMessages {
            channel_id,
            messages: page,
        });
        if fetched < self.config.page_size {
            self.store.dispatch(Action::SetHasMoreOlder {
                channel_id,
                has_more: false,
            });
        }
        Ok(fetched)
    }

    async fn fetch_older(
        &self,
        channel_id: ChannelId,
        before: chrono::DateTime<Utc>,
    ) -> Result<Vec<Message>, SyncError> {
        let query = MessagePageQuery::before(channel_id, before, self.config.page_size);
        let mut page = self
            .bounded("fetch_messages", self.gateway.fetch_messages(&query))
            .await?;
        page.reverse();
        self.profiles
            .attach_authors(&*self.gateway, &mut page, self.config.fetch_timeout())
            .await;
        Ok(page)
    }

    /// Fetch the joined row of one message with its author resolved.
    pub(crate) async fn fetch_joined(
        &self,
        message_id: MessageId,
    ) -> Result<Option<Message>, SyncError> {
        let message = self
            .bounded("fetch_message", self.gateway.fetch_message(message_id))
            .await?;
        let Some(mut message) = message else {
            return Ok(None);
        };
        self.attach_author(&mut message).await;
        Ok(Some(message))
    }

    async fn attach_author(&self, message: &mut Message) {
        self.profiles
            .attach_authors(
                &*self.gateway,
                std::slice::from_mut(message),
                self.config.fetch_timeout(),
            )
            .await;
    }

    /// Re-fetch a message and merge it if its channel is still visible.
    pub async fn refresh_message(
        &self,
        message_id: MessageId,
    ) -> Result<Option<Message>, SyncError> {
        let Some(message) = self.fetch_joined(message_id).await? else {
            return Ok(None);
        };
        if self.is_member_cached(message.channel_id) {
            self.store.dispatch(Action::MergeMessage(message.clone()));
        }
        Ok(Some(message))
    }

    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        body: &str,
        parent_id: Option<MessageId>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message, SyncError> {
        if body.trim().is_empty() {
            return Err(SyncError::InvalidInput("message body is empty".to_string()));
        }
        if !self.check_membership(channel_id).await? {
            return Err(SyncError::NotMember(channel_id));
        }

        let nonce = Uuid::new_v4();
        let metadata = metadata.unwrap_or(serde_json::Value::Null);
        let pending_key = self
            .config
            .optimistic_send
            .then(|| self.merge_pending(channel_id, body, parent_id, &metadata, nonce));

        let new_message = NewMessage {
            channel_id,
            body: body.to_string(),
            kind: MessageKind::Text,
            parent_id,
            metadata,
            client_nonce: Some(nonce),
        };
        let mut message = match self
            .bounded("insert_message", self.gateway.insert_message(new_message))
            .await
        {
            Ok(message) => message,
            Err(e) => {
                if let Some(key) = pending_key {
                    self.store
                        .dispatch(Action::RemoveMessage { channel_id, key });
                }
                warn!(channel_id = %channel_id, error = %e, "send failed");
                return Err(e.into());
            }
        };

        self.attach_author(&mut message).await;
        self.store.dispatch(Action::MergeMessage(message.clone()));
        debug!(channel_id = %channel_id, message_id = ?message.id(), "message sent");
        Ok(message)
    }

    fn merge_pending(
        &self,
        channel_id: ChannelId,
        body: &str,
        parent_id: Option<MessageId>,
        metadata: &serde_json::Value,
        nonce: Uuid,
    ) -> MessageKey {
        let key = MessageKey::Pending(LocalId(self.next_local_id.fetch_add(1, Ordering::Relaxed)));
        self.store.dispatch(Action::MergeMessage(Message {
            key,
            channel_id,
            author_id: self.user_id,
            body: body.to_string(),
            kind: MessageKind::Text,
            parent_id,
            metadata: metadata.clone(),
            created_at: Utc::now(),
            edited_at: None,
            is_deleted: false,
            client_nonce: Some(nonce),
            attachments: Vec::new(),
            reactions: Vec::new(),
            author: self.profiles.get(self.user_id),
        }));
        key
    }

    fn ensure_own_message(&self, message_id: MessageId, verb: &str) -> Result<(), SyncError> {
        let author = self
            .store
            .read(|s| s.find_message(&MessageKey::Committed(message_id)).map(|m| m.author_id));
        match author {
            Some(author) if author != self.user_id => Err(SyncError::NotAuthorized(format!(
                "only the author can {verb} a message"
            ))),
            _ => Ok(()),
        }
    }

    pub async fn edit_message(&self, message_id: MessageId, body: &str) -> Result<Message, SyncError> {
        if body.trim().is_empty() {
            return Err(SyncError::InvalidInput("message body is empty".to_string()));
        }
        self.ensure_own_message(message_id, "edit")?;
        let mut message = self
            .bounded(
                "update_message_body",
                self.gateway.update_message_body(message_id, body),
            )
            .await
            .map_err(|e| not_found_as_message(e, message_id))?;
        self.attach_author(&mut message).await;
        if self.is_member_cached(message.channel_id) {
            self.store.dispatch(Action::MergeMessage(message.clone()));
        }
        Ok(message)
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<Message, SyncError> {
        self.ensure_own_message(message_id, "delete")?;
        let mut message = self
            .bounded("delete_message", self.gateway.delete_message(message_id))
            .await
            .map_err(|e| not_found_as_message(e, message_id))?;
        self.attach_author(&mut message).await;
        if self.is_member_cached(message.channel_id) {
            self.store.dispatch(Action::MergeMessage(message.clone()));
        }
        Ok(message)
    }

    // ── Reactions ────────────────────────────────────────────────────

    pub async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> Result<(), SyncError> {
        if emoji.trim().is_empty() {
            return Err(SyncError::InvalidInput("emoji is empty".to_string()));
        }
        match self
            .bounded(
                "insert_reaction",
                self.gateway.insert_reaction(message_id, emoji),
            )
            .await
        {
            Ok(_) => {}
            Err(GatewayError::Conflict(_)) => debug!(message_id = %message_id, "reaction already present"),
            Err(e) => return Err(not_found_as_message(e, message_id)),
        }
        self.refresh_message(message_id).await?;
        Ok(())
    }

    pub async fn remove_reaction(&self, message_id: MessageId, emoji: &str) -> Result<(), SyncError> {
        match self
            .bounded(
                "delete_reaction",
                self.gateway.delete_reaction(message_id, emoji),
            )
            .await
        {
            Ok(()) => {}
            Err(GatewayError::NotFound(_)) => debug!(message_id = %message_id, "reaction already gone"),
            Err(e) => return Err(e.into()),
        }
        self.refresh_message(message_id).await?;
        Ok(())
    }

    // ── Read state and unread ────────────────────────────────────────

    pub async fn mark_as_read(&self, channel_id: ChannelId) -> Result<(), SyncError> {
        if !self.check_membership(channel_id).await? {
            return Err(SyncError::NotMember(channel_id));
        }
        let membership = self
            .bounded(
                "update_last_read",
                self.gateway.update_last_read(channel_id, Utc::now()),
            )
            .await?;
        if self.membership_revoked(channel_id) {
            return Ok(());
        }
        self.store.dispatch(Action::UpsertMembership(membership));
        self.store.dispatch(Action::SetUnreadCount {
            channel_id,
            count: 0,
        });
        Ok(())
    }

    /// Recount one channel from the gateway. Channels without a cached
    /// membership are left alone and report zero.
    pub async fn recompute_unread(&self, channel_id: ChannelId) -> Result<u32, SyncError> {
        let Some(since) = self
            .store
            .read(|s| s.membership(channel_id).map(|m| m.last_read_at))
        else {
            return Ok(0);
        };
        let query = UnreadQuery {
            channel_id,
            user_id: self.user_id,
            since,
        };
        let counted = self
            .bounded("count_unread", self.gateway.count_unread(&query))
            .await?;

        self.store.transact(|s| {
            if s.membership(channel_id).map(|m| m.last_read_at) != Some(since) {
                debug!(channel_id = %channel_id, "watermark moved during recount, discarding");
                return (Vec::new(), ());
            }
            let actions = vec![
                Action::SetUnreadCount {
                    channel_id,
                    count: counted.count,
                },
                Action::SetUnreadCoverage {
                    channel_id,
                    newest_at: counted.newest_at,
                },
            ];
            (actions, ())
        });
        Ok(self.store.read(|s| s.unread_count(channel_id)))
    }

    pub async fn recompute_all_unread(&self) -> Result<(), SyncError> {
        let ids: Vec<ChannelId> = self
            .store
            .read(|s| s.channels().iter().map(|c| c.id).collect());
        let results = join_all(ids.into_iter().map(|id| self.recompute_unread(id))).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Open a channel (or close the current one with `None`).
    pub async fn set_active_channel(&self, channel_id: Option<ChannelId>) -> Result<(), SyncError> {
        if let Some(id) = channel_id {
            if !self.store.read(|s| s.has_channel(id)) {
                return Err(SyncError::NotMember(id));
            }
        }
        let previous = self.store.read(|s| s.active_channel());
        self.store.dispatch(Action::SetActiveChannel(channel_id));
        debug!(channel_id = ?channel_id, previous = ?previous, "active channel set");

        if let Some(id) = channel_id {
            self.load_messages(id).await?;
            if self.is_member_cached(id) {
                self.mark_as_read(id).await?;
            }
        }
        if let Some(prev) = previous.filter(|p| Some(*p) != channel_id) {
            self.recompute_unread(prev).await?;
        }
        if let Some(id) = channel_id {
            self.recompute_unread(id).await?;
        }
        Ok(())
    }

    // ── Search ───────────────────────────────────────────────────────

    /// Substring search across the user's visible channels. Results of a
    /// search overtaken by a newer one are not stored.
    pub async fn search_messages(&self, query: &str) -> Result<SearchResults, SyncError> {
        let generation = self.search_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.dispatch(Action::ClearSearchResults);

        let text = query.trim().to_string();
        let channel_ids: Vec<ChannelId> = self
            .store
            .read(|s| s.channels().iter().map(|c| c.id).collect());
        if text.is_empty() || channel_ids.is_empty() {
            return Ok(SearchResults {
                query: text,
                messages: Vec::new(),
            });
        }

        let search = SearchQuery {
            channel_ids,
            text: text.clone(),
            limit: self.config.page_size,
        };
        let mut messages = self
            .bounded("search_messages", self.gateway.search_messages(&search))
            .await?;
        self.profiles
            .attach_authors(&*self.gateway, &mut messages, self.config.fetch_timeout())
            .await;
        messages.retain(|m| self.is_member_cached(m.channel_id));

        let results = SearchResults {
            query: text,
            messages,
        };
        if self.search_generation.load(Ordering::SeqCst) == generation {
            debug!(query = %results.query, hits = results.messages.len(), "search complete");
            self.store.dispatch(Action::SetSearchResults(results.clone()));
        }
        Ok(results)
    }

    pub fn clear_search(&self) {
        self.search_generation.fetch_add(1, Ordering::SeqCst);
        self.store.dispatch(Action::ClearSearchResults);
    }

    // ── Resync ───────────────────────────────────────────────────────

    /// Full reload: channel list, then the active channel's newest page.
    pub async fn resync(&self) -> Result<(), SyncError> {
        info!("resyncing");
        self.load_channels().await?;
        let active = self.store.read(|s| s.active_channel());
        if let Some(channel_id) = active {
            self.load_messages(channel_id).await?;
        }
        Ok(())
    }
}

fn not_found_as_message(error: GatewayError, message_id: MessageId) -> SyncError {
    match error {
        GatewayError::NotFound(_) => SyncError::MessageNotFound(message_id),
        other => other.into(),
    }
}
