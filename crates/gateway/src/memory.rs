//! In-process backend used by tests and local tooling.
//!
//! [`MemoryBackend`] holds the tables and plays the role of the hosted service:
//! it enforces row-level rules and publishes a [`ChangeEvent`] for every
//! committed write. Each signed-in user talks to it through a
//! [`MemoryGateway`]. Seeding helpers on the backend bypass authorization and
//! stand in for writes made by other clients.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_core::event::{BroadcastChangeFeed, ChangeEvent, MessageRow, RowChange};
use parley_core::model::{
    Attachment, AttachmentId, Channel, ChannelId, ChannelKind, MemberRole, Membership, Message,
    MessageId, MessageKey, MessageKind, Profile, Reaction, UserId,
};
use tracing::debug;

use crate::{
    Gateway, GatewayError, MessagePageQuery, NewMessage, SearchQuery, UnreadCount, UnreadQuery,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    row: MessageRow,
    metadata: serde_json::Value,
}

#[derive(Default)]
struct Tables {
    channels: HashMap<ChannelId, Channel>,
    memberships: HashMap<(ChannelId, UserId), Membership>,
    messages: HashMap<MessageId, StoredMessage>,
    attachments: Vec<Attachment>,
    reactions: Vec<Reaction>,
    profiles: HashMap<UserId, Profile>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing creation times so ordering ties never depend on the wall clock.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn observe_timestamp(&mut self, ts: DateTime<Utc>) {
        if self.last_timestamp.is_none_or(|last| ts > last) {
            self.last_timestamp = Some(ts);
        }
    }

    fn is_member(&self, channel_id: ChannelId, user_id: UserId) -> bool {
        self.memberships.contains_key(&(channel_id, user_id))
    }

    fn can_manage(&self, channel_id: ChannelId, user_id: UserId) -> bool {
        let is_creator = self
            .channels
            .get(&channel_id)
            .is_some_and(|c| c.created_by == user_id);
        let is_manager = self
            .memberships
            .get(&(channel_id, user_id))
            .is_some_and(|m| m.role == MemberRole::Manager);
        is_creator || is_manager
    }

    fn is_creator(&self, channel_id: ChannelId, user_id: UserId) -> bool {
        self.channels
            .get(&channel_id)
            .is_some_and(|c| c.created_by == user_id)
    }

    fn can_see_channel(&self, channel: &Channel, user_id: UserId) -> bool {
        channel.kind == ChannelKind::Public || self.is_member(channel.id, user_id)
    }

    fn joined(&self, stored: &StoredMessage) -> Message {
        let row = &stored.row;
        Message {
            key: MessageKey::Committed(row.id),
            channel_id: row.channel_id,
            author_id: row.author_id,
            body: row.body.clone(),
            kind: row.kind,
            parent_id: row.parent_id,
            metadata: stored.metadata.clone(),
            created_at: row.created_at,
            edited_at: row.edited_at,
            is_deleted: row.is_deleted,
            client_nonce: row.client_nonce,
            attachments: self
                .attachments
                .iter()
                .filter(|a| a.message_id == row.id)
                .cloned()
                .collect(),
            reactions: self
                .reactions
                .iter()
                .filter(|r| r.message_id == row.id)
                .cloned()
                .collect(),
            author: None,
        }
    }

    fn visible_message(&self, id: MessageId, user_id: UserId) -> Option<&StoredMessage> {
        self.messages
            .get(&id)
            .filter(|m| self.is_member(m.row.channel_id, user_id))
    }
}

#[derive(Default)]
struct Faults {
    queued: VecDeque<GatewayError>,
    latency: Option<Duration>,
    profile_latency: Option<Duration>,
    calls: HashMap<&'static str, u64>,
}

/// Shared tables plus the change feed they publish to.
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    feed: Option<BroadcastChangeFeed>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            faults: Mutex::new(Faults::default()),
            feed: None,
        })
    }

    /// Backend that publishes every committed write to `feed`.
    pub fn with_feed(feed: BroadcastChangeFeed) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            faults: Mutex::new(Faults::default()),
            feed: Some(feed),
        })
    }

    /// A gateway authenticated as `user_id`.
    pub fn gateway_for(self: &Arc<Self>, user_id: UserId) -> MemoryGateway {
        MemoryGateway {
            backend: Arc::clone(self),
            user_id,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            if let Err(e) = feed.publish(event) {
                debug!(error = %e, "change not published");
            }
        }
    }

    // ── Fault injection ──────────────────────────────────────────────

    /// The next gateway call (from any user) fails with `error`.
    pub fn fail_next(&self, error: GatewayError) {
        self.faults().queued.push_back(error);
    }

    /// Delay applied to every gateway call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults().latency = latency;
    }

    /// Extra delay applied to profile lookups only.
    pub fn set_profile_latency(&self, latency: Option<Duration>) {
        self.faults().profile_latency = latency;
    }

    /// Number of gateway calls made for operation `op` (e.g. `"fetch_profiles"`).
    pub fn call_count(&self, op: &str) -> u64 {
        self.faults().calls.get(op).copied().unwrap_or(0)
    }

    async fn enter(&self, op: &'static str) -> Result<(), GatewayError> {
        let (fault, latency) = {
            let mut faults = self.faults();
            *faults.calls.entry(op).or_default() += 1;
            let latency = match op {
                "fetch_profiles" => match (faults.latency, faults.profile_latency) {
                    (Some(a), Some(b)) => Some(a + b),
                    (a, b) => a.or(b),
                },
                _ => faults.latency,
            };
            (faults.queued.pop_front(), latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(error) => {
                debug!(op, error = %error, "injected gateway failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    // ── Seeding (bypasses authorization) ─────────────────────────────

    pub fn upsert_profile(&self, profile: Profile) {
        self.tables().profiles.insert(profile.user_id, profile);
    }

    /// Create a channel with `created_by` as its first manager.
    pub fn create_channel(&self, name: &str, kind: ChannelKind, created_by: UserId) -> Channel {
        let (channel, membership) = {
            let mut tables = self.tables();
            let created_at = tables.next_timestamp();
            let channel = Channel {
                id: ChannelId::new(),
                name: name.to_string(),
                description: None,
                kind,
                archived: false,
                created_by,
                created_at,
            };
            let membership = Membership {
                channel_id: channel.id,
                user_id: created_by,
                role: MemberRole::Manager,
                last_read_at: None,
                joined_at: created_at,
            };
            tables.channels.insert(channel.id, channel.clone());
            tables
                .memberships
                .insert((channel.id, created_by), membership.clone());
            (channel, membership)
        };
        self.publish(ChangeEvent::Channel(RowChange::insert(channel.clone())));
        self.publish(ChangeEvent::Membership(RowChange::insert(membership)));
        channel
    }

    pub fn rename_channel(&self, id: ChannelId, name: &str) -> Option<Channel> {
        let channel = {
            let mut tables = self.tables();
            let channel = tables.channels.get_mut(&id)?;
            channel.name = name.to_string();
            channel.clone()
        };
        self.publish(ChangeEvent::Channel(RowChange::update(channel.clone())));
        Some(channel)
    }

    pub fn archive_channel(&self, id: ChannelId) -> Option<Channel> {
        let channel = {
            let mut tables = self.tables();
            let channel = tables.channels.get_mut(&id)?;
            channel.archived = true;
            channel.clone()
        };
        self.publish(ChangeEvent::Channel(RowChange::update(channel.clone())));
        Some(channel)
    }

    /// Hard delete a channel and its memberships.
    pub fn delete_channel(&self, id: ChannelId) -> Option<Channel> {
        let channel = {
            let mut tables = self.tables();
            let channel = tables.channels.remove(&id)?;
            tables.memberships.retain(|(channel_id, _), _| *channel_id != id);
            channel
        };
        self.publish(ChangeEvent::Channel(RowChange::delete(channel.clone())));
        Some(channel)
    }

    pub fn add_member(&self, channel_id: ChannelId, user_id: UserId, role: MemberRole) -> Membership {
        let membership = {
            let mut tables = self.tables();
            let joined_at = tables.next_timestamp();
            let membership = Membership {
                channel_id,
                user_id,
                role,
                last_read_at: None,
                joined_at,
            };
            tables
                .memberships
                .insert((channel_id, user_id), membership.clone());
            membership
        };
        self.publish(ChangeEvent::Membership(RowChange::insert(membership.clone())));
        membership
    }

    pub fn remove_member(&self, channel_id: ChannelId, user_id: UserId) -> Option<Membership> {
        let membership = self.tables().memberships.remove(&(channel_id, user_id))?;
        self.publish(ChangeEvent::Membership(RowChange::delete(membership.clone())));
        Some(membership)
    }

    pub fn set_last_read(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        at: Option<DateTime<Utc>>,
    ) -> Option<Membership> {
        let membership = {
            let mut tables = self.tables();
            let membership = tables.memberships.get_mut(&(channel_id, user_id))?;
            membership.last_read_at = at;
            membership.clone()
        };
        self.publish(ChangeEvent::Membership(RowChange::update(membership.clone())));
        Some(membership)
    }

    /// Insert a message as `author_id`, stamped now.
    pub fn post_message(&self, channel_id: ChannelId, author_id: UserId, body: &str) -> Message {
        self.post_message_with(channel_id, author_id, body, None)
    }

    /// Insert a message with an explicit creation time.
    pub fn post_message_at(
        &self,
        channel_id: ChannelId,
        author_id: UserId,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        self.post_message_with(channel_id, author_id, body, Some(created_at))
    }

    fn post_message_with(
        &self,
        channel_id: ChannelId,
        author_id: UserId,
        body: &str,
        created_at: Option<DateTime<Utc>>,
    ) -> Message {
        let (row, message) = {
            let mut tables = self.tables();
            let created_at = match created_at {
                Some(ts) => {
                    tables.observe_timestamp(ts);
                    ts
                }
                None => tables.next_timestamp(),
            };
            let row = MessageRow {
                id: MessageId::new(),
                channel_id,
                author_id,
                body: body.to_string(),
                kind: MessageKind::Text,
                parent_id: None,
                created_at,
                edited_at: None,
                is_deleted: false,
                client_nonce: None,
            };
            let stored = StoredMessage {
                row: row.clone(),
                metadata: serde_json::Value::Null,
            };
            let message = tables.joined(&stored);
            tables.messages.insert(row.id, stored);
            (row, message)
        };
        self.publish(ChangeEvent::Message(RowChange::insert(row)));
        message
    }

    /// Hard delete a message row.
    pub fn purge_message(&self, id: MessageId) -> Option<MessageRow> {
        let row = {
            let mut tables = self.tables();
            let stored = tables.messages.remove(&id)?;
            tables.attachments.retain(|a| a.message_id != id);
            tables.reactions.retain(|r| r.message_id != id);
            stored.row
        };
        self.publish(ChangeEvent::Message(RowChange::delete(row.clone())));
        Some(row)
    }

    pub fn attach_file(
        &self,
        message_id: MessageId,
        file_name: &str,
        mime_type: Option<&str>,
        size_bytes: u64,
    ) -> Option<Attachment> {
        let attachment = {
            let mut tables = self.tables();
            let channel_id = tables.messages.get(&message_id)?.row.channel_id;
            let created_at = tables.next_timestamp();
            let id = AttachmentId::new();
            let attachment = Attachment {
                id,
                message_id,
                file_name: file_name.to_string(),
                storage_path: format!("{channel_id}/{id}/{file_name}"),
                mime_type: mime_type.map(str::to_string),
                size_bytes,
                created_at,
            };
            tables.attachments.push(attachment.clone());
            attachment
        };
        self.publish(ChangeEvent::Attachment(RowChange::insert(attachment.clone())));
        Some(attachment)
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.tables().channels.get(&id).cloned()
    }

    pub fn membership(&self, channel_id: ChannelId, user_id: UserId) -> Option<Membership> {
        self.tables().memberships.get(&(channel_id, user_id)).cloned()
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        let tables = self.tables();
        tables.messages.get(&id).map(|m| tables.joined(m))
    }

    /// The raw row as a change notification would carry it.
    pub fn message_row(&self, id: MessageId) -> Option<MessageRow> {
        self.tables().messages.get(&id).map(|m| m.row.clone())
    }

    pub fn message_count(&self, channel_id: ChannelId) -> usize {
        self.tables()
            .messages
            .values()
            .filter(|m| m.row.channel_id == channel_id)
            .count()
    }
}

/// Gateway session for one authenticated user.
#[derive(Clone)]
pub struct MemoryGateway {
    backend: Arc<MemoryBackend>,
    user_id: UserId,
}

impl MemoryGateway {
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> GatewayError {
    GatewayError::NotFound(format!("{what} {id}"))
}

impl Gateway for MemoryGateway {
    fn current_user(&self) -> UserId {
        self.user_id
    }

    async fn fetch_memberships(&self, user_id: UserId) -> Result<Vec<Membership>, GatewayError> {
        self.backend.enter("fetch_memberships").await?;
        if user_id != self.user_id {
            return Err(GatewayError::NotAuthorized(
                "memberships of another user".to_string(),
            ));
        }
        let tables = self.backend.tables();
        Ok(tables
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn fetch_membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<Option<Membership>, GatewayError> {
        self.backend.enter("fetch_membership").await?;
        let tables = self.backend.tables();
        if user_id != self.user_id && !tables.is_member(channel_id, self.user_id) {
            return Ok(None);
        }
        Ok(tables.memberships.get(&(channel_id, user_id)).cloned())
    }

    async fn fetch_channels(&self, ids: &[ChannelId]) -> Result<Vec<Channel>, GatewayError> {
        self.backend.enter("fetch_channels").await?;
        let tables = self.backend.tables();
        Ok(ids
            .iter()
            .filter_map(|id| tables.channels.get(id))
            .filter(|c| tables.can_see_channel(c, self.user_id))
            .cloned()
            .collect())
    }

    async fn fetch_channel(&self, id: ChannelId) -> Result<Option<Channel>, GatewayError> {
        self.backend.enter("fetch_channel").await?;
        let tables = self.backend.tables();
        Ok(tables
            .channels
            .get(&id)
            .filter(|c| tables.can_see_channel(c, self.user_id))
            .cloned())
    }

    async fn fetch_channel_members(
        &self,
        channel_id: ChannelId,
    ) -> Result<Vec<Membership>, GatewayError> {
        self.backend.enter("fetch_channel_members").await?;
        let tables = self.backend.tables();
        if !tables.is_member(channel_id, self.user_id) {
            return Err(GatewayError::NotAuthorized(format!(
                "not a member of channel {channel_id}"
            )));
        }
        let mut members: Vec<Membership> = tables
            .memberships
            .values()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| (m.joined_at, m.user_id));
        Ok(members)
    }

    async fn insert_membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<Membership, GatewayError> {
        self.backend.enter("insert_membership").await?;
        let membership = {
            let mut tables = self.backend.tables();
            let channel = tables
                .channels
                .get(&channel_id)
                .ok_or_else(|| not_found("channel", channel_id))?;
            if channel.archived {
                return Err(GatewayError::InvalidInput(format!(
                    "channel {channel_id} is archived"
                )));
            }
            let self_join = user_id == self.user_id
                && role == MemberRole::Member
                && channel.kind == ChannelKind::Public;
            if !self_join && !tables.can_manage(channel_id, self.user_id) {
                return Err(GatewayError::NotAuthorized(format!(
                    "cannot add members to channel {channel_id}"
                )));
            }
            if tables.is_member(channel_id, user_id) {
                return Err(GatewayError::Conflict(format!(
                    "user {user_id} already in channel {channel_id}"
                )));
            }
            let joined_at = tables.next_timestamp();
            let membership = Membership {
                channel_id,
                user_id,
                role,
                last_read_at: None,
                joined_at,
            };
            tables
                .memberships
                .insert((channel_id, user_id), membership.clone());
            membership
        };
        self.backend
            .publish(ChangeEvent::Membership(RowChange::insert(membership.clone())));
        Ok(membership)
    }

    async fn delete_membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<(), GatewayError> {
        self.backend.enter("delete_membership").await?;
        let removed = {
            let mut tables = self.backend.tables();
            if user_id != self.user_id {
                if !tables.can_manage(channel_id, self.user_id) {
                    return Err(GatewayError::NotAuthorized(format!(
                        "cannot remove members from channel {channel_id}"
                    )));
                }
                if tables.is_creator(channel_id, user_id) {
                    return Err(GatewayError::NotAuthorized(
                        "the channel creator cannot be removed".to_string(),
                    ));
                }
            }
            tables
                .memberships
                .remove(&(channel_id, user_id))
                .ok_or_else(|| not_found("membership", user_id))?
        };
        self.backend
            .publish(ChangeEvent::Membership(RowChange::delete(removed)));
        Ok(())
    }

    async fn update_member_role(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<Membership, GatewayError> {
        self.backend.enter("update_member_role").await?;
        let membership = {
            let mut tables = self.backend.tables();
            if !tables.can_manage(channel_id, self.user_id) {
                return Err(GatewayError::NotAuthorized(format!(
                    "cannot change roles in channel {channel_id}"
                )));
            }
            if tables.is_creator(channel_id, user_id) {
                return Err(GatewayError::NotAuthorized(
                    "the channel creator's role is fixed".to_string(),
                ));
            }
            let membership = tables
                .memberships
                .get_mut(&(channel_id, user_id))
                .ok_or_else(|| not_found("membership", user_id))?;
            membership.role = role;
            membership.clone()
        };
        self.backend
            .publish(ChangeEvent::Membership(RowChange::update(membership.clone())));
        Ok(membership)
    }

    async fn update_last_read(
        &self,
        channel_id: ChannelId,
        at: DateTime<Utc>,
    ) -> Result<Membership, GatewayError> {
        self.backend.enter("update_last_read").await?;
        let membership = {
            let mut tables = self.backend.tables();
            let membership = tables
                .memberships
                .get_mut(&(channel_id, self.user_id))
                .ok_or_else(|| {
                    GatewayError::NotAuthorized(format!("not a member of channel {channel_id}"))
                })?;
            membership.last_read_at = Some(at);
            let membership = membership.clone();
            // Later rows must sort strictly after the watermark.
            tables.observe_timestamp(at);
            membership
        };
        self.backend
            .publish(ChangeEvent::Membership(RowChange::update(membership.clone())));
        Ok(membership)
    }

    async fn fetch_messages(&self, query: &MessagePageQuery) -> Result<Vec<Message>, GatewayError> {
        self.backend.enter("fetch_messages").await?;
        let tables = self.backend.tables();
        if !tables.is_member(query.channel_id, self.user_id) {
            return Ok(Vec::new());
        }
        let mut rows: Vec<&StoredMessage> = tables
            .messages
            .values()
            .filter(|m| m.row.channel_id == query.channel_id)
            .filter(|m| query.before.is_none_or(|before| m.row.created_at < before))
            .collect();
        rows.sort_by(|a, b| {
            (b.row.created_at, b.row.id).cmp(&(a.row.created_at, a.row.id))
        });
        Ok(rows
            .into_iter()
            .take(query.limit)
            .map(|m| tables.joined(m))
            .collect())
    }

    async fn fetch_message(&self, id: MessageId) -> Result<Option<Message>, GatewayError> {
        self.backend.enter("fetch_message").await?;
        let tables = self.backend.tables();
        Ok(tables
            .visible_message(id, self.user_id)
            .map(|m| tables.joined(m)))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, GatewayError> {
        self.backend.enter("insert_message").await?;
        if message.body.trim().is_empty() {
            return Err(GatewayError::InvalidInput(
                "message body is empty".to_string(),
            ));
        }
        let (row, joined) = {
            let mut tables = self.backend.tables();
            let channel = tables
                .channels
                .get(&message.channel_id)
                .ok_or_else(|| not_found("channel", message.channel_id))?;
            if channel.archived {
                return Err(GatewayError::InvalidInput(format!(
                    "channel {} is archived",
                    message.channel_id
                )));
            }
            if !tables.is_member(message.channel_id, self.user_id) {
                return Err(GatewayError::NotAuthorized(format!(
                    "not a member of channel {}",
                    message.channel_id
                )));
            }
            if let Some(parent) = message.parent_id {
                let same_channel = tables
                    .messages
                    .get(&parent)
                    .is_some_and(|p| p.row.channel_id == message.channel_id);
                if !same_channel {
                    return Err(GatewayError::InvalidInput(format!(
                        "parent {parent} is not in this channel"
                    )));
                }
            }
            let created_at = tables.next_timestamp();
            let row = MessageRow {
                id: MessageId::new(),
                channel_id: message.channel_id,
                author_id: self.user_id,
                body: message.body,
                kind: message.kind,
                parent_id: message.parent_id,
                created_at,
                edited_at: None,
                is_deleted: false,
                client_nonce: message.client_nonce,
            };
            let stored = StoredMessage {
                row: row.clone(),
                metadata: message.metadata,
            };
            let joined = tables.joined(&stored);
            tables.messages.insert(row.id, stored);
            (row, joined)
        };
        self.backend
            .publish(ChangeEvent::Message(RowChange::insert(row)));
        Ok(joined)
    }

    async fn update_message_body(
        &self,
        id: MessageId,
        body: &str,
    ) -> Result<Message, GatewayError> {
        self.backend.enter("update_message_body").await?;
        if body.trim().is_empty() {
            return Err(GatewayError::InvalidInput(
                "message body is empty".to_string(),
            ));
        }
        let (row, joined) = {
            let mut tables = self.backend.tables();
            let edited_at = tables.next_timestamp();
            let stored = tables
                .messages
                .get_mut(&id)
                .ok_or_else(|| not_found("message", id))?;
            if stored.row.author_id != self.user_id {
                return Err(GatewayError::NotAuthorized(
                    "only the author can edit a message".to_string(),
                ));
            }
            if stored.row.is_deleted {
                return Err(GatewayError::InvalidInput(format!("message {id} is deleted")));
            }
            stored.row.body = body.to_string();
            stored.row.edited_at = Some(edited_at);
            let stored = stored.clone();
            (stored.row.clone(), tables.joined(&stored))
        };
        self.backend
            .publish(ChangeEvent::Message(RowChange::update(row)));
        Ok(joined)
    }

    async fn delete_message(&self, id: MessageId) -> Result<Message, GatewayError> {
        self.backend.enter("delete_message").await?;
        let (row, joined) = {
            let mut tables = self.backend.tables();
            let edited_at = tables.next_timestamp();
            let stored = tables
                .messages
                .get_mut(&id)
                .ok_or_else(|| not_found("message", id))?;
            if stored.row.author_id != self.user_id {
                return Err(GatewayError::NotAuthorized(
                    "only the author can delete a message".to_string(),
                ));
            }
            stored.row.is_deleted = true;
            stored.row.body.clear();
            stored.row.edited_at = Some(edited_at);
            let stored = stored.clone();
            (stored.row.clone(), tables.joined(&stored))
        };
        self.backend
            .publish(ChangeEvent::Message(RowChange::update(row)));
        Ok(joined)
    }

    async fn count_unread(&self, query: &UnreadQuery) -> Result<UnreadCount, GatewayError> {
        self.backend.enter("count_unread").await?;
        let tables = self.backend.tables();
        if !tables.is_member(query.channel_id, self.user_id) {
            return Ok(UnreadCount {
                count: 0,
                newest_at: None,
            });
        }
        let rows: Vec<&MessageRow> = tables
            .messages
            .values()
            .map(|m| &m.row)
            .filter(|row| row.channel_id == query.channel_id)
            .collect();
        let count = rows
            .iter()
            .filter(|row| !row.is_deleted && row.author_id != query.user_id)
            .filter(|row| query.since.is_none_or(|since| row.created_at > since))
            .count();
        Ok(UnreadCount {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            newest_at: rows.iter().map(|row| row.created_at).max(),
        })
    }

    async fn search_messages(&self, query: &SearchQuery) -> Result<Vec<Message>, GatewayError> {
        self.backend.enter("search_messages").await?;
        let needle = query.text.trim().to_lowercase();
        if needle.is_empty() {
            return Err(GatewayError::InvalidInput("search text is empty".to_string()));
        }
        let tables = self.backend.tables();
        let mut hits: Vec<&StoredMessage> = tables
            .messages
            .values()
            .filter(|m| query.channel_ids.contains(&m.row.channel_id))
            .filter(|m| tables.is_member(m.row.channel_id, self.user_id))
            .filter(|m| !m.row.is_deleted && m.row.body.to_lowercase().contains(&needle))
            .collect();
        hits.sort_by(|a, b| (b.row.created_at, b.row.id).cmp(&(a.row.created_at, a.row.id)));
        Ok(hits
            .into_iter()
            .take(query.limit)
            .map(|m| tables.joined(m))
            .collect())
    }

    async fn insert_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Reaction, GatewayError> {
        self.backend.enter("insert_reaction").await?;
        if emoji.trim().is_empty() {
            return Err(GatewayError::InvalidInput("emoji is empty".to_string()));
        }
        let mut tables = self.backend.tables();
        let channel_id = tables
            .messages
            .get(&message_id)
            .map(|m| m.row.channel_id)
            .ok_or_else(|| not_found("message", message_id))?;
        if !tables.is_member(channel_id, self.user_id) {
            return Err(GatewayError::NotAuthorized(format!(
                "not a member of channel {channel_id}"
            )));
        }
        let exists = tables.reactions.iter().any(|r| {
            r.message_id == message_id && r.user_id == self.user_id && r.emoji == emoji
        });
        if exists {
            return Err(GatewayError::Conflict(format!(
                "reaction {emoji} already present"
            )));
        }
        let created_at = tables.next_timestamp();
        let reaction = Reaction {
            message_id,
            user_id: self.user_id,
            emoji: emoji.to_string(),
            created_at,
        };
        tables.reactions.push(reaction.clone());
        Ok(reaction)
    }

    async fn delete_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), GatewayError> {
        self.backend.enter("delete_reaction").await?;
        let mut tables = self.backend.tables();
        let before = tables.reactions.len();
        let user_id = self.user_id;
        tables
            .reactions
            .retain(|r| !(r.message_id == message_id && r.user_id == user_id && r.emoji == emoji));
        if tables.reactions.len() == before {
            return Err(not_found("reaction", emoji));
        }
        Ok(())
    }

    async fn fetch_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>, GatewayError> {
        self.backend.enter("fetch_profiles").await?;
        let tables = self.backend.tables();
        Ok(ids
            .iter()
            .filter_map(|id| tables.profiles.get(id))
            .cloned()
            .collect())
    }
}
