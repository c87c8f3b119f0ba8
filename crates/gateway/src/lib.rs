//! Request/response access to the hosted backend.
//!
//! The sync engine never talks to storage directly; every read and write goes
//! through [`Gateway`]. Server-side rules (membership, authorship, reaction
//! uniqueness) are enforced behind this seam and surface as [`GatewayError`].

pub mod memory;

use chrono::{DateTime, Utc};
use parley_core::model::{
    Channel, ChannelId, MemberRole, Membership, Message, MessageId, MessageKind, Profile, Reaction,
    UserId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::{MemoryBackend, MemoryGateway};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GatewayError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// One page of channel history, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePageQuery {
    pub channel_id: ChannelId,
    /// Only messages created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl MessagePageQuery {
    pub fn latest(channel_id: ChannelId, limit: usize) -> Self {
        Self {
            channel_id,
            before: None,
            limit,
        }
    }

    pub fn before(channel_id: ChannelId, before: DateTime<Utc>, limit: usize) -> Self {
        Self {
            channel_id,
            before: Some(before),
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub channel_id: ChannelId,
    pub body: String,
    pub kind: MessageKind,
    pub parent_id: Option<MessageId>,
    pub metadata: serde_json::Value,
    pub client_nonce: Option<Uuid>,
}

impl NewMessage {
    pub fn text(channel_id: ChannelId, body: impl Into<String>) -> Self {
        Self {
            channel_id,
            body: body.into(),
            kind: MessageKind::Text,
            parent_id: None,
            metadata: serde_json::Value::Null,
            client_nonce: None,
        }
    }
}

/// Unread count query: messages in `channel_id` after `since`, not by `user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadQuery {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub since: Option<DateTime<Utc>>,
}

/// Result of an unread count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub count: u32,
    /// Creation time of the newest row in the channel when the count ran,
    /// counted or not. Rows at or before it are reflected in `count`.
    pub newest_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub channel_ids: Vec<ChannelId>,
    pub text: String,
    pub limit: usize,
}

/// Async access to channels, messages, memberships and profiles.
///
/// Message reads return the joined row (attachments and reactions) with
/// `author` left unresolved. Pages are ordered newest first.
#[allow(async_fn_in_trait)]
pub trait Gateway: Send + Sync + 'static {
    /// The authenticated user this gateway acts as.
    fn current_user(&self) -> UserId;

    // ── Channels and memberships ─────────────────────────────────────

    async fn fetch_memberships(&self, user_id: UserId) -> Result<Vec<Membership>, GatewayError>;

    async fn fetch_membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<Option<Membership>, GatewayError>;

    async fn fetch_channels(&self, ids: &[ChannelId]) -> Result<Vec<Channel>, GatewayError>;

    async fn fetch_channel(&self, id: ChannelId) -> Result<Option<Channel>, GatewayError>;

    async fn fetch_channel_members(
        &self,
        channel_id: ChannelId,
    ) -> Result<Vec<Membership>, GatewayError>;

    async fn insert_membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<Membership, GatewayError>;

    async fn delete_membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<(), GatewayError>;

    async fn update_member_role(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<Membership, GatewayError>;

    async fn update_last_read(
        &self,
        channel_id: ChannelId,
        at: DateTime<Utc>,
    ) -> Result<Membership, GatewayError>;

    // ── Messages ─────────────────────────────────────────────────────

    async fn fetch_messages(&self, query: &MessagePageQuery) -> Result<Vec<Message>, GatewayError>;

    async fn fetch_message(&self, id: MessageId) -> Result<Option<Message>, GatewayError>;

    async fn insert_message(&self, message: NewMessage) -> Result<Message, GatewayError>;

    async fn update_message_body(&self, id: MessageId, body: &str)
    -> Result<Message, GatewayError>;

    /// Soft delete: the row stays with `is_deleted = true`.
    async fn delete_message(&self, id: MessageId) -> Result<Message, GatewayError>;

    async fn count_unread(&self, query: &UnreadQuery) -> Result<UnreadCount, GatewayError>;

    async fn search_messages(&self, query: &SearchQuery) -> Result<Vec<Message>, GatewayError>;

    // ── Reactions and profiles ───────────────────────────────────────

    /// `Conflict` when the same user already reacted with the same emoji.
    async fn insert_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Reaction, GatewayError>;

    /// `NotFound` when there is no such reaction.
    async fn delete_reaction(&self, message_id: MessageId, emoji: &str)
    -> Result<(), GatewayError>;

    async fn fetch_profiles(&self, ids: &[UserId]) -> Result<Vec<Profile>, GatewayError>;
}
