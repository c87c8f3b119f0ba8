use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::FeedError;
use crate::model::{Attachment, Channel, ChannelId, Membership, MessageId, MessageKind, UserId};

/// Backend tables that emit row-change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    Channels,
    ChannelMembers,
    MessageAttachments,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Messages,
        Table::Channels,
        Table::ChannelMembers,
        Table::MessageAttachments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::Channels => "channels",
            Table::ChannelMembers => "channel_members",
            Table::MessageAttachments => "message_attachments",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A single row notification. For deletes `row` is the last known row image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowChange<T> {
    pub op: ChangeOp,
    pub row: T,
}

impl<T> RowChange<T> {
    pub fn insert(row: T) -> Self {
        Self {
            op: ChangeOp::Insert,
            row,
        }
    }

    pub fn update(row: T) -> Self {
        Self {
            op: ChangeOp::Update,
            row,
        }
    }

    pub fn delete(row: T) -> Self {
        Self {
            op: ChangeOp::Delete,
            row,
        }
    }
}

/// Raw `messages` row as carried by a notification, without joined sub-records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub parent_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub client_nonce: Option<Uuid>,
}

/// A row-change notification from one of the watched tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "change", rename_all = "snake_case")]
pub enum ChangeEvent {
    Message(RowChange<MessageRow>),
    Channel(RowChange<Channel>),
    Membership(RowChange<Membership>),
    Attachment(RowChange<Attachment>),
}

impl ChangeEvent {
    pub fn table(&self) -> Table {
        match self {
            ChangeEvent::Message(_) => Table::Messages,
            ChangeEvent::Channel(_) => Table::Channels,
            ChangeEvent::Membership(_) => Table::ChannelMembers,
            ChangeEvent::Attachment(_) => Table::MessageAttachments,
        }
    }

    pub fn op(&self) -> ChangeOp {
        match self {
            ChangeEvent::Message(c) => c.op,
            ChangeEvent::Channel(c) => c.op,
            ChangeEvent::Membership(c) => c.op,
            ChangeEvent::Attachment(c) => c.op,
        }
    }

    /// Channel the row belongs to, when the row carries it.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            ChangeEvent::Message(c) => Some(c.row.channel_id),
            ChangeEvent::Channel(c) => Some(c.row.id),
            ChangeEvent::Membership(c) => Some(c.row.channel_id),
            ChangeEvent::Attachment(_) => None,
        }
    }
}

/// Transport-level status of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

impl SubscriptionStatus {
    /// Whether this status ends the current subscription.
    pub fn is_drop(&self) -> bool {
        !matches!(self, SubscriptionStatus::Subscribed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "item", rename_all = "camelCase")]
pub enum FeedItem {
    Status(SubscriptionStatus),
    Change(ChangeEvent),
}

/// Selects which tables a subscription receives changes for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    tables: Vec<Table>,
}

impl SubscriptionFilter {
    pub fn new(tables: impl IntoIterator<Item = Table>) -> std::result::Result<Self, FeedError> {
        let mut seen = HashSet::new();
        let tables: Vec<Table> = tables.into_iter().filter(|t| seen.insert(*t)).collect();
        if tables.is_empty() {
            return Err(FeedError::InvalidFilter(
                "subscription must name at least one table".to_string(),
            ));
        }
        Ok(Self { tables })
    }

    /// Every table the sync engine watches.
    pub fn all() -> Self {
        Self {
            tables: Table::ALL.to_vec(),
        }
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.tables.contains(&event.table())
    }
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Source of row-change notifications.
pub trait ChangeFeed: Send + Sync + 'static {
    fn subscribe(
        &self,
        filter: &SubscriptionFilter,
    ) -> std::result::Result<FeedSubscription, FeedError>;
}

#[derive(Debug, Clone)]
enum Envelope {
    Item(FeedItem),
    Shutdown,
}

/// In-process change feed backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastChangeFeed {
    sender: broadcast::Sender<Envelope>,
    closed: Arc<AtomicBool>,
}

impl BroadcastChangeFeed {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver a row change to every live subscription.
    pub fn publish(&self, event: ChangeEvent) -> std::result::Result<(), FeedError> {
        self.send(Envelope::Item(FeedItem::Change(event)))
    }

    /// Push a transport status (drop, timeout) to every live subscription.
    pub fn emit_status(&self, status: SubscriptionStatus) -> std::result::Result<(), FeedError> {
        self.send(Envelope::Item(FeedItem::Status(status)))
    }

    /// Take the feed away for good. Live subscriptions see `FeedError::Closed`
    /// and new subscriptions are refused.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(Envelope::Shutdown);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn send(&self, envelope: Envelope) -> std::result::Result<(), FeedError> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        // No subscribers is not an error: notifications are fire-and-forget.
        let _ = self.sender.send(envelope);
        Ok(())
    }
}

impl Default for BroadcastChangeFeed {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ChangeFeed for BroadcastChangeFeed {
    fn subscribe(
        &self,
        filter: &SubscriptionFilter,
    ) -> std::result::Result<FeedSubscription, FeedError> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        Ok(FeedSubscription {
            filter: filter.clone(),
            receiver: self.sender.subscribe(),
            greeting: Some(SubscriptionStatus::Subscribed),
        })
    }
}

/// A live subscription. The first item is always `Status(Subscribed)`.
#[derive(Debug)]
pub struct FeedSubscription {
    filter: SubscriptionFilter,
    receiver: broadcast::Receiver<Envelope>,
    greeting: Option<SubscriptionStatus>,
}

impl FeedSubscription {
    pub async fn recv(&mut self) -> std::result::Result<FeedItem, FeedError> {
        if let Some(status) = self.greeting.take() {
            return Ok(FeedItem::Status(status));
        }

        loop {
            match self.receiver.recv().await {
                Ok(Envelope::Item(FeedItem::Change(event))) if !self.filter.matches(&event) => {}
                Ok(Envelope::Item(item)) => return Ok(item),
                Ok(Envelope::Shutdown) => return Err(FeedError::Closed),
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(FeedError::Lagged(count));
                }
            }
        }
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }
}
