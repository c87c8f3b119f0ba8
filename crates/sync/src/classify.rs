use parley_core::event::{ChangeEvent, ChangeOp, MessageRow};
use parley_core::model::{Channel, ChannelId, Membership, MessageId, UserId};

/// What the engine should do about one change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconcile {
    /// Re-fetch the joined message and merge it. `inserted` carries the raw
    /// row for live inserts so the unread path can inspect it.
    RefreshMessage {
        message_id: MessageId,
        channel_id: Option<ChannelId>,
        inserted: Option<Box<MessageRow>>,
    },
    DropMessage {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    /// Confirm membership, then upsert.
    VerifyChannel(Box<Channel>),
    RemoveChannel(ChannelId),
    ReloadChannels,
    /// The current user's membership row changed.
    RecountUnread(Box<Membership>),
    RefreshMembers(ChannelId),
    Ignore,
}

impl Reconcile {
    pub fn name(&self) -> &'static str {
        match self {
            Reconcile::RefreshMessage { .. } => "refresh_message",
            Reconcile::DropMessage { .. } => "drop_message",
            Reconcile::VerifyChannel(_) => "verify_channel",
            Reconcile::RemoveChannel(_) => "remove_channel",
            Reconcile::ReloadChannels => "reload_channels",
            Reconcile::RecountUnread(_) => "recount_unread",
            Reconcile::RefreshMembers(_) => "refresh_members",
            Reconcile::Ignore => "ignore",
        }
    }
}

/// Map a change event to a reconciliation intent for `current_user`.
pub fn classify(event: &ChangeEvent, current_user: UserId) -> Reconcile {
    match event {
        ChangeEvent::Message(change) => match change.op {
            ChangeOp::Insert => Reconcile::RefreshMessage {
                message_id: change.row.id,
                channel_id: Some(change.row.channel_id),
                inserted: Some(Box::new(change.row.clone())),
            },
            ChangeOp::Update => Reconcile::RefreshMessage {
                message_id: change.row.id,
                channel_id: Some(change.row.channel_id),
                inserted: None,
            },
            ChangeOp::Delete => Reconcile::DropMessage {
                channel_id: change.row.channel_id,
                message_id: change.row.id,
            },
        },
        ChangeEvent::Channel(change) => match change.op {
            ChangeOp::Delete => Reconcile::RemoveChannel(change.row.id),
            ChangeOp::Insert | ChangeOp::Update if change.row.archived => {
                Reconcile::RemoveChannel(change.row.id)
            }
            ChangeOp::Insert | ChangeOp::Update => {
                Reconcile::VerifyChannel(Box::new(change.row.clone()))
            }
        },
        ChangeEvent::Membership(change) if change.row.user_id == current_user => match change.op
        {
            ChangeOp::Insert => Reconcile::ReloadChannels,
            ChangeOp::Update => Reconcile::RecountUnread(Box::new(change.row.clone())),
            ChangeOp::Delete => Reconcile::RemoveChannel(change.row.channel_id),
        },
        ChangeEvent::Membership(change) => Reconcile::RefreshMembers(change.row.channel_id),
        ChangeEvent::Attachment(change) => match change.op {
            ChangeOp::Insert | ChangeOp::Update => Reconcile::RefreshMessage {
                message_id: change.row.message_id,
                channel_id: None,
                inserted: None,
            },
            // Attachments only disappear with their message, whose own event refreshes it.
            ChangeOp::Delete => Reconcile::Ignore,
        },
    }
}
