//! Unread accounting.
//!
//! A message is unread for a user when it is not deleted, was written by
//! someone else, and was created strictly after the user's read watermark.
//! Full recounts run against the gateway; live inserts bump the counter by
//! one through [`counts_as_new_unread`].

use chrono::{DateTime, Utc};
use parley_core::event::MessageRow;
use parley_core::model::{Message, UserId};

use crate::store::StoreState;

pub fn is_unread(
    author_id: UserId,
    created_at: DateTime<Utc>,
    is_deleted: bool,
    user_id: UserId,
    last_read_at: Option<DateTime<Utc>>,
) -> bool {
    !is_deleted && author_id != user_id && last_read_at.is_none_or(|read| created_at > read)
}

/// Count unread messages in a slice of history.
pub fn count_unread<'a>(
    messages: impl IntoIterator<Item = &'a Message>,
    user_id: UserId,
    last_read_at: Option<DateTime<Utc>>,
) -> u32 {
    let count = messages
        .into_iter()
        .filter(|m| !m.is_pending())
        .filter(|m| is_unread(m.author_id, m.created_at, m.is_deleted, user_id, last_read_at))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Whether a freshly inserted row should bump its channel's counter.
///
/// Call before the row is merged: a row already in the window, or one the
/// last full recount already saw, was counted (or seen) earlier.
pub fn counts_as_new_unread(row: &MessageRow, state: &StoreState, user_id: UserId) -> bool {
    if state.active_channel() == Some(row.channel_id) {
        return false;
    }
    if !state.has_channel(row.channel_id) {
        return false;
    }
    if state
        .window(row.channel_id)
        .is_some_and(|w| w.contains_id(row.id))
    {
        return false;
    }
    if state
        .unread_counted_through(row.channel_id)
        .is_some_and(|through| row.created_at <= through)
    {
        return false;
    }
    let last_read_at = state
        .membership(row.channel_id)
        .and_then(|m| m.last_read_at);
    is_unread(
        row.author_id,
        row.created_at,
        row.is_deleted,
        user_id,
        last_read_at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Action;
    use chrono::TimeZone;
    use parley_core::model::{
        Channel, ChannelId, ChannelKind, MemberRole, Membership, MessageId, MessageKey, MessageKind,
    };

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(channel_id: ChannelId, author_id: UserId, secs: i64) -> MessageRow {
        MessageRow {
            id: MessageId::new(),
            channel_id,
            author_id,
            body: "hi".to_string(),
            kind: MessageKind::Text,
            parent_id: None,
            created_at: at(secs),
            edited_at: None,
            is_deleted: false,
            client_nonce: None,
        }
    }

    fn as_message(row: &MessageRow) -> Message {
        Message {
            key: MessageKey::Committed(row.id),
            channel_id: row.channel_id,
            author_id: row.author_id,
            body: row.body.clone(),
            kind: row.kind,
            parent_id: None,
            metadata: serde_json::Value::Null,
            created_at: row.created_at,
            edited_at: None,
            is_deleted: row.is_deleted,
            client_nonce: None,
            attachments: vec![],
            reactions: vec![],
            author: None,
        }
    }

    fn state_with(me: UserId, last_read: Option<DateTime<Utc>>) -> (StoreState, ChannelId) {
        let channel = Channel {
            id: ChannelId::new(),
            name: "general".to_string(),
            description: None,
            kind: ChannelKind::Public,
            archived: false,
            created_by: me,
            created_at: at(0),
        };
        let mut state = StoreState::new();
        state.apply(Action::UpsertChannel(channel.clone()));
        state.apply(Action::UpsertMembership(Membership {
            channel_id: channel.id,
            user_id: me,
            role: MemberRole::Member,
            last_read_at: last_read,
            joined_at: at(0),
        }));
        (state, channel.id)
    }

    #[test]
    fn own_deleted_and_read_messages_do_not_count() {
        let me = UserId::new();
        let other = UserId::new();
        let c = ChannelId::new();
        let mut deleted = as_message(&row(c, other, 5));
        deleted.is_deleted = true;
        let messages = vec![
            as_message(&row(c, me, 5)),
            deleted,
            as_message(&row(c, other, 1)),
            as_message(&row(c, other, 5)),
            as_message(&row(c, other, 6)),
        ];
        assert_eq!(count_unread(&messages, me, Some(at(2))), 2);
        assert_eq!(count_unread(&messages, me, None), 3);
    }

    #[test]
    fn watermark_is_exclusive() {
        let me = UserId::new();
        assert!(!is_unread(UserId::new(), at(3), false, me, Some(at(3))));
        assert!(is_unread(UserId::new(), at(4), false, me, Some(at(3))));
    }

    #[test]
    fn new_insert_from_other_user_counts() {
        let me = UserId::new();
        let (state, c) = state_with(me, None);
        assert!(counts_as_new_unread(&row(c, UserId::new(), 1), &state, me));
        assert!(!counts_as_new_unread(&row(c, me, 1), &state, me));
    }

    #[test]
    fn active_channel_and_present_rows_do_not_count() {
        let me = UserId::new();
        let (mut state, c) = state_with(me, None);
        let r = row(c, UserId::new(), 1);
        state.apply(Action::MergeMessage(as_message(&r)));
        assert!(!counts_as_new_unread(&r, &state, me));

        state.apply(Action::SetActiveChannel(Some(c)));
        assert!(!counts_as_new_unread(&row(c, UserId::new(), 2), &state, me));
    }

    #[test]
    fn rows_before_watermark_do_not_count() {
        let me = UserId::new();
        let (state, c) = state_with(me, Some(at(10)));
        assert!(!counts_as_new_unread(&row(c, UserId::new(), 5), &state, me));
        assert!(counts_as_new_unread(&row(c, UserId::new(), 11), &state, me));
    }

    #[test]
    fn rows_covered_by_last_recount_do_not_count() {
        let me = UserId::new();
        let (mut state, c) = state_with(me, None);
        state.apply(Action::SetUnreadCoverage {
            channel_id: c,
            newest_at: Some(at(7)),
        });
        assert!(!counts_as_new_unread(&row(c, UserId::new(), 7), &state, me));
        assert!(counts_as_new_unread(&row(c, UserId::new(), 8), &state, me));

        state.apply(Action::SetUnreadCoverage {
            channel_id: c,
            newest_at: None,
        });
        assert!(counts_as_new_unread(&row(c, UserId::new(), 7), &state, me));
    }

    #[test]
    fn unknown_channel_does_not_count() {
        let me = UserId::new();
        let (state, _) = state_with(me, None);
        assert!(!counts_as_new_unread(
            &row(ChannelId::new(), UserId::new(), 1),
            &state,
            me
        ));
    }
}
