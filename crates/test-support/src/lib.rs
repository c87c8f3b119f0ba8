pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use parley_core::event::ChangeEvent;

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    pub fn event_json(name: &str) -> String {
        read_or_panic(Path::new("events").join(name))
    }

    /// Parse a recorded change notification.
    pub fn event(name: &str) -> ChangeEvent {
        let json = event_json(name);
        serde_json::from_str(&json)
            .unwrap_or_else(|error| panic!("fixture events/{name} is not a change event: {error}"))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

/// Plain value builders with deterministic timestamps.
pub mod build {
    use chrono::{DateTime, TimeZone, Utc};
    use parley_core::event::MessageRow;
    use parley_core::model::{
        Channel, ChannelId, ChannelKind, MemberRole, Membership, Message, MessageId, MessageKey,
        MessageKind, Profile, UserId,
    };

    /// `secs` seconds after a fixed epoch.
    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0)
            .single()
            .unwrap_or_else(|| panic!("timestamp out of range: {secs}"))
    }

    pub fn channel(name: &str, created_by: UserId) -> Channel {
        Channel {
            id: ChannelId::new(),
            name: name.to_string(),
            description: None,
            kind: ChannelKind::Public,
            archived: false,
            created_by,
            created_at: at(0),
        }
    }

    pub fn membership(
        channel_id: ChannelId,
        user_id: UserId,
        last_read_at: Option<DateTime<Utc>>,
    ) -> Membership {
        Membership {
            channel_id,
            user_id,
            role: MemberRole::Member,
            last_read_at,
            joined_at: at(0),
        }
    }

    pub fn profile(user_id: UserId, display_name: &str) -> Profile {
        Profile {
            user_id,
            display_name: display_name.to_string(),
            avatar_url: Some(format!("https://avatars.parley.test/{user_id}.png")),
        }
    }

    /// Committed text message created `secs` after the epoch.
    pub fn message(channel_id: ChannelId, author_id: UserId, body: &str, secs: i64) -> Message {
        Message {
            key: MessageKey::Committed(MessageId::new()),
            channel_id,
            author_id,
            body: body.to_string(),
            kind: MessageKind::Text,
            parent_id: None,
            metadata: serde_json::Value::Null,
            created_at: at(secs),
            edited_at: None,
            is_deleted: false,
            client_nonce: None,
            attachments: Vec::new(),
            reactions: Vec::new(),
            author: None,
        }
    }

    /// The notification row for `message`. Panics on pending messages.
    pub fn row_of(message: &Message) -> MessageRow {
        let id = message
            .id()
            .unwrap_or_else(|| panic!("pending message has no row: {:?}", message.key));
        MessageRow {
            id,
            channel_id: message.channel_id,
            author_id: message.author_id,
            body: message.body.clone(),
            kind: message.kind,
            parent_id: message.parent_id,
            created_at: message.created_at,
            edited_at: message.edited_at,
            is_deleted: message.is_deleted,
            client_nonce: message.client_nonce,
        }
    }

    pub fn bodies<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Vec<String> {
        messages.into_iter().map(|m| m.body.clone()).collect()
    }
}

/// A seeded in-memory backend wired to a broadcast change feed.
pub mod world {
    use std::sync::Arc;

    use parley_core::event::BroadcastChangeFeed;
    use parley_core::model::{Channel, ChannelKind, MemberRole, Message, UserId};
    use parley_gateway::{MemoryBackend, MemoryGateway};

    use crate::build;

    pub struct World {
        pub feed: BroadcastChangeFeed,
        pub backend: Arc<MemoryBackend>,
        /// The signed-in user.
        pub me: UserId,
        /// A second user sharing every seeded channel.
        pub alice: UserId,
    }

    impl World {
        pub fn new() -> Self {
            Self::with_feed(BroadcastChangeFeed::default())
        }

        pub fn with_feed(feed: BroadcastChangeFeed) -> Self {
            let backend = MemoryBackend::with_feed(feed.clone());
            let me = UserId::new();
            let alice = UserId::new();
            backend.upsert_profile(build::profile(me, "Me"));
            backend.upsert_profile(build::profile(alice, "Alice"));
            Self {
                feed,
                backend,
                me,
                alice,
            }
        }

        pub fn gateway(&self) -> Arc<MemoryGateway> {
            Arc::new(self.backend.gateway_for(self.me))
        }

        pub fn gateway_for(&self, user_id: UserId) -> Arc<MemoryGateway> {
            Arc::new(self.backend.gateway_for(user_id))
        }

        /// Public channel created by `me` with `alice` as a member.
        pub fn shared_channel(&self, name: &str) -> Channel {
            let channel = self.backend.create_channel(name, ChannelKind::Public, self.me);
            self.backend
                .add_member(channel.id, self.alice, MemberRole::Member);
            channel
        }

        /// Post `count` messages from `alice`, returning them oldest first.
        pub fn alice_posts(&self, channel: &Channel, count: usize) -> Vec<Message> {
            (0..count)
                .map(|i| {
                    self.backend
                        .post_message(channel.id, self.alice, &format!("alice {i}"))
                })
                .collect()
        }
    }

    impl Default for World {
        fn default() -> Self {
            Self::new()
        }
    }
}
