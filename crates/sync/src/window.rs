use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parley_core::model::{LocalId, Message, MessageId, MessageKey};
use uuid::Uuid;

type SortKey = (DateTime<Utc>, MessageKey);

/// What a merge did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Same identity was already present. Kept in place unless its creation
    /// time changed, in which case it moved to its new sort position.
    Replaced,
    /// A committed message took the place of the pending entry with its nonce,
    /// or a pending entry arrived after its committed row and was dropped.
    Reconciled,
}

/// Per-channel sliding cache of messages, ordered by creation time.
///
/// Entries are keyed by `(created_at, key)` so iteration is always in
/// ascending order with ties broken by identity. The identity index maps a
/// key back to its sort position, which keeps merges and lookups logarithmic.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageWindow {
    entries: BTreeMap<SortKey, Message>,
    index: HashMap<MessageKey, DateTime<Utc>>,
    pending_nonces: HashMap<Uuid, LocalId>,
    has_more_older: bool,
    is_loading_older: bool,
}

impl Default for MessageWindow {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            pending_nonces: HashMap::new(),
            has_more_older: true,
            is_loading_older: false,
        }
    }
}

impl MessageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window holding exactly `messages` (duplicates collapse to the last one seen).
    pub fn from_messages(messages: impl IntoIterator<Item = Message>, has_more_older: bool) -> Self {
        let mut window = Self {
            has_more_older,
            ..Self::default()
        };
        for message in messages {
            window.merge(message);
        }
        window
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_more_older(&self) -> bool {
        self.has_more_older
    }

    pub fn is_loading_older(&self) -> bool {
        self.is_loading_older
    }

    pub(crate) fn set_has_more_older(&mut self, has_more: bool) {
        self.has_more_older = has_more;
    }

    pub(crate) fn set_loading_older(&mut self, loading: bool) {
        self.is_loading_older = loading;
    }

    /// Messages in ascending creation order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.entries.values()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn contains_id(&self, id: MessageId) -> bool {
        self.contains(&MessageKey::Committed(id))
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        let created_at = self.index.get(key)?;
        self.entries.get(&(*created_at, *key))
    }

    pub fn get_by_id(&self, id: MessageId) -> Option<&Message> {
        self.get(&MessageKey::Committed(id))
    }

    pub fn oldest_committed(&self) -> Option<&Message> {
        self.entries.values().find(|m| !m.is_pending())
    }

    pub fn latest(&self) -> Option<&Message> {
        self.entries.values().next_back()
    }

    /// Pending entry created with `nonce`, if still unreconciled.
    pub fn pending_for_nonce(&self, nonce: &Uuid) -> Option<&Message> {
        let local = self.pending_nonces.get(nonce)?;
        self.get(&MessageKey::Pending(*local))
    }

    pub fn pending_count(&self) -> usize {
        self.index.keys().filter(|k| k.is_pending()).count()
    }

    /// Insert-or-update by identity.
    pub fn merge(&mut self, message: Message) -> MergeOutcome {
        let key = message.key;
        let reconciled = match (key, message.client_nonce) {
            (MessageKey::Committed(_), Some(nonce)) => self.take_pending(&nonce).is_some(),
            _ => false,
        };

        if let (MessageKey::Pending(_), Some(nonce)) = (key, message.client_nonce) {
            if !self.index.contains_key(&key) && self.has_committed_nonce(&nonce) {
                return MergeOutcome::Reconciled;
            }
        }

        if let Some(created_at) = self.index.get(&key).copied() {
            if created_at == message.created_at {
                if let Some(slot) = self.entries.get_mut(&(created_at, key)) {
                    *slot = message;
                }
            } else {
                // Moved in time: re-key so iteration stays ascending.
                self.entries.remove(&(created_at, key));
                self.index.insert(key, message.created_at);
                self.entries.insert((message.created_at, key), message);
            }
            return MergeOutcome::Replaced;
        }

        if let (MessageKey::Pending(local), Some(nonce)) = (key, message.client_nonce) {
            self.pending_nonces.insert(nonce, local);
        }
        self.index.insert(key, message.created_at);
        self.entries.insert((message.created_at, key), message);

        if reconciled {
            MergeOutcome::Reconciled
        } else {
            MergeOutcome::Inserted
        }
    }

    /// Insert older history, skipping identities already present. Returns the
    /// number of messages inserted.
    pub fn prepend_older(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if self.index.contains_key(&message.key) {
                continue;
            }
            self.merge(message);
            inserted += 1;
        }
        inserted
    }

    /// Replace the committed contents. Pending entries survive unless one of
    /// the incoming messages carries their nonce.
    pub fn replace(&mut self, messages: impl IntoIterator<Item = Message>, has_more_older: bool) {
        let pending: Vec<Message> = self
            .entries
            .values()
            .filter(|m| m.is_pending())
            .cloned()
            .collect();
        let is_loading_older = self.is_loading_older;

        *self = Self::from_messages(messages, has_more_older);
        self.is_loading_older = is_loading_older;

        for message in pending {
            self.merge(message);
        }
    }

    pub fn remove(&mut self, key: &MessageKey) -> Option<Message> {
        let created_at = self.index.remove(key)?;
        let message = self.entries.remove(&(created_at, *key))?;
        if let (MessageKey::Pending(_), Some(nonce)) = (key, message.client_nonce) {
            self.pending_nonces.remove(&nonce);
        }
        Some(message)
    }

    fn has_committed_nonce(&self, nonce: &Uuid) -> bool {
        self.entries
            .values()
            .any(|m| !m.is_pending() && m.client_nonce.as_ref() == Some(nonce))
    }

    fn take_pending(&mut self, nonce: &Uuid) -> Option<Message> {
        let local = self.pending_nonces.get(nonce).copied()?;
        self.remove(&MessageKey::Pending(local))
    }
}
