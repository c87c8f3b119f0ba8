use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use parley_core::model::{
    Channel, ChannelId, ConnectionState, Membership, Message, MessageKey, SearchResults,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::window::MessageWindow;

/// The closed set of state transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Action {
    UpsertChannel(Channel),
    ReplaceChannels(Vec<Channel>),
    RemoveChannel(ChannelId),
    SetActiveChannel(Option<ChannelId>),
    #[serde(rename_all = "camelCase")]
    ReplaceMessageWindow {
        channel_id: ChannelId,
        messages: Vec<Message>,
        has_more_older: bool,
    },
    MergeMessage(Message),
    #[serde(rename_all = "camelCase")]
    PrependOlderMessages {
        channel_id: ChannelId,
        messages: Vec<Message>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveMessage {
        channel_id: ChannelId,
        key: MessageKey,
    },
    #[serde(rename_all = "camelCase")]
    SetUnreadCount { channel_id: ChannelId, count: u32 },
    #[serde(rename_all = "camelCase")]
    AdjustUnreadCount { channel_id: ChannelId, delta: i64 },
    /// Newest row creation time the last full recount saw.
    #[serde(rename_all = "camelCase")]
    SetUnreadCoverage {
        channel_id: ChannelId,
        newest_at: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    SetWindowLoading { channel_id: ChannelId, loading: bool },
    #[serde(rename_all = "camelCase")]
    SetHasMoreOlder { channel_id: ChannelId, has_more: bool },
    SetMemberships(Vec<Membership>),
    UpsertMembership(Membership),
    #[serde(rename_all = "camelCase")]
    SetChannelMembers {
        channel_id: ChannelId,
        members: Vec<Membership>,
    },
    SetSearchResults(SearchResults),
    ClearSearchResults,
    SetConnectionState(ConnectionState),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::UpsertChannel(_) => "upsert_channel",
            Action::ReplaceChannels(_) => "replace_channels",
            Action::RemoveChannel(_) => "remove_channel",
            Action::SetActiveChannel(_) => "set_active_channel",
            Action::ReplaceMessageWindow { .. } => "replace_message_window",
            Action::MergeMessage(_) => "merge_message",
            Action::PrependOlderMessages { .. } => "prepend_older_messages",
            Action::RemoveMessage { .. } => "remove_message",
            Action::SetUnreadCount { .. } => "set_unread_count",
            Action::AdjustUnreadCount { .. } => "adjust_unread_count",
            Action::SetUnreadCoverage { .. } => "set_unread_coverage",
            Action::SetWindowLoading { .. } => "set_window_loading",
            Action::SetHasMoreOlder { .. } => "set_has_more_older",
            Action::SetMemberships(_) => "set_memberships",
            Action::UpsertMembership(_) => "upsert_membership",
            Action::SetChannelMembers { .. } => "set_channel_members",
            Action::SetSearchResults(_) => "set_search_results",
            Action::ClearSearchResults => "clear_search_results",
            Action::SetConnectionState(_) => "set_connection_state",
        }
    }
}

/// Member list of the currently open channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMembers {
    pub channel_id: ChannelId,
    pub members: Vec<Membership>,
}

/// Snapshot of everything the client knows.
///
/// Mutated only through [`StoreState::apply`]. Every transition is total:
/// actions naming unknown channels or messages are no-ops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    channels: Vec<Channel>,
    windows: HashMap<ChannelId, MessageWindow>,
    unread: HashMap<ChannelId, u32>,
    unread_coverage: HashMap<ChannelId, DateTime<Utc>>,
    memberships: HashMap<ChannelId, Membership>,
    channel_members: Option<ChannelMembers>,
    active_channel: Option<ChannelId>,
    search: Option<SearchResults>,
    connection: ConnectionState,
}

fn channel_order(a: &Channel, b: &Channel) -> std::cmp::Ordering {
    a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id))
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Visible channels, sorted by name.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn has_channel(&self, id: ChannelId) -> bool {
        self.channel(id).is_some()
    }

    pub fn window(&self, id: ChannelId) -> Option<&MessageWindow> {
        self.windows.get(&id)
    }

    /// Messages of a channel's window, oldest first. Empty when no window exists.
    pub fn messages(&self, id: ChannelId) -> Vec<Message> {
        self.windows
            .get(&id)
            .map(MessageWindow::messages)
            .unwrap_or_default()
    }

    pub fn find_message(&self, key: &MessageKey) -> Option<&Message> {
        self.windows.values().find_map(|w| w.get(key))
    }

    pub fn unread_count(&self, id: ChannelId) -> u32 {
        self.unread.get(&id).copied().unwrap_or(0)
    }

    /// Rows created at or before this time are already in the channel's
    /// counter and must not bump it again.
    pub fn unread_counted_through(&self, id: ChannelId) -> Option<DateTime<Utc>> {
        self.unread_coverage.get(&id).copied()
    }

    pub fn total_unread(&self) -> u32 {
        self.unread.values().fold(0u32, |acc, n| acc.saturating_add(*n))
    }

    pub fn membership(&self, id: ChannelId) -> Option<&Membership> {
        self.memberships.get(&id)
    }

    pub fn memberships(&self) -> impl Iterator<Item = &Membership> {
        self.memberships.values()
    }

    pub fn channel_members(&self) -> Option<&ChannelMembers> {
        self.channel_members.as_ref()
    }

    pub fn active_channel(&self) -> Option<ChannelId> {
        self.active_channel
    }

    pub fn search_results(&self) -> Option<&SearchResults> {
        self.search.as_ref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    // ── Transitions ──────────────────────────────────────────────────

    pub fn apply(&mut self, action: Action) {
        match action {
            Action::UpsertChannel(channel) => self.upsert_channel(channel),
            Action::ReplaceChannels(channels) => self.replace_channels(channels),
            Action::RemoveChannel(id) => self.remove_channel(id),
            Action::SetActiveChannel(id) => self.set_active_channel(id),
            Action::ReplaceMessageWindow {
                channel_id,
                messages,
                has_more_older,
            } => {
                if self.has_channel(channel_id) {
                    self.windows
                        .entry(channel_id)
                        .or_default()
                        .replace(messages, has_more_older);
                }
            }
            Action::MergeMessage(message) => {
                if self.has_channel(message.channel_id) {
                    self.windows
                        .entry(message.channel_id)
                        .or_default()
                        .merge(message);
                }
            }
            Action::PrependOlderMessages {
                channel_id,
                messages,
            } => {
                if let Some(window) = self.windows.get_mut(&channel_id) {
                    window.prepend_older(messages);
                }
            }
            Action::RemoveMessage { channel_id, key } => {
                if let Some(window) = self.windows.get_mut(&channel_id) {
                    window.remove(&key);
                }
            }
            Action::SetUnreadCount { channel_id, count } => {
                self.set_unread(channel_id, |_| count);
            }
            Action::AdjustUnreadCount { channel_id, delta } => {
                self.set_unread(channel_id, |current| {
                    let next = i64::from(current).saturating_add(delta);
                    u32::try_from(next.max(0)).unwrap_or(u32::MAX)
                });
            }
            Action::SetUnreadCoverage {
                channel_id,
                newest_at,
            } => match newest_at {
                Some(at) if self.has_channel(channel_id) => {
                    self.unread_coverage.insert(channel_id, at);
                }
                _ => {
                    self.unread_coverage.remove(&channel_id);
                }
            },
            Action::SetWindowLoading {
                channel_id,
                loading,
            } => {
                if let Some(window) = self.windows.get_mut(&channel_id) {
                    window.set_loading_older(loading);
                }
            }
            Action::SetHasMoreOlder {
                channel_id,
                has_more,
            } => {
                if let Some(window) = self.windows.get_mut(&channel_id) {
                    window.set_has_more_older(has_more);
                }
            }
            Action::SetMemberships(memberships) => {
                self.memberships = memberships
                    .into_iter()
                    .map(|m| (m.channel_id, m))
                    .collect();
            }
            Action::UpsertMembership(membership) => {
                self.memberships.insert(membership.channel_id, membership);
            }
            Action::SetChannelMembers {
                channel_id,
                members,
            } => {
                if self.active_channel == Some(channel_id) {
                    self.channel_members = Some(ChannelMembers {
                        channel_id,
                        members,
                    });
                }
            }
            Action::SetSearchResults(results) => self.search = Some(results),
            Action::ClearSearchResults => self.search = None,
            Action::SetConnectionState(state) => self.connection = state,
        }
    }

    fn upsert_channel(&mut self, channel: Channel) {
        match self.channels.iter_mut().find(|c| c.id == channel.id) {
            Some(existing) => *existing = channel,
            None => {
                self.unread.entry(channel.id).or_insert(0);
                self.channels.push(channel);
            }
        }
        self.channels.sort_by(channel_order);
    }

    fn replace_channels(&mut self, mut channels: Vec<Channel>) {
        let mut seen = std::collections::HashSet::new();
        channels.retain(|c| seen.insert(c.id));
        channels.sort_by(channel_order);
        let keep = |id: &ChannelId| channels.iter().any(|c| c.id == *id);

        self.windows.retain(|id, _| keep(id));
        self.unread.retain(|id, _| keep(id));
        self.unread_coverage.retain(|id, _| keep(id));
        self.memberships.retain(|id, _| keep(id));
        for channel in &channels {
            self.unread.entry(channel.id).or_insert(0);
        }
        if self.active_channel.is_some_and(|id| !keep(&id)) {
            self.active_channel = None;
            self.channel_members = None;
        }
        if let Some(search) = &mut self.search {
            search.messages.retain(|m| keep(&m.channel_id));
        }
        self.channels = channels;
    }

    fn remove_channel(&mut self, id: ChannelId) {
        self.channels.retain(|c| c.id != id);
        self.windows.remove(&id);
        self.unread.remove(&id);
        self.unread_coverage.remove(&id);
        self.memberships.remove(&id);
        if self.active_channel == Some(id) {
            self.active_channel = None;
            self.channel_members = None;
        }
        if let Some(search) = &mut self.search {
            search.messages.retain(|m| m.channel_id != id);
        }
    }

    fn set_active_channel(&mut self, id: Option<ChannelId>) {
        if id.is_some_and(|id| !self.has_channel(id)) {
            return;
        }
        if self.active_channel != id {
            self.channel_members = None;
        }
        self.active_channel = id;
        if let Some(id) = id {
            self.unread.insert(id, 0);
        }
    }

    fn set_unread(&mut self, id: ChannelId, f: impl FnOnce(u32) -> u32) {
        if !self.has_channel(id) {
            return;
        }
        let next = if self.active_channel == Some(id) {
            0
        } else {
            f(self.unread_count(id))
        };
        self.unread.insert(id, next);
    }
}

/// Pure form of [`StoreState::apply`].
pub fn reduce(mut state: StoreState, action: Action) -> StoreState {
    state.apply(action);
    state
}

/// Shared store: the state behind a lock plus a broadcast of applied actions.
///
/// The lock is only held while a transition is applied or a read closure
/// runs, never across an `.await`.
pub struct Store {
    state: Mutex<StoreState>,
    actions: broadcast::Sender<Action>,
}

impl Store {
    pub const DEFAULT_LOG_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::with_log_capacity(Self::DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(capacity: usize) -> Self {
        let (actions, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(StoreState::default()),
            actions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one transition and publish it to action subscribers.
    pub fn dispatch(&self, action: Action) {
        let mut state = self.lock();
        trace!(action = action.name(), "applying action");
        state.apply(action.clone());
        // Sent under the lock so subscribers observe actions in apply order.
        let _ = self.actions.send(action);
    }

    /// Decide on actions from the current state and apply them under one lock.
    pub fn transact<R>(&self, f: impl FnOnce(&StoreState) -> (Vec<Action>, R)) -> R {
        let mut state = self.lock();
        let (actions, result) = f(&state);
        for action in actions {
            trace!(action = action.name(), "applying action");
            state.apply(action.clone());
            let _ = self.actions.send(action);
        }
        result
    }

    pub fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        f(&*self.lock())
    }

    pub fn snapshot(&self) -> StoreState {
        self.lock().clone()
    }

    /// Stream of every action applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Action> {
        self.actions.subscribe()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
