//! Client-side state synchronization for Parley channels.
//!
//! A [`ChatSession`] loads and mutates state through a [`parley_gateway::Gateway`]
//! and commits every change to its [`Store`] as an [`Action`]. A [`SyncEngine`]
//! listens to a [`parley_core::event::ChangeFeed`] and folds remote changes into
//! the same store.

pub mod classify;
pub mod engine;
pub mod error;
pub mod ops;
pub mod profiles;
pub mod store;
pub mod unread;
pub mod window;

pub use classify::{Reconcile, classify};
pub use engine::{EngineHandle, SyncEngine};
pub use error::SyncError;
pub use ops::ChatSession;
pub use profiles::ProfileCache;
pub use store::{Action, ChannelMembers, Store, StoreState, reduce};
pub use window::{MergeOutcome, MessageWindow};
