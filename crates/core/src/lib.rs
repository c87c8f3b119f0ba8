pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod model;

pub use error::{FeedError, ParleyError, Result};
