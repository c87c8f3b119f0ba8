use parley_core::error::FeedError;
use parley_core::model::{ChannelId, MessageId};
use parley_gateway::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("not a member of channel {0}")]
    NotMember(ChannelId),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    #[error("gateway error: {0}")]
    Gateway(GatewayError),

    #[error("change feed error: {0}")]
    Feed(#[from] FeedError),
}

impl SyncError {
    /// Whether the failed operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Gateway(e) if e.is_transient())
    }
}

impl From<GatewayError> for SyncError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::NotAuthorized(reason) => SyncError::NotAuthorized(reason),
            GatewayError::InvalidInput(reason) => SyncError::InvalidInput(reason),
            other => SyncError::Gateway(other),
        }
    }
}
