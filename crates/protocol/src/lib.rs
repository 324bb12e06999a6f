pub mod address;
pub mod command;
pub mod constants;
pub mod frame;
pub mod lookup;

// Re-export primary types for convenience.
pub use command::Command;
pub use frame::{Frame, Message};
pub use lookup::{LookupData, LookupResponse, Producer};

/// Errors produced while encoding commands or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid topic or channel name: {0:?}")]
    InvalidName(String),

    #[error("frame too large: {size} bytes")]
    FrameTooLarge { size: usize },

    #[error("unknown frame type {0}")]
    UnknownFrameType(i32),

    #[error("truncated message frame ({0} bytes)")]
    TruncatedMessage(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
