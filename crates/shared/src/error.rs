//! Errors raised while encoding or decoding protocol frames.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message `{id}` is missing required fields")]
    IncompleteMessage { id: String },
}
