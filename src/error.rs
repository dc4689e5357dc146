//! Cache-internal error types
//!
//! Engine errors never escape the read/write accessors: the store router logs
//! them, demotes the distributed engine and degrades to the in-process engine.
//! The one variant callers do see is [`CacheError::SharedFetch`], carried by
//! every caller of a coalesced fetch that failed.

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The distributed engine could not be reached within the retry budget
    #[error("could not connect to {target} after {attempts} attempts: {reason}")]
    ConnectFailed {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// A cached payload could not be encoded or decoded
    #[error("cache payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("shard broadcast failed: {0}")]
    Broadcast(String),

    /// Database error of a fetch shared by several concurrent callers
    #[error("{0:#}")]
    SharedFetch(Arc<anyhow::Error>),
}

impl CacheError {
    /// The database error behind a shared fetch failure
    #[must_use]
    pub fn fetch_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::SharedFetch(e) => Some(e),
            _ => None,
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
