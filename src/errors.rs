//! Error taxonomy for the mapping core
//!
//! Recoverable conditions (`NoSuchRevision`, `NotFound`) are often expected
//! when probing history bounds; the rest surface caller bugs or environment
//! failures and are propagated unmodified.

use crate::transport::Revnum;

/// Result type for all mapping-core operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server has no revision with this number
    #[error("no such revision: r{0}")]
    NoSuchRevision(Revnum),

    /// A path, identifier or directory entry does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The current layout does not classify this path as a branch or tag
    #[error("'{0}' is not a branch or tag path in the current layout")]
    InvalidBranchPath(String),

    /// A revision identifier could not be decoded
    #[error("malformed revision identifier '{revid}': {reason}")]
    MalformedIdentifier { revid: String, reason: String },

    /// The server lacks an optional capability, e.g. revision property edits
    #[error("server does not support {0}")]
    FeatureUnavailable(&'static str),

    /// Network or protocol level failure in the transport
    #[error("transport failure: {0}")]
    Transport(String),

    /// A property value does not follow its expected format
    #[error("invalid value for property '{name}': {reason}")]
    InvalidPropertyValue { name: String, reason: String },

    /// Log cache database error
    #[error("log cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    pub fn malformed_id(revid: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedIdentifier {
            revid: revid.into(),
            reason: reason.into(),
        }
    }
}
