//! Error taxonomy shared by readers, enrichers, processors and the mixer.
//!
//! Three failure classes matter to callers and are kept apart on purpose:
//!
//! | Variant | Meaning | Retry? |
//! |---------|---------|--------|
//! | [`MissingMetadataKey`](MultipassError::MissingMetadataKey) | malformed document, caller bug | no |
//! | [`SourceUnavailable`](MultipassError::SourceUnavailable) | network/HTTP failure or deadline | yes, same page/check |
//! | [`InsufficientPermissions`](MultipassError::InsufficientPermissions) | the checking credential itself lacks rights | no |
//!
//! "The user has no access" is never an error: it is a plain `false`.

use thiserror::Error;

use crate::models::DataSource;

pub type Result<T> = std::result::Result<T, MultipassError>;

#[derive(Debug, Error)]
pub enum MultipassError {
    #[error("missing metadata key: {key}")]
    MissingMetadataKey { key: String },

    #[error("invalid metadata value for '{key}': {reason}")]
    InvalidMetadata { key: String, reason: String },

    #[error("{data_source} unavailable ({target}): {reason}")]
    SourceUnavailable {
        data_source: DataSource,
        target: String,
        reason: String,
    },

    #[error("{data_source} credential cannot check access ({target}): {reason}")]
    InsufficientPermissions {
        data_source: DataSource,
        target: String,
        reason: String,
    },
}

impl MultipassError {
    pub fn missing_key(key: impl Into<String>) -> Self {
        Self::MissingMetadataKey { key: key.into() }
    }

    pub fn unavailable(
        data_source: DataSource,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SourceUnavailable {
            data_source,
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn insufficient(
        data_source: DataSource,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InsufficientPermissions {
            data_source,
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same page fetch or access check may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}
