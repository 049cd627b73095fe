//! Storage error handling
//!
//! Provides typed errors for storage operations with descriptive messages
//! and recovery suggestions.

use std::io;

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// The DataStore answered with an error envelope
    #[error("DataStore returned an error: {payload}")]
    Remote { payload: String },

    /// Bucket already exists and creation was not forced
    #[error("Bucket \"{bucket}\" already exists.")]
    BucketExists { bucket: String },

    /// Bucket is not present on the DataStore
    #[error("Bucket \"{bucket}\" doesn't exist.")]
    BucketMissing { bucket: String },

    /// Schema descriptor failed validation
    #[error("Invalid schema descriptor: {details}")]
    InvalidSchema { details: String },

    /// A record value could not be cast to its field type
    #[error("Cannot cast value {value} of field \"{field}\": {reason}")]
    Cast {
        field: String,
        value: String,
        reason: String,
    },

    /// Parallel bucket and descriptor lists differ in length
    #[error("Got {buckets} bucket(s) but {descriptors} descriptor(s)")]
    MismatchedBatch { buckets: usize, descriptors: usize },

    /// Response is valid JSON but lacks an expected member
    #[error("Unexpected response from '{url}': missing {missing}")]
    UnexpectedResponse { url: String, missing: String },

    /// Non-JSON response with a failing HTTP status
    #[error("HTTP {status} error: {body}")]
    Http { status: u16, body: String },

    /// Request could not be sent or its body read
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Build a cast error for a field and its raw wire value
    pub fn cast(field: &str, value: &serde_json::Value, reason: impl Into<String>) -> Self {
        StorageError::Cast {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a schema validation error
    pub fn invalid_schema(details: impl Into<String>) -> Self {
        StorageError::InvalidSchema {
            details: details.into(),
        }
    }

    /// Check if the error came from the DataStore itself rather than the wire
    pub fn is_remote(&self) -> bool {
        matches!(self, StorageError::Remote { .. })
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::BucketExists { .. } => {
                Some("Pass --force to replace the existing bucket.")
            }
            StorageError::BucketMissing { .. } => {
                Some("Pass --ignore to skip buckets that are not present.")
            }
            StorageError::Remote { .. } => {
                Some("Check the API key and that the resource id exists on the CKAN instance.")
            }
            StorageError::Http { .. } | StorageError::Transport(_) => {
                Some("Check the base URL and that the CKAN instance is reachable.")
            }
            _ => None,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
