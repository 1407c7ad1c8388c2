//! Materializes byte parameters of a request as local files before processing.

pub mod parameter;
pub mod store;

use std::io::Write;

use serde::{Deserialize, Serialize};

pub use parameter::{KeyPath, ParameterResolver, ResolvedFile, ResolvedParameter};
pub use store::{BlobStore, DirectoryStore, StoreResolver};

/// A parameter value that refers to an external blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytesParameter {
    /// Selects the resolver, e.g. `"gridfs"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub filename: String,
    pub id: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Streams the blob behind a [`BytesParameter`] into a sink.
pub trait BytesResolver: Send + Sync {
    fn resolve(&self, value: &BytesParameter, writer: &mut dyn Write) -> Result<(), ResolveError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Resolving nested parameter {0} is not supported")]
    NestedUnsupported(String),

    #[error("No resolver found for {0}")]
    NoResolver(String),

    #[error("Parameter {key} is not a valid bytes parameter: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Blob {id} could not be fetched: {reason}")]
    Store { id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
