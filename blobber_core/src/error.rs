//! Error types for blobber_core.
//!
//! Every variant carries a stable machine code (see [`Error::code`]) which is
//! also the first token of its `Display` output, so callers can tell a missing
//! object apart from an inconsistent tree without matching on prose.

use thiserror::Error;

/// Result type alias using blobber_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// One processor that failed while promoting staged bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFailure {
    /// Path of the change that failed.
    pub path: String,
    /// Rendered error.
    pub reason: String,
}

/// Errors that can occur in the storage core.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("io_error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialized payload could not be encoded or decoded.
    #[error("serialization_error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// The stored reference tree does not match the path being walked.
    #[error("invalid_dir_tree: {reason}")]
    InvalidDirTree { reason: String },

    /// The allocation root cannot be resolved to a usable directory.
    #[error("invalid_dir_struct: {reason}")]
    InvalidDirStruct { reason: String },

    /// A descendant row has no loaded parent.
    #[error("invalid_object_tree: {reason}")]
    InvalidObjectTree { reason: String },

    /// An ancestor directory along a change path is missing.
    #[error("invalid_reference_path: {reason}")]
    InvalidReferencePath { reason: String },

    /// Proof path construction hit a directory that could not be resolved.
    #[error("failed_object_path: {reason}")]
    FailedObjectPath { reason: String },

    /// Block number outside the stored object's range.
    #[error("invalid_block_number: {reason}")]
    InvalidBlockNumber { reason: String },

    /// Block number outside the allocation's total block count.
    #[error("invalid_block_num: {reason}")]
    InvalidBlockNum { reason: String },

    /// Caller supplied arguments that do not address anything valid.
    #[error("invalid_parameters: {reason}")]
    InvalidParameters { reason: String },

    /// The requested operation is not allowed on this target.
    #[error("invalid_operation: {reason}")]
    InvalidOperation { reason: String },

    /// Attribute blob is malformed or carries an unknown value.
    #[error("invalid_attributes: {reason}")]
    InvalidAttributes { reason: String },

    /// Reference row id is not usable.
    #[error("invalid_ref_id: {id}")]
    InvalidRefId { id: i64 },

    /// Store configuration is missing or malformed.
    #[error("invalid_config: {reason}")]
    InvalidConfig { reason: String },

    /// A file referenced by a change does not exist in the tree.
    #[error("file_not_found: {reason}")]
    FileNotFound { reason: String },

    /// A stored record or object does not exist.
    #[error("not_found: {what}")]
    NotFound { what: String },

    /// The write conflicts with existing state.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// The change variant has nothing to do for this operation.
    #[error("operation_not_applicable: operation is not applicable for this change")]
    OperationNotApplicable,

    /// Promoting staged bytes into the content store failed.
    #[error("file_store_error: {reason}")]
    FileStore { reason: String },

    /// Some processors committed before one failed.
    #[error(
        "partial_commit: {} committed, {} failed, {} not attempted",
        committed.len(),
        failed.len(),
        skipped.len()
    )]
    PartialCommit {
        committed: Vec<String>,
        failed: Vec<CommitFailure>,
        skipped: Vec<String>,
    },

    /// The caller cancelled the operation.
    #[error("cancelled: operation cancelled by caller")]
    Cancelled,
}

impl Error {
    /// Stable machine code of this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io { .. } => "io_error",
            Error::Serialization { .. } => "serialization_error",
            Error::InvalidDirTree { .. } => "invalid_dir_tree",
            Error::InvalidDirStruct { .. } => "invalid_dir_struct",
            Error::InvalidObjectTree { .. } => "invalid_object_tree",
            Error::InvalidReferencePath { .. } => "invalid_reference_path",
            Error::FailedObjectPath { .. } => "failed_object_path",
            Error::InvalidBlockNumber { .. } => "invalid_block_number",
            Error::InvalidBlockNum { .. } => "invalid_block_num",
            Error::InvalidParameters { .. } => "invalid_parameters",
            Error::InvalidOperation { .. } => "invalid_operation",
            Error::InvalidAttributes { .. } => "invalid_attributes",
            Error::InvalidRefId { .. } => "invalid_ref_id",
            Error::InvalidConfig { .. } => "invalid_config",
            Error::FileNotFound { .. } => "file_not_found",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::OperationNotApplicable => "operation_not_applicable",
            Error::FileStore { .. } => "file_store_error",
            Error::PartialCommit { .. } => "partial_commit",
            Error::Cancelled => "cancelled",
        }
    }

    /// Tree or path inconsistency. Never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::InvalidDirTree { .. }
                | Error::InvalidDirStruct { .. }
                | Error::InvalidObjectTree { .. }
                | Error::InvalidReferencePath { .. }
                | Error::FailedObjectPath { .. }
        )
    }

    /// Something addressed by the caller does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } | Error::FileNotFound { .. } => true,
            Error::Io { source } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Input rejected before any mutation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidBlockNumber { .. }
                | Error::InvalidBlockNum { .. }
                | Error::InvalidParameters { .. }
                | Error::InvalidOperation { .. }
                | Error::InvalidAttributes { .. }
                | Error::InvalidRefId { .. }
        )
    }

    /// Session or row conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Expected-and-ignorable sentinel.
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, Error::OperationNotApplicable)
    }

    /// Create an InvalidDirTree error.
    pub fn invalid_dir_tree(reason: impl Into<String>) -> Self {
        Error::InvalidDirTree {
            reason: reason.into(),
        }
    }

    /// Create an InvalidDirStruct error.
    pub fn invalid_dir_struct(reason: impl Into<String>) -> Self {
        Error::InvalidDirStruct {
            reason: reason.into(),
        }
    }

    /// Create an InvalidObjectTree error.
    pub fn invalid_object_tree(reason: impl Into<String>) -> Self {
        Error::InvalidObjectTree {
            reason: reason.into(),
        }
    }

    /// Create an InvalidReferencePath error.
    pub fn invalid_reference_path(reason: impl Into<String>) -> Self {
        Error::InvalidReferencePath {
            reason: reason.into(),
        }
    }

    /// Create a FailedObjectPath error.
    pub fn failed_object_path(reason: impl Into<String>) -> Self {
        Error::FailedObjectPath {
            reason: reason.into(),
        }
    }

    /// Create an InvalidBlockNumber error.
    pub fn invalid_block_number(reason: impl Into<String>) -> Self {
        Error::InvalidBlockNumber {
            reason: reason.into(),
        }
    }

    /// Create an InvalidBlockNum error.
    pub fn invalid_block_num(reason: impl Into<String>) -> Self {
        Error::InvalidBlockNum {
            reason: reason.into(),
        }
    }

    /// Create an InvalidParameters error.
    pub fn invalid_parameters(reason: impl Into<String>) -> Self {
        Error::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Create an InvalidOperation error.
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Error::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Create an InvalidAttributes error.
    pub fn invalid_attributes(reason: impl Into<String>) -> Self {
        Error::InvalidAttributes {
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a FileNotFound error.
    pub fn file_not_found(reason: impl Into<String>) -> Self {
        Error::FileNotFound {
            reason: reason.into(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Create a Conflict error.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Error::Conflict {
            reason: reason.into(),
        }
    }

    /// Create a FileStore error.
    pub fn file_store(reason: impl Into<String>) -> Self {
        Error::FileStore {
            reason: reason.into(),
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}
