//! Error types for qfleet.
//!
//! # Error Message Style Guide
//!
//! All error messages follow a consistent format:
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: all lowercase (Rust convention for error messages)
//! - **Context**: include relevant identifiers (instance id, session key, path)
//!
//! Lifecycle errors (`NotFound`, `NotStartable`, `NotRemoved`, ...) are
//! structured variants so callers can match on them instead of parsing
//! message strings.

use thiserror::Error;

/// Result type alias using qfleet's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in qfleet operations.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Instance Lifecycle Errors
    // ========================================================================
    /// Instance not present in the state store.
    #[error("instance not found: {id}")]
    NotFound {
        /// Id of the instance that was not found.
        id: String,
    },

    /// Create against an id that already exists.
    #[error("instance already exists: {id}")]
    AlreadyExists {
        /// Id of the conflicting instance.
        id: String,
    },

    /// A required field is missing or a uniqueness constraint would be broken.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Start against an instance that is missing or not stopped.
    #[error("instance not startable: {id}: {reason}")]
    NotStartable {
        /// Id of the instance.
        id: String,
        /// Why it cannot be started.
        reason: String,
    },

    /// Remove against a missing or non-stopped instance.
    #[error("no instance removed: {id}")]
    NotRemoved {
        /// Id of the instance.
        id: String,
    },

    // ========================================================================
    // Monitor / Command Errors
    // ========================================================================
    /// Command against a session whose handshake has not completed.
    #[error("session not ready: {key}")]
    NotReady {
        /// Session key (`qmp:<id>` or `qga:<id>`).
        key: String,
    },

    /// Command reply did not arrive within the caller's budget.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Socket read/write failure; the affected session is closed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Event publisher outbound queue at capacity; the event was dropped.
    #[error("event queue full")]
    QueueFull,

    // ========================================================================
    // Ambient Errors
    // ========================================================================
    /// State store operation failed.
    #[error("database operation failed: {operation}: {reason}")]
    Database {
        /// The operation that failed (e.g., "open", "update", "remove").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// QEMU launch or attach failed.
    #[error("launch failed: {operation}: {reason}")]
    Launch {
        /// The operation that failed (e.g., "spawn", "attach").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Image registry operation failed.
    #[error("image operation failed: {operation}: {reason}")]
    Image {
        /// The operation that failed (e.g., "download", "resolve").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Configuration operation failed.
    #[error("config operation failed: {operation}: {reason}")]
    Config {
        /// The operation that failed (e.g., "load", "save").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an instance-not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create an already-exists error.
    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists { id: id.into() }
    }

    /// Create a constraint violation error.
    pub fn constraint(reason: impl Into<String>) -> Self {
        Self::ConstraintViolation(reason.into())
    }

    /// Create a not-startable error.
    pub fn not_startable(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotStartable {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-removed error.
    pub fn not_removed(id: impl Into<String>) -> Self {
        Self::NotRemoved { id: id.into() }
    }

    /// Create a not-ready error for a session key.
    pub fn not_ready(key: impl Into<String>) -> Self {
        Self::NotReady { key: key.into() }
    }

    /// Create a timeout error.
    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout(reason.into())
    }

    /// Create a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(reason.into())
    }

    /// Create a database operation error.
    pub fn database(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a launch operation error.
    pub fn launch(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Launch {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an image operation error.
    pub fn image(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Image {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a config operation error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that mean "try again later" rather than "give up".
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}
