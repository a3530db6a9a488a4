// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for parsing and configuration
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// Snapshot name is not `<dataset>@<epoch>`
    #[error("Invalid snapshot name: {name}")]
    #[diagnostic(
        code(snapmount::invalid_snapshot_name),
        help("Snapshot names must look like `pool/home/agents/<id>@<epoch>` with a numeric epoch")
    )]
    InvalidSnapshotName {
        #[allow(unused)]
        name: String,
    },

    /// Snapshot selector is not `latest`, `all` or an epoch
    #[error("Invalid snapshot selector: {selector}")]
    #[diagnostic(
        code(snapmount::invalid_selector),
        help("Use `latest`, `all`, or a unix epoch such as 1700000000")
    )]
    InvalidSelector {
        #[allow(unused)]
        selector: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(snapmount::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(snapmount::serialization_error),
        help("This is likely a bug in snapmount. Please report it with the full error details")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid_snapshot_name(name: impl Into<String>) -> Self {
        Self::InvalidSnapshotName { name: name.into() }
    }

    pub fn invalid_selector(selector: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}
