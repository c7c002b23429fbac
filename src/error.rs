//! Error types for the nvshim library

use crate::version::DriverVersion;
use std::io;
use thiserror::Error;

/// Main error type for ABI translation operations
#[derive(Error, Debug)]
pub enum AbiError {
    /// Command code is not present in the registry
    #[error("Unknown command: {0:#x}")]
    UnknownCommand(u32),

    /// No layout variant covers the requested driver version
    #[error("Unsupported driver version {version} for {command}")]
    UnsupportedVersion {
        /// Command name
        command: &'static str,
        /// Requested driver version
        version: DriverVersion,
    },

    /// More than one layout variant covers the requested driver version
    #[error("Ambiguous layout for {command} at driver version {version} ({candidates} variants apply)")]
    AmbiguousLayout {
        /// Command name
        command: &'static str,
        /// Requested driver version
        version: DriverVersion,
        /// Number of matching variants
        candidates: usize,
    },

    /// Buffer length does not match the resolved structure width
    #[error("Size mismatch for {layout}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Layout name
        layout: &'static str,
        /// Declared structure width
        expected: usize,
        /// Length of the supplied buffer
        actual: usize,
    },

    /// A field is inconsistent with its declared shape
    #[error("Malformed field {layout}.{field}: {reason}")]
    MalformedField {
        /// Layout name
        layout: &'static str,
        /// Field name
        field: &'static str,
        /// What was wrong
        reason: String,
    },

    /// A field cannot be carried from one layout variant to another
    #[error("Incompatible layout {from} -> {to}: {reason}")]
    IncompatibleLayout {
        /// Source layout name
        from: &'static str,
        /// Target layout name
        to: &'static str,
        /// What was wrong
        reason: String,
    },

    /// The external handle table rejected a handle
    #[error("Handle translation denied for {layout}.{field} (value {value}): {reason}")]
    HandleTranslationDenied {
        /// Layout name
        layout: &'static str,
        /// Handle field name
        field: &'static str,
        /// Rejected handle value
        value: i32,
        /// Reason reported by the handle table
        reason: String,
    },

    /// Registry tables are internally inconsistent
    #[error("Registry defect: {0}")]
    Registry(String),

    /// Driver version string could not be parsed
    #[error("Invalid driver version: {0}")]
    InvalidVersion(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading or writing a file failed
    #[error("I/O error on {path}: {err}")]
    Io {
        /// File involved
        path: String,
        /// Underlying error
        err: io::Error,
    },

    /// The host driver call failed
    #[error("Driver call failed: {0}")]
    Driver(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure category, stripped of detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`AbiError::UnknownCommand`]
    UnknownCommand,
    /// See [`AbiError::UnsupportedVersion`]
    UnsupportedVersion,
    /// See [`AbiError::AmbiguousLayout`]
    AmbiguousLayout,
    /// See [`AbiError::SizeMismatch`]
    SizeMismatch,
    /// See [`AbiError::MalformedField`]
    MalformedField,
    /// See [`AbiError::IncompatibleLayout`]
    IncompatibleLayout,
    /// See [`AbiError::HandleTranslationDenied`]
    HandleTranslationDenied,
    /// Registry, version, configuration, file or serialization problem
    Setup,
    /// See [`AbiError::Driver`]
    Driver,
}

impl AbiError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AbiError::UnknownCommand(_) => ErrorKind::UnknownCommand,
            AbiError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            AbiError::AmbiguousLayout { .. } => ErrorKind::AmbiguousLayout,
            AbiError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            AbiError::MalformedField { .. } => ErrorKind::MalformedField,
            AbiError::IncompatibleLayout { .. } => ErrorKind::IncompatibleLayout,
            AbiError::HandleTranslationDenied { .. } => ErrorKind::HandleTranslationDenied,
            AbiError::Registry(_)
            | AbiError::InvalidVersion(_)
            | AbiError::InvalidConfig(_)
            | AbiError::Io { .. }
            | AbiError::Json(_) => ErrorKind::Setup,
            AbiError::Driver(_) => ErrorKind::Driver,
        }
    }

    /// True for defects in the layout tables rather than in the request
    pub fn is_fatal(&self) -> bool {
        matches!(self, AbiError::Registry(_) | AbiError::AmbiguousLayout { .. })
    }

    pub(crate) fn malformed(layout: &'static str, field: &'static str, reason: impl Into<String>) -> Self {
        AbiError::MalformedField {
            layout,
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn incompatible(from: &'static str, to: &'static str, reason: impl Into<String>) -> Self {
        AbiError::IncompatibleLayout {
            from,
            to,
            reason: reason.into(),
        }
    }
}

/// Result type for nvshim operations
pub type AbiResult<T> = std::result::Result<T, AbiError>;
