//! Error types for the NovaDE DRM compositor.
//!
//! Every fallible operation in this crate returns [`CompositorError`]. Errors
//! coming from the kernel display device or the GPU driver are translated into
//! this small set of kinds and handed back to the immediate caller. None of them
//! is fatal to the process; the worst outcome is a visibly wrong frame, which is
//! always logged.
//!
//! Configuration problems are described by [`ConfigError`], which is wrapped by
//! [`CompositorError::Config`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::ViewId;

/// Main error type of the compositor core.
#[derive(Debug, Error)]
pub enum CompositorError {
    /// A GPU or kernel resource could not be created. Fatal to the single
    /// request only; it is never retried.
    #[error("Failed to allocate {resource}: {reason}")]
    Allocation { resource: String, reason: String },

    /// A call into the kernel display device failed.
    #[error("Display device operation '{operation}' failed: {source}")]
    Device {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// A call into the GPU driver (EGL/GL) failed.
    #[error("GPU operation '{operation}' failed: {reason}")]
    Gpu { operation: &'static str, reason: String },

    /// No platform view is registered under this identifier.
    #[error("Platform view {0} is not registered")]
    NotFound(ViewId),

    /// The operation is not valid in the current state (e.g. moving a disabled cursor).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An argument was outside of the accepted domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No free display plane was left for a layer.
    #[error("No free display plane for layer {layer_index}")]
    PlaneExhausted { layer_index: usize },

    /// A platform view callback reported failure.
    #[error("Platform view {view_id} failed to {operation}: {reason}")]
    Callback {
        view_id: ViewId,
        operation: &'static str,
        reason: String,
    },

    /// Configuration loading or validation failed.
    #[error("Configuration Error: {0}")]
    Config(#[from] ConfigError),

    /// The logging subsystem could not be initialized.
    #[error("Logging Initialization Failed: {0}")]
    Logging(String),
}

impl CompositorError {
    /// Wraps an I/O error returned by the display device.
    pub fn device(operation: &'static str, source: io::Error) -> Self {
        CompositorError::Device { operation, source }
    }

    /// Builds a device error from a raw errno value.
    pub fn from_errno(operation: &'static str, errno: i32) -> Self {
        CompositorError::Device {
            operation,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// Builds an allocation error.
    pub fn allocation(resource: impl Into<String>, reason: impl ToString) -> Self {
        CompositorError::Allocation {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Builds a GPU error.
    pub fn gpu(operation: &'static str, reason: impl ToString) -> Self {
        CompositorError::Gpu {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if this is the kernel's `EBUSY` answer to a commit.
    ///
    /// A non-blocking atomic commit fails with `EBUSY` while the previous
    /// flip is still pending; the presenter reacts by switching to blocking
    /// commits for good.
    pub fn is_busy(&self) -> bool {
        match self {
            CompositorError::Device { source, .. } => source.raw_os_error() == Some(libc::EBUSY),
            _ => false,
        }
    }

    /// The errno carried by a device error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CompositorError::Device { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        CompositorError::InvalidState(format!("{} lock poisoned", what))
    }
}

/// Errors of the configuration subsystem.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("Failed to read configuration file from {path:?}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Parsed values are out of range.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Result alias used throughout the crate.
pub type Result<T, E = CompositorError> = std::result::Result<T, E>;
