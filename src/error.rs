use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppManagerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Invalid configuration for {label}: {reason}")]
    InvalidApplication { label: String, reason: String },

    #[error("Application type '{app_type}' is not supported")]
    UnsupportedType { app_type: String },

    #[error("Unable to find application resource '{location}'")]
    NotFound { location: String, searched: Vec<PathBuf> },

    #[error("Failed to download '{url}': {details}")]
    Download { url: String, details: String },

    #[error("No container could be created for {path}")]
    ContainerUnavailable { path: PathBuf },

    #[error("Handler {operation} failed for {label}: {details}")]
    Handler {
        operation: &'static str,
        label: String,
        details: String,
    },

    #[error("No application with pid {pid} is managed")]
    UnknownApplication { pid: String },

    #[error("Application {pid} has already been removed")]
    AlreadyRemoved { pid: String },

    #[error("File monitor error: {0}")]
    Monitor(String),

    #[error("System error: {message}")]
    System { message: String },
}

impl AppManagerError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn handler<S: Into<String>, D: ToString>(operation: &'static str, label: S, details: D) -> Self {
        Self::Handler {
            operation,
            label: label.into(),
            details: details.to_string(),
        }
    }

    /// Wrap into the shareable form carried by failed dependencies.
    pub fn into_cause(self) -> Cause {
        Arc::new(self)
    }
}

#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    #[error("Receiver lagged behind by {missed} events")]
    Lagged { missed: u64 },

    #[error("Event bus channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, AppManagerError>;

/// Failure cause shared between every dependency failed by a single action.
pub type Cause = Arc<AppManagerError>;
