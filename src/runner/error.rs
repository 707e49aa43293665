//! Error taxonomy of a run
//!
//! [`RunError`] covers fatal/configuration failures that stop a run and are
//! reported once. [`StepError`] covers failures inside a single script step,
//! which are logged and never stop the run.

use thiserror::Error;

use crate::domain::record::RecordSchemaError;
use crate::infrastructure::services::ServiceError;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("The script has no steps")]
    NoScript,

    #[error("The data source is empty")]
    NoData,

    #[error("The script needs proxies but none are loaded")]
    NoProxies,

    #[error("Starting offset {offset} is outside the data source ({len} records)")]
    InvalidStartOffset { offset: usize, len: usize },

    #[error("Every proxy is banned or bad and reloading is disabled")]
    ProxiesExhausted,

    #[error("Invalid data rules: {0}")]
    InvalidRules(#[from] RecordSchemaError),

    #[error("The run was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Host(#[from] HostError),
}

impl RunError {
    /// Configuration errors are detected before any worker starts
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoScript
                | Self::NoData
                | Self::NoProxies
                | Self::InvalidStartOffset { .. }
                | Self::InvalidRules(_)
        )
    }
}

/// Failure reported by a host hook
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Host error: {0}")]
pub struct HostError(pub String);

#[derive(Error, Debug)]
pub enum StepError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Captcha error: {0}")]
    Captcha(#[from] ServiceError),

    #[error("Step panicked: {0}")]
    Panicked(String),

    #[error("Step cancelled")]
    Cancelled,
}
