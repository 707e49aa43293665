//! External service interfaces
//!
//! Captcha solving, browser automation and raw socket sessions live outside
//! this crate. Script steps talk to them through these narrow traits and the
//! execution context only stores the resulting session handles.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Service rejected the request: {0}")]
    Rejected(String),

    #[error("Service timed out after {0} seconds")]
    Timeout(u64),
}

/// Challenge submitted to a captcha solver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptchaChallenge {
    Image { base64: String },
    ReCaptchaV2 { site_key: String, page_url: String },
    HCaptcha { site_key: String, page_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaSolution {
    pub id: String,
    pub answer: String,
}

/// Third-party captcha solving service
#[async_trait]
pub trait CaptchaSolver: Send + Sync + fmt::Debug {
    async fn balance(&self) -> Result<f64, ServiceError>;

    async fn solve(&self, challenge: CaptchaChallenge) -> Result<CaptchaSolution, ServiceError>;
}

/// Browser automation session that may outlive a single record
#[async_trait]
pub trait BrowserSession: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    async fn close(&mut self) -> Result<(), ServiceError>;
}

/// Raw socket session that may outlive a single record
#[async_trait]
pub trait SocketSession: Send + Sync + fmt::Debug {
    fn peer(&self) -> &str;

    async fn close(&mut self) -> Result<(), ServiceError>;
}

/// Long-lived handles owned by a worker and lent to each execution context
#[derive(Debug, Default)]
pub struct SessionHandles {
    pub browser: Option<Box<dyn BrowserSession>>,
    pub socket: Option<Box<dyn SocketSession>>,
}

impl SessionHandles {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.browser.is_none() && self.socket.is_none()
    }

    /// Closes and drops every open handle; failures are logged, not returned
    pub async fn close_all(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                tracing::warn!("⚠️ Failed to close browser session {}: {}", browser.id(), e);
            }
        }
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close().await {
                tracing::warn!("⚠️ Failed to close socket session to {}: {}", socket.peer(), e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Browser session that counts how often it was closed
    #[derive(Debug)]
    pub struct CountingBrowser {
        pub closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserSession for CountingBrowser {
        fn id(&self) -> &str {
            "counting-browser"
        }

        async fn close(&mut self) -> Result<(), ServiceError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
