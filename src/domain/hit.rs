//! Terminal outcomes of a check

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which outcome bucket a terminal result lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bucket {
    Hit,
    Fail,
    Custom,
    ToCheck,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Hit => "HIT",
            Self::Fail => "FAIL",
            Self::Custom => "CUSTOM",
            Self::ToCheck => "TOCHECK",
        };
        f.write_str(label)
    }
}

/// One classified record, as stored in the outcome buckets and reported
/// to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    pub id: Uuid,
    pub record: String,
    pub proxy: Option<String>,
    pub bucket: Bucket,
    /// `SUCCESS`, `FAIL`, `NONE` or the custom status name
    pub label: String,
    pub captures: Vec<(String, String)>,
    pub retries: u32,
    pub script: String,
    pub found_at: DateTime<Utc>,
}

impl Hit {
    #[must_use]
    pub fn new(record: impl Into<String>, bucket: Bucket, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            record: record.into(),
            proxy: None,
            bucket,
            label: label.into(),
            captures: Vec::new(),
            retries: 0,
            script: String::new(),
            found_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    #[must_use]
    pub fn with_captures(mut self, captures: Vec<(String, String)>) -> Self {
        self.captures = captures;
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    /// Fail-bucket results are not reported to the host as hits
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        self.bucket != Bucket::Fail
    }

    /// `PLAN = pro | BALANCE = 10` style rendering of the captures
    #[must_use]
    pub fn capture_line(&self) -> String {
        self.captures
            .iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
