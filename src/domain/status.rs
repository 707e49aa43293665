//! Per-record bot status

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status a script leaves on its execution context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BotStatus {
    #[default]
    None,
    Success,
    Fail,
    Ban,
    Retry,
    Error,
    Custom,
}

impl BotStatus {
    /// Script keeps stepping only while nothing decisive happened yet
    #[must_use]
    pub const fn allows_next_step(self) -> bool {
        matches!(self, Self::None | Self::Success)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Ban => "BAN",
            Self::Retry => "RETRY",
            Self::Error => "ERROR",
            Self::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "SUCCESS" => Ok(Self::Success),
            "FAIL" | "FAILURE" => Ok(Self::Fail),
            "BAN" => Ok(Self::Ban),
            "RETRY" => Ok(Self::Retry),
            "ERROR" => Ok(Self::Error),
            "CUSTOM" => Ok(Self::Custom),
            other => Err(format!("Unknown bot status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_none_and_success_let_the_script_continue() {
        assert!(BotStatus::None.allows_next_step());
        assert!(BotStatus::Success.allows_next_step());
        for status in [
            BotStatus::Fail,
            BotStatus::Ban,
            BotStatus::Retry,
            BotStatus::Error,
            BotStatus::Custom,
        ] {
            assert!(!status.allows_next_step(), "{status} should stop the script");
        }
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("success".parse::<BotStatus>(), Ok(BotStatus::Success));
        assert_eq!("Failure".parse::<BotStatus>(), Ok(BotStatus::Fail));
        assert!("nope".parse::<BotStatus>().is_err());
    }
}
