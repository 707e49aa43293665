//! DELAY step

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runner::context::ExecutionContext;
use crate::runner::error::StepError;
use crate::runner::script::ScriptStep;
use crate::runner::sleep_cancellable;
use crate::steps::step_text;

pub const KIND: &str = "DELAY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayStep {
    pub label: String,
    pub disabled: bool,
    pub millis: u64,
}

impl Default for DelayStep {
    fn default() -> Self {
        Self {
            label: KIND.to_string(),
            disabled: false,
            millis: 1000,
        }
    }
}

impl DelayStep {
    #[must_use]
    pub fn millis(millis: u64) -> Self {
        Self {
            millis,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ScriptStep for DelayStep {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn disabled(&self) -> bool {
        self.disabled
    }

    async fn process(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        if sleep_cancellable(Duration::from_millis(self.millis), &ctx.cancel).await {
            Ok(())
        } else {
            Err(StepError::Cancelled)
        }
    }

    fn to_text(&self) -> String {
        step_text(KIND, self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::runner::context::testing::context;

    #[tokio::test]
    async fn cancellation_cuts_the_delay_short() {
        let mut ctx = context("a:b");
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let result = DelayStep::millis(10_000).process(&mut ctx).await;

        assert!(matches!(result, Err(StepError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn short_delay_completes() {
        let mut ctx = context("a:b");
        assert!(DelayStep::millis(5).process(&mut ctx).await.is_ok());
    }
}
