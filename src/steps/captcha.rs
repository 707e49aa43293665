//! CAPTCHA step: hands a challenge to the injected solver

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::variables::Variable;
use crate::infrastructure::services::{CaptchaChallenge, ServiceError};
use crate::runner::context::ExecutionContext;
use crate::runner::error::StepError;
use crate::runner::events::LogLevel;
use crate::runner::script::ScriptStep;
use crate::steps::step_text;

pub const KIND: &str = "CAPTCHA";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaStep {
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default)]
    pub disabled: bool,
    /// Every string field is a template
    pub challenge: CaptchaChallenge,
    #[serde(default = "default_variable")]
    pub variable: String,
}

fn default_label() -> String {
    KIND.to_string()
}

fn default_variable() -> String {
    "SOLUTION".to_string()
}

impl CaptchaStep {
    #[must_use]
    pub fn new(challenge: CaptchaChallenge) -> Self {
        Self {
            label: default_label(),
            disabled: false,
            challenge,
            variable: default_variable(),
        }
    }

    fn resolved_challenge(&self, ctx: &ExecutionContext) -> CaptchaChallenge {
        match &self.challenge {
            CaptchaChallenge::Image { base64 } => CaptchaChallenge::Image {
                base64: ctx.resolve(base64),
            },
            CaptchaChallenge::ReCaptchaV2 { site_key, page_url } => CaptchaChallenge::ReCaptchaV2 {
                site_key: ctx.resolve(site_key),
                page_url: ctx.resolve(page_url),
            },
            CaptchaChallenge::HCaptcha { site_key, page_url } => CaptchaChallenge::HCaptcha {
                site_key: ctx.resolve(site_key),
                page_url: ctx.resolve(page_url),
            },
        }
    }
}

#[async_trait]
impl ScriptStep for CaptchaStep {
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
        let solver = ctx.services.captcha.clone().ok_or_else(|| {
            StepError::Captcha(ServiceError::Unavailable("no captcha solver configured".to_string()))
        })?;
        let balance = tokio::select! {
            balance = solver.balance() => balance?,
            () = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
        };
        if balance <= 0.0 {
            return Err(StepError::Captcha(ServiceError::Rejected(format!(
                "solver balance is {balance}"
            ))));
        }
        ctx.log(LogLevel::Debug, format!("Captcha balance {balance:.2}"));
        let challenge = self.resolved_challenge(ctx);

        let solution = tokio::select! {
            solution = solver.solve(challenge) => solution?,
            () = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
        };
        ctx.log(LogLevel::Info, format!("Captcha {} solved", solution.id));
        ctx.variables
            .set(Variable::scalar(&self.variable, solution.answer));
        Ok(())
    }

    fn to_text(&self) -> String {
        step_text(KIND, self)
    }
}
