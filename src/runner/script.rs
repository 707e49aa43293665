//! # Script and Script Step contract
//!
//! A [`Script`] is an ordered list of [`ScriptStep`]s plus the settings the
//! dispatcher needs (proxy policy, data rules, custom inputs). Steps are
//! stateless per instance; everything they mutate lives in the
//! [`ExecutionContext`] they receive.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::proxy::ProxyProtocol;
use crate::domain::record::DataRuleDef;
use crate::runner::context::ExecutionContext;
use crate::runner::error::StepError;
use crate::runner::events::{LogEntry, LogLevel};

/// Unit of execution
#[async_trait]
pub trait ScriptStep: Send + Sync + fmt::Debug {
    /// Token used in script text, e.g. `REQUEST`
    fn kind(&self) -> &'static str;

    /// User-facing label, used when logging failures
    fn label(&self) -> &str;

    fn disabled(&self) -> bool {
        false
    }

    async fn process(&self, ctx: &mut ExecutionContext) -> Result<(), StepError>;

    /// Single-line textual form, parsed back by the script loader
    fn to_text(&self) -> String;
}

/// Value the host must supply before the run starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomInput {
    pub variable_name: String,
    pub description: String,
    #[serde(default)]
    pub default_value: String,
}

/// Script-level settings; these override environment settings where both
/// exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    pub name: String,
    pub needs_proxies: bool,
    /// 0 = unlimited
    pub max_proxy_uses: u32,
    /// One proxy per hit
    pub ban_proxy_after_good_status: bool,
    /// Overrides the environment's ban-loop evasion budget
    pub ban_loop_evasion_override: Option<u32>,
    /// Empty means every protocol
    pub allowed_proxy_protocols: Vec<ProxyProtocol>,
    /// 0 = unlimited
    pub max_cpm: u64,
    pub suggested_bots: usize,
    pub data_rules: Vec<DataRuleDef>,
    pub custom_inputs: Vec<CustomInput>,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            name: "Untitled".to_string(),
            needs_proxies: false,
            max_proxy_uses: 0,
            ban_proxy_after_good_status: false,
            ban_loop_evasion_override: None,
            allowed_proxy_protocols: Vec::new(),
            max_cpm: 0,
            suggested_bots: 1,
            data_rules: Vec::new(),
            custom_inputs: Vec::new(),
        }
    }
}

/// How a script execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub settings: ScriptSettings,
    pub steps: Vec<Arc<dyn ScriptStep>>,
}

impl Script {
    #[must_use]
    pub const fn new(settings: ScriptSettings, steps: Vec<Arc<dyn ScriptStep>>) -> Self {
        Self { settings, steps }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the steps in order until none is left, the status no longer
    /// allows continuing, or cancellation is observed.
    ///
    /// A step failure is logged against the step and execution moves on.
    /// `forward` receives each step's log buffer before it is cleared.
    pub async fn execute<F>(&self, ctx: &mut ExecutionContext, mut forward: F) -> ScriptOutcome
    where
        F: FnMut(&ExecutionContext, &[LogEntry]) + Send,
    {
        for (index, step) in self.steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return ScriptOutcome::Cancelled;
            }
            ctx.clear_log();
            if step.disabled() {
                continue;
            }

            debug!("Bot {} running step {} ({})", ctx.bot_number, index, step.kind());
            let result = match AssertUnwindSafe(step.process(ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(StepError::Panicked(panic_message(payload.as_ref()))),
            };
            match result {
                Ok(()) => {}
                Err(StepError::Cancelled) => {
                    let snapshot: &ExecutionContext = ctx;
                    forward(snapshot, snapshot.logs());
                    return ScriptOutcome::Cancelled;
                }
                Err(e) => {
                    warn!(
                        "⚠️ Step {} '{}' ({}) failed for bot {}: {}",
                        index,
                        step.label(),
                        step.kind(),
                        ctx.bot_number,
                        e
                    );
                    ctx.log(
                        LogLevel::Error,
                        format!("{} '{}' failed: {}", step.kind(), step.label(), e),
                    );
                }
            }

            let snapshot: &ExecutionContext = ctx;
            forward(snapshot, snapshot.logs());
            if !ctx.status.allows_next_step() {
                break;
            }
        }
        ScriptOutcome::Completed
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
