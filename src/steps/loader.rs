//! Line-oriented script text
//!
//! ```text
//! # comment
//! SETTINGS {"name":"demo","needs_proxies":true}
//! REQUEST {"url":"https://example.com/?u=<USER>"}
//! KEYCHECK {...}
//! ```
//!
//! Each step line is a token followed by optional JSON. Tokens map to step
//! constructors through [`STEP_PARSERS`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

use crate::runner::script::{Script, ScriptSettings, ScriptStep};
use crate::steps::{
    CaptchaStep, DelayStep, FunctionStep, KeycheckStep, ParseStep, RequestStep, captcha, delay,
    function, keycheck, parse, request,
};

const SETTINGS_TOKEN: &str = "SETTINGS";

#[derive(Error, Debug)]
pub enum ScriptLoadError {
    #[error("Line {line}: unknown step '{token}'")]
    UnknownStep { line: usize, token: String },

    #[error("Line {line}: invalid {kind} step: {message}")]
    InvalidStep {
        line: usize,
        kind: String,
        message: String,
    },

    #[error("Line {line}: invalid settings: {message}")]
    InvalidSettings { line: usize, message: String },

    #[error("Failed to read script: {0}")]
    Io(#[from] std::io::Error),
}

type StepParser = fn(&str) -> Result<Arc<dyn ScriptStep>, serde_json::Error>;

fn parse_step<T>(json: &str) -> Result<Arc<dyn ScriptStep>, serde_json::Error>
where
    T: ScriptStep + DeserializeOwned + 'static,
{
    let step: T = serde_json::from_str(json)?;
    Ok(Arc::new(step))
}

/// Step token -> constructor
static STEP_PARSERS: Lazy<HashMap<&'static str, StepParser>> = Lazy::new(|| {
    let parsers: [(&'static str, StepParser); 6] = [
        (request::KIND, parse_step::<RequestStep>),
        (keycheck::KIND, parse_step::<KeycheckStep>),
        (parse::KIND, parse_step::<ParseStep>),
        (function::KIND, parse_step::<FunctionStep>),
        (delay::KIND, parse_step::<DelayStep>),
        (captcha::KIND, parse_step::<CaptchaStep>),
    ];
    HashMap::from(parsers)
});

fn split_line(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((token, rest)) if !rest.trim().is_empty() => (token, rest.trim()),
        Some((token, _)) => (token, "{}"),
        None => (line, "{}"),
    }
}

/// One step from its textual form; `line` is only used in errors
pub fn step_from_text(text: &str, line: usize) -> Result<Arc<dyn ScriptStep>, ScriptLoadError> {
    let (token, json) = split_line(text.trim());
    let token = token.to_ascii_uppercase();
    let parser = STEP_PARSERS
        .get(token.as_str())
        .ok_or_else(|| ScriptLoadError::UnknownStep {
            line,
            token: token.clone(),
        })?;
    parser(json).map_err(|e| ScriptLoadError::InvalidStep {
        line,
        kind: token,
        message: e.to_string(),
    })
}

pub fn load_script(text: &str) -> Result<Script, ScriptLoadError> {
    let mut settings = ScriptSettings::default();
    let mut steps = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (token, json) = split_line(trimmed);
        if token.eq_ignore_ascii_case(SETTINGS_TOKEN) {
            settings = serde_json::from_str(json).map_err(|e| ScriptLoadError::InvalidSettings {
                line,
                message: e.to_string(),
            })?;
        } else {
            steps.push(step_from_text(trimmed, line)?);
        }
    }
    Ok(Script::new(settings, steps))
}

pub async fn load_script_file(path: impl AsRef<Path>) -> Result<Script, ScriptLoadError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await?;
    let script = load_script(&text)?;
    info!("📁 Loaded script '{}' with {} steps from {:?}", script.name(), script.steps.len(), path);
    Ok(script)
}

/// Inverse of [`load_script`]
pub fn script_to_text(script: &Script) -> String {
    let mut lines = Vec::with_capacity(script.steps.len() + 1);
    lines.push(match serde_json::to_string(&script.settings) {
        Ok(json) => format!("{SETTINGS_TOKEN} {json}"),
        Err(_) => SETTINGS_TOKEN.to_string(),
    });
    lines.extend(script.steps.iter().map(|step| step.to_text()));
    lines.join("\n")
}
