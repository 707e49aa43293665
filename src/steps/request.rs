//! REQUEST step: one HTTP request through the checked-out proxy

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::domain::status::BotStatus;
use crate::domain::variables::Variable;
use crate::infrastructure::http_client::{TransportError, TransportRequest};
use crate::runner::context::{ExecutionContext, hidden};
use crate::runner::error::StepError;
use crate::runner::events::LogLevel;
use crate::runner::proxy_pool::ProxyHandle;
use crate::runner::script::ScriptStep;
use crate::steps::step_text;

pub const KIND: &str = "REQUEST";

/// Cookies that prove a passed anti-bot challenge; cached per proxy
const CLEARANCE_COOKIES: &[&str] = &["cf_clearance", "__cf_bm"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestStep {
    pub label: String,
    pub disabled: bool,
    pub method: String,
    pub url: String,
    pub body: String,
    pub content_type: String,
    /// Name and value templates
    pub headers: Vec<(String, String)>,
    pub follow_redirects: bool,
    /// Overrides the run's request timeout
    pub timeout_secs: Option<u64>,
}

impl Default for RequestStep {
    fn default() -> Self {
        Self {
            label: "REQUEST".to_string(),
            disabled: false,
            method: "GET".to_string(),
            url: String::new(),
            body: String::new(),
            content_type: "application/x-www-form-urlencoded".to_string(),
            headers: Vec::new(),
            follow_redirects: true,
            timeout_secs: None,
        }
    }
}

impl RequestStep {
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn build(&self, ctx: &ExecutionContext) -> Result<TransportRequest, StepError> {
        let method = Method::from_bytes(self.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| StepError::InvalidArgument(format!("unknown method '{}'", self.method)))?;
        let url = ctx.resolve(&self.url);
        if url.is_empty() {
            return Err(StepError::InvalidArgument("empty URL".to_string()));
        }

        let mut cookies = ctx.cookies();
        if let (Some(pool), Some(proxy)) = (&ctx.services.pool, &ctx.proxy) {
            for (name, value) in pool.clearance(proxy.id()) {
                cookies.entry(name).or_insert(value);
            }
        }

        let has_body = !self.body.is_empty() && method != Method::GET && method != Method::HEAD;
        Ok(TransportRequest {
            method,
            url,
            headers: self
                .headers
                .iter()
                .map(|(name, value)| (ctx.resolve(name), ctx.resolve(value)))
                .collect(),
            cookies,
            body: has_body.then(|| ctx.resolve(&self.body)),
            content_type: (has_body && !self.content_type.is_empty()).then(|| self.content_type.clone()),
            timeout: self
                .timeout_secs
                .map_or(ctx.services.request_timeout, Duration::from_secs),
            follow_redirects: self.follow_redirects,
        })
    }
}

#[async_trait]
impl ScriptStep for RequestStep {
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
        let request = self.build(ctx)?;
        ctx.log(LogLevel::Info, format!("{} {}", request.method, request.url));

        let result = {
            let proxy = ctx.proxy.as_ref().map(ProxyHandle::endpoint);
            ctx.services.transport.send(request, proxy, &ctx.cancel).await
        };

        let response = match result {
            Ok(response) => response,
            Err(TransportError::Cancelled) => return Err(StepError::Cancelled),
            Err(e) => {
                ctx.status = BotStatus::Error;
                return Err(StepError::Transport(e.to_string()));
            }
        };
        ctx.log(
            LogLevel::Info,
            format!("{} {} ({} bytes)", response.status, response.url, response.body.len()),
        );

        if let (Some(pool), Some(proxy)) = (&ctx.services.pool, &ctx.proxy) {
            let clearance: Vec<(String, String)> = response
                .cookies
                .iter()
                .filter(|(name, _)| CLEARANCE_COOKIES.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            if !clearance.is_empty() {
                pool.store_clearance(proxy.id(), clearance);
            }
        }

        let mut jar = ctx.cookies();
        jar.extend(response.cookies);
        let variables = &mut ctx.variables;
        variables.set_hidden(Variable::scalar(hidden::ADDRESS, response.url));
        variables.set_hidden(Variable::scalar(hidden::RESPONSE_CODE, response.status.to_string()));
        variables.set_hidden(Variable::map(hidden::HEADERS, response.headers));
        variables.set_hidden(Variable::map(hidden::COOKIES, jar));
        variables.set_hidden(Variable::scalar(hidden::SOURCE, response.body));
        Ok(())
    }

    fn to_text(&self) -> String {
        step_text(KIND, self)
    }
}
