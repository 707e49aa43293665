//! # Execution Context
//!
//! Per-record state bundle handed to every script step: the record, the
//! checked-out proxy, the local and global variable scopes, response
//! metadata stored as hidden variables, the bot status, a per-step log
//! buffer and the worker's long-lived session handles.

use std::borrow::Cow;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::domain::record::Record;
use crate::domain::status::BotStatus;
use crate::domain::variables::{SharedScope, Variable, VariableScope};
use crate::infrastructure::http_client::HttpTransport;
use crate::infrastructure::services::{CaptchaSolver, SessionHandles};
use crate::runner::events::{LogEntry, LogLevel};
use crate::runner::proxy_pool::{ProxyHandle, ProxyPool};
use crate::runner::template::{self, Bindings};

/// Hidden variable names filled in by the request step
pub mod hidden {
    pub const SOURCE: &str = "SOURCE";
    pub const ADDRESS: &str = "ADDRESS";
    pub const RESPONSE_CODE: &str = "RESPONSECODE";
    pub const HEADERS: &str = "HEADERS";
    pub const COOKIES: &str = "COOKIES";
}

/// Shared collaborators available to steps for the whole run
#[derive(Debug, Clone)]
pub struct StepServices {
    pub transport: Arc<HttpTransport>,
    pub captcha: Option<Arc<dyn CaptchaSolver>>,
    pub pool: Option<Arc<ProxyPool>>,
    pub request_timeout: Duration,
}

impl StepServices {
    #[must_use]
    pub const fn new(transport: Arc<HttpTransport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            captcha: None,
            pool: None,
            request_timeout,
        }
    }

    #[must_use]
    pub fn with_captcha(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.captcha = Some(solver);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self
    }
}

#[derive(Debug)]
pub struct ExecutionContext {
    pub record: Record,
    pub proxy: Option<ProxyHandle>,
    pub variables: VariableScope,
    pub globals: SharedScope,
    pub status: BotStatus,
    /// Label reported when `status` is `Custom`
    pub custom_status: Option<String>,
    pub bot_number: usize,
    pub sessions: SessionHandles,
    pub cancel: CancellationToken,
    pub services: Arc<StepServices>,
    pub rng: fastrand::Rng,
    log: Vec<LogEntry>,
}

impl ExecutionContext {
    /// Fresh context for one attempt on `record`
    #[must_use]
    pub fn new(
        record: Record,
        proxy: Option<ProxyHandle>,
        globals: SharedScope,
        bot_number: usize,
        services: Arc<StepServices>,
        cancel: CancellationToken,
    ) -> Self {
        let mut variables: VariableScope = record.slice_variables().into_iter().collect();
        variables.set_hidden(Variable::scalar(hidden::SOURCE, ""));
        variables.set_hidden(Variable::scalar(hidden::ADDRESS, ""));
        variables.set_hidden(Variable::scalar(hidden::RESPONSE_CODE, "0"));
        variables.set_hidden(Variable::map(hidden::HEADERS, Vec::<(String, String)>::new()));
        variables.set_hidden(Variable::map(hidden::COOKIES, Vec::<(String, String)>::new()));

        Self {
            record,
            proxy,
            variables,
            globals,
            status: BotStatus::None,
            custom_status: None,
            bot_number,
            sessions: SessionHandles::default(),
            cancel,
            services,
            rng: fastrand::Rng::new(),
            log: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_sessions(mut self, sessions: SessionHandles) -> Self {
        self.sessions = sessions;
        self
    }

    /// `SUCCESS`, `FAIL`, ... or the custom label
    #[must_use]
    pub fn status_label(&self) -> String {
        match (&self.status, &self.custom_status) {
            (BotStatus::Custom, Some(label)) => label.clone(),
            (status, _) => status.as_str().to_string(),
        }
    }

    pub fn set_custom_status(&mut self, label: impl Into<String>) {
        self.status = BotStatus::Custom;
        self.custom_status = Some(label.into());
    }

    #[must_use]
    pub fn proxy_string(&self) -> &str {
        self.proxy.as_ref().map_or("", ProxyHandle::as_str)
    }

    fn bindings<'a>(&'a self, globals: &'a VariableScope) -> Bindings<'a> {
        Bindings::new(&self.variables)
            .with_global(globals)
            .with_reserved("INPUT", self.record.text())
            .with_reserved("STATUS", Cow::Owned(self.status_label()))
            .with_reserved("BOTNUM", Cow::Owned(self.bot_number.to_string()))
            .with_reserved("RETRIES", Cow::Owned(self.record.retry_count().to_string()))
            .with_reserved("PROXY", self.proxy_string())
    }

    #[must_use]
    pub fn resolve(&self, text: &str) -> String {
        let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
        template::resolve(text, &self.bindings(&globals))
    }

    #[must_use]
    pub fn resolve_expanding(&self, text: &str) -> Vec<String> {
        let globals = self.globals.read().unwrap_or_else(PoisonError::into_inner);
        template::resolve_expanding(text, &self.bindings(&globals))
    }

    /// Stores a variable in the local scope, or the global one when `global`
    pub fn store(&mut self, variable: Variable, global: bool) {
        if global {
            self.globals
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .set(variable);
        } else {
            self.variables.set(variable);
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        self.variables.get_scalar(hidden::SOURCE).unwrap_or_default()
    }

    #[must_use]
    pub fn response_code(&self) -> u16 {
        self.variables
            .get_scalar(hidden::RESPONSE_CODE)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn cookies(&self) -> IndexMap<String, String> {
        self.variables
            .get_map(hidden::COOKIES)
            .cloned()
            .unwrap_or_default()
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.log.push(LogEntry::new(level, message));
    }

    #[must_use]
    pub fn logs(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::domain::record::RecordSchema;
    use crate::infrastructure::http_client::HttpConfig;

    pub fn services() -> Arc<StepServices> {
        let transport = HttpTransport::new(&HttpConfig::default()).unwrap();
        Arc::new(StepServices::new(Arc::new(transport), Duration::from_secs(5)))
    }

    pub fn context(line: &str) -> ExecutionContext {
        ExecutionContext::new(
            Record::new(line, Arc::new(RecordSchema::credentials())),
            None,
            VariableScope::shared(),
            1,
            services(),
            CancellationToken::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::context;
    use super::*;

    #[test]
    fn new_context_exposes_slices_and_hidden_defaults() {
        let ctx = context("alice:pw");
        assert_eq!(ctx.variables.get_scalar("USER"), Some("alice"));
        assert_eq!(ctx.source(), "");
        assert_eq!(ctx.response_code(), 0);
        assert!(ctx.cookies().is_empty());
        assert_eq!(ctx.variables.visible().count(), 2);
    }

    #[test]
    fn reserved_names_and_globals_resolve() {
        let ctx = context("alice:pw");
        ctx.globals
            .write()
            .unwrap()
            .set(Variable::scalar("KEY", "g"));
        assert_eq!(
            ctx.resolve("<INPUT>|<USER>|<KEY>|<BOTNUM>|<STATUS>|<RETRIES>|<PROXY>"),
            "alice:pw|alice|g|1|NONE|0|"
        );
    }

    #[test]
    fn custom_status_label_is_reported() {
        let mut ctx = context("a:b");
        ctx.set_custom_status("2FA");
        assert_eq!(ctx.status, BotStatus::Custom);
        assert_eq!(ctx.status_label(), "2FA");
    }

    #[test]
    fn store_targets_local_or_global_scope() {
        let mut ctx = context("a:b");
        ctx.store(Variable::scalar("L", "1"), false);
        ctx.store(Variable::scalar("G", "2"), true);
        assert!(ctx.variables.contains("L"));
        assert!(!ctx.variables.contains("G"));
        assert_eq!(ctx.globals.read().unwrap().get_scalar("G"), Some("2"));
    }
}
