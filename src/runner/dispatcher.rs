//! # Run dispatcher
//!
//! Owns one run end to end:
//!
//! 1. validates the request and prepares the proxy pool
//! 2. asks the host for custom inputs
//! 3. hands records to idle workers, honoring the worker target, the CPM
//!    cap and the hit limit
//! 4. drains the workers on completion, stop or abort and reports a
//!    [`RunSummary`]
//!
//! Progress saves and proxy maintenance run on the dispatcher's poll loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::hit::{Bucket, Hit};
use crate::domain::record::{DataRules, Record, RecordSchema};
use crate::domain::variables::{SharedScope, Variable, VariableScope};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::http_client::{HttpTransport, TransportError};
use crate::infrastructure::services::CaptchaSolver;
use crate::infrastructure::sources::{DataPool, ProxySource};
use crate::runner::context::StepServices;
use crate::runner::error::RunError;
use crate::runner::events::{EventBus, LogEntry, LogLevel, RunEvent};
use crate::runner::host::RunHost;
use crate::runner::outcomes::OutcomeBuckets;
use crate::runner::proxy_pool::ProxyPool;
use crate::runner::script::Script;
use crate::runner::sleep_cancellable;
use crate::runner::throughput::ThroughputWindow;
use crate::runner::worker::{ProxyPolicy, Worker, WorkerShared};

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Application-wide collaborators shared by every run
pub struct AppContext {
    pub config: AppConfig,
    pub transport: Arc<HttpTransport>,
    pub captcha: Option<Arc<dyn CaptchaSolver>>,
    pub host: Arc<dyn RunHost>,
    pub events: EventBus,
}

impl AppContext {
    pub fn new(config: AppConfig, host: Arc<dyn RunHost>) -> Result<Self, TransportError> {
        let transport = Arc::new(HttpTransport::new(&config.http)?);
        Ok(Self {
            config,
            transport,
            captcha: None,
            host,
            events: EventBus::new(),
        })
    }

    #[must_use]
    pub fn with_captcha(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.captcha = Some(solver);
        self
    }
}

/// What to run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub script: Arc<Script>,
    pub data: DataPool,
    pub schema: Arc<RecordSchema>,
    pub proxies: Option<ProxySource>,
    /// Overrides `general.start_offset` from the configuration
    pub start_offset: Option<usize>,
    /// Overrides `general.bots` from the configuration
    pub bots: Option<usize>,
}

impl RunRequest {
    #[must_use]
    pub fn new(script: Arc<Script>, data: DataPool) -> Self {
        Self {
            script,
            data,
            schema: Arc::new(RecordSchema::credentials()),
            proxies: None,
            start_offset: None,
            bots: None,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: RecordSchema) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    #[must_use]
    pub fn with_proxies(mut self, source: ProxySource) -> Self {
        self.proxies = Some(source);
        self
    }

    #[must_use]
    pub const fn starting_at(mut self, offset: usize) -> Self {
        self.start_offset = Some(offset);
        self
    }

    #[must_use]
    pub const fn with_bots(mut self, bots: usize) -> Self {
        self.bots = Some(bots);
        self
    }
}

/// Cloneable handle for controlling a run from another task
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    aborted: Arc<AtomicBool>,
    target: Arc<AtomicUsize>,
}

impl RunControl {
    fn new(bots: usize) -> Self {
        Self {
            cancel: CancellationToken::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            target: Arc::new(AtomicUsize::new(bots.max(1))),
        }
    }

    /// Cooperative stop: workers abandon their record at the next step
    pub fn stop(&self) {
        info!("🛑 Stop requested");
        self.cancel.cancel();
    }

    /// Stop, then kill whatever is still running after the grace period
    pub fn abort(&self) {
        warn!("🛑 Abort requested");
        self.aborted.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Takes effect on the dispatcher's next poll; at least one worker
    pub fn set_worker_target(&self, bots: usize) {
        self.target.store(bots.max(1), Ordering::Release);
    }

    #[must_use]
    pub fn worker_target(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Why dispatching ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    HitLimit,
    Stopped,
    Aborted,
    Fatal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub script: String,
    pub tested: u64,
    pub hits: usize,
    pub fails: usize,
    pub customs: usize,
    pub to_check: usize,
    pub retries: u64,
    pub elapsed_secs: f64,
    /// Workers force-killed while they held session handles
    pub leaked_sessions: usize,
    pub cpm: u64,
    /// Index of the next unconsumed record
    pub position: usize,
    pub stop_reason: StopReason,
}

/// One run over one data source. A session whose run was stopped cannot be
/// started again.
pub struct RunSession {
    app: Arc<AppContext>,
    control: RunControl,
    outcomes: Arc<OutcomeBuckets>,
    throughput: Arc<ThroughputWindow>,
    pool: Arc<ProxyPool>,
    globals: SharedScope,
}

struct Maintenance {
    last_save: Instant,
    last_reload: Instant,
}

impl RunSession {
    #[must_use]
    pub fn new(app: Arc<AppContext>) -> Self {
        let control = RunControl::new(app.config.general.bots);
        Self {
            app,
            control,
            outcomes: Arc::new(OutcomeBuckets::new()),
            throughput: Arc::new(ThroughputWindow::new()),
            pool: Arc::new(ProxyPool::new()),
            globals: VariableScope::shared(),
        }
    }

    #[must_use]
    pub const fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    #[must_use]
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    #[must_use]
    pub fn outcomes(&self) -> &Arc<OutcomeBuckets> {
        &self.outcomes
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    #[must_use]
    pub fn globals(&self) -> &SharedScope {
        &self.globals
    }

    #[must_use]
    pub fn cpm(&self) -> u64 {
        self.throughput.cpm()
    }

    /// Runs to completion. A fatal error still emits a
    /// [`RunEvent::Finished`] when workers had started, then returns the
    /// error.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary, RunError> {
        let result = self.run_inner(request).await;
        if let Err(e) = &result {
            if !matches!(e, RunError::Cancelled) {
                if e.is_configuration() {
                    warn!("⚠️ Run rejected before start: {}", e);
                } else {
                    error!("❌ Run ended with error: {}", e);
                }
                self.app.events.emit(RunEvent::Log {
                    bot: 0,
                    record: String::new(),
                    entry: LogEntry::new(LogLevel::Error, e.to_string()).prompting(None),
                });
                self.app.events.emit(RunEvent::Fatal {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_inner(&self, request: RunRequest) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let general = &self.app.config.general;
        let start_offset = request.start_offset.unwrap_or(general.start_offset);
        if let Some(bots) = request.bots {
            self.control.set_worker_target(bots);
        }

        let rules = Self::validate(&request, start_offset)?;
        let script = Arc::clone(&request.script);

        self.outcomes.clear();
        self.throughput.reset();
        *self.globals.write().unwrap_or_else(PoisonError::into_inner) = VariableScope::new();

        let policy = self.proxy_policy(&script);
        let mut services = StepServices::new(Arc::clone(&self.app.transport), general.request_timeout())
            .with_pool(Arc::clone(&self.pool));
        if let Some(solver) = &self.app.captcha {
            services = services.with_captcha(Arc::clone(solver));
        }

        let shared = Arc::new(WorkerShared::new(
            Arc::clone(&script),
            policy,
            Arc::clone(&self.pool),
            request.proxies.clone(),
            Arc::clone(&self.globals),
            Arc::clone(&self.outcomes),
            Arc::clone(&self.throughput),
            self.app.events.clone(),
            Arc::clone(&self.app.host),
            Arc::new(services),
            general.wait_time(),
            self.control.cancel.clone(),
        ));

        if policy.needs_proxies {
            self.load_proxies(&request, &shared).await?;
        }
        self.collect_custom_inputs(&script).await?;

        info!(
            "🚀 Starting '{}': {} records from {}, {} bots, offset {}",
            script.name(),
            request.data.len(),
            request.data.name(),
            self.control.worker_target(),
            start_offset
        );

        let mut workers = Vec::new();
        let mut next_bot = 1;
        let (reason, position) = self
            .dispatch(&request, &rules, start_offset, &shared, &mut workers, &mut next_bot)
            .await;

        let leaked = self.drain(&mut workers, &shared).await;
        join_all(workers.iter().map(Worker::close_sessions)).await;
        save_progress(&shared, position).await;

        let reason = if shared.has_failed() {
            StopReason::Fatal
        } else {
            reason
        };
        let counts = self.outcomes.counts();
        let summary = RunSummary {
            script: script.name().to_string(),
            tested: counts.tested,
            hits: counts.hits,
            fails: counts.fails,
            customs: counts.customs,
            to_check: counts.to_check,
            retries: counts.retries,
            elapsed_secs: started.elapsed().as_secs_f64(),
            leaked_sessions: leaked,
            cpm: self.throughput.cpm(),
            position,
            stop_reason: reason,
        };
        info!(
            "🎉 Run finished ({:?}): {} tested, {} hits, {} custom, {} to check, {} fails in {:.1}s",
            summary.stop_reason,
            summary.tested,
            summary.hits,
            summary.customs,
            summary.to_check,
            summary.fails,
            summary.elapsed_secs
        );
        self.app.events.emit(RunEvent::Finished(summary.clone()));

        match shared.take_fatal() {
            Some(fatal) => Err(fatal),
            None => Ok(summary),
        }
    }

    fn validate(request: &RunRequest, start_offset: usize) -> Result<DataRules, RunError> {
        if request.script.is_empty() {
            return Err(RunError::NoScript);
        }
        if request.data.is_empty() {
            return Err(RunError::NoData);
        }
        if start_offset >= request.data.len() {
            return Err(RunError::InvalidStartOffset {
                offset: start_offset,
                len: request.data.len(),
            });
        }
        Ok(DataRules::compile(&request.script.settings.data_rules)?)
    }

    /// Script settings override the environment where both exist
    fn proxy_policy(&self, script: &Script) -> ProxyPolicy {
        let proxies = &self.app.config.proxies;
        let settings = &script.settings;
        ProxyPolicy {
            needs_proxies: settings.needs_proxies,
            allow_busy: proxies.concurrent_use,
            max_uses: if settings.max_proxy_uses > 0 {
                settings.max_proxy_uses
            } else {
                proxies.max_uses
            },
            never_ban: proxies.never_ban,
            ban_after_good: settings.ban_proxy_after_good_status,
            evasion_budget: settings
                .ban_loop_evasion_override
                .unwrap_or(proxies.ban_loop_evasion),
            reload_enabled: proxies.reload_enabled,
            shuffle: proxies.shuffle_on_start,
        }
    }

    async fn load_proxies(&self, request: &RunRequest, shared: &WorkerShared) -> Result<(), RunError> {
        let endpoints = match &request.proxies {
            Some(source) => source.load().await?,
            None => Vec::new(),
        };
        self.pool.load(endpoints);
        shared.prepare_pool();
        self.app.transport.clear_proxy_clients();

        let counts = self.pool.counts();
        if counts.total == 0 {
            return Err(RunError::NoProxies);
        }
        info!("📁 {} proxies ready", counts.total);
        Ok(())
    }

    async fn collect_custom_inputs(&self, script: &Script) -> Result<(), RunError> {
        let inputs = &script.settings.custom_inputs;
        if inputs.is_empty() {
            return Ok(());
        }

        let answers = tokio::select! {
            answers = self.app.host.custom_inputs(inputs) => answers?,
            () = self.control.cancel.cancelled() => return Err(RunError::Cancelled),
        };
        let mut globals = self.globals.write().unwrap_or_else(PoisonError::into_inner);
        for (name, value) in answers {
            debug!("Custom input {} set", name);
            globals.set(Variable::scalar(name, value));
        }
        Ok(())
    }

    /// Main assignment loop. Returns why it ended and the index of the next
    /// unconsumed record.
    async fn dispatch(
        &self,
        request: &RunRequest,
        rules: &DataRules,
        start_offset: usize,
        shared: &Arc<WorkerShared>,
        workers: &mut Vec<Worker>,
        next_bot: &mut usize,
    ) -> (StopReason, usize) {
        let general = &self.app.config.general;
        let cancel = &self.control.cancel;
        let poll = general.poll_interval();
        let max_cpm = shared.script.settings.max_cpm;

        let mut lines = request.data.iter().skip(start_offset).peekable();
        let mut position = start_offset;
        let mut maintenance = Maintenance {
            last_save: Instant::now(),
            last_reload: Instant::now(),
        };

        let reason = loop {
            if cancel.is_cancelled() {
                break if self.control.is_aborted() {
                    StopReason::Aborted
                } else {
                    StopReason::Stopped
                };
            }
            if general.max_hits > 0 && self.outcomes.hits_found() >= general.max_hits {
                info!("🎉 Hit limit of {} reached", general.max_hits);
                break StopReason::HitLimit;
            }

            self.resize_workers(workers, next_bot, shared).await;
            self.maintain(shared, &mut maintenance, position).await;

            let Some(line) = lines.peek() else {
                break StopReason::Completed;
            };
            let record = Record::new(*line, Arc::clone(&request.schema));

            if !record.is_valid() || !rules.accepts(&record) {
                debug!("Record '{}' rejected by the data rules", record.text());
                self.throughput.record();
                self.outcomes.push(
                    Hit::new(record.text(), Bucket::Fail, "FAIL").with_script(shared.script.name()),
                );
                lines.next();
                position += 1;
                continue;
            }

            if max_cpm > 0 && self.throughput.cpm() >= max_cpm {
                sleep_cancellable(poll, cancel).await;
                continue;
            }

            if let Some(worker) = workers.iter_mut().find(|worker| worker.is_idle()) {
                if worker.assign(record, shared) {
                    debug!("Record {} assigned to bot {}", position, worker.bot_number());
                    lines.next();
                    position += 1;
                    continue;
                }
            }

            sleep_cancellable(poll, cancel).await;
        };

        (reason, position)
    }

    /// Grows or shrinks the worker set toward the target. Idle workers are
    /// retired first; busy ones finish their record before leaving.
    async fn resize_workers(&self, workers: &mut Vec<Worker>, next_bot: &mut usize, shared: &WorkerShared) {
        let target = self.control.worker_target();
        let active = workers.iter().filter(|worker| !worker.is_retired()).count();

        if active < target {
            for _ in active..target {
                workers.push(Worker::new(*next_bot, &shared.cancel));
                *next_bot += 1;
            }
        } else if active > target {
            let mut excess = active - target;
            for worker in workers.iter_mut().filter(|worker| worker.is_idle()) {
                if excess == 0 {
                    break;
                }
                worker.retire();
                excess -= 1;
            }
            for worker in workers.iter_mut().rev().filter(|worker| !worker.is_retired()) {
                if excess == 0 {
                    break;
                }
                worker.retire();
                excess -= 1;
            }
        }

        let (finished, kept): (Vec<Worker>, Vec<Worker>) = std::mem::take(workers)
            .into_iter()
            .partition(|worker| worker.is_retired() && !worker.is_busy());
        *workers = kept;
        join_all(finished.iter().map(Worker::close_sessions)).await;

        if active != target {
            info!("🔄 Workers: {} -> {}", active, target);
            shared.events.emit(RunEvent::WorkersChanged {
                target,
                active: workers.iter().filter(|worker| !worker.is_retired()).count(),
            });
        }
    }

    /// Progress saves, ban expiry and periodic proxy reloads
    async fn maintain(&self, shared: &WorkerShared, maintenance: &mut Maintenance, position: usize) {
        let general = &self.app.config.general;
        let proxies = &self.app.config.proxies;

        if general.progress_save_interval_secs > 0
            && maintenance.last_save.elapsed() >= Duration::from_secs(general.progress_save_interval_secs)
        {
            save_progress(shared, position).await;
            maintenance.last_save = Instant::now();
        }

        if !shared.policy.needs_proxies {
            return;
        }
        if proxies.ban_duration_secs > 0 {
            let unbanned = self
                .pool
                .unban_expired(Duration::from_secs(proxies.ban_duration_secs));
            if unbanned > 0 {
                debug!("{} proxies served their ban", unbanned);
            }
        }
        if proxies.reload_enabled
            && proxies.reload_interval_secs > 0
            && maintenance.last_reload.elapsed() >= Duration::from_secs(proxies.reload_interval_secs)
        {
            if let Err(e) = shared.reload_proxies().await {
                warn!("⚠️ Periodic proxy reload failed: {}", e);
            }
            maintenance.last_reload = Instant::now();
        }
    }

    /// Waits for in-flight records. After an abort, workers still running
    /// when the grace period ends are killed; returns how many of those
    /// held session handles.
    async fn drain(&self, workers: &mut [Worker], shared: &WorkerShared) -> usize {
        let grace = Duration::from_secs(self.app.config.general.abort_grace_period_secs);
        let mut abort_deadline = None;

        loop {
            if shared.in_flight() == 0 {
                return 0;
            }
            if self.control.is_aborted() {
                let deadline = *abort_deadline.get_or_insert_with(|| Instant::now() + grace);
                if Instant::now() >= deadline {
                    break;
                }
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let mut leaked = 0;
        for worker in workers.iter_mut() {
            if worker.force_abort().await {
                leaked += 1;
            }
        }
        warn!(
            "🛑 Grace period over, killed remaining workers ({} with open sessions)",
            leaked
        );
        leaked
    }
}

async fn save_progress(shared: &WorkerShared, position: usize) {
    match shared.host.save_progress(position).await {
        Ok(()) => {
            debug!("Progress saved at {}", position);
            shared.events.emit(RunEvent::ProgressSaved { position });
        }
        Err(e) => warn!("⚠️ Failed to save progress: {}", e),
    }
}
