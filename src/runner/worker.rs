//! # Worker
//!
//! A long-lived execution slot. For each assigned record it walks the state
//! machine
//!
//! ```text
//! AcquireProxy -> BuildContext -> RunScript -> Classify -> Terminal
//!      ^                                           |
//!      +------------- Ban / Retry / Error ---------+
//! ```
//!
//! and reports exactly one terminal result per record. Browser and socket
//! session handles stay with the worker between records.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::hit::{Bucket, Hit};
use crate::domain::proxy::ProxyProtocol;
use crate::domain::record::Record;
use crate::domain::status::BotStatus;
use crate::domain::variables::SharedScope;
use crate::infrastructure::config::defaults;
use crate::infrastructure::services::SessionHandles;
use crate::infrastructure::sources::ProxySource;
use crate::runner::context::{ExecutionContext, StepServices};
use crate::runner::error::RunError;
use crate::runner::events::{EventBus, LogEntry, RunEvent};
use crate::runner::host::RunHost;
use crate::runner::outcomes::OutcomeBuckets;
use crate::runner::proxy_pool::{PoolCounts, ProxyHandle, ProxyPool};
use crate::runner::script::{Script, ScriptOutcome};
use crate::runner::sleep_cancellable;
use crate::runner::throughput::ThroughputWindow;

/// Effective proxy policy: environment settings merged with the script's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPolicy {
    pub needs_proxies: bool,
    pub allow_busy: bool,
    pub max_uses: u32,
    pub never_ban: bool,
    pub ban_after_good: bool,
    /// Retries allowed after a ban; 0 = unlimited
    pub evasion_budget: u32,
    pub reload_enabled: bool,
    pub shuffle: bool,
}

/// State shared by the dispatcher and every worker of one run
pub(crate) struct WorkerShared {
    pub script: Arc<Script>,
    pub policy: ProxyPolicy,
    pub allowed_protocols: Vec<ProxyProtocol>,
    pub pool: Arc<ProxyPool>,
    pub proxy_source: Option<ProxySource>,
    pub globals: SharedScope,
    pub outcomes: Arc<OutcomeBuckets>,
    pub throughput: Arc<ThroughputWindow>,
    pub events: EventBus,
    pub host: Arc<dyn RunHost>,
    pub services: Arc<StepServices>,
    pub wait_time: Duration,
    pub cancel: CancellationToken,
    reloader: tokio::sync::Mutex<()>,
    reload_generation: AtomicU64,
    fatal: Mutex<Option<RunError>>,
    in_flight: AtomicUsize,
}

impl WorkerShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        script: Arc<Script>,
        policy: ProxyPolicy,
        pool: Arc<ProxyPool>,
        proxy_source: Option<ProxySource>,
        globals: SharedScope,
        outcomes: Arc<OutcomeBuckets>,
        throughput: Arc<ThroughputWindow>,
        events: EventBus,
        host: Arc<dyn RunHost>,
        services: Arc<StepServices>,
        wait_time: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let allowed_protocols = script.settings.allowed_proxy_protocols.clone();
        Self {
            script,
            policy,
            allowed_protocols,
            pool,
            proxy_source,
            globals,
            outcomes,
            throughput,
            events,
            host,
            services,
            wait_time,
            cancel,
            reloader: tokio::sync::Mutex::new(()),
            reload_generation: AtomicU64::new(0),
            fatal: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Records the first fatal error and cancels the run
    pub(crate) fn fail(&self, error: RunError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            error!("❌ Run failed: {}", error);
            *fatal = Some(error);
        }
        self.cancel.cancel();
    }

    pub(crate) fn take_fatal(&self) -> Option<RunError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Workers currently holding a record
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Filters, de-duplicates and optionally shuffles the loaded pool
    pub(crate) fn prepare_pool(&self) {
        let filtered = self.pool.retain_protocols(&self.allowed_protocols);
        if filtered > 0 {
            debug!("Dropped {} proxies with a disallowed protocol", filtered);
        }
        let duplicates = self.pool.remove_duplicates();
        if duplicates > 0 {
            debug!("Dropped {} duplicate proxies", duplicates);
        }
        if self.policy.shuffle {
            self.pool.shuffle();
        }
    }

    /// Reloads the pool from the host, or the run's own proxy source.
    ///
    /// Single-flight: callers that queued behind a reload that already
    /// happened get the fresh counts without reloading again. When no fresh
    /// list is available every proxy is unbanned instead.
    pub(crate) async fn reload_proxies(&self) -> Result<PoolCounts, RunError> {
        let seen = self.reload_generation.load(Ordering::Acquire);
        let _guard = self.reloader.lock().await;
        if self.reload_generation.load(Ordering::Acquire) != seen {
            return Ok(self.pool.counts());
        }

        let fresh = match self.host.reload_proxies().await? {
            Some(list) => list,
            None => match &self.proxy_source {
                Some(source) => source.load().await?,
                None => Vec::new(),
            },
        };
        if fresh.is_empty() {
            self.pool.unban_all();
        } else {
            self.pool.load(fresh);
            self.prepare_pool();
            self.services.transport.clear_proxy_clients();
        }
        self.reload_generation.fetch_add(1, Ordering::AcqRel);

        let counts = self.pool.counts();
        info!("🔄 Proxies reloaded: {} alive of {}", counts.alive, counts.total);
        self.events.emit(RunEvent::ProxiesReloaded {
            total: counts.total,
            alive: counts.alive,
        });
        Ok(counts)
    }
}

/// Clears the busy flag even when the task is aborted or panics
struct BusyGuard {
    busy: Arc<AtomicBool>,
    shared: Arc<WorkerShared>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.busy.store(false, Ordering::Release);
    }
}

pub(crate) struct Worker {
    bot_number: usize,
    busy: Arc<AtomicBool>,
    retired: bool,
    cancel: CancellationToken,
    sessions: Arc<tokio::sync::Mutex<SessionHandles>>,
    /// Session slots are lent to a running script
    sessions_out: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(bot_number: usize, run_cancel: &CancellationToken) -> Self {
        Self {
            bot_number,
            busy: Arc::new(AtomicBool::new(false)),
            retired: false,
            cancel: run_cancel.child_token(),
            sessions: Arc::new(tokio::sync::Mutex::new(SessionHandles::default())),
            sessions_out: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub(crate) const fn bot_number(&self) -> usize {
        self.bot_number
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) const fn is_retired(&self) -> bool {
        self.retired
    }

    /// No new records; a busy worker finishes its current one first
    pub(crate) const fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_idle(&self) -> bool {
        !self.retired && !self.is_busy()
    }

    /// Starts processing `record` in the background; `false` when busy
    pub(crate) fn assign(&mut self, record: Record, shared: &Arc<WorkerShared>) -> bool {
        if self.retired || self.busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        shared.in_flight.fetch_add(1, Ordering::AcqRel);

        let guard = BusyGuard {
            busy: Arc::clone(&self.busy),
            shared: Arc::clone(shared),
        };
        let shared = Arc::clone(shared);
        let slot = SessionSlot {
            handles: Arc::clone(&self.sessions),
            lent: Arc::clone(&self.sessions_out),
        };
        let cancel = self.cancel.clone();
        let bot_number = self.bot_number;

        self.task = Some(tokio::spawn(async move {
            let _guard = guard;
            process_record(&shared, bot_number, record, &slot, &cancel).await;
        }));
        true
    }

    /// Kills the running task. Returns `true` when the task had the worker's
    /// session slots lent out, in which case those handles were dropped
    /// without being closed.
    pub(crate) async fn force_abort(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        if task.is_finished() {
            return false;
        }
        task.abort();
        // Resolves once the aborted future has been dropped
        let _ = task.await;
        self.busy.store(false, Ordering::Release);
        self.sessions_out.swap(false, Ordering::AcqRel)
    }

    pub(crate) async fn close_sessions(&self) {
        self.sessions.lock().await.close_all().await;
    }
}

struct SessionSlot {
    handles: Arc<tokio::sync::Mutex<SessionHandles>>,
    lent: Arc<AtomicBool>,
}

enum WorkerState {
    AcquireProxy,
    BuildContext(Option<ProxyHandle>),
    RunScript(Box<ExecutionContext>),
    Classify(Box<ExecutionContext>),
    Terminal(Hit),
    Abandoned,
}

async fn process_record(
    shared: &WorkerShared,
    bot_number: usize,
    mut record: Record,
    slot: &SessionSlot,
    cancel: &CancellationToken,
) {
    let mut sessions = slot.handles.lock().await;
    let mut state = WorkerState::AcquireProxy;

    loop {
        state = match state {
            WorkerState::AcquireProxy => {
                if !shared.policy.needs_proxies {
                    WorkerState::BuildContext(None)
                } else {
                    match acquire_proxy(shared, cancel).await {
                        Some(handle) => WorkerState::BuildContext(Some(handle)),
                        None => WorkerState::Abandoned,
                    }
                }
            }

            WorkerState::BuildContext(proxy) => {
                let ctx = ExecutionContext::new(
                    record.clone(),
                    proxy,
                    Arc::clone(&shared.globals),
                    bot_number,
                    Arc::clone(&shared.services),
                    cancel.clone(),
                )
                .with_sessions(std::mem::take(&mut *sessions));
                slot.lent.store(true, Ordering::Release);
                WorkerState::RunScript(Box::new(ctx))
            }

            WorkerState::RunScript(mut ctx) => {
                let events = &shared.events;
                let outcome = shared
                    .script
                    .execute(&mut ctx, |ctx: &ExecutionContext, logs: &[LogEntry]| {
                        for entry in logs {
                            events.emit(RunEvent::Log {
                                bot: ctx.bot_number,
                                record: ctx.record.text().to_string(),
                                entry: entry.clone(),
                            });
                        }
                    })
                    .await;
                *sessions = std::mem::take(&mut ctx.sessions);
                slot.lent.store(false, Ordering::Release);

                match outcome {
                    ScriptOutcome::Completed => {
                        sleep_cancellable(shared.wait_time, cancel).await;
                        WorkerState::Classify(ctx)
                    }
                    ScriptOutcome::Cancelled => {
                        if let Some(handle) = ctx.proxy.take() {
                            shared.pool.return_proxy(handle);
                        }
                        WorkerState::Abandoned
                    }
                }
            }

            WorkerState::Classify(ctx) => classify(shared, &mut record, *ctx),

            WorkerState::Terminal(hit) => {
                report(shared, hit).await;
                return;
            }

            WorkerState::Abandoned => {
                debug!("Bot {} abandoned record {}", bot_number, record.text());
                return;
            }
        };
    }
}

/// Checks out a proxy, waiting while every alive proxy is busy. `None`
/// means the run is over for this worker (cancelled or exhausted).
async fn acquire_proxy(shared: &WorkerShared, cancel: &CancellationToken) -> Option<ProxyHandle> {
    let policy = shared.policy;
    let wait = Duration::from_millis(defaults::PROXY_WAIT_MS);

    loop {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(handle) = shared
            .pool
            .get_proxy(policy.allow_busy, policy.max_uses, policy.never_ban)
        {
            return Some(handle);
        }

        if shared.pool.is_exhausted(policy.max_uses, policy.never_ban) {
            if !policy.reload_enabled {
                shared.fail(RunError::ProxiesExhausted);
                return None;
            }
            match shared.reload_proxies().await {
                Ok(_) if !shared.pool.is_exhausted(policy.max_uses, policy.never_ban) => continue,
                Ok(_) => {
                    shared.fail(RunError::ProxiesExhausted);
                    return None;
                }
                Err(e) => {
                    shared.fail(e);
                    return None;
                }
            }
        }

        if !sleep_cancellable(wait, cancel).await {
            return None;
        }
    }
}

/// Maps the final status to a proxy action and either a terminal result or
/// another attempt
fn classify(shared: &WorkerShared, record: &mut Record, mut ctx: ExecutionContext) -> WorkerState {
    let policy = shared.policy;
    let pool = &shared.pool;
    let proxy = ctx.proxy.take();
    let proxy_label = proxy.as_ref().map(ToString::to_string);

    let terminal = |record: &Record, ctx: &ExecutionContext, bucket: Bucket, label: &str| {
        WorkerState::Terminal(
            Hit::new(record.text(), bucket, label)
                .with_proxy(proxy_label.clone())
                .with_captures(ctx.variables.captures())
                .with_retries(record.retry_count())
                .with_script(shared.script.name()),
        )
    };

    match ctx.status {
        BotStatus::Success | BotStatus::Custom => {
            if let Some(handle) = proxy {
                if policy.ban_after_good && !policy.never_ban {
                    pool.ban(handle);
                } else {
                    pool.return_proxy(handle);
                }
            }
            let bucket = if ctx.status == BotStatus::Success {
                Bucket::Hit
            } else {
                Bucket::Custom
            };
            terminal(record, &ctx, bucket, &ctx.status_label())
        }
        BotStatus::Fail => {
            if let Some(handle) = proxy {
                pool.return_proxy(handle);
            }
            terminal(record, &ctx, Bucket::Fail, BotStatus::Fail.as_str())
        }
        BotStatus::None => {
            if let Some(handle) = proxy {
                pool.return_proxy(handle);
            }
            terminal(record, &ctx, Bucket::ToCheck, BotStatus::None.as_str())
        }
        BotStatus::Ban => {
            if let Some(handle) = proxy {
                if policy.never_ban {
                    pool.return_proxy(handle);
                } else {
                    pool.ban(handle);
                }
            }
            if policy.evasion_budget == 0 || record.retry_count() < policy.evasion_budget {
                record.increment_retries();
                shared.outcomes.add_retry();
                debug!("Bot {} banned, retry {} for {}", ctx.bot_number, record.retry_count(), record.text());
                WorkerState::AcquireProxy
            } else {
                warn!("⚠️ Ban-loop evasion budget exhausted for {}", record.text());
                terminal(record, &ctx, Bucket::ToCheck, BotStatus::None.as_str())
            }
        }
        BotStatus::Retry => {
            if let Some(handle) = proxy {
                pool.return_proxy(handle);
            }
            shared.outcomes.add_retry();
            WorkerState::AcquireProxy
        }
        BotStatus::Error => {
            if let Some(handle) = proxy {
                pool.mark_bad(handle);
            }
            shared.outcomes.add_retry();
            WorkerState::AcquireProxy
        }
    }
}

async fn report(shared: &WorkerShared, hit: Hit) {
    shared.throughput.record();
    if hit.is_reportable() {
        match hit.bucket {
            Bucket::Hit => info!("✅ HIT {} {}", hit.record, hit.capture_line()),
            _ => debug!("{} {} ({})", hit.bucket, hit.record, hit.label),
        }
        let events = shared.events.clone();
        let found = hit.clone();
        shared
            .host
            .dispatch(Box::new(move || events.emit(RunEvent::HitFound(found))));
        if let Err(e) = shared.host.save_hit(&hit).await {
            warn!("⚠️ Failed to save hit for {}: {}", hit.record, e);
        }
    }
    shared.outcomes.push(hit);
}
