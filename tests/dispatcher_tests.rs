//! End-to-end runs through the dispatcher with in-process steps
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use bulkcheck_lib::domain::hit::{Bucket, Hit};
use bulkcheck_lib::domain::status::BotStatus;
use bulkcheck_lib::infrastructure::{AppConfig, DataPool, ProxySource};
use bulkcheck_lib::runner::{
    CustomInput, ExecutionContext, HostAction, HostError, NullHost, RunHost, ScriptSettings,
    ScriptStep, StepError, sleep_cancellable,
};
use bulkcheck_lib::steps::{Comparer, Key, KeyChain, KeyKind, KeycheckStep};
use bulkcheck_lib::{AppContext, RunError, RunEvent, RunRequest, RunSession, Script, StopReason};

type Decide = dyn Fn(usize) -> BotStatus + Send + Sync;

/// Step that records how it was called and sets a status chosen from the
/// call index
struct Recorder {
    decide: Box<Decide>,
    delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    proxies: Mutex<Vec<String>>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder").field("delay", &self.delay).finish()
    }
}

impl Recorder {
    fn new(decide: impl Fn(usize) -> BotStatus + Send + Sync + 'static) -> Self {
        Self {
            decide: Box::new(decide),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            proxies: Mutex::new(Vec::new()),
        }
    }

    fn always(status: BotStatus) -> Self {
        Self::new(move |_| status)
    }

    fn with_delay(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScriptStep for Recorder {
    fn kind(&self) -> &'static str {
        "RECORDER"
    }

    fn label(&self) -> &str {
        "recorder"
    }

    async fn process(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(proxy) = &ctx.proxy {
            self.proxies.lock().unwrap().push(proxy.as_str().to_string());
        }

        let finished = sleep_cancellable(self.delay, &ctx.cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        if !finished {
            return Err(StepError::Cancelled);
        }
        ctx.status = (self.decide)(call);
        Ok(())
    }

    fn to_text(&self) -> String {
        "RECORDER".to_string()
    }
}

/// Sleeps without looking at cancellation
#[derive(Debug)]
struct Stubborn;

#[async_trait]
impl ScriptStep for Stubborn {
    fn kind(&self) -> &'static str {
        "STUBBORN"
    }

    fn label(&self) -> &str {
        "stubborn"
    }

    async fn process(&self, _ctx: &mut ExecutionContext) -> Result<(), StepError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    fn to_text(&self) -> String {
        "STUBBORN".to_string()
    }
}

/// Panics every time it runs
#[derive(Debug)]
struct Exploding;

#[async_trait]
impl ScriptStep for Exploding {
    fn kind(&self) -> &'static str {
        "EXPLODING"
    }

    fn label(&self) -> &str {
        "exploding"
    }

    async fn process(&self, _ctx: &mut ExecutionContext) -> Result<(), StepError> {
        panic!("step blew up");
    }

    fn to_text(&self) -> String {
        "EXPLODING".to_string()
    }
}

#[derive(Default)]
struct RecordingHost {
    hits: Mutex<Vec<Hit>>,
    progress: Mutex<Vec<usize>>,
    dispatched: AtomicUsize,
}

#[async_trait]
impl RunHost for RecordingHost {
    fn dispatch(&self, action: HostAction) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        action();
    }

    async fn save_hit(&self, hit: &Hit) -> Result<(), HostError> {
        self.hits.lock().unwrap().push(hit.clone());
        Ok(())
    }

    async fn save_progress(&self, position: usize) -> Result<(), HostError> {
        self.progress.lock().unwrap().push(position);
        Ok(())
    }
}

fn fast_config(bots: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.general.bots = bots;
    config.general.poll_interval_ms = 2;
    config.general.wait_time_ms = 0;
    config.general.progress_save_interval_secs = 0;
    config.general.abort_grace_period_secs = 0;
    config.proxies.shuffle_on_start = false;
    config.proxies.reload_enabled = false;
    config
}

fn session_with(config: AppConfig, host: Arc<dyn RunHost>) -> RunSession {
    let app = AppContext::new(config, host).expect("transport");
    RunSession::new(Arc::new(app))
}

fn script_of(settings: ScriptSettings, steps: Vec<Arc<dyn ScriptStep>>) -> Arc<Script> {
    Arc::new(Script::new(settings, steps))
}

fn records(lines: &[&str]) -> DataPool {
    DataPool::from_lines("test", lines.iter().copied())
}

fn numbered_records(count: usize) -> DataPool {
    DataPool::from_lines("test", (0..count).map(|i| format!("user{i}:pass{i}")))
}

fn proxied() -> ScriptSettings {
    ScriptSettings {
        needs_proxies: true,
        ..ScriptSettings::default()
    }
}

#[tokio::test]
async fn invalid_records_fail_without_reaching_a_worker() {
    let host = Arc::new(RecordingHost::default());
    let session = session_with(fast_config(2), host.clone());
    let step = Arc::new(Recorder::always(BotStatus::Success));
    let script = script_of(ScriptSettings::default(), vec![step.clone()]);

    let summary = session
        .run(RunRequest::new(script, records(&["u1:p1", "u2:p2", "bad"])))
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(step.calls(), 2);
    assert_eq!(summary.hits, 2);
    assert_eq!(summary.fails, 1);
    assert_eq!(summary.tested, 3);
    assert_eq!(summary.position, 3);
    assert_eq!(session.outcomes().list(Bucket::Fail)[0].record, "bad");

    assert_eq!(host.hits.lock().unwrap().len(), 2);
    assert_eq!(host.dispatched.load(Ordering::SeqCst), 2);
    assert_eq!(host.progress.lock().unwrap().last(), Some(&3));
}

#[tokio::test]
async fn in_flight_records_never_exceed_the_worker_count() {
    let session = session_with(fast_config(3), Arc::new(NullHost));
    let step = Arc::new(Recorder::always(BotStatus::Fail).with_delay(10));
    let script = script_of(ScriptSettings::default(), vec![step.clone()]);

    let summary = session
        .run(RunRequest::new(script, numbered_records(20)))
        .await
        .unwrap();

    assert_eq!(summary.tested, 20);
    assert_eq!(summary.fails, 20);
    assert!(step.peak() <= 3, "peak was {}", step.peak());
    assert!(step.peak() >= 1);
}

#[tokio::test]
async fn start_offset_skips_earlier_records() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let step = Arc::new(Recorder::always(BotStatus::Success));
    let script = script_of(ScriptSettings::default(), vec![step.clone()]);

    let summary = session
        .run(RunRequest::new(script, numbered_records(5)).starting_at(3))
        .await
        .unwrap();

    assert_eq!(step.calls(), 2);
    assert_eq!(summary.position, 5);
    let hits = session.outcomes().list(Bucket::Hit);
    assert!(hits.iter().all(|hit| hit.record != "user0:pass0"));
}

#[tokio::test]
async fn ban_loop_budget_sends_the_record_to_check() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let step = Arc::new(Recorder::always(BotStatus::Ban));
    let settings = ScriptSettings {
        ban_loop_evasion_override: Some(2),
        ..proxied()
    };
    let script = script_of(settings, vec![step.clone()]);
    let proxies = ProxySource::lines(["10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.3:8080"]);

    let summary = session
        .run(RunRequest::new(script, records(&["u1:p1"])).with_proxies(proxies))
        .await
        .unwrap();

    assert_eq!(step.calls(), 3);
    assert_eq!(summary.retries, 2);
    assert_eq!(summary.to_check, 1);
    assert_eq!(session.pool().counts().banned, 3);

    let used = step.proxies.lock().unwrap().clone();
    let mut distinct = used.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 3, "a banned proxy was handed out again: {used:?}");
}

#[tokio::test]
async fn error_status_marks_the_proxy_bad_and_retries() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let step = Arc::new(Recorder::new(|call| {
        if call == 0 {
            BotStatus::Error
        } else {
            BotStatus::Success
        }
    }));
    let script = script_of(proxied(), vec![step.clone()]);
    let proxies = ProxySource::lines(["10.0.0.1:8080", "10.0.0.2:8080"]);

    let summary = session
        .run(RunRequest::new(script, records(&["u1:p1"])).with_proxies(proxies))
        .await
        .unwrap();

    assert_eq!(step.calls(), 2);
    assert_eq!(summary.hits, 1);
    assert_eq!(summary.retries, 1);
    assert_eq!(session.pool().counts().bad, 1);
}

#[tokio::test]
async fn exhausted_proxies_are_fatal_when_reloading_is_off() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let mut events = session_events(&session);
    let script = script_of(
        ScriptSettings {
            ban_loop_evasion_override: Some(0),
            ..proxied()
        },
        vec![Arc::new(Recorder::always(BotStatus::Ban))],
    );

    let result = session
        .run(
            RunRequest::new(script, records(&["u1:p1"]))
                .with_proxies(ProxySource::lines(["10.0.0.1:8080"])),
        )
        .await;

    assert!(matches!(result, Err(RunError::ProxiesExhausted)), "{result:?}");
    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|event| matches!(event, RunEvent::Fatal { .. })));
    let prompts: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, RunEvent::Log { entry, .. } if entry.prompt))
        .collect();
    assert_eq!(prompts.len(), 1);
}

#[tokio::test]
async fn never_ban_run_fails_once_every_proxy_is_worn_out() {
    let mut config = fast_config(1);
    config.proxies.never_ban = true;
    let session = session_with(config, Arc::new(NullHost));
    let step = Arc::new(Recorder::always(BotStatus::Success));
    let script = script_of(
        ScriptSettings {
            max_proxy_uses: 1,
            ..proxied()
        },
        vec![step.clone()],
    );

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        session.run(
            RunRequest::new(script, numbered_records(2))
                .with_proxies(ProxySource::lines(["10.0.0.1:8080"])),
        ),
    )
    .await
    .expect("run should end instead of waiting for a proxy");

    assert!(matches!(result, Err(RunError::ProxiesExhausted)), "{result:?}");
    assert_eq!(step.calls(), 1);
    assert_eq!(session.outcomes().list(Bucket::Hit).len(), 1);
    let counts = session.pool().counts();
    assert_eq!((counts.alive, counts.banned), (1, 0));
}

#[tokio::test]
async fn panicking_step_still_classifies_and_returns_the_proxy() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let step = Arc::new(Recorder::always(BotStatus::Success));
    let script = script_of(proxied(), vec![Arc::new(Exploding), step.clone()]);

    let summary = session
        .run(
            RunRequest::new(script, records(&["u1:p1", "u2:p2"]))
                .with_proxies(ProxySource::lines(["10.0.0.1:8080"])),
        )
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.hits, 2);
    assert_eq!(step.calls(), 2);
    let proxy = &session.pool().snapshot()[0];
    assert_eq!(proxy.hooked, 0);
    assert_eq!(proxy.uses, 2);
    let counts = session.pool().counts();
    assert_eq!((counts.available, counts.busy), (1, 0));
}

#[tokio::test]
async fn configuration_errors_stop_before_any_worker_runs() {
    let step = Arc::new(Recorder::always(BotStatus::Success));
    let script = script_of(ScriptSettings::default(), vec![step.clone()]);
    let run = |request: RunRequest| async move {
        session_with(fast_config(1), Arc::new(NullHost)).run(request).await
    };

    let empty_script = script_of(ScriptSettings::default(), Vec::new());
    assert!(matches!(
        run(RunRequest::new(empty_script, records(&["a:b"]))).await,
        Err(RunError::NoScript)
    ));
    assert!(matches!(
        run(RunRequest::new(Arc::clone(&script), records(&[]))).await,
        Err(RunError::NoData)
    ));
    assert!(matches!(
        run(RunRequest::new(Arc::clone(&script), records(&["a:b"])).starting_at(1)).await,
        Err(RunError::InvalidStartOffset { offset: 1, len: 1 })
    ));
    let needs_proxies = script_of(proxied(), vec![step.clone()]);
    assert!(matches!(
        run(RunRequest::new(needs_proxies, records(&["a:b"]))).await,
        Err(RunError::NoProxies)
    ));
    assert_eq!(step.calls(), 0);
}

#[tokio::test]
async fn hit_limit_stops_dispatching() {
    let mut config = fast_config(1);
    config.general.max_hits = 2;
    let session = session_with(config, Arc::new(NullHost));
    let step = Arc::new(Recorder::always(BotStatus::Success));
    let script = script_of(ScriptSettings::default(), vec![step.clone()]);

    let summary = session
        .run(RunRequest::new(script, numbered_records(10)))
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::HitLimit);
    assert_eq!(summary.hits, 2);
    assert_eq!(summary.position, 2);
}

#[tokio::test]
async fn custom_inputs_are_visible_as_globals() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let settings = ScriptSettings {
        custom_inputs: vec![CustomInput {
            variable_name: "DOMAIN".into(),
            description: "Target domain".into(),
            default_value: "example.com".into(),
        }],
        ..ScriptSettings::default()
    };
    let keycheck = KeycheckStep::new(vec![KeyChain::new(
        KeyKind::Success,
        vec![Key::new("<DOMAIN>", Comparer::EqualTo, "example.com")],
    )]);
    let script = script_of(settings, vec![Arc::new(keycheck)]);

    let summary = session
        .run(RunRequest::new(script, records(&["u1:p1"])))
        .await
        .unwrap();

    assert_eq!(summary.hits, 1);
    assert_eq!(
        session.globals().read().unwrap().get_scalar("DOMAIN"),
        Some("example.com")
    );
}

#[tokio::test]
async fn stop_abandons_in_flight_records() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let control = session.control();
    let step = Arc::new(Recorder::always(BotStatus::Success).with_delay(10_000));
    let script = script_of(ScriptSettings::default(), vec![step.clone()]);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.stop();
    });
    let started = Instant::now();
    let summary = session
        .run(RunRequest::new(script, numbered_records(3)))
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::Stopped);
    assert_eq!(summary.tested, 0);
    assert_eq!(summary.leaked_sessions, 0);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn abort_kills_workers_that_ignore_cancellation() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let control = session.control();
    let script = script_of(ScriptSettings::default(), vec![Arc::new(Stubborn)]);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.abort();
    });
    let started = Instant::now();
    let summary = session
        .run(RunRequest::new(script, numbered_records(3)))
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::Aborted);
    assert_eq!(summary.leaked_sessions, 1);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn worker_target_can_grow_mid_run() {
    let session = session_with(fast_config(1), Arc::new(NullHost));
    let control = session.control();
    let mut events = session_events(&session);
    let step = Arc::new(Recorder::always(BotStatus::Fail).with_delay(20));
    let script = script_of(ScriptSettings::default(), vec![step.clone()]);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        control.set_worker_target(4);
    });
    let summary = session
        .run(RunRequest::new(script, numbered_records(40)))
        .await
        .unwrap();

    assert_eq!(summary.tested, 40);
    assert!(step.peak() > 1 && step.peak() <= 4, "peak was {}", step.peak());
    assert!(drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, RunEvent::WorkersChanged { target: 4, .. })));
}

fn session_events(session: &RunSession) -> tokio::sync::broadcast::Receiver<RunEvent> {
    session.app().events.subscribe()
}

fn drain_events(events: &mut tokio::sync::broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}
