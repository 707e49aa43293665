//! Runner
//!
//! Everything between "here is a script, some records and some proxies" and
//! "here are the classified results": the proxy pool, the per-record
//! execution context, the worker state machine and the dispatcher.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod host;
pub mod outcomes;
pub mod proxy_pool;
pub mod script;
pub mod template;
pub mod throughput;
pub mod worker;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use context::{ExecutionContext, StepServices};
pub use dispatcher::{AppContext, RunControl, RunRequest, RunSession, RunSummary, StopReason};
pub use error::{HostError, RunError, StepError};
pub use events::{EventBus, LogEntry, LogLevel, RunEvent};
pub use host::{HostAction, NullHost, RunHost};
pub use outcomes::{BucketCounts, OutcomeBuckets};
pub use proxy_pool::{PoolCounts, ProxyHandle, ProxyPool};
pub use script::{CustomInput, Script, ScriptOutcome, ScriptSettings, ScriptStep};
pub use worker::ProxyPolicy;

/// Sleeps unless cancelled first; `false` when cancellation won
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}
