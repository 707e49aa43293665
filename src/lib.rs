//! bulkcheck - concurrent record checker
//!
//! Runs a small per-record script over a list of records (credentials or
//! any delimited lines), spreading the work over a resizable set of workers
//! and a rotating proxy pool, and sorts every record into Hit, Fail, Custom
//! or ToCheck.
//!
//! - [`domain`]: variables, records, proxies, statuses and hits
//! - [`runner`]: template engine, proxy pool, workers and the dispatcher
//! - [`steps`]: built-in script steps and the script loader
//! - [`infrastructure`]: configuration, logging, HTTP transport, sources

pub mod domain;
pub mod infrastructure;
pub mod runner;
pub mod steps;

pub use runner::{
    AppContext, RunControl, RunError, RunEvent, RunHost, RunRequest, RunSession, RunSummary,
    Script, StopReason,
};
