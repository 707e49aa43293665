//! Request/response hooks implemented by the embedding application
//!
//! One-way notifications go through [`crate::runner::events::EventBus`];
//! this trait covers the calls where the runner needs an answer or a side
//! effect from the host.

use async_trait::async_trait;

use crate::domain::hit::Hit;
use crate::domain::proxy::ProxyEndpoint;
use crate::runner::error::HostError;
use crate::runner::script::CustomInput;

pub type HostAction = Box<dyn FnOnce() + Send>;

#[async_trait]
pub trait RunHost: Send + Sync {
    /// Values for the script's custom inputs, as `(variable, value)`.
    /// The run blocks until this returns.
    async fn custom_inputs(&self, inputs: &[CustomInput]) -> Result<Vec<(String, String)>, HostError> {
        Ok(inputs
            .iter()
            .map(|input| (input.variable_name.clone(), input.default_value.clone()))
            .collect())
    }

    /// Fresh proxy list; `None` re-reads the run's own proxy source
    async fn reload_proxies(&self) -> Result<Option<Vec<ProxyEndpoint>>, HostError> {
        Ok(None)
    }

    async fn save_hit(&self, _hit: &Hit) -> Result<(), HostError> {
        Ok(())
    }

    /// Number of records consumed so far, for resuming later
    async fn save_progress(&self, _position: usize) -> Result<(), HostError> {
        Ok(())
    }

    /// Runs `action` on the host's own thread; inline by default.
    /// Hit notifications are emitted through this hook.
    fn dispatch(&self, action: HostAction) {
        action();
    }
}

/// Host that accepts defaults for everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHost;

#[async_trait]
impl RunHost for NullHost {}
