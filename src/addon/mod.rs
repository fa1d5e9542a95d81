//! Flow hook pipeline.
//!
//! Addons observe flows at fixed lifecycle points:
//!
//! 1. [`Addon::running`] once, before any traffic. An error here aborts startup.
//! 2. [`Addon::request`] for every client request.
//! 3. [`Addon::response`] for every completed exchange, before the response
//!    is returned to the client.
//! 4. [`Addon::done`] once, on shutdown.
//!
//! The same pipeline serves live traffic and flows replayed from a dump.

pub mod permission;

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::Result;
use crate::flow::Flow;

/// A flow observer.
pub trait Addon: Send + Sync {
    fn name(&self) -> &str;

    fn running(&self) -> Result<()> {
        Ok(())
    }

    fn request(&self, _flow: &Flow) {}

    fn response(&self, _flow: &Flow) -> Result<()> {
        Ok(())
    }

    fn done(&self) -> Result<()> {
        Ok(())
    }
}

/// Dispatches hooks to addons in registration order.
#[derive(Default)]
pub struct AddonManager {
    addons: Vec<Arc<dyn Addon>>,
}

impl AddonManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addon: Arc<dyn Addon>) {
        debug!("Addon loaded: {}", addon.name());
        self.addons.push(addon);
    }

    /// Run every addon's `running` hook, stopping at the first failure.
    pub fn running(&self) -> Result<()> {
        for addon in &self.addons {
            addon.running().inspect_err(|e| {
                error!("Addon {} failed to start: {}", addon.name(), e);
            })?;
        }
        Ok(())
    }

    pub fn request(&self, flow: &Flow) {
        for addon in &self.addons {
            addon.request(flow);
        }
    }

    /// Run every addon's `response` hook. Failures are logged, not propagated.
    pub fn response(&self, flow: &Flow) {
        for addon in &self.addons {
            if let Err(e) = addon.response(flow) {
                error!("Addon {} error on flow {}: {}", addon.name(), flow.id, e);
            }
        }
    }

    pub fn done(&self) {
        for addon in &self.addons {
            if let Err(e) = addon.done() {
                error!("Addon {} error during shutdown: {}", addon.name(), e);
            }
        }
    }
}

/// Logs every request and response at debug level.
pub struct EventLog;

impl Addon for EventLog {
    fn name(&self) -> &str {
        "eventlog"
    }

    fn request(&self, flow: &Flow) {
        debug!(
            "[{}] {} {}",
            flow.id,
            flow.request.method,
            flow.request.url()
        );
    }

    fn response(&self, flow: &Flow) -> Result<()> {
        if let Some(resp) = &flow.response {
            debug!(
                "[{}] {} {} -> {} ({} bytes)",
                flow.id,
                flow.request.method,
                flow.request.url(),
                resp.status_code,
                resp.content.len()
            );
        }
        Ok(())
    }
}
