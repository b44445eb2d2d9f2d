//! Inlet/outlet hook invocation for a single named plugin
//!
//! Picking and ordering the filters that apply to a request is up to the
//! caller (see [`Registry::filters_matching`]); this only runs one plugin's
//! hook.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn};

use crate::dispatch::WorkerPool;
use crate::error::{GatewayError, Result};
use crate::plugin::schema::PluginError;
use crate::registry::Registry;
use crate::state::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Inlet,
    Outlet,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Inlet => f.write_str("inlet"),
            Hook::Outlet => f.write_str("outlet"),
        }
    }
}

pub struct FilterInvoker {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    metrics: Arc<Metrics>,
    call_timeout: Option<Duration>,
}

impl FilterInvoker {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        metrics: Arc<Metrics>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            pool,
            metrics,
            call_timeout,
        }
    }

    pub async fn apply_inlet(
        &self,
        pipeline_id: &str,
        body: Value,
        user: Option<Value>,
    ) -> Result<Value> {
        self.apply(Hook::Inlet, pipeline_id, body, user).await
    }

    pub async fn apply_outlet(
        &self,
        pipeline_id: &str,
        body: Value,
        user: Option<Value>,
    ) -> Result<Value> {
        self.apply(Hook::Outlet, pipeline_id, body, user).await
    }

    pub async fn apply(
        &self,
        hook: Hook,
        pipeline_id: &str,
        body: Value,
        user: Option<Value>,
    ) -> Result<Value> {
        let module = self
            .registry
            .owning_module(pipeline_id)
            .ok_or_else(|| GatewayError::NotFound(pipeline_id.to_string()))?;

        let implemented = match hook {
            Hook::Inlet => module.capabilities.inlet,
            Hook::Outlet => module.capabilities.outlet,
        };
        if !implemented {
            debug!(module = %module.id, %hook, "No hook, passing body through");
            return Ok(body);
        }

        let span = info_span!("filter_hook", module = %module.id, %hook);
        let task_module = module.clone();
        let call = self.pool.run(move || {
            let _entered = span.enter();
            let valves = task_module.valves.current();
            let pipeline = task_module.pipeline();
            match hook {
                Hook::Inlet => pipeline.inlet(&valves, body, user.as_ref()),
                Hook::Outlet => pipeline.outlet(&valves, body, user.as_ref()),
            }
        });

        let result = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Plugin(PluginError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })),
            },
            None => call.await,
        }
        .and_then(|hooked| hooked.map_err(GatewayError::from));

        self.metrics.record_filter(result.is_ok());
        if let Err(e) = &result {
            warn!(module = %module.id, %hook, error = %e, "Filter hook failed");
        }
        result
    }
}
