//! Tool surface exposed to the reasoner.
//!
//! The tool set is a closed enum: the reasoner addresses tools by name, names
//! parse into [`ToolId`], and anything that does not parse is answered with an
//! `UNKNOWN_TOOL` result instead of reaching a handler or a circuit breaker.
//! Handlers implement [`ToolHandler`] and are registered on the
//! [`ToolDispatcher`](dispatcher::ToolDispatcher) per id.

mod cache;
mod dispatcher;

pub use cache::{ToolCacheConfig, ToolResultCache};
pub use dispatcher::{
    DispatchOutcome, ToolDispatcher, ToolDispatcherBuilder, ToolProfile, ToolSetupError,
};

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use conductor_core::ToolSpec;

/// Identifier of a telemetry tool the reasoner may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    /// Latest observation snapshot for one station.
    CurrentConditions,
    /// Statistic over a metric within a trailing window.
    AggregateMetrics,
    /// Model-based projection of a metric from recent history.
    RunForecast,
}

impl ToolId {
    /// Every tool, in the order they are advertised to the reasoner.
    pub const ALL: [ToolId; 3] = [
        ToolId::CurrentConditions,
        ToolId::AggregateMetrics,
        ToolId::RunForecast,
    ];

    /// Wire name of the tool.
    pub fn name(&self) -> &'static str {
        match self {
            ToolId::CurrentConditions => "current_conditions",
            ToolId::AggregateMetrics => "aggregate_metrics",
            ToolId::RunForecast => "run_forecast",
        }
    }

    /// Parse a wire name. `None` means the name is outside the closed set.
    pub fn parse(name: &str) -> Option<ToolId> {
        match name {
            "current_conditions" => Some(ToolId::CurrentConditions),
            "aggregate_metrics" => Some(ToolId::AggregateMetrics),
            "run_forecast" => Some(ToolId::RunForecast),
            _ => None,
        }
    }

    /// One-line description advertised to the reasoner.
    pub fn description(&self) -> &'static str {
        match self {
            ToolId::CurrentConditions => {
                "Latest observed conditions (temperature, humidity, wind) for a named station"
            }
            ToolId::AggregateMetrics => {
                "Aggregate statistic for one metric over a trailing window of hours"
            }
            ToolId::RunForecast => {
                "Projected values for one metric over a forward horizon, from recent history"
            }
        }
    }

    /// JSON Schema describing the tool's arguments.
    pub fn parameter_schema(&self) -> Value {
        match self {
            ToolId::CurrentConditions => json!({
                "type": "object",
                "properties": {
                    "station": {
                        "type": "string",
                        "description": "Station identifier, e.g. \"KSEA\""
                    },
                    "units": {
                        "type": "string",
                        "enum": ["metric", "imperial"],
                        "description": "Unit system for the response (default metric)"
                    }
                },
                "required": ["station"],
                "additionalProperties": false
            }),
            ToolId::AggregateMetrics => json!({
                "type": "object",
                "properties": {
                    "metric": {
                        "type": "string",
                        "description": "Metric name, e.g. \"temperature_c\""
                    },
                    "window_hours": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": 720,
                        "description": "Trailing window size in hours"
                    },
                    "statistic": {
                        "type": "string",
                        "enum": ["min", "max", "mean", "p95"]
                    }
                },
                "required": ["metric", "window_hours", "statistic"],
                "additionalProperties": false
            }),
            ToolId::RunForecast => json!({
                "type": "object",
                "properties": {
                    "metric": {
                        "type": "string",
                        "description": "Metric name to project"
                    },
                    "horizon_hours": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": 168,
                        "description": "How far ahead to project, in hours"
                    },
                    "history": {
                        "type": "array",
                        "items": { "type": "number" },
                        "minItems": 2,
                        "description": "Recent hourly values, oldest first"
                    }
                },
                "required": ["metric", "horizon_hours", "history"],
                "additionalProperties": false
            }),
        }
    }

    /// Full advertisement record for the reasoner's tool list.
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameter_schema(),
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A callable tool implementation.
///
/// Handlers receive already-validated arguments and return a JSON payload.
/// Any error is treated as an execution failure of this one call; it is
/// recorded on the tool's breaker but never surfaced as a panic or a thrown
/// error to the orchestration loop.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync,
{
    async fn call(&self, arguments: Value) -> anyhow::Result<Value> {
        (self.0)(arguments).await
    }
}

/// Wrap a closure returning a boxed future as a [`ToolHandler`].
pub fn handler_fn<F>(f: F) -> impl ToolHandler
where
    F: Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync,
{
    FnHandler(f)
}
