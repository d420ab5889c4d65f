//! Demo telemetry handlers backing the `conductor` binary.
//!
//! These stand in for a real telemetry backend: a canned station table, a
//! deterministic synthetic metric series, and a least-squares trend
//! projection. Tool handlers belong to the embedding application, so they
//! live here rather than in the runtime, which only sees the `ToolHandler`
//! trait.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use conductor_runtime::{
    BackoffPolicy, CircuitBreakerConfig, RetryOptions, ToolHandler, ToolProfile, ToolSettings,
    ToolsConfig,
};

// (station, temperature C, wind kph, sky)
const STATIONS: &[(&str, f64, f64, &str)] = &[
    ("KSEA", 18.2, 11.0, "overcast"),
    ("KPDX", 21.4, 8.0, "partly cloudy"),
    ("KSFO", 16.9, 19.0, "fog"),
    ("KAUS", 37.1, 6.0, "clear"),
    ("KDEN", 29.3, 14.0, "thunderstorms nearby"),
];

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
enum Units {
    #[default]
    Metric,
    Imperial,
}

#[derive(Deserialize)]
struct ConditionsArgs {
    station: String,
    #[serde(default)]
    units: Units,
}

/// Canned current-conditions lookup over a fixed station table.
///
/// Unknown stations fail the handler, which is exactly what exercises the
/// dispatcher's failure path and the per-tool circuit breaker in a live demo.
pub struct StationConditions;

#[async_trait]
impl ToolHandler for StationConditions {
    async fn call(&self, arguments: Value) -> anyhow::Result<Value> {
        let args: ConditionsArgs = serde_json::from_value(arguments)?;
        let station = args.station.to_ascii_uppercase();
        let (_, temp_c, wind_kph, sky) = STATIONS
            .iter()
            .find(|(name, ..)| *name == station)
            .ok_or_else(|| anyhow::anyhow!("no telemetry feed for station {station}"))?;

        Ok(match args.units {
            Units::Metric => json!({
                "station": station,
                "temperature_c": temp_c,
                "wind_kph": wind_kph,
                "sky": sky,
            }),
            Units::Imperial => json!({
                "station": station,
                "temperature_f": round1(temp_c * 9.0 / 5.0 + 32.0),
                "wind_mph": round1(wind_kph * 0.621_371),
                "sky": sky,
            }),
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum Statistic {
    Min,
    Max,
    Mean,
    P95,
}

#[derive(Deserialize)]
struct AggregateArgs {
    metric: String,
    window_hours: u32,
    statistic: Statistic,
}

// Daily swing around a per-metric baseline; hour 0 is the window start.
fn sample(metric: &str, hour: u32) -> f64 {
    let (base, swing) = match metric {
        "temperature_c" => (16.0, 7.5),
        "wind_kph" => (14.0, 9.0),
        "humidity_pct" => (62.0, 18.0),
        "pressure_hpa" => (1013.0, 4.0),
        _ => (10.0, 5.0),
    };
    base + swing * (hour as f64 * std::f64::consts::TAU / 24.0).sin()
}

fn percentile95(series: &mut [f64]) -> f64 {
    series.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((series.len() as f64) * 0.95).ceil() as usize;
    series[rank.saturating_sub(1).min(series.len() - 1)]
}

/// Aggregation over a deterministic synthetic hourly series.
///
/// Determinism keeps repeated questions consistent with each other and makes
/// the result cache observable when enabled.
pub struct MetricAggregator;

#[async_trait]
impl ToolHandler for MetricAggregator {
    async fn call(&self, arguments: Value) -> anyhow::Result<Value> {
        let args: AggregateArgs = serde_json::from_value(arguments)?;
        let mut series: Vec<f64> = (0..args.window_hours)
            .map(|hour| sample(&args.metric, hour))
            .collect();
        let value = match args.statistic {
            Statistic::Min => series.iter().copied().fold(f64::INFINITY, f64::min),
            Statistic::Max => series.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Statistic::Mean => series.iter().sum::<f64>() / series.len() as f64,
            Statistic::P95 => percentile95(&mut series),
        };

        Ok(json!({
            "metric": args.metric,
            "statistic": args.statistic,
            "window_hours": args.window_hours,
            "value": round1(value),
        }))
    }
}

#[derive(Deserialize)]
struct ForecastArgs {
    metric: String,
    horizon_hours: u32,
    history: Vec<f64>,
}

// Slope and intercept of the least-squares line through (0..n, history).
fn least_squares(history: &[f64]) -> (f64, f64) {
    let n = history.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = history.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in history.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    let slope = num / den;
    (slope, mean_y - slope * mean_x)
}

/// Linear trend projection over a supplied history.
pub struct TrendForecaster;

#[async_trait]
impl ToolHandler for TrendForecaster {
    async fn call(&self, arguments: Value) -> anyhow::Result<Value> {
        let args: ForecastArgs = serde_json::from_value(arguments)?;
        if args.history.len() < 2 {
            anyhow::bail!(
                "history needs at least 2 points, got {}",
                args.history.len()
            );
        }
        let (slope, intercept) = least_squares(&args.history);
        let last_x = args.history.len() as f64 - 1.0;
        let projected: Vec<f64> = (1..=args.horizon_hours)
            .map(|h| round1(intercept + slope * (last_x + h as f64)))
            .collect();

        Ok(json!({
            "metric": args.metric,
            "slope_per_hour": round1(slope),
            "history_points": args.history.len(),
            "projected": projected,
        }))
    }
}

/// Contrasting per-tool policies used when no config file is given.
///
/// The station feed gets a touchy breaker and a retry budget (it fails on
/// unknown stations), while aggregation is trusted with a higher threshold
/// and no retries. Forecasting rides on the defaults.
pub fn demo_tools() -> ToolsConfig {
    let mut per_tool = BTreeMap::new();
    per_tool.insert(
        "current_conditions".to_string(),
        ToolSettings {
            breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(20),
                half_open_probes: 1,
            },
            call: ToolProfile {
                call_timeout: Duration::from_secs(2),
                retry: RetryOptions::new(
                    1,
                    BackoffPolicy::new(Duration::from_millis(250), Duration::from_millis(100)),
                ),
            },
        },
    );
    per_tool.insert(
        "aggregate_metrics".to_string(),
        ToolSettings {
            breaker: CircuitBreakerConfig {
                failure_threshold: 4,
                reset_timeout: Duration::from_secs(10),
                half_open_probes: 2,
            },
            call: ToolProfile {
                call_timeout: Duration::from_secs(5),
                retry: RetryOptions::none(),
            },
        },
    );

    ToolsConfig {
        default: ToolSettings::default(),
        per_tool,
    }
}
