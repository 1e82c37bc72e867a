//! Rendering of harness results.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::result::TestResult;
use crate::sampler::Sample;

/// Arithmetic mean of sample usage; zero for an empty series.
pub fn average_usage(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples.iter().map(|sample| sample.usage).sum();
    total / samples.len() as f64
}

/// Highest recorded usage; zero for an empty series.
pub fn peak_usage(samples: &[Sample]) -> f64 {
    samples
        .iter()
        .map(|sample| sample.usage)
        .fold(0.0, f64::max)
}

fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    if millis >= 60_000 {
        format!("{}m{:.3}s", millis / 60_000, (millis % 60_000) as f64 / 1000.0)
    } else {
        format!("{:.3}s", millis as f64 / 1000.0)
    }
}

/// Deterministic text summary of a run.
pub fn render_summary(results: &[TestResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Test Summary ===");
    let _ = writeln!(out);

    for result in results {
        let _ = writeln!(out, "Test: {}", result.name);
        let _ = writeln!(out, "  Duration: {}", format_duration(result.duration()));
        let _ = writeln!(out, "  Success: {}", result.success);
        if let Some(error) = &result.error {
            let _ = writeln!(out, "  Error: {error}");
        }
        let _ = writeln!(
            out,
            "  Average CPU Usage: {:.2}% ({} samples)",
            average_usage(&result.samples),
            result.samples.len()
        );
        if !result.metrics.is_empty() {
            let _ = writeln!(out, "  Metrics:");
            for (key, value) in result.metrics.sorted() {
                let _ = writeln!(out, "    {key}: {value}");
            }
        }
        let _ = writeln!(out);
    }

    let passed = results.iter().filter(|result| result.success).count();
    let _ = writeln!(out, "{passed}/{} tests passed", results.len());
    out
}

/// Browser details captured once per run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvironmentInfo {
    pub product: String,
    pub revision: String,
    pub user_agent: String,
    /// Command line as reported by the running browser.
    pub command_line: Vec<String>,
    pub gpu_vendor: Option<String>,
    pub gpu_device: Option<String>,
    pub gpu_driver_version: Option<String>,
    pub gpu_feature_status: BTreeMap<String, String>,
    pub flags: Vec<String>,
}

/// Environment block shown before any test runs.
pub fn render_environment(info: &EnvironmentInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Browser: {} ({})", info.product, info.revision);
    let _ = writeln!(out, "User agent: {}", info.user_agent);
    let _ = writeln!(out, "Flags: {}", info.flags.join(" "));
    if !info.command_line.is_empty() {
        let _ = writeln!(out, "Commandline: {}", info.command_line.join(" "));
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "GPU Information:");
    if info.gpu_vendor.is_none() && info.gpu_device.is_none() {
        let _ = writeln!(out, "  GPU devices not available");
    } else {
        let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "unknown".into());
        let _ = writeln!(out, "  GPU Vendor: {}", field(&info.gpu_vendor));
        let _ = writeln!(out, "  GPU Device: {}", field(&info.gpu_device));
        let _ = writeln!(out, "  GPU Driver Version: {}", field(&info.gpu_driver_version));
    }
    let _ = writeln!(out);

    if !info.gpu_feature_status.is_empty() {
        let _ = writeln!(out, "GPU Feature Status:");
        for (feature, status) in &info.gpu_feature_status {
            let _ = writeln!(out, "  {feature}: {status}");
        }
        let _ = writeln!(out);
    }
    out
}

#[derive(Debug, Serialize)]
struct ResultSummary<'a> {
    #[serde(flatten)]
    result: &'a TestResult,
    average_usage: f64,
    peak_usage: f64,
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    generated_at: DateTime<Utc>,
    version: &'static str,
    environment: &'a EnvironmentInfo,
    results: Vec<ResultSummary<'a>>,
}

/// Write the run as pretty-printed JSON to `path`.
pub fn write_json_report(
    path: &Path,
    environment: &EnvironmentInfo,
    results: &[TestResult],
) -> Result<()> {
    let report = RunReport {
        generated_at: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        environment,
        results: results
            .iter()
            .map(|result| ResultSummary {
                result,
                average_usage: average_usage(&result.samples),
                peak_usage: peak_usage(&result.samples),
            })
            .collect(),
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
    }
    let mut rendered = serde_json::to_string_pretty(&report)?;
    rendered.push('\n');
    fs::write(path, rendered)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}
