use serde::Serialize;

use crate::model::{ExecutionResult, FailureRecord};
use crate::normalizer::{normalize_output, NormalizerConfig};

pub const FAILURE_SEPARATOR_WIDTH: usize = 60;
pub const STDOUT_BEGIN: &str = "===== STDOUT BEGIN =====";
pub const STDOUT_END: &str = "===== STDOUT END =====";
pub const STDERR_BEGIN: &str = "===== STDERR BEGIN =====";
pub const STDERR_END: &str = "===== STDERR END =====";

fn render_failure(failure: &FailureRecord, lines: &mut Vec<String>) {
    lines.push(format!("{} in {}", failure.kind.label(), failure.location()));
    if !failure.context.is_empty() {
        lines.push(format!("context: {}", failure.context.join(" > ")));
    }
    if let Some(message) = &failure.message {
        lines.push(message.clone());
    }
    lines.push(format!("expected: {}", failure.expected));
    lines.push(format!("  actual: {}", failure.actual));
}

/// Renders structured failures as a separated block; empty when there are
/// no failures.
pub fn render_failure_block(failures: &[FailureRecord]) -> Vec<String> {
    if failures.is_empty() {
        return Vec::new();
    }
    let separator = "=".repeat(FAILURE_SEPARATOR_WIDTH);
    let mut lines = vec![separator.clone()];
    for (index, failure) in failures.iter().enumerate() {
        if index > 0 {
            lines.push(String::new());
        }
        render_failure(failure, &mut lines);
    }
    lines.push(separator);
    lines
}

pub fn render_summary_line(result: &ExecutionResult) -> String {
    let counts = result.counts;
    format!(
        "{} tests, {} passed, {} failures, {} errors.",
        counts.total, counts.pass, counts.fail, counts.error
    )
}

/// Marker-delimited text report: normalized stdout followed by the failure
/// block, then normalized stderr, then the summary line.
pub fn render_report(result: &ExecutionResult, config: &NormalizerConfig) -> String {
    let mut lines = vec![STDOUT_BEGIN.to_string()];
    let stdout = normalize_output(&result.stdout_text(), config);
    if !stdout.is_empty() {
        lines.push(stdout);
    }
    lines.extend(render_failure_block(&result.failures));
    lines.push(STDOUT_END.to_string());
    lines.push(STDERR_BEGIN.to_string());
    let stderr = normalize_output(&result.stderr_text(), config);
    if !stderr.is_empty() {
        lines.push(stderr);
    }
    lines.push(STDERR_END.to_string());
    lines.push(render_summary_line(result));
    let mut report = lines.join("\n");
    report.push('\n');
    report
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    exit_status: u64,
    #[serde(flatten)]
    result: &'a ExecutionResult,
}

/// Pretty JSON form of a result for machine consumers.
pub fn render_json_report(result: &ExecutionResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        exit_status: result.exit_status(),
        result,
    })
}
