//! Test result model, aggregation and report rendering.
//!
//! Raw stdout/stderr from remote runs pass through [`normalize_output`] which
//! keeps diagnostic payloads intact while collapsing runtime-internal stack
//! frames.

mod aggregate;
mod model;
pub mod normalizer;
mod render;

pub use aggregate::combine;
pub use model::{split_output_lines, ExecutionResult, FailureKind, FailureRecord, TestCounts};
pub use normalizer::{
    clean_stack_trace, normalize_output, parse_stack_frame, NormalizerConfig, NormalizerMode,
    OutputNormalizer,
};
pub use render::{
    render_failure_block, render_json_report, render_report, render_summary_line,
    FAILURE_SEPARATOR_WIDTH, STDERR_BEGIN, STDERR_END, STDOUT_BEGIN, STDOUT_END,
};
