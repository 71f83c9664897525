use crate::model::ExecutionResult;

/// Merges per-submission results in submission order.
///
/// `None` entries are submissions that produced no result at all; they are
/// skipped rather than counted as empty runs.
pub fn combine<I>(results: I) -> ExecutionResult
where
    I: IntoIterator<Item = Option<ExecutionResult>>,
{
    results
        .into_iter()
        .flatten()
        .fold(ExecutionResult::default(), |mut combined, result| {
            combined.counts += result.counts;
            combined.stdout_lines.extend(result.stdout_lines);
            combined.stderr_lines.extend(result.stderr_lines);
            combined.failures.extend(result.failures);
            combined
        })
}
