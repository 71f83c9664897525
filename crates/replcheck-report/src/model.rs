use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use replcheck_core::EdnValue;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `TestCounts` holding the per-run assertion counters.
pub struct TestCounts {
    pub total: u64,
    pub pass: u64,
    pub fail: u64,
    pub error: u64,
}

impl TestCounts {
    /// Reads counters from a summary map; absent counters are zero.
    ///
    /// Returns `None` when the map carries none of the counter keys.
    pub fn from_edn(value: &EdnValue) -> Option<Self> {
        let read = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| value.get(key))
                .and_then(EdnValue::as_i64)
                .map(|count| count.max(0) as u64)
        };
        let total = read(&["test", "total"]);
        let pass = read(&["pass"]);
        let fail = read(&["fail"]);
        let error = read(&["error"]);
        if total.is_none() && pass.is_none() && fail.is_none() && error.is_none() {
            return None;
        }
        Some(Self {
            total: total.unwrap_or(0),
            pass: pass.unwrap_or(0),
            fail: fail.unwrap_or(0),
            error: error.unwrap_or(0),
        })
    }

    pub fn failed_or_errored(&self) -> u64 {
        self.fail.saturating_add(self.error)
    }
}

impl Add for TestCounts {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            total: self.total.saturating_add(other.total),
            pass: self.pass.saturating_add(other.pass),
            fail: self.fail.saturating_add(other.fail),
            error: self.error.saturating_add(other.error),
        }
    }
}

impl AddAssign for TestCounts {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Enumerates supported `FailureKind` values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fail,
    Error,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().trim_start_matches(':').to_ascii_lowercase().as_str() {
            "fail" | "failure" => Some(Self::Fail),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One failed or errored test case reported by the remote collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    #[serde(default)]
    pub context: Vec<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub expected: String,
    pub actual: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

impl FailureRecord {
    pub fn from_edn(value: &EdnValue) -> Option<Self> {
        let kind = match value.get("kind")? {
            EdnValue::Keyword(raw) | EdnValue::String(raw) => FailureKind::parse(raw)?,
            _ => return None,
        };
        let text = |key: &str| {
            value
                .get(key)
                .filter(|item| !item.is_nil())
                .map(EdnValue::to_display_text)
        };
        let context = match value.get("context") {
            Some(EdnValue::String(single)) if !single.is_empty() => vec![single.clone()],
            Some(items) => items
                .as_items()
                .unwrap_or_default()
                .iter()
                .map(EdnValue::to_display_text)
                .filter(|entry| !entry.is_empty())
                .collect(),
            None => Vec::new(),
        };
        Some(Self {
            kind,
            context,
            name: text("name").unwrap_or_else(|| "unknown".to_string()),
            message: text("message").filter(|message| !message.trim().is_empty()),
            expected: text("expected").unwrap_or_default(),
            actual: text("actual").unwrap_or_default(),
            file: text("file"),
            line: value
                .get("line")
                .and_then(EdnValue::as_i64)
                .and_then(|line| u64::try_from(line).ok()),
        })
    }

    /// `name (file:line)` when a location is known.
    pub fn location(&self) -> String {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => format!("{} ({file}:{line})", self.name),
            (Some(file), None) => format!("{} ({file})", self.name),
            _ => self.name.clone(),
        }
    }
}

/// Outcome of one or more test submissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub counts: TestCounts,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub failures: Vec<FailureRecord>,
}

impl ExecutionResult {
    /// Decodes an inline summary `{:test :pass :fail :error :out :err}`.
    pub fn from_summary(value: &EdnValue) -> Option<Self> {
        let counts = TestCounts::from_edn(value)?;
        let lines = |key: &str| {
            value
                .get(key)
                .and_then(EdnValue::as_str)
                .map(split_output_lines)
                .unwrap_or_default()
        };
        let failures = value
            .get("failures")
            .and_then(EdnValue::as_items)
            .map(|items| items.iter().filter_map(FailureRecord::from_edn).collect())
            .unwrap_or_default();
        Some(Self {
            counts,
            stdout_lines: lines("out"),
            stderr_lines: lines("err"),
            failures,
        })
    }

    /// Decodes a collector slot value `{:counts {...} :failures [...]}`.
    pub fn from_collector_slot(value: &EdnValue) -> Option<Self> {
        let counts = value.get("counts").and_then(TestCounts::from_edn)?;
        let failures = value
            .get("failures")
            .and_then(EdnValue::as_items)
            .map(|items| items.iter().filter_map(FailureRecord::from_edn).collect())
            .unwrap_or_default();
        Some(Self {
            counts,
            failures,
            ..Self::default()
        })
    }

    /// Status for the caller: zero when every test passed.
    pub fn exit_status(&self) -> u64 {
        self.counts.failed_or_errored()
    }

    pub fn stdout_text(&self) -> String {
        self.stdout_lines.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr_lines.join("\n")
    }
}

/// Splits captured output into lines; empty text yields no lines.
pub fn split_output_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}
