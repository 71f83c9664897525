//! Line classifier that compacts raw test output.
//!
//! Diagnostic payloads that follow an `actual:` line are kept verbatim. Stack
//! dumps are buffered, stripped of runtime-internal frames, collapsed when
//! they recurse, and re-emitted under a short header.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const RECURSION_WINDOW: usize = 10;
const RECURSION_MIN_FRAMES: usize = 2 * RECURSION_WINDOW;
const RECURSION_SAMPLE: usize = 3;

static STACK_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:at\s+)?(?P<name>[A-Za-z_$][\w$<>*+!?'\-]*(?:[./$][\w$<>*+!?'\-]*)+)\s*\((?P<location>[^()]*)\)\s*$",
    )
    .expect("stack frame pattern")
});

fn default_internal_prefixes() -> Vec<String> {
    [
        "clojure.", "java.", "javax.", "jdk.", "sun.", "com.sun.", "nrepl.", "cider.", "shadow.",
        "cljs.", "goog.",
    ]
    .iter()
    .map(|prefix| prefix.to_string())
    .collect()
}

fn default_application_markers() -> Vec<String> {
    ["src/", "test/"]
        .iter()
        .map(|marker| marker.to_string())
        .collect()
}

/// Which frames count as runtime-internal noise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Qualified-name prefixes of frames to drop.
    #[serde(default = "default_internal_prefixes")]
    pub internal_prefixes: Vec<String>,
    /// Location substrings that mark a frame as application code; such frames
    /// are always kept.
    #[serde(default = "default_application_markers")]
    pub application_markers: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            internal_prefixes: default_internal_prefixes(),
            application_markers: default_application_markers(),
        }
    }
}

impl NormalizerConfig {
    fn is_internal(&self, name: &str) -> bool {
        self.internal_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    fn is_application_location(&self, location: &str) -> bool {
        self.application_markers
            .iter()
            .any(|marker| location.contains(marker.as_str()))
    }
}

/// A stack frame line split into its qualified name and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame<'a> {
    pub name: &'a str,
    pub location: &'a str,
}

pub fn parse_stack_frame(line: &str) -> Option<StackFrame<'_>> {
    let captures = STACK_FRAME.captures(line)?;
    Some(StackFrame {
        name: captures.name("name")?.as_str(),
        location: captures.name("location")?.as_str(),
    })
}

fn is_section_header(line: &str) -> bool {
    line.starts_with("Testing ")
}

fn is_failure_marker(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("FAIL in") || trimmed.starts_with("ERROR in")
}

fn is_summary(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("Ran ") && trimmed.contains(" tests containing ")
}

fn is_expected(line: &str) -> bool {
    line.trim_start().starts_with("expected:")
}

fn is_actual(line: &str) -> bool {
    line.trim_start().starts_with("actual:")
}

fn is_end_marker(line: &str) -> bool {
    line.trim().is_empty() || is_summary(line) || is_failure_marker(line) || is_section_header(line)
}

/// Enumerates the normalizer's line-classification modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizerMode {
    Normal,
    CapturingPayload,
    CapturingStackTrace,
}

#[derive(Debug)]
pub struct OutputNormalizer<'c> {
    config: &'c NormalizerConfig,
    mode: NormalizerMode,
    output: Vec<String>,
    frames: Vec<String>,
    pending_header: bool,
}

impl<'c> OutputNormalizer<'c> {
    pub fn new(config: &'c NormalizerConfig) -> Self {
        Self {
            config,
            mode: NormalizerMode::Normal,
            output: Vec::new(),
            frames: Vec::new(),
            pending_header: false,
        }
    }

    pub fn mode(&self) -> NormalizerMode {
        self.mode
    }

    fn emit(&mut self, line: &str) {
        self.output.push(line.to_string());
    }

    fn emit_spaced(&mut self, line: &str) {
        if self.output.last().is_some_and(|last| !last.is_empty()) {
            self.output.push(String::new());
        }
        self.emit(line);
    }

    pub fn push_line(&mut self, line: &str) {
        match self.mode {
            NormalizerMode::Normal => self.normal(line),
            NormalizerMode::CapturingPayload => {
                if parse_stack_frame(line).is_some() {
                    self.mode = NormalizerMode::CapturingStackTrace;
                    self.frames.push(line.to_string());
                } else if line.trim().is_empty() {
                    self.emit("");
                    self.mode = NormalizerMode::Normal;
                } else if is_end_marker(line) {
                    self.mode = NormalizerMode::Normal;
                    self.normal(line);
                } else {
                    self.emit(line);
                }
            }
            NormalizerMode::CapturingStackTrace => {
                if parse_stack_frame(line).is_some() || !is_end_marker(line) {
                    self.frames.push(line.to_string());
                } else {
                    self.flush_frames();
                    self.mode = NormalizerMode::Normal;
                    self.normal(line);
                }
            }
        }
    }

    fn normal(&mut self, line: &str) {
        if is_section_header(line) {
            self.emit_spaced(line);
            self.pending_header = false;
        } else if is_failure_marker(line) {
            self.emit_spaced(line);
            self.pending_header = true;
        } else if is_summary(line) {
            self.emit_spaced(line);
        } else if self.pending_header && !is_expected(line) && !is_actual(line) {
            if !line.trim().is_empty() {
                self.emit(line);
            }
        } else if is_expected(line) {
            self.emit(line);
            self.pending_header = false;
        } else if is_actual(line) {
            self.emit(line);
            self.pending_header = false;
            self.mode = NormalizerMode::CapturingPayload;
        } else if !line.trim().is_empty() {
            self.emit(line);
        }
    }

    fn flush_frames(&mut self) {
        let frames = std::mem::take(&mut self.frames);
        let cleaned = clean_stack_trace(&frames, self.config);
        self.output.extend(cleaned);
    }

    /// Flushes any buffered stack trace and returns the retained lines.
    pub fn finish(mut self) -> Vec<String> {
        if self.mode == NormalizerMode::CapturingStackTrace {
            self.flush_frames();
        }
        self.output
    }
}

/// Normalizes a block of raw output text.
pub fn normalize_output(text: &str, config: &NormalizerConfig) -> String {
    let mut normalizer = OutputNormalizer::new(config);
    for line in text.lines() {
        normalizer.push_line(line);
    }
    normalizer.finish().join("\n")
}

/// Cleans one buffered stack dump: strips `at ` prefixes, drops internal
/// frames that do not point into application sources, collapses recursion,
/// and prepends a header line.
pub fn clean_stack_trace(lines: &[String], config: &NormalizerConfig) -> Vec<String> {
    let mut filtered = 0_usize;
    let mut kept = Vec::with_capacity(lines.len());
    for line in lines {
        match parse_stack_frame(line) {
            Some(frame) => {
                if config.is_internal(frame.name) && !config.is_application_location(frame.location)
                {
                    filtered += 1;
                    continue;
                }
                kept.push(format!("  {} ({})", frame.name, frame.location));
            }
            None => kept.push(line.trim_end().to_string()),
        }
    }

    let collapsed = collapse_recursion(kept);
    let header = if filtered > 0 {
        format!("Stack trace (cleaned - {filtered} internal frames filtered):")
    } else {
        "Stack trace:".to_string()
    };
    tracing::debug!(
        frames = lines.len(),
        filtered,
        retained = collapsed.len(),
        "stack trace cleaned"
    );
    let mut cleaned = Vec::with_capacity(collapsed.len() + 1);
    cleaned.push(header);
    cleaned.extend(collapsed);
    cleaned
}

fn collapse_recursion(frames: Vec<String>) -> Vec<String> {
    if frames.len() < RECURSION_MIN_FRAMES {
        return frames;
    }
    let Some(start) = (0..=frames.len() - RECURSION_MIN_FRAMES).find(|&start| {
        frames[start..start + RECURSION_WINDOW]
            == frames[start + RECURSION_WINDOW..start + RECURSION_MIN_FRAMES]
    }) else {
        return frames;
    };
    let mut end = start + RECURSION_MIN_FRAMES;
    while end < frames.len() && frames[end] == frames[end - RECURSION_WINDOW] {
        end += 1;
    }

    let run_len = end - start;
    let repeats = run_len / RECURSION_WINDOW;
    let omitted = run_len - 2 * RECURSION_SAMPLE;
    let mut collapsed = Vec::with_capacity(frames.len() - omitted + 1);
    collapsed.extend_from_slice(&frames[..start + RECURSION_SAMPLE]);
    collapsed.push(format!(
        "  ... recursion detected: {RECURSION_WINDOW}-frame cycle repeated {repeats} times, {omitted} frames omitted ..."
    ));
    collapsed.extend_from_slice(&frames[end - RECURSION_SAMPLE..]);
    collapsed
}
