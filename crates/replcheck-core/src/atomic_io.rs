use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp_ms;

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn sibling_temp_path(parent_dir: &Path, path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("replcheck-report");
    parent_dir.join(format!(
        ".{file_name}.tmp-{}-{}-{}",
        std::process::id(),
        current_unix_timestamp_ms(),
        TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Writes a report file through a sibling temp file and a rename, so a reader
/// tailing the destination sees either the previous report or the new one.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("report path cannot be empty");
    }
    if path.is_dir() {
        bail!("report path '{}' is a directory", path.display());
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create report directory {}", parent_dir.display()))?;

    let temp_path = sibling_temp_path(parent_dir, path);
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write temporary report {}", temp_path.display()))?;
    if let Err(error) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(error).with_context(|| {
            format!(
                "failed to move temporary report {} into {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
