use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub(crate) const DEFAULT_PORT_FILES: [&str; 2] = [".nrepl-port", ".shadow-cljs/nrepl.port"];

pub(crate) fn read_port_file(path: &Path) -> Result<u16> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read port file {}", path.display()))?;
    let trimmed = raw.trim();
    let port = trimmed.parse::<u16>().with_context(|| {
        format!(
            "port file {} does not hold a port number: '{trimmed}'",
            path.display()
        )
    })?;
    if port == 0 {
        bail!("port file {} holds port 0", path.display());
    }
    Ok(port)
}

/// Reads the explicit port file, or the first default port file under `root`.
pub(crate) fn discover_port(root: &Path, explicit: Option<&Path>) -> Result<Option<u16>> {
    if let Some(path) = explicit {
        return read_port_file(path).map(Some);
    }
    for candidate in DEFAULT_PORT_FILES {
        let path: PathBuf = root.join(candidate);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "using port file");
            return read_port_file(&path).map(Some);
        }
    }
    Ok(None)
}
