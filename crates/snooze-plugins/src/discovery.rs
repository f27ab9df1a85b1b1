//! Plugin discovery: executable regular files in the plugins directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{PluginError, Result};

/// List plugin basenames available in `plugins_dir`.
///
/// Directories are skipped, as are files without the executable bit (on
/// unix; elsewhere every regular file qualifies). The result is sorted
/// for stable output.
pub fn discover(plugins_dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(plugins_dir).map_err(|e| {
        debug!(dir = %plugins_dir.display(), error = %e, "plugins directory unreadable");
        PluginError::Io(e)
    })?;

    let mut names = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if !is_executable(&path, &meta) {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }

    names.sort();
    Ok(names)
}

/// Resolve a plugin name to its binary path, verifying it exists.
pub fn resolve(plugins_dir: &Path, name: &str) -> Result<PathBuf> {
    let path = plugins_dir.join(name);
    let meta = fs::metadata(&path).map_err(|_| PluginError::NotFound(name.to_string()))?;
    if !meta.is_file() || !is_executable(&path, &meta) {
        return Err(PluginError::NotFound(name.to_string()));
    }
    Ok(path)
}

#[cfg(unix)]
fn is_executable(_path: &Path, meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_path: &Path, _meta: &fs::Metadata) -> bool {
    true
}
