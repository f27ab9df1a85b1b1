//! Append-only security event log.
//!
//! Events are JSON lines in `<events_dir>/security-YYYYMMDD-HHMMSS.log`,
//! rotated by size (default 10 MiB, five generations kept) with a
//! `security-latest.log` symlink pointing at the active file. Emission is
//! best-effort throughout: a sink failure never fails the operation that
//! produced the event.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_GENERATIONS: usize = 5;

const LATEST_ALIAS: &str = "security-latest.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
    Critical,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub category: String,
    pub event_type: String,
    pub message: String,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, Value>,
    pub success: bool,
}

impl SecurityEvent {
    pub fn new(
        level: EventLevel,
        category: impl Into<String>,
        event_type: impl Into<String>,
        message: impl Into<String>,
        component: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category: category.into(),
            event_type: event_type.into(),
            message: message.into(),
            component: component.into(),
            plugin: None,
            user: None,
            ip: None,
            details: HashMap::new(),
            success,
        }
    }

    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

type Callback = Arc<dyn Fn(&SecurityEvent) + Send + Sync>;

struct ActiveFile {
    path: PathBuf,
    file: File,
    written: u64,
}

struct SinkInner {
    dir: PathBuf,
    active: Option<ActiveFile>,
    max_bytes: u64,
    max_generations: usize,
}

/// Process-wide security event sink.
pub struct SecurityEventSink {
    inner: Mutex<SinkInner>,
    callbacks: RwLock<HashMap<String, Vec<Callback>>>,
}

impl SecurityEventSink {
    pub fn new(events_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                dir: events_dir.into(),
                active: None,
                max_bytes: DEFAULT_MAX_FILE_BYTES,
                max_generations: DEFAULT_MAX_GENERATIONS,
            }),
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_rotation(self, max_bytes: u64, max_generations: usize) -> Self {
        {
            let mut inner = self.inner.lock();
            inner.max_bytes = max_bytes;
            inner.max_generations = max_generations.max(1);
        }
        self
    }

    /// Register a callback fired for every event of `event_type`.
    pub fn on_event(&self, event_type: impl Into<String>, callback: Callback) {
        self.callbacks
            .write()
            .entry(event_type.into())
            .or_default()
            .push(callback);
    }

    /// Record an event. Never returns an error; write failures are logged
    /// to the diagnostic log and swallowed.
    pub fn emit(&self, event: SecurityEvent) {
        if let Err(e) = self.write_line(&event) {
            warn!(error = %e, event_type = %event.event_type, "security event write failed");
        }

        let callbacks = self.callbacks.read();
        if let Some(registered) = callbacks.get(&event.event_type) {
            for callback in registered {
                callback(&event);
            }
        }
    }

    /// Path of the file currently being written, if any.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.inner.lock().active.as_ref().map(|a| a.path.clone())
    }

    fn write_line(&self, event: &SecurityEvent) -> std::io::Result<()> {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => return Err(std::io::Error::other(e)),
        };

        let mut inner = self.inner.lock();

        let needs_new = match &inner.active {
            None => true,
            Some(active) => active.written + line.len() as u64 + 1 > inner.max_bytes,
        };
        if needs_new {
            rotate(&mut inner)?;
        }

        let active = inner.active.as_mut().expect("rotate sets active");
        active.file.write_all(line.as_bytes())?;
        active.file.write_all(b"\n")?;
        active.written += line.len() as u64 + 1;
        Ok(())
    }
}

fn rotate(inner: &mut SinkInner) -> std::io::Result<()> {
    fs::create_dir_all(&inner.dir)?;

    let name = format!("security-{}.log", Utc::now().format("%Y%m%d-%H%M%S"));
    let path = inner.dir.join(&name);
    // Rotation twice within one second lands on the same file; picking up
    // its current length keeps the size accounting truthful.
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let written = file.metadata().map(|m| m.len()).unwrap_or(0);

    update_latest_alias(&inner.dir, &name);
    prune_generations(&inner.dir, inner.max_generations);

    inner.active = Some(ActiveFile {
        path,
        file,
        written,
    });
    Ok(())
}

fn update_latest_alias(dir: &Path, target: &str) {
    let alias = dir.join(LATEST_ALIAS);
    let _ = fs::remove_file(&alias);
    #[cfg(unix)]
    {
        let _ = std::os::unix::fs::symlink(target, &alias);
    }
    #[cfg(not(unix))]
    {
        let _ = fs::write(&alias, target);
    }
}

fn prune_generations(dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let mut logs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("security-") && n.ends_with(".log") && n != LATEST_ALIAS)
                .unwrap_or(false)
        })
        .collect();

    // Timestamped names sort chronologically.
    logs.sort();
    while logs.len() > keep {
        let oldest = logs.remove(0);
        let _ = fs::remove_file(oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(event_type: &str) -> SecurityEvent {
        SecurityEvent::new(
            EventLevel::Info,
            "plugin",
            event_type,
            "test event",
            "runtime",
            true,
        )
    }

    #[test]
    fn test_events_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SecurityEventSink::new(dir.path());

        sink.emit(event("plugin_loaded").plugin("aws").detail("version", "1.0.0"));
        sink.emit(event("plugin_unloaded"));

        let path = sink.current_path().expect("active file");
        let contents = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: SecurityEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, "plugin_loaded");
        assert_eq!(first.plugin.as_deref(), Some("aws"));
        assert_eq!(first.details["version"], "1.0.0");
    }

    #[test]
    fn test_rotation_by_size_keeps_generation_cap() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny cap: every batch rotates. File names have one-second
        // resolution, so batches are spaced across seconds.
        let sink = SecurityEventSink::new(dir.path()).with_rotation(64, 3);

        for batch in 0..5 {
            sink.emit(event(&format!("event_{}", batch)));
            std::thread::sleep(std::time::Duration::from_millis(1100));
        }

        let logs: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("security-") && name != LATEST_ALIAS
            })
            .collect();
        assert!(
            (1..=3).contains(&logs.len()),
            "kept {} generations",
            logs.len()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_latest_alias_tracks_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SecurityEventSink::new(dir.path());
        sink.emit(event("auth_success"));

        let alias = dir.path().join(LATEST_ALIAS);
        let target = fs::read_link(&alias).expect("symlink");
        assert_eq!(
            dir.path().join(target),
            sink.current_path().unwrap(),
            "alias must point at the active file"
        );
    }

    #[test]
    fn test_callbacks_fire_per_event_type() {
        let sink = SecurityEventSink::new(tempfile::tempdir().unwrap().path());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        sink.on_event(
            "auth_failure",
            Arc::new(move |e| {
                assert!(!e.success || e.event_type == "auth_failure");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sink.emit(event("auth_failure"));
        sink.emit(event("auth_success"));
        sink.emit(event("auth_failure"));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_emit_survives_unwritable_directory() {
        // Emission must not panic or error even if the directory can
        // never be created.
        let sink = SecurityEventSink::new("/dev/null/not-a-dir");
        sink.emit(event("plugin_loaded"));
    }
}
