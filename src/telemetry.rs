//! Console logging plus an optional JSONL trace file per run.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing::debug;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt};

use crate::config::{TraceSettings, default_cache_root};

const TRACE_PREFIX: &str = "chromebench-";
const TRACE_SUFFIX: &str = ".trace.jsonl";

/// Trace file of the current process. The guard flushes the writer on exit.
struct TraceFile {
    path: PathBuf,
    _guard: WorkerGuard,
}

static TRACE_FILE: OnceCell<TraceFile> = OnceCell::new();

/// Install the global subscriber. `RUST_LOG` overrides the default level.
pub fn init_tracing(verbose: bool, traces: &TraceSettings) -> Result<()> {
    let level = if verbose {
        "chromebench=debug"
    } else {
        "chromebench=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let trace_writer = match open_trace_writer(traces)? {
        Some((writer, trace)) => {
            let _ = TRACE_FILE.set(trace);
            Some(writer)
        }
        None => None,
    };
    let json_layer = trace_writer.map(|writer| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .with_filter(LevelFilter::TRACE)
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(json_layer)
        .try_init();
    if installed.is_err() {
        debug!("tracing subscriber already installed");
    }
    Ok(())
}

/// Trace file written by this process, if any.
pub fn current_trace_file() -> Option<&'static Path> {
    TRACE_FILE.get().map(|trace| trace.path.as_path())
}

fn open_trace_writer(settings: &TraceSettings) -> Result<Option<(NonBlocking, TraceFile)>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = match &settings.directory {
        Some(directory) => directory.clone(),
        None => default_cache_root()?.join("traces"),
    };
    fs::create_dir_all(&directory).with_context(|| {
        format!("Unable to prepare trace directory {}", directory.display())
    })?;

    let (file, path) = create_trace_file(&directory)?;
    prune_traces(&directory, settings.max_files, &path)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some((writer, TraceFile { path, _guard: guard })))
}

fn create_trace_file(directory: &Path) -> Result<(File, PathBuf)> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = directory.join(format!(
        "{TRACE_PREFIX}{stamp}-{}{TRACE_SUFFIX}",
        std::process::id()
    ));
    let file = File::options()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("Unable to create trace file {}", path.display()))?;
    Ok((file, path))
}

/// Trace files in `directory`, newest first.
fn existing_traces(directory: &Path) -> Result<Vec<PathBuf>> {
    let listing = fs::read_dir(directory)
        .with_context(|| format!("Unable to list trace directory {}", directory.display()))?;
    let mut traces: Vec<(SystemTime, PathBuf)> = listing
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(TRACE_SUFFIX))
        })
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            Some((metadata.modified().ok()?, entry.path()))
        })
        .collect();
    traces.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(traces.into_iter().map(|(_, path)| path).collect())
}

/// Delete old traces so that at most `max_files` remain, `current` included.
/// A limit of zero keeps everything.
fn prune_traces(directory: &Path, max_files: usize, current: &Path) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }
    let stale = existing_traces(directory)?
        .into_iter()
        .filter(|path| path != current)
        .skip(max_files.saturating_sub(1));
    for path in stale {
        if let Err(err) = fs::remove_file(&path) {
            debug!(path = %path.display(), error = %err, "failed to remove old trace");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"{}\n").unwrap();
        // Distinct mtimes keep the ordering stable.
        thread::sleep(Duration::from_millis(15));
        path
    }

    #[test]
    fn prune_keeps_newest_traces() {
        let dir = tempdir().unwrap();
        let oldest = touch(dir.path(), "a.trace.jsonl");
        let middle = touch(dir.path(), "b.trace.jsonl");
        let unrelated = touch(dir.path(), "notes.txt");
        let current = touch(dir.path(), "c.trace.jsonl");

        prune_traces(dir.path(), 2, &current).unwrap();

        assert!(current.exists());
        assert!(middle.exists());
        assert!(!oldest.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn zero_limit_keeps_everything() {
        let dir = tempdir().unwrap();
        let old = touch(dir.path(), "a.trace.jsonl");
        let current = touch(dir.path(), "b.trace.jsonl");
        prune_traces(dir.path(), 0, &current).unwrap();
        assert!(old.exists());
    }

    #[test]
    fn traces_are_listed_newest_first() {
        let dir = tempdir().unwrap();
        let first = touch(dir.path(), "x.trace.jsonl");
        let second = touch(dir.path(), "y.trace.jsonl");
        assert_eq!(existing_traces(dir.path()).unwrap(), vec![second, first]);
    }

    #[test]
    fn disabled_traces_open_nothing() {
        assert!(open_trace_writer(&TraceSettings::default()).unwrap().is_none());
    }

    #[test]
    fn trace_file_name_carries_prefix_and_suffix() {
        let dir = tempdir().unwrap();
        let (_, path) = create_trace_file(dir.path()).unwrap();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(TRACE_PREFIX));
        assert!(name.ends_with(TRACE_SUFFIX));
    }
}
