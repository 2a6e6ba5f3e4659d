//! # Bookkeeper
//!
//! Scoped, appendable text logs for per-participant results. Every log lives
//! at `<base>/<tag>/<host>-<rank>/<name>`, so the logs of all participants of
//! one experiment sit side by side under the experiment tag.
//!
//! Writers are handed to a closure and always flushed and closed when the
//! closure returns, whether it succeeded or not. Regular logs start each
//! write session with a `HOST: <host> DATE: <date>` header line; raw data
//! dumps use the header-less variant so they stay machine-readable.

use crate::group::ProcessIdentity;
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Per-participant log sink keyed by experiment tag and host label
#[derive(Debug, Clone)]
pub struct Bookkeeper {
    base: PathBuf,
    tag: String,
    host_name: String,
    host_label: String,
}

impl Bookkeeper {
    pub fn new(base: impl Into<PathBuf>, tag: impl Into<String>, identity: &ProcessIdentity) -> Self {
        Self {
            base: base.into(),
            tag: tag.into(),
            host_name: identity.host_name.clone(),
            host_label: identity.host_label(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Directory holding this participant's logs.
    pub fn log_dir(&self) -> PathBuf {
        self.base.join(&self.tag).join(&self.host_label)
    }

    /// Path of the log called `name`.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir().join(name)
    }

    /// Append to the log `name`, starting with a header line.
    pub fn with_log<F>(&self, name: &str, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
    {
        let header = format!(
            "HOST: {} DATE: {}",
            self.host_name,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        );
        self.append(name, Some(&header), write)
    }

    /// Append to the log `name` without a header line.
    pub fn with_headerless_log<F>(&self, name: &str, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
    {
        self.append(name, None, write)
    }

    /// Paths of the log `name` of every participant of this experiment that
    /// has written one, sorted.
    pub fn paths_to_all_logs(&self, name: &str) -> Result<Vec<PathBuf>> {
        let experiment_dir = self.base.join(&self.tag);
        if !experiment_dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&experiment_dir)
            .with_context(|| format!("Failed to list {}", experiment_dir.display()))?
        {
            let candidate = entry?.path().join(name);
            if candidate.is_file() {
                paths.push(candidate);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn append<F>(&self, name: &str, header: Option<&str>, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
    {
        let dir = self.log_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log {}", path.display()))?;

        let mut writer = BufWriter::new(file);
        let written = match header {
            Some(header) => writeln!(writer, "{}", header).and_then(|_| write(&mut writer)),
            None => write(&mut writer),
        };
        let flushed = writer.flush();
        written.with_context(|| format!("Failed to write log {}", path.display()))?;
        flushed.with_context(|| format!("Failed to flush log {}", path.display()))?;
        debug!("Wrote log {}", path.display());
        Ok(path)
    }
}

/// Read a whole log back, e.g. to print summaries at the end of a run.
pub fn read_log(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(rank: usize) -> ProcessIdentity {
        ProcessIdentity {
            rank,
            group_size: 4,
            host_name: "bench".to_string(),
        }
    }

    #[test]
    fn test_log_path_layout() {
        let keeper = Bookkeeper::new("/tmp/base", "LTB-arp", &identity(3));
        assert_eq!(
            keeper.log_path("summary"),
            PathBuf::from("/tmp/base/LTB-arp/bench-3/summary")
        );
    }

    #[test]
    fn test_header_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = Bookkeeper::new(dir.path(), "tag", &identity(0));

        keeper.with_log("summary", |w| writeln!(w, "mean 1.0")).unwrap();
        let path = keeper.with_log("summary", |w| writeln!(w, "mean 2.0")).unwrap();

        let contents = read_log(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("HOST: bench DATE: "));
        assert_eq!(lines[1], "mean 1.0");
        assert_eq!(lines[3], "mean 2.0");
    }

    #[test]
    fn test_headerless_log() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = Bookkeeper::new(dir.path(), "tag", &identity(1));
        let path = keeper
            .with_headerless_log("raw-latency-data", |w| {
                for v in [5, 6] {
                    writeln!(w, "{}", v)?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(read_log(&path).unwrap(), "5\n6\n");
    }

    /// Failing closures still leave a closed, flushed file behind
    #[test]
    fn test_failed_write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = Bookkeeper::new(dir.path(), "tag", &identity(1));
        let result = keeper.with_headerless_log("broken", |w| {
            writeln!(w, "partial")?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        });
        assert!(result.is_err());
        assert_eq!(read_log(&keeper.log_path("broken")).unwrap(), "partial\n");
    }

    #[test]
    fn test_paths_to_all_logs() {
        let dir = tempfile::tempdir().unwrap();
        for rank in 0..3 {
            let keeper = Bookkeeper::new(dir.path(), "tag", &identity(rank));
            if rank != 1 {
                keeper.with_log("summary", |w| writeln!(w, "x")).unwrap();
            }
        }
        let keeper = Bookkeeper::new(dir.path(), "tag", &identity(0));
        let paths = keeper.paths_to_all_logs("summary").unwrap();
        assert_eq!(
            paths,
            vec![keeper.log_path("summary"), dir.path().join("tag/bench-2/summary")]
        );
        assert!(keeper.paths_to_all_logs("missing").unwrap().is_empty());
    }
}
