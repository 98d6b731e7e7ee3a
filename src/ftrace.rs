//! Tracing facility control
//!
//! Thin collaborator around the kernel tracing mount: every operation is a
//! single idempotent one-character write under the mount directory. The
//! mount is resolved once from the system mount table and cached in the
//! value for the life of the process; nothing here inspects trace data.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TraceFsError {
    #[error("no tracefs or debugfs mount found; mount debugfs to sample live")]
    NotMounted,
    #[error("tracing control access failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle on the resolved tracing mount directory
#[derive(Debug, Clone)]
pub struct TraceFs {
    dir: PathBuf,
}

impl TraceFs {
    /// Resolve the tracing directory from `/proc/mounts`
    pub fn locate() -> Result<Self, TraceFsError> {
        let mounts = fs::read_to_string("/proc/mounts")?;
        Self::from_mount_table(&mounts).ok_or(TraceFsError::NotMounted)
    }

    /// A direct tracefs mount wins; otherwise the `tracing` directory under
    /// the first debugfs mount.
    pub fn from_mount_table(mounts: &str) -> Option<Self> {
        let mut debugfs = None;
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_dev), Some(dir), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            match fstype {
                "tracefs" => return Some(Self { dir: PathBuf::from(dir) }),
                "debugfs" if debugfs.is_none() => {
                    debugfs = Some(PathBuf::from(dir).join("tracing"));
                }
                _ => {}
            }
        }
        debugfs.map(|dir| Self { dir })
    }

    /// Use an explicit tracing directory
    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The stream the live session reads from
    pub fn trace_pipe_path(&self) -> PathBuf {
        self.dir.join("trace_pipe")
    }

    pub fn enable_event(&self, event: &str) -> Result<(), TraceFsError> {
        self.write_control(&format!("events/{}/enable", event), "1")
    }

    pub fn disable_event(&self, event: &str) -> Result<(), TraceFsError> {
        self.write_control(&format!("events/{}/enable", event), "0")
    }

    pub fn enable_stacktrace(&self) -> Result<(), TraceFsError> {
        self.write_control("options/stacktrace", "1")
    }

    pub fn disable_stacktrace(&self) -> Result<(), TraceFsError> {
        self.write_control("options/stacktrace", "0")
    }

    /// Truncate the trace buffer
    pub fn clear_buffer(&self) -> Result<(), TraceFsError> {
        self.write_control("trace", "")
    }

    /// Scope tracing to one pid. Old kernels lack `set_ftrace_pid`, so this
    /// is best-effort and quiet about it.
    pub fn set_pid_filter(&self, pid: u32) {
        if let Err(e) = self.write_control("set_ftrace_pid", &pid.to_string()) {
            debug!("pid filter unavailable: {}", e);
        }
    }

    pub fn clear_pid_filter(&self) {
        if let Err(e) = self.write_control("set_ftrace_pid", "") {
            debug!("pid filter unavailable: {}", e);
        }
    }

    pub fn tracing_on(&self) -> Result<(), TraceFsError> {
        self.write_control("tracing_on", "1")
    }

    pub fn tracing_off(&self) -> Result<(), TraceFsError> {
        self.write_control("tracing_on", "0")
    }

    fn write_control(&self, rel: &str, value: &str) -> Result<(), TraceFsError> {
        fs::write(self.dir.join(rel), value)?;
        Ok(())
    }
}
