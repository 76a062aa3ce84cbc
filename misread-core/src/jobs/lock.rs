//! Exclusive ownership of a job-state file.
//!
//! A `<state>.lock` file holding the owner's PID sits next to the state file
//! while a process manages its jobs. A lock whose PID is no longer alive is
//! left over from a crash and is reclaimed.

use crate::error::MisreadError;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held for as long as this process owns the job state. Dropping it releases
/// the lock.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    /// Lock file path for a state file.
    pub fn path_for(state_file: &Path) -> PathBuf {
        let mut name = state_file.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take the lock, or fail with [`MisreadError::Locked`] if a live process
    /// holds it.
    pub fn acquire(state_file: &Path) -> Result<Self, MisreadError> {
        let path = Self::path_for(state_file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())?;
                    debug!(path = %path.display(), "Job state lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let owner = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    if let Some(pid) = owner.filter(|&pid| is_process_alive(pid)) {
                        return Err(MisreadError::Locked(format!(
                            "{} is in use by process {pid}",
                            state_file.display()
                        )));
                    }
                    warn!(path = %path.display(), "Removing stale job state lock");
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MisreadError::Locked(format!(
            "{} is being claimed by another process",
            state_file.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_process_alive(pid: u32) -> bool {
    // Zero and values beyond i32 address process groups, not a process.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        // Signal 0 only checks that the process exists.
        unsafe {
            unsafe extern "C" {
                fn kill(pid: i32, sig: i32) -> i32;
            }
            kill(pid as i32, 0) == 0
        }
    }
    #[cfg(not(unix))]
    {
        pid == std::process::id()
    }
}
