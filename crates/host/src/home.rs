//! Host home directory layout:
//!
//! ```text
//! <home>/daemon.pid
//! <home>/logs/
//! <home>/events.db
//! <home>/credentials.json   (mode 0600)
//! <home>/.config.json
//! <home>/cache/registry.json
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use hub_protocol::HubError;

pub struct Home {
    root: PathBuf,
}

impl Home {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn ensure(&self) -> Result<(), HubError> {
        std::fs::create_dir_all(&self.root).map_err(io_err)?;
        std::fs::create_dir_all(self.logs_dir()).map_err(io_err)?;
        std::fs::create_dir_all(self.cache_dir()).map_err(io_err)?;
        Ok(())
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("daemon.pid")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn events_db(&self) -> PathBuf {
        self.root.join("events.db")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.root.join("credentials.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(".config.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn registry_cache_file(&self) -> PathBuf {
        self.cache_dir().join("registry.json")
    }

    /// Writes the daemon's own pid, guarding against a second instance
    /// whose pid file points at a still-living process. A pid file left
    /// behind by a crashed daemon (stale, process gone) is treated as
    /// absent rather than a conflict.
    pub fn claim_pid_file(&self) -> Result<(), HubError> {
        if let Some(existing) = self.read_pid_file()? {
            if process_alive(existing) {
                return Err(HubError::internal(format!(
                    "another hub-host instance is already running (pid {existing})"
                )));
            }
        }
        let pid = std::process::id();
        write_private_file(&self.pid_file(), pid.to_string().as_bytes())?;
        Ok(())
    }

    pub fn release_pid_file(&self) -> Result<(), HubError> {
        let _ = std::fs::remove_file(self.pid_file());
        Ok(())
    }

    fn read_pid_file(&self) -> Result<Option<u32>, HubError> {
        match std::fs::read_to_string(self.pid_file()) {
            Ok(s) => Ok(s.trim().parse::<u32>().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    /// Writes credentials with mode 0600.
    pub fn write_credentials(&self, json: &[u8]) -> Result<(), HubError> {
        write_private_file(&self.credentials_file(), json)
    }
}

#[cfg(unix)]
fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), HubError> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    file.write_all(contents).map_err(io_err)
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), HubError> {
    std::fs::write(path, contents).map_err(io_err)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 performs no action but still validates the pid exists and
    // is owned by us; ESRCH means the process is gone.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

fn io_err(e: std::io::Error) -> HubError {
    HubError::internal(format!("home directory I/O error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_logs_and_cache_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::new(dir.path().to_path_buf());
        home.ensure().unwrap();
        assert!(home.logs_dir().exists());
        assert!(home.cache_dir().exists());
    }

    #[test]
    fn pid_file_round_trips_and_detects_itself_as_alive() {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::new(dir.path().to_path_buf());
        home.ensure().unwrap();
        home.claim_pid_file().unwrap();
        assert!(home.pid_file().exists());
        // Claiming again while "we" are alive must fail.
        assert!(home.claim_pid_file().is_err());
        home.release_pid_file().unwrap();
        assert!(!home.pid_file().exists());
    }
}
