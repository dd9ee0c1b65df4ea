use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::Error;

/// State descriptor written at startup and removed at shutdown. Status
/// tooling reads this instead of guessing which ports the daemon chose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: u32,
    pub http_port: u16,
    pub https_port: u16,
    pub dns_port: u16,
    pub tls: bool,
    pub dns: bool,
}

pub fn pid_file(config_dir: &Path) -> PathBuf {
    config_dir.join("proxy.pid")
}

pub fn state_file(config_dir: &Path) -> PathBuf {
    config_dir.join("proxy.state")
}

pub fn write_pid_file(config_dir: &Path) -> Result<(), Error> {
    write_private(&pid_file(config_dir), std::process::id().to_string().as_bytes())
}

pub fn read_pid(config_dir: &Path) -> Option<u32> {
    let data = std::fs::read_to_string(pid_file(config_dir)).ok()?;
    data.trim().parse().ok()
}

pub fn remove_pid_file(config_dir: &Path) {
    let _ = std::fs::remove_file(pid_file(config_dir));
}

pub fn write_state(config_dir: &Path, state: &DaemonState) -> Result<(), Error> {
    let data = serde_json::to_vec_pretty(state)?;
    write_private(&state_file(config_dir), &data)
}

pub fn read_state(config_dir: &Path) -> Option<DaemonState> {
    let data = std::fs::read(state_file(config_dir)).ok()?;
    serde_json::from_slice(&data).ok()
}

pub fn remove_state(config_dir: &Path) {
    let _ = std::fs::remove_file(state_file(config_dir));
}

/// Write a file readable only by the owner.
fn write_private(path: &Path, data: &[u8]) -> Result<(), Error> {
    use std::io::Write;
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_pid_file(dir.path()).unwrap();
        assert_eq!(read_pid(dir.path()), Some(std::process::id()));
        remove_pid_file(dir.path());
        assert_eq!(read_pid(dir.path()), None);
    }

    #[test]
    fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = DaemonState {
            pid: 1234,
            http_port: 8080,
            https_port: 8443,
            dns_port: 1299,
            tls: true,
            dns: true,
        };
        write_state(dir.path(), &state).unwrap();
        let read = read_state(dir.path()).unwrap();
        assert_eq!(read.pid, 1234);
        assert_eq!(read.http_port, 8080);
        assert!(read.tls);
        remove_state(dir.path());
        assert!(read_state(dir.path()).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn pid_and_state_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        write_pid_file(dir.path()).unwrap();
        let state = DaemonState {
            pid: 1,
            http_port: 80,
            https_port: 443,
            dns_port: 1299,
            tls: false,
            dns: false,
        };
        write_state(dir.path(), &state).unwrap();
        for path in [pid_file(dir.path()), state_file(dir.path())] {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{path:?} should be 0600");
        }
    }
}
