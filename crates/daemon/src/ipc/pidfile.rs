//! PID file handling for detecting a running daemon.
//!
//! The daemon writes its PID to `<data_dir>/daemon.pid` on start and
//! removes it on shutdown. A PID file naming a dead process is stale and
//! is deleted the next time it is read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Path of the PID file inside `data_dir`.
pub fn get_pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("daemon.pid")
}

/// Record the current process as the running daemon.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove the PID file if it still names this process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());
    if ours {
        let _ = fs::remove_file(path);
    }
}

/// Get the PID of the running daemon, if any.
///
/// Unparseable or stale PID files are removed.
pub fn get_daemon_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Probes `pid` with signal 0. EPERM still means the process exists.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pid_file_path() {
        let path = get_pid_file_path(Path::new("/var/lib/termrelay"));
        assert_eq!(path, PathBuf::from("/var/lib/termrelay/daemon.pid"));
    }

    #[test]
    fn test_write_then_read_current_process() {
        let temp_dir = tempdir().unwrap();
        let path = get_pid_file_path(&temp_dir.path().join("nested"));

        write_pid_file(&path).unwrap();
        assert_eq!(get_daemon_pid(&path), Some(std::process::id()));

        remove_pid_file(&path);
        assert!(!path.exists());
        assert_eq!(get_daemon_pid(&path), None);
    }

    #[test]
    fn test_remove_leaves_foreign_pid_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "1\n").unwrap();

        remove_pid_file(&path);
        assert!(path.exists());
    }

    #[test]
    fn test_stale_pid_file_cleaned_up() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "4000000000\n").unwrap();

        assert_eq!(get_daemon_pid(&path), None);
        assert!(!path.exists(), "Stale PID file should be cleaned up");
    }

    #[test]
    fn test_garbage_pid_file_cleaned_up() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "not-a-pid").unwrap();

        assert_eq!(get_daemon_pid(&path), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(is_process_running(1));
        assert!(!is_process_running(0));
        assert!(!is_process_running(4_000_000_000));
    }
}
