//! Stale SQL server PID file cleanup.
//!
//! The store's SQL server writes a PID file on startup but does not always
//! remove it on crash or unclean shutdown. A stale file makes the next client
//! connect to a port that may now belong to a different server, and the
//! connection hangs until the client's read timeout. Removing the file when
//! its process is dead keeps that failure mode off the patrol loops.

use std::path::Path;

use tracing::{debug, info};

/// Removes `dolt/dolt-server.pid` under `store_dir` if the referenced process
/// is no longer alive. Best effort; never fails.
pub fn clean_stale_server_pid(store_dir: &Path) {
    let pid_path = store_dir.join("dolt").join("dolt-server.pid");
    let Ok(content) = std::fs::read_to_string(&pid_path) else {
        return;
    };

    let pid = match content.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            // Corrupt PID file.
            let _ = std::fs::remove_file(&pid_path);
            debug!(path = %pid_path.display(), "removed corrupt PID file");
            return;
        }
    };

    if !process_alive(pid) {
        let _ = std::fs::remove_file(&pid_path);
        info!(pid, path = %pid_path.display(), "cleaned stale SQL server PID file");
    }
}

/// Signal-0 probe via `kill -0`: no signal delivered, exit status says
/// whether the PID exists.
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid_file(dir: &Path, content: &str) -> std::path::PathBuf {
        let dolt_dir = dir.join("dolt");
        std::fs::create_dir_all(&dolt_dir).unwrap();
        let path = dolt_dir.join("dolt-server.pid");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_pid_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        clean_stale_server_pid(dir.path());
    }

    #[test]
    fn corrupt_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_file(dir.path(), "not-a-pid");
        clean_stale_server_pid(dir.path());
        assert!(!path.exists());
    }

    #[test]
    fn dead_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        // PID 4194304 exceeds the default pid_max on Linux; no such process.
        let path = pid_file(dir.path(), "4194304");
        clean_stale_server_pid(dir.path());
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_file(dir.path(), &std::process::id().to_string());
        clean_stale_server_pid(dir.path());
        assert!(path.exists());
    }
}
