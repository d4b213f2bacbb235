//! Process control primitives for supervised QEMU processes.
//!
//! Everything here operates on raw pids because a controller restart can
//! leave it supervising processes it did not spawn (re-attach), where no
//! `std::process::Child` exists.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Grace period between SIGTERM and SIGKILL during a forced stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long SIGKILL is given to take effect before reaping.
const SIGKILL_WAIT: Duration = Duration::from_millis(500);

/// Exit code reported when the real status could not be retrieved (the
/// process was reaped elsewhere or is not our child).
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Check if a process is alive.
pub fn is_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Non-blocking exit check for a child process.
///
/// Returns `Some(exit_code)` once the process has exited, `None` while it
/// is still running.
pub fn try_wait(pid: libc::pid_t) -> Option<i32> {
    let mut status: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

    if result == pid {
        Some(exit_code_from_status(status))
    } else if result < 0 {
        // Not our child or already gone.
        Some(UNKNOWN_EXIT_CODE)
    } else {
        None
    }
}

fn exit_code_from_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        UNKNOWN_EXIT_CODE
    }
}

/// Send SIGTERM. Returns true if the signal was delivered.
pub fn terminate(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Send SIGKILL. Returns true if the signal was delivered.
pub fn kill(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

/// Stop a process: SIGTERM, bounded wait, then SIGKILL.
///
/// Blocks up to `timeout` plus the SIGKILL grace period; call from a
/// blocking-capable context.
pub fn stop_process(pid: libc::pid_t, timeout: Duration) -> Result<i32> {
    if !is_alive(pid) {
        return Ok(try_wait(pid).unwrap_or(UNKNOWN_EXIT_CODE));
    }

    if !terminate(pid) {
        return Ok(try_wait(pid).unwrap_or(UNKNOWN_EXIT_CODE));
    }

    let start = Instant::now();
    let poll_interval = Duration::from_millis(100);
    while start.elapsed() < timeout {
        if let Some(code) = try_wait(pid) {
            return Ok(code);
        }
        if !is_alive(pid) {
            return Ok(try_wait(pid).unwrap_or(UNKNOWN_EXIT_CODE));
        }
        std::thread::sleep(poll_interval);
    }

    tracing::debug!(pid = pid, "sigterm grace period expired, sending sigkill");
    if !kill(pid) {
        return Ok(try_wait(pid).unwrap_or(UNKNOWN_EXIT_CODE));
    }
    std::thread::sleep(SIGKILL_WAIT);

    if is_alive(pid) {
        return Err(Error::launch(
            "stop",
            format!("process {} survived sigkill", pid),
        ));
    }
    Ok(try_wait(pid).unwrap_or(UNKNOWN_EXIT_CODE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alive_self() {
        let pid = unsafe { libc::getpid() };
        assert!(is_alive(pid));
    }

    #[test]
    fn test_is_alive_nonexistent() {
        assert!(!is_alive(99999999));
    }

    #[test]
    fn test_stop_process_on_sleeping_child() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id() as libc::pid_t;
        assert!(is_alive(pid));

        let code = stop_process(pid, Duration::from_secs(5)).unwrap();
        // sleep dies to SIGTERM: 128 + 15.
        assert_eq!(code, 143);
        assert!(!is_alive(pid));
    }
}
