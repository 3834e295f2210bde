//! Process liveness and detached-subprocess helpers.
//!
//! The host proxy daemon and the socket bridge are both detached: a new
//! session leader, stdio redirected to a log file, parent does not wait.
//! Liveness of an already-spawned process is checked with the signal-0
//! convention: a PID file names a live process only probabilistically,
//! since the PID may have been reused by an unrelated process after exit.

use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Returns `true` if a process with the given pid is alive, by sending it
/// signal 0. Does not distinguish "alive" from "zombie" beyond what the
/// kernel reports; callers combine this with PID-file staleness checks.
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: kill(pid, 0) performs no action beyond an existence/permission
    // check; it never terminates the target process.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0
}

/// Reads a plain-text decimal PID from `path`, returning `None` if the file
/// is absent, unreadable, or does not parse.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Writes `pid` as plain-text decimal to `path`, mode 0644, creating parent
/// directories as needed.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating PID file directory {parent:?}"))?;
    }
    std::fs::write(path, pid.to_string()).with_context(|| format!("writing PID file {path:?}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

/// Removes a PID file if present; absence is not an error (idempotent).
pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Sends SIGTERM to `pid`. A no-op (returns `Ok`) if the process is already
/// gone, matching the idempotent-stop contract used throughout the Manager.
pub fn terminate(pid: u32) -> Result<()> {
    // SAFETY: kill(pid, SIGTERM) is the standard graceful-shutdown request;
    // it is safe to call on a pid we do not own a handle to.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::NotFound && err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).context("sending SIGTERM");
        }
    }
    Ok(())
}

/// Sends SIGKILL to `pid`. Tolerates an already-dead process.
pub fn kill(pid: u32) -> Result<()> {
    // SAFETY: see `terminate`.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).context("sending SIGKILL");
        }
    }
    Ok(())
}

/// Spawns `program` with `args` as a detached subprocess: a new session
/// leader (so it survives the parent exiting), stdout/stderr appended to
/// `log_path`, stdin nulled. Returns the spawned child's OS pid without
/// waiting on it — the caller releases the `Child` handle immediately so
/// the child's lifetime is independent of the parent's.
pub fn spawn_detached(program: &Path, args: &[String], log_path: &Path) -> Result<u32> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {parent:?}"))?;
    }
    let log_file = File::options()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening log file {log_path:?}"))?;
    let log_file_err = log_file.try_clone().context("cloning log file handle")?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid() is async-signal-safe and is the only call made
        // in the pre_exec hook, as required by Command::pre_exec.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let child = cmd.spawn().context("spawning detached subprocess")?;
    let pid = child.id();
    // Dropping `child` without waiting releases our handle; the kernel
    // reaps the process independently once its new session has no parent
    // waiting on it (it becomes a child of init/subreaper on exit).
    std::mem::drop(child);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn is_alive_true_for_current_process() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn is_alive_false_for_unlikely_pid() {
        assert!(!is_alive(u32::MAX - 1));
    }

    #[test]
    fn pid_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub/test.pid");
        write_pid_file(&path, 4242).unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));
        remove_pid_file(&path);
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn read_pid_file_missing_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(read_pid_file(&dir.path().join("nope.pid")), None);
    }

    #[test]
    fn terminate_tolerates_dead_pid() {
        assert!(terminate(u32::MAX - 1).is_ok());
    }
}
