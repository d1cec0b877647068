//! OS-specific process liveness and termination.
//!
//! Everything above this module talks to [`ProcessControl`]; the concrete
//! implementation is picked at compile time by [`native`].

use std::io;
use std::sync::Arc;

pub trait ProcessControl: Send + Sync {
    /// True if `pid` names a running (not exited, not zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Asks the process to exit.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Kills the process without giving it a chance to clean up.
    fn force_kill(&self, pid: u32) -> io::Result<()>;
}

/// The process control for the current platform.
pub fn native() -> Arc<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Arc::new(unix::UnixProcessControl)
    }
    #[cfg(windows)]
    {
        Arc::new(windows::WindowsProcessControl)
    }
}

#[cfg(unix)]
pub mod unix {
    use std::io;
    use std::path::Path;

    use super::ProcessControl;

    /// Signals through `kill(2)`, with `/proc` as a fallback probe.
    pub struct UnixProcessControl;

    impl UnixProcessControl {
        fn signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
            let pid = to_pid(pid)?;
            // SAFETY: kill has no memory-safety preconditions.
            if unsafe { libc::kill(pid, signal) } == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }

    impl ProcessControl for UnixProcessControl {
        fn is_alive(&self, pid: u32) -> bool {
            let Ok(raw) = to_pid(pid) else {
                return false;
            };
            // SAFETY: signal 0 only performs the permission and existence check.
            if unsafe { libc::kill(raw, 0) } == 0 {
                return !is_zombie(pid);
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::ESRCH) => false,
                // Exists, owned by someone else.
                Some(libc::EPERM) => true,
                _ => proc_entry_exists(pid),
            }
        }

        fn terminate(&self, pid: u32) -> io::Result<()> {
            Self::signal(pid, libc::SIGTERM)
        }

        fn force_kill(&self, pid: u32) -> io::Result<()> {
            Self::signal(pid, libc::SIGKILL)
        }
    }

    fn to_pid(pid: u32) -> io::Result<libc::pid_t> {
        match libc::pid_t::try_from(pid) {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid pid {}", pid),
            )),
        }
    }

    fn proc_entry_exists(pid: u32) -> bool {
        Path::new("/proc").join(pid.to_string()).exists()
    }

    /// Linux keeps exited, unreaped children in the table in state `Z`.
    #[cfg(target_os = "linux")]
    fn is_zombie(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        // The command name may contain spaces and parens; state follows the last ')'.
        stat.rfind(')')
            .and_then(|i| stat[i + 1..].split_whitespace().next())
            .map(|state| state == "Z")
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "linux"))]
    fn is_zombie(_pid: u32) -> bool {
        false
    }
}

#[cfg(windows)]
pub mod windows {
    use std::io;
    use std::process::{Command, Stdio};

    use super::ProcessControl;

    /// Uses `tasklist` and `taskkill`.
    pub struct WindowsProcessControl;

    impl WindowsProcessControl {
        fn taskkill(pid: u32, force: bool) -> io::Result<()> {
            let mut cmd = Command::new("taskkill");
            if force {
                cmd.arg("/F");
            }
            let status = cmd
                .args(["/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()?;
            if status.success() {
                Ok(())
            } else {
                Err(io::Error::other(format!("taskkill exited with {}", status)))
            }
        }
    }

    impl ProcessControl for WindowsProcessControl {
        fn is_alive(&self, pid: u32) -> bool {
            let output = Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", pid), "/FO", "CSV", "/NH"])
                .stderr(Stdio::null())
                .output();
            match output {
                Ok(out) => String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .any(|line| line.contains(&format!("\"{}\"", pid))),
                Err(e) => {
                    log::warn!("tasklist failed: {}", e);
                    false
                }
            }
        }

        fn terminate(&self, pid: u32) -> io::Result<()> {
            Self::taskkill(pid, false)
        }

        fn force_kill(&self, pid: u32) -> io::Result<()> {
            Self::taskkill(pid, true)
        }
    }
}
