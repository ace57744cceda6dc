//! Process lifecycle management for the bootstrap script
//!
//! The script runs as a child process that must never outlive an aborted
//! run. On Unix it is spawned as the leader of its own process group, so
//! whatever it starts can be signalled together with it. On Linux it also
//! gets a parent-death signal. Termination sends SIGTERM to the group, waits
//! for a grace period, then SIGKILLs it.
//!
//! SIGINT, SIGTERM and SIGHUP do not kill the provisioner outright. They set
//! a [`CancelToken`] that the run polls between stages and while waiting on
//! the child. A second signal exits immediately.

use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Exit status used when a second signal forces shutdown.
const FORCED_EXIT_STATUS: i32 = 130;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Route termination signals into `token`.
///
/// Call once at program start.
pub fn init_signal_handlers(token: &CancelToken) -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;

    #[cfg(unix)]
    let signals = [SIGINT, SIGTERM, signal_hook::consts::signal::SIGHUP];
    #[cfg(not(unix))]
    let signals = [SIGINT, SIGTERM];

    for signal in signals {
        // Registered first, so it only fires once the flag is already set.
        flag::register_conditional_shutdown(signal, FORCED_EXIT_STATUS, Arc::clone(&token.flag))?;
        flag::register(signal, Arc::clone(&token.flag))?;
    }

    tracing::debug!("Signal handlers initialized");
    Ok(())
}

/// Stop `child` and everything in its process group, then reap it.
///
/// SIGTERM first; SIGKILL for whatever is left after `grace`.
#[cfg(unix)]
pub fn terminate(child: &mut Child, grace: Duration) {
    use nix::sys::signal::Signal;

    let pid = child.id();
    if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
        tracing::warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
        let _ = send_signal(pid, Signal::SIGTERM);
    } else {
        tracing::debug!("Sent SIGTERM to process group {}", pid);
    }

    let start = std::time::Instant::now();
    while start.elapsed() < grace {
        match child.try_wait() {
            Ok(Some(_)) => {
                // Leader is gone; make sure stragglers in the group follow.
                let _ = send_signal_to_group(pid, Signal::SIGKILL);
                tracing::info!("Script process {} terminated gracefully", pid);
                return;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }

    tracing::warn!("Process group {} did not terminate, sending SIGKILL", pid);
    if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
        tracing::error!("Failed to send SIGKILL to process group {}: {}", pid, e);
        let _ = child.kill();
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
pub fn terminate(child: &mut Child, _grace: Duration) {
    if let Err(e) = child.kill() {
        tracing::warn!("Failed to kill script process {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), nix::Error> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
}

/// Negative pid addresses the whole group.
#[cfg(unix)]
fn send_signal_to_group(pgid: u32, signal: nix::sys::signal::Signal) -> Result<(), nix::Error> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(-(pgid as i32)), signal)
}

/// Extension trait for std::process::Command to set up process groups
#[cfg(unix)]
pub trait CommandProcessGroup {
    /// Run the command as the leader of a new process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

#[cfg(unix)]
impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use nix::unistd::Pid;
        use std::os::unix::process::CommandExt;

        // SAFETY: the closure only makes async-signal-safe syscalls.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::from)?;

                #[cfg(target_os = "linux")]
                if nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_stops_group_leader() {
        use std::process::{Command, Stdio};

        // The shell backgrounds a grandchild and then waits on it.
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 60 & wait"])
            .stdout(Stdio::null())
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sh");

        let start = Instant::now();
        terminate(&mut child, Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some(), "leader must be reaped");
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_escalates_to_sigkill() {
        use std::process::Command;

        let mut child = Command::new("/bin/sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sh");

        // Let the trap get installed before signalling.
        std::thread::sleep(Duration::from_millis(200));
        terminate(&mut child, Duration::from_millis(300));
        assert!(child.try_wait().unwrap().is_some());
    }
}
