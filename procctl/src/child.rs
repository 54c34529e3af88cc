//! Ownership of the wrapped child: signaling, forwarding, and mirroring its exit.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Child;

/// Grace window between the termination request and the forced kill.
pub const KILL_GRACE: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Code(i32),
    Signal(i32),
}

impl ChildOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Self::Signal(sig);
            }
        }
        Self::Code(1)
    }

    /// Leaves the process the same way the child left: same exit code, or the same
    /// signal with its default disposition.
    pub fn exit(self) -> ! {
        match self {
            Self::Code(code) => std::process::exit(code),
            Self::Signal(sig) => {
                #[cfg(unix)]
                unsafe {
                    libc::signal(sig, libc::SIG_DFL);
                    libc::raise(sig);
                }
                std::process::exit(128 + sig)
            }
        }
    }
}

/// Delivers `sig` to the child and marks it as no longer alive.
#[cfg(unix)]
pub fn send_signal(pid: u32, sig: i32, alive: &AtomicBool) {
    alive.store(false, Ordering::SeqCst);
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        tracing::warn!(pid, sig, "signal delivery failed: {}", std::io::Error::last_os_error());
    }
}

/// Graceful stop: SIGTERM, then a forced kill if the child outlives the grace window.
pub async fn terminate(child: &mut Child, alive: &AtomicBool, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    match child.id() {
        Some(pid) => send_signal(pid, libc::SIGTERM, alive),
        None => alive.store(false, Ordering::SeqCst),
    }
    #[cfg(not(unix))]
    {
        alive.store(false, Ordering::SeqCst);
        child.start_kill()?;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "child ignored termination, killing");
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// Termination signals received by this process, to be relayed to the child.
pub struct ForwardedSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl ForwardedSignals {
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Resolves with the number of the next signal received.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> i32 {
        tokio::select! {
            _ = self.terminate.recv() => libc::SIGTERM,
            _ = self.interrupt.recv() => libc::SIGINT,
            _ = self.hangup.recv() => libc::SIGHUP,
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> i32 {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        2
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn exit_code_is_mirrored() {
        let status = Command::new("sh").args(["-c", "exit 7"]).status().await.unwrap();
        assert_eq!(ChildOutcome::from_status(status), ChildOutcome::Code(7));
    }

    #[tokio::test]
    async fn cooperative_child_stops_on_sigterm() {
        let mut child = Command::new("sleep").arg("30").stdin(Stdio::null()).spawn().unwrap();
        let alive = AtomicBool::new(true);
        let status = terminate(&mut child, &alive, Duration::from_secs(5)).await.unwrap();
        assert!(!alive.load(Ordering::SeqCst));
        assert_eq!(ChildOutcome::from_status(status), ChildOutcome::Signal(libc::SIGTERM));
    }

    #[tokio::test]
    async fn stubborn_child_is_killed_after_grace() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let alive = AtomicBool::new(true);
        let started = std::time::Instant::now();
        let status = terminate(&mut child, &alive, Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(ChildOutcome::from_status(status), ChildOutcome::Signal(libc::SIGKILL));
    }
}
