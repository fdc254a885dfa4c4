//! Worker process lifecycle primitives.
//!
//! The orchestrator never touches `std::process` directly: it asks a
//! [`ProcessLauncher`] for a [`ProcessHandle`] and drives it through
//! terminate / kill / wait. Tests swap in fakes that start slowly, crash,
//! or ignore SIGTERM.

use std::process::Stdio;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::process::{Child, Command};
use voice_insight_config::WorkerSpec;

use crate::{sys_debug, sys_info, sys_warn};

/// Starts worker processes.
pub trait ProcessLauncher: Send + Sync {
    /// Launch the worker described by `spec`, bound to `spec.port`.
    fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn ProcessHandle>, String>;
}

/// A launched worker process, exclusively owned by one worker instance.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check. `Some(description)` once the process is gone.
    fn try_exit_status(&mut self) -> Option<String>;

    /// Ask the process to shut down gracefully.
    fn terminate(&mut self);

    /// Kill without grace.
    fn kill(&mut self);

    /// Resolve once the process has exited and been reaped.
    fn wait(&mut self) -> BoxFuture<'_, ()>;
}

/// How a [`shutdown_process`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    AlreadyExited,
    Graceful,
    Killed,
}

/// Terminate, wait up to `grace`, then force-kill.
pub async fn shutdown_process(handle: &mut dyn ProcessHandle, grace: Duration) -> ShutdownOutcome {
    if let Some(status) = handle.try_exit_status() {
        sys_debug!("[PROCESS_MGR] pid {:?} already exited ({status})", handle.pid());
        return ShutdownOutcome::AlreadyExited;
    }

    if !grace.is_zero() {
        handle.terminate();
        if tokio::time::timeout(grace, handle.wait()).await.is_ok() {
            return ShutdownOutcome::Graceful;
        }
        sys_warn!(
            "[PROCESS_MGR] pid {:?} ignored terminate for {:?}, killing",
            handle.pid(),
            grace
        );
    }

    handle.kill();
    handle.wait().await;
    ShutdownOutcome::Killed
}

/// Launches real OS processes from the spec's launch template.
#[derive(Debug, Default)]
pub struct OsProcessLauncher;

impl ProcessLauncher for OsProcessLauncher {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Box<dyn ProcessHandle>, String> {
        sys_info!(
            "[PROCESS_MGR] Spawning worker {} on port {}: {}",
            spec.alias,
            spec.port,
            spec.launch.display()
        );

        let mut cmd = Command::new(&spec.launch.program);
        cmd.args(&spec.launch.args)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            // Worker logs go to our stdout/stderr
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Own process group so signals reach the whole worker tree
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| format!("Failed to spawn {}: {e}", spec.launch.program))?;

        Ok(Box::new(OsProcessHandle {
            alias: spec.alias.clone(),
            child,
        }))
    }
}

struct OsProcessHandle {
    alias: String,
    child: Child,
}

impl OsProcessHandle {
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> bool {
        let Some(pid) = self.child.id() else {
            return false;
        };
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: kill(2) with a negative pid signals the process group we
        // created at spawn time; no memory is shared with the callee.
        unsafe { libc::kill(-pgid, signal) == 0 }
    }
}

impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    fn terminate(&mut self) {
        sys_debug!("[PROCESS_MGR] Terminating worker {} (pid {:?})", self.alias, self.pid());
        #[cfg(unix)]
        {
            if !self.signal_group(libc::SIGTERM) {
                let _ = self.child.start_kill();
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    fn kill(&mut self) {
        sys_debug!("[PROCESS_MGR] Killing worker {} (pid {:?})", self.alias, self.pid());
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGKILL);
        }
        let _ = self.child.start_kill();
    }

    fn wait(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.child.wait().await;
        })
    }
}
