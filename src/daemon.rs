use crate::config::{DaemonConfig, LogMode};
use crate::error::BootstrapError;
use crate::host::{Host, spawn_background};
use crate::storage::StorageDriver;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// The daemon as the readiness loop sees it.
pub trait DaemonProcess {
    fn pid(&self) -> Option<u32>;
    /// `Some` once the process has exited.
    fn try_exited(&mut self) -> io::Result<Option<ExitStatus>>;
    fn terminate(&mut self);
}

impl DaemonProcess for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    fn try_exited(&mut self) -> io::Result<Option<ExitStatus>> {
        self.try_wait()
    }

    fn terminate(&mut self) {
        let Some(pid) = self.id() else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pid = pid, error = %e, "Failed to signal docker daemon");
        }
    }
}

/// Full daemon command line, without the program itself.
pub fn daemon_args(cfg: &DaemonConfig, driver: StorageDriver, network_flags: &[String]) -> Vec<String> {
    let mut args = vec![driver.daemon_flag()];
    args.extend(network_flags.iter().cloned());
    args.extend(cfg.extra_args.iter().cloned());
    args
}

/// Launch the daemon in the background.
pub fn spawn_daemon(cfg: &DaemonConfig, args: &[String]) -> Result<Child, BootstrapError> {
    let (stdout, stderr) = match cfg.log {
        LogMode::Stdio => (Stdio::inherit(), Stdio::inherit()),
        LogMode::File => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&cfg.log_path)?;
            let dup = file.try_clone()?;
            (Stdio::from(file), Stdio::from(dup))
        }
    };

    info!(program = %cfg.program, args = ?args, log = ?cfg.log, "Spawning docker daemon");
    let child = spawn_background(&cfg.program, args, stdout, stderr).map_err(|e| {
        BootstrapError::Command {
            program: cfg.program.clone(),
            status: "spawn failure".to_string(),
            stderr: e.to_string(),
        }
    })?;
    info!(pid = ?child.id(), "Docker daemon started");
    Ok(child)
}

/// Poll `docker info` until it succeeds, the daemon dies, or `timeout`
/// passes. On timeout the daemon is sent SIGTERM.
pub async fn wait_until_ready(
    host: &impl Host,
    daemon: &mut impl DaemonProcess,
    timeout: Duration,
    interval: Duration,
) -> Result<(), BootstrapError> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        if let Some(status) = daemon.try_exited()? {
            error!(status = ?status, "Docker daemon exited during startup");
            return Err(BootstrapError::DaemonExited(status));
        }

        attempts += 1;
        // a `docker info` that never answers must not outlive the deadline
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, host.run("docker", &["info"])).await {
            Ok(Ok(out)) if out.success => {
                info!(pid = ?daemon.pid(), attempts = attempts, "Docker daemon is ready");
                return Ok(());
            }
            Ok(Ok(out)) => debug!(attempt = attempts, stderr = %out.stderr.trim(), "Docker daemon not ready"),
            Ok(Err(e)) => debug!(attempt = attempts, error = %e, "Docker daemon not ready"),
            Err(_) => debug!(attempt = attempts, "docker info did not answer before the deadline"),
        }

        if Instant::now() >= deadline {
            error!(pid = ?daemon.pid(), attempts = attempts, "Timed out trying to connect to the inner docker daemon");
            daemon.terminate();
            return Err(BootstrapError::DaemonTimeout(timeout.as_secs()));
        }
        tokio::time::sleep(interval).await;
    }
}
