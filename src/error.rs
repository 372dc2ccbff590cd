//! Bootstrap error types
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Could not mount cgroup tmpfs on {path}, did you use --privileged? ({source})")]
    CgroupMount { path: String, source: nix::Error },
    #[error("No supported storage filesystem found (overlay, aufs)")]
    NoStorageFilesystem,
    #[error("Timed out after {0}s waiting for the inner docker daemon")]
    DaemonTimeout(u64),
    #[error("Docker daemon exited before becoming ready: {0}")]
    DaemonExited(ExitStatus),
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("Invalid prefix length: {0}")]
    InvalidPrefix(u8),
    #[error("Network interface not usable: {0}")]
    MissingInterface(String),
    #[error("`{program}` failed with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("Unexpected output from `{program}`: {source}")]
    Parse {
        program: String,
        source: serde_json::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),
}

impl BootstrapError {
    /// Every fatal bootstrap error leaves the container with status 1.
    pub fn exit_code(&self) -> u8 {
        1
    }
}
