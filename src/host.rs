//! The container's mount/network namespace as an explicit value.
//!
//! Every bootstrap step takes a `&impl Host` instead of touching the
//! system directly, so the steps can be driven against a fake in tests.
#![allow(async_fn_in_trait)]

use crate::error::BootstrapError;
use nix::mount::{MntFlags, MsFlags};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Captured result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turn a failed run into a `Command` error.
    pub fn check(self, program: &str) -> Result<Self, BootstrapError> {
        if self.success {
            Ok(self)
        } else {
            Err(BootstrapError::Command {
                program: program.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// A kernel mount request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount<'a> {
    pub source: &'a str,
    pub target: &'a Path,
    pub fstype: &'a str,
    pub data: Option<&'a str>,
}

pub trait Host {
    /// Run a program to completion and capture its output.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, BootstrapError>;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()>;

    /// Same answer as `mountpoint -q`.
    fn is_mountpoint(&self, path: &Path) -> bool;
    fn mount(&self, req: &Mount<'_>) -> Result<(), nix::Error>;
    fn unmount(&self, target: &Path) -> Result<(), nix::Error>;

    fn interface_exists(&self, name: &str) -> bool;
}

/// The real system, reached through `nix` and `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxHost;

impl Host for LinuxHost {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, BootstrapError> {
        debug!(program = %program, args = ?args, "Running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BootstrapError::Command {
                program: program.to_string(),
                status: "spawn failure".to_string(),
                stderr: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn symlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(original, link)
    }

    fn is_mountpoint(&self, path: &Path) -> bool {
        let Ok(path) = std::fs::canonicalize(path) else {
            return false;
        };
        match std::fs::read_to_string("/proc/self/mountinfo") {
            Ok(info) => mountinfo_targets(&info).iter().any(|t| *t == path),
            Err(_) => same_device_check(&path),
        }
    }

    fn mount(&self, req: &Mount<'_>) -> Result<(), nix::Error> {
        debug!(source = %req.source, target = ?req.target, fstype = %req.fstype, "Mounting");
        nix::mount::mount(
            Some(req.source),
            req.target,
            Some(req.fstype),
            MsFlags::empty(),
            req.data,
        )
    }

    fn unmount(&self, target: &Path) -> Result<(), nix::Error> {
        nix::mount::umount2(target, MntFlags::MNT_DETACH)
    }

    fn interface_exists(&self, name: &str) -> bool {
        nix::net::if_::if_nametoindex(name).is_ok()
    }
}

/// Mount points listed in `/proc/<pid>/mountinfo` (field 5), with the
/// kernel's octal escapes (`\040` for a space) decoded.
pub fn mountinfo_targets(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let code = bytes.get(i + 1..i + 4).and_then(|d| {
            let digits = std::str::from_utf8(d).ok()?;
            if digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
                u8::from_str_radix(digits, 8).ok()
            } else {
                None
            }
        });
        match code {
            Some(c) if bytes[i] == b'\\' => {
                out.push(c);
                i += 4;
            }
            _ => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Fallback without `/proc`: a mountpoint sits on a different device than
/// its parent, or is its own parent. Same-device bind mounts are missed.
fn same_device_check(path: &Path) -> bool {
    let Ok(own) = nix::sys::stat::lstat(path) else {
        return false;
    };
    let Ok(up) = nix::sys::stat::stat(&path.join("..")) else {
        return false;
    };
    own.st_dev != up.st_dev || own.st_ino == up.st_ino
}

/// Spawn a long-running background process with the given stdio.
pub fn spawn_background(
    program: &str,
    args: &[String],
    stdout: Stdio,
    stderr: Stdio,
) -> io::Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
}
