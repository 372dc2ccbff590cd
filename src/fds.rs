use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use std::os::fd::{BorrowedFd, RawFd};
use std::path::Path;
use tracing::debug;

/// Descriptors listed in `dir` (normally `/proc/self/fd`) other than
/// stdin, stdout and stderr.
pub fn inherited_fds(dir: &Path) -> std::io::Result<Vec<RawFd>> {
    let mut fds: Vec<RawFd> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str()?.parse().ok())
        .filter(|fd| *fd > 2)
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

/// Mark every inherited descriptor close-on-exec so neither the daemon
/// nor the final command sees them.
pub fn seal_inherited_fds() -> std::io::Result<usize> {
    let mut sealed = 0;
    for fd in inherited_fds(Path::new("/proc/self/fd"))? {
        // SAFETY: `fd` was listed in /proc/self/fd and nothing in this
        // process owns or closes it while the borrow lives, which is only
        // the fcntl call below. The read_dir handle is already closed by
        // now, and fcntl on it reports EBADF.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match fcntl(borrowed, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            Ok(_) => sealed += 1,
            Err(e) => debug!(fd = fd, error = %e, "Skipping descriptor"),
        }
    }
    Ok(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inherited_fds_skips_stdio() {
        let dir = std::env::temp_dir().join(format!("dind-init-fds-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["0", "1", "2", "7", "3", "not-a-fd"] {
            std::fs::write(dir.join(name), "").unwrap();
        }
        assert_eq!(inherited_fds(&dir).unwrap(), vec![3, 7]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_seal_marks_open_file() {
        use std::os::fd::AsRawFd;
        let file = std::fs::File::open("/proc/self/status").unwrap();
        seal_inherited_fds().unwrap();
        let flags = fcntl(&file, FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        assert!(file.as_raw_fd() > 2);
    }
}
