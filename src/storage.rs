use crate::error::BootstrapError;
use crate::host::{Host, Mount};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageDriver {
    Overlay,
    Aufs,
    Vfs,
}

impl StorageDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageDriver::Overlay => "overlay",
            StorageDriver::Aufs => "aufs",
            StorageDriver::Vfs => "vfs",
        }
    }

    pub fn daemon_flag(&self) -> String {
        format!("--storage-driver={}", self.as_str())
    }
}

impl fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of storage selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoragePlan {
    pub driver: StorageDriver,
    /// Backing image mounted over the data root, if one was needed.
    pub loopback: Option<PathBuf>,
}

/// Pick the preferred filesystem listed in `/proc/filesystems`.
pub fn supported_filesystem(proc_filesystems: &str) -> Option<StorageDriver> {
    let names: Vec<&str> = proc_filesystems
        .lines()
        .filter_map(|l| l.split_whitespace().last())
        .collect();

    if names.contains(&"overlay") {
        Some(StorageDriver::Overlay)
    } else if names.contains(&"aufs") {
        Some(StorageDriver::Aufs)
    } else {
        None
    }
}

/// Choose the inner daemon's storage driver for `data_root`
/// (normally `/var/lib/docker`).
pub async fn select_storage(
    host: &impl Host,
    data_root: &Path,
    image: &Path,
    size_gb: u64,
) -> Result<StoragePlan, BootstrapError> {
    let listing = host.read_to_string(Path::new("/proc/filesystems"))?;
    let driver = supported_filesystem(&listing).ok_or(BootstrapError::NoStorageFilesystem)?;
    host.create_dir_all(data_root)?;

    if driver != StorageDriver::Overlay {
        info!(driver = %driver, "Selected storage driver");
        return Ok(StoragePlan { driver, loopback: None });
    }

    if overlay_nests(host, data_root) {
        info!(driver = %driver, "Selected storage driver");
        return Ok(StoragePlan { driver, loopback: None });
    }

    warn!(path = ?data_root, "Overlay cannot stack here, backing it with a loopback ext4 image");
    match mount_loopback(host, data_root, image, size_gb).await {
        Ok(()) => Ok(StoragePlan {
            driver,
            loopback: Some(image.to_path_buf()),
        }),
        Err(e) => {
            warn!(error = %e, "Loopback image unavailable, falling back to vfs");
            Ok(StoragePlan {
                driver: StorageDriver::Vfs,
                loopback: None,
            })
        }
    }
}

/// Try an overlay mount inside `data_root` and write through it.
fn overlay_nests(host: &impl Host, data_root: &Path) -> bool {
    let scratch = data_root.join(".overlay-check");
    let lower = scratch.join("lower");
    let upper = scratch.join("upper");
    let work = scratch.join("work");
    let merged = scratch.join("merged");

    for dir in [&lower, &upper, &work, &merged] {
        if host.create_dir_all(dir).is_err() {
            return false;
        }
    }

    let data = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    let mounted = host
        .mount(&Mount {
            source: "overlay",
            target: &merged,
            fstype: "overlay",
            data: Some(data.as_str()),
        })
        .is_ok();

    let writable = mounted && host.write(&merged.join("check"), b"ok").is_ok();

    if mounted {
        let _ = host.unmount(&merged);
    }
    let _ = host.remove_dir_all(&scratch);
    writable
}

async fn mount_loopback(
    host: &impl Host,
    data_root: &Path,
    image: &Path,
    size_gb: u64,
) -> Result<(), BootstrapError> {
    let image_str = image.display().to_string();
    let root_str = data_root.display().to_string();

    if !host.exists(image) {
        // only a fully formatted image is ever visible under the final name
        let partial = PathBuf::from(format!("{}.partial", image_str));
        if let Err(e) = create_image(host, &partial, size_gb).await {
            let _ = host.remove_file(&partial);
            return Err(e);
        }
        host.rename(&partial, image)?;
    }

    host.run("mount", &["-o", "loop", image_str.as_str(), root_str.as_str()])
        .await?
        .check("mount")?;
    info!(image = %image_str, size_gb = size_gb, "Mounted loopback image");
    Ok(())
}

async fn create_image(host: &impl Host, path: &Path, size_gb: u64) -> Result<(), BootstrapError> {
    let path_str = path.display().to_string();
    let of = format!("of={}", path_str);
    let seek = format!("seek={}G", size_gb);
    host.run("dd", &["if=/dev/zero", of.as_str(), "bs=1", "count=0", seek.as_str()])
        .await?
        .check("dd")?;
    host.run("mkfs.ext4", &["-F", "-q", path_str.as_str()])
        .await?
        .check("mkfs.ext4")?;
    Ok(())
}
