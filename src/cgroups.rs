use crate::error::BootstrapError;
use crate::host::{Host, Mount};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One line of `/proc/<pid>/cgroup`: `id:controllers:path`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgroupHierarchy {
    pub id: u32,
    pub controllers: String,
    pub path: String,
}

/// Parse `/proc/<pid>/cgroup`, skipping lines that do not have three fields.
pub fn parse_proc_cgroup(contents: &str) -> Vec<CgroupHierarchy> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let id = parts.next()?.trim().parse().ok()?;
            let controllers = parts.next()?.to_string();
            let path = parts.next()?.to_string();
            Some(CgroupHierarchy { id, controllers, path })
        })
        .collect()
}

/// Legacy (v1) hierarchies; the unified v2 entry has an empty controller list.
pub fn legacy_hierarchies(all: &[CgroupHierarchy]) -> impl Iterator<Item = &CgroupHierarchy> {
    all.iter().filter(|h| !h.controllers.is_empty())
}

/// Extra links some tooling expects next to a hierarchy's directory.
/// Returns `(link_name, target)` pairs relative to the cgroup root.
pub fn hierarchy_aliases(controllers: &str) -> Vec<(String, String)> {
    let mut aliases = Vec::new();
    if let Some(name) = controllers.strip_prefix("name=") {
        aliases.push((name.to_string(), controllers.to_string()));
    }
    // systemd has been seen mounting cpu,cpuacct under the inverted name
    if controllers == "cpuacct,cpu" {
        aliases.push(("cpu,cpuacct".to_string(), controllers.to_string()));
    }
    aliases
}

/// Problems with the devices controller that break nested containers.
pub fn devices_warnings(all: &[CgroupHierarchy]) -> Vec<&'static str> {
    let legacy: Vec<_> = legacy_hierarchies(all).collect();
    if legacy.is_empty() {
        return Vec::new();
    }

    let mut warnings = Vec::new();
    if !legacy.iter().any(|h| h.controllers == "devices") {
        warnings.push("the 'devices' cgroup should be in its own hierarchy");
    }
    let mounted = legacy
        .iter()
        .any(|h| h.controllers.split(',').any(|c| c == "devices"));
    if !mounted {
        warnings.push("it looks like the 'devices' cgroup is not mounted");
    }
    warnings
}

/// Mount the cgroup filesystems the inner daemon needs, mirroring the
/// hierarchies PID 1 is placed in.
pub fn setup_cgroups(host: &impl Host, root: &Path) -> Result<(), BootstrapError> {
    host.create_dir_all(root)?;

    if !host.is_mountpoint(root) {
        host.mount(&Mount {
            source: "cgroup",
            target: root,
            fstype: "tmpfs",
            data: Some("uid=0,gid=0,mode=0755"),
        })
        .map_err(|source| BootstrapError::CgroupMount {
            path: root.display().to_string(),
            source,
        })?;
    }

    mount_securityfs(host, Path::new(crate::config::SECURITYFS));

    let contents = host.read_to_string(Path::new("/proc/1/cgroup"))?;
    let hierarchies = parse_proc_cgroup(&contents);

    for h in legacy_hierarchies(&hierarchies) {
        let dir = root.join(&h.controllers);
        host.create_dir_all(&dir)?;

        if !host.is_mountpoint(&dir) {
            if let Err(e) = host.mount(&Mount {
                source: "cgroup",
                target: &dir,
                fstype: "cgroup",
                data: Some(h.controllers.as_str()),
            }) {
                warn!(controllers = %h.controllers, error = %e, "Failed to mount cgroup hierarchy");
                continue;
            }
            info!(controllers = %h.controllers, "Mounted cgroup hierarchy");
        }

        for (name, target) in hierarchy_aliases(&h.controllers) {
            let link = root.join(&name);
            if !host.exists(&link) {
                host.symlink(&PathBuf::from(target), &link)?;
            }
        }
    }

    for w in devices_warnings(&hierarchies) {
        warn!("{}", w);
    }

    Ok(())
}

fn mount_securityfs(host: &impl Host, path: &Path) {
    if !host.exists(path) || host.is_mountpoint(path) {
        return;
    }
    let res = host.mount(&Mount {
        source: "none",
        target: path,
        fstype: "securityfs",
        data: None,
    });
    if let Err(e) = res {
        warn!(path = ?path, error = %e, "Could not mount securityfs, AppArmor detection may break");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    const V1: &str = "\
12:devices:/docker/abc
11:cpuacct,cpu:/docker/abc
10:memory:/docker/abc
1:name=systemd:/docker/abc
0::/docker/abc
";

    #[test]
    fn test_parse_proc_cgroup() {
        let h = parse_proc_cgroup(V1);
        assert_eq!(h.len(), 5);
        assert_eq!(
            h[1],
            CgroupHierarchy {
                id: 11,
                controllers: "cpuacct,cpu".into(),
                path: "/docker/abc".into()
            }
        );
        assert_eq!(legacy_hierarchies(&h).count(), 4);
    }

    #[test]
    fn test_parse_skips_junk() {
        let h = parse_proc_cgroup("garbage\nx:y:z\n3:pids:/\n");
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].controllers, "pids");
    }

    #[test]
    fn test_aliases() {
        assert_eq!(
            hierarchy_aliases("name=systemd"),
            vec![("systemd".to_string(), "name=systemd".to_string())]
        );
        assert_eq!(
            hierarchy_aliases("cpuacct,cpu"),
            vec![("cpu,cpuacct".to_string(), "cpuacct,cpu".to_string())]
        );
        assert!(hierarchy_aliases("memory").is_empty());
    }

    #[test]
    fn test_devices_warnings() {
        assert!(devices_warnings(&parse_proc_cgroup(V1)).is_empty());

        let shared = parse_proc_cgroup("4:devices,memory:/\n");
        assert_eq!(devices_warnings(&shared), vec!["the 'devices' cgroup should be in its own hierarchy"]);

        let missing = parse_proc_cgroup("4:memory:/\n");
        assert_eq!(devices_warnings(&missing).len(), 2);

        let unified = parse_proc_cgroup("0::/\n");
        assert!(devices_warnings(&unified).is_empty());
    }

    #[test]
    fn test_setup_mounts_every_hierarchy() {
        let host = FakeHost::default()
            .with_file("/proc/1/cgroup", V1)
            .with_dir("/sys/kernel/security");
        setup_cgroups(&host, Path::new("/sys/fs/cgroup")).unwrap();

        assert_eq!(
            host.mounted_fstypes(),
            vec!["tmpfs", "securityfs", "cgroup", "cgroup", "cgroup", "cgroup"]
        );
        let mounts = host.mounts.borrow();
        assert_eq!(mounts[2].1, PathBuf::from("/sys/fs/cgroup/devices"));
        assert_eq!(mounts[5].3.as_deref(), Some("name=systemd"));

        let links = host.symlinks.borrow();
        assert!(links.contains(&(PathBuf::from("cpuacct,cpu"), PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"))));
        assert!(links.contains(&(PathBuf::from("name=systemd"), PathBuf::from("/sys/fs/cgroup/systemd"))));
    }

    #[test]
    fn test_setup_skips_existing_mounts() {
        let host = FakeHost::default()
            .with_file("/proc/1/cgroup", "0::/\n")
            .with_mountpoint("/sys/fs/cgroup");
        setup_cgroups(&host, Path::new("/sys/fs/cgroup")).unwrap();
        assert!(host.mounts.borrow().is_empty());
    }

    #[test]
    fn test_tmpfs_failure_is_fatal() {
        let host = FakeHost::default()
            .with_file("/proc/1/cgroup", V1)
            .failing_mount("tmpfs");
        let err = setup_cgroups(&host, Path::new("/sys/fs/cgroup")).unwrap_err();
        assert!(matches!(err, BootstrapError::CgroupMount { .. }));
    }

    #[test]
    fn test_hierarchy_failure_is_not_fatal() {
        let host = FakeHost::default()
            .with_file("/proc/1/cgroup", V1)
            .failing_mount("cgroup")
            .failing_mount("securityfs")
            .with_dir("/sys/kernel/security");
        setup_cgroups(&host, Path::new("/sys/fs/cgroup")).unwrap();
        assert_eq!(host.mounted_fstypes(), vec!["tmpfs"]);
        assert!(host.symlinks.borrow().is_empty());
    }
}
