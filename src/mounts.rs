//! Declarative kernel API mounts and symlinks.

use std::{fs, io, os::unix::fs::DirBuilderExt, os::unix::fs::MetadataExt};

use nix::{errno::Errno, mount::MsFlags};
use once_cell::sync::Lazy;
use tracing::{info, warn};

use crate::InitError;

/// One virtual filesystem mount, consulted exactly once during bring-up.
pub struct ApiMount {
    pub source: &'static str,
    pub fstype: &'static str,
    pub target: &'static str,
    pub flags: MsFlags,
    pub data: Option<&'static str>,
}

static SECURE_FLAGS: Lazy<MsFlags> = Lazy::new(|| {
    MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RELATIME
});
// Device filesystems need device nodes, obviously.
static DEV_FLAGS: Lazy<MsFlags> =
    Lazy::new(|| MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_RELATIME);

/// Base collection, wanted on every system root.
pub static BASE_MOUNTS: Lazy<Vec<ApiMount>> = Lazy::new(|| {
    vec![
        ApiMount {
            source: "proc",
            fstype: "proc",
            target: "/proc",
            flags: *SECURE_FLAGS,
            data: None,
        },
        ApiMount {
            source: "sysfs",
            fstype: "sysfs",
            target: "/sys",
            flags: *SECURE_FLAGS,
            data: None,
        },
        ApiMount {
            source: "devtmpfs",
            fstype: "devtmpfs",
            target: "/dev",
            flags: *DEV_FLAGS,
            data: Some("mode=0755"),
        },
        ApiMount {
            source: "devpts",
            fstype: "devpts",
            target: "/dev/pts",
            flags: *DEV_FLAGS,
            data: Some("mode=0620,gid=5,ptmxmode=000"),
        },
        ApiMount {
            source: "tmpfs",
            fstype: "tmpfs",
            target: "/run",
            flags: *SECURE_FLAGS,
            data: Some("mode=0755"),
        },
        ApiMount {
            source: "shm",
            fstype: "tmpfs",
            target: "/dev/shm",
            flags: *SECURE_FLAGS,
            data: Some("mode=1777"),
        },
    ]
});

/// Modern unified control-group hierarchy.
pub static CGROUP_V2_MOUNTS: Lazy<Vec<ApiMount>> = Lazy::new(|| {
    vec![ApiMount {
        source: "cgroup2",
        fstype: "cgroup2",
        target: "/sys/fs/cgroup",
        flags: *SECURE_FLAGS,
        data: Some("nsdelegate"),
    }]
});

/// Split v1 hierarchies, one mount per controller plus the compatibility
/// name=systemd hierarchy the cgroup walk falls back to.
pub static CGROUP_V1_MOUNTS: Lazy<Vec<ApiMount>> = Lazy::new(|| {
    vec![
        ApiMount {
            source: "tmpfs",
            fstype: "tmpfs",
            target: "/sys/fs/cgroup",
            flags: *SECURE_FLAGS,
            data: Some("mode=0755"),
        },
        ApiMount {
            source: "cgroup",
            fstype: "cgroup",
            target: "/sys/fs/cgroup/systemd",
            flags: *SECURE_FLAGS,
            data: Some("none,name=systemd"),
        },
        ApiMount {
            source: "cgroup",
            fstype: "cgroup",
            target: "/sys/fs/cgroup/cpu",
            flags: *SECURE_FLAGS,
            data: Some("cpu,cpuacct"),
        },
        ApiMount {
            source: "cgroup",
            fstype: "cgroup",
            target: "/sys/fs/cgroup/memory",
            flags: *SECURE_FLAGS,
            data: Some("memory"),
        },
        ApiMount {
            source: "cgroup",
            fstype: "cgroup",
            target: "/sys/fs/cgroup/blkio",
            flags: *SECURE_FLAGS,
            data: Some("blkio"),
        },
        ApiMount {
            source: "cgroup",
            fstype: "cgroup",
            target: "/sys/fs/cgroup/pids",
            flags: *SECURE_FLAGS,
            data: Some("pids"),
        },
    ]
});

/// One declared API symlink; a pre-existing target is replaced only when
/// `force` is set.
pub struct ApiSymlink {
    pub force: bool,
    pub name: &'static str,
    pub target: &'static str,
}

pub const DEV_SYMLINKS: &[ApiSymlink] = &[
    ApiSymlink {
        force: true,
        name: "/dev/fd",
        target: "/proc/self/fd",
    },
    ApiSymlink {
        force: true,
        name: "/dev/stdin",
        target: "fd/0",
    },
    ApiSymlink {
        force: true,
        name: "/dev/stdout",
        target: "fd/1",
    },
    ApiSymlink {
        force: true,
        name: "/dev/stderr",
        target: "fd/2",
    },
];

/// Which cgroup generation the kernel offers: 2, 1, or 0 for none.
pub fn query_control_group_level() -> u8 {
    fs::read_to_string("/proc/filesystems")
        .map(|contents| control_group_level_from(&contents))
        .unwrap_or(0)
}

fn control_group_level_from(filesystems: &str) -> u8 {
    let mut level = 0;
    for line in filesystems.lines() {
        match line.split_whitespace().last() {
            Some("cgroup2") => return 2,
            Some("cgroup") if level < 1 => level = 1,
            _ => {}
        }
    }
    level
}

/// Something already mounted at this path? Mount roots traditionally carry
/// inode 2, virtual volumes on Linux inode 1; the mount table settles the
/// rest.
fn is_already_mounted(target: &str) -> bool {
    if let Ok(metadata) = fs::metadata(target) {
        if metadata.ino() == 1 || metadata.ino() == 2 {
            return true;
        }
    }
    fs::read_to_string("/proc/self/mounts")
        .map(|table| mount_table_contains(&table, target))
        .unwrap_or(false)
}

fn mount_table_contains(table: &str, target: &str) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mountpoint| mountpoint == target)
}

fn mount_one(mount: &ApiMount, update: bool) -> Result<(), InitError> {
    let flags = if update {
        mount.flags | MsFlags::MS_REMOUNT
    } else {
        mount.flags
    };
    nix::mount::mount(
        Some(mount.source),
        mount.target,
        Some(mount.fstype),
        flags,
        mount.data,
    )
    .map_err(|errno| InitError::Mount {
        what: mount.source,
        target: mount.target,
        errno,
    })
}

/// Idempotently apply one collection. A second run over an unchanged system
/// turns every entry into a remount-update or an EBUSY, neither of which is
/// an error worth reporting.
pub fn apply(mounts: &[ApiMount]) {
    for mount in mounts {
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o700);
        if let Err(e) = builder.create(mount.target) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                warn!("mkdir {}: {e}", mount.target);
            }
        }
        let update = is_already_mounted(mount.target);
        if update {
            info!("{}: a volume is already mounted here", mount.target);
        }
        if let Err(e) = mount_one(mount, update) {
            if !matches!(e, InitError::Mount { errno: Errno::EBUSY, .. }) {
                warn!("{e}");
            }
        }
    }
}

pub fn make_symlinks(links: &[ApiSymlink]) {
    for link in links {
        match std::os::unix::fs::symlink(link.target, link.name) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && link.force => {
                let _ = fs::remove_file(link.name);
                if let Err(e) = std::os::unix::fs::symlink(link.target, link.name) {
                    warn!("symlink {}: {e}", link.name);
                }
            }
            Err(e) => warn!("symlink {}: {e}", link.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_level_detection() {
        let both = "nodev\tsysfs\nnodev\tcgroup\nnodev\tcgroup2\n\text4\n";
        assert_eq!(control_group_level_from(both), 2);
        let v1_only = "nodev\tcgroup\n\text4\n";
        assert_eq!(control_group_level_from(v1_only), 1);
        let neither = "nodev\tsysfs\n\text4\n";
        assert_eq!(control_group_level_from(neither), 0);
        assert_eq!(control_group_level_from(""), 0);
    }

    #[test]
    fn mount_table_lookup_matches_the_target_column() {
        let table = "proc /proc proc rw 0 0\ntmpfs /run tmpfs rw,mode=755 0 0\n";
        assert!(mount_table_contains(table, "/run"));
        assert!(!mount_table_contains(table, "/run/user"));
        assert!(!mount_table_contains(table, "proc"));
    }
}
