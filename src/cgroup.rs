//! Control-group placement for the root and its long-lived children.

use std::{fs, io, io::Write};

use tracing::{error, warn};

/// Controllers distributed to the subtrees that fan out into further groups.
const CONTROLLERS: &[&str] = &["+cpu", "+memory", "+io", "+pids"];

/// The root group itself and the one child that distributes onwards. The
/// system-control and logger slices hold leaf processes only and need no
/// subtree control of their own.
const SUBTREE_GROUPS: &[&str] = &["", "/service-manager.slice"];

/// Locate our own control group: the mount prefix plus the in-hierarchy
/// path. The unified v2 record is preferred; the compatibility name=systemd
/// hierarchy is the fallback on split v1 setups.
fn parse_self_cgroup(contents: &str) -> Option<(&'static str, String)> {
    let mut systemd: Option<String> = None;
    for line in contents.lines() {
        let mut columns = line.splitn(3, ':');
        let _hierarchy = columns.next();
        let (Some(controllers), Some(path)) = (columns.next(), columns.next()) else {
            continue;
        };
        if controllers.is_empty() {
            return Some(("/sys/fs/cgroup", path.to_string()));
        }
        if controllers == "name=systemd" {
            systemd = Some(path.to_string());
        }
    }
    systemd.map(|path| ("/sys/fs/cgroup/systemd", path))
}

fn enroll_self(group: &str) -> io::Result<()> {
    if let Err(e) = fs::create_dir(group) {
        if e.kind() != io::ErrorKind::AlreadyExists {
            return Err(e);
        }
    }
    let mut procs = fs::OpenOptions::new()
        .append(true)
        .open(format!("{group}/cgroup.procs"))?;
    procs.write_all(b"0\n")
}

/// Move ourselves into a `me.slice` child of whatever group we woke up in,
/// then hand the controllers down the subtrees that need them. Every write
/// is idempotent; errors are logged and never fatal.
pub fn initialize_root_control_groups() {
    let contents = match fs::read_to_string("/proc/self/cgroup") {
        Ok(contents) => contents,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("/proc/self/cgroup: {e}");
            }
            return;
        }
    };
    let Some((prefix, current)) = parse_self_cgroup(&contents) else {
        return;
    };
    let root = format!("{prefix}{current}");

    // The root group must end up with no processes of its own, or the
    // subtree_control writes below bounce off the no-internal-process rule.
    let me_slice = format!("{root}/me.slice");
    if let Err(e) = enroll_self(&me_slice) {
        error!("{me_slice}: {e}");
    }

    for group in SUBTREE_GROUPS {
        let dir = format!("{root}{group}");
        if let Err(e) = fs::create_dir(&dir) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                warn!("{dir}: {e}");
                continue;
            }
        }
        let knob = format!("{dir}/cgroup.subtree_control");
        let mut file = match fs::OpenOptions::new().write(true).open(&knob) {
            Ok(file) => file,
            Err(e) => {
                warn!("{knob}: {e}");
                continue;
            }
        };
        // One controller per write; a kernel that lacks one must not stop
        // the others from being enabled.
        for controller in CONTROLLERS {
            if let Err(e) = file.write_all(controller.as_bytes()) {
                warn!("{knob}: {controller}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_hierarchy_wins() {
        let contents = "0::/init.scope\n";
        assert_eq!(
            parse_self_cgroup(contents),
            Some(("/sys/fs/cgroup", "/init.scope".to_string()))
        );
    }

    #[test]
    fn hybrid_layout_still_picks_the_unified_record() {
        let contents = "2:cpu,cpuacct:/\n1:name=systemd:/legacy\n0::/unified\n";
        assert_eq!(
            parse_self_cgroup(contents),
            Some(("/sys/fs/cgroup", "/unified".to_string()))
        );
    }

    #[test]
    fn split_v1_falls_back_to_the_systemd_name() {
        let contents = "3:cpu,cpuacct:/\n2:memory:/\n1:name=systemd:/user.slice\n";
        assert_eq!(
            parse_self_cgroup(contents),
            Some(("/sys/fs/cgroup/systemd", "/user.slice".to_string()))
        );
    }

    #[test]
    fn no_usable_hierarchy_means_none() {
        assert_eq!(parse_self_cgroup("4:memory:/\n"), None);
        assert_eq!(parse_self_cgroup(""), None);
    }
}
