//! One-shot bring-up: everything that must be sane before the first child.
//!
//! All of it is idempotent and none of it is fatal; PID 1 carries on with
//! whatever it managed to get.

use std::{fs, io, os::unix::fs::DirBuilderExt, path::Path};

use nix::{
    sys::prctl,
    sys::stat::{umask, Mode},
    unistd::{chdir, setsid},
};
use tracing::{debug, info, warn};

use crate::{clock, environ, mounts, platform, RootMode, Timeline};

const SYSTEM_RUN_DIRECTORIES: &[&str] = &[
    "/run/system-manager",
    "/run/system-manager/log",
    "/run/service-bundles",
    "/run/service-bundles/early-supervise",
    "/run/service-manager",
    "/run/user",
];

const USER_RUN_DIRECTORIES: &[&str] = &[
    "per-user-manager",
    "per-user-manager/log",
    "service-bundles",
    "service-bundles/early-supervise",
    "service-manager",
];

/// Process-state sanitisation, before anything is spawned.
pub fn setup_process_state(mode: RootMode) {
    match mode {
        RootMode::SystemRoot => {
            // Usually we already lead the boot session; EPERM here is noise.
            if let Err(e) = setsid() {
                debug!("setsid: {e}");
            }
            if let Err(e) = chdir("/") {
                warn!("chdir /: {e}");
            }
            umask(Mode::from_bits_truncate(0o022));
            environ::set_base_environment();
        }
        RootMode::UserSessionRoot => {
            // Orphans of our descendants must come back to us, not to PID 1.
            if let Err(e) = prctl::set_child_subreaper(true) {
                warn!("cannot become a subreaper: {e}");
            }
        }
    }
}

/// The system-only steps: clock, kernel API volumes, reboot hotkeys.
pub fn system_bringup(timeline: &mut Timeline) {
    timeline.begin("Clock and timezone");
    clock::initialize_system_clock_timezone();

    timeline.begin("Kernel API volumes");
    mounts::apply(&mounts::BASE_MOUNTS);

    // Only meaningful once /proc is mounted.
    let level = mounts::query_control_group_level();
    info!("control group level is {level}");
    match level {
        1 => mounts::apply(&mounts::CGROUP_V1_MOUNTS),
        2 => mounts::apply(&mounts::CGROUP_V2_MOUNTS),
        _ => {}
    }

    mounts::make_symlinks(mounts::DEV_SYMLINKS);

    if !platform::in_container() {
        platform::claim_reboot_hotkeys();
    }
}

fn make_directory(path: &Path) {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o755);
    if let Err(e) = builder.create(path) {
        if e.kind() != io::ErrorKind::AlreadyExists {
            warn!("mkdir {}: {e}", path.display());
        }
    }
}

pub fn make_needed_run_directories(mode: RootMode) {
    match mode {
        RootMode::SystemRoot => {
            for dir in SYSTEM_RUN_DIRECTORIES {
                make_directory(Path::new(dir));
            }
            // Early supervise bundles moved; older clients still look at the
            // old name.
            if let Err(e) = std::os::unix::fs::symlink(
                "../service-bundles/early-supervise",
                "/run/system-manager/early-supervise",
            ) {
                if e.kind() != io::ErrorKind::AlreadyExists {
                    warn!("symlink /run/system-manager/early-supervise: {e}");
                }
            }
        }
        RootMode::UserSessionRoot => {
            let runtime = environ::user_runtime_dir();
            for dir in USER_RUN_DIRECTORIES {
                make_directory(&runtime.join(dir));
            }
        }
    }
}
