//! Base environment for the trusted system base, and per-user directories.

use std::{env, fs, io, path::PathBuf};

use nix::unistd::{geteuid, User};
use tracing::warn;

const DEFAULT_LANG: &str = "C.UTF-8";
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// envdir-style locale directories, in reverse priority order; accumulative.
const ENV_DIRS: &[&str] = &[
    "/etc/defaults/locale.d",
    "/etc/locale.d",
    "/usr/local/etc/locale.d",
];

/// Shell-style locale files, in fallback order; the first readable one wins.
const ENV_FILES: &[&str] = &[
    "/usr/local/etc/locale.conf",
    "/etc/locale.conf",
    "/etc/defaults/locale.conf",
    "/etc/default/locale",
    "/etc/sysconfig/i18n",
    "/etc/sysconfig/language",
    "/etc/sysconf/i18n",
];

/// Compiled-in defaults first, then the locale directories, then the first
/// readable locale file overlaying its assignments.
pub fn set_base_environment() {
    env::set_var("LANG", DEFAULT_LANG);
    env::set_var("PATH", DEFAULT_PATH);

    for dir in ENV_DIRS {
        absorb_env_dir(dir);
    }
    for file in ENV_FILES {
        if absorb_env_file(file) {
            break;
        }
    }
}

/// Each file in an envdir is one variable: the name is the filename, the
/// value is the whole contents; an empty file unsets the variable.
fn absorb_env_dir(dir: &str) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!("{dir}: {e}");
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("{dir}: {e}");
                continue;
            }
        };
        let name = match entry.file_name().into_string() {
            Ok(name) if !name.starts_with('.') => name,
            _ => continue,
        };
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        match fs::read_to_string(&path) {
            Ok(value) if value.is_empty() => env::remove_var(&name),
            Ok(value) => env::set_var(&name, value),
            Err(e) => warn!("{}: {e}", path.display()),
        }
    }
}

fn absorb_env_file(path: &str) -> bool {
    match fs::read_to_string(path) {
        Ok(contents) => {
            for (name, value) in parse_env_file(&contents) {
                env::set_var(name, value);
            }
            true
        }
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("{path}: {e}");
            }
            false
        }
    }
}

/// One `VAR=VAL` assignment per line; blank lines and `#` comments are
/// skipped, an `export` prefix and matched surrounding quotes are dropped.
fn parse_env_file(contents: &str) -> Vec<(String, String)> {
    let mut assignments = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        assignments.push((name.to_string(), value.to_string()));
    }
    assignments
}

/// The per-user runtime directory, `$XDG_RUNTIME_DIR` or the conventional
/// fallback.
pub fn user_runtime_dir() -> PathBuf {
    env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", geteuid())))
}

/// The persistent per-user log directory, used when cycling through all log
/// directories.
pub fn user_log_dir() -> PathBuf {
    match User::from_uid(geteuid()) {
        Ok(Some(user)) => PathBuf::from("/var/log/user").join(user.name),
        _ => PathBuf::from("/dev/null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_assignments() {
        let parsed = parse_env_file(
            "# locale\nLANG=en_US.UTF-8\n\nexport LC_ALL=\"C.UTF-8\"\nLC_TIME='de_DE'\nnot a line\n=novar\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("LANG".to_string(), "en_US.UTF-8".to_string()),
                ("LC_ALL".to_string(), "C.UTF-8".to_string()),
                ("LC_TIME".to_string(), "de_DE".to_string()),
            ]
        );
    }

    #[test]
    fn env_file_keeps_unmatched_quotes() {
        let parsed = parse_env_file("A=\"half\nB=whole=sign\n");
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), "\"half".to_string()),
                ("B".to_string(), "whole=sign".to_string()),
            ]
        );
    }
}
