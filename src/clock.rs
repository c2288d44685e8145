//! RTC and timezone alignment.
//!
//! The kernel converts RTC time to UTC using its own offset. If the RTC
//! runs in local time, that offset must be told to it, and the wall clock
//! (read as local-time-as-if-UTC) corrected, before anything stamps a file.

use std::{fs, io, mem, ptr};

use tracing::warn;

/// The third line of /etc/adjtime says LOCAL when the RTC keeps local time.
/// Anything else, including no file at all, means UTC.
fn adjtime_says_utc(contents: &str) -> bool {
    match contents.lines().nth(2) {
        Some(line) => line.trim_end() != "LOCAL",
        None => true,
    }
}

pub fn hwclock_runs_in_utc() -> bool {
    fs::read_to_string("/etc/adjtime")
        .map(|contents| adjtime_says_utc(&contents))
        .unwrap_or(true)
}

pub fn initialize_system_clock_timezone() {
    let utc = hwclock_runs_in_utc();

    let seconds_west = unsafe {
        let now = libc::time(ptr::null_mut());
        let mut tm: libc::tm = mem::zeroed();
        if libc::localtime_r(&now, &mut tm).is_null() {
            warn!("localtime: {}", io::Error::last_os_error());
            return;
        }
        -tm.tm_gmtoff
    };

    // `libc::timezone` is declared as an opaque type on this target; mirror
    // its real (glibc) field layout locally so the struct can be built here.
    #[repr(C)]
    struct timezone {
        tz_minuteswest: libc::c_int,
        tz_dsttime: libc::c_int,
    }

    let mut tz = timezone {
        tz_minuteswest: 0,
        tz_dsttime: 0,
    };
    unsafe {
        if utc {
            // The first settimeofday after boot may warp the clock by the
            // given offset; calling it once with a zero offset uses that up
            // so the real call below only records the offset.
            libc::settimeofday(ptr::null(), &tz as *const timezone as *const libc::timezone);
        }
        // Record the RTC/FAT local-time offset; if the RTC is in local time
        // this same call steps the wall clock from local-as-if-UTC to UTC.
        tz.tz_minuteswest = (seconds_west / 60) as libc::c_int;
        if libc::settimeofday(ptr::null(), &tz as *const timezone as *const libc::timezone) != 0 {
            warn!("settimeofday: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjtime_third_line_selects_local() {
        assert!(!adjtime_says_utc("0.0 0 0.0\n0\nLOCAL\n"));
        assert!(adjtime_says_utc("0.0 0 0.0\n0\nUTC\n"));
    }

    #[test]
    fn short_or_empty_adjtime_means_utc() {
        assert!(adjtime_says_utc(""));
        assert!(adjtime_says_utc("0.0 0 0.0\n"));
        assert!(adjtime_says_utc("0.0 0 0.0\n0\n"));
    }
}
