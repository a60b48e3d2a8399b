//! Process-group signalling.
//!
//! Scripts are spawned with `process_group(0)`, so their PID doubles as the
//! PGID and a negative-PID `kill` reaches every process the script started.

use libc::{c_int, pid_t, ESRCH};

/// Send `signal` to a process group.
pub fn kill_process_group(pgid: u32, signal: c_int) -> Result<(), &'static str> {
    // Safety: kill() is a plain syscall; a negative pid addresses the group
    let rc = unsafe { libc::kill(-(pgid as pid_t), signal) };
    if rc == 0 {
        Ok(())
    } else {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        match errno {
            libc::ESRCH => Err("No such process group"),
            libc::EPERM => Err("Permission denied"),
            libc::EINVAL => Err("Invalid signal"),
            _ => Err("Unknown error"),
        }
    }
}

/// Whether any process in the group is still alive.
///
/// EPERM counts as alive: the group exists, we just may not signal it.
pub fn process_group_alive(pgid: u32) -> bool {
    // Safety: signal 0 only checks for existence
    let rc = unsafe { libc::kill(-(pgid as pid_t), 0) };
    if rc == 0 {
        true
    } else {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        errno != ESRCH
    }
}

pub const SIGTERM: c_int = libc::SIGTERM;
