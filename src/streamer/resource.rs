//! File descriptor budget for audience connections

use std::io;

/// Soft limit on open files for this process
pub fn soft_fd_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we hand it
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if limit.rlim_cur == libc::RLIM_INFINITY {
        return Ok(u64::MAX);
    }
    Ok(limit.rlim_cur as u64)
}

/// Clients the streamer may serve at once
///
/// The descriptor budget (soft limit minus `reserved`) always applies; a
/// configured maximum can only lower it.
pub fn max_allowed_clients(max_clients: Option<usize>, fd_limit: u64, reserved: u64) -> usize {
    let budget = usize::try_from(fd_limit.saturating_sub(reserved)).unwrap_or(usize::MAX);
    match max_clients {
        Some(max) if max <= budget => max,
        _ => budget,
    }
}
