//! Process-level resource limits for workers.

#[cfg(unix)]
use tracing::info;

/// Cap the worker's address space so a leaking or runaway handler kills the
/// process instead of the host. The killer-task guard picks up the pieces on
/// the next start.
#[cfg(unix)]
pub fn apply_memory_limit(limit_mib: Option<u64>) -> anyhow::Result<()> {
    let Some(limit_mib) = limit_mib else {
        return Ok(());
    };
    let bytes = limit_mib * 1024 * 1024;

    // Keep the hard limit; only lower the soft limit, and never above it.
    unsafe {
        let mut rlimit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_AS, &mut rlimit) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let capped = if rlimit.rlim_max == libc::RLIM_INFINITY {
            bytes as libc::rlim_t
        } else {
            (bytes as libc::rlim_t).min(rlimit.rlim_max)
        };
        rlimit.rlim_cur = capped;
        if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }

    info!(limit_mib, "Worker memory limit applied");
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_memory_limit(_limit_mib: Option<u64>) -> anyhow::Result<()> {
    Ok(())
}
