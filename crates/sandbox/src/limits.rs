//! OS resource limits applied to the worker process between `fork` and
//! `exec`.
//!
//! [`apply`] runs inside `pre_exec`, so it only makes raw syscalls: no
//! allocation, no locks.

use crate::config::SandboxConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerLimits {
    pub memory_bytes: u64,
    /// Soft CPU limit; the hard limit is one second higher
    pub cpu_seconds: u64,
    pub open_files: u64,
}

impl WorkerLimits {
    pub(crate) fn for_timeout(config: &SandboxConfig, timeout_ms: u64) -> Self {
        Self {
            memory_bytes: config.memory_limit_mb.saturating_mul(1024 * 1024),
            cpu_seconds: timeout_ms.div_ceil(1000) + 1,
            open_files: 16,
        }
    }
}

/// Whether [`apply`] can enforce limits on this platform.
pub(crate) const fn supported() -> bool {
    cfg!(unix)
}

#[cfg(unix)]
fn set(resource: libc::c_int, soft: u64, hard: u64) -> std::io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // The resource parameter type differs between libc targets.
    let ret_code = unsafe { libc::setrlimit(resource as _, &rlim) };
    if ret_code != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn apply(limits: WorkerLimits) -> std::io::Result<()> {
    set(libc::RLIMIT_AS as libc::c_int, limits.memory_bytes, limits.memory_bytes)?;
    set(libc::RLIMIT_CPU as libc::c_int, limits.cpu_seconds, limits.cpu_seconds + 1)?;
    set(libc::RLIMIT_CORE as libc::c_int, 0, 0)?;
    set(libc::RLIMIT_FSIZE as libc::c_int, 0, 0)?;
    set(libc::RLIMIT_NOFILE as libc::c_int, limits.open_files, limits.open_files)?;
    set(libc::RLIMIT_NPROC as libc::c_int, 0, 0)?;

    #[cfg(target_os = "linux")]
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // Die with the parent instead of lingering as an orphan.
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_limit_rounds_up_with_headroom() {
        let config = SandboxConfig::default();
        assert_eq!(WorkerLimits::for_timeout(&config, 1).cpu_seconds, 2);
        assert_eq!(WorkerLimits::for_timeout(&config, 1_000).cpu_seconds, 2);
        assert_eq!(WorkerLimits::for_timeout(&config, 1_001).cpu_seconds, 3);
        assert_eq!(WorkerLimits::for_timeout(&config, 1).memory_bytes, 1024 * 1024 * 1024);
    }
}
