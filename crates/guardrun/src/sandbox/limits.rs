//! Spawn-time resource ceilings.

use crate::config::ResourceLimits;
use std::fmt;
use std::process::Command;

/// Applies resource ceilings to a command before it is spawned.
///
/// Implementations must only install async-signal-safe work in the child.
pub trait ResourceLimiter: Send + Sync + fmt::Debug {
    /// Short name recorded in logs.
    fn name(&self) -> &'static str;

    /// Whether ceilings are enforced by the OS at spawn time.
    fn enforces(&self) -> bool;

    /// Configure `command` so the spawned process starts under `limits`.
    fn apply(&self, command: &mut Command, limits: &ResourceLimits);
}

/// POSIX `setrlimit` in a pre-exec hook: address space (data segment where
/// `RLIMIT_AS` is unavailable), CPU seconds and maximum file size.
#[derive(Clone, Copy, Debug, Default)]
pub struct RlimitLimiter;

/// Enforces nothing at spawn. Breaches are only detected by post-hoc
/// sampling of the process group, so a runaway process is stopped by the
/// wall-clock timeout at the latest.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftLimiter;

impl ResourceLimiter for SoftLimiter {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn enforces(&self) -> bool {
        false
    }

    fn apply(&self, _command: &mut Command, _limits: &ResourceLimits) {}
}

#[cfg(unix)]
impl ResourceLimiter for RlimitLimiter {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn enforces(&self) -> bool {
        true
    }

    fn apply(&self, command: &mut Command, limits: &ResourceLimits) {
        use nix::sys::resource::{setrlimit, Resource};
        use std::os::unix::process::CommandExt;

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        const MEMORY: Resource = Resource::RLIMIT_AS;
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        const MEMORY: Resource = Resource::RLIMIT_DATA;

        // (resource, soft, hard). The CPU hard limit sits one second above the
        // soft one so the process sees SIGXCPU before SIGKILL.
        let mut plan: Vec<(Resource, u64, u64)> = Vec::with_capacity(3);
        if let Some(bytes) = limits.memory_bytes {
            plan.push((MEMORY, bytes, bytes));
        }
        if let Some(secs) = limits.cpu_time_secs {
            plan.push((Resource::RLIMIT_CPU, secs, secs.saturating_add(1)));
        }
        if let Some(bytes) = limits.file_size_bytes {
            plan.push((Resource::RLIMIT_FSIZE, bytes, bytes));
        }
        if plan.is_empty() {
            return;
        }

        // SAFETY: the hook only calls setrlimit(2), which is async-signal-safe,
        // and iterates a vector allocated before fork.
        #[allow(unsafe_code)]
        unsafe {
            command.pre_exec(move || {
                for (resource, soft, hard) in &plan {
                    setrlimit(*resource, *soft, *hard).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }
    }
}

#[cfg(not(unix))]
impl ResourceLimiter for RlimitLimiter {
    fn name(&self) -> &'static str {
        "rlimit-unavailable"
    }

    fn enforces(&self) -> bool {
        false
    }

    fn apply(&self, _command: &mut Command, _limits: &ResourceLimits) {}
}

/// The limiter selected by configuration.
#[must_use]
pub fn default_limiter(enforce: bool) -> Box<dyn ResourceLimiter> {
    if enforce {
        Box::new(RlimitLimiter)
    } else {
        Box::new(SoftLimiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_selects_limiter() {
        assert_eq!(default_limiter(false).name(), "soft");
        assert!(!default_limiter(false).enforces());
        #[cfg(unix)]
        assert!(default_limiter(true).enforces());
    }
}
