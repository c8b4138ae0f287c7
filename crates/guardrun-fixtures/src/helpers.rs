//! Common test helper functions.
//!
//! Integration tests use these to build a throwaway project directory, a
//! configuration rooted in it, and to poll for processes the sandbox was
//! supposed to kill.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use guardrun::config::ResourceLimits;
use guardrun::{ConfigBuilder, GuardConfig};

/// Create a unique temporary directory for a test.
///
/// The name carries a timestamp and the process id so parallel test
/// binaries do not collide. The directory is created immediately.
///
/// # Panics
///
/// Panics if the directory cannot be created.
#[must_use]
pub fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("guardrun-{prefix}-{}-{stamp}", std::process::id()));

    #[allow(clippy::expect_used)]
    fs::create_dir_all(&dir).expect("failed to create temp directory");

    dir
}

/// Configuration rooted at `project`, with backups kept inside it.
///
/// Limits are sampled rather than enforced so fixtures behave the same on
/// hosts that forbid `setrlimit`.
///
/// # Panics
///
/// Panics if the resulting configuration fails validation.
#[must_use]
pub fn sandbox_config(project: &Path) -> GuardConfig {
    #[allow(clippy::expect_used)]
    ConfigBuilder::new()
        .project_root(project)
        .backup_dir(project.join(".backups"))
        .limits(ResourceLimits::unlimited())
        .soft_limits()
        .build()
        .expect("fixture configuration is valid")
}

/// Write a configuration to a JSON file.
///
/// # Panics
///
/// Panics if serialization or file writing fails.
pub fn write_config(path: &Path, config: &GuardConfig) {
    #[allow(clippy::expect_used)]
    let data = serde_json::to_vec_pretty(config).expect("failed to serialize config");

    #[allow(clippy::expect_used)]
    fs::write(path, data).expect("failed to write config file");
}

/// Read a pid written by `guardrun-sleep-tree`, waiting up to `timeout`
/// for the file to appear.
#[must_use]
pub fn wait_for_pid(path: &Path, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pid) = fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse().ok())
        {
            return Some(pid);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Whether `pid` is running. Zombies count as dead.
#[cfg(unix)]
#[must_use]
pub fn process_alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok(),
    }
}

/// Poll until `pid` exits or `timeout` elapses; returns whether it exited.
#[cfg(unix)]
#[must_use]
pub fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    true
}
