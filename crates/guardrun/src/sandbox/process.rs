//! Spawning, supervision and teardown of one sandboxed process group.

use crate::config::ResourceLimits;
use crate::error::{GuardError, GuardResult};
use crate::model::ResourceUsage;
use crate::sandbox::limits::ResourceLimiter;
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 8192;
/// How long reader threads may keep running after the group is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

pub(crate) struct SpawnRequest<'a> {
    pub shell: &'a Path,
    pub command: &'a str,
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub limits: &'a ResourceLimits,
    pub limiter: &'a dyn ResourceLimiter,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub sample_interval: Duration,
    pub kill_grace: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct CapturedStream {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug)]
pub(crate) struct ProcessOutcome {
    /// Exit status of the shell when it exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal of the shell.
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub usage: ResourceUsage,
    pub duration: Duration,
}

/// Run `shell -c command` in its own process group and supervise it until
/// it exits or the deadline passes. The group is always torn down before
/// this returns.
pub(crate) fn run_process(request: &SpawnRequest<'_>) -> GuardResult<ProcessOutcome> {
    let started = Instant::now();
    let mut command = Command::new(request.shell);
    command
        .arg("-c")
        .arg(request.command)
        .current_dir(request.cwd)
        .env_clear()
        .envs(request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    request.limiter.apply(&mut command, request.limits);

    let mut child = command
        .spawn()
        .map_err(|err| GuardError::spawn("failed to spawn sandboxed process", err))?;
    let group = ProcessGroup::of(&child);
    tracing::debug!(pid = child.id(), limiter = request.limiter.name(), "spawned sandboxed process");

    let (stdout_pump, stderr_pump) = match start_pumps(&mut child, request.max_output_bytes) {
        Ok(pumps) => pumps,
        Err(err) => {
            group.kill_now();
            let _ = child.wait();
            return Err(err);
        }
    };

    let mut sampler = Sampler::new(group.raw_id());
    let supervised = supervise(&mut child, &group, &mut sampler, request, started);

    // Background members outlive the shell; nothing in the group survives.
    group.kill_now();
    if !group.wait_until_empty(request.kill_grace) {
        tracing::debug!("process group still reported after kill, members may be unreaped");
    }
    let (status, timed_out) = supervised?;

    let stdout = stdout_pump.finish();
    let stderr = stderr_pump.finish();
    let (exit_code, signal) = status_parts(status);
    Ok(ProcessOutcome {
        exit_code,
        signal,
        timed_out,
        stdout,
        stderr,
        usage: sampler.usage(),
        duration: started.elapsed(),
    })
}

fn supervise(
    child: &mut Child,
    group: &ProcessGroup,
    sampler: &mut Sampler,
    request: &SpawnRequest<'_>,
    started: Instant,
) -> GuardResult<(ExitStatus, bool)> {
    let mut next_sample = started;
    loop {
        let polled = child
            .try_wait()
            .map_err(|err| GuardError::io("failed to wait for sandboxed process", err))?;
        if let Some(status) = polled {
            return Ok((status, false));
        }
        let now = Instant::now();
        if now >= next_sample {
            sampler.sample();
            next_sample = now + request.sample_interval;
        }
        if now.duration_since(started) >= request.timeout {
            tracing::warn!(
                timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
                "sandboxed process exceeded its timeout, terminating process group"
            );
            let status = group.terminate(child, request.kill_grace)?;
            return Ok((status, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> GuardResult<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => return Err(GuardError::io("failed to wait for child", err)),
        }
    }
}

#[cfg(unix)]
fn status_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn status_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}

// =============================================================================
// Process group
// =============================================================================

struct ProcessGroup {
    #[cfg(unix)]
    pgid: Option<Pid>,
}

impl ProcessGroup {
    /// The child was spawned with `process_group(0)`, so its pid is the pgid.
    #[cfg(unix)]
    fn of(child: &Child) -> Self {
        Self {
            pgid: i32::try_from(child.id()).ok().map(Pid::from_raw),
        }
    }

    #[cfg(not(unix))]
    fn of(_child: &Child) -> Self {
        Self {}
    }

    #[cfg(unix)]
    fn raw_id(&self) -> Option<i32> {
        self.pgid.map(Pid::as_raw)
    }

    #[cfg(not(unix))]
    fn raw_id(&self) -> Option<i32> {
        None
    }

    /// SIGTERM, a grace period, then SIGKILL. Returns the shell's status.
    fn terminate(&self, child: &mut Child, grace: Duration) -> GuardResult<ExitStatus> {
        #[cfg(unix)]
        self.signal(Signal::SIGTERM);
        #[cfg(not(unix))]
        let _ = child.kill();
        if let Some(status) = wait_for_exit(child, grace)? {
            return Ok(status);
        }
        self.kill_now();
        let _ = child.kill();
        child
            .wait()
            .map_err(|err| GuardError::io("failed to reap killed process", err))
    }

    fn kill_now(&self) {
        #[cfg(unix)]
        self.signal(Signal::SIGKILL);
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, signal) {
            // ESRCH means the group is already gone, which is fine
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => tracing::warn!(%err, ?signal, "failed to signal process group"),
        }
    }

    /// Poll with the null signal until no member of the group exists.
    #[cfg(unix)]
    fn wait_until_empty(&self, bound: Duration) -> bool {
        let Some(pgid) = self.pgid else {
            return true;
        };
        let deadline = Instant::now() + bound;
        loop {
            if matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    #[cfg(not(unix))]
    fn wait_until_empty(&self, _bound: Duration) -> bool {
        true
    }
}

// =============================================================================
// Output capture
// =============================================================================

#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Drains one pipe on its own thread. Bytes beyond the limit are read and
/// discarded so the child never blocks on a full pipe.
struct StreamPump {
    capture: Arc<Mutex<Capture>>,
    done: mpsc::Receiver<()>,
    limit: usize,
}

fn start_pumps(child: &mut Child, limit: usize) -> GuardResult<(StreamPump, StreamPump)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| GuardError::internal("stdout pipe missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| GuardError::internal("stderr pipe missing"))?;
    Ok((
        StreamPump::start("stdout", stdout, limit)?,
        StreamPump::start("stderr", stderr, limit)?,
    ))
}

impl StreamPump {
    fn start<R: Read + Send + 'static>(name: &str, reader: R, limit: usize) -> GuardResult<Self> {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let (done_tx, done) = mpsc::channel();
        let shared = Arc::clone(&capture);
        thread::Builder::new()
            .name(format!("guardrun-{name}"))
            .spawn(move || {
                pump(reader, &shared, limit);
                let _ = done_tx.send(());
            })
            .map_err(|err| GuardError::spawn("failed to start output reader", err))?;
        Ok(Self {
            capture,
            done,
            limit,
        })
    }

    fn finish(self) -> CapturedStream {
        if self.done.recv_timeout(DRAIN_GRACE).is_err() {
            tracing::debug!("output pipe still open after the process group exited");
        }
        let capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        let mut text = String::from_utf8_lossy(&capture.bytes).into_owned();
        if capture.truncated {
            text.push_str(&format!(
                "\n[guardrun: output truncated after {} bytes]",
                self.limit
            ));
        }
        CapturedStream {
            text,
            truncated: capture.truncated,
        }
    }
}

fn pump<R: Read>(mut reader: R, capture: &Mutex<Capture>, limit: usize) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => {
                let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
                let room = limit.saturating_sub(capture.bytes.len());
                if let Some(chunk) = buf.get(..read) {
                    capture.bytes.extend(chunk.iter().take(room));
                }
                if read > room {
                    capture.truncated = true;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
}

// =============================================================================
// Resource sampling
// =============================================================================

/// Periodic `/proc` sampling of every member of the process group.
#[derive(Debug)]
struct Sampler {
    pgid: Option<i32>,
    peak_memory_bytes: u64,
    cpu_ticks: HashMap<i32, u64>,
    samples: u32,
    page_size: u64,
    clock_ticks: u64,
}

impl Sampler {
    fn new(pgid: Option<i32>) -> Self {
        let (page_size, clock_ticks) = system_units();
        Self {
            pgid,
            peak_memory_bytes: 0,
            cpu_ticks: HashMap::new(),
            samples: 0,
            page_size,
            clock_ticks,
        }
    }

    #[cfg(target_os = "linux")]
    fn sample(&mut self) {
        let Some(pgid) = self.pgid else {
            return;
        };
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return;
        };
        let mut rss_bytes: u64 = 0;
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            let Some(fields) = parse_stat(&stat) else {
                continue;
            };
            if fields.pgrp != pgid {
                continue;
            }
            rss_bytes = rss_bytes.saturating_add(fields.rss_pages.saturating_mul(self.page_size));
            let ticks = self.cpu_ticks.entry(pid).or_insert(0);
            *ticks = (*ticks).max(fields.utime.saturating_add(fields.stime));
        }
        self.samples = self.samples.saturating_add(1);
        self.peak_memory_bytes = self.peak_memory_bytes.max(rss_bytes);
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self) {}

    fn usage(&self) -> ResourceUsage {
        let ticks: u64 = self.cpu_ticks.values().sum();
        ResourceUsage {
            sampled: self.samples > 0 && !self.cpu_ticks.is_empty(),
            peak_memory_bytes: self.peak_memory_bytes,
            cpu_time_ms: ticks.saturating_mul(1000) / self.clock_ticks.max(1),
            processes_seen: u32::try_from(self.cpu_ticks.len()).unwrap_or(u32::MAX),
        }
    }
}

#[cfg(target_os = "linux")]
fn system_units() -> (u64, u64) {
    use nix::unistd::{sysconf, SysconfVar};
    let query = |var| {
        sysconf(var)
            .ok()
            .flatten()
            .and_then(|value| u64::try_from(value).ok())
    };
    (
        query(SysconfVar::PAGE_SIZE).unwrap_or(4096),
        query(SysconfVar::CLK_TCK).unwrap_or(100),
    )
}

#[cfg(not(target_os = "linux"))]
fn system_units() -> (u64, u64) {
    (4096, 100)
}

#[derive(Debug, PartialEq, Eq)]
struct StatFields {
    pgrp: i32,
    utime: u64,
    stime: u64,
    rss_pages: u64,
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(stat: &str) -> Option<StatFields> {
    let after_name = stat.get(stat.rfind(')')? + 1..)?;
    // Index 0 is field 3 (state) of proc(5).
    let fields: Vec<&str> = after_name.split_whitespace().collect();
    let rss: i64 = fields.get(21)?.parse().ok()?;
    Some(StatFields {
        pgrp: fields.get(2)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        rss_pages: u64::try_from(rss).unwrap_or(0),
    })
}
