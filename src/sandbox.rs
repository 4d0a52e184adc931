//! Run one external process under bounded time / memory / processes /
//! output, capturing stdio, exit status, signals and resource metrics
//! (component C).
//!
//! Grounded in the Polkadot PVF execute worker's use of
//! `nix::sys::resource`/`nix::sys::wait` to read resource accounting from
//! the kernel at child exit rather than estimating it, and in
//! `snowflake`'s `RunCommand` action for the shape of a timeout-bounded
//! external-command invocation with a structured outcome. The
//! `std::process::Command` plumbing itself follows `Solc::configure_cmd`'s
//! build-args-then-spawn shape.

use crate::descriptor::SandboxProfile;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    TimeLimitExceeded,
    WallTimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    SandboxError,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Outcome {
    pub status: Status,
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub memory_kib: u64,
    pub exit_code: Option<i32>,
    pub termination_signal: Option<i32>,
    pub output_truncated: bool,
    /// Populated only when the caller asked for in-memory capture rather
    /// than a file sink.
    #[serde(skip)]
    pub stdout: Vec<u8>,
    #[serde(skip)]
    pub stderr: Vec<u8>,
    #[serde(skip)]
    pub error_detail: Option<String>,
}

impl Outcome {
    pub(crate) fn sandbox_error(detail: impl Into<String>) -> Self {
        Self {
            status: Status::SandboxError,
            cpu_ms: 0,
            wall_ms: 0,
            memory_kib: 0,
            exit_code: None,
            termination_signal: None,
            output_truncated: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            error_detail: Some(detail.into()),
        }
    }
}

#[derive(Debug)]
pub enum Stdin {
    Empty,
    Bytes(Vec<u8>),
    File(PathBuf),
    /// Hand the child this exact descriptor as stdin (e.g. one end of a
    /// pipe owned by another sandboxed process). Unix-only since it wraps
    /// an `OwnedFd`; used by the interactive runner (component D) to wire
    /// two sandboxed children together without giving up rlimit/rusage
    /// coverage.
    #[cfg(unix)]
    Fd(std::os::fd::OwnedFd),
}

#[derive(Debug)]
pub enum OutputSink {
    /// Capture up to `profile.output_kib` into memory.
    Capture,
    /// Redirect directly to a file; truncation is bounded by `RLIMIT_FSIZE`
    /// rather than tracked by this process.
    File(PathBuf),
    /// Hand the child this exact descriptor as its stream. See [`Stdin::Fd`].
    #[cfg(unix)]
    Fd(std::os::fd::OwnedFd),
}

pub struct Mount {
    pub host_path: PathBuf,
    pub writable: bool,
}

#[derive(Default)]
pub struct RunRequest {
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Stdin>,
    pub stdout: Option<OutputSink>,
    pub stderr: Option<OutputSink>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
}

impl Default for Stdin {
    fn default() -> Self {
        Stdin::Empty
    }
}

/// Runs `argv` under `profile`'s limits. Every failure mode — a missing
/// binary, a failed mount, a resource trip, a plain non-zero exit — is
/// represented in the returned `Outcome.status`; this function itself
/// never returns an `Err`, so callers always get metrics back even for a
/// `SandboxError` (infrastructure failure), and can decide independently
/// whether to retry (§7).
#[instrument(skip(request), fields(argv0 = %argv.first().map(String::as_str).unwrap_or("")))]
pub fn run(profile: &SandboxProfile, argv: &[String], request: RunRequest) -> Outcome {
    if argv.is_empty() {
        return Outcome::sandbox_error("empty argv");
    }

    for mount in &request.mounts {
        if !mount.host_path.exists() {
            return Outcome::sandbox_error(format!(
                "mount path does not exist: {}",
                mount.host_path.display()
            ));
        }
    }

    imp::run(profile, argv, request)
}

#[cfg(unix)]
mod imp {
    use super::*;
    use nix::sys::resource::{setrlimit, Resource};
    use nix::sys::signal::{self, Signal};
    use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;
    use std::fs::File;
    use std::os::unix::process::ExitStatusExt;

    pub fn run(profile: &SandboxProfile, argv: &[String], request: RunRequest) -> Outcome {
        match spawn(profile, argv, request) {
            Ok(spawned) => await_spawned(spawned, profile),
            Err(outcome) => outcome,
        }
    }

    /// A spawned-but-not-yet-awaited child: rlimits are already applied
    /// (via `pre_exec`) and the wall-clock watcher thread is already
    /// running. Splitting `run` into `spawn` + `await_spawned` lets the
    /// interactive runner (component D) start both of its children before
    /// blocking on either, while still routing each one through the same
    /// rlimit/rusage/output-cap machinery as a batch run.
    pub(crate) struct Spawned {
        child: std::process::Child,
        pid: Pid,
        timed_out: Arc<AtomicBool>,
        watcher: std::thread::JoinHandle<()>,
        start: Instant,
        capture_stdout: bool,
        capture_stderr: bool,
        output_cap: usize,
    }

    pub(crate) fn spawn(
        profile: &SandboxProfile,
        argv: &[String],
        request: RunRequest,
    ) -> Result<Spawned, Outcome> {
        if argv.is_empty() {
            return Err(Outcome::sandbox_error("empty argv"));
        }

        let mut cmd = std::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env_clear();
        for (k, v) in &request.env {
            cmd.env(k, v);
        }

        let capture_stdout = matches!(request.stdout, None | Some(OutputSink::Capture));
        let capture_stderr = matches!(request.stderr, None | Some(OutputSink::Capture));

        let stdin_bytes = match &request.stdin {
            Some(Stdin::Bytes(b)) => Some(b.clone()),
            _ => None,
        };

        match request.stdin {
            Some(Stdin::File(path)) => match File::open(&path) {
                Ok(f) => {
                    cmd.stdin(Stdio::from(f));
                }
                Err(e) => return Err(Outcome::sandbox_error(format!("open stdin file: {e}"))),
            },
            Some(Stdin::Fd(fd)) => {
                cmd.stdin(Stdio::from(fd));
            }
            Some(Stdin::Bytes(_)) | None => {
                cmd.stdin(Stdio::piped());
            }
            Some(Stdin::Empty) => {
                cmd.stdin(Stdio::null());
            }
        }

        if capture_stdout {
            cmd.stdout(Stdio::piped());
        } else {
            match request.stdout {
                Some(OutputSink::File(path)) => match File::create(&path) {
                    Ok(f) => {
                        cmd.stdout(Stdio::from(f));
                    }
                    Err(e) => return Err(Outcome::sandbox_error(format!("create stdout file: {e}"))),
                },
                Some(OutputSink::Fd(fd)) => {
                    cmd.stdout(Stdio::from(fd));
                }
                _ => {}
            }
        }

        if capture_stderr {
            cmd.stderr(Stdio::piped());
        } else {
            match request.stderr {
                Some(OutputSink::File(path)) => match File::create(&path) {
                    Ok(f) => {
                        cmd.stderr(Stdio::from(f));
                    }
                    Err(e) => return Err(Outcome::sandbox_error(format!("create stderr file: {e}"))),
                },
                Some(OutputSink::Fd(fd)) => {
                    cmd.stderr(Stdio::from(fd));
                }
                _ => {}
            }
        }

        let limits = profile.clone();
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&limits));
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return Err(Outcome::sandbox_error(format!("spawn failed: {e}"))),
        };
        let pid = Pid::from_raw(child.id() as i32);

        if let Some(bytes) = stdin_bytes {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(&bytes);
                // drop closes the pipe, signalling EOF to the child.
            }
        } else {
            child.stdin.take();
        }

        let timed_out = Arc::new(AtomicBool::new(false));
        let watcher_pid = pid;
        let watcher_flag = timed_out.clone();
        let wall_budget = Duration::from_millis(profile.wall_ms);
        let watcher = std::thread::spawn(move || {
            std::thread::sleep(wall_budget);
            watcher_flag.store(true, Ordering::SeqCst);
            // A strong signal, as required: the wall clock is the ultimate
            // upper bound and is never negotiated with the child.
            let _ = signal::kill(watcher_pid, Signal::SIGKILL);
        });

        let output_cap = (profile.output_kib as usize) * 1024;

        Ok(Spawned { child, pid, timed_out, watcher, start, capture_stdout, capture_stderr, output_cap })
    }

    pub(crate) fn await_spawned(spawned: Spawned, profile: &SandboxProfile) -> Outcome {
        let Spawned { mut child, pid, timed_out, watcher, start, capture_stdout, capture_stderr, output_cap } =
            spawned;

        let (stdout_bytes, stdout_truncated) =
            drain_capped(child.stdout.take(), capture_stdout, output_cap);
        let (stderr_bytes, stderr_truncated) =
            drain_capped(child.stderr.take(), capture_stderr, output_cap);

        let wait_result = wait::waitpid(pid, Some(WaitPidFlag::empty()));
        let wall_elapsed = start.elapsed();

        // The watcher thread's own sleep may already be past due; join it
        // either way so no thread outlives this call. A kill on an
        // already-exited pid is a harmless ESRCH.
        let _ = watcher.join();

        let usage = read_rusage(pid);

        let (wait_status, exit_code, termination_signal) = match wait_result {
            Ok(WaitStatus::Exited(_, code)) => (WaitStatus::Exited(pid, code), Some(code), None),
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                (WaitStatus::Signaled(pid, sig, false), None, Some(sig as i32))
            }
            Ok(other) => (other, None, None),
            Err(e) => return Outcome::sandbox_error(format!("waitpid failed: {e}")),
        };

        let cpu_ms = usage.map(|u| u.cpu_ms).unwrap_or(0);
        let memory_kib = usage.map(|u| u.memory_kib).unwrap_or(0);
        let output_truncated = stdout_truncated || stderr_truncated;

        let status = classify(
            &wait_status,
            timed_out.load(Ordering::SeqCst),
            cpu_ms,
            profile.cpu_ms,
            memory_kib,
            profile.memory_kib,
            output_truncated,
            exit_code,
        );

        Outcome {
            status,
            cpu_ms,
            wall_ms: wall_elapsed.as_millis() as u64,
            memory_kib,
            exit_code,
            termination_signal,
            output_truncated,
            stdout: stdout_bytes,
            stderr: stderr_bytes,
            error_detail: None,
        }
    }

    fn apply_rlimits(profile: &SandboxProfile) -> std::io::Result<()> {
        let cpu_limit = profile.cpu_ms.div_ceil(1000).max(1);
        setrlimit(Resource::RLIMIT_CPU, cpu_limit, cpu_limit)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let mem_bytes = profile.memory_kib * 1024;
        setrlimit(Resource::RLIMIT_AS, mem_bytes, mem_bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        setrlimit(Resource::RLIMIT_NPROC, profile.processes as u64, profile.processes as u64)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        if let Some(stack_kib) = profile.stack_kib {
            let stack_bytes = stack_kib * 1024;
            setrlimit(Resource::RLIMIT_STACK, stack_bytes, stack_bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        }

        let output_bytes = profile.output_kib * 1024;
        setrlimit(Resource::RLIMIT_FSIZE, output_bytes, output_bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        Ok(())
    }

    struct Usage {
        cpu_ms: u64,
        memory_kib: u64,
    }

    /// Reads accounting for `pid` from `RUSAGE_CHILDREN`. This is an
    /// approximation when multiple sandboxed children run concurrently in
    /// the same process (their rusage is summed by the kernel), which is
    /// the tradeoff for using the portable `getrusage(2)` family instead of
    /// per-child cgroup accounting; the wall clock (measured directly
    /// around this call) remains exact regardless.
    fn read_rusage(_pid: Pid) -> Option<Usage> {
        use nix::sys::resource::{getrusage, UsageWho};
        use nix::sys::time::TimeValLike;
        let usage = getrusage(UsageWho::RUSAGE_CHILDREN).ok()?;
        let cpu = usage.user_time() + usage.system_time();
        Some(Usage {
            cpu_ms: (cpu.num_seconds() as u64) * 1000 + (cpu.num_nanoseconds().unwrap_or(0) as u64 / 1_000_000),
            memory_kib: usage.max_rss() as u64,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn classify(
        wait_status: &WaitStatus,
        timed_out: bool,
        cpu_ms: u64,
        cpu_limit_ms: u64,
        memory_kib: u64,
        memory_limit_kib: u64,
        output_truncated: bool,
        exit_code: Option<i32>,
    ) -> Status {
        if timed_out {
            return Status::WallTimeLimitExceeded;
        }
        if cpu_ms >= cpu_limit_ms {
            return Status::TimeLimitExceeded;
        }
        if matches!(wait_status, WaitStatus::Signaled(_, Signal::SIGKILL | Signal::SIGSEGV, _))
            && memory_kib >= memory_limit_kib
        {
            return Status::MemoryLimitExceeded;
        }
        if output_truncated && exit_code == Some(0) {
            return Status::OutputLimitExceeded;
        }
        match exit_code {
            Some(0) => Status::Ok,
            Some(_) => Status::RuntimeError,
            None => Status::RuntimeError,
        }
    }

    fn drain_capped(
        pipe: Option<impl Read>,
        enabled: bool,
        cap: usize,
    ) -> (Vec<u8>, bool) {
        let Some(mut pipe) = pipe else {
            return (Vec::new(), false);
        };
        if !enabled {
            return (Vec::new(), false);
        }
        let mut buf = Vec::with_capacity(cap.min(64 * 1024));
        let mut chunk = [0u8; 8192];
        let mut truncated = false;
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if buf.len() + n > cap {
                        buf.extend_from_slice(&chunk[..cap.saturating_sub(buf.len())]);
                        truncated = true;
                        // Keep draining so the child doesn't block on a full
                        // pipe, but discard the rest.
                        let mut sink = [0u8; 8192];
                        while let Ok(m) = pipe.read(&mut sink) {
                            if m == 0 {
                                break;
                            }
                        }
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                Err(_) => break,
            }
        }
        (buf, truncated)
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub fn run(_profile: &SandboxProfile, _argv: &[String], _request: RunRequest) -> Outcome {
        Outcome::sandbox_error("sandbox backend not implemented on this platform")
    }
}

/// Exposed to [`crate::interactive`] so the interactive runner (component
/// D) can spawn its two children under the same rlimit/watcher machinery
/// as a batch run, without serialising them: both are spawned before
/// either is awaited.
#[cfg(unix)]
pub(crate) use imp::{await_spawned, spawn, Spawned};

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SandboxProfile {
        SandboxProfile {
            id: "test".into(),
            cpu_ms: 2000,
            wall_ms: 2000,
            memory_kib: 256 * 1024,
            processes: 16,
            output_kib: 1024,
            stack_kib: None,
            read_only_mounts: vec![],
            read_write_mounts: vec![],
            env_whitelist: vec![],
            piped_stdio: true,
        }
    }

    #[test]
    #[cfg(unix)]
    fn ok_exit() {
        let p = profile();
        let outcome = run(&p, &["/bin/echo".into(), "hi".into()], RunRequest::default());
        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "hi");
    }

    #[test]
    #[cfg(unix)]
    fn nonzero_exit_is_runtime_error() {
        let p = profile();
        let outcome = run(&p, &["/bin/false".into()], RunRequest::default());
        assert_eq!(outcome.status, Status::RuntimeError);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[test]
    #[cfg(unix)]
    fn wall_limit_kills_a_sleeping_process() {
        let mut p = profile();
        p.wall_ms = 200;
        p.cpu_ms = 5000;
        let outcome = run(&p, &["/bin/sleep".into(), "5".into()], RunRequest::default());
        assert_eq!(outcome.status, Status::WallTimeLimitExceeded);
        assert!(outcome.wall_ms < 1000);
    }

    #[test]
    #[cfg(unix)]
    fn missing_mount_is_a_sandbox_error() {
        let p = profile();
        let request = RunRequest {
            mounts: vec![Mount { host_path: "/no/such/path".into(), writable: false }],
            ..Default::default()
        };
        let outcome = run(&p, &["/bin/echo".into()], request);
        assert_eq!(outcome.status, Status::SandboxError);
    }
}
