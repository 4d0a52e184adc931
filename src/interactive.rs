//! Two-process interactive execution: a solution and an interactor
//! connected by real OS pipes, so the kernel relays bytes between them
//! directly rather than this process copying data back and forth
//! (component D).
//!
//! Grounded in the Polkadot PVF worker's child-process plumbing for the
//! `nix::unistd::pipe()` + `Stdio::from(OwnedFd)` idiom, generalised from
//! one child to a pair wired solution-stdout -> interactor-stdin and
//! interactor-stdout -> solution-stdin.

use crate::descriptor::SandboxProfile;
use crate::sandbox::{Outcome, Status};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::instrument;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InteractiveVerdict {
    Ac,
    Wa,
    Pe,
    Tle,
    Mle,
    Re,
    Ole,
    Ie,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractiveOutcome {
    pub verdict: InteractiveVerdict,
    pub solution: Outcome,
    pub interactor: Outcome,
    pub checker_message: Option<String>,
}

pub struct InteractiveRequest {
    pub solution_argv: Vec<String>,
    pub interactor_argv: Vec<String>,
    pub solution_profile: SandboxProfile,
    pub interactor_profile: SandboxProfile,
    pub input_file: PathBuf,
    pub judge_log_path: Option<PathBuf>,
}

/// Runs `solution_argv` and `interactor_argv` as a connected pair, applying
/// the reconciliation rules below to the two independent [`Outcome`]s.
///
/// Reconciliation (spec §4.D):
/// 1. If the interactor exits with a testlib verdict code (AC/WA/PE/Fail),
///    that verdict is authoritative, unless overridden by rule 2.
/// 2. A solution TLE/MLE/OLE/RE dominates regardless of what the
///    interactor reports — the solution is what's being judged.
/// 3. If the interactor terminated with `SIGPIPE` because the solution
///    already finished, that is not an independent interactor failure; the
///    solution's own outcome stands.
/// 4. If the interactor hangs after the solution is done, its own
///    wall-limit trip is not charged to the solution either — same
///    handling as rule 3.
/// 5. If both are otherwise clean and the solution exited zero, the
///    verdict is `Ac` unless the interactor's judge log says otherwise.
#[instrument(skip(request), fields(solution = %request.solution_argv.first().map(String::as_str).unwrap_or("")))]
pub fn run(request: InteractiveRequest) -> InteractiveOutcome {
    let (sol_read_fd, sol_write_fd) = match make_pipe() {
        Ok(p) => p,
        Err(e) => return infra_failure(e),
    };
    let (int_read_fd, int_write_fd) = match make_pipe() {
        Ok(p) => p,
        Err(e) => return infra_failure(e),
    };

    // solution stdout -> interactor stdin: sol_write_fd / sol_read_fd
    // interactor stdout -> solution stdin: int_write_fd / int_read_fd
    platform::run_pair(request, (sol_read_fd, sol_write_fd), (int_read_fd, int_write_fd))
}

fn infra_failure(detail: impl Into<String>) -> InteractiveOutcome {
    let detail = detail.into();
    InteractiveOutcome {
        verdict: InteractiveVerdict::Ie,
        solution: Outcome::sandbox_error(detail.clone()),
        interactor: Outcome::sandbox_error(detail),
        checker_message: None,
    }
}

fn make_pipe() -> std::io::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
    platform::pipe()
}

/// Reconciles two independent sandbox outcomes plus the interactor's own
/// reported verdict (if any) into one [`InteractiveVerdict`].
fn reconcile(
    solution: &Outcome,
    interactor: &Outcome,
    interactor_said: Option<InteractiveVerdict>,
) -> InteractiveVerdict {
    match solution.status {
        Status::TimeLimitExceeded | Status::WallTimeLimitExceeded => return InteractiveVerdict::Tle,
        Status::MemoryLimitExceeded => return InteractiveVerdict::Mle,
        Status::OutputLimitExceeded => return InteractiveVerdict::Ole,
        Status::SandboxError => return InteractiveVerdict::Ie,
        Status::RuntimeError => {
            // A solution that crashed because the interactor closed its
            // pipe first (broken pipe, SIGPIPE) is not an independent
            // failure: it is downstream of the interactor's own verdict.
            if is_broken_pipe(solution) && interactor.status == Status::Ok {
                // fall through to the interactor's verdict
            } else {
                return InteractiveVerdict::Re;
            }
        }
        Status::Ok => {
            // Rules 3 and 4: the solution already finished cleanly, so
            // anything that happened to the interactor afterward as a
            // direct result — it got SIGPIPE writing/reading against a
            // peer that's gone, or it hit its own wall limit waiting on a
            // peer that will never respond — is not charged to the
            // solution.
            if is_broken_pipe(interactor) || interactor.status == Status::WallTimeLimitExceeded {
                return interactor_said.unwrap_or(InteractiveVerdict::Ac);
            }
        }
    }

    match interactor.status {
        Status::SandboxError => InteractiveVerdict::Ie,
        Status::RuntimeError => interactor_said.unwrap_or(InteractiveVerdict::Wa),
        Status::Ok => interactor_said.unwrap_or(InteractiveVerdict::Ie),
        _ => InteractiveVerdict::Ie,
    }
}

fn is_broken_pipe(outcome: &Outcome) -> bool {
    // SIGPIPE == 13 on every platform `nix` builds for.
    outcome.termination_signal == Some(13)
}

#[cfg(unix)]
mod platform {
    use super::*;
    use crate::sandbox::{self, OutputSink, RunRequest, Stdin};
    use nix::unistd;
    use std::os::fd::OwnedFd;

    pub fn pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
        unistd::pipe().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Spawns both children through [`sandbox::spawn`] — the same
    /// rlimit-applying, watcher-starting entry point a batch run uses —
    /// then awaits them in turn. Both are spawned before either is
    /// awaited, so they run concurrently even though the waits below are
    /// sequential: waiting on the solution does not pause the interactor,
    /// which keeps running in the kernel regardless of what this thread is
    /// blocked on.
    pub fn run_pair(
        request: InteractiveRequest,
        sol_pipe: (OwnedFd, OwnedFd),
        int_pipe: (OwnedFd, OwnedFd),
    ) -> InteractiveOutcome {
        // sol_pipe = (read end given to interactor's stdin, write end given
        // to solution's stdout); int_pipe mirrors this the other way.
        let (sol_read, sol_write) = sol_pipe;
        let (int_read, int_write) = int_pipe;

        let sol_request = RunRequest {
            stdin: Some(Stdin::Fd(int_read)),
            stdout: Some(OutputSink::Fd(sol_write)),
            stderr: Some(OutputSink::Capture),
            ..RunRequest::default()
        };
        let sol_spawned = match sandbox::spawn(&request.solution_profile, &request.solution_argv, sol_request) {
            Ok(s) => s,
            Err(outcome) => {
                return InteractiveOutcome {
                    verdict: InteractiveVerdict::Ie,
                    interactor: Outcome::sandbox_error("solution spawn failed; interactor never ran"),
                    solution: outcome,
                    checker_message: None,
                };
            }
        };

        let mut interactor_argv = request.interactor_argv.clone();
        interactor_argv.push(request.input_file.to_string_lossy().into_owned());
        let int_request = RunRequest {
            stdin: Some(Stdin::Fd(sol_read)),
            stdout: Some(OutputSink::Fd(int_write)),
            stderr: Some(OutputSink::Capture),
            ..RunRequest::default()
        };
        let int_spawned = match sandbox::spawn(&request.interactor_profile, &interactor_argv, int_request) {
            Ok(s) => s,
            Err(outcome) => {
                // The solution is already running against a now-orphaned
                // pipe; await it so it isn't left dangling, but the run as
                // a whole is an infrastructure failure.
                let solution = sandbox::await_spawned(sol_spawned, &request.solution_profile);
                return InteractiveOutcome {
                    verdict: InteractiveVerdict::Ie,
                    solution,
                    interactor: outcome,
                    checker_message: None,
                };
            }
        };

        let solution = sandbox::await_spawned(sol_spawned, &request.solution_profile);
        let interactor = sandbox::await_spawned(int_spawned, &request.interactor_profile);

        let interactor_said = parse_judge_log(request.judge_log_path.as_deref());
        let checker_message = interactor_said.as_ref().and_then(|(_, msg)| msg.clone());
        let verdict = super::reconcile(&solution, &interactor, interactor_said.map(|(v, _)| v));

        InteractiveOutcome { verdict, solution, interactor, checker_message }
    }

    /// Reads the interactor's own verdict off a judge-log file, if the
    /// problem's interactor convention writes one (the common testlib.h
    /// idiom: exit code alone only tells "ok or not", so well-behaved
    /// interactors additionally report which of AC/WA/PE they meant).
    fn parse_judge_log(path: Option<&std::path::Path>) -> Option<(InteractiveVerdict, Option<String>)> {
        let path = path?;
        let contents = std::fs::read_to_string(path).ok()?;
        let mut lines = contents.lines();
        let verdict = match lines.next()?.trim() {
            "ok" => InteractiveVerdict::Ac,
            "wrong-answer" => InteractiveVerdict::Wa,
            "presentation-error" => InteractiveVerdict::Pe,
            _ => return None,
        };
        let message = lines.next().map(|s| s.to_string());
        Some((verdict, message))
    }
}

#[cfg(not(unix))]
mod platform {
    use super::*;

    pub fn pipe() -> std::io::Result<(std::os::fd::OwnedFd, std::os::fd::OwnedFd)> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "interactive execution requires unix pipes",
        ))
    }

    pub fn run_pair(
        _request: InteractiveRequest,
        _sol_pipe: (std::os::fd::OwnedFd, std::os::fd::OwnedFd),
        _int_pipe: (std::os::fd::OwnedFd, std::os::fd::OwnedFd),
    ) -> InteractiveOutcome {
        super::infra_failure("interactive backend not implemented on this platform")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_outcome() -> Outcome {
        Outcome {
            status: Status::Ok,
            cpu_ms: 10,
            wall_ms: 10,
            memory_kib: 1024,
            exit_code: Some(0),
            termination_signal: None,
            output_truncated: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            error_detail: None,
        }
    }

    #[test]
    fn solution_resource_trip_dominates_interactor_result() {
        let mut solution = ok_outcome();
        solution.status = Status::TimeLimitExceeded;
        let interactor = ok_outcome();
        let verdict = reconcile(&solution, &interactor, Some(InteractiveVerdict::Ac));
        assert_eq!(verdict, InteractiveVerdict::Tle);
    }

    #[test]
    fn sigpipe_on_solution_defers_to_interactor_verdict() {
        let mut solution = ok_outcome();
        solution.status = Status::RuntimeError;
        solution.termination_signal = Some(13);
        let interactor = ok_outcome();
        let verdict = reconcile(&solution, &interactor, Some(InteractiveVerdict::Ac));
        assert_eq!(verdict, InteractiveVerdict::Ac);
    }

    #[test]
    fn unrelated_solution_crash_is_re() {
        let mut solution = ok_outcome();
        solution.status = Status::RuntimeError;
        let interactor = ok_outcome();
        let verdict = reconcile(&solution, &interactor, Some(InteractiveVerdict::Ac));
        assert_eq!(verdict, InteractiveVerdict::Re);
    }

    #[test]
    fn interactor_crash_without_verdict_is_ie() {
        let solution = ok_outcome();
        let mut interactor = ok_outcome();
        interactor.status = Status::SandboxError;
        let verdict = reconcile(&solution, &interactor, None);
        assert_eq!(verdict, InteractiveVerdict::Ie);
    }

    #[test]
    fn interactor_sigpipe_after_solution_done_is_not_charged_to_solution() {
        let solution = ok_outcome();
        let mut interactor = ok_outcome();
        interactor.status = Status::RuntimeError;
        interactor.termination_signal = Some(13);
        // No judge log (the interactor died before writing one): the
        // solution already exited 0, so the verdict should be Ac, not the
        // Wa a naive "interactor non-zero" rule would produce.
        let verdict = reconcile(&solution, &interactor, None);
        assert_eq!(verdict, InteractiveVerdict::Ac);
    }

    #[test]
    fn interactor_hang_after_solution_done_is_not_charged_to_solution() {
        let solution = ok_outcome();
        let mut interactor = ok_outcome();
        interactor.status = Status::WallTimeLimitExceeded;
        let verdict = reconcile(&solution, &interactor, Some(InteractiveVerdict::Ac));
        assert_eq!(verdict, InteractiveVerdict::Ac);
    }

    #[test]
    fn interactor_wall_hang_defers_to_its_own_reported_verdict_if_present() {
        let solution = ok_outcome();
        let mut interactor = ok_outcome();
        interactor.status = Status::WallTimeLimitExceeded;
        // The interactor managed to write a verdict before being killed;
        // that still wins over a blanket Ac default.
        let verdict = reconcile(&solution, &interactor, Some(InteractiveVerdict::Wa));
        assert_eq!(verdict, InteractiveVerdict::Wa);
    }
}
