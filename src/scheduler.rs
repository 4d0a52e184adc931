//! Parallel evaluation fan-out over the Cartesian product of selected
//! solutions and testcases, with cancellation and result streaming
//! (component H).
//!
//! Grounded in `Solc::compile_many`'s
//! `futures_util::stream::iter(...).buffer_unordered(n)`, generalised from
//! "n solc invocations" to "solutions x testcases." The synchronous path
//! below has no direct counterpart elsewhere in the codebase (a bounded
//! worker pool outside `rayon`'s own, which has no notion of a result
//! stream); the `async` path underneath `run_all_async` keeps the same
//! `buffer_unordered` idiom.

use crate::descriptor::EvaluationRecord;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

/// A single (solution, testcase) unit of work. `run` is called on a worker
/// thread; it owns everything it needs (no borrowed `EngineContext` or
/// `Executable`, since the job may outlive the caller's stack frame).
pub struct Job {
    pub solution_id: String,
    pub testcase_id: String,
    pub run: Box<dyn FnOnce() -> Result<EvaluationRecord> + Send>,
}

/// One result of the fan-out: which (solution, testcase) pair it was for,
/// and its outcome. Every pair selected into `run_all` appears exactly
/// once across the lifetime of the returned receiver (§4.H ordering
/// guarantee), in no particular order.
pub struct RunOutcome {
    pub solution_id: String,
    pub testcase_id: String,
    pub result: Result<EvaluationRecord>,
}

/// Shared cancellation flag. Cloning gives every worker and the caller a
/// handle to the same underlying flag (§5: "cancelling a top-level run
/// signals the scheduler; it refuses to start further work").
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs every job in `jobs` across a `rayon` pool capped at `concurrency`
/// threads, streaming each [`RunOutcome`] back over the returned
/// [`Receiver`] as soon as it is ready.
///
/// Backpressure: the channel is bounded at `concurrency` (§4.H: "the
/// scheduler does not start new work when the caller is not consuming
/// results") — once that many results are buffered unread, the pool's
/// threads block on `send` rather than racing ahead to evaluate more
/// pairs. Cancellation: once `cancel.cancel()` is called, jobs that have
/// not yet started are skipped (reported as `RbxError::Cancelled`); jobs
/// already running are not forcibly killed here — their own sandbox wall
/// bound is what guarantees they cannot hang forever (component C), so the
/// dispatcher only refuses to *start* new work.
///
/// The pool itself runs on a dedicated dispatch thread (`rayon::scope`
/// blocks until every job finishes) so `run_all` returns immediately and
/// the caller drives progress purely by draining `rx`.
#[tracing::instrument(skip(jobs, cancel), fields(jobs = jobs.len(), concurrency))]
pub fn run_all(jobs: Vec<Job>, concurrency: usize, cancel: CancellationToken) -> Receiver<RunOutcome> {
    let concurrency = concurrency.max(1);
    let (tx, rx) = mpsc::sync_channel(concurrency);

    std::thread::spawn(move || {
        let pool = match rayon::ThreadPoolBuilder::new().num_threads(concurrency).build() {
            Ok(pool) => pool,
            Err(e) => {
                for job in jobs {
                    let _ = tx.send(RunOutcome {
                        solution_id: job.solution_id,
                        testcase_id: job.testcase_id,
                        result: Err(crate::error::RbxError::msg(format!("failed to build scheduler pool: {e}"))),
                    });
                }
                return;
            }
        };

        pool.scope(|scope| {
            for job in jobs {
                let tx = tx.clone();
                let cancel = cancel.clone();
                scope.spawn(move |_| {
                    if cancel.is_cancelled() {
                        let _ = tx.send(RunOutcome {
                            solution_id: job.solution_id,
                            testcase_id: job.testcase_id,
                            result: Err(crate::error::RbxError::Cancelled),
                        });
                        return;
                    }
                    let Job { solution_id, testcase_id, run } = job;
                    let result = run();
                    let _ = tx.send(RunOutcome { solution_id, testcase_id, result });
                });
            }
        });
    });

    rx
}

/// Default `concurrency` for [`run_all`] when a caller has no opinion:
/// one worker per available CPU (§4.H: "parallelism capped by
/// `concurrency` (default: available CPUs)").
pub fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

/// Builds the Cartesian product of `solution_ids x testcase_ids`, handing
/// each pair to `make_job`. Pulled out of `run_all` so callers can build
/// the job list with whatever per-pair closures they need without this
/// module knowing about `EngineContext`/`Executable`/`Testcase` types.
pub fn cartesian_jobs<S, T>(
    solution_ids: &[S],
    testcase_ids: &[T],
    mut make_job: impl FnMut(&S, &T) -> Box<dyn FnOnce() -> Result<EvaluationRecord> + Send>,
) -> Vec<Job>
where
    S: ToString,
    T: ToString,
{
    let mut jobs = Vec::with_capacity(solution_ids.len() * testcase_ids.len());
    for solution_id in solution_ids {
        for testcase_id in testcase_ids {
            jobs.push(Job {
                solution_id: solution_id.to_string(),
                testcase_id: testcase_id.to_string(),
                run: make_job(solution_id, testcase_id),
            });
        }
    }
    jobs
}

/// `async`-feature counterpart mirroring `compile_many` exactly: a
/// `futures_util::stream::iter` of blocking closures, each
/// handed to `tokio::task::spawn_blocking` (a sandboxed child-process wait
/// is a blocking OS call, not something to run on an async executor
/// directly) and bounded by `buffer_unordered(concurrency)`. Returning a
/// `Stream` rather than a `Vec` gives the same poll-driven backpressure as
/// the sync path: at most `concurrency` blocking tasks are ever in flight
/// at once, and no further job is pulled from `jobs` until the caller
/// polls for the next item.
#[cfg(feature = "async")]
pub fn run_all_async(
    jobs: Vec<Job>,
    concurrency: usize,
) -> impl futures_util::stream::Stream<Item = RunOutcome> {
    use futures_util::stream::{self, StreamExt};

    let concurrency = concurrency.max(1);
    stream::iter(jobs.into_iter().map(|job| async move {
        let Job { solution_id, testcase_id, run } = job;
        let result = tokio::task::spawn_blocking(run)
            .await
            .unwrap_or_else(|e| Err(crate::error::RbxError::msg(format!("evaluation task panicked: {e}"))));
        RunOutcome { solution_id, testcase_id, result }
    }))
    .buffer_unordered(concurrency)
}
