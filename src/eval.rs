//! Orchestrates run -> check per (solution, testcase) pair and produces a
//! [`Verdict`] (component G).
//!
//! The six-step sequence below follows spec §4.G exactly; none of it has a
//! direct teacher analogue, so it is built on the primitives the earlier
//! components already established: E for the executable, C for running
//! both the solution and the checker, D for the interactive combination.

use crate::cache::{IntegrityMode, Role};
use crate::compiler::Executable;
use crate::context::EngineContext;
use crate::descriptor::{EvaluationRecord, Phase, Verdict};
use crate::digest::{digest_file, Digest, Fingerprint, FingerprintBuilder};
use crate::error::{RbxError, Result};
use crate::interactive::{self, InteractiveRequest, InteractiveVerdict};
use crate::sandbox::{self, OutputSink, RunRequest, Status, Stdin};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{instrument, warn};

/// How many times a `SandboxError` status is retried before the engine
/// gives up and reports `Ie` (§7: "Retried a bounded number of times").
const MAX_SANDBOX_RETRIES: u32 = 2;

#[derive(Clone, Debug)]
pub enum RunMode {
    Batch,
    Interactive { interactor: Executable, judge_log_supported: bool },
}

pub struct EvaluationRequest<'a> {
    pub solution_id: &'a str,
    pub solution: &'a Executable,
    pub checker: &'a Executable,
    pub mode: &'a RunMode,
    pub testcase_id: &'a str,
    pub input_path: &'a Path,
    pub answer_path: Option<&'a Path>,
    pub run_profile: crate::descriptor::SandboxProfile,
    pub check_profile: crate::descriptor::SandboxProfile,
    /// Identifies the problem version and solution/testcase/limit set for
    /// the persisted record's fingerprint (step 6).
    pub record_fingerprint_seed: &'a str,
}

/// Resolves `testcase`'s [`crate::descriptor::TestcaseStatus`] before
/// calling [`evaluate`]: an `INVALID` testcase (§4.F: "a failing validator
/// marks the testcase INVALID; downstream evaluations on that testcase
/// SKIP with a structured reason rather than running") never reaches the
/// sandbox at all.
#[instrument(skip(context, request, testcase), fields(solution = %request.solution_id, testcase = %request.testcase_id))]
pub fn evaluate_testcase(
    context: &EngineContext,
    request: EvaluationRequest,
    testcase: &crate::descriptor::Testcase,
) -> Result<EvaluationRecord> {
    if testcase.status() == crate::descriptor::TestcaseStatus::Invalid {
        return Ok(EvaluationRecord::skipped(
            request.solution_id,
            request.testcase_id,
            "testcase rejected by validator during generation",
        ));
    }
    evaluate(context, request)
}

/// Step 1 (executable is already resolved by the caller via
/// [`crate::compiler::compile`]) through step 6 (persist keyed by
/// fingerprint).
#[instrument(skip(context, request), fields(solution = %request.solution_id, testcase = %request.testcase_id))]
pub fn evaluate(context: &EngineContext, request: EvaluationRequest) -> Result<EvaluationRecord> {
    let record_fp = fingerprint_record(&request);

    let cache = context.cache();
    if let Some(entry) = cache.lookup(&record_fp)? {
        if let Some(artifact) = entry.artifact(Role::Eval) {
            let path = cache.artifact_path(&record_fp, artifact);
            return crate::cache::read_json_file(&path);
        }
    }

    let record = run_and_check(context, &request)?;

    let produced = record.clone();
    cache.build(record_fp, IntegrityMode::Loose, move |staging| {
        let path = staging.join("eval.json");
        crate::cache::write_json_file(&produced, &path)?;
        Ok(vec![(Role::Eval, PathBuf::from("eval.json"))])
    })?;

    Ok(record)
}

fn run_and_check(context: &EngineContext, request: &EvaluationRequest) -> Result<EvaluationRecord> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match run_and_check_once(context, request) {
            Ok(record) => return Ok(record),
            Err(e) if e.is_retryable() && attempt <= MAX_SANDBOX_RETRIES => {
                warn!(attempt, error = %e, "sandbox error during evaluation, retrying");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "evaluation failed after retries, reporting IE");
                return Ok(ie_record(request, e.to_string()));
            }
        }
    }
}

fn ie_record(request: &EvaluationRequest, message: String) -> EvaluationRecord {
    EvaluationRecord {
        solution_id: request.solution_id.to_string(),
        testcase_id: request.testcase_id.to_string(),
        verdict: Verdict::Ie,
        cpu_ms: 0,
        wall_ms: 0,
        memory_kib: 0,
        checker_message: Some(message),
        output_artifact: None,
        skip_reason: None,
    }
}

fn run_and_check_once(context: &EngineContext, request: &EvaluationRequest) -> Result<EvaluationRecord> {
    match &request.mode {
        RunMode::Batch => run_batch(context, request),
        RunMode::Interactive { interactor, judge_log_supported } => {
            run_interactive(context, request, interactor, *judge_log_supported)
        }
    }
}

fn run_batch(context: &EngineContext, request: &EvaluationRequest) -> Result<EvaluationRecord> {
    let cache = context.cache();
    let argv = vec![format!("{}/a.out", request.solution.artifact_dir.display())];
    let started = Instant::now();

    let run_fp = fingerprint_run(request);
    let entry = cache.build(run_fp, IntegrityMode::Loose, {
        let input_path = request.input_path.to_path_buf();
        let run_profile = request.run_profile.clone();
        move |staging| {
            let output_path = staging.join("stdout.txt");
            let outcome = sandbox::run(
                &run_profile,
                &argv,
                RunRequest {
                    stdin: Some(Stdin::File(input_path.clone())),
                    stdout: Some(OutputSink::File(output_path.clone())),
                    ..RunRequest::default()
                },
            );
            persist_run_outcome(staging, &outcome)
        }
    })?;

    let outcome = read_run_outcome(&cache, &entry)?;
    let wall_ms = started.elapsed().as_millis() as u64;

    if let Some(verdict) = provisional_from_status(outcome.status) {
        return Ok(finish(request, verdict, &outcome, wall_ms, None, None));
    }

    let output_path =
        cache.artifact_path(&entry.fingerprint, entry.artifact(crate::cache::Role::Stdout).expect("stdout artifact"));
    let (verdict, message) = run_checker(context, request, &output_path)?;
    Ok(finish(request, verdict, &outcome, wall_ms, message, Some(digest_file(&output_path)?)))
}

fn run_interactive(
    context: &EngineContext,
    request: &EvaluationRequest,
    interactor: &Executable,
    judge_log_supported: bool,
) -> Result<EvaluationRecord> {
    let started = Instant::now();
    let solution_argv = vec![format!("{}/a.out", request.solution.artifact_dir.display())];
    let interactor_argv = vec![format!("{}/a.out", interactor.artifact_dir.display())];

    // Only probe for a judge-log file when the interactor is known to
    // write one (§4.D judge-log convention); an interactor that never
    // produces one shouldn't have a stale file from an earlier testcase
    // misread as its verdict.
    let judge_log_path =
        judge_log_supported.then(|| request.input_path.with_extension("judge.log"));

    let outcome = interactive::run(InteractiveRequest {
        solution_argv,
        interactor_argv,
        solution_profile: request.run_profile.clone(),
        interactor_profile: request.check_profile.clone(),
        input_file: request.input_path.to_path_buf(),
        judge_log_path,
    });

    let wall_ms = started.elapsed().as_millis() as u64;
    let verdict = map_interactive_verdict(outcome.verdict);

    Ok(EvaluationRecord {
        solution_id: request.solution_id.to_string(),
        testcase_id: request.testcase_id.to_string(),
        verdict,
        cpu_ms: outcome.solution.cpu_ms,
        wall_ms: outcome.solution.wall_ms.max(wall_ms),
        memory_kib: outcome.solution.memory_kib,
        checker_message: outcome.checker_message,
        output_artifact: None,
        skip_reason: None,
    })
}

fn map_interactive_verdict(v: InteractiveVerdict) -> Verdict {
    match v {
        InteractiveVerdict::Ac => Verdict::Ac,
        InteractiveVerdict::Wa => Verdict::Wa,
        InteractiveVerdict::Pe => Verdict::Pe,
        InteractiveVerdict::Tle => Verdict::Tle,
        InteractiveVerdict::Mle => Verdict::Mle,
        InteractiveVerdict::Re => Verdict::Re,
        InteractiveVerdict::Ole => Verdict::Ole,
        InteractiveVerdict::Ie => Verdict::Ie,
    }
}

fn provisional_from_status(status: Status) -> Option<Verdict> {
    match status {
        Status::Ok => None,
        Status::TimeLimitExceeded | Status::WallTimeLimitExceeded => Some(Verdict::Tle),
        Status::MemoryLimitExceeded => Some(Verdict::Mle),
        Status::OutputLimitExceeded => Some(Verdict::Ole),
        Status::RuntimeError => Some(Verdict::Re),
        Status::SandboxError => Some(Verdict::Ie),
    }
}

fn run_checker(
    context: &EngineContext,
    request: &EvaluationRequest,
    output_path: &Path,
) -> Result<(Verdict, Option<String>)> {
    let profile = context
        .profile_for(Phase::Check)
        .cloned()
        .unwrap_or_else(|| request.check_profile.clone());

    let mut argv = vec![format!("{}/a.out", request.checker.artifact_dir.display())];
    argv.push(request.input_path.to_string_lossy().into_owned());
    argv.push(output_path.to_string_lossy().into_owned());
    if let Some(answer) = request.answer_path {
        argv.push(answer.to_string_lossy().into_owned());
    }

    let outcome = sandbox::run(&profile, &argv, RunRequest::default());

    // testlib convention: AC=0, WA=1, PE=2, Fail=3, anything else IE.
    let verdict = match outcome.exit_code {
        Some(0) => Verdict::Ac,
        Some(1) => Verdict::Wa,
        Some(2) => Verdict::Pe,
        _ => Verdict::Ie,
    };
    let message = if outcome.stderr.is_empty() { None } else { Some(String::from_utf8_lossy(&outcome.stderr).into_owned()) };
    Ok((verdict, message))
}

fn persist_run_outcome(staging: &Path, outcome: &sandbox::Outcome) -> Result<Vec<(Role, PathBuf)>> {
    let meta_path = staging.join("run-outcome.json");
    crate::cache::write_json_file(outcome, &meta_path)?;
    let stdout_path = staging.join("stdout.txt");
    if !stdout_path.exists() {
        std::fs::write(&stdout_path, b"").map_err(|e| RbxError::io(e, &stdout_path))?;
    }
    Ok(vec![(Role::Stdout, PathBuf::from("stdout.txt")), (Role::Metrics, PathBuf::from("run-outcome.json"))])
}

fn read_run_outcome(cache: &crate::cache::ArtifactCache, entry: &crate::cache::Entry) -> Result<sandbox::Outcome> {
    let artifact = entry.artifact(Role::Metrics).ok_or_else(|| RbxError::msg("run entry missing metrics artifact"))?;
    let path = cache.artifact_path(&entry.fingerprint, artifact);
    crate::cache::read_json_file(&path)
}

fn finish(
    request: &EvaluationRequest,
    verdict: Verdict,
    outcome: &sandbox::Outcome,
    wall_ms: u64,
    checker_message: Option<String>,
    output_artifact_digest: Option<Digest>,
) -> EvaluationRecord {
    EvaluationRecord {
        solution_id: request.solution_id.to_string(),
        testcase_id: request.testcase_id.to_string(),
        verdict,
        cpu_ms: outcome.cpu_ms,
        wall_ms: outcome.wall_ms.max(wall_ms),
        memory_kib: outcome.memory_kib,
        checker_message,
        output_artifact: output_artifact_digest.map(|d| {
            let mut b = FingerprintBuilder::new();
            b.op_kind("output").input_digest(&d);
            b.finish()
        }),
        skip_reason: None,
    }
}

/// The solution's build fingerprint reinterpreted as a digest: both are
/// 256-bit SHA-256 outputs, and this is the only place a fingerprint
/// needs to feed into another fingerprint's `input_digest` field rather
/// than a dedicated field of its own.
fn solution_as_digest(solution: &Executable) -> Digest {
    Digest(*solution.fingerprint.as_bytes())
}

fn fingerprint_run(request: &EvaluationRequest) -> Fingerprint {
    let digest = solution_as_digest(request.solution);
    let mut builder = FingerprintBuilder::new();
    builder
        .op_kind("run")
        .tool_version(request.record_fingerprint_seed)
        .input_digest(&digest)
        .arguments([request.testcase_id])
        .sandbox_profile(&request.run_profile.id);
    builder.finish()
}

fn fingerprint_record(request: &EvaluationRequest) -> Fingerprint {
    let digest = solution_as_digest(request.solution);
    let mut builder = FingerprintBuilder::new();
    builder
        .op_kind("eval")
        .tool_version(request.record_fingerprint_seed)
        .command_template(request.solution_id)
        .arguments([request.testcase_id])
        .input_digest(&digest)
        .sandbox_profile(&request.run_profile.id);
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testutil::TestEngine;
    use crate::descriptor::SandboxProfile;
    use pretty_assertions::assert_eq;

    fn profile(id: &str) -> SandboxProfile {
        SandboxProfile {
            id: id.into(),
            cpu_ms: 2000,
            wall_ms: 2000,
            memory_kib: 256 * 1024,
            processes: 8,
            output_kib: 4096,
            stack_kib: None,
            read_only_mounts: vec![],
            read_write_mounts: vec![],
            env_whitelist: vec![],
            piped_stdio: true,
        }
    }

    fn shell_executable(dir: &std::path::Path, script: &str) -> Executable {
        let bin = dir.join("a.out");
        std::fs::write(&bin, script).unwrap();
        #[cfg(unix)]
        std::fs::set_permissions(&bin, <std::fs::Permissions as std::os::unix::fs::PermissionsExt>::from_mode(0o755)).unwrap();
        Executable {
            fingerprint: FingerprintBuilder::new().op_kind("test-exe").command_template(script).finish(),
            run_command_template: "{output}/a.out".into(),
            artifact_dir: dir.to_path_buf(),
        }
    }

    #[test]
    #[cfg(unix)]
    fn ac_batch_solution_produces_ac_verdict() {
        let engine = TestEngine::new();
        let context = engine
            .context
            .clone()
            .with_profile(Phase::Run, profile("run"))
            .with_profile(Phase::Check, profile("check"));

        let sol_dir = tempfile::tempdir().unwrap();
        let solution = shell_executable(sol_dir.path(), "#!/bin/sh\nread a\nread b\necho $((a + b))\n");

        let chk_dir = tempfile::tempdir().unwrap();
        // Minimal fake checker: compares output to the answer file byte-for-byte.
        let checker = shell_executable(
            chk_dir.path(),
            "#!/bin/sh\ndiff -q \"$2\" \"$3\" >/dev/null 2>&1 && exit 0 || exit 1\n",
        );

        let input_dir = tempfile::tempdir().unwrap();
        let input_path = input_dir.path().join("input.txt");
        std::fs::write(&input_path, "2\n3\n").unwrap();
        let answer_path = input_dir.path().join("answer.txt");
        std::fs::write(&answer_path, "5\n").unwrap();

        let request = EvaluationRequest {
            solution_id: "sol-a",
            solution: &solution,
            checker: &checker,
            mode: &RunMode::Batch,
            testcase_id: "case-1",
            input_path: &input_path,
            answer_path: Some(&answer_path),
            run_profile: profile("run"),
            check_profile: profile("check"),
            record_fingerprint_seed: "pkg-v1",
        };

        let record = evaluate(&context, request).unwrap();
        assert_eq!(record.verdict, Verdict::Ac);
    }

    #[test]
    fn invalid_testcase_skips_without_running() {
        use crate::descriptor::{Testcase, TestcaseOrigin, ValidatorVerdict};

        let engine = TestEngine::new();
        let context = engine
            .context
            .clone()
            .with_profile(Phase::Run, profile("run"))
            .with_profile(Phase::Check, profile("check"));

        let sol_dir = tempfile::tempdir().unwrap();
        // A solution that would panic the test harness if it were ever
        // actually invoked, proving `evaluate_testcase` short-circuits.
        let solution = shell_executable(sol_dir.path(), "#!/bin/sh\nexit 111\n");
        let chk_dir = tempfile::tempdir().unwrap();
        let checker = shell_executable(chk_dir.path(), "#!/bin/sh\nexit 0\n");

        let input_dir = tempfile::tempdir().unwrap();
        let input_path = input_dir.path().join("input.txt");
        std::fs::write(&input_path, "n = -1\n").unwrap();

        let testcase = Testcase {
            group: "main".into(),
            index: 1,
            input_digest: digest_file(&input_path).unwrap(),
            answer_digest: None,
            origin: TestcaseOrigin::Generated {
                call_fingerprint: FingerprintBuilder::new().op_kind("gen").finish(),
                validator_verdict: ValidatorVerdict::Invalid,
            },
        };

        let request = EvaluationRequest {
            solution_id: "sol-a",
            solution: &solution,
            checker: &checker,
            mode: &RunMode::Batch,
            testcase_id: "case-1",
            input_path: &input_path,
            answer_path: None,
            run_profile: profile("run"),
            check_profile: profile("check"),
            record_fingerprint_seed: "pkg-v1",
        };

        let record = evaluate_testcase(&context, request, &testcase).unwrap();
        assert_eq!(record.verdict, Verdict::Skipped);
        assert!(record.skip_reason.is_some());
    }
}
