//! Typed package/problem/language/profile/testcase records.
//!
//! These are the boundary types: whatever loads a package's on-disk YAML
//! (outside this crate, in the `rbx` CLI) is expected to have already
//! produced values of these types by the time they reach `rbx-core`. The
//! core never parses untyped data itself (Design Note, §9).

use crate::digest::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Uniquely names a language (`cpp17`, `python3`, ...). Kept as a newtype
/// rather than a bare `String` so it participates in a fingerprint the same
/// way every other typed field does.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LanguageId(pub String);

impl std::fmt::Display for LanguageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a language turns source into something runnable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CompileMode {
    /// `compile_command` turns `{sources}` into an executable at
    /// `{output}`; the run command invokes that executable.
    Compiled { compile_command_template: String, run_command_template: String },
    /// No compile step; the "executable" is a copy of the source and
    /// `run_command_template` invokes the interpreter against it.
    Interpreted { run_command_template: String },
}

/// Maps a language's source extension to a compile/run command shape, with
/// a per-language resource profile override.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LanguageDescriptor {
    pub id: LanguageId,
    pub source_extension: String,
    pub compile_mode: CompileMode,
    /// Compiler/interpreter version fed into the fingerprint (I1); a real
    /// `semver::Version` rather than a bare string so a language
    /// descriptor can be compared/ordered the same way `solc` versions
    /// are elsewhere in this codebase.
    pub tool_version: semver::Version,
    /// Extra flags a caller threads through to the compile command. Not
    /// named in the distilled spec but needed in practice (SPEC_FULL §3)
    /// so that changing them invalidates the compiled artifact's cache.
    pub extra_flags: Vec<String>,
    pub profile_overrides: BTreeMap<Phase, String>,
}

/// Resource limits applied to a single sandboxed process invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxProfile {
    pub id: String,
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub memory_kib: u64,
    pub processes: u32,
    pub output_kib: u64,
    pub stack_kib: Option<u64>,
    pub read_only_mounts: Vec<PathBuf>,
    pub read_write_mounts: Vec<PathBuf>,
    pub env_whitelist: Vec<String>,
    pub piped_stdio: bool,
}

/// The phase a sandbox profile is selected for (§6, "Sandbox profile
/// selection").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Compile,
    Generate,
    Validate,
    Run,
    Check,
    Interact,
}

/// A resolved, acyclic snapshot of a problem package (Design Note, §9 —
/// cyclic preset references are resolved by a collaborator before reaching
/// the core).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    /// Bumped whenever the package's content changes in a way that should
    /// be reflected in evaluation-record fingerprints, independent of any
    /// single file's digest (e.g. a re-import from Polygon; see the open
    /// question in §9).
    pub version: String,
    pub languages: Vec<LanguageDescriptor>,
    pub interactive: bool,
    pub time_limit_ms: u64,
    pub memory_limit_kib: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestcaseOrigin {
    Manual { path: PathBuf },
    Generated { call_fingerprint: Fingerprint, validator_verdict: ValidatorVerdict },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorVerdict {
    Valid,
    Invalid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Testcase {
    pub group: String,
    pub index: u32,
    pub input_digest: Digest,
    pub answer_digest: Option<Digest>,
    pub origin: TestcaseOrigin,
}

impl Testcase {
    pub fn status(&self) -> TestcaseStatus {
        match &self.origin {
            TestcaseOrigin::Manual { .. } => TestcaseStatus::Valid,
            TestcaseOrigin::Generated { validator_verdict, .. } => match validator_verdict {
                ValidatorVerdict::Valid => TestcaseStatus::Valid,
                ValidatorVerdict::Invalid => TestcaseStatus::Invalid,
            },
        }
    }

    pub fn id(&self) -> String {
        format!("{}#{}", self.group, self.index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestcaseStatus {
    Valid,
    Invalid,
}

/// Final judgement for one (solution, testcase) pair. Deliberately an
/// exhaustive enum with no catch-all arm, so every verdict dispatch is a
/// compile-time-checked match (Design Note, §9).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Ac,
    Wa,
    Pe,
    Tle,
    Mle,
    Re,
    Ole,
    Ie,
    Skipped,
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ac)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Ac => "AC",
            Verdict::Wa => "WA",
            Verdict::Pe => "PE",
            Verdict::Tle => "TLE",
            Verdict::Mle => "MLE",
            Verdict::Re => "RE",
            Verdict::Ole => "OLE",
            Verdict::Ie => "IE",
            Verdict::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// `(solution_id, testcase_id, verdict, cpu_ms, wall_ms, memory_kib,
/// checker_message, output_artifact, sandbox_metrics)` from spec §3.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub solution_id: String,
    pub testcase_id: String,
    pub verdict: Verdict,
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub memory_kib: u64,
    pub checker_message: Option<String>,
    pub output_artifact: Option<Fingerprint>,
    pub skip_reason: Option<String>,
}

impl EvaluationRecord {
    pub fn skipped(solution_id: impl Into<String>, testcase_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            solution_id: solution_id.into(),
            testcase_id: testcase_id.into(),
            verdict: Verdict::Skipped,
            cpu_ms: 0,
            wall_ms: 0,
            memory_kib: 0,
            checker_message: None,
            output_artifact: None,
            skip_reason: Some(reason.into()),
        }
    }
}
