//! Builds test inputs from generator calls with seed derivation and
//! validator integration (component F).
//!
//! The fingerprint-as-seed trick is the one piece of this crate with no
//! direct teacher analogue; it is built directly on [`crate::digest`]'s
//! `Fingerprint::seed64`, documented there for exactly this purpose. The
//! call/cache wiring mirrors [`crate::compiler::compile`].

use crate::cache::{IntegrityMode, Role};
use crate::compiler::Executable;
use crate::context::EngineContext;
use crate::descriptor::{Phase, Testcase, TestcaseOrigin, ValidatorVerdict};
use crate::digest::{digest_file, Fingerprint, FingerprintBuilder};
use crate::error::{RbxError, Result};
use crate::sandbox::{self, RunRequest, Status};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, instrument};

/// `(generator_name, argv)`, before the seed token is appended.
#[derive(Clone, Debug)]
pub struct GeneratorCall {
    pub name: String,
    pub argv: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct GeneratedTestcase {
    pub call_fingerprint: Fingerprint,
    pub input_path: PathBuf,
    pub origin: TestcaseOrigin,
}

/// Runs `call` through the generator executable, appending the
/// deterministic seed token, then validates the result. Equal calls (same
/// name, same argv, same generator/validator executables) always produce
/// equal inputs (I4/S4 in the testable-properties list); a caller forcing
/// a distinct test with the same semantic arguments appends a nonce
/// argument the generator ignores.
#[instrument(skip(context, generator, validator), fields(generator = %call.name))]
pub fn generate(
    context: &EngineContext,
    generator: &Executable,
    validator: Option<&Executable>,
    call: &GeneratorCall,
) -> Result<GeneratedTestcase> {
    let call_fingerprint = fingerprint_call(generator, call);
    let seed = call_fingerprint.seed64();

    let mut argv = vec![format!("{}/{}", generator.artifact_dir.display(), "a.out")];
    argv.extend(call.argv.iter().cloned());
    argv.push(format!("--rbx-seed={seed}"));

    let cache = context.cache();
    let profile = context
        .profile_for(Phase::Generate)
        .cloned()
        .ok_or_else(|| RbxError::msg("no sandbox profile configured for Phase::Generate"))?;

    let entry = cache.build(call_fingerprint, IntegrityMode::Loose, move |staging| {
        let output_path = staging.join("input.txt");
        let outcome = sandbox::run(
            &profile,
            &argv,
            RunRequest {
                stdout: Some(sandbox::OutputSink::File(output_path.clone())),
                ..RunRequest::default()
            },
        );
        if outcome.status != Status::Ok {
            return Err(RbxError::tool(
                "generator",
                String::from_utf8_lossy(&outcome.stderr).into_owned(),
            ));
        }
        Ok(vec![(Role::Input, PathBuf::from("input.txt"))])
    })?;

    let input_path = cache.artifact_path(
        &call_fingerprint,
        entry.artifact(Role::Input).expect("generator produced an Input artifact"),
    );

    let verdict = match validator {
        Some(validator) => run_validator(context, validator, &input_path)?,
        None => ValidatorVerdict::Valid,
    };

    if verdict == ValidatorVerdict::Invalid {
        info!(%call_fingerprint, "generated testcase rejected by validator");
    }

    Ok(GeneratedTestcase {
        call_fingerprint,
        input_path,
        origin: TestcaseOrigin::Generated { call_fingerprint, validator_verdict: verdict },
    })
}

fn run_validator(
    context: &EngineContext,
    validator: &Executable,
    input_path: &std::path::Path,
) -> Result<ValidatorVerdict> {
    let profile = context
        .profile_for(Phase::Validate)
        .cloned()
        .ok_or_else(|| RbxError::msg("no sandbox profile configured for Phase::Validate"))?;

    let argv = vec![format!("{}/{}", validator.artifact_dir.display(), "a.out")];
    let outcome = sandbox::run(
        &profile,
        &argv,
        RunRequest { stdin: Some(sandbox::Stdin::File(input_path.to_path_buf())), ..RunRequest::default() },
    );

    Ok(match outcome.status {
        Status::Ok => ValidatorVerdict::Valid,
        _ => ValidatorVerdict::Invalid,
    })
}

fn fingerprint_call(generator: &Executable, call: &GeneratorCall) -> Fingerprint {
    let mut builder = FingerprintBuilder::new();
    builder
        .op_kind("generate")
        .tool_version(&generator.fingerprint.to_hex())
        .command_template(&call.name)
        .arguments(call.argv.iter());
    builder.finish()
}

/// Placeholder kept for symmetry with [`crate::compiler::fingerprint_compile`]'s
/// digest-of-input idiom; generators have no input file to digest, only
/// their argv, but a digest of the produced input is still recorded on the
/// resulting [`crate::descriptor::Testcase`].
pub fn input_digest(path: &std::path::Path) -> Result<crate::digest::Digest> {
    digest_file(path)
}

/// One line of a package's test plan: either a hand-authored input file
/// under manual control, or a generator invocation this function resolves
/// via [`generate`]. `group`/`index` match the fields of
/// [`crate::descriptor::Testcase`] directly.
#[derive(Clone, Debug)]
pub enum TestSpec {
    Manual { group: String, index: u32, input_path: PathBuf, answer_path: Option<PathBuf> },
    Generated { group: String, index: u32, generator_name: String, call: GeneratorCall },
}

/// `build_testset(package) -> [Testcase]` from §6: resolves every
/// [`TestSpec`] of a package's test plan into a [`Testcase`], running the
/// generator + validator pipeline for the generated ones and a plain
/// digest for the manual ones. `generators` maps a generator name to its
/// already-compiled [`Executable`] (built by [`crate::compiler::compile`]
/// ahead of this call, matching the dependency order of §2's data flow:
/// "F builds tests via E+C").
#[instrument(skip(context, generators, validator, specs))]
pub fn build_testset(
    context: &EngineContext,
    generators: &HashMap<String, Executable>,
    validator: Option<&Executable>,
    specs: &[TestSpec],
) -> Result<Vec<Testcase>> {
    let mut testcases = Vec::with_capacity(specs.len());
    for spec in specs {
        let testcase = match spec {
            TestSpec::Manual { group, index, input_path, answer_path } => Testcase {
                group: group.clone(),
                index: *index,
                input_digest: digest_file(input_path)?,
                answer_digest: answer_path.as_deref().map(digest_file).transpose()?,
                origin: TestcaseOrigin::Manual { path: input_path.clone() },
            },
            TestSpec::Generated { group, index, generator_name, call } => {
                let generator = generators.get(generator_name).ok_or_else(|| {
                    RbxError::user(format!("no compiled generator named `{generator_name}`"))
                })?;
                let generated = generate(context, generator, validator, call)?;
                Testcase {
                    group: group.clone(),
                    index: *index,
                    input_digest: input_digest(&generated.input_path)?,
                    answer_digest: None,
                    origin: generated.origin,
                }
            }
        };
        if testcase.status() == crate::descriptor::TestcaseStatus::Invalid {
            info!(id = %testcase.id(), "testcase marked INVALID by validator");
        }
        testcases.push(testcase);
    }
    Ok(testcases)
}
