//! Turns a language's source tree into a cached, runnable executable
//! (component E).
//!
//! Grounded in `Solc::compile`/`async_compile`'s duality: one synchronous
//! entry point plus, behind the `async` feature, a `compile_many` that
//! fans a batch out over `buffer_unordered`. Cache integration and
//! fingerprinting follow [`crate::cache`] and [`crate::digest`] directly
//! rather than reinventing either.

use crate::cache::{ArtifactCache, IntegrityMode, Role};
use crate::context::EngineContext;
use crate::descriptor::{CompileMode, LanguageDescriptor, Phase};
use crate::digest::{digest_tree, Fingerprint, FingerprintBuilder};
use crate::error::{RbxError, Result};
use crate::sandbox::{self, Outcome, RunRequest, Status};
use std::path::{Path, PathBuf};
use tracing::{instrument, warn};

/// A compiled (or, for interpreted languages, merely staged) executable
/// artifact, plus the fingerprint that produced it.
#[derive(Clone, Debug)]
pub struct Executable {
    pub fingerprint: Fingerprint,
    pub run_command_template: String,
    /// Root of the cached artifact directory; `{output}` in command
    /// templates is resolved relative to this.
    pub artifact_dir: PathBuf,
}

/// Compiles `source_dir` under `language`, through the cache: a second
/// call with the same source tree, language, flags and tool version is a
/// cache hit, not a rebuild (I1).
#[instrument(skip(context), fields(language = %language.id, source = %source_dir.as_ref().display()))]
pub fn compile(
    context: &EngineContext,
    language: &LanguageDescriptor,
    source_dir: impl AsRef<Path>,
) -> Result<Executable> {
    let source_dir = source_dir.as_ref();
    let source_digest = digest_tree(source_dir)?;

    let run_command_template = match &language.compile_mode {
        CompileMode::Compiled { run_command_template, .. } => run_command_template.clone(),
        CompileMode::Interpreted { run_command_template } => run_command_template.clone(),
    };

    let fingerprint = fingerprint_compile(language, &source_digest, context);

    let cache: ArtifactCache = context.cache();
    let language = language.clone();
    let source_dir = source_dir.to_path_buf();
    let profile = context
        .profile_for(Phase::Compile)
        .cloned()
        .ok_or_else(|| RbxError::msg("no sandbox profile configured for Phase::Compile"))?;

    let entry = cache.build(fingerprint, IntegrityMode::Strict, move |staging| {
        run_compile_step(&language, &source_dir, &profile, staging)
    })?;

    Ok(Executable {
        fingerprint,
        run_command_template,
        artifact_dir: cache.entry_dir(&fingerprint),
    })
}

/// Batch entry point mirroring `compile_many`: independent compiles
/// proceed concurrently, bounded by `concurrency`, each one still going
/// through the same cache as [`compile`].
#[cfg(feature = "async")]
pub async fn compile_many(
    context: &EngineContext,
    jobs: Vec<(LanguageDescriptor, PathBuf)>,
    concurrency: usize,
) -> Vec<Result<Executable>> {
    use futures_util::stream::{self, StreamExt};

    let context = context.clone();
    stream::iter(jobs.into_iter().map(|(language, source_dir)| {
        let context = context.clone();
        async move {
            tokio::task::spawn_blocking(move || compile(&context, &language, &source_dir))
                .await
                .unwrap_or_else(|e| Err(RbxError::msg(format!("compile task panicked: {e}"))))
        }
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await
}

fn fingerprint_compile(
    language: &LanguageDescriptor,
    source_digest: &crate::digest::Digest,
    context: &EngineContext,
) -> Fingerprint {
    let command_template = match &language.compile_mode {
        CompileMode::Compiled { compile_command_template, .. } => compile_command_template.as_str(),
        CompileMode::Interpreted { .. } => "<interpreted: no compile step>",
    };

    let mut builder = FingerprintBuilder::new();
    builder
        .op_kind("compile")
        .tool_version(&format!("{}/{}", language.tool_version, context.tool_version_tag()))
        .input_digest(source_digest)
        .command_template(command_template)
        .arguments(language.extra_flags.iter());
    if let Some(profile) = context.profile_for(Phase::Compile) {
        builder.sandbox_profile(&profile.id);
    }
    builder.finish()
}

/// Stages the source tree and, for compiled languages, invokes the
/// compiler under sandbox limits. Returns the artifacts to publish: the
/// single `a.out` binary for compiled languages, or every file of the
/// source tree for interpreted ones (so a tampered interpreter script is
/// still caught by strict-integrity re-hashing on lookup, I4).
fn run_compile_step(
    language: &LanguageDescriptor,
    source_dir: &Path,
    profile: &crate::descriptor::SandboxProfile,
    staging: &Path,
) -> Result<Vec<(Role, PathBuf)>> {
    copy_tree(source_dir, staging)?;

    match &language.compile_mode {
        CompileMode::Interpreted { .. } => Ok(walkdir::WalkDir::new(staging)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| (Role::Executable, e.path().strip_prefix(staging).unwrap().to_path_buf()))
            .collect()),
        CompileMode::Compiled { compile_command_template, .. } => {
            let argv = render_command(compile_command_template, staging, language);
            let outcome = sandbox::run(
                profile,
                &argv,
                RunRequest { cwd: Some(staging.to_path_buf()), ..RunRequest::default() },
            );
            check_compile_outcome(&outcome)?;
            Ok(vec![(Role::Executable, PathBuf::from("a.out"))])
        }
    }
}

fn check_compile_outcome(outcome: &Outcome) -> Result<()> {
    match outcome.status {
        Status::Ok => Ok(()),
        Status::SandboxError => Err(RbxError::msg(format!(
            "compiler sandbox failure: {}",
            outcome.error_detail.as_deref().unwrap_or("unknown")
        ))),
        _ => {
            warn!(status = ?outcome.status, "compile step failed");
            Err(RbxError::tool("compiler", String::from_utf8_lossy(&outcome.stderr).into_owned()))
        }
    }
}

/// `{sources}` -> the staging directory itself (the tree was already
/// copied in); `{output}` -> a fixed `a.out` name inside it, so the
/// produced executable's path is independent of the language.
fn render_command(template: &str, staging: &Path, language: &LanguageDescriptor) -> Vec<String> {
    let output = staging.join("a.out");
    let rendered = template
        .replace("{sources}", &format!("*.{}", language.source_extension))
        .replace("{output}", &output.to_string_lossy());
    rendered.split_whitespace().map(str::to_string).collect()
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            RbxError::io(
                e.into_io_error().unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walkdir")),
                src,
            )
        })?;
        let rel = entry.path().strip_prefix(src).unwrap();
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| RbxError::io(e, &target))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RbxError::io(e, parent))?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| RbxError::io(e, entry.path()))?;
        }
    }
    Ok(())
}
