//! The engine-wide context passed explicitly to every operation, so that no
//! ambient global (cache root, tool version, sandbox backend) ever
//! participates in a fingerprint (Design Note, §9).

use crate::cache::ArtifactCache;
use crate::descriptor::SandboxProfile;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which backend `sandbox::run` dispatches to. `Native` is the
/// `cfg(unix)` rlimit/rusage implementation; other backends are a seam for
/// future sandbox hardening, not implemented by this crate (Non-goal,
/// §1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxBackend {
    Native,
}

#[derive(Clone, Debug)]
pub struct EngineContext {
    cache_root: PathBuf,
    /// Included in every fingerprint's tool-version field; bump to
    /// invalidate every cache entry after a breaking engine change.
    tool_version_tag: String,
    sandbox_backend: SandboxBackend,
    profiles: BTreeMap<crate::descriptor::Phase, SandboxProfile>,
}

impl EngineContext {
    pub fn new(cache_root: impl Into<PathBuf>, tool_version_tag: impl Into<String>) -> Self {
        Self {
            cache_root: cache_root.into(),
            tool_version_tag: tool_version_tag.into(),
            sandbox_backend: SandboxBackend::Native,
            profiles: BTreeMap::new(),
        }
    }

    pub fn with_profile(mut self, phase: crate::descriptor::Phase, profile: SandboxProfile) -> Self {
        self.profiles.insert(phase, profile);
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn tool_version_tag(&self) -> &str {
        &self.tool_version_tag
    }

    pub fn sandbox_backend(&self) -> SandboxBackend {
        self.sandbox_backend
    }

    pub fn profile_for(&self, phase: crate::descriptor::Phase) -> Option<&SandboxProfile> {
        self.profiles.get(&phase)
    }

    pub fn cache(&self) -> ArtifactCache {
        ArtifactCache::new(self.cache_root.clone())
    }
}

/// Resolves a default cache root: prefer a project-local dotdir, fall
/// back to the platform data dir.
pub fn default_cache_root(project_root: impl AsRef<Path>) -> PathBuf {
    let local = project_root.as_ref().join(".rbx").join("cache");
    if project_root.as_ref().join(".rbx").exists() {
        return local;
    }
    dirs::cache_dir().map(|d| d.join("rbx")).unwrap_or(local)
}

#[cfg(any(test, feature = "testutil"))]
pub mod testutil {
    use super::*;

    /// A throwaway `EngineContext` rooted in a fresh temp directory, for
    /// tests that don't care about on-disk layout beyond it being isolated.
    pub struct TestEngine {
        pub context: EngineContext,
        _dir: tempfile::TempDir,
    }

    impl TestEngine {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let context = EngineContext::new(dir.path().join("cache"), "test-tool-v0");
            Self { context, _dir: dir }
        }
    }

    impl Default for TestEngine {
        fn default() -> Self {
            Self::new()
        }
    }
}
