//! Keyed store of compiled binaries, generated inputs and evaluation
//! outputs, with integrity checks and at-most-one concurrent build per
//! fingerprint (component B).
//!
//! Grounded in `SolFilesCache`/`ArtifactsCacheInner`: a JSON-serialised
//! index entry per cached thing, plus a content-hash dirtiness recheck on
//! read (`is_dirty_impl`), generalised here from "one cache file per
//! Solidity project" to "one fingerprint-keyed object store" under
//! `objects/<hex-fingerprint>/`.

use crate::digest::{digest_file, Digest, Fingerprint};
use crate::error::{RbxError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// The name of the marker file whose presence signifies publication of a
/// cache entry (§6: "The presence of `meta` signifies publication.").
const META_FILENAME: &str = "meta.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityMode {
    /// Re-hash referenced artifacts on read; invalidate on mismatch (I4).
    Strict,
    /// Trust the stored digest without re-reading the file.
    Loose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Executable,
    Stdout,
    Stderr,
    Input,
    Answer,
    Log,
    Metrics,
    Eval,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub role: Role,
    pub relative_path: PathBuf,
    pub digest: Digest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub fingerprint: Fingerprint,
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub metrics: serde_json::Value,
    pub created_at_ms: u64,
    pub integrity_mode: IntegrityMode,
}

impl Entry {
    pub fn artifact(&self, role: Role) -> Option<&ArtifactRef> {
        self.artifacts.iter().find(|a| a.role == role)
    }
}

/// At-most-one-concurrent-build coordination. Each in-flight fingerprint
/// maps to a `OnceLock` that the first caller populates and every other
/// caller blocks on via `get_or_init` — this IS the singleflight: the
/// lock that guards the `HashMap` itself is only ever held long enough to
/// look up or insert the per-key cell, never across the actual build.
type InflightMap = Mutex<HashMap<Fingerprint, Arc<OnceLock<Result<Entry, String>>>>>;

pub struct ArtifactCache {
    cache_root: PathBuf,
    inflight: Arc<InflightMap>,
}

impl ArtifactCache {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self { cache_root: cache_root.into(), inflight: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn objects_dir(&self) -> PathBuf {
        self.cache_root.join("objects")
    }

    fn staging_dir(&self) -> PathBuf {
        self.cache_root.join("staging")
    }

    pub(crate) fn entry_dir(&self, fp: &Fingerprint) -> PathBuf {
        self.objects_dir().join(fp.to_hex())
    }

    /// Returns the entry iff present and (loose, or every referenced
    /// artifact's digest still matches). A stale strict entry is deleted
    /// atomically and treated as absent.
    #[tracing::instrument(skip(self), fields(fingerprint = %fp))]
    pub fn lookup(&self, fp: &Fingerprint) -> Result<Option<Entry>> {
        let dir = self.entry_dir(fp);
        let meta_path = dir.join(META_FILENAME);
        if !meta_path.exists() {
            trace!("no cache entry");
            return Ok(None);
        }

        let entry: Entry = read_json_file(&meta_path)?;

        if entry.integrity_mode == IntegrityMode::Strict {
            for artifact in &entry.artifacts {
                let path = dir.join(&artifact.relative_path);
                let fresh = match digest_file(&path) {
                    Ok(d) => d,
                    Err(_) => {
                        warn!(?path, "missing artifact under strict integrity, evicting");
                        self.invalidate(fp)?;
                        return Ok(None);
                    }
                };
                if fresh != artifact.digest {
                    warn!(?path, "digest mismatch under strict integrity, evicting");
                    self.invalidate(fp)?;
                    return Ok(None);
                }
            }
        }

        Ok(Some(entry))
    }

    /// Singleflight build: if an entry is present, returns it. Otherwise
    /// exactly one concurrent caller runs `produce` inside a fresh staging
    /// directory; others await its result. `produce` writes output files
    /// under the staging directory it is given and returns the list of
    /// `(role, relative_path)` pairs to publish.
    #[tracing::instrument(skip(self, produce), fields(fingerprint = %fp))]
    pub fn build(
        &self,
        fp: Fingerprint,
        integrity_mode: IntegrityMode,
        produce: impl FnOnce(&Path) -> Result<Vec<(Role, PathBuf)>>,
    ) -> Result<Entry> {
        if let Some(entry) = self.lookup(&fp)? {
            trace!("cache hit");
            return Ok(entry);
        }

        let cell = {
            let mut table = self.inflight.lock().unwrap();
            table.entry(fp).or_insert_with(|| Arc::new(OnceLock::new())).clone()
        };

        let result = cell
            .get_or_init(|| {
                debug!("building (singleflight owner)");
                self.run_produce(fp, integrity_mode, produce).map_err(|e| e.to_string())
            })
            .clone();

        // `cell` is our only remaining handle on this caller's side; drop it
        // before checking the table so the strong count reflects only
        // whoever else might still be racing us, not ourselves. Best-effort
        // cleanup: drop the table entry once nobody else is waiting on it,
        // so long-lived processes don't accumulate one OnceLock per
        // fingerprint ever built.
        drop(cell);
        {
            let mut table = self.inflight.lock().unwrap();
            if let Some(existing) = table.get(&fp) {
                if Arc::strong_count(existing) == 1 {
                    table.remove(&fp);
                }
            }
        }

        result.map_err(RbxError::msg)
    }

    fn run_produce(
        &self,
        fp: Fingerprint,
        integrity_mode: IntegrityMode,
        produce: impl FnOnce(&Path) -> Result<Vec<(Role, PathBuf)>>,
    ) -> Result<Entry> {
        fs::create_dir_all(self.staging_dir()).map_err(|e| RbxError::io(e, self.staging_dir()))?;
        let staging = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(self.staging_dir())
            .map_err(|e| RbxError::io(e, self.staging_dir()))?;

        let produced = produce(staging.path())?;

        let mut artifacts = Vec::with_capacity(produced.len());
        for (role, relative_path) in produced {
            let abs = staging.path().join(&relative_path);
            let digest = digest_file(&abs)?;
            artifacts.push(ArtifactRef { role, relative_path, digest });
        }

        let entry = Entry {
            fingerprint: fp,
            artifacts,
            metrics: serde_json::Value::Null,
            created_at_ms: now_ms(),
            integrity_mode,
        };

        // Write the meta marker *inside* the staging directory before the
        // publishing rename, so the renamed directory is never observed
        // without it (I2: atomic publication).
        write_json_file(&entry, &staging.path().join(META_FILENAME))?;

        fs::create_dir_all(self.objects_dir()).map_err(|e| RbxError::io(e, self.objects_dir()))?;
        let dest = self.entry_dir(&fp);
        if dest.exists() {
            // another process published this fingerprint concurrently;
            // treat that publication as authoritative and discard ours.
            return self
                .lookup(&fp)?
                .ok_or_else(|| RbxError::cache(fp, "entry vanished after concurrent publish"));
        }

        // `into_path` disarms the `TempDir`'s drop-cleanup; from here on
        // `dest` owns the directory. If `produce` failed above, we never
        // reach this line and `staging`'s drop removes the directory,
        // publishing nothing (§4.B failure model).
        let staging_path = staging.into_path();
        fs::rename(&staging_path, &dest).map_err(|e| RbxError::io(e, dest.clone()))?;

        debug!(%fp, "published cache entry");
        Ok(entry)
    }

    /// Removes an entry atomically. Safe with concurrent readers: readers
    /// that already obtained a handle keep their own snapshot (the struct
    /// they hold, not a live view of the directory).
    pub fn invalidate(&self, fp: &Fingerprint) -> Result<()> {
        let dir = self.entry_dir(fp);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RbxError::io(e, dir)),
        }
    }

    pub fn artifact_path(&self, fp: &Fingerprint, artifact: &ArtifactRef) -> PathBuf {
        self.entry_dir(fp).join(&artifact.relative_path)
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub(crate) fn read_json_file<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = fs::read(path).map_err(|e| RbxError::io(e, path))?;
    serde_json::from_slice(&content).map_err(RbxError::from)
}

pub(crate) fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RbxError::io(e, parent))?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(path, bytes).map_err(|e| RbxError::io(e, path))
}
