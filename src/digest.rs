//! Canonical content-addressable hashing of files, directory trees and
//! cached-operation invocations.
//!
//! `Digest` and `Fingerprint` are both 256-bit values; they are kept as
//! distinct types so that a digest (identifies bytes) is never accidentally
//! used where a fingerprint (identifies an *operation*, including its
//! environment) is expected, even though both wrap `[u8; 32]`.

use crate::error::{RbxError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// Schema version byte. Bump on any change to the fingerprint serialisation
/// below; this alone invalidates every cache entry ever produced by an
/// older binary, since it is always the first byte hashed.
const FINGERPRINT_SCHEMA_VERSION: u8 = 1;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(#[serde(with = "hex_bytes")] pub [u8; 32]);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(#[serde(with = "hex_bytes")] pub [u8; 32]);

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(s.as_bytes()).map_err(serde::de::Error::custom)?;
        v.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The first 64 bits of the fingerprint, used by the generator (§4.F)
    /// as a deterministic RNG seed.
    pub fn seed64(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Hashes a single file's bytes.
#[instrument(level = "trace", skip_all, fields(path = %path.as_ref().display()))]
pub fn digest_file(path: impl AsRef<Path>) -> Result<Digest> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| RbxError::io(e, path))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(Digest(hasher.finalize().into()))
}

/// One entry of a canonical directory listing: a relative path, whether the
/// file is executable (the only mode bit tracked here), and either the
/// file's digest or, for a symlink, its raw target bytes.
enum TreeEntryKind {
    File(Digest),
    Symlink(Vec<u8>),
}

/// Hashes a canonical, lexicographically sorted listing of
/// `(relative_path, mode_bit, file_digest)` under `root`. Symlinks are
/// recorded as `(path, target_bytes)` and never followed.
#[instrument(level = "trace", skip_all, fields(root = %root.as_ref().display()))]
pub fn digest_tree(root: impl AsRef<Path>) -> Result<Digest> {
    let root = root.as_ref();
    let mut entries: Vec<(std::path::PathBuf, bool, TreeEntryKind)> = Vec::new();

    for entry in walkdir::WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            RbxError::io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walkdir error")
            }), root)
        })?;
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap().to_path_buf();
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| RbxError::io(e, path))?;
            entries.push((rel, false, TreeEntryKind::Symlink(path_to_bytes(&target))));
        } else if file_type.is_file() {
            let meta = entry.metadata().map_err(|e| {
                RbxError::io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "stat")),
                    path,
                )
            })?;
            let executable = meta.permissions().mode() & 0o111 != 0;
            entries.push((rel, executable, TreeEntryKind::File(digest_file(path)?)));
        }
        // directories contribute no entry of their own; their presence is
        // implied by the files/symlinks nested under them.
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (rel, executable, kind) in &entries {
        hash_len_prefixed(&mut hasher, path_to_bytes(rel).as_slice());
        hasher.update([*executable as u8]);
        match kind {
            TreeEntryKind::File(digest) => {
                hasher.update([0u8]);
                hasher.update(digest.as_bytes());
            }
            TreeEntryKind::Symlink(target) => {
                hasher.update([1u8]);
                hash_len_prefixed(&mut hasher, target);
            }
        }
    }
    Ok(Digest(hasher.finalize().into()))
}

#[cfg(unix)]
fn path_to_bytes(p: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    p.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_to_bytes(p: &Path) -> Vec<u8> {
    p.to_string_lossy().into_owned().into_bytes()
}

fn hash_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Incremental builder for a [`Fingerprint`]: a deterministic,
/// canonically-ordered, length-prefixed and field-tagged serialisation fed
/// straight into the hasher. The first byte is always the schema version,
/// so that changing this format invalidates every previously cached
/// fingerprint (I1/I4).
pub struct FingerprintBuilder {
    hasher: Sha256,
}

/// Tags identify the *kind* of field being hashed, so that e.g. an empty
/// string and an absent optional field never collide.
#[repr(u8)]
#[derive(Clone, Copy)]
pub enum FieldTag {
    OpKind = 0,
    ToolVersion = 1,
    InputDigest = 2,
    CommandTemplate = 3,
    Argument = 4,
    EnvVar = 5,
    SandboxProfile = 6,
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        let mut hasher = Sha256::new();
        hasher.update([FINGERPRINT_SCHEMA_VERSION]);
        Self { hasher }
    }

    fn field(&mut self, tag: FieldTag, bytes: &[u8]) -> &mut Self {
        self.hasher.update([tag as u8]);
        hash_len_prefixed(&mut self.hasher, bytes);
        self
    }

    pub fn op_kind(&mut self, kind: &str) -> &mut Self {
        self.field(FieldTag::OpKind, kind.as_bytes())
    }

    pub fn tool_version(&mut self, version: &str) -> &mut Self {
        self.field(FieldTag::ToolVersion, version.as_bytes())
    }

    pub fn input_digest(&mut self, digest: &Digest) -> &mut Self {
        self.field(FieldTag::InputDigest, digest.as_bytes())
    }

    pub fn command_template(&mut self, template: &str) -> &mut Self {
        self.field(FieldTag::CommandTemplate, template.as_bytes())
    }

    /// Arguments are hashed in the order given: argument order is part of
    /// the fingerprint by design.
    pub fn arguments<I: IntoIterator<Item = S>, S: AsRef<str>>(&mut self, args: I) -> &mut Self {
        for arg in args {
            self.field(FieldTag::Argument, arg.as_ref().as_bytes());
        }
        self
    }

    /// Only the environment variables relevant to reproducibility
    /// (compiler version, flag set, sandbox profile id) should ever be
    /// passed here. Unrelated environment (PATH, TMP, locale) MUST NOT be
    /// included by callers.
    pub fn relevant_env(&mut self, key: &str, value: &str) -> &mut Self {
        self.field(FieldTag::EnvVar, format!("{key}={value}").as_bytes())
    }

    pub fn sandbox_profile(&mut self, profile_id: &str) -> &mut Self {
        self.field(FieldTag::SandboxProfile, profile_id.as_bytes())
    }

    /// Takes `&mut self` rather than consuming, so a call can be chained
    /// directly off the `&mut Self` the field-setters above return (e.g.
    /// `FingerprintBuilder::new().op_kind("x").finish()`) without an
    /// intermediate binding. Clones the running hash state rather than
    /// reaching into it destructively.
    pub fn finish(&mut self) -> Fingerprint {
        Fingerprint(self.hasher.clone().finalize().into())
    }
}

use tracing::instrument;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_digest_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let d1 = digest_file(&path).unwrap();
        let d2 = digest_file(&path).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn file_digest_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let d1 = digest_file(&path).unwrap();
        std::fs::write(&path, b"hello!").unwrap();
        let d2 = digest_file(&path).unwrap();
        assert_ne!(d1, d2);
    }

    #[test]
    fn tree_digest_ignores_unrelated_ordering() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"B").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"A").unwrap();
        let d1 = digest_tree(dir.path()).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        std::fs::write(dir2.path().join("a.txt"), b"A").unwrap();
        std::fs::write(dir2.path().join("b.txt"), b"B").unwrap();
        let d2 = digest_tree(dir2.path()).unwrap();

        assert_eq!(d1, d2);
    }

    #[test]
    fn fingerprint_changes_with_nonce_argument() {
        let base = || {
            let mut b = FingerprintBuilder::new();
            b.op_kind("generate").tool_version("1.0").command_template("gen {args}");
            b
        };
        let mut f1 = base();
        f1.arguments(["100"]);
        let mut f2 = base();
        f2.arguments(["100", "nonce-xyz"]);
        assert_ne!(f1.finish(), f2.finish());
    }

    #[test]
    fn seed64_is_stable_for_equal_calls() {
        let mut b1 = FingerprintBuilder::new();
        b1.op_kind("generate").arguments(["n=7"]);
        let mut b2 = FingerprintBuilder::new();
        b2.op_kind("generate").arguments(["n=7"]);
        assert_eq!(b1.finish().seed64(), b2.finish().seed64());
    }
}
