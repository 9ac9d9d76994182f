use crate::error::{PipelineError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

const HASH_CHUNK_BYTES: usize = 1024 * 1024;

/// Repository root that every CLI path argument is resolved against.
///
/// Relative paths may not contain `..` segments and the resolved path must
/// stay inside the root. Absolute paths are rejected unless explicitly
/// allowed, and even then must stay inside the root.
#[derive(Debug, Clone)]
pub struct RepoRoot {
    root: PathBuf,
}

impl RepoRoot {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| PipelineError::Path(format!("invalid repo root {}: {}", root.display(), e)))?;
        Ok(RepoRoot { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolves a user-supplied path against the repo root.
    pub fn resolve(&self, raw: &str, must_exist: bool, allow_absolute: bool) -> Result<PathBuf> {
        if raw.is_empty() {
            return Err(PipelineError::Path("path cannot be empty".to_string()));
        }

        let candidate = PathBuf::from(raw);
        let resolved = if candidate.is_absolute() {
            if !allow_absolute {
                return Err(PipelineError::Path(format!(
                    "absolute paths are not allowed: {raw}"
                )));
            }
            candidate
        } else {
            if candidate.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(PipelineError::Path(format!(
                    "parent path segments are not allowed: {raw}"
                )));
            }
            self.root.join(candidate)
        };

        // Canonicalize through the nearest existing ancestor so paths that
        // do not exist yet (output files) still get containment-checked.
        let checked = lexical_normalize(&resolved);
        if !checked.starts_with(&self.root) {
            return Err(PipelineError::Path(format!(
                "path escapes repository root: {raw}"
            )));
        }

        if must_exist && !checked.exists() {
            return Err(PipelineError::Path(format!(
                "path does not exist: {}",
                checked.display()
            )));
        }

        Ok(checked)
    }

    /// Returns the repo-relative form of an absolute path, if it is inside
    /// the root. Used for stable record identity.
    pub fn relative(&self, abs: &Path) -> Option<PathBuf> {
        abs.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    /// Resolves `raw` and returns both the repo-relative string (forward
    /// slashes) and the absolute path. Falls back to the raw string when
    /// the path lies outside the root.
    pub fn resolve_relative(&self, raw: &str) -> (String, Option<PathBuf>) {
        match self.resolve(raw, false, true) {
            Ok(abs) => {
                let rel = self
                    .relative(&abs)
                    .map(|p| slash_normalize(&p.to_string_lossy()))
                    .unwrap_or_else(|| slash_normalize(raw));
                (rel, Some(abs))
            }
            Err(_) => (slash_normalize(raw), None),
        }
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

pub fn slash_normalize(raw: &str) -> String {
    raw.replace('\\', "/")
}

/// Deterministic record id for a repo-relative source path. Stable across
/// re-ingestion runs so the same file always maps to the same id.
pub fn stable_id_for_path(rel_path: &str) -> String {
    let key = slash_normalize(rel_path).to_lowercase();
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in &digest[..16] {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Streams a file through SHA-256. Any I/O failure yields `None`; a record
/// with an unreadable source simply has no content hash.
pub fn sha256_file(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    loop {
        let read = file.read(&mut buf).ok()?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    Some(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_root() -> (tempfile::TempDir, RepoRoot) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = RepoRoot::new(dir.path()).expect("repo root");
        (dir, root)
    }

    #[test]
    fn resolve_rejects_parent_segments() {
        let (_dir, root) = temp_root();
        assert!(root.resolve("../outside.db", false, false).is_err());
        assert!(root.resolve("out/../../outside.db", false, false).is_err());
    }

    #[test]
    fn resolve_rejects_absolute_by_default() {
        let (_dir, root) = temp_root();
        assert!(root.resolve("/etc/passwd", false, false).is_err());
    }

    #[test]
    fn resolve_rejects_absolute_outside_root_even_when_allowed() {
        let (_dir, root) = temp_root();
        assert!(root.resolve("/etc/passwd", false, true).is_err());
    }

    #[test]
    fn resolve_accepts_nested_relative_path() {
        let (_dir, root) = temp_root();
        let resolved = root.resolve("out/images.db", false, false).expect("resolve");
        assert!(resolved.starts_with(root.path()));
    }

    #[test]
    fn resolve_relative_returns_forward_slash_key() {
        let (dir, root) = temp_root();
        fs::create_dir_all(dir.path().join("Input")).expect("mkdir");
        fs::write(dir.path().join("Input/a.png"), b"x").expect("write");
        let (rel, abs) = root.resolve_relative("Input/a.png");
        assert_eq!(rel, "Input/a.png");
        assert!(abs.expect("abs path").exists());
    }

    #[test]
    fn stable_id_is_deterministic_and_case_folded() {
        let a = stable_id_for_path("Input/a.png");
        let b = stable_id_for_path("input\\A.PNG");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("blob.bin");
        fs::write(&path, b"abc").expect("write");
        assert_eq!(
            sha256_file(&path).as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn sha256_file_returns_none_for_missing_file() {
        assert!(sha256_file(Path::new("/definitely/not/here.png")).is_none());
    }
}
