//! Tree Verifier
//!
//! Compares an installation tree against a [`TreeManifest`] and scans it for
//! artifacts the updater must never leave behind. Every check runs; nothing
//! short-circuits, so one pass reports every mismatch.

use crate::manifest::{DirectoryExpectation, ExpectedContent, FileExpectation, TreeManifest};
use crate::paths::artifacts;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Permission bits compared on Unix (setuid/setgid/sticky + rwx)
const MODE_MASK: u32 = 0o7777;

/// A single difference between the tree and its manifest
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    #[error("file missing: {path}")]
    Missing { path: PathBuf },

    #[error("file should not exist: {path}")]
    Unexpected { path: PathBuf },

    #[error("directory missing: {path}")]
    DirectoryMissing { path: PathBuf },

    #[error("directory should have been removed: {path}")]
    DirectoryNotRemoved { path: PathBuf },

    #[error("contents differ: {path} (expected sha256 {expected_sha256}, found {actual_sha256})")]
    ContentDiffers {
        path: PathBuf,
        expected_sha256: String,
        actual_sha256: String,
    },

    #[error("permissions differ: {path} (expected {expected:o}, found {actual:o})")]
    ModeDiffers {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("unreadable: {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("leftover artifact: {path}")]
    Leftover { path: PathBuf },
}

/// Verifies one tree root against manifests
#[derive(Debug, Clone)]
pub struct TreeVerifier {
    root: PathBuf,
    reference_dir: PathBuf,
    reserved_extensions: Vec<String>,
}

impl TreeVerifier {
    /// `reference_dir` resolves `compare_file` entries of the manifest
    pub fn new(root: impl Into<PathBuf>, reference_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reference_dir: reference_dir.into(),
            reserved_extensions: artifacts::default_reserved(),
        }
    }

    pub fn with_reserved_extensions(mut self, extensions: Vec<String>) -> Self {
        self.reserved_extensions = extensions;
        self
    }

    /// Check every manifest expectation against the tree
    pub fn verify(&self, manifest: &TreeManifest) -> Vec<Mismatch> {
        let mut mismatches = Vec::new();

        for file in &manifest.files {
            self.check_file(file, &mut mismatches);
        }

        for dir in &manifest.directories {
            self.check_directory(Path::new(""), dir, &mut mismatches);
        }

        mismatches
    }

    /// Walk the tree root plus `extra_dirs` and flag reserved extensions
    pub fn check_leftovers(&self, extra_dirs: &[&Path]) -> Vec<Mismatch> {
        let mut mismatches = Vec::new();

        for dir in std::iter::once(self.root.as_path()).chain(extra_dirs.iter().copied()) {
            if !dir.is_dir() {
                mismatches.push(Mismatch::DirectoryMissing {
                    path: dir.to_path_buf(),
                });
                continue;
            }

            for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
                match entry {
                    Ok(entry) => {
                        if artifacts::is_reserved(entry.path(), &self.reserved_extensions) {
                            mismatches.push(Mismatch::Leftover {
                                path: entry.path().to_path_buf(),
                            });
                        }
                    }
                    Err(e) => mismatches.push(Mismatch::Unreadable {
                        path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
                        reason: e.to_string(),
                    }),
                }
            }
        }

        mismatches
    }

    /// Manifest checks followed by the leftover scan
    pub fn verify_all(&self, manifest: &TreeManifest, extra_dirs: &[&Path]) -> Vec<Mismatch> {
        let mut mismatches = self.verify(manifest);
        mismatches.extend(self.check_leftovers(extra_dirs));
        mismatches
    }

    fn check_file(&self, file: &FileExpectation, out: &mut Vec<Mismatch>) {
        let path = self.root.join(&file.path);
        debug!("testing file: {}", path.display());

        if !file.must_exist {
            if path.exists() {
                out.push(Mismatch::Unexpected { path });
            }
            return;
        }

        if !path.is_file() {
            out.push(Mismatch::Missing { path });
            return;
        }

        if let Some(expected) = file.mode {
            check_mode(&path, expected, out);
        }

        let Some(source) = file.expected_content() else {
            return;
        };

        let actual = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                out.push(Mismatch::Unreadable {
                    path,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let expected = match source {
            ExpectedContent::Literal(bytes) => bytes.to_vec(),
            ExpectedContent::Reference(reference) => {
                let reference = self.reference_dir.join(reference);
                match std::fs::read(&reference) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        out.push(Mismatch::Unreadable {
                            path: reference,
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            }
        };

        if actual != expected {
            out.push(Mismatch::ContentDiffers {
                path,
                expected_sha256: sha256_hex(&expected),
                actual_sha256: sha256_hex(&actual),
            });
        }
    }

    fn check_directory(&self, parent: &Path, dir: &DirectoryExpectation, out: &mut Vec<Mismatch>) {
        let rel = parent.join(&dir.path);
        let path = self.root.join(&rel);
        debug!("testing directory: {}", path.display());

        if dir.removed {
            if path.exists() {
                out.push(Mismatch::DirectoryNotRemoved { path });
            }
            return;
        }

        if !path.is_dir() {
            out.push(Mismatch::DirectoryMissing { path });
            return;
        }

        for name in &dir.files {
            let file = path.join(name);
            match (dir.files_removed, file.exists()) {
                (true, true) => out.push(Mismatch::Unexpected { path: file }),
                (false, false) => out.push(Mismatch::Missing { path: file }),
                _ => {}
            }
        }

        for subdir in &dir.subdirs {
            self.check_directory(&rel, subdir, out);
        }
    }
}

#[cfg(unix)]
fn check_mode(path: &Path, expected: u32, out: &mut Vec<Mismatch>) {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let actual = meta.permissions().mode() & MODE_MASK;
            let expected = expected & MODE_MASK;
            if actual != expected {
                out.push(Mismatch::ModeDiffers {
                    path: path.to_path_buf(),
                    expected,
                    actual,
                });
            }
        }
        Err(e) => out.push(Mismatch::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

// chmod does not map onto these platforms' permission model
#[cfg(not(unix))]
fn check_mode(_path: &Path, _expected: u32, _out: &mut Vec<Mismatch>) {
    let _ = MODE_MASK;
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_matching_tree_has_no_mismatches() {
        let tree = TempDir::new().unwrap();
        let refs = TempDir::new().unwrap();
        write(tree.path(), "a/b/text0", "ToBeModified\n");
        write(tree.path(), "a/b/precomplete", "remove \"text1\"\n");
        write(refs.path(), "precomplete_ref", "remove \"text1\"\n");
        fs::create_dir_all(tree.path().join("a/b/3")).unwrap();
        fs::create_dir_all(tree.path().join("a/b/9/92/920")).unwrap();

        let manifest = TreeManifest::new()
            .file(FileExpectation::with_contents("a/b/text0", "ToBeModified\n"))
            .file(FileExpectation::matching_file("a/b/precomplete", "precomplete_ref"))
            .file(FileExpectation::absent("a/b/text1"))
            .directory(
                DirectoryExpectation::present("a/b/3")
                    .with_files(["3text0", "3text1"])
                    .files_removed(),
            )
            .directory(DirectoryExpectation::removed("a/b/4"))
            .directory(
                DirectoryExpectation::present("a/b/9/92")
                    .with_subdir(DirectoryExpectation::present("920")),
            );

        let verifier = TreeVerifier::new(tree.path(), refs.path());
        assert!(verifier.verify_all(&manifest, &[]).is_empty());
    }

    #[test]
    fn test_reports_every_mismatch() {
        let tree = TempDir::new().unwrap();
        write(tree.path(), "a/b/text0", "Original\n");
        write(tree.path(), "a/b/text1", "Leftover\n");
        fs::create_dir_all(tree.path().join("a/b/4")).unwrap();

        let manifest = TreeManifest::new()
            .file(FileExpectation::with_contents("a/b/text0", "ToBeModified\n"))
            .file(FileExpectation::absent("a/b/text1"))
            .file(FileExpectation::with_contents("a/b/exe0.exe", "x"))
            .directory(DirectoryExpectation::removed("a/b/4"))
            .directory(DirectoryExpectation::present("a/b/8").with_files(["81text0"]));

        let verifier = TreeVerifier::new(tree.path(), tree.path());
        let mismatches = verifier.verify(&manifest);

        assert_eq!(mismatches.len(), 5);
        assert!(matches!(mismatches[0], Mismatch::ContentDiffers { .. }));
        assert!(matches!(mismatches[1], Mismatch::Unexpected { .. }));
        assert!(matches!(mismatches[2], Mismatch::Missing { .. }));
        assert!(matches!(mismatches[3], Mismatch::DirectoryNotRemoved { .. }));
        assert!(matches!(mismatches[4], Mismatch::DirectoryMissing { .. }));
    }

    #[test]
    fn test_unlisted_entries_are_ignored() {
        let tree = TempDir::new().unwrap();
        write(tree.path(), "a/b/8/81/81text0", "");
        write(tree.path(), "a/b/8/81/unlisted", "");

        let manifest = TreeManifest::new().directory(
            DirectoryExpectation::present("a/b/8")
                .with_subdir(DirectoryExpectation::present("81").with_files(["81text0"])),
        );

        let verifier = TreeVerifier::new(tree.path(), tree.path());
        assert!(verifier.verify(&manifest).is_empty());
    }

    #[test]
    fn test_leftover_artifacts_flagged_outside_manifest() {
        let tree = TempDir::new().unwrap();
        let updates = TempDir::new().unwrap();
        write(tree.path(), "a/b/7/70/7xtext0.backup", "");
        write(tree.path(), "a/b/text0", "");
        write(updates.path(), "0/text0.patch", "");

        let verifier = TreeVerifier::new(tree.path(), tree.path());
        let mismatches = verifier.check_leftovers(&[updates.path()]);

        assert_eq!(mismatches.len(), 2);
        assert!(mismatches
            .iter()
            .all(|m| matches!(m, Mismatch::Leftover { .. })));
    }

    #[test]
    fn test_missing_scan_root_reported() {
        let tree = TempDir::new().unwrap();
        let verifier = TreeVerifier::new(tree.path().join("gone"), tree.path());
        assert_eq!(
            verifier.check_leftovers(&[]),
            vec![Mismatch::DirectoryMissing {
                path: tree.path().join("gone")
            }]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_mismatch() {
        use std::os::unix::fs::PermissionsExt;

        let tree = TempDir::new().unwrap();
        write(tree.path(), "a/b/exe0", "bin");
        let path = tree.path().join("a/b/exe0");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let exe = FileExpectation::with_contents("a/b/exe0", "bin");
        let ok = TreeManifest::new().file(exe.clone().with_mode(0o100644));
        let bad = TreeManifest::new().file(exe.with_mode(0o755));

        let verifier = TreeVerifier::new(tree.path(), tree.path());
        assert!(verifier.verify(&ok).is_empty());
        assert_eq!(
            verifier.verify(&bad),
            vec![Mismatch::ModeDiffers {
                path,
                expected: 0o755,
                actual: 0o644
            }]
        );
    }
}
