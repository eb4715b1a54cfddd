//! Tree Manifest
//!
//! The expected shape of an installation tree after an update attempt:
//! files with their contents and permissions, directories that must survive
//! or be removed. Manifests are JSON documents, normally one per outcome
//! (success and failure), built once per run and only read afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Expected post-update tree shape
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeManifest {
    /// Individual file expectations, checked in order
    #[serde(default)]
    pub files: Vec<FileExpectation>,

    /// Directory expectations, checked in order
    #[serde(default)]
    pub directories: Vec<DirectoryExpectation>,
}

/// Expectation for a single file relative to the tree root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileExpectation {
    pub path: PathBuf,

    /// When false the file must be absent
    #[serde(default = "default_true")]
    pub must_exist: bool,

    /// Literal expected contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,

    /// Reference file (relative to the manifest's reference directory) the
    /// contents must equal byte for byte
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_file: Option<PathBuf>,

    /// Expected permission bits; accepts a number or an octal string ("0755")
    #[serde(
        default,
        deserialize_with = "deserialize_mode",
        skip_serializing_if = "Option::is_none"
    )]
    pub mode: Option<u32>,
}

/// Where the expected bytes of a file come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedContent<'a> {
    Literal(&'a [u8]),
    Reference(&'a Path),
}

/// Expectation for a directory relative to the tree root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryExpectation {
    pub path: PathBuf,

    /// When true the directory itself must be gone
    #[serde(default)]
    pub removed: bool,

    /// File names directly inside this directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,

    /// When true the listed files must be absent even though the
    /// directory survives
    #[serde(default)]
    pub files_removed: bool,

    /// Nested directories, paths relative to this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subdirs: Vec<DirectoryExpectation>,
}

fn default_true() -> bool {
    true
}

fn deserialize_mode<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Mode {
        Number(u32),
        Octal(String),
    }

    match Option::<Mode>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Mode::Number(n)) => Ok(Some(n)),
        Some(Mode::Octal(s)) => {
            let digits = s.trim_start_matches("0o");
            u32::from_str_radix(digits, 8)
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid octal mode: {}", s)))
        }
    }
}

impl FileExpectation {
    /// A file that must exist with the given contents
    pub fn with_contents(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            must_exist: true,
            contents: Some(contents.into()),
            compare_file: None,
            mode: None,
        }
    }

    /// A file that must exist and equal a reference file
    pub fn matching_file(path: impl Into<PathBuf>, reference: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            must_exist: true,
            contents: None,
            compare_file: Some(reference.into()),
            mode: None,
        }
    }

    /// A file that must not exist
    pub fn absent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            must_exist: false,
            contents: None,
            compare_file: None,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Literal contents win over a reference file when both are given
    pub fn expected_content(&self) -> Option<ExpectedContent<'_>> {
        if let Some(ref contents) = self.contents {
            Some(ExpectedContent::Literal(contents.as_bytes()))
        } else {
            self.compare_file.as_deref().map(ExpectedContent::Reference)
        }
    }
}

impl DirectoryExpectation {
    pub fn present(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removed: false,
            files: Vec::new(),
            files_removed: false,
            subdirs: Vec::new(),
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self {
            removed: true,
            ..Self::present(path)
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn files_removed(mut self) -> Self {
        self.files_removed = true;
        self
    }

    pub fn with_subdir(mut self, subdir: DirectoryExpectation) -> Self {
        self.subdirs.push(subdir);
        self
    }
}

impl TreeManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, file: FileExpectation) -> Self {
        self.files.push(file);
        self
    }

    pub fn directory(mut self, dir: DirectoryExpectation) -> Self {
        self.directories.push(dir);
        self
    }

    /// Parse a manifest from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse manifest JSON")
    }

    /// Load a manifest from disk
    pub async fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;

        Self::from_json(&json)
    }

    /// Save the manifest to disk
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create manifest directory")?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize manifest")?;

        fs::write(path, json)
            .await
            .context("Failed to write manifest file")?;

        tracing::info!("Saved manifest to {:?}", path);
        Ok(())
    }

    /// Total number of expectations, nested directories included
    pub fn len(&self) -> usize {
        fn count(dir: &DirectoryExpectation) -> usize {
            1 + dir.files.len() + dir.subdirs.iter().map(count).sum::<usize>()
        }
        self.files.len() + self.directories.iter().map(count).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest_json() {
        let json = r#"{
            "files": [
                { "path": "a/b/searchplugins/searchpluginstext0", "contents": "ShouldNotBeReplaced\n", "mode": "0775" },
                { "path": "a/b/defaults/pref/channel-prefs.js", "compare_file": "complete.png", "mode": 420 },
                { "path": "a/b/removed-files", "must_exist": false }
            ],
            "directories": [
                { "path": "a/b/3", "files": ["3text0", "3text1"], "files_removed": true },
                { "path": "a/b/4", "removed": true },
                { "path": "a/b/8", "subdirs": [{ "path": "82", "subdirs": [{ "path": "820" }] }] }
            ]
        }"#;

        let manifest = TreeManifest::from_json(json).unwrap();
        assert_eq!(manifest.files.len(), 3);
        assert_eq!(manifest.files[0].mode, Some(0o775));
        assert_eq!(manifest.files[1].mode, Some(0o644));
        assert!(manifest.files[0].must_exist);
        assert!(!manifest.files[2].must_exist);
        assert!(manifest.directories[0].files_removed);
        assert!(manifest.directories[1].removed);
        assert_eq!(manifest.directories[2].subdirs[0].subdirs[0].path, PathBuf::from("820"));
    }

    #[test]
    fn test_invalid_octal_mode_rejected() {
        let json = r#"{ "files": [{ "path": "x", "mode": "0999" }] }"#;
        assert!(TreeManifest::from_json(json).is_err());
    }

    #[test]
    fn test_expected_content_prefers_literal() {
        let mut file = FileExpectation::with_contents("a", "text");
        file.compare_file = Some(PathBuf::from("ref"));
        assert_eq!(file.expected_content(), Some(ExpectedContent::Literal(b"text")));

        let file = FileExpectation::matching_file("a", "ref");
        assert_eq!(
            file.expected_content(),
            Some(ExpectedContent::Reference(Path::new("ref")))
        );
        assert_eq!(FileExpectation::absent("a").expected_content(), None);
    }

    #[test]
    fn test_builder_counts() {
        let manifest = TreeManifest::new()
            .file(FileExpectation::absent("a/b/text0"))
            .directory(
                DirectoryExpectation::present("a/b/9/92")
                    .with_subdir(DirectoryExpectation::present("920"))
                    .with_subdir(DirectoryExpectation::present("921")),
            )
            .directory(DirectoryExpectation::removed("a/b/9/93"));

        assert_eq!(manifest.len(), 5);
        assert!(!manifest.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manifests").join("success.json");
        let manifest = TreeManifest::new()
            .file(FileExpectation::with_contents("a/b/text0", "ToBeModified\n").with_mode(0o644));

        manifest.save(&path).await.unwrap();
        let loaded = TreeManifest::load(&path).await.unwrap();

        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].mode, Some(0o644));
        assert_eq!(loaded.files[0].contents.as_deref(), Some("ToBeModified\n"));
    }
}
