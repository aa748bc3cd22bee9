//! File-operation validation against the configured allow-lists.
//!
//! Every input file and output path a task names must live under an
//! allow-listed directory root, carry an allow-listed extension, and
//! (for existing files) stay under the size cap. Violations terminate
//! the task as failed with the reason in `result.error`; they are never
//! retried.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum input-file size: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 104_857_600;

/// Why a path was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Path not in allowed directories: {0}")]
    PathNotAllowed(String),

    #[error("File extension not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error("File size {size} exceeds maximum {max}")]
    FileTooLarge { size: u64, max: u64 },
}

/// Allow-lists governing task file I/O, from the `[security]` config
/// section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Directory roots tasks may read from and write to.
    pub allowed_roots: Vec<PathBuf>,
    /// Permitted file extensions, dot included (e.g. `.py`).
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Maximum size for existing input files, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_extensions() -> Vec<String> {
    [
        ".py", ".js", ".ts", ".html", ".css", ".json", ".yaml", ".yml", ".md", ".txt", ".sh",
        ".rs", ".toml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl SecurityPolicy {
    /// A policy rooted at the given directories with default extensions
    /// and size cap.
    pub fn rooted_at(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            allowed_roots: roots.into_iter().collect(),
            allowed_extensions: default_extensions(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    /// Validate one path for a task file operation.
    ///
    /// The path may not exist yet (output files); containment is checked
    /// lexically after resolving `.` and `..` components.
    pub fn validate(&self, path: &Path) -> Result<(), ValidationError> {
        let normalized = normalize(path);

        let contained = self
            .allowed_roots
            .iter()
            .any(|root| normalized.starts_with(normalize(root)));
        if !contained {
            return Err(ValidationError::PathNotAllowed(
                path.display().to_string(),
            ));
        }

        let extension = normalized
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()));
        let allowed = extension
            .as_deref()
            .is_some_and(|ext| self.allowed_extensions.iter().any(|a| a == ext));
        if !allowed {
            return Err(ValidationError::ExtensionNotAllowed(
                path.display().to_string(),
            ));
        }

        if let Ok(metadata) = std::fs::metadata(&normalized) {
            if metadata.len() > self.max_file_size {
                return Err(ValidationError::FileTooLarge {
                    size: metadata.len(),
                    max: self.max_file_size,
                });
            }
        }

        Ok(())
    }
}

/// Resolve `.` and `..` lexically without touching the filesystem, so
/// `allowed/../../etc/passwd` cannot sneak past the containment check.
fn normalize(path: &Path) -> PathBuf {
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

// ── tests ────────────────────────────────────────────────────────────
