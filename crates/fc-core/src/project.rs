use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Name of the per-project state directory.
pub const PROJECT_DIR_NAME: &str = ".flexicli";

/// Current on-disk schema version, bumped on breaking layout changes.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProjectError>;

// ---------------------------------------------------------------------------
// Project identity
// ---------------------------------------------------------------------------

/// Derive the stable project identifier: the first 16 hex characters of
/// SHA-256 over the absolute project root path.
pub fn project_id(root: &Path) -> String {
    let absolute = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}

// ---------------------------------------------------------------------------
// ProjectMeta
// ---------------------------------------------------------------------------

/// Contents of `<root>/.flexicli/meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMeta {
    pub project_id: String,
    pub root_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,
    pub embeddings_model: Option<String>,
}

// ---------------------------------------------------------------------------
// ProjectDirs
// ---------------------------------------------------------------------------

/// The resolved directory layout for one project.
///
/// Every path the runtime touches for a project is derived from here; no
/// component reads or writes outside the project directory.
#[derive(Debug, Clone)]
pub struct ProjectDirs {
    pub id: String,
    pub root: PathBuf,
    pub base: PathBuf,
}

impl ProjectDirs {
    /// Open (creating if needed) the `.flexicli/` layout under `root` and
    /// write or refresh `meta.json`.
    pub fn open(root: impl Into<PathBuf>, embeddings_model: Option<String>) -> Result<Self> {
        let root = root.into();
        let id = project_id(&root);
        let base = root.join(PROJECT_DIR_NAME);

        for dir in [
            base.clone(),
            base.join("sessions"),
            base.join("cache"),
            base.join("logs"),
            base.join("checkpoints"),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        let dirs = Self { id, root, base };
        dirs.write_meta(embeddings_model)?;
        Ok(dirs)
    }

    fn write_meta(&self, embeddings_model: Option<String>) -> Result<()> {
        let path = self.meta_path();
        let now = Utc::now();
        let meta = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<ProjectMeta>(&text) {
                Ok(mut existing) => {
                    existing.updated_at = now;
                    if embeddings_model.is_some() {
                        existing.embeddings_model = embeddings_model;
                    }
                    existing
                }
                Err(_) => self.fresh_meta(now, embeddings_model),
            },
            Err(_) => self.fresh_meta(now, embeddings_model),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }

    fn fresh_meta(&self, now: DateTime<Utc>, embeddings_model: Option<String>) -> ProjectMeta {
        ProjectMeta {
            project_id: self.id.clone(),
            root_path: self.root.to_string_lossy().into_owned(),
            created_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
            embeddings_model,
        }
    }

    pub fn meta_path(&self) -> PathBuf {
        self.base.join("meta.json")
    }

    pub fn db_path(&self) -> PathBuf {
        self.base.join("flexicli.db")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    pub fn session_dir(&self, session_id: &uuid::Uuid) -> PathBuf {
        self.sessions_dir().join(session_id.to_string())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base.join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.base.join("checkpoints")
    }

    pub fn read_meta(&self) -> Result<ProjectMeta> {
        let text = std::fs::read_to_string(self.meta_path())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Whether `path` is inside this project's root.
    pub fn contains(&self, path: &Path) -> bool {
        let candidate = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        let root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        candidate.starts_with(&root)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_is_16_hex_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = project_id(dir.path());
        let b = project_id(dir.path());
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_roots_get_different_ids() {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        assert_ne!(project_id(d1.path()), project_id(d2.path()));
    }

    #[test]
    fn open_creates_layout_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = ProjectDirs::open(dir.path(), Some("text-embedding-3-small".into())).unwrap();

        assert!(dirs.base.is_dir());
        assert!(dirs.sessions_dir().is_dir());
        assert!(dirs.cache_dir().is_dir());
        assert!(dirs.logs_dir().is_dir());
        assert!(dirs.checkpoints_dir().is_dir());

        let meta = dirs.read_meta().unwrap();
        assert_eq!(meta.project_id, dirs.id);
        assert_eq!(meta.schema_version, SCHEMA_VERSION);
        assert_eq!(meta.embeddings_model.as_deref(), Some("text-embedding-3-small"));
    }

    #[test]
    fn reopen_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProjectDirs::open(dir.path(), None).unwrap();
        let created = first.read_meta().unwrap().created_at;

        let second = ProjectDirs::open(dir.path(), None).unwrap();
        let meta = second.read_meta().unwrap();
        assert_eq!(meta.created_at, created);
        assert!(meta.updated_at >= created);
    }

    #[test]
    fn contains_rejects_outside_paths() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let dirs = ProjectDirs::open(dir.path(), None).unwrap();
        assert!(dirs.contains(&dirs.db_path()));
        assert!(!dirs.contains(other.path()));
    }
}
