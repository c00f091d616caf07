//! Versioned skill package storage.
//!
//! Packages are stored as immutable version trees under
//! `{prefix}{skill_id}/v{n}/...` with a `latest.json` pointer written last,
//! acting as the publish commit point. The filesystem implementation backs
//! both the `local` backend and the shared-volume `remote` backend.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("version v{1} of skill {0} already exists")]
    VersionExists(String, u32),

    #[error("version v{1} of skill {0} not found")]
    VersionNotFound(String, u32),

    #[error("invalid latest.json for skill {0}: {1}")]
    CorruptLatest(String, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contents of `latest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestPointer {
    pub version: u32,
    pub published_at: DateTime<Utc>,
}

pub trait ObjectStore: Send + Sync {
    /// Write a version tree from `src_dir`. Creating the version directory is
    /// the claim: a concurrent publisher racing for the same number gets
    /// [`ObjectStoreError::VersionExists`] and retries with the next one.
    /// Returns the object key prefix of the written version.
    fn put_version(
        &self,
        skill_id: &str,
        version: u32,
        src_dir: &Path,
    ) -> Result<String, ObjectStoreError>;

    /// Write `latest.json`, completing a publish.
    fn commit_latest(
        &self,
        skill_id: &str,
        version: u32,
        published_at: DateTime<Utc>,
    ) -> Result<(), ObjectStoreError>;

    fn get_latest(&self, skill_id: &str) -> Result<Option<LatestPointer>, ObjectStoreError>;

    /// Materialize a version tree into `dest_dir`, replacing its contents.
    fn fetch_version(
        &self,
        skill_id: &str,
        version: u32,
        dest_dir: &Path,
    ) -> Result<(), ObjectStoreError>;

    /// Committed versions of a skill, ascending.
    fn list_versions(&self, skill_id: &str) -> Result<Vec<u32>, ObjectStoreError>;

    fn delete_version(&self, skill_id: &str, version: u32) -> Result<(), ObjectStoreError>;

    /// Download every skill's latest version into `cache_dir/{skill_id}`.
    /// Returns the number of skills synced; per-skill failures are logged
    /// and skipped.
    fn sync_all(&self, cache_dir: &Path) -> Result<usize, ObjectStoreError>;

    /// Stash a raw upload under `uploads/{uuid}.zip` for later inspection.
    /// Stashed archives older than a day are purged on the next stash.
    /// Returns the object key.
    fn stash_upload(&self, bytes: &[u8]) -> Result<String, ObjectStoreError>;
}

/// Filesystem-backed object store rooted at a bucket directory.
pub struct FsObjectStore {
    root: PathBuf,
    prefix: String,
}

const LATEST_JSON: &str = "latest.json";

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> std::io::Result<Self> {
        let store = Self {
            root: root.into(),
            prefix: prefix.into(),
        };
        fs::create_dir_all(store.prefix_dir())?;
        Ok(store)
    }

    fn prefix_dir(&self) -> PathBuf {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.root.join(trimmed)
        }
    }

    fn skill_dir(&self, skill_id: &str) -> PathBuf {
        self.prefix_dir().join(skill_id)
    }

    fn version_dir(&self, skill_id: &str, version: u32) -> PathBuf {
        self.skill_dir(skill_id).join(format!("v{version}"))
    }

    fn object_key(&self, skill_id: &str, version: u32) -> String {
        format!("{}{}/v{}/", self.prefix, skill_id, version)
    }
}

impl ObjectStore for FsObjectStore {
    fn put_version(
        &self,
        skill_id: &str,
        version: u32,
        src_dir: &Path,
    ) -> Result<String, ObjectStoreError> {
        let dir = self.version_dir(skill_id, version);
        fs::create_dir_all(dir.parent().unwrap())?;

        // Exclusive create claims the version number.
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ObjectStoreError::VersionExists(
                    skill_id.to_string(),
                    version,
                ));
            }
            Err(e) => return Err(e.into()),
        }

        copy_tree(src_dir, &dir)?;
        debug!("wrote {} files for {} v{}", count_files(&dir), skill_id, version);
        Ok(self.object_key(skill_id, version))
    }

    fn commit_latest(
        &self,
        skill_id: &str,
        version: u32,
        published_at: DateTime<Utc>,
    ) -> Result<(), ObjectStoreError> {
        let pointer = LatestPointer {
            version,
            published_at,
        };
        let path = self.skill_dir(skill_id).join(LATEST_JSON);
        let json = serde_json::to_vec(&pointer).expect("latest pointer serializes");
        // Write-then-rename so readers never observe a torn pointer.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get_latest(&self, skill_id: &str) -> Result<Option<LatestPointer>, ObjectStoreError> {
        let path = self.skill_dir(skill_id).join(LATEST_JSON);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let pointer = serde_json::from_slice(&data)
            .map_err(|e| ObjectStoreError::CorruptLatest(skill_id.to_string(), e.to_string()))?;
        Ok(Some(pointer))
    }

    fn fetch_version(
        &self,
        skill_id: &str,
        version: u32,
        dest_dir: &Path,
    ) -> Result<(), ObjectStoreError> {
        let dir = self.version_dir(skill_id, version);
        if !dir.is_dir() {
            return Err(ObjectStoreError::VersionNotFound(
                skill_id.to_string(),
                version,
            ));
        }
        if dest_dir.exists() {
            fs::remove_dir_all(dest_dir)?;
        }
        fs::create_dir_all(dest_dir)?;
        copy_tree(&dir, dest_dir)?;
        Ok(())
    }

    fn list_versions(&self, skill_id: &str) -> Result<Vec<u32>, ObjectStoreError> {
        let dir = self.skill_dir(skill_id);
        let mut versions = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(n) = entry
                .file_name()
                .to_string_lossy()
                .strip_prefix('v')
                .and_then(|s| s.parse::<u32>().ok())
            {
                versions.push(n);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn delete_version(&self, skill_id: &str, version: u32) -> Result<(), ObjectStoreError> {
        let dir = self.version_dir(skill_id, version);
        if dir.is_dir() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn sync_all(&self, cache_dir: &Path) -> Result<usize, ObjectStoreError> {
        fs::create_dir_all(cache_dir)?;
        let mut count = 0;
        let entries = match fs::read_dir(self.prefix_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let skill_id = entry.file_name().to_string_lossy().to_string();
            let result = self.get_latest(&skill_id).and_then(|latest| match latest {
                Some(pointer) => {
                    self.fetch_version(&skill_id, pointer.version, &cache_dir.join(&skill_id))
                }
                None => Ok(()),
            });
            match result {
                Ok(()) => count += 1,
                Err(e) => warn!("failed to sync skill {}: {}", skill_id, e),
            }
        }
        Ok(count)
    }

    fn stash_upload(&self, bytes: &[u8]) -> Result<String, ObjectStoreError> {
        let dir = self.uploads_dir();
        fs::create_dir_all(&dir)?;
        match purge_stale_uploads(&dir) {
            Ok(0) => {}
            Ok(n) => debug!("purged {} stale uploads", n),
            Err(e) => warn!("failed to purge stale uploads: {}", e),
        }

        let name = format!("{}.zip", uuid::Uuid::new_v4());
        fs::write(dir.join(&name), bytes)?;
        Ok(format!("{}/{}", UPLOADS_DIR, name))
    }
}

const UPLOADS_DIR: &str = "uploads";
const UPLOAD_RETENTION: std::time::Duration = std::time::Duration::from_secs(24 * 3600);

impl FsObjectStore {
    fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }
}

fn purge_stale_uploads(dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let cutoff = std::time::SystemTime::now() - UPLOAD_RETENTION;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let modified = entry.metadata()?.modified()?;
        if modified < cutoff {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn count_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| {
                    if e.path().is_dir() {
                        count_files(&e.path())
                    } else {
                        1
                    }
                })
                .sum()
        })
        .unwrap_or(0)
}
