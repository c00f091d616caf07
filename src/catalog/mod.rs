//! The skill catalog: the authoritative in-process view of loaded skills.
//!
//! Holds the `skill_id -> Arc<Skill>` map every MCP surface reads from.
//! Mutations (publish, rollback, reload, unload) are serialized per skill id
//! and only flip the map entry after the object store commit, so readers
//! always observe a fully published version.

mod refresh;

pub use refresh::spawn_refresh_task;

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::skill::loader::MAX_PACKAGE_BYTES;
use crate::skill::{LoadError, Skill, SkillLoader, SkillStatus, SKILL_MD_FILENAME};
use crate::storage::{MetadataStore, ObjectStore, ObjectStoreError, SkillMeta, VersionEntry};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid package: {0}")]
    Rejected(#[from] LoadError),

    #[error("invalid archive: {0}")]
    Archive(String),

    #[error("skill not found: {0}")]
    UnknownSkill(String),

    #[error("skill {0} has no version v{1}")]
    UnknownVersion(String, u32),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<ObjectStoreError> for CatalogError {
    fn from(e: ObjectStoreError) -> Self {
        CatalogError::Storage(e.into())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub id: String,
    pub version: u32,
}

pub struct SkillCatalog {
    skills: RwLock<HashMap<String, Arc<Skill>>>,
    id_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    loader: SkillLoader,
    cache_dir: PathBuf,
}

impl SkillCatalog {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            skills: RwLock::new(HashMap::new()),
            id_locks: StdMutex::new(HashMap::new()),
            objects,
            metadata,
            loader: SkillLoader::new(),
            cache_dir,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, skill_id: &str) -> Option<Arc<Skill>> {
        self.skills.read().unwrap().get(skill_id).cloned()
    }

    /// All catalog entries (including errored ones), ordered by id.
    pub fn list(&self) -> Vec<Arc<Skill>> {
        let mut skills: Vec<_> = self.skills.read().unwrap().values().cloned().collect();
        skills.sort_by(|a, b| a.id.cmp(&b.id));
        skills
    }

    /// Active skills only, ordered by id.
    pub fn list_active(&self) -> Vec<Arc<Skill>> {
        self.list().into_iter().filter(|s| s.is_active()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.read().unwrap().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.skills
            .read()
            .unwrap()
            .values()
            .filter(|s| s.is_active())
            .count()
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Pull the active set from the metadata store and load each skill from
    /// the object store. Individual failures do not abort boot; they are
    /// recorded as errored catalog entries.
    pub async fn boot(&self) -> Result<usize, CatalogError> {
        let metas = self.metadata.list(Some(SkillStatus::Active))?;
        let mut loaded = 0;
        for meta in metas {
            match self.materialize(&meta).await {
                Ok(skill) => {
                    self.insert(skill);
                    loaded += 1;
                }
                Err(e) => {
                    error!("failed to load skill {} at boot: {}", meta.skill_id, e);
                    self.insert(Arc::new(Skill::errored(&meta.skill_id, e.to_string())));
                }
            }
        }
        info!("catalog booted with {} skills", loaded);
        Ok(loaded)
    }

    /// Validate and install an uploaded zip package as the next version of
    /// its skill. On failure after a partial object-store write, the partial
    /// version is orphaned and the in-memory map is unchanged.
    pub async fn publish(&self, bytes: Vec<u8>) -> Result<PublishReceipt, CatalogError> {
        // Stash the raw archive in the scratch area; losing it is not fatal.
        if let Err(e) = self.objects.stash_upload(&bytes) {
            warn!("failed to stash upload: {}", e);
        }

        let (scratch, package_root) = unpack_archive(bytes).await?;
        let skill = self.load_blocking(package_root.clone()).await?;
        let skill_id = skill.id.clone();

        let id_lock = self.lock_id(&skill_id);
        let _guard = id_lock.lock().await;

        let meta = self.metadata.get(&skill_id)?;
        let stored = self.objects.list_versions(&skill_id)?;
        let mut next = stored
            .iter()
            .copied()
            .chain(meta.iter().flat_map(|m| m.version_numbers()))
            .max()
            .unwrap_or(0)
            + 1;

        // Claim a version directory; a concurrent publisher on another
        // instance may win the race for this number.
        let object_key = loop {
            let objects = Arc::clone(&self.objects);
            let id = skill_id.clone();
            let src = package_root.clone();
            let result = tokio::task::spawn_blocking(move || objects.put_version(&id, next, &src))
                .await
                .expect("put_version task panicked");
            match result {
                Ok(key) => break key,
                Err(ObjectStoreError::VersionExists(_, _)) => next += 1,
                Err(e) => return Err(e.into()),
            }
        };

        let now = Utc::now();
        // Re-read the row and merge with the object listing so concurrent
        // publishers on other instances converge on the full version list.
        let known = self
            .metadata
            .get(&skill_id)?
            .map(|m| m.all_versions)
            .or(meta.map(|m| m.all_versions))
            .unwrap_or_default();
        let mut all_versions: Vec<VersionEntry> = self
            .objects
            .list_versions(&skill_id)?
            .into_iter()
            .map(|v| {
                known
                    .iter()
                    .find(|e| e.version == v)
                    .copied()
                    .unwrap_or(VersionEntry {
                        version: v,
                        published_at: now,
                    })
            })
            .collect();
        if !all_versions.iter().any(|e| e.version == next) {
            all_versions.push(VersionEntry {
                version: next,
                published_at: now,
            });
        }
        all_versions.sort_by_key(|e| e.version);

        self.metadata.put(&SkillMeta {
            skill_id: skill_id.clone(),
            name: skill.manifest.name.clone(),
            description: skill.manifest.description.clone(),
            version: next,
            status: SkillStatus::Active,
            object_key,
            manifest_json: serde_json::to_string(&skill.manifest)
                .map_err(|e| CatalogError::Storage(e.into()))?,
            author: skill.manifest.metadata.author.clone(),
            tags: skill.manifest.metadata.tags.clone(),
            all_versions,
            invocation_count: 0,
            last_invoked_at: None,
            created_at: now,
            updated_at: now,
        })?;

        // latest.json is the commit point; only after it lands does the
        // in-memory map flip.
        self.objects.commit_latest(&skill_id, next, now)?;

        let meta = self
            .metadata
            .get(&skill_id)?
            .ok_or_else(|| CatalogError::UnknownSkill(skill_id.clone()))?;
        let skill = self.materialize(&meta).await?;
        self.insert(skill);

        drop(scratch);

        info!("published skill {} v{}", skill_id, next);
        Ok(PublishReceipt {
            id: skill_id,
            version: next,
        })
    }

    /// Switch the active version back to `target_version`. The rolled-back
    /// version is not a new version; the next publish continues the sequence.
    pub async fn rollback(&self, skill_id: &str, target_version: u32) -> Result<(), CatalogError> {
        let id_lock = self.lock_id(skill_id);
        let _guard = id_lock.lock().await;

        let mut meta = self
            .metadata
            .get(skill_id)?
            .ok_or_else(|| CatalogError::UnknownSkill(skill_id.to_string()))?;
        if !meta.version_numbers().contains(&target_version) {
            return Err(CatalogError::UnknownVersion(
                skill_id.to_string(),
                target_version,
            ));
        }

        meta.version = target_version;
        meta.status = SkillStatus::Active;
        meta.updated_at = Utc::now();

        let skill = self.materialize(&meta).await?;
        self.metadata.put(&meta)?;
        self.insert(skill);

        info!("rolled back skill {} to v{}", skill_id, target_version);
        Ok(())
    }

    /// Re-read the currently active version from the object store and replace
    /// the in-memory entry.
    pub async fn reload(&self, skill_id: &str) -> Result<Arc<Skill>, CatalogError> {
        let id_lock = self.lock_id(skill_id);
        let _guard = id_lock.lock().await;

        let meta = self
            .metadata
            .get(skill_id)?
            .ok_or_else(|| CatalogError::UnknownSkill(skill_id.to_string()))?;
        let skill = self.materialize(&meta).await?;
        self.insert(Arc::clone(&skill));
        Ok(skill)
    }

    /// Remove a skill from the in-memory map and mark it inactive. Object
    /// store data stays intact.
    pub async fn unload(&self, skill_id: &str) -> Result<(), CatalogError> {
        let id_lock = self.lock_id(skill_id);
        let _guard = id_lock.lock().await;

        let removed = self.skills.write().unwrap().remove(skill_id).is_some();
        let marked = self.metadata.set_status(skill_id, SkillStatus::Inactive);
        if !removed && marked.is_err() {
            return Err(CatalogError::UnknownSkill(skill_id.to_string()));
        }

        info!("unloaded skill {}", skill_id);
        Ok(())
    }

    /// Re-read every active skill from storage, picking up peer changes
    /// first. Returns the number of skills reloaded.
    pub async fn reload_all(&self) -> Result<usize, CatalogError> {
        self.refresh().await?;
        let ids: Vec<String> = self.list_active().iter().map(|s| s.id.clone()).collect();
        let mut reloaded = 0;
        for id in ids {
            match self.reload(&id).await {
                Ok(_) => reloaded += 1,
                Err(e) => warn!("reload-all failed for skill {}: {}", id, e),
            }
        }
        Ok(reloaded)
    }

    /// Pull-based synchronization with peers: re-read the active list and
    /// load any new or changed versions, dropping entries that are no longer
    /// active. Returns the number of entries that changed.
    pub async fn refresh(&self) -> Result<usize, CatalogError> {
        let metas = self.metadata.list(Some(SkillStatus::Active))?;
        let mut changed = 0;

        for meta in &metas {
            let current = self.get(&meta.skill_id);
            let up_to_date = current
                .as_ref()
                .map(|s| s.is_active() && s.version == meta.version)
                .unwrap_or(false);
            if up_to_date {
                continue;
            }

            let id_lock = self.lock_id(&meta.skill_id);
            let _guard = id_lock.lock().await;
            match self.materialize(meta).await {
                Ok(skill) => {
                    self.insert(skill);
                    changed += 1;
                }
                Err(e) => {
                    warn!("refresh failed for skill {}: {}", meta.skill_id, e);
                }
            }
        }

        let active_ids: Vec<String> = metas.into_iter().map(|m| m.skill_id).collect();
        let stale: Vec<String> = {
            let skills = self.skills.read().unwrap();
            skills
                .values()
                .filter(|s| s.is_active() && !active_ids.contains(&s.id))
                .map(|s| s.id.clone())
                .collect()
        };
        for id in stale {
            self.skills.write().unwrap().remove(&id);
            changed += 1;
        }

        Ok(changed)
    }

    /// Bump the in-memory counters on the live entry.
    pub fn record_invocation(&self, skill_id: &str) {
        if let Some(skill) = self.get(skill_id) {
            skill.record_invocation();
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Fetch a skill's active version into the local cache and load it.
    async fn materialize(&self, meta: &SkillMeta) -> Result<Arc<Skill>, CatalogError> {
        let cache = self.cache_dir.join(&meta.skill_id);
        {
            let objects = Arc::clone(&self.objects);
            let id = meta.skill_id.clone();
            let version = meta.version;
            let dest = cache.clone();
            tokio::task::spawn_blocking(move || objects.fetch_version(&id, version, &dest))
                .await
                .expect("fetch_version task panicked")?;
        }

        let skill = self.load_blocking(cache).await?;
        let mut skill = Arc::into_inner(skill).expect("freshly loaded skill is unshared");
        skill.version = meta.version;
        skill.seed_counters(meta.invocation_count, meta.last_invoked_at);
        Ok(Arc::new(skill))
    }

    async fn load_blocking(&self, dir: PathBuf) -> Result<Arc<Skill>, CatalogError> {
        let loader = self.loader.clone();
        let skill = tokio::task::spawn_blocking(move || loader.load_dir(&dir))
            .await
            .expect("load task panicked")?;
        Ok(Arc::new(skill))
    }

    fn insert(&self, skill: Arc<Skill>) {
        self.skills
            .write()
            .unwrap()
            .insert(skill.id.clone(), skill);
    }

    fn lock_id(&self, skill_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.id_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(skill_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}

/// Unpack an uploaded zip archive into a scratch directory, returning the
/// package root (the archive root, or its single top-level directory).
async fn unpack_archive(bytes: Vec<u8>) -> Result<(tempfile::TempDir, PathBuf), CatalogError> {
    tokio::task::spawn_blocking(move || {
        let scratch = tempfile::tempdir().map_err(|e| CatalogError::Archive(e.to_string()))?;
        let extracted = scratch.path().join("extracted");
        std::fs::create_dir_all(&extracted).map_err(LoadError::Io)?;

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| CatalogError::Archive(e.to_string()))?;

        let mut total: u64 = 0;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| CatalogError::Archive(e.to_string()))?;
            let Some(rel) = entry.enclosed_name() else {
                return Err(CatalogError::Archive(format!(
                    "unsafe path in archive: {}",
                    entry.name()
                )));
            };
            let dest = extracted.join(rel);
            if entry.is_dir() {
                std::fs::create_dir_all(&dest).map_err(LoadError::Io)?;
                continue;
            }

            total += entry.size();
            if total > MAX_PACKAGE_BYTES {
                return Err(CatalogError::Rejected(LoadError::PackageTooLarge(total)));
            }

            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(LoadError::Io)?;
            }
            let mut content = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut content)
                .map_err(|e| CatalogError::Archive(e.to_string()))?;
            std::fs::write(&dest, content).map_err(LoadError::Io)?;
        }

        let root = resolve_package_root(&extracted).map_err(LoadError::Io)?;
        Ok((scratch, root))
    })
    .await
    .expect("unpack task panicked")
}

/// Uploads commonly wrap the skill in one top-level directory; unwrap it when
/// SKILL.md is not at the archive root.
fn resolve_package_root(extracted: &Path) -> std::io::Result<PathBuf> {
    if extracted.join(SKILL_MD_FILENAME).is_file() {
        return Ok(extracted.to_path_buf());
    }
    let mut dirs = Vec::new();
    let mut has_files = false;
    for entry in std::fs::read_dir(extracted)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        } else {
            has_files = true;
        }
    }
    if !has_files && dirs.len() == 1 {
        return Ok(dirs.remove(0));
    }
    Ok(extracted.to_path_buf())
}

/// Validate an uploaded archive without installing it. Returns the list of
/// problems found; empty means valid.
pub async fn validate_archive(bytes: Vec<u8>) -> Result<Vec<String>, CatalogError> {
    let (scratch, package_root) = match unpack_archive(bytes).await {
        Ok(unpacked) => unpacked,
        Err(CatalogError::Archive(msg)) => return Ok(vec![msg]),
        Err(CatalogError::Rejected(e)) => return Ok(vec![e.to_string()]),
        Err(e) => return Err(e),
    };
    let errors = tokio::task::spawn_blocking(move || {
        let errors = SkillLoader::new().validate_dir(&package_root);
        drop(scratch);
        errors
    })
    .await
    .expect("validate task panicked");
    Ok(errors)
}
