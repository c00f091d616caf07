//! Skill data model.
//!
//! A skill is an immutable-per-version bundle of a parsed SKILL.md manifest,
//! its Markdown instructions, and the categorized files shipped alongside it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Skill ids must match `^[a-z][a-z0-9-]{2,49}$`.
pub fn validate_skill_id(id: &str) -> Result<(), String> {
    let len = id.chars().count();
    if !(3..=50).contains(&len) {
        return Err(format!(
            "skill id must be 3 to 50 characters, got {} ({:?})",
            len, id
        ));
    }
    let mut chars = id.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_lowercase() {
        return Err("skill id must start with a lowercase letter".to_string());
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(format!(
            "skill id may only contain lowercase letters, digits and hyphens, found {:?}",
            bad
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillStatus {
    Draft,
    Active,
    Inactive,
    Error,
}

impl SkillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillStatus::Draft => "draft",
            SkillStatus::Active => "active",
            SkillStatus::Inactive => "inactive",
            SkillStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(SkillStatus::Draft),
            "active" => Some(SkillStatus::Active),
            "inactive" => Some(SkillStatus::Inactive),
            "error" => Some(SkillStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SkillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional `metadata:` block of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub author: Option<String>,
    /// Display version from the manifest, unrelated to the storage version.
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Parsed SKILL.md front matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    pub description: String,
    pub license: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_true")]
    pub user_invocable: bool,
    pub model: Option<String>,
    pub context: Option<String>,
    #[serde(default)]
    pub metadata: SkillMetadata,
}

fn default_true() -> bool {
    true
}

/// A file shipped inside a skill package, relative to the package root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

/// Categorized package contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillFiles {
    pub scripts: Vec<FileEntry>,
    pub references: Vec<FileEntry>,
    pub assets: Vec<FileEntry>,
}

impl SkillFiles {
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty() && self.references.is_empty() && self.assets.is_empty()
    }
}

/// A loaded skill.
///
/// Owned exclusively by the catalog and shared with request handlers as
/// `Arc<Skill>`; the invocation counters are the only mutable state.
#[derive(Debug)]
pub struct Skill {
    pub id: String,
    /// Storage version, rendered as `v{n}`. Zero until the catalog assigns it.
    pub version: u32,
    pub manifest: SkillManifest,
    pub instructions: String,
    pub files: SkillFiles,
    pub status: SkillStatus,
    pub load_error: Option<String>,
    /// Local cache directory the skill was materialized from.
    pub source_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    invocation_count: AtomicU64,
    last_invoked_at: RwLock<Option<DateTime<Utc>>>,
}

impl Skill {
    pub fn new(
        manifest: SkillManifest,
        instructions: String,
        files: SkillFiles,
        source_path: Option<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: manifest.name.clone(),
            version: 0,
            manifest,
            instructions,
            files,
            status: SkillStatus::Active,
            load_error: None,
            source_path,
            created_at: now,
            updated_at: now,
            invocation_count: AtomicU64::new(0),
            last_invoked_at: RwLock::new(None),
        }
    }

    /// Placeholder for a skill that failed to load; kept in the catalog so the
    /// admin surface can report the failure.
    pub fn errored(id: impl Into<String>, reason: impl Into<String>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            id: id.clone(),
            version: 0,
            manifest: SkillManifest {
                name: id,
                description: String::new(),
                license: None,
                allowed_tools: Vec::new(),
                user_invocable: false,
                model: None,
                context: None,
                metadata: SkillMetadata::default(),
            },
            instructions: String::new(),
            files: SkillFiles::default(),
            status: SkillStatus::Error,
            load_error: Some(reason.into()),
            source_path: None,
            created_at: now,
            updated_at: now,
            invocation_count: AtomicU64::new(0),
            last_invoked_at: RwLock::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SkillStatus::Active
    }

    pub fn is_user_invocable(&self) -> bool {
        self.is_active() && self.manifest.user_invocable
    }

    pub fn record_invocation(&self) {
        self.invocation_count.fetch_add(1, Ordering::Relaxed);
        *self.last_invoked_at.write().unwrap() = Some(Utc::now());
    }

    pub fn seed_counters(&self, count: u64, last_invoked_at: Option<DateTime<Utc>>) {
        self.invocation_count.store(count, Ordering::Relaxed);
        *self.last_invoked_at.write().unwrap() = last_invoked_at;
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocation_count.load(Ordering::Relaxed)
    }

    pub fn last_invoked_at(&self) -> Option<DateTime<Utc>> {
        *self.last_invoked_at.read().unwrap()
    }

    /// Structural equality: same bytes loaded twice must compare equal.
    /// Runtime counters and timestamps are excluded.
    pub fn same_structure(&self, other: &Skill) -> bool {
        self.id == other.id
            && self.manifest == other.manifest
            && self.instructions == other.instructions
            && self.files == other.files
            && self.status == other.status
    }
}
