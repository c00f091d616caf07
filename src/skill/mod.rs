//! Skill domain: manifest model, front matter parsing and package loading.

pub mod frontmatter;
pub mod loader;
pub mod model;

pub use loader::{LoadError, SkillLoader, SKILL_MD_FILENAME};
pub use model::{
    validate_skill_id, FileEntry, Skill, SkillFiles, SkillManifest, SkillMetadata, SkillStatus,
};
