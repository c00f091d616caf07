//! Skillserve Library
//!
//! This library exposes the internal modules for testing and potential reuse.

pub mod catalog;
pub mod config;
pub mod mcp;
pub mod server;
pub mod skill;
pub mod storage;

// Re-export commonly used types for convenience
pub use catalog::{CatalogError, SkillCatalog};
pub use config::{AppConfig, CliConfig, StorageBackend};
pub use mcp::{McpEngine, SessionRegistry};
pub use server::{bootstrap, make_app, run_server, RequestsLoggingLevel, MCP_SESSION_HEADER};
pub use skill::{Skill, SkillLoader, SkillStatus};
pub use storage::{FsObjectStore, SqliteInvocationStore, SqliteMetadataStore};
