//! Storage backends: versioned object storage, skill metadata and the
//! invocation log. All stores sit behind traits so deployments can swap the
//! bundled filesystem/SQLite implementations for managed services.

pub mod invocation_log;
pub mod metadata_store;
pub mod object_store;

pub use invocation_log::{
    InvocationEvent, InvocationLog, InvocationStatus, InvocationStore, SqliteInvocationStore,
    DEFAULT_QUEUE_CAPACITY,
};
pub use metadata_store::{
    increment_invocation_with_retry, MetadataStore, SkillMeta, SqliteMetadataStore, VersionEntry,
};
pub use object_store::{FsObjectStore, LatestPointer, ObjectStore, ObjectStoreError};
