//! Application configuration.
//!
//! CLI flags cover the handful of options an operator types by hand; the
//! rest comes from environment variables, every one optional with a default.
//! Environment values override CLI values where both exist.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;

use crate::server::RequestsLoggingLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// Everything under the instance's own data directory.
    Local,
    /// Object bucket and database on shared storage, for replicated
    /// deployments.
    Remote,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Local => "local",
            StorageBackend::Remote => "remote",
        }
    }
}

/// CLI arguments that participate in config resolution.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub logging_level: RequestsLoggingLevel,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            data_dir: PathBuf::from("./data"),
            logging_level: RequestsLoggingLevel::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub logging_level: RequestsLoggingLevel,

    pub storage_backend: StorageBackend,
    pub skill_cache_dir: PathBuf,
    pub object_store_bucket: PathBuf,
    pub object_store_prefix: String,
    pub metadata_table: String,
    pub invocation_log_table: String,
    pub invocation_log_ttl_days: i64,

    pub session_idle: Duration,
    pub session_expiry: Duration,
    pub catalog_refresh: Duration,
    pub tool_call_timeout: Duration,

    pub admin_auth_token: Option<String>,
    pub allow_empty_catalog: bool,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and the process environment.
    pub fn resolve(cli: &CliConfig) -> Result<Self> {
        Self::resolve_from(cli, &|key| std::env::var(key).ok())
    }

    /// Resolution against an explicit environment lookup, so tests do not
    /// have to mutate the process environment.
    pub fn resolve_from(cli: &CliConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let storage_backend = match env("STORAGE_BACKEND").as_deref() {
            None | Some("local") => StorageBackend::Local,
            Some("remote") => StorageBackend::Remote,
            Some(other) => bail!("STORAGE_BACKEND must be `local` or `remote`, got {other:?}"),
        };

        let object_store_bucket = match env("OBJECT_STORE_BUCKET") {
            Some(path) => PathBuf::from(path),
            None => {
                if storage_backend == StorageBackend::Remote {
                    bail!("STORAGE_BACKEND=remote requires OBJECT_STORE_BUCKET");
                }
                cli.data_dir.join("objects")
            }
        };

        let skill_cache_dir = env("SKILL_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| cli.data_dir.join("skill-cache"));

        Ok(Self {
            port: parse_env(env, "PORT")?.unwrap_or(cli.port),
            data_dir: cli.data_dir.clone(),
            logging_level: cli.logging_level.clone(),
            storage_backend,
            skill_cache_dir,
            object_store_bucket,
            object_store_prefix: env("OBJECT_STORE_PREFIX")
                .unwrap_or_else(|| "skills/".to_string()),
            metadata_table: env("METADATA_TABLE").unwrap_or_else(|| "skills".to_string()),
            invocation_log_table: env("INVOCATION_LOG_TABLE")
                .unwrap_or_else(|| "invocation_logs".to_string()),
            invocation_log_ttl_days: parse_env(env, "INVOCATION_LOG_TTL_DAYS")?.unwrap_or(30),
            session_idle: Duration::from_secs(
                parse_env::<u64>(env, "SESSION_IDLE_MINUTES")?.unwrap_or(15) * 60,
            ),
            session_expiry: Duration::from_secs(
                parse_env::<u64>(env, "SESSION_EXPIRY_HOURS")?.unwrap_or(24) * 3600,
            ),
            catalog_refresh: Duration::from_secs(
                parse_env(env, "CATALOG_REFRESH_SECONDS")?.unwrap_or(60),
            ),
            tool_call_timeout: Duration::from_secs(
                parse_env(env, "TOOL_CALL_TIMEOUT_SECONDS")?.unwrap_or(30),
            ),
            admin_auth_token: env("ADMIN_AUTH_TOKEN").filter(|t| !t.is_empty()),
            allow_empty_catalog: parse_env(env, "ALLOW_EMPTY_CATALOG")?.unwrap_or(false),
        })
    }

    /// Single SQLite file hosting the metadata and invocation log tables.
    /// On the remote backend it sits beside the object bucket on shared
    /// storage, which is what the pull-based replication contract needs.
    pub fn database_path(&self) -> PathBuf {
        match self.storage_backend {
            StorageBackend::Local => self.data_dir.join("skillserve.db"),
            StorageBackend::Remote => self.object_store_bucket.join("skillserve.db"),
        }
    }

    pub fn server_name(&self) -> &'static str {
        env!("CARGO_PKG_NAME")
    }

    pub fn server_version(&self) -> String {
        format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"))
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))
            .context("config resolution failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cli = CliConfig::default();
        let config = AppConfig::resolve_from(&cli, &env_of(&[])).unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.storage_backend, StorageBackend::Local);
        assert_eq!(config.object_store_prefix, "skills/");
        assert_eq!(config.metadata_table, "skills");
        assert_eq!(config.invocation_log_table, "invocation_logs");
        assert_eq!(config.invocation_log_ttl_days, 30);
        assert_eq!(config.session_idle, Duration::from_secs(15 * 60));
        assert_eq!(config.session_expiry, Duration::from_secs(24 * 3600));
        assert_eq!(config.catalog_refresh, Duration::from_secs(60));
        assert_eq!(config.tool_call_timeout, Duration::from_secs(30));
        assert!(config.admin_auth_token.is_none());
        assert!(!config.allow_empty_catalog);
        assert_eq!(config.object_store_bucket, cli.data_dir.join("objects"));
        assert_eq!(config.skill_cache_dir, cli.data_dir.join("skill-cache"));
        assert_eq!(config.database_path(), cli.data_dir.join("skillserve.db"));
    }

    #[test]
    fn test_env_overrides() {
        let cli = CliConfig::default();
        let env = env_of(&[
            ("PORT", "9000"),
            ("SESSION_IDLE_MINUTES", "1"),
            ("CATALOG_REFRESH_SECONDS", "5"),
            ("ADMIN_AUTH_TOKEN", "sekrit"),
            ("ALLOW_EMPTY_CATALOG", "true"),
        ]);
        let config = AppConfig::resolve_from(&cli, &env).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.session_idle, Duration::from_secs(60));
        assert_eq!(config.catalog_refresh, Duration::from_secs(5));
        assert_eq!(config.admin_auth_token.as_deref(), Some("sekrit"));
        assert!(config.allow_empty_catalog);
    }

    #[test]
    fn test_remote_requires_bucket() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve_from(&cli, &env_of(&[("STORAGE_BACKEND", "remote")]));
        assert!(result.is_err());

        let env = env_of(&[
            ("STORAGE_BACKEND", "remote"),
            ("OBJECT_STORE_BUCKET", "/mnt/shared/skills"),
        ]);
        let config = AppConfig::resolve_from(&cli, &env).unwrap();
        assert_eq!(config.storage_backend, StorageBackend::Remote);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/mnt/shared/skills/skillserve.db")
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cli = CliConfig::default();
        assert!(
            AppConfig::resolve_from(&cli, &env_of(&[("STORAGE_BACKEND", "s3")])).is_err()
        );
        assert!(AppConfig::resolve_from(&cli, &env_of(&[("PORT", "not-a-port")])).is_err());
        assert!(
            AppConfig::resolve_from(&cli, &env_of(&[("SESSION_IDLE_MINUTES", "soon")])).is_err()
        );
    }

    #[test]
    fn test_empty_admin_token_means_open() {
        let cli = CliConfig::default();
        let config =
            AppConfig::resolve_from(&cli, &env_of(&[("ADMIN_AUTH_TOKEN", "")])).unwrap();
        assert!(config.admin_auth_token.is_none());
    }
}
