use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};

pub const DEFAULT_PORT: u16 = 8788;
pub const DEFAULT_MAX_LIMIT: u32 = 10_000;

const ENV_PREFIX: &str = "AUDITDBX";

/// Top-level service configuration, loaded from a TOML file with
/// per-key environment overrides (`AUDITDBX_IDENTITY_AUTH_URL` etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            identity: IdentityConfig::default(),
            storage: StorageConfig::default(),
            service: ServiceConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

/// Service-account credentials and endpoint for the identity provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub user_domain_name: String,
    #[serde(default)]
    pub project_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub index: String,
    /// Largest `offset + limit` the backend will accept for a page.
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            index: String::new(),
            max_limit: default_max_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Fill `*_name` fields on returned events from the identity provider.
    #[serde(default)]
    pub enrich_identity_events: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub file: Option<PathBuf>,
}

pub fn default_config_path() -> PathBuf {
    let base = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    base.join(".auditdbx").join("config.toml")
}

/// Loads the configuration file (or defaults when it does not exist) and
/// applies environment overrides on top.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

    let mut config = if config_path.exists() {
        let contents = fs::read_to_string(&config_path)
            .map_err(|err| AuditError::Config(format!("cannot read {}: {err}", config_path.display())))?;
        toml::from_str(&contents)
            .map_err(|err| AuditError::Config(format!("cannot parse {}: {err}", config_path.display())))?
    } else if path.is_some() {
        return Err(AuditError::Config(format!(
            "configuration file {} does not exist",
            config_path.display()
        )));
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config)?;
    Ok(config)
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| AuditError::Config(format!("cannot create {}: {err}", parent.display())))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|err| AuditError::Serialization(err.to_string()))?;
        fs::write(path, contents)
            .map_err(|err| AuditError::Config(format!("cannot write {}: {err}", path.display())))?;
        Ok(())
    }

    /// Checks the keys the server cannot run without.
    pub fn validate_for_serve(&self) -> Result<()> {
        if self.identity.auth_url.trim().is_empty() {
            return Err(AuditError::Config("identity.auth_url is not set".into()));
        }
        if self.identity.username.trim().is_empty() {
            return Err(AuditError::Config("identity.username is not set".into()));
        }
        if self.storage.url.trim().is_empty() {
            return Err(AuditError::Config("storage.url is not set".into()));
        }
        if self.storage.index.trim().is_empty() {
            return Err(AuditError::Config("storage.index is not set".into()));
        }
        if self.storage.max_limit == 0 {
            return Err(AuditError::Config("storage.max_limit must be positive".into()));
        }
        Ok(())
    }
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(value) = env_value("PORT") {
        config.port = value
            .parse()
            .map_err(|_| AuditError::Config(format!("invalid {ENV_PREFIX}_PORT '{value}'")))?;
    }

    override_string(&mut config.identity.auth_url, "IDENTITY_AUTH_URL");
    override_string(&mut config.identity.username, "IDENTITY_USERNAME");
    override_string(&mut config.identity.password, "IDENTITY_PASSWORD");
    override_string(&mut config.identity.user_domain_name, "IDENTITY_USER_DOMAIN_NAME");
    override_string(&mut config.identity.project_name, "IDENTITY_PROJECT_NAME");
    override_string(&mut config.storage.url, "STORAGE_URL");
    override_string(&mut config.storage.index, "STORAGE_INDEX");

    if let Some(value) = env_value("STORAGE_MAX_LIMIT") {
        config.storage.max_limit = value
            .parse()
            .map_err(|_| AuditError::Config(format!("invalid {ENV_PREFIX}_STORAGE_MAX_LIMIT '{value}'")))?;
    }
    if let Some(value) = env_value("SERVICE_ENRICH_IDENTITY_EVENTS") {
        config.service.enrich_identity_events = parse_bool(&value).ok_or_else(|| {
            AuditError::Config(format!(
                "invalid {ENV_PREFIX}_SERVICE_ENRICH_IDENTITY_EVENTS '{value}'"
            ))
        })?;
    }
    if let Some(value) = env_value("POLICY_FILE") {
        config.policy.file = Some(PathBuf::from(value));
    }

    Ok(())
}

fn env_value(suffix: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{suffix}")).ok().filter(|v| !v.is_empty())
}

fn override_string(target: &mut String, suffix: &str) {
    if let Some(value) = env_value(suffix) {
        *target = value;
    }
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_limit() -> u32 {
    DEFAULT_MAX_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_defaults_when_no_file_exists() {
        let config = load(None).expect("defaults load");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.storage.max_limit, DEFAULT_MAX_LIMIT);
        assert!(!config.service.enrich_identity_events);
    }

    #[test]
    fn round_trips_through_toml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.port = 9091;
        config.identity.auth_url = "https://identity.example.com".into();
        config.storage.url = "https://search.example.com:9200".into();
        config.storage.index = "audit-events".into();
        config.service.enrich_identity_events = true;
        config.save(&path).expect("save succeeds");

        let loaded = load(Some(&path)).expect("load succeeds");
        assert_eq!(loaded.port, 9091);
        assert_eq!(loaded.identity.auth_url, "https://identity.example.com");
        assert_eq!(loaded.storage.index, "audit-events");
        assert!(loaded.service.enrich_identity_events);
    }

    #[test]
    fn missing_explicit_file_is_a_config_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nope.toml");
        assert!(matches!(load(Some(&path)), Err(AuditError::Config(_))));
    }

    #[test]
    fn validate_rejects_missing_required_keys() {
        let config = Config::default();
        assert!(config.validate_for_serve().is_err());

        let mut config = Config::default();
        config.identity.auth_url = "https://identity.example.com".into();
        config.identity.username = "auditor".into();
        config.storage.url = "https://search.example.com:9200".into();
        config.storage.index = "audit-events".into();
        assert!(config.validate_for_serve().is_ok());
    }
}
