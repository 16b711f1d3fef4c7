//! Configuration loader and validator for the publisher.
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::mapping::{MappingEntry, MicroschemaDef};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub repositories: Vec<RepositoryConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_render_workers")]
    pub render_workers: usize,
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_migration_poll_interval_ms")]
    pub migration_poll_interval_ms: u64,
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    #[serde(default = "default_transient_retry_delay_ms")]
    pub transient_retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub journal: bool,
}

fn default_render_workers() -> usize {
    4
}
fn default_write_queue_capacity() -> usize {
    100
}
fn default_lock_timeout_ms() -> u64 {
    60_000
}
fn default_migration_poll_interval_ms() -> u64 {
    1_000
}
fn default_transient_retries() -> u32 {
    3
}
fn default_transient_retry_delay_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn migration_poll_interval(&self) -> Duration {
        Duration::from_millis(self.migration_poll_interval_ms)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transient_retry_delay_ms)
    }
}

/// What to do with projects that only make sense under the other
/// project-per-site setting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlternativeProjects {
    Ignore,
    Delete,
    #[default]
    Scrub,
}

/// One target system endpoint and its content mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub schema_prefix: String,
    #[serde(default)]
    pub project_per_site: bool,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub implementation_version: Option<String>,
    #[serde(default)]
    pub permission_property: Option<String>,
    #[serde(default)]
    pub atomic_permissions: bool,
    #[serde(default)]
    pub alternative_projects: AlternativeProjects,
    #[serde(default)]
    pub write_back_roles: bool,
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
    #[serde(default)]
    pub microschemas: Vec<MicroschemaDef>,
}

impl RepositoryConfig {
    pub fn schema_name(&self, object_type: crate::model::ObjectType) -> String {
        format!("{}_{}", self.schema_prefix, object_type.schema_suffix())
    }

    pub fn microschema_name(&self, keyword: &str) -> String {
        format!("{}_{}", self.schema_prefix, keyword)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.render_workers == 0 {
        return Err(ConfigError::Invalid("app.render_workers must be > 0"));
    }
    if cfg.app.write_queue_capacity == 0 {
        return Err(ConfigError::Invalid("app.write_queue_capacity must be > 0"));
    }
    if cfg.app.migration_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.migration_poll_interval_ms must be > 0"));
    }
    if cfg.app.lock_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.lock_timeout_ms must be > 0"));
    }

    if cfg.repositories.is_empty() {
        return Err(ConfigError::Invalid("repositories must not be empty"));
    }
    let mut names = BTreeSet::new();
    for repo in &cfg.repositories {
        if repo.name.trim().is_empty() {
            return Err(ConfigError::Invalid("repositories[].name must be non-empty"));
        }
        if !names.insert(repo.name.as_str()) {
            return Err(ConfigError::Invalid("repositories[].name must be unique"));
        }
        if repo.url.trim().is_empty() {
            return Err(ConfigError::Invalid("repositories[].url must be non-empty"));
        }
        if repo.schema_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "repositories[].schema_prefix must be non-empty",
            ));
        }
        if !repo.project_per_site
            && repo
                .project_name
                .as_deref()
                .map_or(true, |n| n.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "repositories[].project_name is required unless project_per_site is set",
            ));
        }
        if repo
            .implementation_version
            .as_deref()
            .is_some_and(|v| v.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "repositories[].implementation_version must be non-empty when set",
            ));
        }
        if repo.mappings.iter().any(|m| m.field.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "repositories[].mappings[].field must be non-empty",
            ));
        }
        if repo
            .microschemas
            .iter()
            .any(|m| m.keyword.trim().is_empty() || m.global_id.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "repositories[].microschemas[] need keyword and global_id",
            ));
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  render_workers: 4
  write_queue_capacity: 100
  lock_timeout_ms: 60000
  migration_poll_interval_ms: 1000
  transient_retries: 3
  transient_retry_delay_ms: 500

repositories:
  - name: "mesh"
    url: "http://localhost:8080/api/v2/"
    token: "YOUR_MESH_API_TOKEN"
    schema_prefix: "cms"
    project_per_site: true
    implementation_version: "1.0"
    permission_property: "roles"
    alternative_projects: scrub
    mappings:
      - { object_type: folder, field: "name", source: "folder.name", kind: text, display_field: true }
      - { object_type: folder, field: "pub_dir_segment", source: "folder.pub_dir", kind: text, segment_field: true }
      - { object_type: folder, field: "roles", source: "object.roles", kind: text, multivalue: true }
      - { object_type: page, field: "name", source: "page.name", kind: text, display_field: true }
      - { object_type: page, field: "filename", source: "page.filename", kind: text, segment_field: true }
      - { object_type: page, field: "content", source: "page.tags.content", kind: html }
      - { object_type: page, field: "teaser", source: "page.tags.teaser", kind: micronode }
      - { object_type: page, field: "link", source: "page.object.link", kind: link }
      - { object_type: page, field: "related", source: "page.object.related", kind: overview }
      - { object_type: page, field: "roles", source: "object.roles", kind: text, multivalue: true }
      - { object_type: file, field: "name", source: "file.name", kind: text, display_field: true }
      - { object_type: file, field: "filename", source: "file.name", kind: text, segment_field: true }
      - { object_type: file, field: "binarycontent", source: "file.binarycontent", kind: binary }
      - { object_type: file, field: "roles", source: "object.roles", kind: text, multivalue: true }
      - { object_type: form, field: "name", source: "form.name", kind: text, display_field: true }
      - { object_type: form, field: "url", source: "form.url", kind: text, url_field: true }
      - { object_type: form, field: "roles", source: "object.roles", kind: text, multivalue: true }
    microschemas:
      - keyword: "teaser"
        global_id: "A547.5001"
        parts:
          - { keyword: "headline", kind: text }
          - { keyword: "image", kind: node }
"#
}
