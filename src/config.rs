//! Configuration file loading.
//!
//! The launcher reads a single TOML file describing the server, the database,
//! the host credentials, the command trigger and every tracked repository.
//! All per-repository knobs (reviewers, builders, branch names, CI provider
//! secrets) live here; nothing is fetched from the host at startup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::types::RepoLabel;

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config declares no repositories")]
    NoRepositories,

    #[error("repository {label}: required builder list is empty")]
    NoBuilders { label: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    pub db: DbConfig,

    pub github: GithubConfig,

    #[serde(default)]
    pub bot: BotConfig,

    /// Tracked repositories keyed by label.
    pub repo: HashMap<String, RepoConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 54856))
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    /// Personal access token used for every host API call.
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Command trigger without the `@` prefix (e.g. `"homu"`).
    #[serde(default = "default_trigger")]
    pub trigger: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        BotConfig {
            trigger: default_trigger(),
        }
    }
}

fn default_trigger() -> String {
    "homu".to_string()
}

/// Per-repository configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    pub owner: String,
    pub name: String,

    /// Identities allowed to issue approval/priority commands.
    pub reviewers: Vec<String>,

    /// Identities allowed to issue `force` and `delegate`.
    #[serde(default)]
    pub admins: Vec<String>,

    /// Builder names whose success is required for a merge.
    pub builders: Vec<String>,

    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,

    #[serde(default = "default_protected_branch")]
    pub protected_branch: String,

    /// Maximum pull requests combined into a single rollup.
    #[serde(default = "default_rollup_cap")]
    pub rollup_cap: usize,

    /// On rollup failure, blame the first constituent (`true`) or the whole
    /// rollup (`false`).
    #[serde(default)]
    pub bisect_on_rollup: bool,

    /// Shared secret for the host's webhook HMAC.
    pub webhook_secret: String,

    #[serde(default)]
    pub buildbot: Option<SecretProvider>,

    #[serde(default)]
    pub travis: Option<TokenProvider>,

    #[serde(default)]
    pub jenkins: Option<SecretProvider>,

    #[serde(default)]
    pub solano: Option<SecretProvider>,
}

/// A CI provider authenticated by a shared secret.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretProvider {
    pub secret: String,
}

/// A CI provider authenticated by a bearer-style token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenProvider {
    pub token: String,
}

fn default_integration_branch() -> String {
    "auto".to_string()
}

fn default_protected_branch() -> String {
    "master".to_string()
}

fn default_rollup_cap() -> usize {
    8
}

impl RepoConfig {
    pub fn is_reviewer(&self, login: &str) -> bool {
        self.reviewers.iter().any(|r| r == login)
    }

    pub fn is_admin(&self, login: &str) -> bool {
        self.admins.iter().any(|a| a == login)
    }
}

impl Config {
    /// Loads and validates the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;

        if config.repo.is_empty() {
            return Err(ConfigError::NoRepositories);
        }
        for (label, repo) in &config.repo {
            if repo.builders.is_empty() {
                return Err(ConfigError::NoBuilders {
                    label: label.clone(),
                });
            }
        }

        Ok(config)
    }

    /// Looks up a repository configuration by label.
    pub fn repo(&self, label: &RepoLabel) -> Option<&RepoConfig> {
        self.repo.get(label.as_str())
    }

    /// Finds the label for a repository by its host `owner/name` pair.
    pub fn label_for(&self, owner: &str, name: &str) -> Option<RepoLabel> {
        self.repo
            .iter()
            .find(|(_, r)| r.owner == owner && r.name == name)
            .map(|(label, _)| RepoLabel::new(label.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [db]
        path = "homu.sqlite"

        [github]
        access_token = "token"

        [bot]
        trigger = "bors"

        [repo.rust]
        owner = "rust-lang"
        name = "rust"
        reviewers = ["alice", "bob"]
        admins = ["alice"]
        builders = ["linux", "mac"]
        webhook_secret = "hunter2"

        [repo.rust.buildbot]
        secret = "bb-secret"
    "#;

    #[test]
    fn parses_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.bot.trigger, "bors");
        let rust = &config.repo["rust"];
        assert_eq!(rust.owner, "rust-lang");
        assert_eq!(rust.builders, vec!["linux", "mac"]);
        assert_eq!(rust.buildbot.as_ref().unwrap().secret, "bb-secret");
        assert!(rust.travis.is_none());
    }

    #[test]
    fn defaults_applied() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let rust = &config.repo["rust"];
        assert_eq!(rust.integration_branch, "auto");
        assert_eq!(rust.protected_branch, "master");
        assert_eq!(rust.rollup_cap, 8);
        assert!(!rust.bisect_on_rollup);
        assert_eq!(config.server.listen, default_listen());
    }

    #[test]
    fn reviewer_and_admin_lookup() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let rust = &config.repo["rust"];
        assert!(rust.is_reviewer("alice"));
        assert!(rust.is_reviewer("bob"));
        assert!(!rust.is_reviewer("mallory"));
        assert!(rust.is_admin("alice"));
        assert!(!rust.is_admin("bob"));
    }

    #[test]
    fn label_lookup_by_owner_name() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(
            config.label_for("rust-lang", "rust"),
            Some(RepoLabel::new("rust"))
        );
        assert_eq!(config.label_for("rust-lang", "cargo"), None);
    }

    #[test]
    fn empty_repo_table_rejected() {
        let text = r#"
            [db]
            path = "x.sqlite"
            [github]
            access_token = "t"
            [repo]
        "#;
        assert!(matches!(
            Config::from_toml(text),
            Err(ConfigError::NoRepositories)
        ));
    }

    #[test]
    fn empty_builder_list_rejected() {
        let text = r#"
            [db]
            path = "x.sqlite"
            [github]
            access_token = "t"
            [repo.r]
            owner = "o"
            name = "n"
            reviewers = []
            builders = []
            webhook_secret = "s"
        "#;
        assert!(matches!(
            Config::from_toml(text),
            Err(ConfigError::NoBuilders { .. })
        ));
    }

    #[test]
    fn default_trigger_is_homu() {
        let text = r#"
            [db]
            path = "x.sqlite"
            [github]
            access_token = "t"
            [repo.r]
            owner = "o"
            name = "n"
            reviewers = ["a"]
            builders = ["all"]
            webhook_secret = "s"
        "#;
        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.bot.trigger, "homu");
    }
}
