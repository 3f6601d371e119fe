//! Centralized configuration for the jobwire client.
//!
//! Design constants live on unit structs; per-client settings live on
//! [`ClientOptions`]. The environment and home-directory lookups at the bottom
//! of this module are the boundary to the outside world: they only produce a
//! [`ClientOptions`] value and never touch a live session.

use crate::backoff::BackoffConfig;
use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wire and loop constants.
pub struct SessionConfig;

impl SessionConfig {
    /// Interval between dispatcher iterations (queue drain + patch flush).
    pub const FLUSH_INTERVAL: Duration = Duration::from_millis(200);
    /// Timeout (seconds) sent along with every `action` message.
    pub const ACTION_TIMEOUT_SECS: u64 = 60;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Maximum frame size accepted from the service (16MB).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// How long shutdown waits for the receive half to observe the close.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Defaults for locating the tracking service.
pub struct EndpointConfig;

impl EndpointConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8960;
    pub const HOST_VAR: &'static str = "JOBWIRE_HOST";
    pub const PORT_VAR: &'static str = "JOBWIRE_PORT";
    pub const JOB_TOKEN_VAR: &'static str = "JOBWIRE_JOB_ACCESSTOKEN";
    pub const JOB_ID_VAR: &'static str = "JOBWIRE_JOB_ID";
}

/// Home configuration file location.
pub struct PathsConfig;

impl PathsConfig {
    pub const HOME_DIR_NAME: &'static str = ".jobwire";
    pub const CONFIG_FILE_NAME: &'static str = "config.json";
}

/// Address of a tracking service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(EndpointConfig::DEFAULT_HOST, EndpointConfig::DEFAULT_PORT)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Job id plus the job-scoped access token minted for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCredentials {
    pub job_id: String,
    pub token: String,
}

impl JobCredentials {
    pub fn new(job_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            token: token.into(),
        }
    }
}

/// An account entry of the home configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub token: String,
}

fn default_host() -> String {
    EndpointConfig::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    EndpointConfig::DEFAULT_PORT
}

impl AccountConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Links a local directory to a project of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderLink {
    pub account_id: String,
    pub project_id: String,
    pub path: PathBuf,
}

/// Contents of `<home>/.jobwire/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeConfig {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub folder_links: Vec<FolderLink>,
}

impl HomeConfig {
    /// Default location of the home configuration file.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ClientError::config("Could not determine home directory"))?;
        Ok(home
            .join(PathsConfig::HOME_DIR_NAME)
            .join(PathsConfig::CONFIG_FILE_NAME))
    }

    /// Load the home configuration from its default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load the home configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClientError::config(format!(
                "Failed to read home config {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ClientError::config(format!(
                "Failed to parse home config {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn account_for_name(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }

    pub fn account_for_id(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    /// Find the folder link whose path contains `directory`.
    ///
    /// Both sides are canonicalized, so symlinked checkouts resolve to the
    /// same link. The most specific (longest) link wins.
    pub fn folder_link_for_directory(&self, directory: &Path) -> Option<&FolderLink> {
        let directory = directory.canonicalize().ok()?;
        self.folder_links
            .iter()
            .filter_map(|link| {
                let root = link.path.canonicalize().ok()?;
                directory
                    .starts_with(&root)
                    .then(|| (root.components().count(), link))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, link)| link)
    }
}

/// How a user session picks the project its job is created under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectSelector {
    /// Project id taken from a folder link.
    Linked { project_id: String },
    /// Project looked up by its public name.
    Named(String),
}

/// The identity a client is bound to for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// A pre-existing job: authenticate with its token directly.
    Job {
        endpoint: Endpoint,
        credentials: JobCredentials,
    },
    /// An account session that creates a job and then hands off to it.
    User {
        account: AccountConfig,
        project: ProjectSelector,
    },
}

impl Identity {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Identity::Job { endpoint, .. } => endpoint.clone(),
            Identity::User { account, .. } => account.endpoint(),
        }
    }
}

/// Inputs used to pick a user-mode identity when no job token is present.
#[derive(Debug, Clone, Default)]
pub struct UserSelection {
    /// Account name; when absent the directory's folder link decides.
    pub account: Option<String>,
    /// Project public name, required together with `account`.
    pub project: Option<String>,
    /// Directory the tracked program runs from.
    pub directory: PathBuf,
}

/// Per-client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub identity: Identity,
    pub flush_interval: Duration,
    pub action_timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl ClientOptions {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            flush_interval: SessionConfig::FLUSH_INTERVAL,
            action_timeout_secs: SessionConfig::ACTION_TIMEOUT_SECS,
            backoff: BackoffConfig::default(),
        }
    }

    /// Options for an existing job.
    pub fn job(endpoint: Endpoint, credentials: JobCredentials) -> Self {
        Self::new(Identity::Job {
            endpoint,
            credentials,
        })
    }

    /// Options for a user session that creates its own job.
    pub fn user(account: AccountConfig, project: ProjectSelector) -> Self {
        Self::new(Identity::User { account, project })
    }

    /// Set the dispatcher interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the timeout sent with every action.
    pub fn with_action_timeout_secs(mut self, secs: u64) -> Self {
        self.action_timeout_secs = secs;
        self
    }

    /// Set the reconnect backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build options from the process environment and the home configuration.
    pub fn from_env(selection: &UserSelection) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), selection, HomeConfig::load)
    }

    /// Build options from an arbitrary variable lookup.
    ///
    /// A job access token selects job mode (host and port fall back to the
    /// defaults). Otherwise the home configuration is loaded and the account
    /// and project come from `selection`.
    pub fn from_lookup<F, H>(lookup: F, selection: &UserSelection, home: H) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
        H: FnOnce() -> Result<HomeConfig>,
    {
        if let Some(token) = lookup(EndpointConfig::JOB_TOKEN_VAR) {
            let job_id = lookup(EndpointConfig::JOB_ID_VAR).ok_or_else(|| {
                ClientError::config(format!(
                    "{} is set but {} is missing",
                    EndpointConfig::JOB_TOKEN_VAR,
                    EndpointConfig::JOB_ID_VAR
                ))
            })?;
            let host = lookup(EndpointConfig::HOST_VAR)
                .unwrap_or_else(|| EndpointConfig::DEFAULT_HOST.to_string());
            let port = match lookup(EndpointConfig::PORT_VAR) {
                Some(raw) => raw.parse::<u16>().map_err(|_| ClientError::Validation {
                    field: EndpointConfig::PORT_VAR.to_string(),
                    message: format!("not a port number: {}", raw),
                })?,
                None => EndpointConfig::DEFAULT_PORT,
            };
            return Ok(Self::job(
                Endpoint::new(host, port),
                JobCredentials::new(job_id, token),
            ));
        }

        let home = home()?;
        let (account, project) = match &selection.account {
            Some(name) => {
                let account = home.account_for_name(name).ok_or_else(|| {
                    ClientError::config(format!("No account named {} configured", name))
                })?;
                let project = selection.project.clone().ok_or_else(|| {
                    ClientError::config(
                        "No project defined. Pass a project name to select which project to use.",
                    )
                })?;
                (account.clone(), ProjectSelector::Named(project))
            }
            None => {
                let link = home
                    .folder_link_for_directory(&selection.directory)
                    .ok_or_else(|| {
                        ClientError::config(format!(
                            "Directory {} is not linked to a project",
                            selection.directory.display()
                        ))
                    })?;
                let account = home.account_for_id(&link.account_id).ok_or_else(|| {
                    ClientError::config(format!(
                        "Folder link references unknown account {}",
                        link.account_id
                    ))
                })?;
                (
                    account.clone(),
                    ProjectSelector::Linked {
                        project_id: link.project_id.clone(),
                    },
                )
            }
        };

        Ok(Self::user(account, project))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn account(id: &str, name: &str) -> AccountConfig {
        AccountConfig {
            id: id.into(),
            name: name.into(),
            host: "tracker.local".into(),
            port: 9000,
            token: format!("{}-token", id),
        }
    }

    fn no_home() -> Result<HomeConfig> {
        Err(ClientError::config("home config must not be read"))
    }

    #[test]
    fn test_job_token_selects_job_mode() {
        let vars: HashMap<&str, &str> = [
            ("JOBWIRE_JOB_ACCESSTOKEN", "T"),
            ("JOBWIRE_JOB_ID", "J1"),
            ("JOBWIRE_PORT", "9100"),
        ]
        .into_iter()
        .collect();

        let options = ClientOptions::from_lookup(
            |k| vars.get(k).map(|v| v.to_string()),
            &UserSelection::default(),
            no_home,
        )
        .unwrap();

        assert_eq!(
            options.identity,
            Identity::Job {
                endpoint: Endpoint::new("127.0.0.1", 9100),
                credentials: JobCredentials::new("J1", "T"),
            }
        );
        assert_eq!(options.flush_interval, SessionConfig::FLUSH_INTERVAL);
    }

    #[test]
    fn test_job_token_without_id_is_config_error() {
        let result = ClientOptions::from_lookup(
            |k| (k == "JOBWIRE_JOB_ACCESSTOKEN").then(|| "T".to_string()),
            &UserSelection::default(),
            no_home,
        );
        assert!(matches!(result, Err(ClientError::Config { .. })));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let result = ClientOptions::from_lookup(
            |k| match k {
                "JOBWIRE_JOB_ACCESSTOKEN" => Some("T".into()),
                "JOBWIRE_JOB_ID" => Some("J1".into()),
                "JOBWIRE_PORT" => Some("http".into()),
                _ => None,
            },
            &UserSelection::default(),
            no_home,
        );
        assert!(matches!(result, Err(ClientError::Validation { .. })));
    }

    #[test]
    fn test_named_account_requires_project() {
        let home = HomeConfig {
            accounts: vec![account("a1", "localhost")],
            folder_links: vec![],
        };
        let selection = UserSelection {
            account: Some("localhost".into()),
            project: None,
            directory: PathBuf::from("."),
        };
        let result = ClientOptions::from_lookup(|_| None, &selection, || Ok(home));
        assert!(matches!(result, Err(ClientError::Config { .. })));
    }

    #[test]
    fn test_named_account_and_project() {
        let home = HomeConfig {
            accounts: vec![account("a1", "localhost"), account("a2", "cloud")],
            folder_links: vec![],
        };
        let selection = UserSelection {
            account: Some("cloud".into()),
            project: Some("mnist".into()),
            directory: PathBuf::from("."),
        };
        let options = ClientOptions::from_lookup(|_| None, &selection, || Ok(home)).unwrap();
        match options.identity {
            Identity::User { account, project } => {
                assert_eq!(account.id, "a2");
                assert_eq!(project, ProjectSelector::Named("mnist".into()));
            }
            other => panic!("expected user identity, got {:?}", other),
        }
    }

    #[test]
    fn test_folder_link_picks_most_specific() {
        let temp = TempDir::new().unwrap();
        let outer = temp.path().join("work");
        let inner = outer.join("experiment");
        let nested = inner.join("src");
        std::fs::create_dir_all(&nested).unwrap();

        let home = HomeConfig {
            accounts: vec![account("a1", "localhost")],
            folder_links: vec![
                FolderLink {
                    account_id: "a1".into(),
                    project_id: "outer".into(),
                    path: outer.clone(),
                },
                FolderLink {
                    account_id: "a1".into(),
                    project_id: "inner".into(),
                    path: inner.clone(),
                },
            ],
        };

        let link = home.folder_link_for_directory(&nested).unwrap();
        assert_eq!(link.project_id, "inner");
        assert!(home.folder_link_for_directory(temp.path()).is_none());
    }

    #[test]
    fn test_home_config_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "accounts": [{"id": "a1", "name": "localhost", "token": "secret"}],
                "folderLinks": [{"accountId": "a1", "projectId": "p1", "path": "/tmp"}]
            }"#,
        )
        .unwrap();

        let home = HomeConfig::load_from(&path).unwrap();
        let account = home.account_for_id("a1").unwrap();
        assert_eq!(account.endpoint(), Endpoint::default());
        assert_eq!(home.folder_links[0].project_id, "p1");
    }

    #[test]
    fn test_home_config_missing_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let result = HomeConfig::load_from(&temp.path().join("missing.json"));
        assert!(matches!(result, Err(ClientError::Config { .. })));
    }
}
