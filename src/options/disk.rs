//! On-disk configuration document
//!
//! The document is shared with other KubeSphere components, so it may carry
//! keys this process must not honour (leader election, webhook settings).
//! Those are parsed only so they can be reported and ignored.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::{CiOptions, KubernetesOptions, ObjectStoreOptions};

/// File name searched for when no explicit path is given
pub const CONFIG_FILE_NAME: &str = "kubesphere.yaml";

/// Directories searched, in order, for [`CONFIG_FILE_NAME`]
pub const CONFIG_SEARCH_PATHS: &[&str] = &[".", "/etc/kubesphere"];

/// Parsed configuration document
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskConfig {
    #[serde(default)]
    pub kubernetes: Option<KubernetesOptions>,

    /// CI service section
    #[serde(default, rename = "devops")]
    pub ci: Option<CiOptions>,

    /// Object store section
    #[serde(default, rename = "s3")]
    pub object_store: Option<ObjectStoreOptions>,

    #[serde(default)]
    leader_elect: Option<serde_yaml::Value>,

    #[serde(default)]
    leader_election: Option<serde_yaml::Value>,

    #[serde(default)]
    webhook_cert_dir: Option<serde_yaml::Value>,
}

impl DiskConfig {
    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("Invalid configuration document: {}", e)))
    }

    /// Read and parse the document at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read configuration file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content).map_err(|e| match e {
            Error::Config(msg) => Error::config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Load from `explicit`, or from the first file found in the search paths.
    ///
    /// A missing configuration file is an error: the process must never start
    /// with default cluster credentials.
    pub fn discover(explicit: Option<&Path>) -> Result<(PathBuf, Self)> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => CONFIG_SEARCH_PATHS
                .iter()
                .map(|dir| Path::new(dir).join(CONFIG_FILE_NAME))
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| {
                    Error::config(format!(
                        "No {} found in {}",
                        CONFIG_FILE_NAME,
                        CONFIG_SEARCH_PATHS.join(", ")
                    ))
                })?,
        };

        let config = Self::load(&path)?;
        info!(path = %path.display(), "Loaded configuration from disk");

        for key in config.ignored_keys() {
            warn!(
                key = key,
                path = %path.display(),
                "Ignoring command-line only setting found in configuration file"
            );
        }

        Ok((path, config))
    }

    /// Keys present in the document that are only accepted from the command line
    pub fn ignored_keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.leader_elect.is_some() {
            keys.push("leaderElect");
        }
        if self.leader_election.is_some() {
            keys.push("leaderElection");
        }
        if self.webhook_cert_dir.is_some() {
            keys.push("webhookCertDir");
        }
        keys
    }
}
