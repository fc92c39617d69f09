//! CI execution service client
//!
//! The service is Jenkins. Only the calls the controller manager itself
//! needs are implemented: a reachability/authentication check and
//! credential management inside a project folder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::options::CiOptions;

/// Service name used in errors and logs
pub const SERVICE: &str = "ci";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Credential material mirrored into the CI service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialKind {
    UsernamePassword { username: String, password: String },
    SecretText { secret: String },
    SshPrivateKey {
        username: String,
        private_key: String,
        passphrase: String,
    },
    Kubeconfig { content: String },
}

/// A credential stored in a CI project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    pub description: String,
    pub kind: CredentialKind,
}

/// Operations the controller manager needs from the CI service
#[async_trait]
pub trait CiClient: Send + Sync {
    /// Base URL of the service
    fn host(&self) -> &str;

    /// Check that the service is reachable and accepts our credentials
    async fn ping(&self) -> Result<()>;

    /// Create or update a credential in a project
    async fn apply_credential(&self, project: &str, credential: &Credential) -> Result<()>;

    /// Delete a credential from a project; deleting a missing credential succeeds
    async fn delete_credential(&self, project: &str, id: &str) -> Result<()>;
}

/// Build the CI client when a host is configured.
///
/// Returns `Ok(None)` when the service is not configured. A configured host
/// that is malformed, unreachable, or rejects our credentials is an error.
pub async fn build(opts: Option<&CiOptions>) -> Result<Option<Arc<dyn CiClient>>> {
    let Some(opts) = opts.filter(|o| !o.host.trim().is_empty()) else {
        debug!("CI service not configured");
        return Ok(None);
    };

    let client = JenkinsClient::new(opts)?;
    client
        .ping()
        .await
        .map_err(|e| Error::optional_client(SERVICE, e.to_string()))?;

    info!(host = %client.host(), "Connected to CI service");
    Ok(Some(Arc::new(client)))
}

/// Jenkins implementation of [`CiClient`]
#[derive(Debug, Clone)]
pub struct JenkinsClient {
    base: Url,
    host: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl JenkinsClient {
    /// Create a client without contacting the service
    pub fn new(opts: &CiOptions) -> Result<Self> {
        let host = opts.host.trim().trim_end_matches('/').to_string();
        let base = Url::parse(&format!("{}/", host))
            .map_err(|e| Error::optional_client(SERVICE, format!("invalid host '{}': {}", host, e)))?;

        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(Error::optional_client(
                SERVICE,
                format!("invalid host '{}': expected an http(s) URL", host),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(opts.max_connections)
            .build()
            .map_err(|e| Error::optional_client(SERVICE, e.to_string()))?;

        Ok(Self {
            base,
            host,
            username: opts.username.clone(),
            password: opts.password.clone(),
            http,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::optional_client(SERVICE, format!("invalid path '{}': {}", path, e)))
    }

    fn credentials_store(&self, project: &str) -> String {
        format!("job/{}/credentials/store/folder/domain/_/", project)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn submit(&self, url: Url, credential: &Credential) -> Result<reqwest::Response> {
        let payload = json!({ "": "0", "credentials": credential_payload(credential) });
        let form = [("json", payload.to_string())];
        Ok(self
            .authorized(self.http.post(url))
            .form(&form)
            .send()
            .await?)
    }
}

#[async_trait]
impl CiClient for JenkinsClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .authorized(self.http.get(self.url("api/json")?))
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::optional_client(
                SERVICE,
                format!("authentication rejected with status {}", response.status()),
            )),
            _ => {
                response.error_for_status()?;
                Ok(())
            }
        }
    }

    async fn apply_credential(&self, project: &str, credential: &Credential) -> Result<()> {
        let store = self.credentials_store(project);
        let response = self
            .submit(self.url(&format!("{}createCredentials", store))?, credential)
            .await?;

        if response.status() == StatusCode::CONFLICT {
            debug!(project = project, id = %credential.id, "Credential exists, updating");
            let update = self.url(&format!("{}credential/{}/updateSubmit", store, credential.id))?;
            self.submit(update, credential).await?.error_for_status()?;
        } else {
            response.error_for_status()?;
        }

        Ok(())
    }

    async fn delete_credential(&self, project: &str, id: &str) -> Result<()> {
        let url = self.url(&format!(
            "{}credential/{}/doDelete",
            self.credentials_store(project),
            id
        ))?;
        let response = self.authorized(self.http.post(url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }
}

/// Jenkins credentials-plugin form payload for a credential
fn credential_payload(credential: &Credential) -> Value {
    let mut payload = match &credential.kind {
        CredentialKind::UsernamePassword { username, password } => json!({
            "$class": "com.cloudbees.plugins.credentials.impl.UsernamePasswordCredentialsImpl",
            "username": username,
            "password": password,
        }),
        CredentialKind::SecretText { secret } => json!({
            "$class": "org.jenkinsci.plugins.plaincredentials.impl.StringCredentialsImpl",
            "secret": secret,
        }),
        CredentialKind::SshPrivateKey {
            username,
            private_key,
            passphrase,
        } => json!({
            "$class": "com.cloudbees.jenkins.plugins.sshcredentials.impl.BasicSSHUserPrivateKey",
            "username": username,
            "passphrase": passphrase,
            "privateKeySource": {
                "stapler-class": "com.cloudbees.jenkins.plugins.sshcredentials.impl.BasicSSHUserPrivateKey$DirectEntryPrivateKeySource",
                "privateKey": private_key,
            },
        }),
        CredentialKind::Kubeconfig { content } => json!({
            "$class": "com.microsoft.jenkins.kubernetes.credentials.KubeconfigCredentials",
            "kubeconfigSource": {
                "stapler-class": "com.microsoft.jenkins.kubernetes.credentials.KubeconfigCredentials$DirectEntryKubeconfigSource",
                "content": content,
            },
        }),
    };

    payload["scope"] = json!("GLOBAL");
    payload["id"] = json!(credential.id);
    payload["description"] = json!(credential.description);
    payload
}
