//! Kubernetes client construction

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

use crate::error::{Error, Result};
use crate::options::KubernetesOptions;

/// Build the cluster client and check that the API server answers.
///
/// Failures are returned as-is; this function never retries.
pub async fn build(access: &KubernetesOptions) -> Result<Client> {
    let config = client_config(access).await?;
    let cluster_url = config.cluster_url.to_string();

    let client = Client::try_from(config)
        .map_err(|e| Error::client(format!("invalid client configuration: {}", e)))?;

    let version = client
        .apiserver_version()
        .await
        .map_err(|e| Error::client(format!("API server {} unreachable: {}", cluster_url, e)))?;

    info!(
        server = %cluster_url,
        version = %version.git_version,
        "Connected to Kubernetes API server"
    );

    Ok(client)
}

/// Resolve the client configuration without contacting the cluster
pub async fn client_config(access: &KubernetesOptions) -> Result<Config> {
    let kubeconfig_options = KubeConfigOptions {
        context: access.context.clone(),
        ..Default::default()
    };

    let mut config = match (&access.kubeconfig, &access.context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::client(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &kubeconfig_options)
                .await
                .map_err(|e| Error::client(format!("invalid kubeconfig {}: {}", path.display(), e)))?
        }
        (None, Some(_)) => Config::from_kubeconfig(&kubeconfig_options)
            .await
            .map_err(|e| Error::client(format!("invalid kubeconfig: {}", e)))?,
        (None, None) => Config::infer()
            .await
            .map_err(|e| Error::client(format!("unable to infer cluster configuration: {}", e)))?,
    };

    if let Some(master) = access.master.as_deref().filter(|m| !m.is_empty()) {
        config.cluster_url = master
            .parse()
            .map_err(|e| Error::client(format!("invalid master URL '{}': {}", master, e)))?;
    }

    Ok(config)
}
