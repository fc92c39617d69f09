//! Credential sync controller
//!
//! Mirrors DevOps credential Secrets into the CI service. The DevOps project
//! is the Secret's namespace; the credential id is the Secret's name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use super::{QueueController, Reconciler};
use crate::clients::{CiClient, Credential, CredentialKind};
use crate::error::{Error, Result};
use crate::manager::{Controller, Registration};

/// Controller name used in logs and metrics
pub const NAME: &str = "credential-sync";

/// Secret types handled by this controller share this prefix
pub const SECRET_TYPE_PREFIX: &str = "credential.devops.kubesphere.io/";

/// Annotation carrying the credential description
pub const DESCRIPTION_ANNOTATION: &str = "kubesphere.io/description";

const BASIC_AUTH: &str = "credential.devops.kubesphere.io/basic-auth";
const SSH_AUTH: &str = "credential.devops.kubesphere.io/ssh-auth";
const SECRET_TEXT: &str = "credential.devops.kubesphere.io/secret-text";
const KUBECONFIG: &str = "credential.devops.kubesphere.io/kubeconfig";

const SYNC_ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Whether `secret` is a DevOps credential
pub fn is_credential(secret: &Secret) -> bool {
    secret
        .type_
        .as_deref()
        .is_some_and(|t| t.starts_with(SECRET_TYPE_PREFIX))
}

/// Translate a credential Secret into a CI credential.
///
/// Returns `Ok(None)` for Secrets that are not credentials, and an error for
/// credentials of an unknown type or with missing fields.
pub fn credential_from_secret(secret: &Secret) -> Result<Option<Credential>> {
    if !is_credential(secret) {
        return Ok(None);
    }
    let secret_type = secret.type_.as_deref().unwrap_or_default();

    let field = |key: &str| -> Result<String> {
        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .ok_or_else(|| {
                Error::config(format!(
                    "credential {} is missing field '{}'",
                    secret.name_any(),
                    key
                ))
            })?;
        String::from_utf8(value.0.clone()).map_err(|_| {
            Error::config(format!(
                "credential {} field '{}' is not UTF-8",
                secret.name_any(),
                key
            ))
        })
    };
    let optional = |key: &str| field(key).unwrap_or_default();

    let kind = match secret_type {
        BASIC_AUTH => CredentialKind::UsernamePassword {
            username: field("username")?,
            password: field("password")?,
        },
        SSH_AUTH => CredentialKind::SshPrivateKey {
            username: field("username")?,
            private_key: field("private_key")?,
            passphrase: optional("passphrase"),
        },
        SECRET_TEXT => CredentialKind::SecretText {
            secret: field("secret")?,
        },
        KUBECONFIG => CredentialKind::Kubeconfig {
            content: field("content")?,
        },
        other => {
            return Err(Error::config(format!(
                "credential {} has unsupported type {}",
                secret.name_any(),
                other
            )))
        }
    };

    Ok(Some(Credential {
        id: secret.name_any(),
        description: secret
            .annotations()
            .get(DESCRIPTION_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        kind,
    }))
}

/// Pushes credential Secrets to the CI service
pub struct CredentialReconciler {
    ci: Arc<dyn CiClient>,
}

impl CredentialReconciler {
    pub fn new(ci: Arc<dyn CiClient>) -> Self {
        Self { ci }
    }
}

#[async_trait]
impl Reconciler<Secret> for CredentialReconciler {
    async fn reconcile(&self, secret: Arc<Secret>) -> Result<Action> {
        let Some(project) = secret.namespace() else {
            return Ok(Action::await_change());
        };
        let Some(credential) = credential_from_secret(&secret)? else {
            return Ok(Action::await_change());
        };

        self.ci.apply_credential(&project, &credential).await?;
        info!(project = %project, id = %credential.id, "Credential synced to CI");
        Ok(Action::await_change())
    }

    async fn cleanup(&self, key: &ObjectRef<Secret>) -> Result<()> {
        let Some(project) = key.namespace.as_deref() else {
            return Ok(());
        };

        self.ci.delete_credential(project, &key.name).await?;
        info!(project = %project, id = %key.name, "Credential removed from CI");
        Ok(())
    }

    fn error_policy(&self, _secret: Arc<Secret>, err: &Error) -> Action {
        match err {
            // Malformed Secrets only change through a new event
            Error::Config(_) => Action::await_change(),
            _ => Action::requeue(SYNC_ERROR_REQUEUE),
        }
    }
}

/// Registers credential sync when a CI client is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct CredentialSync;

impl Controller for CredentialSync {
    fn name(&self) -> &str {
        NAME
    }

    fn register(&self, registration: &mut Registration<'_>) -> Result<()> {
        let Some(ci) = registration.clients().ci().cloned() else {
            debug!("CI service not configured, credential sync disabled");
            return Ok(());
        };

        let api: Api<Secret> = Api::all(registration.clients().kubernetes().clone());
        QueueController::new(NAME, api, CredentialReconciler::new(ci))
            .with_filter(is_credential)
            .register(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn secret(type_: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("github".to_string()),
                namespace: Some("devops-demo".to_string()),
                annotations: Some(BTreeMap::from([(
                    DESCRIPTION_ANNOTATION.to_string(),
                    "GitHub account".to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingCi {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CiClient for RecordingCi {
        fn host(&self) -> &str {
            "http://jenkins"
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn apply_credential(&self, project: &str, credential: &Credential) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("apply {}/{}", project, credential.id));
            Ok(())
        }

        async fn delete_credential(&self, project: &str, id: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete {}/{}", project, id));
            Ok(())
        }
    }

    #[test]
    fn test_basic_auth_secret_becomes_username_password() {
        let credential = credential_from_secret(&secret(
            BASIC_AUTH,
            &[("username", "admin"), ("password", "hunter2")],
        ))
        .unwrap()
        .unwrap();

        assert_eq!(credential.id, "github");
        assert_eq!(credential.description, "GitHub account");
        assert_eq!(
            credential.kind,
            CredentialKind::UsernamePassword {
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            }
        );
    }

    #[test]
    fn test_ssh_passphrase_is_optional() {
        let credential = credential_from_secret(&secret(
            SSH_AUTH,
            &[("username", "git"), ("private_key", "KEY")],
        ))
        .unwrap()
        .unwrap();

        assert!(matches!(
            credential.kind,
            CredentialKind::SshPrivateKey { ref passphrase, .. } if passphrase.is_empty()
        ));
    }

    #[test]
    fn test_non_credentials_and_bad_credentials() {
        assert!(credential_from_secret(&secret("Opaque", &[])).unwrap().is_none());

        let err = credential_from_secret(&secret(SECRET_TEXT, &[])).unwrap_err();
        assert!(err.to_string().contains("secret"));

        let err =
            credential_from_secret(&secret("credential.devops.kubesphere.io/x509", &[])).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[tokio::test]
    async fn test_reconcile_applies_and_cleanup_deletes() {
        let ci = Arc::new(RecordingCi::default());
        let reconciler = CredentialReconciler::new(ci.clone());
        let secret = secret(SECRET_TEXT, &[("secret", "token")]);

        let action = reconciler.reconcile(Arc::new(secret.clone())).await.unwrap();
        assert_eq!(action, Action::await_change());

        reconciler
            .cleanup(&ObjectRef::from_obj(&secret))
            .await
            .unwrap();

        assert_eq!(
            *ci.calls.lock().unwrap(),
            vec!["apply devops-demo/github", "delete devops-demo/github"]
        );
    }

    #[test]
    fn test_malformed_credentials_are_not_retried() {
        let reconciler = CredentialReconciler::new(Arc::new(RecordingCi::default()));
        let secret = Arc::new(secret(SECRET_TEXT, &[]));
        assert_eq!(
            reconciler.error_policy(secret.clone(), &Error::config("missing field")),
            Action::await_change()
        );
        assert_eq!(
            reconciler.error_policy(secret, &Error::optional_client("ci", "502")),
            Action::requeue(SYNC_ERROR_REQUEUE)
        );
    }
}
