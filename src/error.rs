//! Error types for the DevOps controller manager

use thiserror::Error;

/// Result type alias using the controller manager's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Controller manager error types
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be read, parsed, or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// The mandatory cluster client could not be built
    #[error("Failed to create kubernetes client: {0}")]
    ClientConstruction(String),

    /// An optional service was configured but its client could not be built
    #[error("Failed to connect to {service}, please check {service} status: {reason}")]
    OptionalClient {
        service: &'static str,
        reason: String,
    },

    /// Scheme, informer, or controller registration failed
    #[error("Registration error: {0}")]
    Registration(String),

    /// Admission webhook listener could not be started
    #[error("Webhook error: {0}")]
    Webhook(String),

    /// Leadership was lost while the control loop was running
    #[error("Leader election lost: {0}")]
    LeadershipLost(String),

    /// A managed runnable stopped with an error
    #[error("Runnable '{name}' failed: {reason}")]
    Runnable { name: String, reason: String },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a registration error
    pub fn registration(msg: impl Into<String>) -> Self {
        Error::Registration(msg.into())
    }

    /// Create a webhook error
    pub fn webhook(msg: impl Into<String>) -> Self {
        Error::Webhook(msg.into())
    }

    /// Create a cluster client construction error
    pub fn client(msg: impl Into<String>) -> Self {
        Error::ClientConstruction(msg.into())
    }

    /// Create an optional service client error
    pub fn optional_client(service: &'static str, reason: impl Into<String>) -> Self {
        Error::OptionalClient {
            service,
            reason: reason.into(),
        }
    }

    /// Startup stage the error belongs to, used in fatal log lines
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration",
            Error::ClientConstruction(_) => "cluster-client",
            Error::OptionalClient { .. } => "optional-clients",
            Error::Registration(_) => "registration",
            Error::Webhook(_) => "webhook",
            Error::LeadershipLost(_) => "leader-election",
            Error::Runnable { .. } => "run",
            Error::Kube(_) | Error::Http(_) | Error::Serialization(_) | Error::Io(_) => "run",
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::ClientConstruction(_) => 3,
            Error::OptionalClient { .. } => 4,
            Error::Registration(_) => 5,
            Error::Webhook(_) => 6,
            Error::LeadershipLost(_) => 7,
            _ => 1,
        }
    }
}
