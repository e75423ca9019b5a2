use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors possible to occur during reconciliation, sweeps, or startup.
#[derive(Debug, Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("Kubernetes reported error: {0}")]
    KubeError(#[from] kube::Error),

    /// `spec` field is missing or malformed in a way that can only be fixed by editing the
    /// resource; never retried automatically.
    #[error("invalid CdkTsStack spec: {0}")]
    ConfigError(String),

    /// Referenced secret does not exist.
    #[error("credentials secret {0}/{1} not found")]
    CredentialsSecretMissing(String, String),

    /// Referenced secret exists but is missing a required key.
    #[error("credentials secret {0}/{1} is malformed: missing key {2}")]
    CredentialsSecretMalformed(String, String, &'static str),

    #[error("secret value is not valid base64: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("secret value is not valid utf-8: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    /// An external process (`git`, `npm`, `cdk`) could not even be spawned.
    #[error("failed to spawn {0}: {1}")]
    ProcessSpawnError(String, std::io::Error),

    /// I/O failure manipulating a workspace directory or hook script file.
    #[error("workspace I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to serialize metric record: {0}")]
    MetricSerializeError(#[from] serde_json::Error),

    /// The resource was deleted mid-reconcile; callers should treat this as a no-op.
    #[error("resource no longer exists")]
    NotFound,
}

impl Error {
    /// Stable, low-cardinality label used by tests and log lines; never includes dynamic text.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::CredentialsSecretMissing(..) => "credentials_missing",
            Error::CredentialsSecretMalformed(..) => "credentials_malformed",
            Error::Base64Error(_) => "credentials_malformed",
            Error::Utf8Error(_) => "credentials_malformed",
            Error::ProcessSpawnError(..) => "process_spawn",
            Error::IoError(_) => "io",
            Error::MetricSerializeError(_) => "metrics",
            Error::NotFound => "not_found",
        }
        .to_owned()
    }
}
