use thiserror::Error;

/// Failures while loading or validating server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration found; run `sovpn setup` first")]
    NotConfigured,
    #[error("config field `{field}` is missing")]
    Missing { field: &'static str },
    #[error("invalid value for `{field}`: \"{value}\" ({reason})")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Failures of the client lifecycle operations (create / revoke / rotate).
///
/// `DuplicateClient` is recoverable (ask for a different name); the rest abort
/// the current operation and leave prior state untouched.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("client \"{0}\" already exists")]
    DuplicateClient(String),
    #[error("client \"{0}\" not found")]
    ClientNotFound(String),
    #[error("display name \"{0}\" does not yield a usable identifier")]
    InvalidName(String),
    #[error("certificate generation failed for \"{slug}\": {reason}")]
    CertificateGenerationFailed { slug: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
