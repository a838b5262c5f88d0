//! Operator error type and the retry classification that drives requeues.
//!
//! Policy violations are never errors: they travel as
//! [`crate::template::TemplateViolation`] data and surface through status
//! conditions. Everything here is either a system/transient failure (retried
//! via requeue) or a permanent configuration failure (inert until the spec
//! changes).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("workspace template not found: {name}")]
    TemplateNotFound { name: String },

    #[error("workspace template {name} has no default image")]
    TemplateMissingDefaultImage { name: String },

    #[error("workspace must set either a template reference or an image")]
    MissingImage,

    #[error("workspace has no namespace")]
    MissingNamespace,

    #[error("invalid access resource template {name}: {message}")]
    InvalidAccessTemplate { name: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("infrastructure error: {message}")]
    Infrastructure { message: String },
}

impl Error {
    /// Whether a requeue can plausibly fix this error. Non-retryable errors
    /// leave the object inert until its spec changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(_)
            | Error::TemplateNotFound { .. }
            | Error::Infrastructure { .. }
            | Error::Serialization(_) => true,
            Error::TemplateMissingDefaultImage { .. }
            | Error::MissingImage
            | Error::MissingNamespace
            | Error::InvalidAccessTemplate { .. } => false,
        }
    }

    /// Short machine-readable reason for status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "ApiFailure",
            Error::TemplateNotFound { .. } => "TemplateNotFound",
            Error::TemplateMissingDefaultImage { .. } => "TemplateMisconfigured",
            Error::MissingImage => "MissingImage",
            Error::MissingNamespace => "MissingNamespace",
            Error::InvalidAccessTemplate { .. } => "InvalidAccessTemplate",
            Error::Serialization(_) => "SerializationFailure",
            Error::Infrastructure { .. } => "InfrastructureFailure",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_retried() {
        assert!(!Error::MissingImage.is_retryable());
        assert!(!Error::TemplateMissingDefaultImage { name: "t".into() }.is_retryable());
        assert!(!Error::InvalidAccessTemplate {
            name: "route".into(),
            message: "bad yaml".into()
        }
        .is_retryable());
    }

    #[test]
    fn system_errors_are_retried() {
        assert!(Error::TemplateNotFound { name: "t".into() }.is_retryable());
        assert!(Error::Infrastructure {
            message: "conflict".into()
        }
        .is_retryable());
    }
}
