//! Top-level error type for the restore operator's bootstrap path
//!
//! Each layer has its own error enum; this one aggregates them so the process
//! boundary can report any fatal condition with its full context.

use thiserror::Error;

use crate::identity::IdentityError;
use crate::leader_election::LeaderElectionError;
use crate::registration::RegistrationError;

/// Main error type for restore operator startup and election
#[derive(Debug, Error)]
pub enum Error {
    /// Required identity inputs were missing or unreadable
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Self-registration Service could not be published
    #[error("self-registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Leader election failed
    #[error("leader election error: {0}")]
    LeaderElection(#[from] LeaderElectionError),

    /// Invalid configuration value
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error happened before any network interaction
    pub fn is_startup_config(&self) -> bool {
        matches!(self, Self::Identity(_) | Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_is_a_startup_config_error() {
        let err: Error = IdentityError::MissingEnv {
            var: "MY_POD_NAME".to_string(),
        }
        .into();
        assert!(err.is_startup_config());
        assert_eq!(
            err.to_string(),
            "identity error: must set env MY_POD_NAME"
        );
    }

    #[test]
    fn config_error_carries_message() {
        let err = Error::config("renew deadline must be shorter than lease duration");
        assert!(err.is_startup_config());
        assert!(err.to_string().contains("renew deadline"));
    }

    #[test]
    fn registration_error_is_not_startup_config() {
        let err: Error = RegistrationError::PodLookup {
            pod: "op-0".to_string(),
            namespace: "etcd".to_string(),
            message: "connection refused".to_string(),
        }
        .into();
        assert!(!err.is_startup_config());
    }
}
