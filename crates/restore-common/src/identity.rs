//! Replica identity resolution
//!
//! Every replica needs a namespace to work in, its own pod name (for
//! self-registration), and a host identity that becomes the Lease holder.
//! All three are required. There is no default: a replica without a valid
//! identity could hold the lock anonymously or collide with another holder.

use std::ffi::OsString;
use std::io;

use thiserror::Error;

use crate::{ENV_OPERATOR_POD_NAME, ENV_OPERATOR_POD_NAMESPACE};

/// Identity resolution errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A required environment variable is unset or empty
    #[error("must set env {var}")]
    MissingEnv {
        /// Name of the missing variable
        var: String,
    },

    /// The OS hostname could not be read
    #[error("failed to get hostname: {0}")]
    Hostname(#[from] io::Error),

    /// The OS hostname is empty or not valid UTF-8
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(OsString),
}

/// Who this replica is
///
/// Resolved once at process start and never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Namespace the operator runs in
    pub namespace: String,
    /// This replica's pod name
    pub instance_name: String,
    /// Unique host identity used as the Lease holder
    pub host_identity: String,
}

/// Resolve identity from an injectable env lookup and hostname source
///
/// Environment inputs are checked first, so a missing variable is reported
/// without ever consulting the hostname source.
pub fn resolve_identity<E, H>(lookup: E, hostname: H) -> Result<Identity, IdentityError>
where
    E: Fn(&str) -> Option<String>,
    H: FnOnce() -> io::Result<OsString>,
{
    let namespace = required_env(&lookup, ENV_OPERATOR_POD_NAMESPACE)?;
    let instance_name = required_env(&lookup, ENV_OPERATOR_POD_NAME)?;

    let raw = hostname()?;
    let host_identity = match raw.to_str() {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => return Err(IdentityError::InvalidHostname(raw)),
    };

    Ok(Identity {
        namespace,
        instance_name,
        host_identity,
    })
}

fn required_env<E>(lookup: &E, var: &str) -> Result<String, IdentityError>
where
    E: Fn(&str) -> Option<String>,
{
    lookup(var)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IdentityError::MissingEnv {
            var: var.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn host(name: &str) -> impl FnOnce() -> io::Result<OsString> {
        let name = OsString::from(name);
        move || Ok(name)
    }

    #[test]
    fn resolves_all_three_inputs() {
        let identity = resolve_identity(
            env(&[
                (ENV_OPERATOR_POD_NAMESPACE, "etcd"),
                (ENV_OPERATOR_POD_NAME, "restore-operator-7d9f"),
            ]),
            host("restore-operator-7d9f"),
        )
        .unwrap();

        assert_eq!(identity.namespace, "etcd");
        assert_eq!(identity.instance_name, "restore-operator-7d9f");
        assert_eq!(identity.host_identity, "restore-operator-7d9f");
    }

    #[test]
    fn missing_namespace_names_the_variable() {
        let err = resolve_identity(
            env(&[(ENV_OPERATOR_POD_NAME, "op-0")]),
            host("op-0"),
        )
        .unwrap_err();

        assert!(
            matches!(err, IdentityError::MissingEnv { ref var } if var == ENV_OPERATOR_POD_NAMESPACE)
        );
        assert_eq!(err.to_string(), "must set env MY_POD_NAMESPACE");
    }

    #[test]
    fn empty_pod_name_counts_as_missing() {
        let err = resolve_identity(
            env(&[
                (ENV_OPERATOR_POD_NAMESPACE, "etcd"),
                (ENV_OPERATOR_POD_NAME, ""),
            ]),
            host("op-0"),
        )
        .unwrap_err();

        assert!(
            matches!(err, IdentityError::MissingEnv { ref var } if var == ENV_OPERATOR_POD_NAME)
        );
    }

    #[test]
    fn hostname_not_consulted_when_env_missing() {
        let called = Cell::new(false);
        let result = resolve_identity(env(&[]), || {
            called.set(true);
            Ok(OsString::from("op-0"))
        });

        assert!(result.is_err());
        assert!(!called.get());
    }

    #[test]
    fn hostname_failure_is_reported() {
        let err = resolve_identity(
            env(&[
                (ENV_OPERATOR_POD_NAMESPACE, "etcd"),
                (ENV_OPERATOR_POD_NAME, "op-0"),
            ]),
            || Err(io::Error::other("uname failed")),
        )
        .unwrap_err();

        assert!(matches!(err, IdentityError::Hostname(_)));
        assert!(err.to_string().contains("uname failed"));
    }

    #[test]
    fn empty_hostname_is_rejected() {
        let err = resolve_identity(
            env(&[
                (ENV_OPERATOR_POD_NAMESPACE, "etcd"),
                (ENV_OPERATOR_POD_NAME, "op-0"),
            ]),
            host(""),
        )
        .unwrap_err();

        assert!(matches!(err, IdentityError::InvalidHostname(_)));
    }
}
