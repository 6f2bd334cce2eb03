//! Environment-driven configuration.
//!
//! The backend is selected by `TRANSPORT` (`azure` | `s3`); each backend
//! reads its own endpoint/container/key/credential variables. Everything is
//! resolved up front so misconfiguration fails at startup, not mid-transfer.

use std::path::PathBuf;

use blobsync_engine::Operation;
use blobsync_transport::AuthInput;

/// Remote backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Azure,
    S3,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("unsupported TRANSPORT {0:?} (expected \"azure\" or \"s3\")")]
    UnsupportedTransport(String),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Resolved run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub kind: TransportKind,
    /// Account URL for Azure; region for S3.
    pub endpoint: String,
    pub container: String,
    pub remote_key: String,
    pub local_path: PathBuf,
    pub expected_size: u64,
    pub operation: Operation,
    pub part_size: Option<u64>,
    pub auth: AuthInput,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            get(name)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let transport = required("TRANSPORT")?;
        let (kind, endpoint, container, remote_key, local_path, auth) = match transport.as_str() {
            "azure" => (
                TransportKind::Azure,
                required("ACCOUNT_URL")?,
                required("CONTAINER")?,
                required("REMOTE_FILE")?,
                required("LOCAL_FILE")?,
                AuthInput {
                    auth_type: "password".into(),
                    username: required("ACCOUNT_NAME")?,
                    secret: required("ACCOUNT_KEY")?,
                },
            ),
            "s3" | "aws" => {
                let region = required("AWS_ACCOUNT_URL")?;
                if region.starts_with("http") {
                    return Err(ConfigError::Invalid {
                        name: "AWS_ACCOUNT_URL",
                        reason: format!(
                            "must be a region (e.g. me-central-1), not a URL: {region}"
                        ),
                    });
                }
                (
                    TransportKind::S3,
                    region,
                    required("AWS_CONTAINER")?,
                    required("AWS_REMOTE_FILE")?,
                    required("AWS_LOCAL_FILE")?,
                    AuthInput {
                        auth_type: "s3".into(),
                        username: required("AWS_KEY_ID")?,
                        secret: required("AWS_KEY_SECRET")?,
                    },
                )
            }
            other => return Err(ConfigError::UnsupportedTransport(other.to_string())),
        };

        let expected_size = required("OBJECT_SIZE").and_then(|v| {
            v.parse().map_err(|_| ConfigError::Invalid {
                name: "OBJECT_SIZE",
                reason: format!("not a byte count: {v}"),
            })
        })?;

        let operation = match get("OPERATION").as_deref() {
            None | Some("download") => Operation::Download,
            Some("upload") => Operation::Upload,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "OPERATION",
                    reason: format!("expected \"download\" or \"upload\", got {other:?}"),
                });
            }
        };

        let part_size = match get("PART_SIZE") {
            None => None,
            Some(v) => Some(v.parse().map_err(|_| ConfigError::Invalid {
                name: "PART_SIZE",
                reason: format!("not a byte count: {v}"),
            })?),
        };

        Ok(Self {
            kind,
            endpoint,
            container,
            remote_key,
            local_path: PathBuf::from(local_path),
            expected_size,
            operation,
            part_size,
            auth,
        })
    }
}
