//! Configuration backend: the external store of policy, group membership,
//! user keys, and network topology.
//!
//! Two implementations share the same semantics: an AWS-backed one (S3 +
//! IAM + EC2 + Route 53) and a filesystem one for local operation. A
//! missing or forbidden object is a first-class `Missing`/`None` signal,
//! not an error — upper layers treat it as "nothing there" and keep going.

mod aws;
mod local;

use async_trait::async_trait;
use thiserror::Error;

pub use self::aws::AwsBackend;
pub use self::local::LocalBackend;
pub use gatehouse_policy::NetworkInfo;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{context}: {message}")]
    Cloud { context: String, message: String },

    #[error("cannot parse {what} {value}")]
    Malformed { what: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, BackendError>;

impl BackendError {
    fn cloud(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BackendError::Cloud {
            context: context.into(),
            message: err.to_string(),
        }
    }
}

/// Outcome of a conditional fetch.
#[derive(Debug)]
pub enum Fetched {
    /// The object exists and differs from `if_not_tag`.
    Modified { body: Vec<u8>, tag: String },
    /// The object still matches `if_not_tag`.
    NotModified,
    /// The object does not exist, or access to it is denied.
    Missing,
}

impl Fetched {
    pub fn into_body(self) -> Option<Vec<u8>> {
        match self {
            Fetched::Modified { body, .. } => Some(body),
            Fetched::NotModified | Fetched::Missing => None,
        }
    }
}

/// The capability set upper layers consume. Enumeration calls return `None`
/// when the named entity does not exist.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_file(&self, path: &str, if_not_tag: Option<&str>) -> Result<Fetched>;

    async fn put_file(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn fetch_network_info(&self) -> Result<NetworkInfo>;

    /// Users belonging to the named group.
    async fn fetch_group(&self, name: &str) -> Result<Option<Vec<String>>>;

    /// Groups the named user belongs to.
    async fn fetch_groups_for_user(&self, user: &str) -> Result<Option<Vec<String>>>;

    /// Active key aliases registered for the user.
    async fn fetch_keys(&self, user: &str) -> Result<Option<Vec<String>>>;

    /// PEM public key body for one of the user's aliases.
    async fn fetch_key(&self, user: &str, alias: &str) -> Result<Option<Vec<u8>>>;

    async fn register_dns(&self, zone: &str, name: &str, weighted: bool) -> Result<()>;

    async fn unregister_dns(&self) -> Result<()>;
}
