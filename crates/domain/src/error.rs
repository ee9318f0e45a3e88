use std::fmt;

/// Shared error type used across all Updraft crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no scaling group {group_id} for tenant {tenant_id}")]
    NoSuchScalingGroup { tenant_id: String, group_id: String },

    #[error("no policy {policy_id} in group {group_id}")]
    NoSuchPolicy {
        tenant_id: String,
        group_id: String,
        policy_id: String,
    },

    #[error("no webhook {webhook_id} under policy {policy_id}")]
    NoSuchWebhook {
        tenant_id: String,
        group_id: String,
        policy_id: String,
        webhook_id: String,
    },

    #[error("unrecognized capability hash {0}")]
    UnrecognizedCapability(String),

    #[error("group {group_id} for tenant {tenant_id} still has servers")]
    GroupNotEmpty { tenant_id: String, group_id: String },

    #[error("validation: {0}")]
    Validation(String),

    #[error("cannot execute policy: {0}")]
    CannotExecutePolicy(CannotExecuteReason),

    #[error("could not acquire lock on {0}")]
    BusyLock(String),

    #[error("expected server {server_id} to have {expected}, has {status}")]
    UnexpectedServerStatus {
        server_id: String,
        status: String,
        expected: String,
    },

    #[error("unexpected response from {url}: {status}")]
    UnexpectedResponse { url: String, status: u16 },

    #[error("no endpoint for service {service} in region {region}")]
    NoSuchEndpoint { service: String, region: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a policy execution was refused.
///
/// These are normal-contention outcomes: the scheduler logs and retries
/// at the next trigger, the API layer surfaces them as 403.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CannotExecuteReason {
    /// The group is paused.
    Paused,
    /// The policy's own cooldown has not elapsed.
    PolicyCooldown,
    /// The group-wide cooldown has not elapsed.
    GroupCooldown,
    /// The clamped target equals current capacity.
    AtLimit,
}

impl fmt::Display for CannotExecuteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Paused => "group is paused",
            Self::PolicyCooldown => "policy cooldown in effect",
            Self::GroupCooldown => "group cooldown in effect",
            Self::AtLimit => "policy execution would not change capacity",
        };
        f.write_str(s)
    }
}

impl Error {
    /// HTTP status the outer API layer maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NoSuchScalingGroup { .. }
            | Error::NoSuchPolicy { .. }
            | Error::NoSuchWebhook { .. }
            | Error::UnrecognizedCapability(_) => 404,
            Error::GroupNotEmpty { .. } => 409,
            Error::CannotExecutePolicy(_) => 403,
            Error::Validation(_) | Error::Json(_) => 400,
            _ => 500,
        }
    }

    /// Whether retrying the same operation may succeed without any
    /// caller-visible state change (transport blips, lock contention).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::BusyLock(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
