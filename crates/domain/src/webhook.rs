//! Anonymous-capability webhooks.

use std::collections::HashMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Capability version stored alongside every hash. A future rotation can
/// introduce v2 capabilities without invalidating v1 URLs.
pub const CAPABILITY_VERSION: &str = "1";

/// The sole credential for anonymous policy execution. The hash is an
/// opaque URL-safe token; it alone resolves to a (tenant, group, policy)
/// triple through the store's index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub version: String,
    pub hash: String,
}

impl Capability {
    /// Generate a fresh capability: 256 random bits, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            version: CAPABILITY_VERSION.into(),
            hash: hex::encode(bytes),
        }
    }
}

/// A stored webhook. The capability is generated server-side at creation
/// and survives every update to `name`/`metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub capability: Capability,
}

/// User-supplied webhook fields for create/update calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}
