//! Group configuration and launch templates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Declarative capacity bounds and cooldown for one scaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Minimum seconds between any two policy executions on this group.
    #[serde(default)]
    pub cooldown: u32,
    pub min_entities: u32,
    pub max_entities: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GroupConfig {
    /// `0 <= min_entities <= max_entities` must hold.
    pub fn validate(&self) -> Result<()> {
        if self.min_entities > self.max_entities {
            return Err(Error::Validation(format!(
                "min_entities ({}) exceeds max_entities ({})",
                self.min_entities, self.max_entities
            )));
        }
        Ok(())
    }
}

/// Compute server template. The fields the control plane stamps are
/// typed; everything else (image, flavor, networks, ...) passes through
/// to the compute API untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One load-balancer attachment for every launched server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub load_balancer_id: u64,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The recipe for creating one instance and wiring it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub server: ServerTemplate,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerSpec>,
}
