//! Client seams for the upstream compute and load-balancer APIs.
//!
//! The pipelines only ever talk to these traits; the reqwest-backed
//! implementations live in `http`, and tests drive the pipelines with
//! scripted fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use updraft_domain::{Result, ServerTemplate};

/// The slice of a compute server body the pipelines care about.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDetails {
    pub id: String,
    pub status: String,
    /// Network label -> addresses.
    #[serde(default)]
    pub addresses: HashMap<String, Vec<Address>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Address {
    pub version: u8,
    pub addr: String,
}

impl ServerDetails {
    /// The address load balancers route to: the first private IPv4.
    pub fn first_private_ipv4(&self) -> Option<&str> {
        self.addresses
            .get("private")?
            .iter()
            .find(|a| a.version == 4)
            .map(|a| a.addr.as_str())
    }
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Create a server from a prepared template; returns the new id.
    async fn create_server(&self, template: &ServerTemplate) -> Result<String>;

    /// Current details of a server; `None` once it is gone (404).
    async fn server_details(&self, server_id: &str) -> Result<Option<ServerDetails>>;

    /// Request deletion. A server that is already gone counts as
    /// deleted.
    async fn delete_server(&self, server_id: &str) -> Result<()>;
}

#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    /// Register `address:port` as an ENABLED/PRIMARY node; returns the
    /// node id.
    async fn add_node(&self, lb_id: u64, address: &str, port: u16) -> Result<u64>;

    /// Deregister a node. A node that is already gone counts as
    /// removed.
    async fn remove_node(&self, lb_id: u64, node_id: u64) -> Result<()>;
}
