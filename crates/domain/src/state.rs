//! Mutable per-group state: observed servers and in-flight launches.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A node registration on one load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbMembership {
    pub load_balancer_id: u64,
    pub node_id: u64,
}

/// One running server as observed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub created_at: DateTime<Utc>,
    pub ip_address: String,
    #[serde(default)]
    pub lb_memberships: Vec<LbMembership>,
}

/// The five mutable state columns of a scaling group.
///
/// Every mutation goes through the store's `modify_state` protocol; no
/// other code path writes these columns. `tenant_id`/`group_id` travel
/// with the state so the protocol can assert a modifier did not swap
/// identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub tenant_id: String,
    pub group_id: String,
    /// server_id -> entry for servers confirmed running.
    pub active: HashMap<String, ServerEntry>,
    /// job_id -> creation time for launches still in flight.
    pub pending: HashMap<String, DateTime<Utc>>,
    /// Last group-wide policy execution (group cooldown anchor).
    pub group_touched: Option<DateTime<Utc>>,
    /// policy_id -> last execution (per-policy cooldown anchor).
    pub policy_touched: HashMap<String, DateTime<Utc>>,
    pub paused: bool,
}

impl GroupState {
    pub fn new(tenant_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            group_id: group_id.into(),
            active: HashMap::new(),
            pending: HashMap::new(),
            group_touched: None,
            policy_touched: HashMap::new(),
            paused: false,
        }
    }

    /// Servers running plus launches in flight.
    pub fn desired_total(&self) -> usize {
        self.active.len() + self.pending.len()
    }

    pub fn add_pending(&mut self, job_id: impl Into<String>, at: DateTime<Utc>) {
        self.pending.insert(job_id.into(), at);
    }

    pub fn remove_pending(&mut self, job_id: &str) -> Option<DateTime<Utc>> {
        self.pending.remove(job_id)
    }

    /// A launch job completed: retire the job id and record the server.
    pub fn promote(&mut self, job_id: &str, server_id: impl Into<String>, entry: ServerEntry) {
        self.pending.remove(job_id);
        self.active.insert(server_id.into(), entry);
    }

    pub fn remove_active(&mut self, server_id: &str) -> Option<ServerEntry> {
        self.active.remove(server_id)
    }

    /// Active servers ordered oldest `created_at` first, ties broken by
    /// lexicographic server id. Scale-down victims come off the front.
    pub fn active_oldest_first(&self) -> Vec<(String, ServerEntry)> {
        let mut servers: Vec<_> = self
            .active
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        servers.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
        servers
    }
}
