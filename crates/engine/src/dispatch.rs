//! The seam between policy execution and the worker.
//!
//! A committed `modify_state` hands back a scale plan; dispatching it is
//! fire-and-forget from the controller's point of view — the worker
//! re-enters `modify_state` later to settle each job.

use async_trait::async_trait;

use updraft_domain::LbMembership;
use updraft_store::ScalingGroup;

/// One launch to carry out. The job id is already in `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchJob {
    pub job_id: String,
}

/// One server to destroy. Already removed from `active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteJob {
    pub server_id: String,
    pub lb_memberships: Vec<LbMembership>,
}

/// The work a policy execution decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalePlan {
    pub tenant_id: String,
    pub group_id: String,
    pub launches: Vec<LaunchJob>,
    pub deletes: Vec<DeleteJob>,
}

impl ScalePlan {
    pub fn empty(tenant_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            group_id: group_id.into(),
            launches: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.launches.is_empty() && self.deletes.is_empty()
    }
}

/// Receives committed scale plans. The production implementation spawns
/// launch/delete pipelines; tests record.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, group: ScalingGroup, plan: ScalePlan);
}
