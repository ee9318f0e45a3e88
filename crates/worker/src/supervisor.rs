//! The dispatcher implementation: fans a committed scale plan out onto
//! tokio tasks, one per job, and settles each outcome back into group
//! state through `modify_state`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use updraft_domain::config::WorkerConfig;
use updraft_domain::{Clock, ServerEntry};
use updraft_engine::{DeleteJob, JobDispatcher, LaunchJob, ScalePlan};
use updraft_store::ScalingGroup;

use crate::delete;
use crate::launch::{launch_server, LaunchTimeouts};
use crate::traits::{ComputeClient, LoadBalancerClient};

/// Polling cadence and wall-clock budgets for the pipelines.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub launch_timeout: Duration,
    pub delete_timeout: Duration,
}

impl From<&WorkerConfig> for PollSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            launch_timeout: Duration::from_secs(config.launch_timeout_secs),
            delete_timeout: Duration::from_secs(config.delete_timeout_secs),
        }
    }
}

impl PollSettings {
    fn launch_timeouts(&self) -> LaunchTimeouts {
        LaunchTimeouts {
            interval: self.interval,
            launch_timeout: self.launch_timeout,
            delete_timeout: self.delete_timeout,
        }
    }
}

pub struct Supervisor {
    compute: Arc<dyn ComputeClient>,
    load_balancers: Arc<dyn LoadBalancerClient>,
    poll: PollSettings,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub fn new(
        compute: Arc<dyn ComputeClient>,
        load_balancers: Arc<dyn LoadBalancerClient>,
        poll: PollSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            compute,
            load_balancers,
            poll,
            clock,
        }
    }
}

#[async_trait]
impl JobDispatcher for Supervisor {
    async fn dispatch(&self, group: ScalingGroup, plan: ScalePlan) {
        tracing::info!(
            group_id = %plan.group_id,
            launches = plan.launches.len(),
            deletes = plan.deletes.len(),
            "dispatching scale plan"
        );
        for job in plan.launches {
            tokio::spawn(run_launch_job(
                self.compute.clone(),
                self.load_balancers.clone(),
                self.poll.clone(),
                self.clock.clone(),
                group.clone(),
                job,
            ));
        }
        for job in plan.deletes {
            tokio::spawn(run_delete_job(
                self.compute.clone(),
                self.load_balancers.clone(),
                self.poll.clone(),
                group.clone(),
                job,
            ));
        }
    }
}

/// Run one launch to completion: on success the job id moves from
/// `pending` to `active` with the server's details; on failure the job
/// id is dropped so capacity reconverges on the next execution.
pub async fn run_launch_job(
    compute: Arc<dyn ComputeClient>,
    load_balancers: Arc<dyn LoadBalancerClient>,
    poll: PollSettings,
    clock: Arc<dyn Clock>,
    group: ScalingGroup,
    job: LaunchJob,
) {
    let launch = match group.view_launch_config().await {
        Ok(launch) => launch,
        Err(error) => {
            tracing::error!(job_id = %job.job_id, %error, "could not load launch config");
            settle_failed_launch(&group, &job.job_id).await;
            return;
        }
    };

    match launch_server(
        &compute,
        &load_balancers,
        &group.group_id,
        &launch,
        &poll.launch_timeouts(),
    )
    .await
    {
        Ok(launched) => {
            let now = clock.now();
            let job_id = job.job_id.clone();
            let result = group
                .modify_state(move |_, mut state| async move {
                    state.promote(
                        &job_id,
                        launched.server_id.clone(),
                        ServerEntry {
                            created_at: now,
                            ip_address: launched.ip_address.clone(),
                            lb_memberships: launched.lb_memberships.clone(),
                        },
                    );
                    Ok((state, ()))
                })
                .await;
            if let Err(error) = result {
                tracing::error!(job_id = %job.job_id, %error, "failed to record launched server");
            }
        }
        Err(error) => {
            tracing::error!(job_id = %job.job_id, %error, "launch job failed");
            settle_failed_launch(&group, &job.job_id).await;
        }
    }
}

async fn settle_failed_launch(group: &ScalingGroup, job_id: &str) {
    let job_id = job_id.to_owned();
    let result = group
        .modify_state(move |_, mut state| async move {
            state.remove_pending(&job_id);
            Ok((state, ()))
        })
        .await;
    if let Err(error) = result {
        tracing::error!(%error, "failed to drop pending job");
    }
}

/// Run one delete to completion, then make sure the server is no longer
/// tracked as active (a no-op for controller-planned deletes, which
/// already removed it).
pub async fn run_delete_job(
    compute: Arc<dyn ComputeClient>,
    load_balancers: Arc<dyn LoadBalancerClient>,
    poll: PollSettings,
    group: ScalingGroup,
    job: DeleteJob,
) {
    let result = delete::delete_server(
        compute.as_ref(),
        load_balancers.as_ref(),
        &job.server_id,
        &job.lb_memberships,
        poll.interval,
        poll.delete_timeout,
    )
    .await;
    match result {
        Ok(()) => {
            let server_id = job.server_id.clone();
            let settled = group
                .modify_state(move |_, mut state| async move {
                    state.remove_active(&server_id);
                    Ok((state, ()))
                })
                .await;
            if let Err(error) = settled {
                tracing::error!(server_id = %job.server_id, %error, "failed to settle delete");
            }
        }
        Err(error) => {
            tracing::error!(server_id = %job.server_id, %error, "delete job failed");
        }
    }
}
