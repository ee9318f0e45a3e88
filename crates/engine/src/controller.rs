//! The controller: given a policy and the group's current state, decide
//! the new desired capacity and the concrete servers to launch or
//! destroy.

use chrono::{DateTime, Duration, Utc};

use updraft_domain::{
    keys, Adjustment, CannotExecuteReason, Error, GroupConfig, GroupState, Policy, Result,
};
use updraft_store::ScalingGroup;

use crate::dispatch::{DeleteJob, LaunchJob, ScalePlan};

/// Refuse execution while either cooldown window is still open.
fn check_cooldowns(
    config: &GroupConfig,
    policy: &Policy,
    policy_id: &str,
    state: &GroupState,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(touched) = state.policy_touched.get(policy_id) {
        if now - *touched < Duration::seconds(i64::from(policy.cooldown)) {
            return Err(Error::CannotExecutePolicy(
                CannotExecuteReason::PolicyCooldown,
            ));
        }
    }
    if let Some(touched) = state.group_touched {
        if now - touched < Duration::seconds(i64::from(config.cooldown)) {
            return Err(Error::CannotExecutePolicy(CannotExecuteReason::GroupCooldown));
        }
    }
    Ok(())
}

/// The desired capacity after applying `adjustment` to `current`,
/// clamped into the configured bounds. Percent deltas truncate toward
/// zero for both signs.
fn compute_target(current: usize, adjustment: &Adjustment, config: &GroupConfig) -> usize {
    let current = current as i64;
    let raw = match adjustment {
        Adjustment::Change { change } => current + change,
        Adjustment::ChangePercent { change_percent } => {
            let delta = (current as f64 * change_percent / 100.0).trunc() as i64;
            current + delta
        }
        Adjustment::DesiredCapacity { desired_capacity } => i64::from(*desired_capacity),
    };
    raw.clamp(i64::from(config.min_entities), i64::from(config.max_entities)) as usize
}

/// Pure core of a policy execution: cooldown gates, target computation,
/// and job selection, producing the updated state plus the scale plan.
pub fn apply_policy(
    config: &GroupConfig,
    policy: &Policy,
    policy_id: &str,
    mut state: GroupState,
    now: DateTime<Utc>,
) -> Result<(GroupState, ScalePlan)> {
    if state.paused {
        return Err(Error::CannotExecutePolicy(CannotExecuteReason::Paused));
    }
    check_cooldowns(config, policy, policy_id, &state, now)?;

    let current = state.desired_total();
    let target = compute_target(current, &policy.adjustment, config);
    if target == current {
        return Err(Error::CannotExecutePolicy(CannotExecuteReason::AtLimit));
    }

    let mut plan = ScalePlan::empty(state.tenant_id.clone(), state.group_id.clone());
    if target > current {
        for _ in 0..(target - current) {
            let job_id = keys::new_key();
            state.add_pending(job_id.clone(), now);
            plan.launches.push(LaunchJob { job_id });
        }
    } else {
        // Oldest servers go first; ties break on lexicographic id.
        let victims = state.active_oldest_first();
        for (server_id, entry) in victims.into_iter().take(current - target) {
            state.remove_active(&server_id);
            plan.deletes.push(DeleteJob {
                server_id,
                lb_memberships: entry.lb_memberships,
            });
        }
    }

    state.group_touched = Some(now);
    state.policy_touched.insert(policy_id.to_owned(), now);
    Ok((state, plan))
}

/// Converge capacity onto the configured bounds without any policy:
/// used right after group creation (to reach `min_entities`) and after
/// a config update narrows the bounds. No cooldown gates and no
/// touched-timestamp updates — this is reconciliation, not an
/// execution.
pub fn plan_convergence(
    config: &GroupConfig,
    mut state: GroupState,
    now: DateTime<Utc>,
) -> (GroupState, ScalePlan) {
    let current = state.desired_total() as i64;
    let target =
        current.clamp(i64::from(config.min_entities), i64::from(config.max_entities)) as usize;
    let current = current as usize;

    let mut plan = ScalePlan::empty(state.tenant_id.clone(), state.group_id.clone());
    if target > current {
        for _ in 0..(target - current) {
            let job_id = keys::new_key();
            state.add_pending(job_id.clone(), now);
            plan.launches.push(LaunchJob { job_id });
        }
    } else if target < current {
        let victims = state.active_oldest_first();
        for (server_id, entry) in victims.into_iter().take(current - target) {
            state.remove_active(&server_id);
            plan.deletes.push(DeleteJob {
                server_id,
                lb_memberships: entry.lb_memberships,
            });
        }
    }
    (state, plan)
}

/// A full policy execution step, composed with `modify_state`: loads the
/// policy and group config, then runs the pure core. The returned plan
/// must only be dispatched after the state write commits.
pub async fn maybe_execute_scaling_policy(
    group: &ScalingGroup,
    state: GroupState,
    policy_id: &str,
    now: DateTime<Utc>,
) -> Result<(GroupState, ScalePlan)> {
    let policy = group.get_policy(policy_id).await?;
    let config = group.view_config().await?;
    apply_policy(&config, &policy, policy_id, state, now)
}
