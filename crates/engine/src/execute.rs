//! Entry points for policy execution: direct API calls, anonymous
//! capability URLs, and the scheduler all funnel through here.

use updraft_domain::{Clock, Result};
use updraft_store::ScalingStore;

use crate::controller::{maybe_execute_scaling_policy, plan_convergence};
use crate::dispatch::JobDispatcher;

/// Execute one policy under the group's modify-state protocol and hand
/// the resulting plan to the worker. The dispatch happens strictly
/// after the state write commits, so a crash in between leaves pending
/// jobs for reconciliation rather than untracked servers.
pub async fn execute_policy(
    store: &ScalingStore,
    dispatcher: &dyn JobDispatcher,
    clock: &dyn Clock,
    tenant_id: &str,
    group_id: &str,
    policy_id: &str,
) -> Result<()> {
    let group = store.group(tenant_id, group_id);
    let now = clock.now();
    let policy_id = policy_id.to_owned();
    tracing::info!(tenant_id, group_id, policy_id = %policy_id, "executing policy");

    let plan = group
        .modify_state(move |group, state| async move {
            maybe_execute_scaling_policy(&group, state, &policy_id, now).await
        })
        .await?;

    if !plan.is_empty() {
        dispatcher.dispatch(group, plan).await;
    }
    Ok(())
}

/// Reconcile a group's capacity with its configured bounds. Called
/// after group creation (to launch up to `min_entities`) and after a
/// config update changes the bounds.
pub async fn converge_group(
    store: &ScalingStore,
    dispatcher: &dyn JobDispatcher,
    clock: &dyn Clock,
    tenant_id: &str,
    group_id: &str,
) -> Result<()> {
    let group = store.group(tenant_id, group_id);
    let now = clock.now();

    let plan = group
        .modify_state(move |group, state| async move {
            let config = group.view_config().await?;
            Ok(plan_convergence(&config, state, now))
        })
        .await?;

    if !plan.is_empty() {
        tracing::info!(tenant_id, group_id, "converging group to configured bounds");
        dispatcher.dispatch(group, plan).await;
    }
    Ok(())
}

/// Execute the policy behind a capability hash. The hash is the whole
/// credential: an unknown hash is indistinguishable from a deleted one.
pub async fn execute_webhook_by_hash(
    store: &ScalingStore,
    dispatcher: &dyn JobDispatcher,
    clock: &dyn Clock,
    capability_hash: &str,
) -> Result<()> {
    let (tenant_id, group_id, policy_id) = store.webhook_info_by_hash(capability_hash).await?;
    execute_policy(store, dispatcher, clock, &tenant_id, &group_id, &policy_id).await
}
