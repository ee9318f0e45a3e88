//! The delete pipeline: deregister load-balancer nodes, then delete the
//! server and verify it is actually gone.

use std::time::Duration;

use futures_util::future::join_all;

use updraft_domain::{LbMembership, Result};

use crate::traits::{ComputeClient, LoadBalancerClient};

/// Remove every membership in parallel. Nodes that are already gone are
/// fine (the client treats 404 as success); any other failure aborts
/// the server delete so a membership is never silently leaked.
pub async fn remove_from_load_balancers(
    load_balancers: &dyn LoadBalancerClient,
    memberships: &[LbMembership],
) -> Result<()> {
    let results = join_all(
        memberships
            .iter()
            .map(|m| load_balancers.remove_node(m.load_balancer_id, m.node_id)),
    )
    .await;

    for (membership, result) in memberships.iter().zip(results) {
        if let Err(error) = result {
            tracing::error!(
                lb_id = membership.load_balancer_id,
                node_id = membership.node_id,
                %error,
                "failed to remove load balancer node"
            );
            return Err(error);
        }
    }
    Ok(())
}

/// Delete a server and poll until the API confirms it is gone (404).
///
/// Compute occasionally fails to actually delete; polling catches that.
/// On timeout the failure is logged but the server is treated as
/// logically gone — the control plane stops tracking it either way.
pub async fn verified_delete(
    compute: &dyn ComputeClient,
    server_id: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    tracing::info!(server_id, "deleting server");
    compute.delete_server(server_id).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match compute.server_details(server_id).await {
            Ok(None) => {
                tracing::info!(server_id, "server deletion verified");
                return Ok(());
            }
            Ok(Some(_)) => {}
            Err(error) => {
                tracing::debug!(server_id, %error, "transient error verifying delete");
            }
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::error!(server_id, "server deletion could not be verified in time");
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

/// Full teardown of one server: nodes first, then the verified delete.
pub async fn delete_server(
    compute: &dyn ComputeClient,
    load_balancers: &dyn LoadBalancerClient,
    server_id: &str,
    memberships: &[LbMembership],
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    if !memberships.is_empty() {
        remove_from_load_balancers(load_balancers, memberships).await?;
    }
    verified_delete(compute, server_id, interval, timeout).await
}
