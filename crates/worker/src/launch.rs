//! The launch pipeline: prepare the template, create the server, poll
//! until ACTIVE, attach to load balancers with compensating undo.

use std::sync::Arc;
use std::time::Duration;

use updraft_domain::{keys, Error, LaunchConfig, LbMembership, Result};

use crate::delete::verified_delete;
use crate::traits::{ComputeClient, LoadBalancerClient, ServerDetails};
use crate::undo::UndoStack;

/// Metadata key stamped on servers and LB specs so external tooling can
/// trace an instance back to its group.
pub const GROUP_ID_METADATA_KEY: &str = "rax:auto_scaling_group_id";
pub const SERVER_NAME_METADATA_KEY: &str = "rax:auto_scaling_server_name";

/// The outcome the worker settles into group state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedServer {
    pub server_id: String,
    pub ip_address: String,
    pub lb_memberships: Vec<LbMembership>,
}

/// Copy the launch config and stamp it for one concrete launch: group-id
/// metadata on server and LB specs, and a unique server name (the
/// configured name gets a random suffix; no name means the suffix alone).
pub fn prepare_launch_config(group_id: &str, launch: &LaunchConfig) -> LaunchConfig {
    let mut prepared = launch.clone();

    prepared
        .server
        .metadata
        .insert(GROUP_ID_METADATA_KEY.into(), group_id.to_owned());
    let server_name = match prepared.server.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{name}-{}", keys::server_name_token()),
        _ => keys::server_name_token(),
    };
    prepared.server.name = Some(server_name.clone());

    for lb in &mut prepared.load_balancers {
        lb.metadata
            .insert(GROUP_ID_METADATA_KEY.into(), group_id.to_owned());
        lb.metadata
            .insert(SERVER_NAME_METADATA_KEY.into(), server_name.clone());
    }
    prepared
}

/// Poll a server until it reaches ACTIVE.
///
/// BUILD keeps polling; any other status is terminal
/// (`UnexpectedServerStatus`) — a server does not come back from ERROR.
/// Transport errors and not-yet-visible reads keep polling; the overall
/// wall-clock timeout bounds everything.
pub async fn wait_for_active(
    compute: &dyn ComputeClient,
    server_id: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<ServerDetails> {
    tracing::debug!(server_id, interval_secs = interval.as_secs(), "polling for ACTIVE");
    let started = tokio::time::Instant::now();
    let deadline = started + timeout;

    loop {
        match compute.server_details(server_id).await {
            Ok(Some(server)) => match server.status.as_str() {
                "ACTIVE" => {
                    tracing::info!(
                        server_id,
                        time_building_secs = started.elapsed().as_secs(),
                        "server went from BUILD to ACTIVE"
                    );
                    return Ok(server);
                }
                "BUILD" => {}
                other => {
                    return Err(Error::UnexpectedServerStatus {
                        server_id: server_id.to_owned(),
                        status: other.to_owned(),
                        expected: "ACTIVE".to_owned(),
                    })
                }
            },
            Ok(None) => {
                tracing::debug!(server_id, "server not visible yet; polling again");
            }
            Err(error) => {
                tracing::debug!(server_id, %error, "transient error polling server");
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "waiting for server {server_id} to change from BUILD to ACTIVE"
            )));
        }
        tokio::time::sleep(interval).await;
    }
}

#[derive(Debug, Clone)]
pub struct LaunchTimeouts {
    pub interval: Duration,
    pub launch_timeout: Duration,
    pub delete_timeout: Duration,
}

/// Launch one server and attach it to every configured load balancer.
///
/// The undo stack starts with the server deletion itself and gains one
/// node-removal per successful attach, so a failure at any later step
/// leaves neither stray nodes nor a stray server behind.
pub async fn launch_server(
    compute: &Arc<dyn ComputeClient>,
    load_balancers: &Arc<dyn LoadBalancerClient>,
    group_id: &str,
    launch: &LaunchConfig,
    timeouts: &LaunchTimeouts,
) -> Result<LaunchedServer> {
    let prepared = prepare_launch_config(group_id, launch);
    let server_id = compute.create_server(&prepared.server).await?;
    tracing::info!(
        group_id,
        server_id = %server_id,
        server_name = prepared.server.name.as_deref().unwrap_or_default(),
        "server created"
    );

    let mut undo = UndoStack::new();
    {
        let compute = compute.clone();
        let server_id = server_id.clone();
        let interval = timeouts.interval;
        let delete_timeout = timeouts.delete_timeout;
        undo.push("delete server", move || {
            Box::pin(async move {
                verified_delete(compute.as_ref(), &server_id, interval, delete_timeout).await
            })
        });
    }

    let launched = attach_after_active(
        compute.as_ref(),
        load_balancers,
        &server_id,
        &prepared,
        timeouts,
        &mut undo,
    )
    .await;

    match launched {
        Ok(launched) => Ok(launched),
        Err(error) => {
            tracing::warn!(server_id = %server_id, %error, "launch failed; rewinding");
            undo.rewind().await;
            Err(error)
        }
    }
}

async fn attach_after_active(
    compute: &dyn ComputeClient,
    load_balancers: &Arc<dyn LoadBalancerClient>,
    server_id: &str,
    prepared: &LaunchConfig,
    timeouts: &LaunchTimeouts,
    undo: &mut UndoStack,
) -> Result<LaunchedServer> {
    let server = wait_for_active(compute, server_id, timeouts.interval, timeouts.launch_timeout)
        .await?;
    let ip_address = server
        .first_private_ipv4()
        .ok_or_else(|| Error::Validation(format!("server {server_id} has no private IPv4")))?
        .to_owned();

    let mut memberships = Vec::with_capacity(prepared.load_balancers.len());
    for spec in &prepared.load_balancers {
        let node_id = load_balancers
            .add_node(spec.load_balancer_id, &ip_address, spec.port)
            .await?;
        tracing::info!(
            server_id,
            lb_id = spec.load_balancer_id,
            node_id,
            "attached to load balancer"
        );
        memberships.push(LbMembership {
            load_balancer_id: spec.load_balancer_id,
            node_id,
        });

        let load_balancers = load_balancers.clone();
        let lb_id = spec.load_balancer_id;
        undo.push(format!("remove node {node_id} from lb {lb_id}"), move || {
            Box::pin(async move { load_balancers.remove_node(lb_id, node_id).await })
        });
    }

    Ok(LaunchedServer {
        server_id: server_id.to_owned(),
        ip_address,
        lb_memberships: memberships,
    })
}
