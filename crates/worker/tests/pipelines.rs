//! Launch/delete pipeline tests against scripted fake clients, on
//! virtual time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use updraft_domain::config::LockConfig;
use updraft_domain::{
    Error, GroupConfig, LaunchConfig, LbMembership, LoadBalancerSpec, ManualClock, Result,
    ServerEntry, ServerTemplate, SystemClock,
};
use updraft_engine::{DeleteJob, LaunchJob};
use updraft_store::{MemBackend, ScalingStore};
use updraft_worker::supervisor::{run_delete_job, run_launch_job, PollSettings};
use updraft_worker::{
    launch_server, wait_for_active, Address, ComputeClient, LoadBalancerClient, ServerDetails,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fakes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scripted compute API. `statuses` is consumed one entry per details
/// poll; once exhausted every poll reports ACTIVE.
#[derive(Default)]
struct FakeCompute {
    statuses: Mutex<VecDeque<&'static str>>,
    alive: Mutex<HashSet<String>>,
    created: Mutex<Vec<ServerTemplate>>,
    deleted: Mutex<Vec<String>>,
    next_id: Mutex<u32>,
    /// When set, delete requests are accepted but the server never
    /// actually goes away (the "compute failed to delete" case).
    sticky: Mutex<bool>,
}

impl FakeCompute {
    fn with_statuses(statuses: &[&'static str]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ComputeClient for FakeCompute {
    async fn create_server(&self, template: &ServerTemplate) -> Result<String> {
        let mut next = self.next_id.lock();
        *next += 1;
        let id = format!("srv-{}", *next);
        self.alive.lock().insert(id.clone());
        self.created.lock().push(template.clone());
        Ok(id)
    }

    async fn server_details(&self, server_id: &str) -> Result<Option<ServerDetails>> {
        if !self.alive.lock().contains(server_id) {
            return Ok(None);
        }
        let status = self.statuses.lock().pop_front().unwrap_or("ACTIVE");
        Ok(Some(ServerDetails {
            id: server_id.to_owned(),
            status: status.to_owned(),
            addresses: HashMap::from([(
                "private".to_owned(),
                vec![Address {
                    version: 4,
                    addr: "10.0.0.5".to_owned(),
                }],
            )]),
        }))
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        self.deleted.lock().push(server_id.to_owned());
        if !*self.sticky.lock() {
            self.alive.lock().remove(server_id);
        }
        Ok(())
    }
}

/// Scripted load balancer. `attach_failures` is consumed one entry per
/// add_node call; `true` fails that attach with a 500.
#[derive(Default)]
struct FakeLoadBalancer {
    attach_failures: Mutex<VecDeque<bool>>,
    nodes: Mutex<Vec<(u64, u64)>>,
    next_node: Mutex<u64>,
}

impl FakeLoadBalancer {
    fn failing_on(calls: &[bool]) -> Self {
        Self {
            attach_failures: Mutex::new(calls.iter().copied().collect()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LoadBalancerClient for FakeLoadBalancer {
    async fn add_node(&self, lb_id: u64, _address: &str, _port: u16) -> Result<u64> {
        if self.attach_failures.lock().pop_front().unwrap_or(false) {
            return Err(Error::UnexpectedResponse {
                url: format!("fake://loadbalancers/{lb_id}/nodes"),
                status: 500,
            });
        }
        let mut next = self.next_node.lock();
        *next += 1;
        self.nodes.lock().push((lb_id, *next));
        Ok(*next)
    }

    async fn remove_node(&self, lb_id: u64, node_id: u64) -> Result<()> {
        self.nodes.lock().retain(|n| *n != (lb_id, node_id));
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn poll() -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(1),
        launch_timeout: Duration::from_secs(60),
        delete_timeout: Duration::from_secs(60),
    }
}

fn two_lb_launch_config() -> LaunchConfig {
    LaunchConfig {
        server: ServerTemplate {
            name: Some("web".into()),
            metadata: HashMap::new(),
            extra: serde_json::Map::new(),
        },
        load_balancers: vec![
            LoadBalancerSpec {
                load_balancer_id: 100,
                port: 80,
                metadata: HashMap::new(),
            },
            LoadBalancerSpec {
                load_balancer_id: 200,
                port: 8080,
                metadata: HashMap::new(),
            },
        ],
    }
}

async fn seeded_group(launch: LaunchConfig) -> (ScalingStore, String) {
    let store = ScalingStore::new(
        Arc::new(MemBackend::new()),
        Arc::new(SystemClock),
        LockConfig::default(),
    );
    let created = store
        .create_group(
            "t1",
            GroupConfig {
                name: "workers".into(),
                cooldown: 0,
                min_entities: 0,
                max_entities: 10,
                metadata: HashMap::new(),
            },
            launch,
            vec![],
        )
        .await
        .unwrap();
    (store, created.id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// wait_for_active
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn polls_through_build_to_active() {
    let compute = FakeCompute::with_statuses(&["BUILD", "BUILD", "ACTIVE"]);
    let id = compute.create_server(&ServerTemplate::default()).await.unwrap();

    let server = wait_for_active(
        &compute,
        &id,
        Duration::from_secs(5),
        Duration::from_secs(3600),
    )
    .await
    .unwrap();
    assert_eq!(server.status, "ACTIVE");
    assert!(compute.statuses.lock().is_empty(), "consumed all three polls");
}

#[tokio::test(start_paused = true)]
async fn non_build_status_is_terminal() {
    let compute = FakeCompute::with_statuses(&["BUILD", "ERROR"]);
    let id = compute.create_server(&ServerTemplate::default()).await.unwrap();

    let err = wait_for_active(
        &compute,
        &id,
        Duration::from_secs(5),
        Duration::from_secs(3600),
    )
    .await
    .unwrap_err();
    match err {
        Error::UnexpectedServerStatus {
            status, expected, ..
        } => {
            assert_eq!(status, "ERROR");
            assert_eq!(expected, "ACTIVE");
        }
        other => panic!("expected UnexpectedServerStatus, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn forever_building_server_times_out() {
    let compute = FakeCompute {
        statuses: Mutex::new(std::iter::repeat("BUILD").take(10_000).collect()),
        ..Default::default()
    };
    let id = compute.create_server(&ServerTemplate::default()).await.unwrap();

    let err = wait_for_active(
        &compute,
        &id,
        Duration::from_secs(5),
        Duration::from_secs(30),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// launch_server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn launch_attaches_to_every_balancer_in_order() {
    let compute: Arc<dyn ComputeClient> = Arc::new(FakeCompute::with_statuses(&["BUILD", "ACTIVE"]));
    let fake_lb = Arc::new(FakeLoadBalancer::default());
    let lb: Arc<dyn LoadBalancerClient> = fake_lb.clone();

    let launched = launch_server(
        &compute,
        &lb,
        "group-1",
        &two_lb_launch_config(),
        &updraft_worker::launch::LaunchTimeouts {
            interval: Duration::from_secs(1),
            launch_timeout: Duration::from_secs(60),
            delete_timeout: Duration::from_secs(60),
        },
    )
    .await
    .unwrap();

    assert_eq!(launched.ip_address, "10.0.0.5");
    assert_eq!(
        launched.lb_memberships,
        vec![
            LbMembership {
                load_balancer_id: 100,
                node_id: 1
            },
            LbMembership {
                load_balancer_id: 200,
                node_id: 2
            },
        ]
    );
    assert_eq!(*fake_lb.nodes.lock(), vec![(100, 1), (200, 2)]);
}

#[tokio::test(start_paused = true)]
async fn second_attach_failure_unwinds_first_node_and_server() {
    let fake_compute = Arc::new(FakeCompute::default());
    let compute: Arc<dyn ComputeClient> = fake_compute.clone();
    let fake_lb = Arc::new(FakeLoadBalancer::failing_on(&[false, true]));
    let lb: Arc<dyn LoadBalancerClient> = fake_lb.clone();

    let err = launch_server(
        &compute,
        &lb,
        "group-1",
        &two_lb_launch_config(),
        &updraft_worker::launch::LaunchTimeouts {
            interval: Duration::from_secs(1),
            launch_timeout: Duration::from_secs(60),
            delete_timeout: Duration::from_secs(60),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::UnexpectedResponse { status: 500, .. }));

    // The first node was detached and the server torn down.
    assert!(fake_lb.nodes.lock().is_empty());
    assert_eq!(*fake_compute.deleted.lock(), vec!["srv-1"]);
    assert!(fake_compute.alive.lock().is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Full jobs settling into group state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn successful_launch_job_promotes_pending_to_active() {
    let (store, group_id) = seeded_group(two_lb_launch_config()).await;
    let group = store.group("t1", &group_id);
    group
        .modify_state(|_, mut state| async move {
            state.add_pending("job-1", Utc::now());
            Ok((state, ()))
        })
        .await
        .unwrap();

    let compute: Arc<dyn ComputeClient> = Arc::new(FakeCompute::with_statuses(&["BUILD", "ACTIVE"]));
    let lb: Arc<dyn LoadBalancerClient> = Arc::new(FakeLoadBalancer::default());
    run_launch_job(
        compute,
        lb,
        poll(),
        Arc::new(SystemClock),
        group.clone(),
        LaunchJob {
            job_id: "job-1".into(),
        },
    )
    .await;

    let state = group.view_state().await.unwrap();
    assert!(state.pending.is_empty());
    assert_eq!(state.active.len(), 1);
    let entry = state.active.get("srv-1").unwrap();
    assert_eq!(entry.ip_address, "10.0.0.5");
    assert_eq!(entry.lb_memberships.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_launch_job_drops_the_pending_entry() {
    let (store, group_id) = seeded_group(two_lb_launch_config()).await;
    let group = store.group("t1", &group_id);
    group
        .modify_state(|_, mut state| async move {
            state.add_pending("job-1", Utc::now());
            Ok((state, ()))
        })
        .await
        .unwrap();

    let compute: Arc<dyn ComputeClient> = Arc::new(FakeCompute::default());
    let lb: Arc<dyn LoadBalancerClient> = Arc::new(FakeLoadBalancer::failing_on(&[false, true]));
    run_launch_job(
        compute,
        lb,
        poll(),
        Arc::new(SystemClock),
        group.clone(),
        LaunchJob {
            job_id: "job-1".into(),
        },
    )
    .await;

    let state = group.view_state().await.unwrap();
    assert!(state.pending.is_empty(), "no pending job left behind");
    assert!(state.active.is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_job_deregisters_nodes_then_verifies_deletion() {
    let (store, group_id) = seeded_group(two_lb_launch_config()).await;
    let group = store.group("t1", &group_id);

    let fake_compute = Arc::new(FakeCompute::default());
    let fake_lb = Arc::new(FakeLoadBalancer::default());
    // Seed one attached server, as a finished launch would have.
    let server_id = fake_compute
        .create_server(&ServerTemplate::default())
        .await
        .unwrap();
    fake_lb.add_node(100, "10.0.0.5", 80).await.unwrap();
    fake_lb.add_node(200, "10.0.0.5", 8080).await.unwrap();
    let memberships = vec![
        LbMembership {
            load_balancer_id: 100,
            node_id: 1,
        },
        LbMembership {
            load_balancer_id: 200,
            node_id: 2,
        },
    ];
    let created_at = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
    let seed_id = server_id.clone();
    let seed_memberships = memberships.clone();
    group
        .modify_state(move |_, mut state| async move {
            state.active.insert(
                seed_id,
                ServerEntry {
                    created_at,
                    ip_address: "10.0.0.5".into(),
                    lb_memberships: seed_memberships,
                },
            );
            Ok((state, ()))
        })
        .await
        .unwrap();

    run_delete_job(
        fake_compute.clone(),
        fake_lb.clone(),
        poll(),
        group.clone(),
        DeleteJob {
            server_id: server_id.clone(),
            lb_memberships: memberships,
        },
    )
    .await;

    assert!(fake_lb.nodes.lock().is_empty(), "both nodes deregistered");
    assert_eq!(*fake_compute.deleted.lock(), vec![server_id.clone()]);
    let state = group.view_state().await.unwrap();
    assert!(state.active.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unverifiable_delete_is_logged_but_treated_as_gone() {
    let fake_compute = FakeCompute::default();
    *fake_compute.sticky.lock() = true;
    let id = fake_compute
        .create_server(&ServerTemplate::default())
        .await
        .unwrap();

    // Times out polling for the 404 but still reports success.
    updraft_worker::delete::verified_delete(
        &fake_compute,
        &id,
        Duration::from_secs(1),
        Duration::from_secs(10),
    )
    .await
    .unwrap();
    assert_eq!(*fake_compute.deleted.lock(), vec![id.clone()]);
    assert!(fake_compute.alive.lock().contains(&id), "server never went away");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// End to end: policy execution through the supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn scale_up_converges_pending_into_active() {
    use updraft_domain::{Adjustment, Policy, PolicyKind};
    use updraft_engine::execute_policy;
    use updraft_worker::Supervisor;

    let backend = Arc::new(MemBackend::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap(),
    ));
    let store = ScalingStore::new(backend, clock.clone(), LockConfig::default());
    let created = store
        .create_group(
            "t1",
            GroupConfig {
                name: "workers".into(),
                cooldown: 0,
                min_entities: 1,
                max_entities: 3,
                metadata: HashMap::new(),
            },
            two_lb_launch_config(),
            vec![Policy {
                name: "up".into(),
                cooldown: 0,
                kind: PolicyKind::Webhook,
                adjustment: Adjustment::Change { change: 2 },
                args: None,
            }],
        )
        .await
        .unwrap();

    let compute: Arc<dyn ComputeClient> = Arc::new(FakeCompute::default());
    let lb: Arc<dyn LoadBalancerClient> = Arc::new(FakeLoadBalancer::default());
    let supervisor = Supervisor::new(compute, lb, poll(), clock.clone());

    execute_policy(
        &store,
        &supervisor,
        clock.as_ref(),
        "t1",
        &created.id,
        &created.policies[0].id,
    )
    .await
    .unwrap();

    let group = store.group("t1", &created.id);

    // Let the spawned launch jobs run to completion on virtual time.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let state = group.view_state().await.unwrap();
    assert!(state.pending.is_empty());
    assert_eq!(state.active.len(), 2);
}
