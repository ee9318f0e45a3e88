//! Tenant-level store operations and the scheduler's event feed.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use updraft_domain::config::LockConfig;
use updraft_domain::{
    keys, Clock, Error, GroupConfig, GroupState, LaunchConfig, Policy, Result, ScheduleEvent,
};

use crate::backend::{level, GroupRow, Mutation, Op, PolicyRow, Resource, StorageBackend};
use crate::codec;
use crate::group::{GroupManifest, PolicyRecord, ScalingGroup};
use crate::lock::LockService;

/// Resource name of the global scheduler lock.
pub const SCHEDULE_LOCK: &str = "schedule";

#[derive(Clone)]
pub struct ScalingStore {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    locks: LockService,
}

impl ScalingStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        lock_config: LockConfig,
    ) -> Self {
        let locks = LockService::new(backend.clone(), clock.clone(), lock_config);
        Self {
            backend,
            clock,
            locks,
        }
    }

    /// Facade over one group's rows. Cheap; does not touch the store.
    pub fn group(&self, tenant_id: &str, group_id: &str) -> ScalingGroup {
        ScalingGroup::new(
            tenant_id.to_owned(),
            group_id.to_owned(),
            self.backend.clone(),
            self.clock.clone(),
            self.locks.clone(),
        )
    }

    /// Create a group with its initial policies in one batch: the group
    /// row, every policy row, and schedule events for schedule policies.
    pub async fn create_group(
        &self,
        tenant_id: &str,
        config: GroupConfig,
        launch: LaunchConfig,
        policies: Vec<Policy>,
    ) -> Result<GroupManifest> {
        config.validate()?;
        for policy in &policies {
            policy.validate()?;
        }

        let group_id = keys::new_key();
        let now = self.clock.now();
        tracing::info!(tenant_id, group_id = %group_id, "creating scaling group");

        let state = GroupState::new(tenant_id, group_id.clone());
        let mut batch = vec![Mutation::UpsertGroup(GroupRow {
            tenant_id: tenant_id.to_owned(),
            group_id: group_id.clone(),
            group_config: Some(codec::encode(&config)?),
            launch_config: Some(codec::encode(&launch)?),
            active: Some(codec::encode(&state.active)?),
            pending: Some(codec::encode(&state.pending)?),
            group_touched: None,
            policy_touched: Some(codec::encode(&state.policy_touched)?),
            paused: Some(false),
            created_at: Some(now),
        })];

        let group = self.group(tenant_id, &group_id);
        let mut records = Vec::with_capacity(policies.len());
        for policy in policies {
            let policy_id = keys::new_key();
            batch.push(Mutation::UpsertPolicy(PolicyRow {
                tenant_id: tenant_id.to_owned(),
                group_id: group_id.clone(),
                policy_id: policy_id.clone(),
                data: Some(codec::encode(&policy)?),
            }));
            if let Some(event) = group.schedule_event_for(&policy_id, &policy, now)? {
                batch.push(Mutation::InsertEvent(event));
            }
            records.push(PolicyRecord {
                id: policy_id,
                policy,
            });
        }

        let consistency = crate::group::batch_consistency(&batch, Op::Create, Resource::Group);
        self.backend.apply(batch, consistency).await?;

        Ok(GroupManifest {
            id: group_id,
            group_config: config,
            launch_config: launch,
            policies: records,
            state,
        })
    }

    /// States of every group for a tenant, paginated. Resurrected rows
    /// are filtered out and queued for deletion without blocking the
    /// response.
    pub async fn list_group_states(
        &self,
        tenant_id: &str,
        limit: usize,
        marker: Option<&str>,
    ) -> Result<Vec<GroupState>> {
        let rows = self
            .backend
            .scan_groups(tenant_id, limit, marker, level(Op::List, Resource::Group))
            .await?;

        let (valid, resurrected): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|row| row.created_at.is_some());

        if !resurrected.is_empty() {
            tracing::warn!(
                tenant_id,
                count = resurrected.len(),
                "resurrected group rows observed; purging"
            );
            let batch = resurrected
                .into_iter()
                .map(|row| Mutation::DeleteGroup {
                    tenant_id: row.tenant_id,
                    group_id: row.group_id,
                })
                .collect();
            let _ = self
                .backend
                .apply(batch, level(Op::Delete, Resource::Group))
                .await;
        }

        valid
            .iter()
            .map(|row| self.group(tenant_id, &row.group_id).unmarshal_state_row(row))
            .collect()
    }

    /// Resolve a capability hash to its (tenant, group, policy) triple.
    pub async fn webhook_info_by_hash(&self, hash: &str) -> Result<(String, String, String)> {
        self.backend
            .lookup_webhook_key(hash, level(Op::List, Resource::Group))
            .await?
            .ok_or_else(|| Error::UnrecognizedCapability(hash.to_owned()))
    }

    /// Events due at or before `now`, oldest trigger first.
    pub async fn fetch_due_events(
        &self,
        now: DateTime<Utc>,
        size: usize,
    ) -> Result<Vec<ScheduleEvent>> {
        self.backend
            .fetch_due_events(now, size, level(Op::List, Resource::Event))
            .await
    }

    /// Post-processing for one scheduler pass: drop the rows of fired
    /// one-shot (and dead-policy) events, then insert fresh rows for
    /// cron events at their next trigger. Deletes go first because the
    /// trigger sits in the primary key — the new row never collides.
    pub async fn update_delete_events(
        &self,
        delete_policy_ids: Vec<String>,
        update_events: Vec<ScheduleEvent>,
    ) -> Result<()> {
        let mut deletes: Vec<Mutation> = delete_policy_ids
            .into_iter()
            .map(|policy_id| Mutation::DeleteEventsForPolicy { policy_id })
            .collect();
        deletes.extend(
            update_events
                .iter()
                .map(|event| Mutation::DeleteEventsForPolicy {
                    policy_id: event.policy_id.clone(),
                }),
        );
        if !deletes.is_empty() {
            self.backend
                .apply(deletes, level(Op::Delete, Resource::Event))
                .await?;
        }
        if !update_events.is_empty() {
            let inserts = update_events.into_iter().map(Mutation::InsertEvent).collect();
            self.backend
                .apply(inserts, level(Op::Update, Resource::Event))
                .await?;
        }
        Ok(())
    }

    /// Run `body` holding the global scheduler lock, zero retries: if
    /// another scheduler holds it, fail fast with `BusyLock` and let the
    /// caller skip this tick.
    pub async fn with_schedule_lock<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.locks.with_lock(SCHEDULE_LOCK, 0, body).await
    }
}
