//! In-memory `StorageBackend`.
//!
//! `BTreeMap` keys give the ascending primary-key order the real store
//! gets from its clustering order. Upserts merge column-wise, which is
//! what makes phantom (resurrected) rows representable: a state write
//! racing a group delete leaves a row with only the state columns set.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use updraft_domain::{Result, ScheduleEvent};

use crate::backend::{
    Consistency, GroupRow, LockRow, Mutation, PolicyRow, StorageBackend, WebhookRow,
};

#[derive(Default)]
struct Tables {
    groups: BTreeMap<(String, String), GroupRow>,
    policies: BTreeMap<(String, String, String), PolicyRow>,
    webhooks: BTreeMap<(String, String, String, String), WebhookRow>,
    /// Secondary index: webhook_key -> (tenant, group, policy).
    webhook_keys: BTreeMap<String, (String, String, String)>,
    /// Keyed by (trigger, policy_id): clustering order is trigger order.
    events: BTreeMap<(DateTime<Utc>, String), ScheduleEvent>,
    locks: BTreeMap<String, LockRow>,
}

#[derive(Default)]
pub struct MemBackend {
    inner: RwLock<Tables>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total schedule-event rows, for tests.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// All event rows for a policy id, for tests.
    pub async fn events_for_policy(&self, policy_id: &str) -> Vec<ScheduleEvent> {
        self.inner
            .read()
            .await
            .events
            .values()
            .filter(|e| e.policy_id == policy_id)
            .cloned()
            .collect()
    }
}

fn merge_group(existing: &mut GroupRow, new: GroupRow) {
    if new.group_config.is_some() {
        existing.group_config = new.group_config;
    }
    if new.launch_config.is_some() {
        existing.launch_config = new.launch_config;
    }
    if new.active.is_some() {
        existing.active = new.active;
    }
    if new.pending.is_some() {
        existing.pending = new.pending;
    }
    if new.group_touched.is_some() {
        existing.group_touched = new.group_touched;
    }
    if new.policy_touched.is_some() {
        existing.policy_touched = new.policy_touched;
    }
    if new.paused.is_some() {
        existing.paused = new.paused;
    }
    if new.created_at.is_some() {
        existing.created_at = new.created_at;
    }
}

fn merge_webhook(existing: &mut WebhookRow, new: WebhookRow) {
    if new.data.is_some() {
        existing.data = new.data;
    }
    if new.capability.is_some() {
        existing.capability = new.capability;
    }
    if new.webhook_key.is_some() {
        existing.webhook_key = new.webhook_key;
    }
}

impl Tables {
    fn apply_one(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::UpsertGroup(row) => {
                let key = (row.tenant_id.clone(), row.group_id.clone());
                match self.groups.get_mut(&key) {
                    Some(existing) => merge_group(existing, row),
                    None => {
                        self.groups.insert(key, row);
                    }
                }
            }
            Mutation::DeleteGroup {
                tenant_id,
                group_id,
            } => {
                self.groups.remove(&(tenant_id, group_id));
            }
            Mutation::UpsertPolicy(row) => {
                let key = (
                    row.tenant_id.clone(),
                    row.group_id.clone(),
                    row.policy_id.clone(),
                );
                match self.policies.get_mut(&key) {
                    Some(existing) => {
                        if row.data.is_some() {
                            existing.data = row.data;
                        }
                    }
                    None => {
                        self.policies.insert(key, row);
                    }
                }
            }
            Mutation::DeletePolicy {
                tenant_id,
                group_id,
                policy_id,
            } => {
                self.policies.remove(&(tenant_id, group_id, policy_id));
            }
            Mutation::DeletePoliciesInGroup {
                tenant_id,
                group_id,
            } => {
                self.policies
                    .retain(|(t, g, _), _| !(*t == tenant_id && *g == group_id));
            }
            Mutation::UpsertWebhook(row) => {
                let key = (
                    row.tenant_id.clone(),
                    row.group_id.clone(),
                    row.policy_id.clone(),
                    row.webhook_id.clone(),
                );
                if let Some(hash) = &row.webhook_key {
                    self.webhook_keys.insert(
                        hash.clone(),
                        (
                            row.tenant_id.clone(),
                            row.group_id.clone(),
                            row.policy_id.clone(),
                        ),
                    );
                }
                match self.webhooks.get_mut(&key) {
                    Some(existing) => merge_webhook(existing, row),
                    None => {
                        self.webhooks.insert(key, row);
                    }
                }
            }
            Mutation::DeleteWebhook {
                tenant_id,
                group_id,
                policy_id,
                webhook_id,
            } => {
                if let Some(row) = self
                    .webhooks
                    .remove(&(tenant_id, group_id, policy_id, webhook_id))
                {
                    if let Some(hash) = row.webhook_key {
                        self.webhook_keys.remove(&hash);
                    }
                }
            }
            Mutation::DeleteWebhooksInPolicy {
                tenant_id,
                group_id,
                policy_id,
            } => {
                self.remove_webhooks(|t, g, p| {
                    *t == tenant_id && *g == group_id && *p == policy_id
                });
            }
            Mutation::DeleteWebhooksInGroup {
                tenant_id,
                group_id,
            } => {
                self.remove_webhooks(|t, g, _| *t == tenant_id && *g == group_id);
            }
            Mutation::InsertEvent(event) => {
                self.events
                    .insert((event.trigger, event.policy_id.clone()), event);
            }
            Mutation::DeleteEventsForPolicy { policy_id } => {
                self.events.retain(|(_, p), _| *p != policy_id);
            }
        }
    }

    fn remove_webhooks(&mut self, matches: impl Fn(&String, &String, &String) -> bool) {
        let removed: Vec<String> = self
            .webhooks
            .iter()
            .filter(|((t, g, p, _), _)| matches(t, g, p))
            .filter_map(|(_, row)| row.webhook_key.clone())
            .collect();
        for hash in removed {
            self.webhook_keys.remove(&hash);
        }
        self.webhooks.retain(|(t, g, p, _), _| !matches(t, g, p));
    }
}

#[async_trait]
impl StorageBackend for MemBackend {
    async fn apply(&self, batch: Vec<Mutation>, _consistency: Consistency) -> Result<()> {
        let mut tables = self.inner.write().await;
        for mutation in batch {
            tables.apply_one(mutation);
        }
        Ok(())
    }

    async fn fetch_group(
        &self,
        tenant_id: &str,
        group_id: &str,
        _consistency: Consistency,
    ) -> Result<Option<GroupRow>> {
        Ok(self
            .inner
            .read()
            .await
            .groups
            .get(&(tenant_id.to_owned(), group_id.to_owned()))
            .cloned())
    }

    async fn scan_groups(
        &self,
        tenant_id: &str,
        limit: usize,
        marker: Option<&str>,
        _consistency: Consistency,
    ) -> Result<Vec<GroupRow>> {
        Ok(self
            .inner
            .read()
            .await
            .groups
            .range((tenant_id.to_owned(), String::new())..)
            .take_while(|((t, _), _)| t == tenant_id)
            .filter(|((_, g), _)| marker.is_none_or(|m| g.as_str() > m))
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn fetch_policy(
        &self,
        tenant_id: &str,
        group_id: &str,
        policy_id: &str,
        _consistency: Consistency,
    ) -> Result<Option<PolicyRow>> {
        Ok(self
            .inner
            .read()
            .await
            .policies
            .get(&(
                tenant_id.to_owned(),
                group_id.to_owned(),
                policy_id.to_owned(),
            ))
            .cloned())
    }

    async fn scan_policies(
        &self,
        tenant_id: &str,
        group_id: &str,
        limit: usize,
        marker: Option<&str>,
        _consistency: Consistency,
    ) -> Result<Vec<PolicyRow>> {
        Ok(self
            .inner
            .read()
            .await
            .policies
            .range((tenant_id.to_owned(), group_id.to_owned(), String::new())..)
            .take_while(|((t, g, _), _)| t == tenant_id && g == group_id)
            .filter(|((_, _, p), _)| marker.is_none_or(|m| p.as_str() > m))
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn fetch_webhook(
        &self,
        tenant_id: &str,
        group_id: &str,
        policy_id: &str,
        webhook_id: &str,
        _consistency: Consistency,
    ) -> Result<Option<WebhookRow>> {
        Ok(self
            .inner
            .read()
            .await
            .webhooks
            .get(&(
                tenant_id.to_owned(),
                group_id.to_owned(),
                policy_id.to_owned(),
                webhook_id.to_owned(),
            ))
            .cloned())
    }

    async fn scan_webhooks(
        &self,
        tenant_id: &str,
        group_id: &str,
        policy_id: &str,
        limit: usize,
        marker: Option<&str>,
        _consistency: Consistency,
    ) -> Result<Vec<WebhookRow>> {
        Ok(self
            .inner
            .read()
            .await
            .webhooks
            .range(
                (
                    tenant_id.to_owned(),
                    group_id.to_owned(),
                    policy_id.to_owned(),
                    String::new(),
                )..,
            )
            .take_while(|((t, g, p, _), _)| t == tenant_id && g == group_id && p == policy_id)
            .filter(|((_, _, _, w), _)| marker.is_none_or(|m| w.as_str() > m))
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn lookup_webhook_key(
        &self,
        webhook_key: &str,
        _consistency: Consistency,
    ) -> Result<Option<(String, String, String)>> {
        Ok(self
            .inner
            .read()
            .await
            .webhook_keys
            .get(webhook_key)
            .cloned())
    }

    async fn fetch_due_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        _consistency: Consistency,
    ) -> Result<Vec<ScheduleEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .values()
            .take_while(|e| e.trigger <= now)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_acquire_lock(
        &self,
        resource: &str,
        owner: &str,
        acquired_at: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut tables = self.inner.write().await;
        let claimable = match tables.locks.get(resource) {
            None => true,
            Some(held) => held.acquired_at + stale_after <= acquired_at,
        };
        if claimable {
            tables.locks.insert(
                resource.to_owned(),
                LockRow {
                    resource: resource.to_owned(),
                    owner: owner.to_owned(),
                    acquired_at,
                },
            );
        }
        Ok(claimable)
    }

    async fn release_lock(&self, resource: &str, owner: &str) -> Result<bool> {
        let mut tables = self.inner.write().await;
        if tables
            .locks
            .get(resource)
            .is_some_and(|row| row.owner == owner)
        {
            tables.locks.remove(resource);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::level;
    use crate::backend::{Op, Resource};
    use chrono::TimeZone;

    fn one() -> Consistency {
        level(Op::View, Resource::Group)
    }

    #[tokio::test]
    async fn upsert_merges_columns() {
        let backend = MemBackend::new();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        backend
            .apply(
                vec![Mutation::UpsertGroup(GroupRow {
                    tenant_id: "t1".into(),
                    group_id: "g1".into(),
                    group_config: Some("{}".into()),
                    created_at: Some(now),
                    ..Default::default()
                })],
                one(),
            )
            .await
            .unwrap();

        // A later write of just the state columns must not clobber the rest.
        backend
            .apply(
                vec![Mutation::UpsertGroup(GroupRow {
                    tenant_id: "t1".into(),
                    group_id: "g1".into(),
                    active: Some("{}".into()),
                    ..Default::default()
                })],
                one(),
            )
            .await
            .unwrap();

        let row = backend.fetch_group("t1", "g1", one()).await.unwrap().unwrap();
        assert_eq!(row.group_config.as_deref(), Some("{}"));
        assert_eq!(row.active.as_deref(), Some("{}"));
        assert_eq!(row.created_at, Some(now));
    }

    #[tokio::test]
    async fn upsert_after_delete_resurrects_partial_row() {
        let backend = MemBackend::new();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        backend
            .apply(
                vec![Mutation::UpsertGroup(GroupRow {
                    tenant_id: "t1".into(),
                    group_id: "g1".into(),
                    group_config: Some("{}".into()),
                    created_at: Some(now),
                    ..Default::default()
                })],
                one(),
            )
            .await
            .unwrap();
        backend
            .apply(
                vec![Mutation::DeleteGroup {
                    tenant_id: "t1".into(),
                    group_id: "g1".into(),
                }],
                one(),
            )
            .await
            .unwrap();
        backend
            .apply(
                vec![Mutation::UpsertGroup(GroupRow {
                    tenant_id: "t1".into(),
                    group_id: "g1".into(),
                    active: Some("{}".into()),
                    ..Default::default()
                })],
                one(),
            )
            .await
            .unwrap();

        let row = backend.fetch_group("t1", "g1", one()).await.unwrap().unwrap();
        assert!(row.created_at.is_none(), "resurrected row has no created_at");
        assert!(row.group_config.is_none());
    }

    #[tokio::test]
    async fn scans_are_marker_paginated_in_key_order() {
        let backend = MemBackend::new();
        for id in ["g3", "g1", "g2"] {
            backend
                .apply(
                    vec![Mutation::UpsertGroup(GroupRow {
                        tenant_id: "t1".into(),
                        group_id: id.into(),
                        ..Default::default()
                    })],
                    one(),
                )
                .await
                .unwrap();
        }

        let page = backend.scan_groups("t1", 2, None, one()).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|r| r.group_id.as_str()).collect();
        assert_eq!(ids, vec!["g1", "g2"]);

        let rest = backend
            .scan_groups("t1", 2, Some("g2"), one())
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].group_id, "g3");
    }

    #[tokio::test]
    async fn due_events_are_oldest_first_and_limited() {
        let backend = MemBackend::new();
        let base = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        for (policy, offset) in [("p2", 2), ("p1", 1), ("p3", 3)] {
            backend
                .apply(
                    vec![Mutation::InsertEvent(ScheduleEvent {
                        tenant_id: "t1".into(),
                        group_id: "g1".into(),
                        policy_id: policy.into(),
                        trigger: base + Duration::minutes(offset),
                        cron: None,
                    })],
                    Consistency::Quorum,
                )
                .await
                .unwrap();
        }

        let due = backend
            .fetch_due_events(base + Duration::minutes(2), 10, Consistency::Quorum)
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|e| e.policy_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);

        let capped = backend
            .fetch_due_events(base + Duration::minutes(3), 1, Consistency::Quorum)
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].policy_id, "p1");
    }

    #[tokio::test]
    async fn lock_claim_respects_holder_until_stale() {
        let backend = MemBackend::new();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let stale = Duration::seconds(300);

        assert!(backend
            .try_acquire_lock("g1", "owner-a", now, stale)
            .await
            .unwrap());
        assert!(!backend
            .try_acquire_lock("g1", "owner-b", now + Duration::seconds(10), stale)
            .await
            .unwrap());
        // Past the stale threshold the claim succeeds.
        assert!(backend
            .try_acquire_lock("g1", "owner-b", now + Duration::seconds(301), stale)
            .await
            .unwrap());

        // owner-a's release is now a no-op; owner-b's works.
        assert!(!backend.release_lock("g1", "owner-a").await.unwrap());
        assert!(backend.release_lock("g1", "owner-b").await.unwrap());
    }

    #[tokio::test]
    async fn webhook_index_follows_row_lifecycle() {
        let backend = MemBackend::new();
        backend
            .apply(
                vec![Mutation::UpsertWebhook(WebhookRow {
                    tenant_id: "t1".into(),
                    group_id: "g1".into(),
                    policy_id: "p1".into(),
                    webhook_id: "w1".into(),
                    data: Some("{}".into()),
                    capability: Some("{}".into()),
                    webhook_key: Some("hash-1".into()),
                })],
                one(),
            )
            .await
            .unwrap();

        assert_eq!(
            backend.lookup_webhook_key("hash-1", one()).await.unwrap(),
            Some(("t1".into(), "g1".into(), "p1".into()))
        );

        backend
            .apply(
                vec![Mutation::DeleteWebhooksInPolicy {
                    tenant_id: "t1".into(),
                    group_id: "g1".into(),
                    policy_id: "p1".into(),
                }],
                one(),
            )
            .await
            .unwrap();
        assert_eq!(backend.lookup_webhook_key("hash-1", one()).await.unwrap(), None);
    }
}
