//! The wide-column storage seam.
//!
//! `StorageBackend` models exactly what the database offers and nothing
//! more: blind upserts that merge provided columns into whatever row
//! exists (creating one if none does), point fetches that may return
//! partial rows, scans in clustering order, and atomic multi-mutation
//! batches. Existence checks, resurrection handling, and the
//! read-before-write discipline all live a layer up, where the database
//! cannot help with them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use updraft_domain::{Result, ScheduleEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consistency levels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    One,
    Quorum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    List,
    View,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Group,
    /// Group projections: config, launch config, state columns.
    Partial,
    Policy,
    Webhook,
    Event,
}

/// Consistency for a given operation. Schedule events run at quorum so
/// that a scheduler on one coordinator sees events written through
/// another; everything else takes the weakest level that preserves
/// read-your-writes on a single coordinator.
pub fn level(_op: Op, resource: Resource) -> Consistency {
    match resource {
        Resource::Event => Consistency::Quorum,
        _ => Consistency::One,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One row of `scaling_group`. Every non-key column is optional: an
/// upsert writes only the columns it carries, so a row racing a delete
/// can exist with any subset (the resurrection case — detectable by a
/// missing `created_at`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupRow {
    pub tenant_id: String,
    pub group_id: String,
    /// `_ver`-framed JSON columns.
    pub group_config: Option<String>,
    pub launch_config: Option<String>,
    pub active: Option<String>,
    pub pending: Option<String>,
    pub group_touched: Option<DateTime<Utc>>,
    pub policy_touched: Option<String>,
    pub paused: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

/// One row of `scaling_policies`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyRow {
    pub tenant_id: String,
    pub group_id: String,
    pub policy_id: String,
    pub data: Option<String>,
}

/// One row of `policy_webhooks`. `webhook_key` is duplicated out of the
/// capability column because the hash index is built on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookRow {
    pub tenant_id: String,
    pub group_id: String,
    pub policy_id: String,
    pub webhook_id: String,
    pub data: Option<String>,
    pub capability: Option<String>,
    pub webhook_key: Option<String>,
}

/// One row of `locks`.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRow {
    pub resource: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mutations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single write in a batch. Upserts merge the columns they carry into
/// the existing row; deletes are unconditional.
#[derive(Debug, Clone)]
pub enum Mutation {
    UpsertGroup(GroupRow),
    DeleteGroup {
        tenant_id: String,
        group_id: String,
    },
    UpsertPolicy(PolicyRow),
    DeletePolicy {
        tenant_id: String,
        group_id: String,
        policy_id: String,
    },
    DeletePoliciesInGroup {
        tenant_id: String,
        group_id: String,
    },
    UpsertWebhook(WebhookRow),
    DeleteWebhook {
        tenant_id: String,
        group_id: String,
        policy_id: String,
        webhook_id: String,
    },
    DeleteWebhooksInPolicy {
        tenant_id: String,
        group_id: String,
        policy_id: String,
    },
    DeleteWebhooksInGroup {
        tenant_id: String,
        group_id: String,
    },
    InsertEvent(ScheduleEvent),
    /// Events are keyed by (trigger, policy_id); deleting "the event for
    /// a policy" removes every trigger row for that policy id.
    DeleteEventsForPolicy {
        policy_id: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The raw database operations. The in-memory implementation backs the
/// test suite and single-node deployments; a wide-column driver would
/// implement the same trait (locks via lightweight transactions).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Apply all mutations as one atomic batch.
    async fn apply(&self, batch: Vec<Mutation>, consistency: Consistency) -> Result<()>;

    async fn fetch_group(
        &self,
        tenant_id: &str,
        group_id: &str,
        consistency: Consistency,
    ) -> Result<Option<GroupRow>>;

    /// Groups for a tenant in ascending `group_id` order, starting after
    /// `marker`, at most `limit`.
    async fn scan_groups(
        &self,
        tenant_id: &str,
        limit: usize,
        marker: Option<&str>,
        consistency: Consistency,
    ) -> Result<Vec<GroupRow>>;

    async fn fetch_policy(
        &self,
        tenant_id: &str,
        group_id: &str,
        policy_id: &str,
        consistency: Consistency,
    ) -> Result<Option<PolicyRow>>;

    async fn scan_policies(
        &self,
        tenant_id: &str,
        group_id: &str,
        limit: usize,
        marker: Option<&str>,
        consistency: Consistency,
    ) -> Result<Vec<PolicyRow>>;

    async fn fetch_webhook(
        &self,
        tenant_id: &str,
        group_id: &str,
        policy_id: &str,
        webhook_id: &str,
        consistency: Consistency,
    ) -> Result<Option<WebhookRow>>;

    async fn scan_webhooks(
        &self,
        tenant_id: &str,
        group_id: &str,
        policy_id: &str,
        limit: usize,
        marker: Option<&str>,
        consistency: Consistency,
    ) -> Result<Vec<WebhookRow>>;

    /// Resolve a capability hash through the `webhook_key` index.
    async fn lookup_webhook_key(
        &self,
        webhook_key: &str,
        consistency: Consistency,
    ) -> Result<Option<(String, String, String)>>;

    /// Events with `trigger <= now`, oldest trigger first, at most
    /// `limit`.
    async fn fetch_due_events(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        consistency: Consistency,
    ) -> Result<Vec<ScheduleEvent>>;

    /// Claim the lock row for `resource` if it is absent or its holder
    /// went stale. Returns whether the claim succeeded.
    async fn try_acquire_lock(
        &self,
        resource: &str,
        owner: &str,
        acquired_at: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<bool>;

    /// Delete the lock row only if `owner` still holds it. Returns
    /// whether a row was removed.
    async fn release_lock(&self, resource: &str, owner: &str) -> Result<bool>;
}
