//! Per-group operations over the wide-column store.
//!
//! The database upserts blindly and has no atomic read-modify-write, so
//! every mutating method here reads first: an update against a missing
//! row would otherwise invent one. Deletes are tombstones, which makes
//! them updates too — same rule. Reads of the group row are *verified*:
//! a row without `created_at` is a resurrection (a stray write that
//! raced a delete), reported as absent and purged best-effort.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use updraft_domain::{
    cron, keys, Capability, Clock, Error, GroupConfig, GroupState, LaunchConfig, Policy,
    PolicyKind, Result, ScheduleEvent, Webhook, WebhookSpec,
};

use crate::backend::{level, Consistency, GroupRow, Mutation, Op, PolicyRow, Resource, StorageBackend, WebhookRow};
use crate::codec;
use crate::lock::LockService;

/// A stored policy together with its generated id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyRecord {
    pub id: String,
    #[serde(flatten)]
    pub policy: Policy,
}

/// A stored webhook together with its generated id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookRecord {
    pub id: String,
    #[serde(flatten)]
    pub webhook: Webhook,
}

/// Everything about one group in a single view.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupManifest {
    pub id: String,
    pub group_config: GroupConfig,
    pub launch_config: LaunchConfig,
    pub policies: Vec<PolicyRecord>,
    pub state: GroupState,
}

const DEFAULT_PAGE: usize = 100;

#[derive(Clone)]
pub struct ScalingGroup {
    pub tenant_id: String,
    pub group_id: String,
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    locks: LockService,
}

impl ScalingGroup {
    pub(crate) fn new(
        tenant_id: String,
        group_id: String,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        locks: LockService,
    ) -> Self {
        Self {
            tenant_id,
            group_id,
            backend,
            clock,
            locks,
        }
    }

    fn not_found(&self) -> Error {
        Error::NoSuchScalingGroup {
            tenant_id: self.tenant_id.clone(),
            group_id: self.group_id.clone(),
        }
    }

    fn no_such_policy(&self, policy_id: &str) -> Error {
        Error::NoSuchPolicy {
            tenant_id: self.tenant_id.clone(),
            group_id: self.group_id.clone(),
            policy_id: policy_id.to_owned(),
        }
    }

    // ── Verified views ────────────────────────────────────────────────

    /// Fetch the group row, treating resurrected rows as absent and
    /// purging them in passing.
    async fn verified_row(&self, consistency: Consistency) -> Result<GroupRow> {
        let row = self
            .backend
            .fetch_group(&self.tenant_id, &self.group_id, consistency)
            .await?
            .ok_or_else(|| self.not_found())?;
        if row.created_at.is_some() {
            return Ok(row);
        }
        tracing::warn!(
            tenant_id = %self.tenant_id,
            group_id = %self.group_id,
            "resurrected group row observed; purging"
        );
        // Best-effort: the caller's answer is NotFound either way.
        let _ = self
            .backend
            .apply(
                vec![Mutation::DeleteGroup {
                    tenant_id: self.tenant_id.clone(),
                    group_id: self.group_id.clone(),
                }],
                level(Op::Delete, Resource::Group),
            )
            .await;
        Err(self.not_found())
    }

    pub async fn view_config(&self) -> Result<GroupConfig> {
        let row = self.verified_row(level(Op::View, Resource::Partial)).await?;
        decode_column(row.group_config.as_deref(), "group_config")
    }

    pub async fn view_launch_config(&self) -> Result<LaunchConfig> {
        let row = self.verified_row(level(Op::View, Resource::Partial)).await?;
        decode_column(row.launch_config.as_deref(), "launch_config")
    }

    pub async fn view_state(&self) -> Result<GroupState> {
        let row = self.verified_row(level(Op::View, Resource::Partial)).await?;
        self.unmarshal_state_row(&row)
    }

    pub async fn view_manifest(&self) -> Result<GroupManifest> {
        let row = self.verified_row(level(Op::View, Resource::Group)).await?;
        let policies = self.naive_list_policies(DEFAULT_PAGE, None).await?;
        Ok(GroupManifest {
            id: self.group_id.clone(),
            group_config: decode_column(row.group_config.as_deref(), "group_config")?,
            launch_config: decode_column(row.launch_config.as_deref(), "launch_config")?,
            policies,
            state: self.unmarshal_state_row(&row)?,
        })
    }

    pub(crate) fn unmarshal_state_row(&self, row: &GroupRow) -> Result<GroupState> {
        Ok(GroupState {
            tenant_id: self.tenant_id.clone(),
            group_id: self.group_id.clone(),
            active: decode_column(row.active.as_deref(), "active")?,
            pending: decode_column(row.pending.as_deref(), "pending")?,
            group_touched: row.group_touched,
            policy_touched: decode_column(row.policy_touched.as_deref(), "policy_touched")?,
            paused: row.paused.unwrap_or(false),
        })
    }

    // ── Config updates ────────────────────────────────────────────────

    pub async fn update_config(&self, config: GroupConfig) -> Result<()> {
        config.validate()?;
        self.view_config().await?;
        tracing::info!(group_id = %self.group_id, "updating group config");
        self.backend
            .apply(
                vec![Mutation::UpsertGroup(GroupRow {
                    tenant_id: self.tenant_id.clone(),
                    group_id: self.group_id.clone(),
                    group_config: Some(codec::encode(&config)?),
                    ..Default::default()
                })],
                level(Op::Update, Resource::Partial),
            )
            .await
    }

    pub async fn update_launch_config(&self, launch: LaunchConfig) -> Result<()> {
        self.view_config().await?;
        tracing::info!(group_id = %self.group_id, "updating launch config");
        self.backend
            .apply(
                vec![Mutation::UpsertGroup(GroupRow {
                    tenant_id: self.tenant_id.clone(),
                    group_id: self.group_id.clone(),
                    launch_config: Some(codec::encode(&launch)?),
                    ..Default::default()
                })],
                level(Op::Update, Resource::Partial),
            )
            .await
    }

    // ── Policies ──────────────────────────────────────────────────────

    /// List policies without checking the group exists; `list_policies`
    /// layers that check on, the manifest view already has it.
    async fn naive_list_policies(
        &self,
        limit: usize,
        marker: Option<&str>,
    ) -> Result<Vec<PolicyRecord>> {
        let rows = self
            .backend
            .scan_policies(
                &self.tenant_id,
                &self.group_id,
                limit,
                marker,
                level(Op::List, Resource::Policy),
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(PolicyRecord {
                    policy: decode_column(row.data.as_deref(), "policy data")?,
                    id: row.policy_id,
                })
            })
            .collect()
    }

    pub async fn list_policies(
        &self,
        limit: usize,
        marker: Option<&str>,
    ) -> Result<Vec<PolicyRecord>> {
        let records = self.naive_list_policies(limit, marker).await?;
        if records.is_empty() {
            // An empty page may mean the group itself is gone.
            self.view_config().await?;
        }
        Ok(records)
    }

    pub async fn get_policy(&self, policy_id: &str) -> Result<Policy> {
        let row = self
            .backend
            .fetch_policy(
                &self.tenant_id,
                &self.group_id,
                policy_id,
                level(Op::View, Resource::Policy),
            )
            .await?
            .ok_or_else(|| self.no_such_policy(policy_id))?;
        decode_column(row.data.as_deref(), "policy data")
    }

    pub async fn create_policies(&self, policies: Vec<Policy>) -> Result<Vec<PolicyRecord>> {
        self.view_config().await?;
        for policy in &policies {
            policy.validate()?;
        }
        tracing::info!(group_id = %self.group_id, count = policies.len(), "creating policies");

        let now = self.clock.now();
        let mut batch = Vec::new();
        let mut records = Vec::with_capacity(policies.len());
        for policy in policies {
            let policy_id = keys::new_key();
            batch.push(Mutation::UpsertPolicy(PolicyRow {
                tenant_id: self.tenant_id.clone(),
                group_id: self.group_id.clone(),
                policy_id: policy_id.clone(),
                data: Some(codec::encode(&policy)?),
            }));
            if let Some(event) = self.schedule_event_for(&policy_id, &policy, now)? {
                batch.push(Mutation::InsertEvent(event));
            }
            records.push(PolicyRecord {
                id: policy_id,
                policy,
            });
        }
        let consistency = batch_consistency(&batch, Op::Create, Resource::Policy);
        self.backend.apply(batch, consistency).await?;
        Ok(records)
    }

    pub async fn update_policy(&self, policy_id: &str, policy: Policy) -> Result<()> {
        let last = self.get_policy(policy_id).await?;
        policy.validate()?;
        if last.kind != policy.kind {
            return Err(Error::Validation(
                "cannot change the type of a scaling policy".into(),
            ));
        }
        tracing::info!(group_id = %self.group_id, policy_id, "updating policy");

        let mut batch = Vec::new();
        if policy.kind == PolicyKind::Schedule && last.args != policy.args {
            // The trigger is part of the event's primary key, so a
            // reschedule is delete + fresh insert, never in-place.
            batch.push(Mutation::DeleteEventsForPolicy {
                policy_id: policy_id.to_owned(),
            });
            if let Some(event) = self.schedule_event_for(policy_id, &policy, self.clock.now())? {
                batch.push(Mutation::InsertEvent(event));
            }
        }
        batch.push(Mutation::UpsertPolicy(PolicyRow {
            tenant_id: self.tenant_id.clone(),
            group_id: self.group_id.clone(),
            policy_id: policy_id.to_owned(),
            data: Some(codec::encode(&policy)?),
        }));
        let consistency = batch_consistency(&batch, Op::Update, Resource::Policy);
        self.backend.apply(batch, consistency).await
    }

    /// Delete a policy and everything hanging off it: its webhooks and
    /// any schedule events referencing it, in one batch.
    pub async fn delete_policy(&self, policy_id: &str) -> Result<()> {
        self.get_policy(policy_id).await?;
        tracing::info!(group_id = %self.group_id, policy_id, "deleting policy");
        let batch = vec![
            Mutation::DeletePolicy {
                tenant_id: self.tenant_id.clone(),
                group_id: self.group_id.clone(),
                policy_id: policy_id.to_owned(),
            },
            Mutation::DeleteWebhooksInPolicy {
                tenant_id: self.tenant_id.clone(),
                group_id: self.group_id.clone(),
                policy_id: policy_id.to_owned(),
            },
            Mutation::DeleteEventsForPolicy {
                policy_id: policy_id.to_owned(),
            },
        ];
        let consistency = batch_consistency(&batch, Op::Delete, Resource::Policy);
        self.backend.apply(batch, consistency).await
    }

    /// Build the schedule-event row for a schedule policy, if any. Cron
    /// policies get their first occurrence computed from `now`.
    pub(crate) fn schedule_event_for(
        &self,
        policy_id: &str,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleEvent>> {
        if policy.kind != PolicyKind::Schedule {
            return Ok(None);
        }
        let args = policy
            .args
            .as_ref()
            .ok_or_else(|| Error::Validation("schedule policy without args".into()))?;
        let trigger = match (&args.at, &args.cron) {
            (Some(at), _) => *at,
            (None, Some(cron_expr)) => cron::next_occurrence(cron_expr, &now).ok_or_else(|| {
                Error::Validation(format!("cron expression never fires: {cron_expr:?}"))
            })?,
            (None, None) => {
                return Err(Error::Validation(
                    "schedule policy requires args.at or args.cron".into(),
                ))
            }
        };
        Ok(Some(ScheduleEvent {
            tenant_id: self.tenant_id.clone(),
            group_id: self.group_id.clone(),
            policy_id: policy_id.to_owned(),
            trigger,
            cron: args.cron.clone(),
        }))
    }

    // ── Webhooks ──────────────────────────────────────────────────────

    async fn naive_list_webhooks(
        &self,
        policy_id: &str,
        limit: usize,
        marker: Option<&str>,
    ) -> Result<Vec<WebhookRecord>> {
        let rows = self
            .backend
            .scan_webhooks(
                &self.tenant_id,
                &self.group_id,
                policy_id,
                limit,
                marker,
                level(Op::List, Resource::Webhook),
            )
            .await?;
        rows.into_iter().map(assemble_webhook).collect()
    }

    pub async fn list_webhooks(
        &self,
        policy_id: &str,
        limit: usize,
        marker: Option<&str>,
    ) -> Result<Vec<WebhookRecord>> {
        let records = self.naive_list_webhooks(policy_id, limit, marker).await?;
        if records.is_empty() {
            self.get_policy(policy_id).await?;
        }
        Ok(records)
    }

    pub async fn get_webhook(&self, policy_id: &str, webhook_id: &str) -> Result<Webhook> {
        let row = self
            .backend
            .fetch_webhook(
                &self.tenant_id,
                &self.group_id,
                policy_id,
                webhook_id,
                level(Op::View, Resource::Webhook),
            )
            .await?
            .ok_or_else(|| Error::NoSuchWebhook {
                tenant_id: self.tenant_id.clone(),
                group_id: self.group_id.clone(),
                policy_id: policy_id.to_owned(),
                webhook_id: webhook_id.to_owned(),
            })?;
        Ok(assemble_webhook(row)?.webhook)
    }

    pub async fn create_webhooks(
        &self,
        policy_id: &str,
        specs: Vec<WebhookSpec>,
    ) -> Result<Vec<WebhookRecord>> {
        self.get_policy(policy_id).await?;
        tracing::info!(group_id = %self.group_id, policy_id, count = specs.len(), "creating webhooks");

        let mut batch = Vec::new();
        let mut records = Vec::with_capacity(specs.len());
        for spec in specs {
            let webhook_id = keys::new_key();
            let capability = Capability::generate();
            batch.push(Mutation::UpsertWebhook(WebhookRow {
                tenant_id: self.tenant_id.clone(),
                group_id: self.group_id.clone(),
                policy_id: policy_id.to_owned(),
                webhook_id: webhook_id.clone(),
                data: Some(codec::encode(&spec)?),
                capability: Some(encode_capability(&capability)?),
                webhook_key: Some(capability.hash.clone()),
            }));
            records.push(WebhookRecord {
                id: webhook_id,
                webhook: Webhook {
                    name: spec.name,
                    metadata: spec.metadata,
                    capability,
                },
            });
        }
        self.backend
            .apply(batch, level(Op::Create, Resource::Webhook))
            .await?;
        Ok(records)
    }

    /// Update the user-mutable webhook fields. Only the data column is
    /// written, so the capability URL stays stable.
    pub async fn update_webhook(
        &self,
        policy_id: &str,
        webhook_id: &str,
        spec: WebhookSpec,
    ) -> Result<()> {
        self.get_webhook(policy_id, webhook_id).await?;
        tracing::info!(group_id = %self.group_id, policy_id, webhook_id, "updating webhook");
        self.backend
            .apply(
                vec![Mutation::UpsertWebhook(WebhookRow {
                    tenant_id: self.tenant_id.clone(),
                    group_id: self.group_id.clone(),
                    policy_id: policy_id.to_owned(),
                    webhook_id: webhook_id.to_owned(),
                    data: Some(codec::encode(&spec)?),
                    capability: None,
                    webhook_key: None,
                })],
                level(Op::Update, Resource::Webhook),
            )
            .await
    }

    pub async fn delete_webhook(&self, policy_id: &str, webhook_id: &str) -> Result<()> {
        self.get_webhook(policy_id, webhook_id).await?;
        tracing::info!(group_id = %self.group_id, policy_id, webhook_id, "deleting webhook");
        self.backend
            .apply(
                vec![Mutation::DeleteWebhook {
                    tenant_id: self.tenant_id.clone(),
                    group_id: self.group_id.clone(),
                    policy_id: policy_id.to_owned(),
                    webhook_id: webhook_id.to_owned(),
                }],
                level(Op::Delete, Resource::Webhook),
            )
            .await
    }

    // ── Group deletion ────────────────────────────────────────────────

    /// Delete the group and everything it owns. Runs under the group
    /// lock so no policy execution can add servers mid-delete.
    pub async fn delete_group(&self) -> Result<()> {
        self.locks
            .with_lock(&self.group_id, self.locks.default_max_retry(), move || async move {
                let state = self.view_state().await?;
                if state.desired_total() > 0 {
                    return Err(Error::GroupNotEmpty {
                        tenant_id: self.tenant_id.clone(),
                        group_id: self.group_id.clone(),
                    });
                }
                let policies = self.naive_list_policies(usize::MAX, None).await?;
                tracing::info!(group_id = %self.group_id, "deleting group");

                let mut batch = vec![
                    Mutation::DeleteGroup {
                        tenant_id: self.tenant_id.clone(),
                        group_id: self.group_id.clone(),
                    },
                    Mutation::DeletePoliciesInGroup {
                        tenant_id: self.tenant_id.clone(),
                        group_id: self.group_id.clone(),
                    },
                    Mutation::DeleteWebhooksInGroup {
                        tenant_id: self.tenant_id.clone(),
                        group_id: self.group_id.clone(),
                    },
                ];
                // Events key on policy id, not group id.
                for record in &policies {
                    batch.push(Mutation::DeleteEventsForPolicy {
                        policy_id: record.id.clone(),
                    });
                }
                let consistency = batch_consistency(&batch, Op::Delete, Resource::Group);
                self.backend.apply(batch, consistency).await
            })
            .await
    }

    // ── modify_state ──────────────────────────────────────────────────

    /// The only sanctioned way to change group state.
    ///
    /// Holds the group lock across read, compute, and write so
    /// concurrent executions cannot interleave. The modifier sees the
    /// freshly read state and returns the new state plus an output value
    /// (e.g. the scale plan) handed back to the caller after the write
    /// commits. If the modifier fails, nothing is written.
    pub async fn modify_state<T, F, Fut>(&self, modifier: F) -> Result<T>
    where
        F: FnOnce(ScalingGroup, GroupState) -> Fut,
        Fut: Future<Output = Result<(GroupState, T)>>,
    {
        self.locks
            .with_lock(&self.group_id, self.locks.default_max_retry(), move || async move {
                let state = self.view_state().await?;
                let (new_state, out) = modifier(self.clone(), state).await?;
                if new_state.tenant_id != self.tenant_id || new_state.group_id != self.group_id {
                    return Err(Error::Validation(
                        "state modifier changed the group identity".into(),
                    ));
                }
                self.write_state(&new_state).await?;
                Ok(out)
            })
            .await
    }

    /// Convenience modifier: pause or resume policy execution.
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        self.modify_state(move |_, mut state| async move {
            state.paused = paused;
            Ok((state, ()))
        })
        .await
    }

    /// Upsert the five mutable state columns in one write.
    async fn write_state(&self, state: &GroupState) -> Result<()> {
        self.backend
            .apply(
                vec![Mutation::UpsertGroup(GroupRow {
                    tenant_id: self.tenant_id.clone(),
                    group_id: self.group_id.clone(),
                    active: Some(codec::encode(&state.active)?),
                    pending: Some(codec::encode(&state.pending)?),
                    group_touched: state.group_touched,
                    policy_touched: Some(codec::encode(&state.policy_touched)?),
                    paused: Some(state.paused),
                    ..Default::default()
                })],
                level(Op::Update, Resource::Partial),
            )
            .await
    }
}

fn decode_column<T: serde::de::DeserializeOwned>(raw: Option<&str>, column: &str) -> Result<T> {
    let raw = raw.ok_or_else(|| Error::Validation(format!("row missing column {column}")))?;
    codec::decode(raw)
}

/// Batches touching schedule events run at the event consistency level.
pub(crate) fn batch_consistency(batch: &[Mutation], op: Op, resource: Resource) -> Consistency {
    let touches_events = batch.iter().any(|m| {
        matches!(
            m,
            Mutation::InsertEvent(_) | Mutation::DeleteEventsForPolicy { .. }
        )
    });
    if touches_events {
        level(op, Resource::Event)
    } else {
        level(op, resource)
    }
}

/// The capability column stores `{<version>: <hash>}` so new capability
/// versions can coexist with old ones.
fn encode_capability(capability: &Capability) -> Result<String> {
    let mut map = serde_json::Map::new();
    map.insert(
        capability.version.clone(),
        serde_json::Value::String(capability.hash.clone()),
    );
    codec::encode(&map)
}

fn decode_capability(raw: &str) -> Result<Capability> {
    let map: serde_json::Map<String, serde_json::Value> = codec::decode(raw)?;
    let (version, hash) = map
        .iter()
        .next()
        .ok_or_else(|| Error::Validation("empty capability column".into()))?;
    let hash = hash
        .as_str()
        .ok_or_else(|| Error::Validation("capability hash is not a string".into()))?;
    Ok(Capability {
        version: version.clone(),
        hash: hash.to_owned(),
    })
}

fn assemble_webhook(row: WebhookRow) -> Result<WebhookRecord> {
    let spec: WebhookSpec = decode_column(row.data.as_deref(), "webhook data")?;
    let capability = decode_capability(
        row.capability
            .as_deref()
            .ok_or_else(|| Error::Validation("webhook row missing capability".into()))?,
    )?;
    Ok(WebhookRecord {
        id: row.webhook_id,
        webhook: Webhook {
            name: spec.name,
            metadata: spec.metadata,
            capability,
        },
    })
}
