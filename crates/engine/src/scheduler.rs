//! The scheduler: a periodic service that drains due schedule events
//! under a global lock, executes them, and rewrites the event table in
//! one pass.
//!
//! Semantics are at-least-once: a crash between executing events and
//! rewriting their rows makes them due again next tick, and the
//! controller's cooldown gates absorb the replay.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;

use updraft_domain::config::SchedulerConfig;
use updraft_domain::{cron, keys, Clock, Error, Result, ScheduleEvent};
use updraft_store::ScalingStore;

use crate::dispatch::JobDispatcher;
use crate::execute::execute_policy;

pub struct SchedulerService {
    interval: Duration,
    batch_size: usize,
    store: ScalingStore,
    dispatcher: Arc<dyn JobDispatcher>,
    clock: Arc<dyn Clock>,
}

impl SchedulerService {
    pub fn new(
        config: &SchedulerConfig,
        store: ScalingStore,
        dispatcher: Arc<dyn JobDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            batch_size: config.batch_size,
            store,
            dispatcher,
            clock,
        }
    }

    /// Tick forever. Ticks that overrun the interval delay the next one
    /// rather than bunching up.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_for_events().await;
        }
    }

    /// One tick: process batches until a partial batch signals the table
    /// is drained. The schedule lock is taken per batch with zero
    /// retries — if another scheduler holds it, skip this tick entirely.
    pub async fn check_for_events(&self) {
        loop {
            let processed = self
                .store
                .with_schedule_lock(|| self.fetch_and_process())
                .await;
            match processed {
                Ok(count) if count == self.batch_size => continue,
                Ok(_) => return,
                Err(Error::BusyLock(_)) => {
                    tracing::debug!("could not get lock to process events; skipping tick");
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, "scheduler tick failed");
                    return;
                }
            }
        }
    }

    /// Fetch one batch of due events, execute them all concurrently,
    /// then delete/update their rows in a single store call.
    async fn fetch_and_process(&self) -> Result<usize> {
        let now = self.clock.now();
        let run_id = keys::new_key();
        let events = self.store.fetch_due_events(now, self.batch_size).await?;
        if events.is_empty() {
            return Ok(0);
        }
        tracing::info!(run_id = %run_id, num_events = events.len(), "processing events");

        // Policies whose group or policy row is gone: their events get
        // cleaned up below instead of firing forever.
        let deleted_policy_ids: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
        join_all(
            events
                .iter()
                .map(|event| self.execute_event(event, &deleted_policy_ids)),
        )
        .await;
        let deleted_policy_ids = deleted_policy_ids.into_inner();

        let mut to_delete = Vec::new();
        let mut to_update = Vec::new();
        for event in events.iter() {
            match &event.cron {
                Some(cron_expr) if !deleted_policy_ids.contains(&event.policy_id) => {
                    // Next occurrence is computed from now, not from the
                    // missed trigger: skipped cron ticks are not backfilled.
                    match cron::next_occurrence(cron_expr, &now) {
                        Some(next) => to_update.push(ScheduleEvent {
                            trigger: next,
                            ..event.clone()
                        }),
                        None => to_delete.push(event.policy_id.clone()),
                    }
                }
                _ => to_delete.push(event.policy_id.clone()),
            }
        }

        tracing::info!(
            run_id = %run_id,
            deleting = to_delete.len(),
            updating = to_update.len(),
            "updating processed events"
        );
        self.store.update_delete_events(to_delete, to_update).await?;
        Ok(events.len())
    }

    async fn execute_event(&self, event: &ScheduleEvent, deleted: &Mutex<HashSet<String>>) {
        tracing::info!(
            tenant_id = %event.tenant_id,
            group_id = %event.group_id,
            policy_id = %event.policy_id,
            "executing scheduled policy"
        );
        let result = execute_policy(
            &self.store,
            self.dispatcher.as_ref(),
            self.clock.as_ref(),
            &event.tenant_id,
            &event.group_id,
            &event.policy_id,
        )
        .await;
        match result {
            Ok(()) => {}
            Err(Error::CannotExecutePolicy(reason)) => {
                // Cooldown, paused, at-limit: expected, retried at the
                // next trigger.
                tracing::info!(policy_id = %event.policy_id, %reason, "cannot execute policy");
            }
            Err(Error::NoSuchScalingGroup { .. }) | Err(Error::NoSuchPolicy { .. }) => {
                tracing::info!(
                    policy_id = %event.policy_id,
                    "group or policy deleted; cleaning up event"
                );
                deleted.lock().insert(event.policy_id.clone());
            }
            Err(error) => {
                tracing::error!(policy_id = %event.policy_id, %error, "scheduler failed to execute policy");
            }
        }
    }
}
