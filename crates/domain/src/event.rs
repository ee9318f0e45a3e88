//! Schedule events: rows representing future firings of schedule
//! policies. The trigger is part of the primary key, so rescheduling a
//! cron event is always delete + insert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub tenant_id: String,
    pub group_id: String,
    pub policy_id: String,
    /// UTC instant at which the policy becomes due.
    pub trigger: DateTime<Utc>,
    /// Present for recurring events; absent for one-shots. One-shot
    /// events are deleted after firing; recurring events are reinserted
    /// at the next cron occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}
