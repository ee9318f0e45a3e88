//! Scaling policies: capacity-change rules executed on demand or on a
//! schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a policy is triggered. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Fired by an API call or an anonymous capability URL.
    Webhook,
    /// Fired by the scheduler, one-shot (`at`) or recurring (`cron`).
    Schedule,
}

/// Exactly one way of stating the new capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Adjustment {
    /// Relative: `target = current + change`.
    Change { change: i64 },
    /// Relative by percent, truncated toward zero.
    ChangePercent { change_percent: f64 },
    /// Absolute target.
    DesiredCapacity { desired_capacity: u32 },
}

/// When a schedule policy fires: a one-shot instant or a cron rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScheduleArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    /// Minimum seconds between two executions of this policy.
    #[serde(default)]
    pub cooldown: u32,
    #[serde(rename = "type")]
    pub kind: PolicyKind,
    #[serde(flatten)]
    pub adjustment: Adjustment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ScheduleArgs>,
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            PolicyKind::Schedule => match &self.args {
                Some(args) => match (&args.at, &args.cron) {
                    (Some(_), None) => Ok(()),
                    (None, Some(cron)) => crate::cron::validate(cron),
                    (Some(_), Some(_)) => Err(Error::Validation(
                        "schedule policy takes either args.at or args.cron, not both".into(),
                    )),
                    (None, None) => Err(Error::Validation(
                        "schedule policy requires args.at or args.cron".into(),
                    )),
                },
                None => Err(Error::Validation(
                    "schedule policy requires args.at or args.cron".into(),
                )),
            },
            PolicyKind::Webhook => {
                if self.args.is_some() {
                    Err(Error::Validation(
                        "webhook policy does not take schedule args".into(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}
