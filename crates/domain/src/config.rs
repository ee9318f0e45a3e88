//! Runtime configuration, loaded from TOML by the daemon.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Scheduler tick cadence and event batch size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "d_10")]
    pub interval_secs: u64,
    #[serde(default = "d_100")]
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: d_10(),
            batch_size: d_100(),
        }
    }
}

/// Advisory-lock tuning. `modify_state` retries with uniform jitter in
/// `[retry_wait_min_secs, retry_wait_max_secs]`; the scheduler always
/// uses zero retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// A held lock older than this is considered abandoned and taken over.
    #[serde(default = "d_300")]
    pub stale_after_secs: u64,
    #[serde(default = "d_5")]
    pub max_retry: u32,
    #[serde(default = "d_3")]
    pub retry_wait_min_secs: u64,
    #[serde(default = "d_5_u64")]
    pub retry_wait_max_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: d_300(),
            max_retry: d_5(),
            retry_wait_min_secs: d_3(),
            retry_wait_max_secs: d_5_u64(),
        }
    }
}

/// Worker polling cadence and wall-clock timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "d_5_u64")]
    pub poll_interval_secs: u64,
    /// How long a server may sit in BUILD before the launch fails.
    #[serde(default = "d_3600")]
    pub launch_timeout_secs: u64,
    /// Slightly longer than the launch timeout: a building server cannot
    /// be deleted until it finishes building.
    #[serde(default = "d_3660")]
    pub delete_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: d_5_u64(),
            launch_timeout_secs: d_3600(),
            delete_timeout_secs: d_3660(),
        }
    }
}

/// Service-catalog names and region used to resolve upstream endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "d_compute_service")]
    pub compute_service: String,
    #[serde(default = "d_lb_service")]
    pub load_balancer_service: String,
    #[serde(default)]
    pub region: String,
    /// Load balancers sometimes live in a different catalog region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_region_override: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            compute_service: d_compute_service(),
            load_balancer_service: d_lb_service(),
            region: String::new(),
            lb_region_override: None,
        }
    }
}

fn d_10() -> u64 {
    10
}

fn d_100() -> usize {
    100
}

fn d_300() -> u64 {
    300
}

fn d_5() -> u32 {
    5
}

fn d_3() -> u64 {
    3
}

fn d_5_u64() -> u64 {
    5
}

fn d_3600() -> u64 {
    3600
}

fn d_3660() -> u64 {
    3660
}

fn d_compute_service() -> String {
    "cloudServersOpenStack".into()
}

fn d_lb_service() -> String {
    "cloudLoadBalancers".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.interval_secs, 10);
        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.lock.max_retry, 5);
        assert_eq!(config.worker.launch_timeout_secs, 3600);
        assert_eq!(config.catalog.compute_service, "cloudServersOpenStack");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [scheduler]
            interval_secs = 2
            batch_size = 10

            [catalog]
            region = "ORD"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.interval_secs, 2);
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.catalog.region, "ORD");
        assert_eq!(config.worker.poll_interval_secs, 5);
        assert!(config.catalog.lb_region_override.is_none());
    }
}
