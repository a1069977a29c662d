use std::time::Duration;

use crate::common::utils::{get_duration_from_env, local_hostname};
use crate::job::{MasterPlan, SurplusPolicy};

/// Period of the coordinator reconciliation tick.
pub fn get_tick_period() -> Duration {
    get_duration_from_env("SKEIN_MASTER_TICK_MS").unwrap_or(Duration::from_secs(1))
}

/// How often does a supervisor ask the node agent about its container.
pub fn get_status_poll_period() -> Duration {
    get_duration_from_env("SKEIN_STATUS_POLL_MS").unwrap_or(Duration::from_secs(1))
}

/// How often does the client ask the cluster manager for an application report.
pub fn get_client_poll_period() -> Duration {
    get_duration_from_env("SKEIN_CLIENT_POLL_MS").unwrap_or(Duration::from_secs(1))
}

/// Maximum number of successive failed status checks before a container is considered lost.
pub const MAX_STATUS_ERROR_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub poll_period: Duration,
    pub max_status_errors: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_period: get_status_poll_period(),
            max_status_errors: MAX_STATUS_ERROR_COUNT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: String,
    pub rpc_port: u16,
    pub tracking_url: Option<String>,
    pub tick_period: Duration,
    pub supervisor: SupervisorConfig,
    pub allowed_failures: u32,
    pub surplus: SurplusPolicy,
}

impl MasterConfig {
    pub fn from_plan(plan: &MasterPlan) -> Self {
        Self {
            allowed_failures: plan.allowed_failures,
            surplus: plan.surplus,
            ..Default::default()
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: local_hostname(),
            rpc_port: 0,
            tracking_url: None,
            tick_period: get_tick_period(),
            supervisor: SupervisorConfig::default(),
            allowed_failures: 0,
            surplus: SurplusPolicy::Keep,
        }
    }
}
