//! Application master: keeps the containers of one job running until the job is done.

use std::future::Future;
use std::sync::Arc;

use crate::gateway::{FinalApplicationStatus, NodeAgent, ResourceManager};
use crate::job::MASTER_PLAN_ENV;
use crate::job::MasterPlan;
use crate::job::launch::LaunchContext;

pub mod allocation;
pub mod config;
pub mod coordinator;
pub mod supervisor;
pub mod tracker;

pub use config::MasterConfig;
pub use coordinator::Coordinator;

/// Reads the job plan that the client put into the launch context of the master.
pub fn plan_from_context(context: &LaunchContext) -> crate::Result<MasterPlan> {
    match context.env.get(MASTER_PLAN_ENV) {
        Some(value) => MasterPlan::from_env_value(value),
        None => Err(crate::Error::ConfigError(format!(
            "Master launch context does not contain {MASTER_PLAN_ENV}"
        ))),
    }
}

/// Runs a complete application attempt: startup, reconciliation until the job is done or
/// `shutdown` resolves, and unregistration.
pub async fn run_master<F: Future<Output = ()>>(
    config: MasterConfig,
    plan: MasterPlan,
    context: &LaunchContext,
    rm: Arc<dyn ResourceManager>,
    agent: Arc<dyn NodeAgent>,
    shutdown: F,
) -> FinalApplicationStatus {
    let mut coordinator = Coordinator::new(config, rm, agent);
    match coordinator
        .startup(plan.containers, context.tokens.clone())
        .await
    {
        Ok(()) => coordinator.run(shutdown).await,
        Err(error) => log::error!("Application master could not start: {error}"),
    }
    coordinator.shutdown().await
}
