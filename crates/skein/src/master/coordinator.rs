use std::future::Future;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use crate::common::error::SkeinError;
use crate::common::ids::ContainerId;
use crate::gateway::{
    AllocateRequest, AllocateResponse, FinalApplicationStatus, NodeAgent, RegisterRequest,
    ResourceManager,
};
use crate::job::launch::LaunchContextFactory;
use crate::job::{ContainerSpec, CredentialBlob};
use crate::master::allocation::{AllocationListener, TrackerSet};
use crate::master::config::MasterConfig;
use crate::master::tracker::{ContainerTracker, JobCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Created,
    Running,
    Stopped,
    Failed,
}

/// Application master engine. Owns the trackers of one application attempt.
pub struct Coordinator {
    config: MasterConfig,
    rm: Arc<dyn ResourceManager>,
    agent: Arc<dyn NodeAgent>,
    trackers: TrackerSet,
    counters: Arc<JobCounters>,
    state: CoordinatorState,
    registered: bool,
    diagnostics: Option<String>,
}

/// Final status of an application from its counters.
pub fn final_status(
    failed_state: bool,
    failures: u64,
    completed: u64,
    allowed_failures: u32,
) -> FinalApplicationStatus {
    if failed_state || failures > allowed_failures as u64 || failures >= completed {
        FinalApplicationStatus::Failed
    } else {
        FinalApplicationStatus::Succeeded
    }
}

impl Coordinator {
    pub fn new(
        config: MasterConfig,
        rm: Arc<dyn ResourceManager>,
        agent: Arc<dyn NodeAgent>,
    ) -> Self {
        let surplus = config.surplus;
        Self {
            config,
            rm,
            agent,
            trackers: TrackerSet::new(vec![], surplus),
            counters: Default::default(),
            state: CoordinatorState::Created,
            registered: false,
            diagnostics: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn counters(&self) -> &JobCounters {
        &self.counters
    }

    pub fn trackers(&self) -> &[Arc<ContainerTracker>] {
        self.trackers.trackers()
    }

    /// Registers with the cluster manager and creates one tracker per spec.
    pub async fn startup(
        &mut self,
        specs: Vec<ContainerSpec>,
        tokens: CredentialBlob,
    ) -> crate::Result<()> {
        let request = RegisterRequest {
            host: self.config.host.clone(),
            rpc_port: self.config.rpc_port,
            tracking_url: self.config.tracking_url.clone(),
        };
        let response = match self.rm.register(request).await {
            Ok(response) => response,
            Err(error) => {
                log::error!("Registration with the cluster manager failed: {error}");
                return self.fail(SkeinError::RegistrationError(error.to_string()));
            }
        };
        self.registered = true;
        log::info!(
            "Registered with the cluster manager, capability range {} - {}",
            response.min_capability,
            response.max_capability
        );

        if specs.is_empty() {
            log::error!("No containers to run");
            return self.fail(SkeinError::ConfigError(
                "job does not define any containers".to_string(),
            ));
        }

        let factory = LaunchContextFactory::new(
            response.min_capability,
            response.max_capability,
            tokens,
        );
        let trackers = specs
            .into_iter()
            .map(|spec| {
                ContainerTracker::new(
                    spec,
                    &factory,
                    self.agent.clone(),
                    self.counters.clone(),
                    self.config.supervisor,
                )
            })
            .collect();
        self.trackers = TrackerSet::new(trackers, self.config.surplus);
        self.state = CoordinatorState::Running;

        let mut responses = Vec::with_capacity(self.trackers.trackers().len());
        for tracker in self.trackers.trackers() {
            tracker.initialize();
            responses.push(self.heartbeat(tracker, vec![]).await);
        }
        self.dispatch(responses);
        Ok(())
    }

    fn fail<T>(&mut self, error: SkeinError) -> crate::Result<T> {
        self.state = CoordinatorState::Failed;
        self.diagnostics = Some(error.to_string());
        Err(error)
    }

    /// One allocate call for one tracker. Errors are treated as an empty response.
    async fn heartbeat(
        &self,
        tracker: &ContainerTracker,
        surplus_releases: Vec<ContainerId>,
    ) -> AllocateResponse {
        let ask = tracker.pending_ask();
        let mut releases = tracker.take_releases();
        let own_releases = releases.len();
        releases.extend(surplus_releases);
        let request = AllocateRequest {
            asks: ask.clone().into_iter().collect(),
            releases,
            progress: self.progress(),
        };
        let released = request.releases.clone();

        match self.rm.allocate(request).await {
            Ok(response) => {
                if let Some(ask) = ask {
                    tracker.ask_submitted(ask.count);
                }
                if !released.is_empty() {
                    log::debug!("Released {} container(s)", released.len());
                }
                response
            }
            Err(error) => {
                log::warn!(
                    "Allocate call for `{}` failed, retrying on next tick: {error}",
                    tracker.name()
                );
                let mut released = released;
                let surplus = released.split_off(own_releases);
                tracker.return_releases(released);
                self.trackers.return_surplus_releases(surplus);
                AllocateResponse::default()
            }
        }
    }

    /// Hands completions and new containers to the trackers. Returns `true` if the cluster
    /// manager asked the application to shut down.
    fn dispatch(&self, responses: Vec<AllocateResponse>) -> bool {
        let mut allocated = vec![];
        let mut completed = vec![];
        let mut shutdown_requested = false;
        for response in responses {
            allocated.extend(response.allocated);
            completed.extend(response.completed);
            shutdown_requested |= response.shutdown_requested;
        }
        if !completed.is_empty() {
            self.trackers.on_containers_completed(completed);
        }
        if !allocated.is_empty() {
            self.trackers.on_containers_allocated(allocated);
        }
        shutdown_requested
    }

    /// Performs one reconciliation tick. Returns `false` once the coordinator should stop.
    pub async fn run_one_iteration(&mut self) -> bool {
        if self.state != CoordinatorState::Running {
            return false;
        }

        let failures = self.counters.failures();
        if failures > self.config.allowed_failures as u64 {
            log::error!(
                "Number of failed containers ({failures}) exceeded the allowed number of failures ({})",
                self.config.allowed_failures
            );
            self.diagnostics = Some(format!(
                "{failures} container(s) failed, only {} allowed",
                self.config.allowed_failures
            ));
            self.state = CoordinatorState::Stopped;
            return false;
        }

        let mut responses = Vec::with_capacity(self.trackers.trackers().len());
        let mut surplus = self.trackers.take_surplus_releases();
        for tracker in self.trackers.trackers() {
            responses.push(self.heartbeat(tracker, std::mem::take(&mut surplus)).await);
        }
        if self.dispatch(responses) {
            log::info!("Cluster manager requested shutdown");
            self.diagnostics = Some("Shutdown requested by the cluster manager".to_string());
            self.state = CoordinatorState::Stopped;
            return false;
        }

        if !self
            .trackers
            .trackers()
            .iter()
            .any(|tracker| tracker.needs_more())
        {
            log::info!("All containers have finished");
            self.state = CoordinatorState::Stopped;
            return false;
        }
        true
    }

    /// Runs reconciliation ticks until the job is done or `shutdown` resolves.
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) {
        let mut interval = tokio::time::interval(self.config.tick_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Coordinator was asked to stop");
                    if self.state == CoordinatorState::Running {
                        self.state = CoordinatorState::Stopped;
                    }
                    break;
                }
                _ = interval.tick() => {
                    if !self.run_one_iteration().await {
                        break;
                    }
                }
            }
        }
    }

    /// Stops all containers and unregisters from the cluster manager.
    pub async fn shutdown(&mut self) -> FinalApplicationStatus {
        self.trackers.stop_all();
        if self.state == CoordinatorState::Running || self.state == CoordinatorState::Created {
            self.state = CoordinatorState::Stopped;
        }

        let status = final_status(
            self.state == CoordinatorState::Failed,
            self.counters.failures(),
            self.counters.completed(),
            self.config.allowed_failures,
        );
        log::info!(
            "Application finished with status {status:?}: {} requested, {} completed, {} failures",
            self.counters.requested(),
            self.counters.completed(),
            self.counters.failures()
        );

        if self.registered {
            if let Err(error) = self.rm.unregister(status, self.diagnostics.clone()).await {
                log::warn!("Could not unregister from the cluster manager: {error}");
            } else {
                log::info!("Unregistered from the cluster manager with status {status:?}");
            }
            self.registered = false;
        }
        status
    }

    /// Ratio of completed to wanted instances over all trackers.
    pub fn progress(&self) -> f32 {
        let (completed, needed) =
            self.trackers
                .trackers()
                .iter()
                .fold((0u64, 0u64), |(completed, needed), tracker| {
                    (
                        completed + tracker.completed() as u64,
                        needed + tracker.needed() as u64,
                    )
                });
        if needed == 0 {
            0.0
        } else {
            completed as f32 / needed as f32
        }
    }
}
