//! Lifecycle of a single allocated container.
//!
//! A supervisor starts the container on its node, then polls the node agent until the container
//! finishes, the supervisor is told to stop or the container cannot be observed anymore.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::gateway::{Container, ContainerState, GatewayError, NodeAgent, exit_status};
use crate::job::launch::LaunchContext;
use crate::master::config::SupervisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Completed = 3,
    Failed = 4,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Completed | SupervisorState::Failed)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SupervisorState::Starting,
            1 => SupervisorState::Running,
            2 => SupervisorState::Stopping,
            3 => SupervisorState::Completed,
            _ => SupervisorState::Failed,
        }
    }
}

/// Supervisor state shared between the supervisor task and its handle.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(SupervisorState::Starting as u8))
    }

    pub(crate) fn get(&self) -> SupervisorState {
        SupervisorState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `to` if the current state is one of `from`.
    fn transition(&self, from: &[SupervisorState], to: SupervisorState) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !from.contains(&SupervisorState::from_u8(current)) {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// How did a container end, as observed by its supervisor or reported by the cluster manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOutcome {
    Exited { exit_code: i32, diagnostics: String },
    StartFailed(String),
    /// Status could not be observed anymore
    Lost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Succeeded,
    Failed,
    /// Taken away by the cluster, not counted as a failure
    Aborted,
}

impl ContainerOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ContainerOutcome::Exited { exit_code, .. } => {
                if *exit_code == exit_status::SUCCESS {
                    OutcomeKind::Succeeded
                } else if exit_status::is_administrative(*exit_code) {
                    OutcomeKind::Aborted
                } else {
                    OutcomeKind::Failed
                }
            }
            ContainerOutcome::StartFailed(_) | ContainerOutcome::Lost(_) => OutcomeKind::Failed,
        }
    }
}

/// Receives the terminal outcome of supervised containers.
pub trait SupervisorListener: Send + Sync {
    fn on_container_finished(&self, container: &Container, outcome: ContainerOutcome);
}

/// Owner side of a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    state: Arc<StateCell>,
    stop_sender: Option<oneshot::Sender<()>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        self.state.get()
    }

    /// Asks the supervisor to stop its container. Returns `false` if the supervisor has already
    /// finished or was already stopped.
    pub fn stop(&mut self) -> bool {
        if !self.state.transition(
            &[SupervisorState::Starting, SupervisorState::Running],
            SupervisorState::Stopping,
        ) {
            return false;
        }
        if let Some(sender) = self.stop_sender.take() {
            let _ = sender.send(());
        }
        true
    }

    /// Marks the supervisor as finished because the cluster manager has already reported the
    /// container as completed. The supervisor task exits without further polling.
    pub(crate) fn retire(&mut self, succeeded: bool) {
        let target = if succeeded {
            SupervisorState::Completed
        } else {
            SupervisorState::Failed
        };
        self.state.transition(
            &[
                SupervisorState::Starting,
                SupervisorState::Running,
                SupervisorState::Stopping,
            ],
            target,
        );
        self.stop_sender = None;
    }
}

struct Supervisor {
    container: Container,
    context: LaunchContext,
    agent: Arc<dyn NodeAgent>,
    listener: Arc<dyn SupervisorListener>,
    state: Arc<StateCell>,
    config: SupervisorConfig,
}

/// Spawns a task that starts `container` and watches it until it ends.
pub fn spawn_supervisor(
    container: Container,
    context: LaunchContext,
    agent: Arc<dyn NodeAgent>,
    listener: Arc<dyn SupervisorListener>,
    config: SupervisorConfig,
) -> SupervisorHandle {
    let state = Arc::new(StateCell::new());
    let (stop_sender, stop_receiver) = oneshot::channel();
    let handle = SupervisorHandle {
        state: state.clone(),
        stop_sender: Some(stop_sender),
    };
    let supervisor = Supervisor {
        container,
        context,
        agent,
        listener,
        state,
        config,
    };
    tokio::spawn(supervisor.run(stop_receiver));
    handle
}

impl Supervisor {
    async fn run(self, mut stop_receiver: oneshot::Receiver<()>) {
        let id = self.container.id;
        log::debug!("Starting container {id} on node {}", self.container.node);

        // A start that is already in flight is not interrupted by a stop request
        if let Err(error) = self
            .agent
            .start_container(&self.container, &self.context)
            .await
        {
            if self
                .state
                .transition(&[SupervisorState::Starting], SupervisorState::Failed)
            {
                log::warn!("Container {id} could not be started: {error}");
                self.finish(ContainerOutcome::StartFailed(error.to_string()));
            }
            return;
        }
        if !self
            .state
            .transition(&[SupervisorState::Starting], SupervisorState::Running)
        {
            self.stop_if_requested().await;
            return;
        }
        log::info!(
            "Container {id} launched on node {} with {}",
            self.container.node,
            self.container.resource
        );

        let mut interval = tokio::time::interval(self.config.poll_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        let mut status_error_count = 0;
        loop {
            tokio::select! {
                _ = &mut stop_receiver => break,
                _ = interval.tick() => {}
            }
            if self.state.get() != SupervisorState::Running {
                break;
            }
            let status = self.agent.get_container_status(&self.container).await;
            if self.state.get() != SupervisorState::Running {
                break;
            }
            match status {
                Ok(status) => {
                    status_error_count = 0;
                    if status.state == ContainerState::Complete {
                        let target = if status.exit_code == exit_status::SUCCESS {
                            SupervisorState::Completed
                        } else {
                            SupervisorState::Failed
                        };
                        if self.state.transition(&[SupervisorState::Running], target) {
                            self.finish(ContainerOutcome::Exited {
                                exit_code: status.exit_code,
                                diagnostics: status.diagnostics,
                            });
                        }
                        return;
                    }
                }
                Err(error) => {
                    status_error_count += 1;
                    if self.is_lost(&error, status_error_count) {
                        if self
                            .state
                            .transition(&[SupervisorState::Running], SupervisorState::Failed)
                        {
                            log::error!(
                                "Lost track of container {id}, considering it failed: {error}"
                            );
                            self.finish(ContainerOutcome::Lost(error.to_string()));
                        }
                        return;
                    }
                }
            }
        }
        self.stop_if_requested().await;
    }

    fn is_lost(&self, error: &GatewayError, status_error_count: u32) -> bool {
        log::warn!(
            "Cannot get status of container {} ({status_error_count}/{}): {error}",
            self.container.id,
            self.config.max_status_errors
        );
        error.is_permanent() || status_error_count >= self.config.max_status_errors
    }

    fn finish(&self, outcome: ContainerOutcome) {
        self.listener.on_container_finished(&self.container, outcome);
    }

    async fn stop_if_requested(&self) {
        if self.state.get() != SupervisorState::Stopping {
            return;
        }
        log::debug!("Stopping container {}", self.container.id);
        if let Err(error) = self.agent.stop_container(&self.container).await {
            log::warn!("Could not stop container {}: {error}", self.container.id);
        }
    }
}
