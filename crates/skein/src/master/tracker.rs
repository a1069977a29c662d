use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::Map;
use crate::get_or_return;
use crate::common::ids::ContainerId;
use crate::gateway::{Container, ContainerStatus, NodeAgent, Resource, ResourceAsk};
use crate::job::ContainerSpec;
use crate::job::launch::{LaunchContext, LaunchContextFactory};
use crate::master::config::SupervisorConfig;
use crate::master::supervisor::{
    ContainerOutcome, OutcomeKind, SupervisorHandle, SupervisorListener, spawn_supervisor,
};

/// Counters aggregated over all trackers of one application attempt. They never decrease.
#[derive(Debug, Default)]
pub struct JobCounters {
    requested: AtomicU64,
    completed: AtomicU64,
    failures: AtomicU64,
}

impl JobCounters {
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

enum Slot {
    Active(SupervisorHandle),
    /// Container has ended, the outcome was already counted
    Retired(OutcomeKind),
}

/// Reconciliation state of one [`ContainerSpec`].
pub struct ContainerTracker {
    spec: ContainerSpec,
    resource: Resource,
    context: LaunchContext,
    /// Instances wanted by the `ContainerSpec`
    target: u32,
    /// Instances to be completed, grows with every failed instance
    needed: AtomicU32,
    /// Instances asked from the cluster manager and not yet taken back by a failure
    requested: AtomicU32,
    completed: AtomicU32,
    failed: AtomicU32,
    stopping: AtomicBool,
    slots: Mutex<Map<ContainerId, Slot>>,
    releases: Mutex<Vec<ContainerId>>,
    agent: Arc<dyn NodeAgent>,
    counters: Arc<JobCounters>,
    config: SupervisorConfig,
}

impl ContainerTracker {
    pub fn new(
        spec: ContainerSpec,
        factory: &LaunchContextFactory,
        agent: Arc<dyn NodeAgent>,
        counters: Arc<JobCounters>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource: factory.resource(&spec),
            context: factory.create(&spec),
            target: spec.instances(),
            spec,
            needed: AtomicU32::new(0),
            requested: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
            slots: Default::default(),
            releases: Default::default(),
            agent,
            counters,
            config,
        })
    }

    pub fn initialize(&self) {
        self.needed.store(self.target, Ordering::Release);
        self.counters
            .requested
            .fetch_add(self.target as u64, Ordering::AcqRel);
        log::info!(
            "Tracking `{}`: {} instance(s) of {}, priority {}{}",
            self.spec.name(),
            self.target,
            self.resource,
            self.spec.priority(),
            self.spec
                .node()
                .map(|node| format!(", node {node}"))
                .unwrap_or_default()
        );
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn needed(&self) -> u32 {
        self.needed.load(Ordering::Acquire)
    }

    pub fn requested(&self) -> u32 {
        self.requested.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn needs_more(&self) -> bool {
        self.requested() < self.target || self.completed() < self.needed()
    }

    /// Containers that should be asked for in the next heartbeat.
    pub fn pending_ask(&self) -> Option<ResourceAsk> {
        if self.is_stopping() {
            return None;
        }
        let count = self.target.saturating_sub(self.requested());
        if count == 0 {
            return None;
        }
        Some(ResourceAsk {
            resource: self.resource,
            priority: self.spec.priority(),
            count,
            node: self.spec.node().map(|node| node.to_string()),
        })
    }

    /// The cluster manager has accepted an ask for `count` containers.
    pub fn ask_submitted(&self, count: u32) {
        self.requested.fetch_add(count, Ordering::AcqRel);
    }

    pub fn take_releases(&self) -> Vec<ContainerId> {
        std::mem::take(&mut *self.releases.lock())
    }

    /// Puts back releases that could not be delivered.
    pub fn return_releases(&self, releases: Vec<ContainerId>) {
        self.releases.lock().extend(releases);
    }

    pub fn is_tracking(&self, id: ContainerId) -> bool {
        self.slots.lock().contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    fn accepts_node(&self, container: &Container) -> bool {
        self.spec
            .node()
            .is_none_or(|node| node == container.node)
    }

    /// Starts a supervisor for `container` if this tracker still needs an instance on its node.
    pub fn try_launch(self: &Arc<Self>, container: &Container) -> bool {
        if self.is_stopping() || !self.accepts_node(container) {
            return false;
        }
        let mut slots = self.slots.lock();
        // `stop_all` raises the flag before it takes the lock
        if self.is_stopping() {
            return false;
        }
        if slots.contains_key(&container.id) {
            log::warn!(
                "Container {} is already tracked by `{}`, ignoring duplicate allocation",
                container.id,
                self.name()
            );
            return false;
        }
        let active = slots
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count() as u32;
        let succeeded = self.completed() - self.failed();
        if active + succeeded >= self.target {
            return false;
        }

        log::debug!(
            "Assigning container {} on node {} to `{}`",
            container.id,
            container.node,
            self.name()
        );
        let listener: Arc<dyn SupervisorListener> = self.clone();
        let handle = spawn_supervisor(
            container.clone(),
            self.context.clone(),
            self.agent.clone(),
            listener,
            self.config,
        );
        slots.insert(container.id, Slot::Active(handle));
        true
    }

    /// Handles a completion reported by the cluster manager. Returns `false` if the container
    /// does not belong to this tracker.
    pub fn on_container_completed(&self, status: &ContainerStatus) -> bool {
        if !self.is_tracking(status.id) {
            return false;
        }
        self.finish(
            status.id,
            ContainerOutcome::Exited {
                exit_code: status.exit_code,
                diagnostics: status.diagnostics.clone(),
            },
        );
        true
    }

    fn finish(&self, id: ContainerId, outcome: ContainerOutcome) {
        let mut slots = self.slots.lock();
        let slot = get_or_return!(slots.get_mut(&id));
        let handle = match slot {
            Slot::Active(handle) => handle,
            Slot::Retired(kind) => {
                log::debug!(
                    "Container {id} of `{}` already finished as {kind:?}, ignoring {}",
                    self.name(),
                    describe(&outcome)
                );
                return;
            }
        };
        let kind = outcome.kind();
        handle.retire(kind == OutcomeKind::Succeeded);
        *slot = Slot::Retired(kind);

        match kind {
            OutcomeKind::Succeeded => {
                self.completed.fetch_add(1, Ordering::AcqRel);
                self.counters.completed.fetch_add(1, Ordering::AcqRel);
                log::info!(
                    "Container {id} of `{}` finished successfully ({}/{} completed)",
                    self.name(),
                    self.completed(),
                    self.needed()
                );
            }
            OutcomeKind::Failed => {
                // Completed and needed grow together so that completed never exceeds needed
                self.needed.fetch_add(1, Ordering::AcqRel);
                self.completed.fetch_add(1, Ordering::AcqRel);
                self.failed.fetch_add(1, Ordering::AcqRel);
                decrement(&self.requested);
                self.counters.completed.fetch_add(1, Ordering::AcqRel);
                self.counters.failures.fetch_add(1, Ordering::AcqRel);
                if matches!(
                    outcome,
                    ContainerOutcome::Lost(_) | ContainerOutcome::StartFailed(_)
                ) {
                    self.releases.lock().push(id);
                }
                log::warn!(
                    "Container {id} of `{}` failed ({} failure(s) so far): {}",
                    self.name(),
                    self.failed(),
                    describe(&outcome)
                );
            }
            OutcomeKind::Aborted => {
                decrement(&self.requested);
                log::info!(
                    "Container {id} of `{}` was taken away by the cluster: {}",
                    self.name(),
                    describe(&outcome)
                );
            }
        }
    }

    /// Stops every running supervisor. Only the first call has an effect.
    pub fn stop_all(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut slots = self.slots.lock();
        let stopped = slots
            .values_mut()
            .filter_map(|slot| match slot {
                Slot::Active(handle) => Some(handle.stop()),
                Slot::Retired(_) => None,
            })
            .filter(|stopped| *stopped)
            .count();
        if stopped > 0 {
            log::info!("Stopping {stopped} container(s) of `{}`", self.name());
        }
    }
}

impl SupervisorListener for ContainerTracker {
    fn on_container_finished(&self, container: &Container, outcome: ContainerOutcome) {
        self.finish(container.id, outcome);
    }
}

fn decrement(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        value.checked_sub(1)
    });
}

fn describe(outcome: &ContainerOutcome) -> String {
    match outcome {
        ContainerOutcome::Exited {
            exit_code,
            diagnostics,
        } if diagnostics.is_empty() => format!("exit code {exit_code}"),
        ContainerOutcome::Exited {
            exit_code,
            diagnostics,
        } => format!("exit code {exit_code} ({diagnostics})"),
        ContainerOutcome::StartFailed(error) => format!("start failed: {error}"),
        ContainerOutcome::Lost(error) => format!("status unavailable: {error}"),
    }
}
