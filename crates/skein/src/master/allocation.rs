use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::Set;
use crate::common::ids::ContainerId;
use crate::gateway::{Container, ContainerStatus};
use crate::job::SurplusPolicy;
use crate::master::tracker::ContainerTracker;

/// Receives container events coming from the cluster manager.
pub trait AllocationListener: Send + Sync {
    fn on_containers_allocated(&self, containers: Vec<Container>);
    fn on_containers_completed(&self, statuses: Vec<ContainerStatus>);
}

/// Trackers of one application in registration order.
pub struct TrackerSet {
    trackers: Vec<Arc<ContainerTracker>>,
    /// Serializes matching of allocated and completed containers to trackers
    assign_lock: Mutex<()>,
    surplus: SurplusPolicy,
    surplus_releases: Mutex<Vec<ContainerId>>,
    unassigned: AtomicU64,
}

impl TrackerSet {
    pub fn new(trackers: Vec<Arc<ContainerTracker>>, surplus: SurplusPolicy) -> Self {
        Self {
            trackers,
            assign_lock: Mutex::new(()),
            surplus,
            surplus_releases: Default::default(),
            unassigned: AtomicU64::new(0),
        }
    }

    pub fn trackers(&self) -> &[Arc<ContainerTracker>] {
        &self.trackers
    }

    /// Total number of allocated containers that no tracker took.
    pub fn unassigned_count(&self) -> u64 {
        self.unassigned.load(Ordering::Acquire)
    }

    pub fn take_surplus_releases(&self) -> Vec<ContainerId> {
        std::mem::take(&mut *self.surplus_releases.lock())
    }

    pub fn return_surplus_releases(&self, releases: Vec<ContainerId>) {
        self.surplus_releases.lock().extend(releases);
    }

    pub fn stop_all(&self) {
        for tracker in &self.trackers {
            tracker.stop_all();
        }
    }

    fn owner_of(&self, id: ContainerId) -> Option<&Arc<ContainerTracker>> {
        self.trackers.iter().find(|tracker| tracker.is_tracking(id))
    }
}

impl AllocationListener for TrackerSet {
    fn on_containers_allocated(&self, containers: Vec<Container>) {
        let _guard = self.assign_lock.lock();
        let mut claimed: Set<ContainerId> = Set::default();
        let mut unassigned = Vec::new();

        for container in containers {
            if !claimed.insert(container.id) {
                log::warn!(
                    "Container {} was allocated twice in one response",
                    container.id
                );
                continue;
            }
            if let Some(owner) = self.owner_of(container.id) {
                log::warn!(
                    "Container {} is already tracked by `{}`, ignoring duplicate allocation",
                    container.id,
                    owner.name()
                );
                continue;
            }
            if !self
                .trackers
                .iter()
                .any(|tracker| tracker.try_launch(&container))
            {
                unassigned.push(container.id);
            }
        }

        if unassigned.is_empty() {
            return;
        }
        let total = self
            .unassigned
            .fetch_add(unassigned.len() as u64, Ordering::AcqRel)
            + unassigned.len() as u64;
        match self.surplus {
            SurplusPolicy::Keep => {
                log::warn!(
                    "{} allocated container(s) were not assigned to any tracker ({total} in total), keeping them",
                    unassigned.len()
                );
            }
            SurplusPolicy::Release => {
                log::warn!(
                    "{} allocated container(s) were not assigned to any tracker ({total} in total), releasing them",
                    unassigned.len()
                );
                self.surplus_releases.lock().extend(unassigned);
            }
        }
    }

    fn on_containers_completed(&self, statuses: Vec<ContainerStatus>) {
        let _guard = self.assign_lock.lock();
        for status in statuses {
            if !self
                .trackers
                .iter()
                .any(|tracker| tracker.on_container_completed(&status))
            {
                log::debug!(
                    "Completed container {} (exit code {}) does not belong to any tracker",
                    status.id,
                    status.exit_code
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{AllocationListener, TrackerSet};
    use crate::Set;
    use crate::common::ids::ContainerId;
    use crate::gateway::{ContainerStatus, Resource};
    use crate::job::launch::LaunchContextFactory;
    use crate::job::{ContainerSpec, CredentialBlob, SurplusPolicy};
    use crate::master::config::SupervisorConfig;
    use crate::master::tracker::{ContainerTracker, JobCounters};
    use crate::tests::cluster::{MockCluster, container};
    use crate::tests::utils::{simple_spec, spec_builder};

    fn create_set(
        cluster: &MockCluster,
        specs: Vec<ContainerSpec>,
        surplus: SurplusPolicy,
    ) -> TrackerSet {
        create_set_with_config(cluster, specs, surplus, SupervisorConfig::default())
    }

    fn create_set_with_config(
        cluster: &MockCluster,
        specs: Vec<ContainerSpec>,
        surplus: SurplusPolicy,
        config: SupervisorConfig,
    ) -> TrackerSet {
        let factory = LaunchContextFactory::new(
            Resource::new(1, 1),
            Resource::new(1024, 8),
            CredentialBlob::default(),
        );
        let counters = Arc::new(JobCounters::default());
        let trackers = specs
            .into_iter()
            .map(|spec| {
                let tracker = ContainerTracker::new(
                    spec,
                    &factory,
                    cluster.agent(),
                    counters.clone(),
                    config,
                );
                tracker.initialize();
                tracker
            })
            .collect();
        TrackerSet::new(trackers, surplus)
    }

    fn active_counts(set: &TrackerSet) -> Vec<usize> {
        set.trackers().iter().map(|t| t.active_count()).collect()
    }

    #[tokio::test]
    async fn first_tracker_wins() {
        let cluster = MockCluster::new();
        let set = create_set(
            &cluster,
            vec![simple_spec("a", 2), simple_spec("b", 2)],
            SurplusPolicy::Keep,
        );
        set.on_containers_allocated(vec![
            container(1, "n"),
            container(2, "n"),
            container(3, "n"),
        ]);
        assert_eq!(active_counts(&set), vec![2, 1]);
    }

    #[tokio::test]
    async fn node_affinity_skips_tracker() {
        let cluster = MockCluster::new();
        let set = create_set(
            &cluster,
            vec![
                spec_builder("a").node("node-1").build().unwrap(),
                simple_spec("b", 1),
            ],
            SurplusPolicy::Keep,
        );
        set.on_containers_allocated(vec![container(1, "node-2"), container(2, "node-1")]);
        assert!(set.trackers()[1].is_tracking(ContainerId::new(1)));
        assert!(set.trackers()[0].is_tracking(ContainerId::new(2)));
    }

    #[tokio::test]
    async fn duplicates_are_claimed_once() {
        let cluster = MockCluster::new();
        let set = create_set(
            &cluster,
            vec![simple_spec("a", 1), simple_spec("b", 1)],
            SurplusPolicy::Keep,
        );
        set.on_containers_allocated(vec![container(1, "n"), container(1, "n")]);
        set.on_containers_allocated(vec![container(1, "n")]);
        assert_eq!(active_counts(&set), vec![1, 0]);
        assert_eq!(set.unassigned_count(), 0);
    }

    #[tokio::test]
    async fn surplus_is_kept_by_default() {
        let cluster = MockCluster::new();
        let set = create_set(&cluster, vec![simple_spec("a", 1)], SurplusPolicy::Keep);
        set.on_containers_allocated(vec![container(1, "n"), container(2, "n")]);
        assert_eq!(set.unassigned_count(), 1);
        assert!(set.take_surplus_releases().is_empty());
    }

    #[tokio::test]
    async fn surplus_can_be_released() {
        let cluster = MockCluster::new();
        let set = create_set(&cluster, vec![simple_spec("a", 1)], SurplusPolicy::Release);
        set.on_containers_allocated(vec![container(1, "n"), container(2, "n")]);
        assert_eq!(set.take_surplus_releases(), vec![ContainerId::new(2)]);
        assert!(set.take_surplus_releases().is_empty());
    }

    #[tokio::test]
    async fn completions_reach_owner() {
        let cluster = MockCluster::new();
        let set = create_set(
            &cluster,
            vec![simple_spec("a", 1), simple_spec("b", 1)],
            SurplusPolicy::Keep,
        );
        set.on_containers_allocated(vec![container(1, "n"), container(2, "n")]);
        set.on_containers_completed(vec![
            ContainerStatus::completed(ContainerId::new(2), 0, ""),
            ContainerStatus::completed(ContainerId::new(9), 0, ""),
        ]);
        assert_eq!(set.trackers()[0].completed(), 0);
        assert_eq!(set.trackers()[1].completed(), 1);
    }

    fn exit_code_of(id: u64) -> i32 {
        if id % 3 == 0 { 1 } else { 0 }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_callbacks_claim_each_container_once() {
        let cluster = MockCluster::new();
        for id in 1..=20u64 {
            cluster.exit_container(ContainerId::new(id), exit_code_of(id));
        }
        let set = Arc::new(create_set_with_config(
            &cluster,
            vec![simple_spec("a", 10), simple_spec("b", 10)],
            SurplusPolicy::Keep,
            SupervisorConfig {
                poll_period: Duration::from_millis(5),
                max_status_errors: 3,
            },
        ));

        let mut tasks = vec![];
        for worker in 0..8u64 {
            let set = set.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..50u64 {
                    let ids: Vec<u64> = (0..20u64)
                        .map(|i| (i + worker + round) % 20 + 1)
                        .collect();
                    let allocated = ids.iter().map(|id| container(*id, "n")).collect();
                    set.on_containers_allocated(allocated);
                    set.on_containers_completed(
                        ids.iter()
                            .take(5)
                            .map(|id| {
                                ContainerStatus::completed(
                                    ContainerId::new(*id),
                                    exit_code_of(*id),
                                    "",
                                )
                            })
                            .collect(),
                    );
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = cluster.started_ids();
        let distinct: Set<ContainerId> = started.iter().copied().collect();
        assert_eq!(started.len(), distinct.len());

        let mut finished = 0;
        for tracker in set.trackers() {
            assert!(tracker.completed() <= tracker.needed());
            assert!(tracker.failed() <= tracker.completed());
            finished += tracker.completed() as usize;
        }
        assert!(finished <= distinct.len());
    }
}
