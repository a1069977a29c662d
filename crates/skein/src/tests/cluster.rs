use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::common::ids::{ApplicationId, ContainerId, IdCounter};
use crate::gateway::{
    AllocateRequest, AllocateResponse, ApplicationClient, ApplicationReport, ApplicationState,
    Container, ContainerStatus, FinalApplicationStatus, GatewayError, GatewayResult,
    NewApplication, NodeAgent, RegisterRequest, RegisterResponse, Resource, ResourceManager,
    SubmissionContext,
};
use crate::job::launch::LaunchContext;
use crate::{Map, Set};

/// Scriptable in-memory cluster. Every call is recorded in [`MockState`].
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<Mutex<MockState>>,
}

pub struct MockState {
    pub min_capability: Resource,
    pub max_capability: Resource,
    pub register_error: Option<GatewayError>,
    pub registrations: Vec<RegisterRequest>,

    pub allocate_requests: Vec<AllocateRequest>,
    pub allocate_errors: VecDeque<GatewayError>,
    pub next_response: AllocateResponse,
    /// Grant every ask right away
    pub auto_grant: bool,
    pub unregistered: Vec<(FinalApplicationStatus, Option<String>)>,
    pub unregister_error: Option<GatewayError>,

    pub started: Vec<(Container, LaunchContext)>,
    pub start_errors: Map<ContainerId, GatewayError>,
    pub statuses: Map<ContainerId, ContainerStatus>,
    pub status_errors: Map<ContainerId, VecDeque<GatewayError>>,
    pub status_calls: Map<ContainerId, u32>,
    pub stopped: Vec<ContainerId>,

    pub create_error: Option<GatewayError>,
    pub submit_error: Option<GatewayError>,
    pub submissions: Vec<SubmissionContext>,
    pub report: Option<ApplicationReport>,
    pub report_errors: VecDeque<GatewayError>,
    pub report_calls: u32,
    pub killed: Vec<ApplicationId>,

    container_ids: IdCounter,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                min_capability: Resource::new(1, 1),
                max_capability: Resource::new(64 * 1024, 64),
                register_error: None,
                registrations: vec![],
                allocate_requests: vec![],
                allocate_errors: Default::default(),
                next_response: Default::default(),
                auto_grant: false,
                unregistered: vec![],
                unregister_error: None,
                started: vec![],
                start_errors: Default::default(),
                statuses: Default::default(),
                status_errors: Default::default(),
                status_calls: Default::default(),
                stopped: vec![],
                create_error: None,
                submit_error: None,
                submissions: vec![],
                report: None,
                report_errors: Default::default(),
                report_calls: 0,
                killed: vec![],
                container_ids: IdCounter::new(1000),
            })),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn rm(&self) -> Arc<dyn ResourceManager> {
        Arc::new(self.clone())
    }

    pub fn agent(&self) -> Arc<dyn NodeAgent> {
        Arc::new(self.clone())
    }

    pub fn client(&self) -> Arc<dyn ApplicationClient> {
        Arc::new(self.clone())
    }

    /// Returns the container in the next allocate response.
    pub fn grant(&self, container: Container) {
        self.with(|s| s.next_response.allocated.push(container));
    }

    /// Makes the node agent report the container as finished.
    pub fn exit_container(&self, id: ContainerId, exit_code: i32) {
        self.with(|s| {
            s.statuses
                .insert(id, ContainerStatus::completed(id, exit_code, ""));
        });
    }

    /// Reports the container as completed in the next allocate response.
    pub fn report_completed(&self, id: ContainerId, exit_code: i32) {
        self.with(|s| {
            s.next_response
                .completed
                .push(ContainerStatus::completed(id, exit_code, "exited"));
        });
    }

    pub fn started_ids(&self) -> Vec<ContainerId> {
        self.with(|s| s.started.iter().map(|(c, _)| c.id).collect())
    }

    pub fn stopped_ids(&self) -> Vec<ContainerId> {
        self.with(|s| s.stopped.clone())
    }

    pub fn status_calls(&self, id: ContainerId) -> u32 {
        self.with(|s| s.status_calls.get(&id).copied().unwrap_or(0))
    }

    /// Sum of all asked container counts.
    pub fn asked_count(&self) -> u32 {
        self.with(|s| {
            s.allocate_requests
                .iter()
                .flat_map(|r| r.asks.iter())
                .map(|ask| ask.count)
                .sum()
        })
    }

    pub fn released_ids(&self) -> Set<ContainerId> {
        self.with(|s| {
            s.allocate_requests
                .iter()
                .flat_map(|r| r.releases.iter().copied())
                .collect()
        })
    }

    pub fn set_report(&self, state: ApplicationState, final_status: FinalApplicationStatus) {
        self.with(|s| s.report = Some(report(ApplicationId::new(1), state, final_status)));
    }
}

impl MockState {
    fn allocate(&mut self, request: AllocateRequest) -> GatewayResult<AllocateResponse> {
        self.allocate_requests.push(request.clone());
        if let Some(error) = self.allocate_errors.pop_front() {
            return Err(error);
        }
        let mut response = std::mem::take(&mut self.next_response);
        if self.auto_grant {
            for ask in &request.asks {
                for _ in 0..ask.count {
                    let id = ContainerId::new(self.container_ids.increment());
                    response.allocated.push(Container {
                        id,
                        node: ask.node.clone().unwrap_or_else(|| "node-0".to_string()),
                        resource: ask.resource,
                        priority: ask.priority,
                    });
                }
            }
        }
        Ok(response)
    }

    fn container_status(&mut self, container: &Container) -> GatewayResult<ContainerStatus> {
        *self.status_calls.entry(container.id).or_default() += 1;
        if let Some(error) = self
            .status_errors
            .get_mut(&container.id)
            .and_then(|errors| errors.pop_front())
        {
            return Err(error);
        }
        if let Some(status) = self.statuses.get(&container.id) {
            return Ok(status.clone());
        }
        if self.started.iter().any(|(c, _)| c.id == container.id) {
            Ok(ContainerStatus::running(container.id))
        } else {
            Err(GatewayError::UnknownContainer(container.id))
        }
    }
}

fn ready<T: Send + 'static>(value: T) -> BoxFuture<'static, T> {
    Box::pin(async move { value })
}

impl ResourceManager for MockCluster {
    fn register(
        &self,
        request: RegisterRequest,
    ) -> BoxFuture<'static, GatewayResult<RegisterResponse>> {
        let result = self.with(|s| {
            s.registrations.push(request);
            match &s.register_error {
                Some(error) => Err(error.clone()),
                None => Ok(RegisterResponse {
                    min_capability: s.min_capability,
                    max_capability: s.max_capability,
                }),
            }
        });
        ready(result)
    }

    fn allocate(
        &self,
        request: AllocateRequest,
    ) -> BoxFuture<'static, GatewayResult<AllocateResponse>> {
        let result = self.with(|s| s.allocate(request));
        ready(result)
    }

    fn unregister(
        &self,
        status: FinalApplicationStatus,
        message: Option<String>,
    ) -> BoxFuture<'static, GatewayResult<()>> {
        let result = self.with(|s| {
            s.unregistered.push((status, message));
            s.unregister_error.clone().map_or(Ok(()), Err)
        });
        ready(result)
    }
}

impl NodeAgent for MockCluster {
    fn start_container(
        &self,
        container: &Container,
        context: &LaunchContext,
    ) -> BoxFuture<'static, GatewayResult<()>> {
        let result = self.with(|s| {
            if let Some(error) = s.start_errors.get(&container.id) {
                return Err(error.clone());
            }
            s.started.push((container.clone(), context.clone()));
            Ok(())
        });
        ready(result)
    }

    fn get_container_status(
        &self,
        container: &Container,
    ) -> BoxFuture<'static, GatewayResult<ContainerStatus>> {
        let result = self.with(|s| s.container_status(container));
        ready(result)
    }

    fn stop_container(&self, container: &Container) -> BoxFuture<'static, GatewayResult<()>> {
        self.with(|s| s.stopped.push(container.id));
        ready(Ok(()))
    }
}

impl ApplicationClient for MockCluster {
    fn create_application(&self) -> BoxFuture<'static, GatewayResult<NewApplication>> {
        let result = self.with(|s| match &s.create_error {
            Some(error) => Err(error.clone()),
            None => Ok(NewApplication {
                id: ApplicationId::new(1),
                min_capability: s.min_capability,
                max_capability: s.max_capability,
            }),
        });
        ready(result)
    }

    fn submit_application(
        &self,
        context: SubmissionContext,
    ) -> BoxFuture<'static, GatewayResult<()>> {
        let result = self.with(|s| {
            s.submissions.push(context);
            s.submit_error.clone().map_or(Ok(()), Err)
        });
        ready(result)
    }

    fn get_application_report(
        &self,
        _id: ApplicationId,
    ) -> BoxFuture<'static, GatewayResult<Option<ApplicationReport>>> {
        let result = self.with(|s| {
            s.report_calls += 1;
            match s.report_errors.pop_front() {
                Some(error) => Err(error),
                None => Ok(s.report.clone()),
            }
        });
        ready(result)
    }

    fn kill_application(&self, id: ApplicationId) -> BoxFuture<'static, GatewayResult<()>> {
        self.with(|s| s.killed.push(id));
        ready(Ok(()))
    }
}

pub fn container(id: u64, node: &str) -> Container {
    Container {
        id: ContainerId::new(id),
        node: node.to_string(),
        resource: Resource::new(100, 1),
        priority: 0,
    }
}

pub fn report(
    id: ApplicationId,
    state: ApplicationState,
    final_status: FinalApplicationStatus,
) -> ApplicationReport {
    ApplicationReport {
        id,
        name: "job".to_string(),
        queue: "default".to_string(),
        state,
        final_status,
        tracking_url: Some("http://localhost:8088/app/1".to_string()),
        diagnostics: String::new(),
        start_time: Utc::now(),
        finish_time: None,
        progress: 0.0,
    }
}
