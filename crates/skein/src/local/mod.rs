//! Cluster that runs everything on the local machine.
//!
//! Application masters are hosted in-process as tasks, containers are local processes. It
//! implements all gateway traits so the client and the master can be exercised without a real
//! cluster.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::Map;
use crate::common::error::SkeinError;
use crate::common::ids::{ApplicationId, ContainerId, IdCounter};
use crate::common::utils::local_hostname;
use crate::gateway::{
    AllocateRequest, AllocateResponse, ApplicationClient, ApplicationReport, ApplicationState,
    Container, ContainerState, ContainerStatus, FinalApplicationStatus, GatewayError,
    GatewayResult, NewApplication, NodeAgent, RegisterRequest, RegisterResponse, Resource,
    ResourceAsk, ResourceManager, SubmissionContext, exit_status,
};
use crate::job::launch::LaunchContext;
use crate::master::config::{
    MAX_STATUS_ERROR_COUNT, MasterConfig, SupervisorConfig, get_status_poll_period,
    get_tick_period,
};
use crate::master::{plan_from_context, run_master};

pub mod process;

#[derive(Debug, Clone)]
pub struct LocalClusterConfig {
    pub work_dir: PathBuf,
    pub nodes: Vec<String>,
    pub min_capability: Resource,
    pub max_capability: Resource,
    pub tick_period: Duration,
    pub status_poll_period: Duration,
}

impl LocalClusterConfig {
    pub fn new(work_dir: PathBuf) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            work_dir,
            nodes: vec![local_hostname()],
            min_capability: Resource::new(32, 1),
            max_capability: Resource::new(64 * 1024, cpus),
            tick_period: get_tick_period(),
            status_poll_period: get_status_poll_period(),
        }
    }
}

struct Application {
    report: ApplicationReport,
    pending: Vec<ResourceAsk>,
    /// Completed containers not yet returned by an allocate call
    completed: Vec<ContainerStatus>,
    containers: Vec<ContainerId>,
    stop_master: Option<oneshot::Sender<()>>,
}

struct LocalContainer {
    application: ApplicationId,
    status: ContainerStatus,
    pid: Option<u32>,
    stop_requested: bool,
}

struct ClusterState {
    application_ids: IdCounter,
    container_ids: IdCounter,
    next_node: usize,
    applications: Map<ApplicationId, Application>,
    containers: Map<ContainerId, LocalContainer>,
}

impl ClusterState {
    fn application_mut(&mut self, id: ApplicationId) -> GatewayResult<&mut Application> {
        self.applications
            .get_mut(&id)
            .ok_or(GatewayError::UnknownApplication(id))
    }

    fn grant(&mut self, id: ApplicationId, config: &LocalClusterConfig) -> Vec<Container> {
        let ClusterState {
            applications,
            containers,
            container_ids,
            next_node,
            ..
        } = self;
        let Some(application) = applications.get_mut(&id) else {
            return vec![];
        };

        let mut allocated = vec![];
        let mut waiting = vec![];
        for ask in std::mem::take(&mut application.pending) {
            if let Some(node) = &ask.node {
                if !config.nodes.contains(node) {
                    waiting.push(ask);
                    continue;
                }
            }
            if config.nodes.is_empty() {
                waiting.push(ask);
                continue;
            }
            for _ in 0..ask.count {
                let node = match &ask.node {
                    Some(node) => node.clone(),
                    None => {
                        let node = config.nodes[*next_node % config.nodes.len()].clone();
                        *next_node += 1;
                        node
                    }
                };
                let container = Container {
                    id: ContainerId::new(container_ids.increment()),
                    node,
                    resource: ask
                        .resource
                        .clamp(&config.min_capability, &config.max_capability),
                    priority: ask.priority,
                };
                containers.insert(
                    container.id,
                    LocalContainer {
                        application: id,
                        status: ContainerStatus {
                            id: container.id,
                            state: ContainerState::New,
                            exit_code: exit_status::INVALID,
                            diagnostics: String::new(),
                        },
                        pid: None,
                        stop_requested: false,
                    },
                );
                application.containers.push(container.id);
                allocated.push(container);
            }
        }
        application.pending = waiting;
        allocated
    }

    fn finish_container(&mut self, id: ContainerId, exit_code: i32, diagnostics: String) {
        let Some(container) = self.containers.get_mut(&id) else {
            return;
        };
        if container.status.state == ContainerState::Complete {
            return;
        }
        container.pid = None;
        container.status = ContainerStatus::completed(id, exit_code, diagnostics);
        let status = container.status.clone();
        if let Some(application) = self.applications.get_mut(&container.application) {
            application.completed.push(status);
        }
    }

    fn stop_container(&mut self, id: ContainerId, diagnostics: &str) {
        let Some(container) = self.containers.get_mut(&id) else {
            return;
        };
        match (container.status.state, container.pid) {
            (ContainerState::Complete, _) => {}
            (_, Some(pid)) => {
                container.stop_requested = true;
                process::terminate(pid);
            }
            (_, None) => {
                self.finish_container(id, exit_status::ABORTED, diagnostics.to_string());
            }
        }
    }

    fn stop_application_containers(&mut self, id: ApplicationId, diagnostics: &str) {
        let ids = match self.applications.get(&id) {
            Some(application) => application.containers.clone(),
            None => return,
        };
        for container_id in ids {
            self.stop_container(container_id, diagnostics);
        }
    }
}

#[derive(Clone)]
pub struct LocalCluster {
    config: Arc<LocalClusterConfig>,
    state: Arc<Mutex<ClusterState>>,
}

impl LocalCluster {
    pub fn new(config: LocalClusterConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(ClusterState {
                application_ids: IdCounter::new(1),
                container_ids: IdCounter::new(1),
                next_node: 0,
                applications: Default::default(),
                containers: Default::default(),
            })),
        }
    }

    pub fn config(&self) -> &LocalClusterConfig {
        &self.config
    }

    fn application_dir(&self, id: ApplicationId) -> PathBuf {
        self.config.work_dir.join(format!("app-{id}"))
    }

    /// Resource manager endpoint for the master of application `id`.
    pub fn resource_manager(&self, id: ApplicationId) -> LocalResourceManager {
        LocalResourceManager {
            cluster: self.clone(),
            application: id,
        }
    }

    fn master_config(&self, id: ApplicationId, plan: &crate::job::MasterPlan) -> MasterConfig {
        MasterConfig {
            tracking_url: Some(format!("file://{}", self.application_dir(id).display())),
            tick_period: self.config.tick_period,
            supervisor: SupervisorConfig {
                poll_period: self.config.status_poll_period,
                max_status_errors: MAX_STATUS_ERROR_COUNT,
            },
            ..MasterConfig::from_plan(plan)
        }
    }

    fn accept(&self, context: &SubmissionContext) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let application = state.application_mut(context.id)?;
        if application.report.state != ApplicationState::New {
            return Err(GatewayError::Rejected(format!(
                "Application {} was already submitted",
                context.id
            )));
        }
        application.report.name = context.name.clone();
        application.report.queue = context.queue.clone();
        application.report.state = ApplicationState::Accepted;
        Ok(())
    }

    fn fail_application(&self, id: ApplicationId, diagnostics: String) {
        let mut state = self.state.lock();
        if let Some(application) = state.applications.get_mut(&id) {
            if application.report.state.is_terminal() {
                return;
            }
            application.report.state = ApplicationState::Failed;
            application.report.final_status = FinalApplicationStatus::Failed;
            application.report.diagnostics = diagnostics;
            application.report.finish_time = Some(Utc::now());
        }
        state.stop_application_containers(id, "Application failed");
    }

    fn launch_master(&self, context: SubmissionContext) {
        let id = context.id;
        let plan = match plan_from_context(&context.master) {
            Ok(plan) => plan,
            Err(error) => {
                log::error!("Application {id} cannot be started: {error}");
                self.fail_application(id, error.to_string());
                return;
            }
        };
        let config = self.master_config(id, &plan);
        let (sender, receiver) = oneshot::channel::<()>();
        if let Some(application) = self.state.lock().applications.get_mut(&id) {
            application.stop_master = Some(sender);
        }
        log::debug!(
            "Starting master of application {id} with {}",
            context.resource
        );

        let cluster = self.clone();
        tokio::spawn(async move {
            let rm: Arc<dyn ResourceManager> = Arc::new(cluster.resource_manager(id));
            let agent: Arc<dyn NodeAgent> = Arc::new(cluster.clone());
            let shutdown = async move {
                let _ = receiver.await;
            };
            let status = run_master(config, plan, &context.master, rm, agent, shutdown).await;
            cluster.on_master_exit(id, status);
        });
    }

    fn on_master_exit(&self, id: ApplicationId, status: FinalApplicationStatus) {
        let registered = {
            let state = self.state.lock();
            state
                .applications
                .get(&id)
                .is_some_and(|app| app.report.state != ApplicationState::Accepted)
        };
        if !registered {
            self.fail_application(
                id,
                format!("Application master exited with status {status:?} before registering"),
            );
        }
    }

    fn kill(&self, id: ApplicationId) -> GatewayResult<()> {
        let mut state = self.state.lock();
        let application = state.application_mut(id)?;
        if application.report.state.is_terminal() {
            return Ok(());
        }
        log::info!("Killing application {id}");
        application.report.state = ApplicationState::Killed;
        application.report.final_status = FinalApplicationStatus::Killed;
        application.report.diagnostics = "Application was killed".to_string();
        application.report.finish_time = Some(Utc::now());
        if let Some(sender) = application.stop_master.take() {
            let _ = sender.send(());
        }
        state.stop_application_containers(id, "Application was killed");
        Ok(())
    }

    fn launch(&self, container: &Container, context: &LaunchContext) -> GatewayResult<()> {
        let app_dir = {
            let state = self.state.lock();
            let entry = state
                .containers
                .get(&container.id)
                .ok_or(GatewayError::UnknownContainer(container.id))?;
            if entry.status.state != ContainerState::New {
                return Err(GatewayError::Rejected(format!(
                    "Container {} cannot be started again",
                    container.id
                )));
            }
            self.application_dir(entry.application)
        };

        let mut command =
            process::container_command(container, context, &app_dir).map_err(|e| match e {
                SkeinError::DeserializationError(msg) => GatewayError::Credentials(msg),
                e => GatewayError::Rejected(e.to_string()),
            })?;
        let mut child = command.spawn()?;

        {
            let mut state = self.state.lock();
            if let Some(entry) = state.containers.get_mut(&container.id) {
                entry.pid = child.id();
                entry.status = ContainerStatus::running(container.id);
            }
        }

        let cluster = self.clone();
        let id = container.id;
        tokio::spawn(async move {
            let result = child.wait().await;
            let mut state = cluster.state.lock();
            let stop_requested = state
                .containers
                .get(&id)
                .is_some_and(|entry| entry.stop_requested);
            let (exit_code, diagnostics) = match result {
                _ if stop_requested => (exit_status::ABORTED, "Container was stopped".to_string()),
                Ok(status) => {
                    let code = process::exit_code(status);
                    (code, format!("Exited with code {code}"))
                }
                Err(error) => (
                    exit_status::INVALID,
                    format!("Could not wait for container: {error}"),
                ),
            };
            log::debug!("Container {id} finished: {diagnostics}");
            state.finish_container(id, exit_code, diagnostics);
        });
        Ok(())
    }
}

/// Resource manager endpoint bound to one application.
pub struct LocalResourceManager {
    cluster: LocalCluster,
    application: ApplicationId,
}

impl LocalResourceManager {
    fn do_register(&self, request: RegisterRequest) -> GatewayResult<RegisterResponse> {
        let config = &self.cluster.config;
        let tracking_url = request
            .tracking_url
            .unwrap_or_else(|| format!("http://{}:{}", request.host, request.rpc_port));
        let mut state = self.cluster.state.lock();
        let application = state.application_mut(self.application)?;
        if application.report.state != ApplicationState::Accepted {
            return Err(GatewayError::Rejected(format!(
                "Application {} cannot register in state {:?}",
                self.application, application.report.state
            )));
        }
        application.report.state = ApplicationState::Running;
        application.report.tracking_url = Some(tracking_url);
        Ok(RegisterResponse {
            min_capability: config.min_capability,
            max_capability: config.max_capability,
        })
    }

    fn do_allocate(&self, request: AllocateRequest) -> GatewayResult<AllocateResponse> {
        let config = &self.cluster.config;
        let mut state = self.cluster.state.lock();
        let application = state.application_mut(self.application)?;
        match application.report.state {
            ApplicationState::Running => {}
            ApplicationState::Killed => {
                return Ok(AllocateResponse {
                    shutdown_requested: true,
                    ..Default::default()
                });
            }
            other => {
                return Err(GatewayError::Rejected(format!(
                    "Application {} cannot allocate in state {other:?}",
                    self.application
                )));
            }
        }
        application.report.progress = request.progress;
        for ask in request.asks {
            if let Some(node) = &ask.node {
                if !config.nodes.contains(node) {
                    log::warn!(
                        "Application {} asks for unknown node `{node}`, the ask stays pending",
                        self.application
                    );
                }
            }
            application.pending.push(ask);
        }
        for id in request.releases {
            let owned = state
                .containers
                .get(&id)
                .is_some_and(|c| c.application == self.application);
            if owned {
                state.stop_container(id, "Container was released");
            }
        }

        let allocated = state.grant(self.application, config);
        let application = state.application_mut(self.application)?;
        Ok(AllocateResponse {
            allocated,
            completed: std::mem::take(&mut application.completed),
            shutdown_requested: false,
        })
    }

    fn do_unregister(
        &self,
        status: FinalApplicationStatus,
        message: Option<String>,
    ) -> GatewayResult<()> {
        let mut state = self.cluster.state.lock();
        let application = state.application_mut(self.application)?;
        if application.report.state != ApplicationState::Killed {
            application.report.state = ApplicationState::Finished;
            application.report.final_status = status;
            application.report.diagnostics = message.unwrap_or_default();
            application.report.finish_time = Some(Utc::now());
            if status == FinalApplicationStatus::Succeeded {
                application.report.progress = 1.0;
            }
        }
        state.stop_application_containers(self.application, "Application finished");
        Ok(())
    }
}

impl ResourceManager for LocalResourceManager {
    fn register(
        &self,
        request: RegisterRequest,
    ) -> BoxFuture<'static, GatewayResult<RegisterResponse>> {
        let result = self.do_register(request);
        Box::pin(async move { result })
    }

    fn allocate(
        &self,
        request: AllocateRequest,
    ) -> BoxFuture<'static, GatewayResult<AllocateResponse>> {
        let result = self.do_allocate(request);
        Box::pin(async move { result })
    }

    fn unregister(
        &self,
        status: FinalApplicationStatus,
        message: Option<String>,
    ) -> BoxFuture<'static, GatewayResult<()>> {
        let result = self.do_unregister(status, message);
        Box::pin(async move { result })
    }
}

impl NodeAgent for LocalCluster {
    fn start_container(
        &self,
        container: &Container,
        context: &LaunchContext,
    ) -> BoxFuture<'static, GatewayResult<()>> {
        let result = self.launch(container, context);
        Box::pin(async move { result })
    }

    fn get_container_status(
        &self,
        container: &Container,
    ) -> BoxFuture<'static, GatewayResult<ContainerStatus>> {
        let result = self
            .state
            .lock()
            .containers
            .get(&container.id)
            .map(|entry| entry.status.clone())
            .ok_or(GatewayError::UnknownContainer(container.id));
        Box::pin(async move { result })
    }

    fn stop_container(&self, container: &Container) -> BoxFuture<'static, GatewayResult<()>> {
        self.state
            .lock()
            .stop_container(container.id, "Container was stopped");
        Box::pin(async move { Ok(()) })
    }
}

impl ApplicationClient for LocalCluster {
    fn create_application(&self) -> BoxFuture<'static, GatewayResult<NewApplication>> {
        let mut state = self.state.lock();
        let id = ApplicationId::new(state.application_ids.increment() as u32);
        state.applications.insert(
            id,
            Application {
                report: ApplicationReport {
                    id,
                    name: String::new(),
                    queue: String::new(),
                    state: ApplicationState::New,
                    final_status: FinalApplicationStatus::Undefined,
                    tracking_url: None,
                    diagnostics: String::new(),
                    start_time: Utc::now(),
                    finish_time: None,
                    progress: 0.0,
                },
                pending: vec![],
                completed: vec![],
                containers: vec![],
                stop_master: None,
            },
        );
        let application = NewApplication {
            id,
            min_capability: self.config.min_capability,
            max_capability: self.config.max_capability,
        };
        Box::pin(async move { Ok(application) })
    }

    fn submit_application(
        &self,
        context: SubmissionContext,
    ) -> BoxFuture<'static, GatewayResult<()>> {
        let result = self.accept(&context);
        if result.is_ok() {
            self.launch_master(context);
        }
        Box::pin(async move { result })
    }

    fn get_application_report(
        &self,
        id: ApplicationId,
    ) -> BoxFuture<'static, GatewayResult<Option<ApplicationReport>>> {
        let report = self
            .state
            .lock()
            .applications
            .get(&id)
            .map(|application| application.report.clone());
        Box::pin(async move { Ok(report) })
    }

    fn kill_application(&self, id: ApplicationId) -> BoxFuture<'static, GatewayResult<()>> {
        let result = self.kill(id);
        Box::pin(async move { result })
    }
}
