//! Capability surface consumed from the cluster.
//!
//! The cluster manager grants containers and tracks applications, node agents start and observe
//! processes inside granted containers. Every call returns a `'static` future so that callers can
//! spawn it or await it without borrowing the gateway.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Priority;
use crate::common::ids::{ApplicationId, ContainerId};
use crate::job::launch::LaunchContext;

/// Exit codes with a special meaning reported by the cluster for containers.
pub mod exit_status {
    pub const SUCCESS: i32 = 0;
    pub const INVALID: i32 = -1000;
    /// Container was released or killed by the framework.
    pub const ABORTED: i32 = -100;
    /// Container was preempted by the scheduler.
    pub const PREEMPTED: i32 = -102;

    /// Codes that mean the cluster took the container away. They are not failures of the
    /// container itself.
    pub fn is_administrative(code: i32) -> bool {
        matches!(code, ABORTED | PREEMPTED)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Cluster is unreachable: {0}")]
    Unreachable(String),
    #[error("Request was rejected: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Invalid credentials: {0}")]
    Credentials(String),
    #[error("Unknown container {0}")]
    UnknownContainer(ContainerId),
    #[error("Unknown application {0}")]
    UnknownApplication(ApplicationId),
}

impl GatewayError {
    /// Permanent errors will not go away by repeating the same request.
    pub fn is_permanent(&self) -> bool {
        match self {
            GatewayError::Credentials(_)
            | GatewayError::UnknownContainer(_)
            | GatewayError::UnknownApplication(_) => true,
            GatewayError::Unreachable(_) | GatewayError::Rejected(_) | GatewayError::Io(_) => {
                false
            }
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Resource {
    /// Memory in MiB
    pub memory: u64,
    pub vcores: u32,
}

impl Resource {
    pub fn new(memory: u64, vcores: u32) -> Self {
        Self { memory, vcores }
    }

    /// Clamps every dimension into `[min, max]`. `max` wins if the bounds cross.
    pub fn clamp(&self, min: &Resource, max: &Resource) -> Resource {
        Resource {
            memory: self.memory.max(min.memory).min(max.memory),
            vcores: self.vcores.max(min.vcores).min(max.vcores),
        }
    }
}

impl Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<memory: {} MiB, vcores: {}>", self.memory, self.vcores)
    }
}

/// A container granted by the cluster manager.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: ContainerId,
    pub node: String,
    pub resource: Resource,
    pub priority: Priority,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    New,
    Running,
    Complete,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub state: ContainerState,
    pub exit_code: i32,
    pub diagnostics: String,
}

impl ContainerStatus {
    pub fn completed(id: ContainerId, exit_code: i32, diagnostics: impl Into<String>) -> Self {
        Self {
            id,
            state: ContainerState::Complete,
            exit_code,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn running(id: ContainerId) -> Self {
        Self {
            id,
            state: ContainerState::Running,
            exit_code: exit_status::INVALID,
            diagnostics: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub host: String,
    pub rpc_port: u16,
    pub tracking_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegisterResponse {
    pub min_capability: Resource,
    pub max_capability: Resource,
}

/// Asks for `count` additional containers of the given shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAsk {
    pub resource: Resource,
    pub priority: Priority,
    pub count: u32,
    pub node: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AllocateRequest {
    pub asks: Vec<ResourceAsk>,
    pub releases: Vec<ContainerId>,
    /// Application progress in `[0, 1]`
    pub progress: f32,
}

#[derive(Debug, Clone, Default)]
pub struct AllocateResponse {
    pub allocated: Vec<Container>,
    pub completed: Vec<ContainerStatus>,
    pub shutdown_requested: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalApplicationStatus {
    Undefined,
    Succeeded,
    Failed,
    Killed,
}

impl FinalApplicationStatus {
    pub fn is_definitive(&self) -> bool {
        !matches!(self, FinalApplicationStatus::Undefined)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    New,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
}

impl ApplicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationState::Finished | ApplicationState::Failed | ApplicationState::Killed
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApplicationReport {
    pub id: ApplicationId,
    pub name: String,
    pub queue: String,
    pub state: ApplicationState,
    pub final_status: FinalApplicationStatus,
    pub tracking_url: Option<String>,
    pub diagnostics: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub progress: f32,
}

#[derive(Debug, Clone)]
pub struct NewApplication {
    pub id: ApplicationId,
    pub min_capability: Resource,
    pub max_capability: Resource,
}

#[derive(Debug, Clone)]
pub struct SubmissionContext {
    pub id: ApplicationId,
    pub name: String,
    pub queue: String,
    pub priority: Priority,
    /// Resource of the master container
    pub resource: Resource,
    pub master: LaunchContext,
}

/// Cluster manager as seen by a registered application master.
pub trait ResourceManager: Send + Sync {
    fn register(
        &self,
        request: RegisterRequest,
    ) -> BoxFuture<'static, GatewayResult<RegisterResponse>>;

    fn allocate(
        &self,
        request: AllocateRequest,
    ) -> BoxFuture<'static, GatewayResult<AllocateResponse>>;

    fn unregister(
        &self,
        status: FinalApplicationStatus,
        message: Option<String>,
    ) -> BoxFuture<'static, GatewayResult<()>>;
}

pub trait NodeAgent: Send + Sync {
    /// Completion is observed through [`NodeAgent::get_container_status`].
    fn start_container(
        &self,
        container: &Container,
        context: &LaunchContext,
    ) -> BoxFuture<'static, GatewayResult<()>>;

    fn get_container_status(
        &self,
        container: &Container,
    ) -> BoxFuture<'static, GatewayResult<ContainerStatus>>;

    fn stop_container(&self, container: &Container) -> BoxFuture<'static, GatewayResult<()>>;
}

/// Cluster manager as seen by a submitting client.
pub trait ApplicationClient: Send + Sync {
    fn create_application(&self) -> BoxFuture<'static, GatewayResult<NewApplication>>;

    fn submit_application(
        &self,
        context: SubmissionContext,
    ) -> BoxFuture<'static, GatewayResult<()>>;

    fn get_application_report(
        &self,
        id: ApplicationId,
    ) -> BoxFuture<'static, GatewayResult<Option<ApplicationReport>>>;

    fn kill_application(&self, id: ApplicationId) -> BoxFuture<'static, GatewayResult<()>>;
}
