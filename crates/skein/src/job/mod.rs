use std::collections::BTreeMap;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::Priority;
use crate::gateway::Resource;

pub mod defs;
pub mod launch;

/// Environment variable that carries the [`MasterPlan`] into the master process.
pub const MASTER_PLAN_ENV: &str = "SKEIN_MASTER_PLAN";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LocalResourceType {
    #[default]
    File,
    Archive,
    Pattern,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LocalResourceVisibility {
    Public,
    #[default]
    Private,
    Application,
}

/// A file that the node agent makes available in the working directory of a container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LocalResource {
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: LocalResourceType,
    #[serde(default)]
    pub visibility: LocalResourceVisibility,
}

/// One kind of container to run. Immutable once built.
#[derive(Builder, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct ContainerSpec {
    #[builder(setter(into))]
    name: String,
    resource: Resource,
    #[builder(default)]
    priority: Priority,
    #[builder(default = "1")]
    instances: u32,
    #[builder(default, setter(into, strip_option))]
    node: Option<String>,
    #[builder(default)]
    env: BTreeMap<String, String>,
    commands: Vec<String>,
    #[builder(default)]
    local_resources: BTreeMap<String, LocalResource>,
}

impl ContainerSpecBuilder {
    fn validate(&self) -> Result<(), String> {
        match &self.commands {
            Some(commands) if commands.is_empty() => {
                Err("container needs at least one command".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl ContainerSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn instances(&self) -> u32 {
        self.instances
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn local_resources(&self) -> &BTreeMap<String, LocalResource> {
        &self.local_resources
    }
}

/// Resources and environment of the application master container.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MasterSpec {
    pub resource: Resource,
    pub priority: Priority,
    pub env: BTreeMap<String, String>,
}

impl Default for MasterSpec {
    fn default() -> Self {
        Self {
            resource: Resource::new(256, 1),
            priority: 0,
            env: BTreeMap::new(),
        }
    }
}

/// Opaque serialized environment (credential tokens, staged file locations) passed from the
/// client to containers. The master forwards it without looking inside.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialBlob(#[serde(with = "serde_bytes")] Vec<u8>);

impl CredentialBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_env_map(env: &BTreeMap<String, String>) -> crate::Result<Self> {
        if env.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(bincode::serialize(env)?))
    }

    pub fn to_env_map(&self) -> crate::Result<BTreeMap<String, String>> {
        if self.0.is_empty() {
            return Ok(BTreeMap::new());
        }
        bincode::deserialize(&self.0)
            .map_err(|e| crate::Error::DeserializationError(format!("Invalid credentials: {e}")))
    }
}

/// What to do with allocated containers that no tracker wants.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SurplusPolicy {
    #[default]
    Keep,
    Release,
}

/// Everything the application master needs to know about the job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MasterPlan {
    pub containers: Vec<ContainerSpec>,
    pub allowed_failures: u32,
    pub surplus: SurplusPolicy,
}

impl MasterPlan {
    pub fn to_env_value(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> crate::Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| crate::Error::DeserializationError(format!("Invalid master plan: {e}")))
    }
}

/// A fully resolved job, ready to be submitted.
#[derive(Debug, Clone)]
pub struct JobDescription {
    pub name: String,
    pub queue: String,
    pub timeout: Option<Duration>,
    pub allowed_failures: u32,
    pub surplus: SurplusPolicy,
    pub credentials: CredentialBlob,
    pub master: MasterSpec,
    pub containers: Vec<ContainerSpec>,
}

impl JobDescription {
    pub fn plan(&self) -> MasterPlan {
        MasterPlan {
            containers: self.containers.clone(),
            allowed_failures: self.allowed_failures,
            surplus: self.surplus,
        }
    }
}
