use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::gateway::Resource;
use crate::job::{ContainerSpec, CredentialBlob, LocalResource};

/// Everything a node agent needs to start a process inside a container.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LaunchContext {
    pub commands: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub local_resources: BTreeMap<String, LocalResource>,
    pub tokens: CredentialBlob,
}

/// Resolves container specs against the capabilities announced by the cluster manager.
#[derive(Debug, Clone)]
pub struct LaunchContextFactory {
    min: Resource,
    max: Resource,
    tokens: CredentialBlob,
}

impl LaunchContextFactory {
    pub fn new(min: Resource, max: Resource, tokens: CredentialBlob) -> Self {
        Self { min, max, tokens }
    }

    pub fn resource(&self, spec: &ContainerSpec) -> Resource {
        spec.resource().clamp(&self.min, &self.max)
    }

    pub fn create(&self, spec: &ContainerSpec) -> LaunchContext {
        LaunchContext {
            commands: spec.commands().to_vec(),
            env: spec.env().clone(),
            local_resources: spec.local_resources().clone(),
            tokens: self.tokens.clone(),
        }
    }
}
