use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::Priority;
use crate::common::error::{SkeinError, config_error};
use crate::common::utils::parse_human_duration;
use crate::gateway::Resource;
use crate::job::{
    ContainerSpec, ContainerSpecBuilder, CredentialBlob, JobDescription, LocalResource,
    MasterSpec, SurplusPolicy,
};

fn deserialize_human_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let buf = Option::<String>::deserialize(deserializer)?;

    match buf {
        Some(b) => parse_human_duration(&b)
            .map(|d| if d.is_zero() { None } else { Some(d) })
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn default_vcores() -> u32 {
    1
}

fn default_instances() -> u32 {
    1
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_master_memory() -> u64 {
    MasterSpec::default().resource.memory
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ContainerDef {
    pub memory: u64,

    #[serde(default = "default_vcores")]
    pub vcores: u32,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default = "default_instances")]
    pub instances: u32,

    #[serde(default)]
    pub node: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub commands: Vec<String>,

    #[serde(default)]
    pub resources: BTreeMap<String, LocalResource>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct MasterDef {
    #[serde(default = "default_master_memory")]
    pub memory: u64,

    #[serde(default = "default_vcores")]
    pub vcores: u32,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobDef {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default)]
    #[serde(deserialize_with = "deserialize_human_duration_opt")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub allowed_failures: u32,

    #[serde(default)]
    pub surplus: SurplusPolicy,

    #[serde(default)]
    pub credentials: BTreeMap<String, String>,

    #[serde(default)]
    pub master: Option<MasterDef>,

    #[serde(default)]
    pub containers: Vec<ContainerDef>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobFileDef {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDef>,
}

impl ContainerDef {
    fn validate(&self, job: &str, index: usize) -> crate::Result<()> {
        match (&self.command, self.commands.is_empty()) {
            (None, true) => Err(SkeinError::ConfigError(format!(
                "Container #{index} of job `{job}` has no `command` or `commands`"
            ))),
            (Some(_), false) => Err(SkeinError::ConfigError(format!(
                "Container #{index} of job `{job}` defines both `command` and `commands`"
            ))),
            _ => Ok(()),
        }
    }

    fn into_spec(self, job: &str, index: usize) -> crate::Result<ContainerSpec> {
        let name = self.name.unwrap_or_else(|| format!("{job}-{index}"));
        let commands = match self.command {
            Some(command) => vec![command],
            None => self.commands,
        };
        let mut builder = ContainerSpecBuilder::default()
            .name(name)
            .resource(Resource::new(self.memory, self.vcores))
            .priority(self.priority)
            .instances(self.instances)
            .env(self.env)
            .commands(commands)
            .local_resources(self.resources);
        if let Some(node) = self.node {
            builder = builder.node(node);
        }
        builder
            .build()
            .map_err(|e| SkeinError::ConfigError(format!("Job `{job}`: {e}")))
    }
}

impl JobDef {
    pub fn validate(&self, key: &str) -> crate::Result<()> {
        if self.containers.is_empty() {
            return config_error(format!("Job `{key}` does not define any containers"));
        }
        for (index, container) in self.containers.iter().enumerate() {
            container.validate(key, index)?;
        }
        Ok(())
    }

    pub fn into_description(self, key: &str) -> crate::Result<JobDescription> {
        self.validate(key)?;
        let name = self.name.unwrap_or_else(|| key.to_string());
        let master = match self.master {
            Some(def) => MasterSpec {
                resource: Resource::new(def.memory, def.vcores),
                priority: def.priority,
                env: def.env,
            },
            None => MasterSpec::default(),
        };
        let containers = self
            .containers
            .into_iter()
            .enumerate()
            .map(|(index, def)| def.into_spec(&name, index))
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(JobDescription {
            name,
            queue: self.queue,
            timeout: self.timeout,
            allowed_failures: self.allowed_failures,
            surplus: self.surplus,
            credentials: CredentialBlob::from_env_map(&self.credentials)?,
            master,
            containers,
        })
    }
}

impl JobFileDef {
    pub fn parse(str: &str) -> crate::Result<JobFileDef> {
        let def: JobFileDef = toml::from_str(str)?;
        for (key, job) in &def.jobs {
            job.validate(key)?;
        }
        Ok(def)
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(|k| k.as_str())
    }

    pub fn into_job(mut self, key: &str) -> crate::Result<JobDescription> {
        match self.jobs.remove(key) {
            Some(job) => job.into_description(key),
            None => {
                let names: Vec<_> = self.job_names().collect();
                Err(SkeinError::ConfigError(format!(
                    "Job `{key}` not found, available jobs: {}",
                    names.join(", ")
                )))
            }
        }
    }

    pub fn into_jobs(self) -> crate::Result<Vec<JobDescription>> {
        self.jobs
            .into_iter()
            .map(|(key, job)| job.into_description(&key))
            .collect()
    }
}

pub fn load_job_file(path: &Path) -> crate::Result<JobFileDef> {
    let content = std::fs::read_to_string(path)?;
    JobFileDef::parse(&content)
}
