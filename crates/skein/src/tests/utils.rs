use crate::gateway::Resource;
use crate::job::{ContainerSpec, ContainerSpecBuilder};

pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

/// Spec builder with a command and a small resource filled in.
pub fn spec_builder(name: &str) -> ContainerSpecBuilder {
    ContainerSpecBuilder::default()
        .name(name)
        .resource(Resource::new(100, 1))
        .commands(vec!["true".to_string()])
}

pub fn simple_spec(name: &str, instances: u32) -> ContainerSpec {
    spec_builder(name).instances(instances).build().unwrap()
}
