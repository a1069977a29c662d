use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::libc;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;

use crate::common::error::SkeinError::GenericError;
use crate::gateway::Container;
use crate::job::launch::LaunchContext;
use crate::job::{LocalResource, LocalResourceType};

pub const CONTAINER_ID_ENV: &str = "SKEIN_CONTAINER_ID";
pub const NODE_ENV: &str = "SKEIN_NODE";

pub fn container_dir(work_dir: &Path, container: &Container) -> PathBuf {
    work_dir.join(format!("container-{}", container.id))
}

fn create_output_stream(path: &Path) -> crate::Result<Stdio> {
    let file =
        File::create(path).map_err(|e| GenericError(format!("Creating stream file failed: {e}")))?;
    Ok(Stdio::from(file))
}

/// Path of a local resource URL, resources on remote storage are not supported.
fn local_path(resource: &LocalResource) -> Option<PathBuf> {
    let path = resource.url.strip_prefix("file://").unwrap_or(&resource.url);
    let path = PathBuf::from(path);
    path.is_absolute().then_some(path)
}

fn link_resources(context: &LaunchContext, cwd: &Path) -> crate::Result<()> {
    for (name, resource) in &context.local_resources {
        let Some(source) = local_path(resource) else {
            log::warn!(
                "Resource `{name}` ({}) is not a local path, skipping",
                resource.url
            );
            continue;
        };
        if resource.kind != LocalResourceType::File {
            log::debug!("Resource `{name}` is linked without unpacking");
        }
        std::os::unix::fs::symlink(&source, cwd.join(name)).map_err(|e| {
            GenericError(format!(
                "Could not link resource `{name}` from {}: {e}",
                source.display()
            ))
        })?;
    }
    Ok(())
}

/// Creates the process of a container: `sh -c` over its commands, running in its own directory
/// and its own session.
pub fn container_command(
    container: &Container,
    context: &LaunchContext,
    work_dir: &Path,
) -> crate::Result<Command> {
    if context.commands.is_empty() {
        return Err(GenericError("No commands to run".to_string()));
    }

    let mut command = Command::new("sh");

    #[cfg(target_os = "linux")]
    unsafe {
        command.pre_exec(|| {
            // Own process group, so that the whole container can be signalled at once
            if let Err(error) = nix::unistd::setsid() {
                log::error!("Cannot set SID for container process: {error:?}");
            }
            let ret = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            if ret != 0 {
                log::error!("Cannot set PR_SET_PDEATHSIG for container process: {ret}");
            }
            Ok(())
        });
    }

    command.kill_on_drop(true);
    command.arg("-c").arg(context.commands.join(" && "));

    let cwd = container_dir(work_dir, container);
    std::fs::create_dir_all(&cwd)
        .map_err(|error| GenericError(format!("Could not create working directory: {error}")))?;
    link_resources(context, &cwd)?;
    command.current_dir(&cwd);
    command.stdin(Stdio::null());
    command.stdout(create_output_stream(&cwd.join("stdout"))?);
    command.stderr(create_output_stream(&cwd.join("stderr"))?);

    for (key, value) in &context.env {
        command.env(key, value);
    }
    for (key, value) in context.tokens.to_env_map()? {
        command.env(key, value);
    }
    command.env(CONTAINER_ID_ENV, container.id.to_string());
    command.env(NODE_ENV, &container.node);

    Ok(command)
}

/// Exit code of a finished process, signals are reported shell-style as `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

/// Sends SIGTERM to the process group of a container.
pub fn terminate(pid: u32) {
    if let Err(error) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        log::debug!("Could not signal process group {pid}: {error}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{container_command, container_dir, exit_code};
    use crate::job::launch::LaunchContext;
    use crate::job::{CredentialBlob, LocalResource, LocalResourceType, LocalResourceVisibility};
    use crate::tests::cluster::container;

    #[tokio::test]
    async fn runs_commands_with_environment() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "data").unwrap();

        let mut credentials = BTreeMap::new();
        credentials.insert("TOKEN".to_string(), "secret".to_string());
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        let mut resources = BTreeMap::new();
        resources.insert(
            "input".to_string(),
            LocalResource {
                url: format!("file://{}", input.display()),
                kind: LocalResourceType::File,
                visibility: LocalResourceVisibility::Private,
            },
        );
        let context = LaunchContext {
            commands: vec![
                "echo $GREETING $TOKEN $SKEIN_CONTAINER_ID".to_string(),
                "cat input".to_string(),
            ],
            env,
            local_resources: resources,
            tokens: CredentialBlob::from_env_map(&credentials).unwrap(),
        };
        let c = container(3, "node-0");
        let status = container_command(&c, &context, dir.path())
            .unwrap()
            .status()
            .await
            .unwrap();
        assert_eq!(exit_code(status), 0);

        let stdout = std::fs::read_to_string(container_dir(dir.path(), &c).join("stdout")).unwrap();
        assert_eq!(stdout, "hello secret 3\ndata");
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let context = LaunchContext {
            commands: vec!["true".to_string(), "exit 7".to_string()],
            ..Default::default()
        };
        let status = container_command(&container(1, "n"), &context, dir.path())
            .unwrap()
            .status()
            .await
            .unwrap();
        assert_eq!(exit_code(status), 7);
    }

    #[test]
    fn empty_commands_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            container_command(&container(1, "n"), &LaunchContext::default(), dir.path()).is_err()
        );
    }
}
