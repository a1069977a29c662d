use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::client::monitor::{ClientMonitor, Disposition};
use crate::gateway::{ApplicationClient, ApplicationReport};
use crate::job::JobDescription;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INVALID_INVOCATION: i32 = -1;

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub poll_period: Duration,
    /// Kill the application when the client-side timeout expires
    pub kill_on_timeout: bool,
}

impl Disposition {
    pub fn exit_code(&self) -> i32 {
        match self {
            Disposition::Succeeded => EXIT_SUCCESS,
            Disposition::Failed => EXIT_FAILURE,
        }
    }
}

/// Submits `job`, waits for its end and returns the process exit code.
/// The application is killed if `interrupt` resolves first.
pub async fn submit_and_wait<F: Future<Output = ()>>(
    client: Arc<dyn ApplicationClient>,
    job: JobDescription,
    options: SubmitOptions,
    interrupt: F,
) -> i32 {
    let mut monitor = ClientMonitor::new(client, job);
    if monitor.start().await.is_err() {
        return EXIT_FAILURE;
    }

    let interrupted = tokio::select! {
        _ = monitor.run(options.poll_period) => false,
        _ = interrupt => true,
    };

    if interrupted {
        log::warn!("Interrupted, killing the application");
        if let Err(error) = monitor.kill().await {
            log::error!("Could not kill the application: {error}");
        }
        return EXIT_FAILURE;
    }
    if monitor.timed_out() && options.kill_on_timeout {
        if let Err(error) = monitor.kill().await {
            log::error!("Could not kill the application: {error}");
        }
    }

    match monitor.final_report().await {
        Some(report) => log_report(&report),
        None => log::error!("No final report is available for the application"),
    }
    monitor.disposition().await.exit_code()
}

fn log_report(report: &ApplicationReport) {
    log::info!(
        "Application {} `{}` ended in state {:?} with final status {:?}",
        report.id,
        report.name,
        report.state,
        report.final_status
    );
    if !report.diagnostics.is_empty() {
        log::info!("Diagnostics: {}", report.diagnostics);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{EXIT_FAILURE, EXIT_SUCCESS, SubmitOptions, submit_and_wait};
    use crate::gateway::{ApplicationState, FinalApplicationStatus, GatewayError, Resource};
    use crate::job::{CredentialBlob, JobDescription, MasterSpec, SurplusPolicy};
    use crate::tests::cluster::MockCluster;
    use crate::tests::utils::simple_spec;

    fn job(timeout: Option<Duration>) -> JobDescription {
        JobDescription {
            name: "job".to_string(),
            queue: "default".to_string(),
            timeout,
            allowed_failures: 0,
            surplus: SurplusPolicy::Keep,
            credentials: CredentialBlob::default(),
            master: MasterSpec {
                resource: Resource::new(128, 1),
                ..Default::default()
            },
            containers: vec![simple_spec("a", 1)],
        }
    }

    fn options(kill_on_timeout: bool) -> SubmitOptions {
        SubmitOptions {
            poll_period: Duration::from_secs(1),
            kill_on_timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_exit_code() {
        let cluster = MockCluster::new();
        cluster.set_report(ApplicationState::Finished, FinalApplicationStatus::Succeeded);
        let code =
            submit_and_wait(cluster.client(), job(None), options(false), std::future::pending())
                .await;
        assert_eq!(code, EXIT_SUCCESS);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_application_exit_code() {
        let cluster = MockCluster::new();
        cluster.set_report(ApplicationState::Finished, FinalApplicationStatus::Failed);
        let code =
            submit_and_wait(cluster.client(), job(None), options(false), std::future::pending())
                .await;
        assert_eq!(code, EXIT_FAILURE);
    }

    #[tokio::test(start_paused = true)]
    async fn submission_failure_exit_code() {
        let cluster = MockCluster::new();
        cluster.with(|s| s.submit_error = Some(GatewayError::Rejected("no".into())));
        let code =
            submit_and_wait(cluster.client(), job(None), options(false), std::future::pending())
                .await;
        assert_eq!(code, EXIT_FAILURE);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_on_timeout() {
        let cluster = MockCluster::new();
        cluster.set_report(ApplicationState::Running, FinalApplicationStatus::Undefined);
        let code = submit_and_wait(
            cluster.client(),
            job(Some(Duration::from_secs(3))),
            options(true),
            std::future::pending(),
        )
        .await;
        assert_eq!(code, EXIT_FAILURE);
        assert_eq!(cluster.with(|s| s.killed.len()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_kill() {
        let cluster = MockCluster::new();
        cluster.set_report(ApplicationState::Running, FinalApplicationStatus::Undefined);
        let code = submit_and_wait(
            cluster.client(),
            job(Some(Duration::from_secs(3))),
            options(false),
            std::future::pending(),
        )
        .await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(cluster.with(|s| s.killed.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_kills_application() {
        let cluster = MockCluster::new();
        cluster.set_report(ApplicationState::Running, FinalApplicationStatus::Undefined);
        let code = submit_and_wait(
            cluster.client(),
            job(None),
            options(false),
            tokio::time::sleep(Duration::from_secs(10)),
        )
        .await;
        assert_eq!(code, EXIT_FAILURE);
        assert_eq!(cluster.with(|s| s.killed.len()), 1);
    }
}
