use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::time::{Instant, MissedTickBehavior};

use crate::common::error::SkeinError;
use crate::common::ids::ApplicationId;
use crate::gateway::{
    ApplicationClient, ApplicationReport, ApplicationState, FinalApplicationStatus,
    SubmissionContext,
};
use crate::job::launch::LaunchContext;
use crate::job::{JobDescription, MASTER_PLAN_ENV};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Submitting,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    Failed,
}

/// Submits one job and observes it until it ends or the client-side timeout fires.
pub struct ClientMonitor {
    client: Arc<dyn ApplicationClient>,
    job: JobDescription,
    state: MonitorState,
    application_id: Option<ApplicationId>,
    start_time: Option<Instant>,
    timed_out: bool,
    last_report: Option<Arc<ApplicationReport>>,
    final_report: OnceCell<Option<Arc<ApplicationReport>>>,
    tracking_url_reported: bool,
}

impl ClientMonitor {
    pub fn new(client: Arc<dyn ApplicationClient>, job: JobDescription) -> Self {
        Self {
            client,
            job,
            state: MonitorState::Submitting,
            application_id: None,
            start_time: None,
            timed_out: false,
            last_report: None,
            final_report: OnceCell::new(),
            tracking_url_reported: false,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn application_id(&self) -> Option<ApplicationId> {
        self.application_id
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    fn timeout(&self) -> Option<Duration> {
        self.job.timeout.filter(|timeout| !timeout.is_zero())
    }

    fn master_context(&self) -> crate::Result<LaunchContext> {
        let mut env = self.job.master.env.clone();
        env.insert(MASTER_PLAN_ENV.to_string(), self.job.plan().to_env_value()?);
        Ok(LaunchContext {
            commands: vec![],
            env,
            local_resources: Default::default(),
            tokens: self.job.credentials.clone(),
        })
    }

    /// Creates and submits the application.
    pub async fn start(&mut self) -> crate::Result<ApplicationId> {
        match self.submit().await {
            Ok(id) => {
                self.state = MonitorState::Running;
                self.start_time = Some(Instant::now());
                Ok(id)
            }
            Err(error) => {
                log::error!("Submission of job `{}` failed: {error}", self.job.name);
                self.state = MonitorState::Finished;
                Err(error)
            }
        }
    }

    async fn submit(&mut self) -> crate::Result<ApplicationId> {
        let application = self
            .client
            .create_application()
            .await
            .map_err(|e| SkeinError::SubmissionError(e.to_string()))?;
        let resource = self
            .job
            .master
            .resource
            .clamp(&application.min_capability, &application.max_capability);
        let context = SubmissionContext {
            id: application.id,
            name: self.job.name.clone(),
            queue: self.job.queue.clone(),
            priority: self.job.master.priority,
            resource,
            master: self.master_context()?,
        };
        self.application_id = Some(application.id);
        self.client
            .submit_application(context)
            .await
            .map_err(|e| SkeinError::SubmissionError(e.to_string()))?;
        log::info!(
            "Job `{}` submitted as application {} to queue `{}`",
            self.job.name,
            application.id,
            self.job.queue
        );
        Ok(application.id)
    }

    /// Checks the application once. Returns `true` when the monitor has finished.
    pub async fn poll_once(&mut self) -> bool {
        if self.state == MonitorState::Finished {
            return true;
        }
        let id = match self.application_id {
            Some(id) if self.state == MonitorState::Running => id,
            _ => return false,
        };

        match self.client.get_application_report(id).await {
            Ok(Some(report)) => {
                self.report_tracking_url(&report);
                let report = Arc::new(report);
                if report.state.is_terminal() || report.final_status.is_definitive() {
                    self.finish(Some(report));
                    return true;
                }
                self.last_report = Some(report);
            }
            Ok(None) => log::debug!("No report available for application {id} yet"),
            Err(error) => log::warn!("Cannot get report of application {id}: {error}"),
        }

        if let (Some(timeout), Some(start)) = (self.timeout(), self.start_time) {
            if start.elapsed() > timeout {
                log::warn!(
                    "Application {id} did not finish within {}",
                    humantime::format_duration(timeout)
                );
                self.timed_out = true;
                let report = self.last_report.take();
                self.finish(report);
                return true;
            }
        }
        false
    }

    fn report_tracking_url(&mut self, report: &ApplicationReport) {
        if self.tracking_url_reported || report.state != ApplicationState::Running {
            return;
        }
        if let Some(url) = &report.tracking_url {
            log::info!("Application {} is running, tracking URL: {url}", report.id);
            self.tracking_url_reported = true;
        }
    }

    fn finish(&mut self, report: Option<Arc<ApplicationReport>>) {
        self.state = MonitorState::Finished;
        if let Some(report) = report {
            let _ = self.final_report.set(Some(report));
        }
    }

    /// Polls on a fixed period until the application ends or times out.
    pub async fn run(&mut self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.poll_once().await {
                break;
            }
        }
    }

    /// Final report of the application. Fetched at most once if the polling loop did not
    /// capture it.
    pub async fn final_report(&self) -> Option<Arc<ApplicationReport>> {
        let id = self.application_id?;
        self.final_report
            .get_or_init(|| async {
                match self.client.get_application_report(id).await {
                    Ok(report) => report.map(Arc::new),
                    Err(error) => {
                        log::warn!("Cannot get report of application {id}: {error}");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    pub async fn disposition(&self) -> Disposition {
        if self.timed_out {
            return Disposition::Failed;
        }
        match self.final_report().await {
            Some(report) if report.final_status == FinalApplicationStatus::Succeeded => {
                Disposition::Succeeded
            }
            _ => Disposition::Failed,
        }
    }

    /// Kills the remote application. Not done implicitly on timeout.
    pub async fn kill(&self) -> crate::Result<()> {
        let Some(id) = self.application_id else {
            return Ok(());
        };
        log::info!("Killing application {id}");
        self.client.kill_application(id).await?;
        Ok(())
    }
}
