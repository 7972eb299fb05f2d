//! Supervision of the training job started with the published roster.

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::manager::ElasticManager;
use crate::publish::PublishedRoster;
use crate::types::SizePolicy;

/// Exit code a job uses to ask for a restart with a new roster.
pub const ELASTIC_EXIT_CODE: i32 = 101;
/// Exit code a job uses to ask for a restart after auto-parallel planning.
pub const ELASTIC_AUTO_PARALLEL_EXIT_CODE: i32 = 102;

/// How a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElasticStatus {
    Completed,
    Error,
    /// Membership changed under the running job; it was stopped and should
    /// be relaunched once the roster is ready again.
    Hold,
    Restart,
    /// The manager is shutting down.
    Exit,
}

impl fmt::Display for ElasticStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Hold => "hold",
            Self::Restart => "restart",
            Self::Exit => "exit",
        };
        f.write_str(name)
    }
}

/// Starts and stops the training job. Implemented outside this crate.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, roster: &PublishedRoster) -> Result<()>;

    /// The job's exit code once it has exited, without blocking.
    async fn poll_exit(&self) -> Result<Option<i32>>;

    async fn stop(&self) -> Result<()>;
}

/// Map a job's exit code to the supervision outcome.
pub fn status_for_exit_code(code: i32, policy: Option<SizePolicy>) -> ElasticStatus {
    match code {
        0 => ElasticStatus::Completed,
        ELASTIC_EXIT_CODE | ELASTIC_AUTO_PARALLEL_EXIT_CODE => ElasticStatus::Restart,
        _ if policy.is_some_and(|p| p.is_elastic()) => ElasticStatus::Error,
        _ => ElasticStatus::Restart,
    }
}

impl ElasticManager {
    /// Launch the job with the current roster and watch it until it exits,
    /// membership changes under it, or the manager shuts down.
    pub async fn supervise(&self, launcher: &dyn Launcher) -> ElasticStatus {
        let job = self.config().job_id.as_str();
        let mut roster = self.published();
        let launched = roster.borrow_and_update().clone();
        if let Err(e) = launcher.launch(&launched).await {
            tracing::error!(job, error = %e, "failed to launch job");
            return ElasticStatus::Error;
        }

        let shutdown = self.shutdown_token();
        let mut interval = tokio::time::interval(self.config().supervise_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    stop(launcher, job).await;
                    return ElasticStatus::Exit;
                }
                _ = interval.tick() => {}
            }

            match launcher.poll_exit().await {
                Ok(Some(code)) => {
                    let status = status_for_exit_code(code, self.policy());
                    tracing::info!(job, code, %status, "job exited");
                    if status == ElasticStatus::Completed {
                        self.exit(true).await;
                    }
                    return status;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(job, error = %e, "failed to poll job"),
            }

            // A roster that was reconfigured and converged between two ticks
            // still invalidates the running job.
            let republished = roster.has_changed().unwrap_or(false);
            if self.is_enabled() && (republished || !self.matches()) && !self.completed().await {
                tracing::info!(job, "membership changed under running job, holding");
                stop(launcher, job).await;
                return ElasticStatus::Hold;
            }
        }
    }
}

async fn stop(launcher: &dyn Launcher, job: &str) {
    if let Err(e) = launcher.stop().await {
        tracing::error!(job, error = %e, "failed to stop job");
    }
}
