use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::FutureExt;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    admission::AdmissionController,
    error::SubmitError,
    job::{DownloadJob, JobLimits},
    progress::parse_line,
    quota::QuotaLedger,
    registry::{TaskRegistry, TaskView},
    resolver::{ResultResolver, TaskResult, find_artifact},
    supervisor::ProcessSupervisor,
    validation::sanitize_custom_filename,
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub downloads_dir: PathBuf,
    pub limits: JobLimits,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format_id: String,
    pub filename: Option<String>,
    pub user_id: String,
}

/// Custom filename prefix held by an in-flight task; released on drop.
struct PrefixReservation {
    prefix: String,
    reserved: Arc<Mutex<HashSet<String>>>,
}

impl Drop for PrefixReservation {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.prefix);
    }
}

/// Admits download requests and runs each one to a terminal state on its
/// own tokio task.
///
/// Every admitted task owns its admission permit, so the slot is returned
/// however the task ends, panics included.
pub struct DownloadOrchestrator {
    registry: Arc<TaskRegistry>,
    quota: Arc<QuotaLedger>,
    admission: AdmissionController,
    supervisor: ProcessSupervisor,
    resolver: ResultResolver,
    settings: OrchestratorSettings,
    reserved_prefixes: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
}

impl DownloadOrchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        quota: Arc<QuotaLedger>,
        admission: AdmissionController,
        supervisor: ProcessSupervisor,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            resolver: ResultResolver::new(Arc::clone(&quota)),
            registry,
            quota,
            admission,
            supervisor,
            settings,
            reserved_prefixes: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn quota(&self) -> &Arc<QuotaLedger> {
        &self.quota
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn status(&self, task_id: &Uuid) -> Option<TaskView> {
        self.registry.get(task_id)
    }

    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Validates, charges nothing yet, and starts the download in the
    /// background. Rejections leave no task behind.
    pub async fn submit(&self, request: DownloadRequest) -> Result<Uuid, SubmitError> {
        let url = request.url.trim();
        if url.is_empty() {
            return Err(SubmitError::InvalidInput("Missing url".to_string()));
        }
        let format_id = request.format_id.trim();
        if format_id.is_empty() {
            return Err(SubmitError::InvalidInput("Missing format_id".to_string()));
        }

        if !self.quota.check(&request.user_id).await? {
            info!(user_id = %request.user_id, "Download rejected: daily quota exhausted");
            return Err(SubmitError::QuotaExceeded {
                retry_after_seconds: self.quota.seconds_until_reset(),
            });
        }

        let permit = self.admission.try_acquire().ok_or_else(|| {
            info!("Download rejected: all {} slots busy", self.admission.capacity());
            SubmitError::AdmissionDenied
        })?;

        let task_id = Uuid::new_v4();
        let custom_prefix = request
            .filename
            .as_deref()
            .and_then(sanitize_custom_filename);
        let (prefix, reservation) = match custom_prefix {
            Some(prefix) => {
                let reservation = self.reserve_prefix(&prefix).await?;
                (prefix, Some(reservation))
            }
            None => (task_id.to_string(), None),
        };

        let job = DownloadJob::new(
            task_id,
            request.user_id,
            prefix,
            self.settings.downloads_dir.clone(),
            url.to_string(),
            format_id.to_string(),
            self.settings.limits,
        );

        self.registry.create(task_id);
        info!(
            task_id = %task_id,
            user_id = %job.user_id,
            "Download admitted for {url} (format {format_id})"
        );

        let registry = Arc::clone(&self.registry);
        let supervisor = self.supervisor.clone();
        let resolver = self.resolver.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            let _reservation = reservation;

            let body = run_job(&registry, &supervisor, &resolver, &job);
            if AssertUnwindSafe(body).catch_unwind().await.is_err() {
                error!(task_id = %job.task_id, "Download task panicked");
                registry.update(&job.task_id, |task| task.fail("Unexpected internal error"));
            }
        });

        Ok(task_id)
    }

    async fn reserve_prefix(&self, prefix: &str) -> Result<PrefixReservation, SubmitError> {
        {
            let mut reserved = self
                .reserved_prefixes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(held) = reserved.iter().find(|held| prefixes_overlap(held, prefix)) {
                debug!("Custom filename {prefix:?} overlaps in-flight {held:?}");
                return Err(SubmitError::FilenameConflict(prefix.to_string()));
            }
            reserved.insert(prefix.to_string());
        }

        let reservation = PrefixReservation {
            prefix: prefix.to_string(),
            reserved: Arc::clone(&self.reserved_prefixes),
        };

        match find_artifact(&self.settings.downloads_dir, prefix).await {
            Ok(Some(existing)) => {
                debug!("Custom filename {prefix:?} collides with {:?}", existing);
                Err(SubmitError::FilenameConflict(prefix.to_string()))
            }
            Ok(None) => Ok(reservation),
            Err(error) => {
                warn!("Could not check for existing artifacts: {error}");
                Ok(reservation)
            }
        }
    }

    /// Stops tracking new work and waits up to `grace` for running tasks.
    /// Returns false if some were still running; their children are killed
    /// when the runtime drops them.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            warn!(
                "{} download(s) still running after {}s grace period",
                self.tracker.len(),
                grace.as_secs()
            );
        }
        drained
    }
}

/// Two prefixes overlap when they are equal or one is the other plus a
/// dotted suffix, since `abc` and `abc.a` would both claim `abc.a.*`.
fn prefixes_overlap(a: &str, b: &str) -> bool {
    let extends = |longer: &str, shorter: &str| {
        longer
            .strip_prefix(shorter)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    };
    extends(a, b) || extends(b, a)
}

async fn run_job(
    registry: &TaskRegistry,
    supervisor: &ProcessSupervisor,
    resolver: &ResultResolver,
    job: &DownloadJob,
) {
    let task_id = job.task_id;

    let outcome = supervisor
        .run(&job.spec, |line| {
            debug!(task_id = %task_id, "yt-dlp: {line}");
            if let Some(update) = parse_line(line) {
                registry.update(&task_id, |task| task.apply_progress(&update));
            }
        })
        .await;

    let result = match outcome {
        Ok(outcome) => resolver.resolve(job, &outcome).await,
        Err(error) => {
            warn!(task_id = %task_id, "Downloader did not run: {error}");
            TaskResult::Failed {
                message: error.task_message(),
            }
        }
    };

    match result {
        TaskResult::Completed { filename, .. } => {
            registry.update(&task_id, |task| task.complete(filename));
        }
        TaskResult::Failed { message } => {
            warn!(task_id = %task_id, "Download failed: {message}");
            registry.update(&task_id, |task| task.fail(message));
        }
    }
}
