use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    error::ResolveError,
    job::DownloadJob,
    quota::QuotaLedger,
    supervisor::ProcessOutcome,
};

const IN_PROGRESS_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".tmp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Completed { filename: String, bytes: u64 },
    Failed { message: String },
}

impl TaskResult {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Turns a finished process into a task result and charges the artifact
/// size to the requesting user.
#[derive(Clone)]
pub struct ResultResolver {
    quota: Arc<QuotaLedger>,
}

impl ResultResolver {
    pub fn new(quota: Arc<QuotaLedger>) -> Self {
        Self { quota }
    }

    /// Never fails: any error along the way becomes a `Failed` result.
    pub async fn resolve(&self, job: &DownloadJob, outcome: &ProcessOutcome) -> TaskResult {
        match self.try_resolve(job, outcome).await {
            Ok(result) => result,
            Err(error) => {
                warn!(task_id = %job.task_id, "Could not finalize download: {error}");
                TaskResult::failed(format!("Could not finalize download: {error}"))
            }
        }
    }

    async fn try_resolve(
        &self,
        job: &DownloadJob,
        outcome: &ProcessOutcome,
    ) -> Result<TaskResult, ResolveError> {
        match outcome {
            ProcessOutcome::TimedOut { after, .. } => {
                return Ok(TaskResult::failed(format!(
                    "Download timed out after {}.",
                    seconds_text(*after)
                )));
            }
            ProcessOutcome::Exited { code, last_lines } if !outcome.succeeded() => {
                return Ok(TaskResult::failed(exit_failure_message(
                    *code,
                    last_lines,
                    job.spec.max_filesize,
                )));
            }
            ProcessOutcome::Exited { .. } => {}
        }

        let Some(path) = find_artifact(&job.downloads_dir, &job.prefix).await? else {
            let message = known_failure_message(outcome.last_lines(), job.spec.max_filesize)
                .unwrap_or_else(|| "File not found after download.".to_string());
            return Ok(TaskResult::failed(message));
        };

        let bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|source| ResolveError::Stat {
                path: path.clone(),
                source,
            })?
            .len();

        if bytes > job.spec.max_filesize {
            if let Err(error) = tokio::fs::remove_file(&path).await
                && error.kind() != ErrorKind::NotFound
            {
                warn!("Could not remove oversized artifact {:?}: {error}", path);
            }
            return Ok(TaskResult::failed(max_size_text(job.spec.max_filesize)));
        }

        self.quota.add_usage(&job.user_id, bytes).await?;

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.prefix.clone());
        info!(task_id = %job.task_id, bytes, "Download finished: {filename}");

        Ok(TaskResult::Completed { filename, bytes })
    }
}

/// True when `name` is `prefix` itself or `prefix` plus exactly one
/// extension, and is not a partial file the downloader is still writing.
///
/// `abc.a.mp4` belongs to prefix `abc.a`, never to `abc`.
pub fn artifact_matches(name: &str, prefix: &str) -> bool {
    let owned = name == prefix
        || name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|extension| !extension.is_empty() && !extension.contains('.'));

    owned
        && !IN_PROGRESS_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix))
        && !name.contains(".part-Frag")
}

/// First matching file in lexicographic order, so repeated lookups agree.
pub async fn find_artifact(dir: &Path, prefix: &str) -> Result<Option<PathBuf>, ResolveError> {
    let list_error = |source| ResolveError::ListDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(list_error)?;
    let mut matches = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !artifact_matches(&name, prefix) {
            continue;
        }
        match entry.file_type().await {
            Ok(file_type) if file_type.is_file() => matches.push(name),
            Ok(_) => {}
            Err(error) => warn!("Could not inspect {:?}: {error}", entry.path()),
        }
    }

    matches.sort();
    Ok(matches.into_iter().next().map(|name| dir.join(name)))
}

fn max_size_text(max_filesize: u64) -> String {
    format!(
        "File exceeds the maximum allowed size of {} MB.",
        max_filesize / 1_048_576
    )
}

fn seconds_text(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{} seconds", duration.as_secs())
    } else {
        format!("{:.1} seconds", duration.as_secs_f64())
    }
}

/// Readable message for a known yt-dlp failure signature in `lines`, most
/// specific first: size limit, external downloader, then the last `ERROR:`.
fn known_failure_message(lines: &[String], max_filesize: u64) -> Option<String> {
    if lines
        .iter()
        .any(|line| line.to_ascii_lowercase().contains("larger than max-filesize"))
    {
        return Some(max_size_text(max_filesize));
    }

    if let Some(line) = lines
        .iter()
        .rev()
        .find(|line| line.contains("aria2c exited with code"))
    {
        return Some(format!("Download failed in the external downloader: {}", line.trim()));
    }

    lines
        .iter()
        .rev()
        .find_map(|line| line.trim_start().strip_prefix("ERROR:"))
        .map(|detail| format!("Error: {}", detail.trim()))
}

fn exit_failure_message(code: Option<i32>, lines: &[String], max_filesize: u64) -> String {
    if let Some(message) = known_failure_message(lines, max_filesize) {
        return message;
    }

    if lines.is_empty() {
        match code {
            Some(code) => format!("Downloader exited with code {code}."),
            None => "Downloader was terminated by a signal.".to_string(),
        }
    } else {
        format!("Error: {}", lines.join(" | "))
    }
}
