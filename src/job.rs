use std::{path::PathBuf, time::Duration};

use uuid::Uuid;

/// What the downloader is asked to do for one task.
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    pub url: String,
    pub format_id: String,
    pub output_template: PathBuf,
    pub max_duration: Duration,
    pub max_filesize: u64,
}

impl DownloadSpec {
    /// Invocation arguments in the order yt-dlp expects, URL last.
    pub fn arguments(&self) -> Vec<String> {
        vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "-f".to_string(),
            self.format_id.clone(),
            "--max-filesize".to_string(),
            self.max_filesize.to_string(),
            "-o".to_string(),
            self.output_template.to_string_lossy().into_owned(),
            "--".to_string(),
            self.url.clone(),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    pub max_duration: Duration,
    pub max_filesize: u64,
}

/// One admitted download and everything needed to finalize it.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub task_id: Uuid,
    pub user_id: String,
    /// Artifact name prefix: the task id, or the sanitized custom filename.
    pub prefix: String,
    pub downloads_dir: PathBuf,
    pub spec: DownloadSpec,
}

impl DownloadJob {
    pub fn new(
        task_id: Uuid,
        user_id: String,
        prefix: String,
        downloads_dir: PathBuf,
        url: String,
        format_id: String,
        limits: JobLimits,
    ) -> Self {
        let output_template = downloads_dir.join(format!("{prefix}.%(ext)s"));
        Self {
            task_id,
            user_id,
            prefix,
            downloads_dir,
            spec: DownloadSpec {
                url,
                format_id,
                output_template,
                max_duration: limits.max_duration,
                max_filesize: limits.max_filesize,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_uses_prefix_and_url_comes_last() {
        let job = DownloadJob::new(
            Uuid::nil(),
            "ip:127.0.0.1".to_string(),
            "holiday".to_string(),
            PathBuf::from("/srv/downloads"),
            "https://youtu.be/abc".to_string(),
            "22".to_string(),
            JobLimits {
                max_duration: Duration::from_secs(10),
                max_filesize: 1024,
            },
        );

        assert_eq!(
            job.spec.output_template,
            PathBuf::from("/srv/downloads/holiday.%(ext)s")
        );
        let args = job.spec.arguments();
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
        assert!(args.windows(2).any(|pair| pair == ["-f", "22"]));
        assert!(args.windows(2).any(|pair| pair == ["--max-filesize", "1024"]));
    }
}
