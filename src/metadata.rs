use std::{io::ErrorKind, process::Stdio, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

use crate::{error::MetadataError, supervisor::DownloaderCommand};

const LISTED_EXTENSIONS: [&str; 3] = ["mp4", "mkv", "webm"];

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    view_count: Option<u64>,
    like_count: Option<u64>,
    comment_count: Option<u64>,
    duration: Option<f64>,
    #[serde(default)]
    categories: Option<Vec<String>>,
    upload_date: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    resolution: Option<String>,
    format_note: Option<String>,
    filesize: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub thumbnail: Option<String>,
    pub uploader: String,
    pub view_count: u64,
    pub like_count: u64,
    pub comment_count: u64,
    pub duration: f64,
    pub categories: Vec<String>,
    pub upload_date: Option<String>,
    pub formats: Vec<FormatOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub note: String,
    pub filesize: Option<u64>,
}

/// Runs `yt-dlp --dump-json` synchronously for the info endpoint.
#[derive(Debug, Clone)]
pub struct MetadataFetcher {
    command: DownloaderCommand,
    timeout: Duration,
}

impl MetadataFetcher {
    pub fn new(command: DownloaderCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub async fn fetch(&self, url: &str) -> Result<VideoInfo, MetadataError> {
        let mut command = self.command.command();
        command
            .args(["--dump-json", "--no-warnings", "--no-playlist", "--", url])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| MetadataError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    MetadataError::NotInstalled(self.command.display_name())
                } else {
                    MetadataError::Spawn(error)
                }
            })?;

        if !output.status.success() {
            return Err(MetadataError::Upstream(run_error_message(&output.stderr)));
        }

        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)?;
        debug!("Fetched metadata for {url:?} with {} format(s)", info.formats.len());
        Ok(build_video_info(info))
    }
}

fn build_video_info(info: YtDlpVideoInfo) -> VideoInfo {
    let mut formats: Vec<FormatOption> = info
        .formats
        .into_iter()
        .filter_map(|format| {
            let ext = format.ext?;
            if !LISTED_EXTENSIONS.contains(&ext.as_str()) {
                return None;
            }
            Some(FormatOption {
                format_id: format.format_id,
                ext,
                resolution: format.resolution.unwrap_or_else(|| "N/A".to_string()),
                note: format.format_note.unwrap_or_default(),
                filesize: format
                    .filesize
                    .filter(|size| size.is_finite() && *size >= 0.0)
                    .map(|size| size as u64),
            })
        })
        .collect();
    // yt-dlp lists worst first.
    formats.reverse();

    VideoInfo {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        thumbnail: info.thumbnail,
        uploader: info
            .uploader
            .unwrap_or_else(|| "Unknown Creator".to_string()),
        view_count: info.view_count.unwrap_or_default(),
        like_count: info.like_count.unwrap_or_default(),
        comment_count: info.comment_count.unwrap_or_default(),
        duration: info.duration.unwrap_or_default(),
        categories: info.categories.unwrap_or_default(),
        upload_date: info.upload_date,
        formats,
    }
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the request")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        "Unsupported or invalid URL.".to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_container_formats_best_first() {
        let raw = r#"{
            "title": "Clip",
            "uploader": null,
            "view_count": 12,
            "duration": 3.5,
            "formats": [
                {"format_id": "140", "ext": "m4a", "resolution": "audio only"},
                {"format_id": "18", "ext": "mp4", "resolution": "640x360", "format_note": "360p", "filesize": 1024.0},
                {"format_id": "248", "ext": "webm", "resolution": "1920x1080"},
                {"format_id": "sb0", "ext": "mhtml"}
            ]
        }"#;
        let info = build_video_info(serde_json::from_str(raw).unwrap());

        assert_eq!(info.title, "Clip");
        assert_eq!(info.uploader, "Unknown Creator");
        assert_eq!(info.view_count, 12);
        assert_eq!(info.like_count, 0);
        let ids: Vec<_> = info.formats.iter().map(|f| f.format_id.as_str()).collect();
        assert_eq!(ids, ["248", "18"]);
        assert_eq!(info.formats[1].filesize, Some(1024));
        assert_eq!(info.formats[0].note, "");
    }

    #[test]
    fn upstream_error_uses_last_stderr_line() {
        let stderr = b"WARNING: something\nERROR: [generic] Unsupported URL: https://x\n";
        assert_eq!(run_error_message(stderr), "Unsupported or invalid URL.");
        assert_eq!(run_error_message(b"ERROR: Private video\n\n"), "ERROR: Private video");
        assert_eq!(run_error_message(b""), "yt-dlp could not complete the request");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_parses_stub_output() {
        let command = DownloaderCommand::new("sh").with_leading_args([
            "-c",
            r#"echo '{"title":"Stub","formats":[{"format_id":"22","ext":"mp4"}]}'"#,
            "stub",
        ]);
        let fetcher = MetadataFetcher::new(command, Duration::from_secs(10));

        let info = fetcher.fetch("https://youtu.be/abc").await.unwrap();

        assert_eq!(info.title, "Stub");
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].resolution, "N/A");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_reports_upstream_failure() {
        let command = DownloaderCommand::new("sh")
            .with_leading_args(["-c", "echo 'ERROR: Video unavailable' 1>&2; exit 1", "stub"]);
        let fetcher = MetadataFetcher::new(command, Duration::from_secs(10));

        let error = fetcher.fetch("https://youtu.be/abc").await.unwrap_err();

        assert!(matches!(error, MetadataError::Upstream(message) if message == "ERROR: Video unavailable"));
    }
}
