use std::sync::LazyLock;

use regex::Regex;

static DOWNLOAD_PERCENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").ok());

const POST_PROCESSING_TAGS: [&str; 5] = [
    "[ExtractAudio]",
    "[VideoConvertor]",
    "[FixupM3u8]",
    "[ffmpeg]",
    "[MoveFiles]",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressUpdate {
    Downloading { percentage: f64 },
    Merging,
    PostProcessing,
}

impl ProgressUpdate {
    pub fn percentage(&self) -> Option<f64> {
        match self {
            Self::Downloading { percentage } => Some(*percentage),
            _ => None,
        }
    }
}

/// Extracts progress from one line of yt-dlp output.
///
/// Anything that is not a recognized progress or phase line yields `None`.
pub fn parse_line(line: &str) -> Option<ProgressUpdate> {
    let line = line.trim();

    if line.starts_with("[Merger]") {
        return Some(ProgressUpdate::Merging);
    }
    if POST_PROCESSING_TAGS.iter().any(|tag| line.starts_with(tag)) {
        return Some(ProgressUpdate::PostProcessing);
    }

    let captures = DOWNLOAD_PERCENT.as_ref()?.captures(line)?;
    let percentage = captures.get(1)?.as_str().parse::<f64>().ok()?;
    if !percentage.is_finite() {
        return None;
    }

    Some(ProgressUpdate::Downloading {
        percentage: percentage.min(100.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_download_percentage() {
        let update = parse_line("[download]  45.0% of 10.00MiB at 2.50MiB/s ETA 00:05");
        assert_eq!(update, Some(ProgressUpdate::Downloading { percentage: 45.0 }));
    }

    #[test]
    fn accepts_whole_number_percentages() {
        let update = parse_line("[download] 100% of   12.34MiB in 00:00:03 at 3.9MiB/s");
        assert_eq!(update.and_then(|update| update.percentage()), Some(100.0));
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert_eq!(parse_line("some unrelated log line"), None);
        assert_eq!(parse_line("[youtube] abc123: Downloading webpage"), None);
        assert_eq!(parse_line("[download] Destination: /tmp/x.mp4"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn malformed_percent_is_ignored() {
        assert_eq!(parse_line("[download]  abc%"), None);
        assert_eq!(parse_line("[download]  .%"), None);
        assert_eq!(parse_line("\u{fffd}\u{fffd}[download\u{fffd}  4"), None);
    }

    #[test]
    fn recognizes_phases() {
        assert_eq!(
            parse_line("[Merger] Merging formats into \"abc.mkv\""),
            Some(ProgressUpdate::Merging)
        );
        assert_eq!(
            parse_line("[ExtractAudio] Destination: abc.mp3"),
            Some(ProgressUpdate::PostProcessing)
        );
    }
}
