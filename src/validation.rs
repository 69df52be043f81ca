use std::path::Path;

use url::Url;

const SUPPORTED_DOMAINS: [&str; 11] = [
    "youtube.com",
    "youtu.be",
    "tiktok.com",
    "instagram.com",
    "soundcloud.com",
    "facebook.com",
    "fb.watch",
    "twitter.com",
    "x.com",
    "bsky.app",
    "vimeo.com",
];

/// Extensions `/downloads/{filename}` will serve.
pub const SERVABLE_EXTENSIONS: [&str; 15] = [
    "mp4", "mkv", "webm", "mov", "m4a", "mp3", "aac", "flac", "wav", "ogg", "opus", "jpg", "jpeg",
    "png", "webp",
];

const FORBIDDEN_FILENAME_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const MAX_CUSTOM_FILENAME_CHARS: usize = 150;

/// Only http(s) URLs whose host is, or is a subdomain of, a supported site.
pub fn is_safe_url(input: &str) -> bool {
    let parsed = match Url::parse(input.trim()) {
        Ok(url) => url,
        Err(_) => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

/// Strips characters that would escape the download directory or break the
/// output template. Returns `None` when nothing usable is left.
pub fn sanitize_custom_filename(value: &str) -> Option<String> {
    let cleaned: String = value
        .chars()
        .filter(|character| !FORBIDDEN_FILENAME_CHARS.contains(character))
        .filter(|character| !character.is_control() && *character != '%')
        .take(MAX_CUSTOM_FILENAME_CHARS)
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A bare file name: no separators, no parent references, not hidden.
pub fn is_plain_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains(['/', '\\'])
        && !filename.starts_with('.')
        && !filename.contains("..")
}

/// Judged on the last extension only, so `clip.mp4.exe` is rejected.
pub fn has_servable_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| SERVABLE_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_supported_sites() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "http://youtu.be/dQw4w9WgXcQ",
            "https://m.youtube.com/watch?v=123",
            "https://vm.tiktok.com/ZM8G",
            "https://soundcloud.com/artist/track",
            "https://fb.watch/123",
            "https://x.com/user/status/123",
            "https://www.youtube.com:443/watch?v=1",
        ] {
            assert!(is_safe_url(url), "should be allowed: {url}");
        }
    }

    #[test]
    fn blocks_everything_else() {
        for url in [
            "",
            "not_a_url",
            "youtube.com",
            "https://google.com",
            "ftp://youtube.com/file",
            "file:///etc/passwd",
            "http://localhost:5000",
            "http://127.0.0.1/admin",
            "javascript:alert(1)",
            "https://youtube.com.evil.com",
            "https://evil-youtube.com",
        ] {
            assert!(!is_safe_url(url), "should be blocked: {url}");
        }
    }

    #[test]
    fn sanitizes_custom_filenames() {
        assert_eq!(
            sanitize_custom_filename("my/holiday:*clip?"),
            Some("myholidayclip".to_string())
        );
        assert_eq!(
            sanitize_custom_filename("../../etc/passwd"),
            Some("etcpasswd".to_string())
        );
        assert_eq!(
            sanitize_custom_filename("100%(title)s"),
            Some("100(title)s".to_string())
        );
        assert_eq!(sanitize_custom_filename(" /\\:*?\"<>| "), None);
        assert_eq!(sanitize_custom_filename("..."), None);
    }

    #[test]
    fn servable_extensions_use_the_last_suffix() {
        for name in ["video.mp4", "song.mp3", "image.jpg", "movie.MKV", "audio.flac"] {
            assert!(has_servable_extension(name), "{name}");
        }
        for name in [
            "virus.exe",
            "script.sh",
            "safe.jpg.exe",
            "video.mp4.bat",
            "data.json",
            "noextension",
        ] {
            assert!(!has_servable_extension(name), "{name}");
        }
    }

    #[test]
    fn plain_filenames_only() {
        assert!(is_plain_filename("clip.mp4"));
        assert!(!is_plain_filename("../clip.mp4"));
        assert!(!is_plain_filename("dir/clip.mp4"));
        assert!(!is_plain_filename(".hidden.mp4"));
        assert!(!is_plain_filename(""));
    }
}
