pub mod manager;
pub mod ytdlp;

use serde_json::Value;

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Downloading,
    Finished,
}

/// One progress report from the engine, shaped like a yt-dlp progress hook.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineProgress {
    pub status: EngineStatus,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<u64>,
    pub eta: Option<f64>,
    pub speed: Option<f64>,
    pub filename: String,
}

impl EngineProgress {
    /// Percentage of the known (or estimated) total, 0 when unknown.
    pub fn percent(&self) -> f64 {
        let total = self.total_bytes.or(self.total_bytes_estimate).unwrap_or(0);
        if total == 0 {
            return 0.0;
        }
        self.downloaded_bytes.unwrap_or(0) as f64 / total as f64 * 100.0
    }
}

/// Callbacks the engine drives while a download runs.
pub trait EngineHooks: Send + Sync {
    fn on_progress(&self, progress: &EngineProgress);
    fn debug(&self, message: &str);
    fn warning(&self, message: &str);
    fn error(&self, message: &str);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadRequest {
    /// URLs or search directives, after service links were resolved.
    pub targets: Vec<String>,
    /// Engine option tokens, passed through in order.
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutcome {
    pub exit_code: i32,
    /// Last diagnostic line of a failed transcode, when one was seen.
    pub diagnostic: Option<String>,
}

impl EngineOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait::async_trait]
pub trait DownloadEngine: Send + Sync {
    async fn download(&self, task_id: &str, request: &DownloadRequest, hooks: &dyn EngineHooks) -> Result<EngineOutcome>;

    /// Raw info document for a URL no service resolver claims.
    async fn extract_info(&self, task_id: &str, url: &str) -> Result<Value>;
}

/// Options whose next token is a value, never a download target.
const VALUE_OPTIONS: &[&str] = &[
    "-o", "--output", "-P", "--paths", "-f", "--format", "-S", "--format-sort",
    "--proxy", "--referer", "--user-agent", "--add-header", "--cookies",
    "--cookies-from-browser", "--audio-format", "--audio-quality", "--ffmpeg-location",
    "--merge-output-format", "--remux-video", "--recode-video", "--postprocessor-args",
    "--ppa", "-r", "--limit-rate", "-R", "--retries", "--socket-timeout", "-I",
    "--playlist-items", "--download-archive", "--exec", "--sub-langs", "--convert-subs",
    "--convert-thumbnails", "--parse-metadata", "--extractor-args", "--downloader",
    "--downloader-args", "-N", "--concurrent-fragments", "--max-downloads",
    "--default-search", "--geo-verification-proxy", "--impersonate", "-u", "--username",
    "-p", "--password", "-a", "--batch-file", "--match-filters", "--output-na-placeholder",
];

/// Whether a bare token names something to download rather than an option.
pub fn looks_like_target(token: &str) -> bool {
    let token = token.trim();
    if token.contains("://") || token.starts_with("spotify:") {
        return true;
    }
    match token.strip_prefix("ytsearch") {
        Some(rest) => rest
            .split_once(':')
            .map(|(count, _)| count.is_empty() || count == "all" || count.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false),
        None => false,
    }
}

/// Splits command arguments into engine options and download targets.
/// Values of known value-taking options stay with their option even when
/// they look like URLs.
pub fn split_args(args: &[String]) -> DownloadRequest {
    let mut request = DownloadRequest::default();
    let mut expects_value = false;

    for arg in args {
        if expects_value {
            request.options.push(arg.clone());
            expects_value = false;
            continue;
        }
        if arg.starts_with('-') {
            expects_value = !arg.contains('=') && VALUE_OPTIONS.contains(&arg.as_str());
            request.options.push(arg.clone());
        } else if looks_like_target(arg) {
            request.targets.push(arg.trim().to_string());
        } else {
            request.options.push(arg.clone());
        }
    }

    request
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn targets_and_options_are_separated() {
        let request = split_args(&strings(&[
            "-x",
            "--audio-format",
            "mp3",
            "https://youtu.be/abc",
            "--proxy",
            "socks5://127.0.0.1:9050",
            "spotify:track:123",
            "-o",
            "%(title)s.%(ext)s",
            "ytsearch1:artist - title audio",
        ]));
        assert_eq!(
            request.targets,
            strings(&["https://youtu.be/abc", "spotify:track:123", "ytsearch1:artist - title audio"])
        );
        assert_eq!(
            request.options,
            strings(&["-x", "--audio-format", "mp3", "--proxy", "socks5://127.0.0.1:9050", "-o", "%(title)s.%(ext)s"])
        );
    }

    #[test]
    fn inline_values_do_not_swallow_next_token() {
        let request = split_args(&strings(&["--format=bestaudio", "https://example.com/v"]));
        assert_eq!(request.targets, strings(&["https://example.com/v"]));
        assert_eq!(request.options, strings(&["--format=bestaudio"]));
    }

    #[test]
    fn search_directive_detection() {
        assert!(looks_like_target("ytsearch:query"));
        assert!(looks_like_target("ytsearch5:query"));
        assert!(looks_like_target("ytsearchall:query"));
        assert!(!looks_like_target("ytsearchdate"));
        assert!(!looks_like_target("bestaudio"));
    }

    #[test]
    fn percent_uses_estimate_when_total_unknown() {
        let mut progress = EngineProgress {
            status: EngineStatus::Downloading,
            downloaded_bytes: Some(250),
            total_bytes: None,
            total_bytes_estimate: Some(1000),
            eta: None,
            speed: None,
            filename: String::new(),
        };
        assert_eq!(progress.percent(), 25.0);

        progress.total_bytes_estimate = None;
        assert_eq!(progress.percent(), 0.0);
    }
}
