use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Fields scraped from one ffmpeg status line. Values are kept exactly as
/// printed; an absent field is `None`, never zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FfmpegProgress {
    pub frame: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
}

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(concat!(
            r"frame=\s*(?P<frame>\d+)",
            r"(?:\s+fps=\s*(?P<fps>[\d.]+))?",
            r"(?:\s+q=\s*(?P<q>-?[\d.]+))?",
            r"(?:\s+size=\s*(?P<size>\S+))?",
            r"\s+time=(?P<time>\d{2}:\d{2}:\d{2}\.\d+)",
            r"(?:\s+bitrate=\s*(?P<bitrate>\S+))?",
            r"(?:\s+speed=\s*(?P<speed>\S+))?",
        ))
        .expect("static ffmpeg progress pattern")
    })
}

/// Returns the progress fields of `line`, or `None` when the line is not a
/// status line (it needs both a frame counter and an elapsed time).
pub fn parse_progress_line(line: &str) -> Option<FfmpegProgress> {
    if !line.contains("frame=") || !line.contains("time=") {
        return None;
    }

    let caps = progress_pattern().captures(line)?;
    let field = |name: &str| caps.name(name).map(|m| m.as_str().to_string());

    Some(FfmpegProgress {
        frame: field("frame")?,
        fps: field("fps"),
        q: field("q"),
        size: field("size"),
        time: field("time")?,
        bitrate: field("bitrate"),
        speed: field("speed"),
    })
}
