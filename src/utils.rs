use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Trailing run of ASCII digits, e.g. the id at the end of a slug.
pub fn extract_trailing_id(value: &str) -> Option<String> {
    let digits: String = value
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// URL of the largest image by area, breaking ties on height then width.
/// Reads `width`/`height` or `maxWidth`/`maxHeight`.
pub fn pick_best_image(sources: &[Value]) -> Option<String> {
    let dimension = |source: &Value, key: &str, fallback: &str| {
        source[key].as_u64().or_else(|| source[fallback].as_u64()).unwrap_or(0)
    };

    sources
        .iter()
        .filter(|source| source["url"].as_str().is_some())
        .max_by_key(|source| {
            let height = dimension(source, "height", "maxHeight");
            let width = dimension(source, "width", "maxWidth");
            (height * width, height, width)
        })
        .and_then(|source| source["url"].as_str().map(str::to_string))
}

/// Rewrites iTunes artwork sizes such as `/100x100bb` to `/600x600bb`.
pub fn normalize_artwork(url: &str) -> String {
    static SIZE: OnceLock<Regex> = OnceLock::new();
    let pattern = SIZE.get_or_init(|| Regex::new(r"/\d+x\d+bb").expect("static artwork pattern"));
    pattern.replace_all(url, "/600x600bb").into_owned()
}

/// `"3:45"` or `"1:02:03"` to seconds; `None` for anything not purely
/// colon-separated digits.
pub fn parse_clock_duration(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.split(':').try_fold(0u64, |total, part| {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        total.checked_mul(60)?.checked_add(part.parse::<u64>().ok()?)
    })
}

pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 { seconds as u64 } else { 0 };
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Current `PATH` with `extra` appended, skipping entries already present.
pub fn extended_path(extra: &[PathBuf]) -> Option<std::ffi::OsString> {
    let current = std::env::var_os("PATH").unwrap_or_default();
    let mut paths: Vec<PathBuf> = std::env::split_paths(&current).collect();
    let before = paths.len();
    for dir in extra {
        if !paths.contains(dir) {
            paths.push(dir.clone());
        }
    }
    if paths.len() == before {
        return None;
    }
    std::env::join_paths(paths).ok()
}
