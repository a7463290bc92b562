pub mod ytmusic;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::SearchResult;
use crate::config::SearchConfig;
use crate::downloader::ytdlp::YtDlpEngine;
use crate::errors::Result;
use crate::utils::format_duration;

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Message reported when the command carries no query.
    fn empty_query_error(&self) -> &'static str {
        "No query provided"
    }

    async fn search(&self, task_id: &str, query: &str, limit: usize) -> Result<Vec<SearchResult>>;
}

/// Reads the optional limit argument: an integer, clamped to
/// `1..=max_limit`, falling back to the default when absent or malformed.
pub fn parse_limit(raw: Option<&str>, config: &SearchConfig) -> usize {
    let max = config.max_limit.max(1);
    match raw.map(str::trim).and_then(|value| value.parse::<i64>().ok()) {
        Some(limit) => limit.clamp(1, max as i64) as usize,
        None => config.default_limit.clamp(1, max),
    }
}

/// Generic video search through the download engine's `ytsearch` extractor.
pub struct WebSearch {
    engine: Arc<YtDlpEngine>,
}

impl WebSearch {
    pub fn new(engine: Arc<YtDlpEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl SearchBackend for WebSearch {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn search(&self, task_id: &str, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let entries = self.engine.search_entries(task_id, query, limit).await?;
        Ok(entries.iter().filter_map(result_from_entry).take(limit).collect())
    }
}

/// Maps one flat yt-dlp entry onto a search hit; entries without an id are
/// dropped.
pub fn result_from_entry(entry: &Value) -> Option<SearchResult> {
    let id = entry["id"].as_str().filter(|id| !id.is_empty())?.to_string();
    let text = |key: &str| entry[key].as_str().filter(|s| !s.is_empty()).map(str::to_string);

    let duration = entry["duration"].as_f64();
    let thumbnail = text("thumbnail").or_else(|| {
        entry["thumbnails"]
            .as_array()
            .and_then(|thumbs| thumbs.iter().rev().find_map(|t| t["url"].as_str()))
            .map(str::to_string)
    });
    let url = text("webpage_url")
        .or_else(|| text("url"))
        .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", id));

    Some(SearchResult {
        title: text("title"),
        uploader: text("uploader").or_else(|| text("channel")),
        duration_string: text("duration_string").or_else(|| duration.map(format_duration)),
        duration,
        thumbnail,
        url,
        id,
    })
}
