use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER};
use serde_json::{json, Value};

use super::SearchBackend;
use crate::api::SearchResult;
use crate::errors::Result;
use crate::metadata::http_pool::HttpPool;
use crate::utils::{format_duration, parse_clock_duration};

const MUSIC_BASE: &str = "https://music.youtube.com";
const CLIENT_NAME: &str = "WEB_REMIX";
const CLIENT_VERSION: &str = "1.20240918.01.00";
const SONGS_FILTER: &str = "EgWKAQIIAWoMEA4QChADEAQQCRAF";
const VIDEOS_FILTER: &str = "EgWKAQIQAWoMEA4QChADEAQQCRAF";

/// Unauthenticated YouTube Music search. Songs first, videos when the songs
/// shelf comes back empty.
pub struct MusicSearch {
    http: HttpPool,
    base_url: String,
}

impl MusicSearch {
    pub fn new(http: HttpPool) -> Self {
        Self {
            http,
            base_url: MUSIC_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn search_filtered(&self, query: &str, filter: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let url = format!("{}/youtubei/v1/search?prettyPrint=false", self.base_url);
        let body = json!({
            "context": {
                "client": {
                    "clientName": CLIENT_NAME,
                    "clientVersion": CLIENT_VERSION,
                    "hl": "en",
                    "gl": "US"
                }
            },
            "query": query,
            "params": filter
        });

        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static(MUSIC_BASE));
        headers.insert(REFERER, HeaderValue::from_static("https://music.youtube.com/"));

        let response = self
            .http
            .post_json(&url, headers, &body, self.http.lookup_timeout())
            .await?;
        let mut results = parse_search_response(&response);
        results.truncate(limit);
        Ok(results)
    }
}

#[async_trait]
impl SearchBackend for MusicSearch {
    fn name(&self) -> &'static str {
        "ytmusic"
    }

    fn empty_query_error(&self) -> &'static str {
        "No query provided for YT Music search"
    }

    async fn search(&self, task_id: &str, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        log::info!("🎵 [YTMUSIC] task={} searching songs for '{}' (limit: {})", task_id, query, limit);
        let songs = self.search_filtered(query, SONGS_FILTER, limit).await?;
        if !songs.is_empty() {
            return Ok(songs);
        }

        log::info!("🎵 [YTMUSIC] task={} no songs, falling back to videos", task_id);
        self.search_filtered(query, VIDEOS_FILTER, limit).await
    }
}

/// Every result row in a search response, in document order.
pub fn parse_search_response(response: &Value) -> Vec<SearchResult> {
    let mut renderers = Vec::new();
    collect_renderers(response, &mut renderers);
    renderers.into_iter().filter_map(result_from_renderer).collect()
}

fn collect_renderers<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "musicResponsiveListItemRenderer" {
                    out.push(child);
                } else {
                    collect_renderers(child, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_renderers(item, out)),
        _ => {}
    }
}

fn column_runs(renderer: &Value, index: usize) -> &[Value] {
    renderer["flexColumns"][index]["musicResponsiveListItemFlexColumnRenderer"]["text"]["runs"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn run_page_type(run: &Value) -> Option<&str> {
    run.pointer("/navigationEndpoint/browseEndpoint/browseEndpointContextSupportedConfigs/browseEndpointContextMusicConfig/pageType")
        .and_then(Value::as_str)
}

fn result_from_renderer(renderer: &Value) -> Option<SearchResult> {
    let video_id = renderer
        .pointer("/playlistItemData/videoId")
        .or_else(|| {
            renderer.pointer(
                "/overlay/musicItemThumbnailOverlayRenderer/content/musicPlayButtonRenderer/playNavigationEndpoint/watchEndpoint/videoId",
            )
        })
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())?
        .to_string();

    let title: String = column_runs(renderer, 0)
        .iter()
        .filter_map(|run| run["text"].as_str())
        .collect();

    let details = column_runs(renderer, 1);
    let texts = || details.iter().filter_map(|run| run["text"].as_str()).map(str::trim);

    let mut artists: Vec<&str> = details
        .iter()
        .filter(|run| matches!(run_page_type(run), Some("MUSIC_PAGE_TYPE_ARTIST" | "MUSIC_PAGE_TYPE_USER_CHANNEL")))
        .filter_map(|run| run["text"].as_str())
        .collect();
    if artists.is_empty() {
        artists.extend(texts().find(|text| !text.is_empty() && *text != "•" && *text != "Song" && *text != "Video"));
    }

    let duration_string = texts()
        .filter(|text| text.contains(':'))
        .filter(|text| parse_clock_duration(text).is_some())
        .last()
        .map(str::to_string);
    let duration = duration_string
        .as_deref()
        .and_then(parse_clock_duration)
        .map(|seconds| seconds as f64);

    let thumbnail = renderer
        .pointer("/thumbnail/musicThumbnailRenderer/thumbnail/thumbnails")
        .and_then(Value::as_array)
        .and_then(|thumbs| thumbs.iter().rev().find_map(|t| t["url"].as_str()))
        .map(str::to_string);

    Some(SearchResult {
        url: format!("https://music.youtube.com/watch?v={}", video_id),
        id: video_id,
        title: Some(title).filter(|t| !t.is_empty()),
        uploader: Some(artists.join(", ")).filter(|a| !a.is_empty()),
        duration_string: duration_string.or_else(|| duration.map(format_duration)),
        duration,
        thumbnail,
    })
}
