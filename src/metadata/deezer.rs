use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use url::Url;

use super::cache::ResolverCache;
use super::http_pool::{host_of, HttpPool};
use super::{json_str, ItemType, ResolvedItem, ServiceResolver, Track};
use crate::config::ResolverConfig;
use crate::errors::Result;
use crate::utils::extract_trailing_id;

pub const SERVICE: &str = "deezer";
const API_BASE: &str = "https://api.deezer.com";
const SHORT_HOSTS: [&str; 4] = ["deezer.page.link", "dzr.page.link", "link.deezer.com", "dzr.fm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeezerRef {
    pub item_type: ItemType,
    pub id: String,
}

impl DeezerRef {
    pub fn canonical_url(&self) -> String {
        format!("https://www.deezer.com/{}/{}", self.item_type.as_str(), self.id)
    }
}

pub struct DeezerResolver {
    http: HttpPool,
    cache: Arc<ResolverCache<ResolvedItem>>,
    api_base: String,
    extra_short_hosts: Vec<String>,
    max_tracks: usize,
    max_hops: usize,
}

impl DeezerResolver {
    pub fn new(http: HttpPool, config: &ResolverConfig) -> Self {
        Self {
            http,
            cache: Arc::new(ResolverCache::new(config.cache_capacity)),
            api_base: API_BASE.to_string(),
            extra_short_hosts: Vec::new(),
            max_tracks: config.max_tracks,
            max_hops: config.max_redirect_hops,
        }
    }

    pub fn with_base_url(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_short_link_host(mut self, host: &str) -> Self {
        self.extra_short_hosts.push(host.to_lowercase());
        self
    }

    pub fn cache(&self) -> &Arc<ResolverCache<ResolvedItem>> {
        &self.cache
    }

    fn is_short_link(&self, url: &str) -> bool {
        let host = host_of(url);
        !host.is_empty()
            && (SHORT_HOSTS.iter().any(|short| host.ends_with(short))
                || self.extra_short_hosts.iter().any(|short| host.ends_with(short.as_str())))
    }

    /// Fetches an API document; a body carrying an `error` object counts as
    /// a failed fetch.
    async fn fetch_api(&self, url: &str) -> Option<Value> {
        match self.http.fetch_json(url, self.http.lookup_timeout()).await {
            Ok(value) if value.get("error").is_some() => {
                log::debug!("⚠️ [DEEZER] API error for {}: {}", url, value["error"]);
                None
            }
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("⚠️ [DEEZER] fetch failed for {}: {}", url, e);
                None
            }
        }
    }

    /// Walks a `tracklist` URL and its `next` links until `expected` tracks
    /// or the cap is reached. Stops early on a failed or empty page, or when
    /// `next` points back at a page already fetched.
    async fn fetch_tracklist(&self, first_page: &str, expected: usize) -> Vec<Value> {
        let limit = expected.min(self.max_tracks);
        let mut tracks: Vec<Value> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut next = Some(first_page.to_string());

        while let Some(page_url) = next.take() {
            if tracks.len() >= limit {
                break;
            }
            if !visited.insert(page_url.clone()) {
                log::debug!("⚠️ [DEEZER] tracklist loops back to {}", page_url);
                break;
            }
            let Some(mut page) = self.fetch_api(&page_url).await else {
                break;
            };
            let batch = page
                .get_mut("data")
                .and_then(Value::as_array_mut)
                .map(std::mem::take)
                .unwrap_or_default();
            if batch.is_empty() {
                log::debug!("⚠️ [DEEZER] empty tracklist page at {}", page_url);
                break;
            }
            tracks.extend(batch);
            next = json_str(&page, "next");
            log::debug!("📄 [DEEZER] tracklist page gave {} tracks so far", tracks.len());
        }

        tracks.truncate(self.max_tracks);
        tracks
    }

    async fn fetch_oembed(&self, canonical: &str) -> Option<Value> {
        let url = format!("{}/oembed?url={}", self.api_base, urlencoding::encode(canonical));
        match self.http.fetch_json(&url, self.http.redirect_timeout()).await {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("⚠️ [DEEZER] oEmbed unavailable for {}: {}", canonical, e);
                None
            }
        }
    }

    async fn build_item(&self, reference: &DeezerRef) -> Option<ResolvedItem> {
        let canonical = reference.canonical_url();
        let kind = reference.item_type.as_str();
        let mut item = ResolvedItem::new(SERVICE, reference.item_type, canonical.clone());

        let document = self
            .fetch_api(&format!("{}/{}/{}", self.api_base, kind, reference.id))
            .await;

        if let Some(doc) = &document {
            match reference.item_type {
                ItemType::Track => {
                    item.backfill(
                        json_str(doc, "title"),
                        json_str(&doc["artist"], "name"),
                        json_str(&doc["artist"], "link"),
                        json_str(&doc["album"], "cover_xl").or_else(|| json_str(&doc["album"], "cover_big")),
                    );
                    item.tracks = vec![track_from_json(doc)];
                }
                ItemType::Album | ItemType::Playlist => {
                    let (owner, cover_xl, cover_big) = if reference.item_type == ItemType::Album {
                        (&doc["artist"], "cover_xl", "cover_big")
                    } else {
                        (&doc["creator"], "picture_xl", "picture_big")
                    };
                    item.backfill(
                        json_str(doc, "title"),
                        json_str(owner, "name"),
                        json_str(owner, "link"),
                        json_str(doc, cover_xl).or_else(|| json_str(doc, cover_big)),
                    );

                    let mut entries = doc["tracks"]["data"].as_array().cloned().unwrap_or_default();
                    let declared = doc["nb_tracks"].as_u64().unwrap_or(0) as usize;
                    if let Some(tracklist) = json_str(doc, "tracklist") {
                        if entries.len() < declared {
                            let fetched = self.fetch_tracklist(&tracklist, declared).await;
                            if fetched.len() > entries.len() {
                                entries = fetched;
                            }
                        }
                    }
                    item.tracks = entries.iter().map(track_from_json).collect();
                }
                _ => {}
            }
        }

        let incomplete = item.title.is_none() || item.author.is_none() || item.thumbnail.is_none();
        let oembed = if incomplete { self.fetch_oembed(&canonical).await } else { None };
        if let Some(oembed) = &oembed {
            item.backfill(
                json_str(oembed, "title"),
                json_str(oembed, "author_name"),
                json_str(oembed, "author_url"),
                json_str(oembed, "thumbnail_url"),
            );
        }

        if document.is_none() && oembed.is_none() {
            return None;
        }
        item.finalize(self.max_tracks);
        Some(item)
    }
}

#[async_trait::async_trait]
impl ServiceResolver for DeezerResolver {
    fn name(&self) -> &'static str {
        SERVICE
    }

    fn matches(&self, url: &str) -> bool {
        is_deezer_url(url)
    }

    async fn resolve(&self, url: &str) -> Result<Option<ResolvedItem>> {
        let target = self
            .http
            .follow_short_links(url.trim(), self.max_hops, |u| self.is_short_link(u))
            .await;
        let Some(reference) = parse_deezer_url(&target) else {
            log::debug!("🔍 [DEEZER] not a resolvable link: {}", url);
            return Ok(None);
        };
        let canonical = reference.canonical_url();

        if let Some(cached) = self.cache.get(&canonical).await {
            log::debug!("💾 [DEEZER] cache hit for {}", canonical);
            return Ok(Some(cached));
        }

        log::info!("🔍 [DEEZER] resolving {} {}", reference.item_type.as_str(), reference.id);
        let Some(item) = self.build_item(&reference).await else {
            log::warn!("⚠️ [DEEZER] no metadata available for {}", canonical);
            return Ok(None);
        };

        self.cache.put(canonical, item.clone()).await;
        log::info!("✅ [DEEZER] {} resolved with {} tracks", item.url, item.tracks.len());
        Ok(Some(item))
    }
}

pub fn is_deezer_url(url: &str) -> bool {
    let lowered = url.to_lowercase();
    lowered.contains("deezer.com")
        || lowered.contains("deezer.page.link")
        || lowered.contains("dzr.page.link")
        || lowered.contains("link.deezer.com")
        || lowered.contains("dzr.fm")
}

fn is_locale_segment(segment: &str) -> bool {
    let mut parts = segment.split('-');
    let language = parts.next().unwrap_or("");
    language.len() == 2
        && language.chars().all(|c| c.is_ascii_alphabetic())
        && parts.all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_alphabetic()))
}

/// `deezer.com/[<locale>/]<type>/<slug-or-id>` to a reference. Short links
/// are not followed here.
pub fn parse_deezer_url(raw_url: &str) -> Option<DeezerRef> {
    let parsed = Url::parse(raw_url.trim()).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if !host.ends_with("deezer.com") || host.ends_with("link.deezer.com") {
        return None;
    }

    let mut parts: Vec<&str> = parsed.path().split('/').filter(|p| !p.is_empty()).collect();
    if parts.first().map(|p| is_locale_segment(p)).unwrap_or(false) {
        parts.remove(0);
    }
    if parts.len() < 2 {
        return None;
    }

    let item_type = match parts[0] {
        "track" => ItemType::Track,
        "album" => ItemType::Album,
        "playlist" => ItemType::Playlist,
        _ => return None,
    };
    let id = extract_trailing_id(parts[1])?;
    Some(DeezerRef { item_type, id })
}

fn track_from_json(value: &Value) -> Track {
    Track {
        title: json_str(value, "title"),
        artist: json_str(&value["artist"], "name"),
        duration_ms: value["duration"].as_u64().map(|secs| secs * 1000),
        service_url: json_str(value, "link"),
    }
}
