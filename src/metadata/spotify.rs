use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use url::Url;

use super::cache::ResolverCache;
use super::http_pool::{host_of, HttpPool};
use super::{json_str, ItemType, ResolvedItem, ServiceResolver, Track};
use crate::config::ResolverConfig;
use crate::errors::Result;
use crate::utils::pick_best_image;

pub const SERVICE: &str = "spotify";
const WEB_BASE: &str = "https://open.spotify.com";
const NEXT_DATA_MARKER: &str = "__NEXT_DATA__\" type=\"application/json\">";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyRef {
    pub item_type: ItemType,
    pub id: String,
}

impl SpotifyRef {
    pub fn canonical_url(&self) -> String {
        format!("{}/{}/{}", WEB_BASE, self.item_type.as_str(), self.id)
    }
}

pub struct SpotifyResolver {
    http: HttpPool,
    cache: Arc<ResolverCache<ResolvedItem>>,
    web_base: String,
    short_hosts: Vec<String>,
    max_tracks: usize,
    max_hops: usize,
}

impl SpotifyResolver {
    pub fn new(http: HttpPool, config: &ResolverConfig) -> Self {
        Self {
            http,
            cache: Arc::new(ResolverCache::new(config.cache_capacity)),
            web_base: WEB_BASE.to_string(),
            short_hosts: vec!["spotify.link".to_string()],
            max_tracks: config.max_tracks,
            max_hops: config.max_redirect_hops,
        }
    }

    /// Points the embed and oEmbed fetches at another host.
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.web_base = base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_short_link_host(mut self, host: &str) -> Self {
        self.short_hosts.push(host.to_lowercase());
        self
    }

    pub fn cache(&self) -> &Arc<ResolverCache<ResolvedItem>> {
        &self.cache
    }

    fn is_short_link(&self, url: &str) -> bool {
        let host = host_of(url);
        !host.is_empty() && self.short_hosts.iter().any(|short| host.ends_with(short.as_str()))
    }

    async fn canonicalize(&self, raw_url: &str) -> Option<SpotifyRef> {
        let raw_url = raw_url.trim();
        if raw_url.starts_with("spotify:") {
            return parse_spotify_url(raw_url);
        }
        let target = self
            .http
            .follow_short_links(raw_url, self.max_hops, |u| self.is_short_link(u))
            .await;
        parse_spotify_url(&target)
    }

    async fn fetch_oembed(&self, canonical: &str) -> Option<Value> {
        let url = format!("{}/oembed?url={}", self.web_base, urlencoding::encode(canonical));
        match self.http.fetch_json(&url, self.http.redirect_timeout()).await {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("⚠️ [SPOTIFY] oEmbed unavailable for {}: {}", canonical, e);
                None
            }
        }
    }

    async fn fetch_embed_entity(&self, reference: &SpotifyRef) -> Option<Value> {
        let url = format!("{}/embed/{}/{}", self.web_base, reference.item_type.as_str(), reference.id);
        let html = match self.http.fetch_text(&url, self.http.lookup_timeout()).await {
            Ok(html) => html,
            Err(e) => {
                log::debug!("⚠️ [SPOTIFY] embed page unavailable for {}: {}", url, e);
                return None;
            }
        };

        let mut data = extract_next_data(&html)?;
        match data
            .pointer_mut("/props/pageProps/state/data/entity")
            .map(Value::take)
            .unwrap_or(Value::Null)
        {
            Value::Null => {
                log::debug!("⚠️ [SPOTIFY] embed page for {} has no entity", url);
                None
            }
            entity => Some(entity),
        }
    }
}

#[async_trait::async_trait]
impl ServiceResolver for SpotifyResolver {
    fn name(&self) -> &'static str {
        SERVICE
    }

    fn matches(&self, url: &str) -> bool {
        is_spotify_url(url)
    }

    async fn resolve(&self, url: &str) -> Result<Option<ResolvedItem>> {
        let Some(reference) = self.canonicalize(url).await else {
            log::debug!("🔍 [SPOTIFY] not a resolvable link: {}", url);
            return Ok(None);
        };
        let canonical = reference.canonical_url();

        if let Some(cached) = self.cache.get(&canonical).await {
            log::debug!("💾 [SPOTIFY] cache hit for {}", canonical);
            return Ok(Some(cached));
        }

        log::info!("🔍 [SPOTIFY] resolving {} {}", reference.item_type.as_str(), reference.id);
        let oembed = self.fetch_oembed(&canonical).await;
        let entity = self.fetch_embed_entity(&reference).await;

        let mut item = ResolvedItem::new(SERVICE, reference.item_type, canonical.clone());
        if let Some(oembed) = &oembed {
            item.backfill(
                json_str(oembed, "title"),
                json_str(oembed, "author_name"),
                json_str(oembed, "author_url"),
                json_str(oembed, "thumbnail_url"),
            );
        }

        if let Some(entity) = &entity {
            let title = json_str(entity, "title").or_else(|| json_str(entity, "name"));
            let author = if entity["type"].as_str() == Some("track") {
                first_artist_name(entity)
            } else {
                json_str(entity, "subtitle")
            };
            let author_url = entity["relatedEntityUri"].as_str().and_then(uri_to_url);
            item.backfill(title, author, author_url, entity_thumbnail(entity));
            item.tracks = tracks_from_entity(entity, &canonical);
        }

        item.finalize(self.max_tracks);

        if oembed.is_some() || entity.is_some() {
            self.cache.put(canonical, item.clone()).await;
        }
        log::info!("✅ [SPOTIFY] {} resolved with {} tracks", item.url, item.tracks.len());
        Ok(Some(item))
    }
}

pub fn is_spotify_url(url: &str) -> bool {
    let lowered = url.to_lowercase();
    lowered.contains("spotify:") || lowered.contains("spotify.com") || lowered.contains("spotify.link")
}

fn intl_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^/intl-[a-zA-Z-]+/").expect("static intl pattern"))
}

/// Canonical reference for `spotify:<type>:<id>` URIs and
/// `open.spotify.com/[intl-xx/][embed/]<type>/<id>` links. Short links are
/// not followed here.
pub fn parse_spotify_url(raw_url: &str) -> Option<SpotifyRef> {
    let raw_url = raw_url.trim();

    if let Some(rest) = raw_url.strip_prefix("spotify:") {
        let mut parts = rest.split(':');
        let item_type = ItemType::parse(parts.next()?)?;
        let id = parts.next().filter(|id| !id.is_empty())?;
        return Some(SpotifyRef { item_type, id: id.to_string() });
    }

    let parsed = Url::parse(raw_url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if !host.ends_with("spotify.com") {
        return None;
    }

    let path = intl_prefix().replace(parsed.path(), "/");
    let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
    if parts.peek() == Some(&"embed") {
        parts.next();
    }

    let item_type = ItemType::parse(parts.next()?)?;
    let id = parts.next()?;
    Some(SpotifyRef { item_type, id: id.to_string() })
}

/// The JSON blob a Next.js page embeds in its `__NEXT_DATA__` script tag.
pub fn extract_next_data(html: &str) -> Option<Value> {
    let start = html.find(NEXT_DATA_MARKER)? + NEXT_DATA_MARKER.len();
    let end = start + html[start..].find("</script>")?;
    match serde_json::from_str(&html[start..end]) {
        Ok(value) => Some(value),
        Err(e) => {
            log::debug!("⚠️ [SPOTIFY] __NEXT_DATA__ is not valid JSON: {}", e);
            None
        }
    }
}

fn uri_to_url(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("spotify:")?;
    let mut parts = rest.split(':');
    let kind = parts.next().filter(|k| !k.is_empty())?;
    let id = parts.next().filter(|id| !id.is_empty())?;
    Some(format!("{}/{}/{}", WEB_BASE, kind, id))
}

fn first_artist_name(entity: &Value) -> Option<String> {
    entity["artists"]
        .as_array()?
        .iter()
        .find_map(|artist| json_str(artist, "name"))
}

fn entity_thumbnail(entity: &Value) -> Option<String> {
    if let Some(images) = entity["visualIdentity"]["image"].as_array().filter(|a| !a.is_empty()) {
        return pick_best_image(images);
    }
    entity["coverArt"]["sources"]
        .as_array()
        .and_then(|sources| pick_best_image(sources))
}

/// Tracks from an embed entity: the `trackList` of a collection, or the
/// entity itself when it is a track.
pub fn tracks_from_entity(entity: &Value, fallback_url: &str) -> Vec<Track> {
    let link = |value: &Value| {
        value["uri"]
            .as_str()
            .and_then(uri_to_url)
            .unwrap_or_else(|| fallback_url.to_string())
    };

    if let Some(list) = entity["trackList"].as_array().filter(|l| !l.is_empty()) {
        return list
            .iter()
            .filter_map(|entry| {
                let title = json_str(entry, "title").or_else(|| json_str(entry, "name"))?;
                Some(Track {
                    title: Some(title),
                    artist: json_str(entry, "subtitle"),
                    duration_ms: entry["duration"].as_u64(),
                    service_url: Some(link(entry)),
                })
            })
            .collect();
    }

    if entity["type"].as_str() == Some("track") {
        if let Some(title) = json_str(entity, "title").or_else(|| json_str(entity, "name")) {
            return vec![Track {
                title: Some(title),
                artist: first_artist_name(entity),
                duration_ms: entity["duration"].as_u64(),
                service_url: Some(link(entity)),
            }];
        }
    }

    Vec::new()
}
