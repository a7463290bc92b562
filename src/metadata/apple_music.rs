use std::sync::Arc;

use serde_json::Value;
use url::Url;

use super::cache::ResolverCache;
use super::http_pool::{host_of, HttpPool};
use super::{json_str, ItemType, ResolvedItem, ServiceResolver, Track};
use crate::config::ResolverConfig;
use crate::errors::{AppError, Result};
use crate::utils::{extract_trailing_id, normalize_artwork};

pub const SERVICE: &str = "apple_music";
const LOOKUP_BASE: &str = "https://itunes.apple.com";
const OEMBED_BASE: &str = "https://embed.music.apple.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppleRef {
    Playlist,
    Album {
        storefront: Option<String>,
        collection_id: String,
    },
    Track {
        storefront: Option<String>,
        track_id: String,
        collection_id: Option<String>,
    },
}

impl AppleRef {
    pub fn item_type(&self) -> ItemType {
        match self {
            AppleRef::Playlist => ItemType::Playlist,
            AppleRef::Album { .. } => ItemType::Album,
            AppleRef::Track { .. } => ItemType::Track,
        }
    }

    fn storefront(&self) -> Option<&str> {
        match self {
            AppleRef::Playlist => None,
            AppleRef::Album { storefront, .. } | AppleRef::Track { storefront, .. } => storefront.as_deref(),
        }
    }

    /// Rebuilt from storefront, kind and ids. Playlists have no canonical form.
    pub fn canonical_url(&self) -> Option<String> {
        let prefix = match self.storefront() {
            Some(storefront) => format!("https://music.apple.com/{}", storefront),
            None => "https://music.apple.com".to_string(),
        };
        match self {
            AppleRef::Playlist => None,
            AppleRef::Album { collection_id, .. } => Some(format!("{}/album/{}", prefix, collection_id)),
            AppleRef::Track { track_id, collection_id: Some(collection_id), .. } => {
                Some(format!("{}/album/{}?i={}", prefix, collection_id, track_id))
            }
            AppleRef::Track { track_id, collection_id: None, .. } => Some(format!("{}/song/{}", prefix, track_id)),
        }
    }
}

pub struct AppleMusicResolver {
    http: HttpPool,
    cache: Arc<ResolverCache<ResolvedItem>>,
    lookup_base: String,
    oembed_base: String,
    short_hosts: Vec<String>,
    max_tracks: usize,
    max_hops: usize,
}

impl AppleMusicResolver {
    pub fn new(http: HttpPool, config: &ResolverConfig) -> Self {
        Self {
            http,
            cache: Arc::new(ResolverCache::new(config.cache_capacity)),
            lookup_base: LOOKUP_BASE.to_string(),
            oembed_base: OEMBED_BASE.to_string(),
            short_hosts: vec!["apple.co".to_string()],
            max_tracks: config.max_tracks,
            max_hops: config.max_redirect_hops,
        }
    }

    /// Sends both the lookup and oEmbed requests to `base`.
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        self.lookup_base = base.clone();
        self.oembed_base = base;
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

    async fn lookup(&self, id: &str, storefront: Option<&str>, entity: Option<&str>) -> Option<Vec<Value>> {
        let mut params = vec![("id", id)];
        if let Some(country) = storefront {
            params.push(("country", country));
        }
        if let Some(entity) = entity {
            params.push(("entity", entity));
        }
        let url = Url::parse_with_params(&format!("{}/lookup", self.lookup_base), &params).ok()?;

        match self.http.fetch_json(url.as_str(), self.http.lookup_timeout()).await {
            Ok(mut value) => match value.get_mut("results").map(Value::take) {
                Some(Value::Array(results)) if !results.is_empty() => Some(results),
                _ => {
                    log::debug!("⚠️ [APPLE] lookup for {} returned no results", id);
                    None
                }
            },
            Err(e) => {
                log::debug!("⚠️ [APPLE] lookup failed for {}: {}", id, e);
                None
            }
        }
    }

    async fn fetch_oembed(&self, canonical: &str) -> Option<Value> {
        let url = format!("{}/oembed?url={}", self.oembed_base, urlencoding::encode(canonical));
        match self.http.fetch_json(&url, self.http.redirect_timeout()).await {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("⚠️ [APPLE] oEmbed unavailable for {}: {}", canonical, e);
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl ServiceResolver for AppleMusicResolver {
    fn name(&self) -> &'static str {
        SERVICE
    }

    fn matches(&self, url: &str) -> bool {
        is_apple_music_url(url)
    }

    async fn resolve(&self, url: &str) -> Result<Option<ResolvedItem>> {
        let target = self
            .http
            .follow_short_links(url.trim(), self.max_hops, |u| self.is_short_link(u))
            .await;
        let Some(reference) = parse_apple_music_url(&target) else {
            log::debug!("🔍 [APPLE] not a resolvable link: {}", url);
            return Ok(None);
        };
        let Some(canonical) = reference.canonical_url() else {
            log::info!("🚫 [APPLE] playlists are not expanded: {}", url);
            return Err(AppError::UnsupportedLink);
        };

        if let Some(cached) = self.cache.get(&canonical).await {
            log::debug!("💾 [APPLE] cache hit for {}", canonical);
            return Ok(Some(cached));
        }

        log::info!("🔍 [APPLE] resolving {}", canonical);
        let mut item = ResolvedItem::new(SERVICE, reference.item_type(), canonical.clone());
        let mut fetched = false;

        match &reference {
            AppleRef::Track { storefront, track_id, .. } => {
                if let Some(results) = self.lookup(track_id, storefront.as_deref(), None).await {
                    if let Some(row) = results.iter().find(|r| r["wrapperType"] == "track") {
                        fetched = true;
                        item.backfill(
                            json_str(row, "trackName"),
                            json_str(row, "artistName"),
                            json_str(row, "artistViewUrl"),
                            row["artworkUrl100"].as_str().map(normalize_artwork),
                        );
                        item.tracks = tracks_from_results(std::slice::from_ref(row));
                    }
                }
            }
            AppleRef::Album { storefront, collection_id } => {
                if let Some(results) = self.lookup(collection_id, storefront.as_deref(), Some("song")).await {
                    fetched = true;
                    if let Some(collection) = results.iter().find(|r| r["wrapperType"] == "collection") {
                        item.backfill(
                            json_str(collection, "collectionName"),
                            json_str(collection, "artistName"),
                            json_str(collection, "artistViewUrl"),
                            collection["artworkUrl100"].as_str().map(normalize_artwork),
                        );
                    }
                    item.tracks = tracks_from_results(&results);
                }
            }
            AppleRef::Playlist => {}
        }

        let incomplete = item.title.is_none() || item.author.is_none() || item.thumbnail.is_none();
        if incomplete {
            if let Some(oembed) = self.fetch_oembed(&canonical).await {
                fetched = true;
                item.backfill(
                    json_str(&oembed, "title"),
                    json_str(&oembed, "author_name"),
                    json_str(&oembed, "author_url"),
                    json_str(&oembed, "thumbnail_url"),
                );
            }
        }

        if !fetched {
            log::warn!("⚠️ [APPLE] no metadata available for {}", canonical);
            return Ok(None);
        }

        item.finalize(self.max_tracks);
        self.cache.put(canonical, item.clone()).await;
        log::info!("✅ [APPLE] {} resolved with {} tracks", item.url, item.tracks.len());
        Ok(Some(item))
    }
}

pub fn is_apple_music_url(url: &str) -> bool {
    let lowered = url.to_lowercase();
    lowered.contains("music.apple.com") || lowered.contains("itunes.apple.com") || lowered.contains("apple.co/")
}

/// Reference for `music.apple.com/[<storefront>/]{album,song,playlist}/...`
/// links. Short links are not followed here.
pub fn parse_apple_music_url(raw_url: &str) -> Option<AppleRef> {
    let parsed = Url::parse(raw_url.trim()).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if !(host.ends_with("music.apple.com") || host.ends_with("itunes.apple.com")) {
        return None;
    }

    let mut parts: Vec<&str> = parsed.path().split('/').filter(|p| !p.is_empty()).collect();
    let mut storefront = None;
    if parts.first().map(|p| p.len() == 2).unwrap_or(false) {
        storefront = Some(parts.remove(0).to_lowercase());
    }

    match *parts.first()? {
        "playlist" => Some(AppleRef::Playlist),
        "album" => {
            let collection_id = parts.last().and_then(|p| extract_trailing_id(p));
            let track_id = parsed
                .query_pairs()
                .find(|(key, _)| key == "i")
                .map(|(_, value)| value.into_owned())
                .filter(|value| !value.is_empty());
            match track_id {
                Some(track_id) => Some(AppleRef::Track { storefront, track_id, collection_id }),
                None => Some(AppleRef::Album { storefront, collection_id: collection_id? }),
            }
        }
        "song" => {
            let track_id = parts.last().and_then(|p| extract_trailing_id(p))?;
            Some(AppleRef::Track { storefront, track_id, collection_id: None })
        }
        _ => None,
    }
}

fn tracks_from_results(results: &[Value]) -> Vec<Track> {
    results
        .iter()
        .filter(|row| row["wrapperType"] == "track")
        .filter_map(|row| {
            Some(Track {
                title: Some(json_str(row, "trackName")?),
                artist: json_str(row, "artistName"),
                duration_ms: row["trackTimeMillis"].as_u64(),
                service_url: json_str(row, "trackViewUrl"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, ResolverConfig};
    use crate::metadata::query::build_queries;
    use httpmock::prelude::*;
    use serde_json::json;

    fn resolver(server: &MockServer) -> AppleMusicResolver {
        let http = HttpPool::new(&NetworkConfig::default()).unwrap();
        AppleMusicResolver::new(http, &ResolverConfig::default()).with_base_url(&server.base_url())
    }

    #[test]
    fn parses_album_song_and_playlist() {
        assert_eq!(
            parse_apple_music_url("https://music.apple.com/us/album/random-access-memories/617154241"),
            Some(AppleRef::Album { storefront: Some("us".to_string()), collection_id: "617154241".to_string() })
        );
        assert_eq!(
            parse_apple_music_url("https://music.apple.com/gb/album/get-lucky/617154241?i=617154366"),
            Some(AppleRef::Track {
                storefront: Some("gb".to_string()),
                track_id: "617154366".to_string(),
                collection_id: Some("617154241".to_string()),
            })
        );
        assert_eq!(
            parse_apple_music_url("https://music.apple.com/song/get-lucky/617154366"),
            Some(AppleRef::Track { storefront: None, track_id: "617154366".to_string(), collection_id: None })
        );
        assert_eq!(
            parse_apple_music_url("https://music.apple.com/us/playlist/todays-hits/pl.f4d106fed2bd41149aaacabb233eb5eb"),
            Some(AppleRef::Playlist)
        );
        assert_eq!(parse_apple_music_url("https://music.apple.com/us/artist/daft-punk/5468295"), None);
        assert_eq!(parse_apple_music_url("https://music.apple.com/us/album/no-id"), None);
    }

    #[test]
    fn canonical_urls_are_rebuilt() {
        let track = AppleRef::Track {
            storefront: Some("gb".to_string()),
            track_id: "2".to_string(),
            collection_id: Some("1".to_string()),
        };
        assert_eq!(track.canonical_url().as_deref(), Some("https://music.apple.com/gb/album/1?i=2"));
        let album = AppleRef::Album { storefront: None, collection_id: "1".to_string() };
        assert_eq!(album.canonical_url().as_deref(), Some("https://music.apple.com/album/1"));
        assert_eq!(AppleRef::Playlist.canonical_url(), None);
    }

    #[test]
    fn classification() {
        assert!(is_apple_music_url("https://apple.co/3abc"));
        assert!(is_apple_music_url("https://itunes.apple.com/us/album/x/1"));
        assert!(!is_apple_music_url("https://www.apple.com/"));
    }

    #[tokio::test]
    async fn playlist_is_unsupported() {
        let server = MockServer::start();
        let any = server.mock(|when, then| {
            when.method(GET);
            then.status(200);
        });
        let err = resolver(&server)
            .resolve("https://music.apple.com/us/playlist/x/pl.abc")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedLink));
        assert_eq!(err.to_string(), "unsupported link");
        any.assert_hits(0);
    }

    #[tokio::test]
    async fn album_lookup_builds_tracks() {
        let server = MockServer::start();
        let lookup = server.mock(|when, then| {
            when.method(GET)
                .path("/lookup")
                .query_param("id", "617154241")
                .query_param("country", "us")
                .query_param("entity", "song");
            then.status(200).json_body(json!({
                "resultCount": 3,
                "results": [
                    {
                        "wrapperType": "collection",
                        "collectionName": "Random Access Memories",
                        "artistName": "Daft Punk",
                        "artistViewUrl": "https://music.apple.com/us/artist/daft-punk/5468295",
                        "artworkUrl100": "https://is1.mzstatic.com/image/thumb/a/100x100bb.jpg"
                    },
                    {
                        "wrapperType": "track",
                        "trackName": "Give Life Back to Music",
                        "artistName": "Daft Punk",
                        "trackTimeMillis": 274000,
                        "trackViewUrl": "https://music.apple.com/us/album/x/617154241?i=1"
                    },
                    {
                        "wrapperType": "track",
                        "trackName": "Get Lucky",
                        "artistName": "Daft Punk",
                        "trackViewUrl": "https://music.apple.com/us/album/x/617154241?i=2"
                    }
                ]
            }));
        });
        let oembed = server.mock(|when, then| {
            when.method(GET).path("/oembed");
            then.status(200).json_body(json!({}));
        });

        let resolver = resolver(&server);
        let url = "https://music.apple.com/us/album/random-access-memories/617154241";
        let item = resolver.resolve(url).await.unwrap().unwrap();

        assert_eq!(item.url, "https://music.apple.com/us/album/617154241");
        assert_eq!(item.title.as_deref(), Some("Random Access Memories"));
        assert_eq!(
            item.thumbnail.as_deref(),
            Some("https://is1.mzstatic.com/image/thumb/a/600x600bb.jpg")
        );
        assert_eq!(item.tracks.len(), 2);
        assert_eq!(item.tracks[0].duration_ms, Some(274000));
        assert_eq!(build_queries(&item)[1], "ytsearch1:Daft Punk - Get Lucky audio");

        resolver.resolve(url).await.unwrap();
        lookup.assert_hits(1);
        oembed.assert_hits(0);
    }

    #[tokio::test]
    async fn track_falls_back_to_oembed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/lookup").query_param("id", "55");
            then.status(200).json_body(json!({"resultCount": 0, "results": []}));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/oembed")
                .query_param("url", "https://music.apple.com/song/55");
            then.status(200).json_body(json!({
                "title": "Embedded Song",
                "author_name": "Embedded Artist",
                "thumbnail_url": "https://img/e.jpg"
            }));
        });

        let item = resolver(&server)
            .resolve("https://music.apple.com/song/embedded-song/55")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.item_type, ItemType::Track);
        assert_eq!(item.tracks.len(), 1);
        assert_eq!(item.tracks[0].artist.as_deref(), Some("Embedded Artist"));
        assert_eq!(item.tracks[0].service_url.as_deref(), Some("https://music.apple.com/song/55"));
    }

    #[tokio::test]
    async fn short_link_to_playlist_is_unsupported() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/short");
            then.status(302).header("Location", "https://music.apple.com/us/playlist/mix/pl.u-123");
        });
        let result = resolver(&server)
            .with_short_link_host("127.0.0.1")
            .resolve(&server.url("/short"))
            .await;
        assert!(matches!(result, Err(AppError::UnsupportedLink)));
    }
}
