pub mod apple_music;
pub mod cache;
pub mod deezer;
pub mod http_pool;
pub mod query;
pub mod spotify;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::AppConfig;
use crate::errors::Result;
use http_pool::HttpPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Track,
    Album,
    Playlist,
    Artist,
    Show,
    Episode,
}

impl ItemType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "track" => Some(ItemType::Track),
            "album" => Some(ItemType::Album),
            "playlist" => Some(ItemType::Playlist),
            "artist" => Some(ItemType::Artist),
            "show" => Some(ItemType::Show),
            "episode" => Some(ItemType::Episode),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Track => "track",
            ItemType::Album => "album",
            ItemType::Playlist => "playlist",
            ItemType::Artist => "artist",
            ItemType::Show => "show",
            ItemType::Episode => "episode",
        }
    }

    /// Single-item types describe one playable thing; everything else is a
    /// collection of tracks.
    pub fn is_single(&self) -> bool {
        matches!(self, ItemType::Track | ItemType::Episode)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Track {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_ms: Option<u64>,
    /// Deep link to the track on its service, else the parent item's URL.
    pub service_url: Option<String>,
}

/// Normalized metadata for one external-service link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedItem {
    #[serde(skip)]
    pub service: &'static str,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub url: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub thumbnail: Option<String>,
    pub tracks: Vec<Track>,
}

impl ResolvedItem {
    pub fn new(service: &'static str, item_type: ItemType, url: impl Into<String>) -> Self {
        Self {
            service,
            item_type,
            url: url.into(),
            title: None,
            author: None,
            author_url: None,
            thumbnail: None,
            tracks: Vec::new(),
        }
    }

    /// Copies fallback values into fields that are still empty.
    pub fn backfill(
        &mut self,
        title: Option<String>,
        author: Option<String>,
        author_url: Option<String>,
        thumbnail: Option<String>,
    ) {
        fill(&mut self.title, title);
        fill(&mut self.author, author);
        fill(&mut self.author_url, author_url);
        fill(&mut self.thumbnail, thumbnail);
    }

    /// Applies the track cap and, when no track list was found, builds one
    /// synthetic track from the item's own title and author.
    pub fn finalize(&mut self, max_tracks: usize) {
        self.tracks.truncate(max_tracks);
        if self.tracks.is_empty() {
            if let Some(title) = self.title.clone().filter(|t| !t.trim().is_empty()) {
                self.tracks.push(Track {
                    title: Some(title),
                    artist: self.author.clone(),
                    duration_ms: None,
                    service_url: Some(self.url.clone()),
                });
            }
        }
    }

    /// JSON form with the track link keyed by service, e.g. `spotify_url`.
    pub fn to_service_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        let link_key = format!("{}_url", self.service);
        if let Some(tracks) = value.get_mut("tracks").and_then(Value::as_array_mut) {
            for track in tracks.iter_mut().filter_map(Value::as_object_mut) {
                if let Some(link) = track.remove("service_url") {
                    track.insert(link_key.clone(), link);
                }
            }
        }
        value
    }
}

pub(crate) fn fill(slot: &mut Option<String>, candidate: Option<String>) {
    let empty = slot.as_deref().map(|s| s.trim().is_empty()).unwrap_or(true);
    if empty {
        if let Some(candidate) = candidate.filter(|c| !c.trim().is_empty()) {
            *slot = Some(candidate);
        }
    }
}

/// Non-empty string at `value[key]`.
pub(crate) fn json_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

#[async_trait::async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Service key used in metadata payloads (`spotify`, `deezer`, `apple_music`).
    fn name(&self) -> &'static str;

    /// Cheap substring classification; no network access.
    fn matches(&self, url: &str) -> bool;

    /// `Ok(None)` means the link could not be canonicalized or nothing was
    /// fetched. The only error returned is `AppError::UnsupportedLink`.
    async fn resolve(&self, url: &str) -> Result<Option<ResolvedItem>>;
}

/// Download targets after service links were expanded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedTargets {
    pub targets: Vec<String>,
    /// Service links that were replaced by search directives.
    pub expanded_links: usize,
    pub queries: usize,
}

#[derive(Debug, Clone)]
pub struct MetadataResolution {
    pub service: &'static str,
    pub item: ResolvedItem,
    pub yt_query: Option<String>,
}

impl MetadataResolution {
    /// Payload of the `metadata` event. Collections describe themselves;
    /// a single track prefers its own fields over the item's.
    pub fn to_event_data(&self) -> Value {
        let item = &self.item;
        let mut title = item.title.clone();
        let mut uploader = item.author.clone();
        let mut url = Some(item.url.clone());
        let mut duration = None;

        if item.item_type.is_single() {
            if let Some(track) = item.tracks.first() {
                let mut track_title = track.title.clone();
                fill(&mut track_title, title);
                title = track_title;

                let mut track_artist = track.artist.clone();
                fill(&mut track_artist, uploader);
                uploader = track_artist;

                let mut track_url = track.service_url.clone();
                fill(&mut track_url, url);
                url = track_url;

                duration = track.duration_ms.map(|ms| ms as f64 / 1000.0);
            }
        }

        let mut data = Map::new();
        data.insert("title".into(), json!(title));
        data.insert("uploader".into(), json!(uploader));
        data.insert("uploader_url".into(), json!(item.author_url));
        data.insert("thumbnail".into(), json!(item.thumbnail));
        data.insert("url".into(), json!(url));
        data.insert("webpage_url".into(), json!(item.url));
        data.insert("duration".into(), json!(duration));
        data.insert("service".into(), json!(self.service));
        data.insert("type".into(), json!(item.item_type.as_str()));
        data.insert("track_count".into(), json!(item.tracks.len()));
        data.insert("tracks".into(), item.to_service_json()["tracks"].clone());
        data.insert("yt_query".into(), json!(self.yt_query));
        data.insert(self.service.to_string(), item.to_service_json());
        Value::Object(data)
    }
}

/// Ordered set of resolvers; the first whose classifier matches owns a URL.
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn ServiceResolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Arc<dyn ServiceResolver>>) -> Self {
        Self { resolvers }
    }

    /// Spotify, then Deezer, then Apple Music, sharing one HTTP pool.
    pub fn from_config(config: &AppConfig, http: HttpPool) -> Self {
        let resolver = &config.resolver;
        Self::new(vec![
            Arc::new(spotify::SpotifyResolver::new(http.clone(), resolver)),
            Arc::new(deezer::DeezerResolver::new(http.clone(), resolver)),
            Arc::new(apple_music::AppleMusicResolver::new(http, resolver)),
        ])
    }

    pub fn find(&self, url: &str) -> Option<&Arc<dyn ServiceResolver>> {
        self.resolvers.iter().find(|r| r.matches(url))
    }

    pub async fn resolve_for_download(&self, urls: &[String]) -> Result<ResolvedTargets> {
        let mut resolved = ResolvedTargets::default();

        for url in urls {
            let Some(resolver) = self.find(url) else {
                resolved.targets.push(url.clone());
                continue;
            };

            let queries = match resolver.resolve(url).await? {
                Some(item) => query::build_queries(&item),
                None => Vec::new(),
            };

            if queries.is_empty() {
                log::info!("🔍 [RESOLVE] {} gave no queries for {}, passing it through", resolver.name(), url);
                resolved.targets.push(url.clone());
            } else {
                log::info!("🔍 [RESOLVE] {} expanded {} into {} queries", resolver.name(), url, queries.len());
                resolved.expanded_links += 1;
                resolved.queries += queries.len();
                resolved.targets.extend(queries);
            }
        }

        Ok(resolved)
    }

    pub async fn resolve_for_metadata(&self, url: &str) -> Result<Option<MetadataResolution>> {
        let Some(resolver) = self.find(url) else {
            return Ok(None);
        };
        let Some(item) = resolver.resolve(url).await? else {
            return Ok(None);
        };
        let yt_query = item.tracks.iter().find_map(query::build_query);
        Ok(Some(MetadataResolution {
            service: resolver.name(),
            item,
            yt_query,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::AppError;

    /// Resolver double that claims URLs containing `needle`.
    pub(crate) struct StubResolver {
        pub name: &'static str,
        pub needle: &'static str,
        pub item: Option<ResolvedItem>,
        pub unsupported: bool,
    }

    #[async_trait::async_trait]
    impl ServiceResolver for StubResolver {
        fn name(&self) -> &'static str {
            self.name
        }

        fn matches(&self, url: &str) -> bool {
            url.contains(self.needle)
        }

        async fn resolve(&self, _url: &str) -> Result<Option<ResolvedItem>> {
            if self.unsupported {
                return Err(AppError::UnsupportedLink);
            }
            Ok(self.item.clone())
        }
    }

    pub(crate) fn album_with_tracks(service: &'static str, titles: &[&str]) -> ResolvedItem {
        let mut item = ResolvedItem::new(service, ItemType::Album, "https://example.test/album/1");
        item.title = Some("Album".to_string());
        item.author = Some("Band".to_string());
        item.tracks = titles
            .iter()
            .map(|t| Track {
                title: Some(t.to_string()),
                artist: Some("Band".to_string()),
                duration_ms: Some(1000),
                service_url: None,
            })
            .collect();
        item
    }

    #[tokio::test]
    async fn download_targets_expand_in_order() {
        let chain = ResolverChain::new(vec![Arc::new(StubResolver {
            name: "spotify",
            needle: "spotify",
            item: Some(album_with_tracks("spotify", &["One", "Two"])),
            unsupported: false,
        })]);

        let urls = vec![
            "https://youtu.be/abc".to_string(),
            "https://open.spotify.com/album/x".to_string(),
            "https://example.com/v".to_string(),
        ];
        let resolved = chain.resolve_for_download(&urls).await.unwrap();
        assert_eq!(
            resolved.targets,
            vec![
                "https://youtu.be/abc".to_string(),
                "ytsearch1:Band - One audio".to_string(),
                "ytsearch1:Band - Two audio".to_string(),
                "https://example.com/v".to_string(),
            ]
        );
        assert_eq!(resolved.expanded_links, 1);
        assert_eq!(resolved.queries, 2);
    }

    #[tokio::test]
    async fn unresolved_service_link_passes_through() {
        let chain = ResolverChain::new(vec![Arc::new(StubResolver {
            name: "deezer",
            needle: "deezer",
            item: None,
            unsupported: false,
        })]);
        let urls = vec!["https://www.deezer.com/artist/1".to_string()];
        let resolved = chain.resolve_for_download(&urls).await.unwrap();
        assert_eq!(resolved.targets, urls);
        assert_eq!(resolved.expanded_links, 0);
    }

    #[tokio::test]
    async fn unsupported_link_fails_the_whole_batch() {
        let chain = ResolverChain::new(vec![Arc::new(StubResolver {
            name: "apple_music",
            needle: "music.apple.com",
            item: None,
            unsupported: true,
        })]);
        let urls = vec![
            "https://youtu.be/abc".to_string(),
            "https://music.apple.com/us/playlist/x/pl.1".to_string(),
        ];
        let err = chain.resolve_for_download(&urls).await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported link");
    }

    #[tokio::test]
    async fn first_matching_resolver_wins() {
        let chain = ResolverChain::new(vec![
            Arc::new(StubResolver { name: "first", needle: "music", item: None, unsupported: false }),
            Arc::new(StubResolver { name: "second", needle: "music", item: None, unsupported: true }),
        ]);
        assert_eq!(chain.find("https://music.example").map(|r| r.name()), Some("first"));
        assert!(chain.resolve_for_metadata("https://music.example").await.unwrap().is_none());
        assert!(chain.find("https://other.example").is_none());
    }

    #[test]
    fn finalize_synthesizes_track_from_title() {
        let mut item = ResolvedItem::new("spotify", ItemType::Show, "https://open.spotify.com/show/s");
        item.title = Some("Podcast".to_string());
        item.author = Some("Host".to_string());
        item.finalize(200);
        assert_eq!(item.tracks.len(), 1);
        assert_eq!(item.tracks[0].artist.as_deref(), Some("Host"));
        assert_eq!(item.tracks[0].service_url.as_deref(), Some("https://open.spotify.com/show/s"));

        let mut untitled = ResolvedItem::new("spotify", ItemType::Show, "https://open.spotify.com/show/s");
        untitled.finalize(200);
        assert!(untitled.tracks.is_empty());
    }

    #[test]
    fn finalize_caps_tracks() {
        let titles: Vec<String> = (0..250).map(|i| format!("t{}", i)).collect();
        let refs: Vec<&str> = titles.iter().map(String::as_str).collect();
        let mut item = album_with_tracks("deezer", &refs);
        item.finalize(200);
        assert_eq!(item.tracks.len(), 200);
    }

    #[test]
    fn backfill_only_fills_empty_fields() {
        let mut item = ResolvedItem::new("spotify", ItemType::Album, "u");
        item.title = Some("Kept".to_string());
        item.author = Some("  ".to_string());
        item.backfill(
            Some("Ignored".to_string()),
            Some("Filled".to_string()),
            None,
            Some("thumb".to_string()),
        );
        assert_eq!(item.title.as_deref(), Some("Kept"));
        assert_eq!(item.author.as_deref(), Some("Filled"));
        assert!(item.author_url.is_none());
        assert_eq!(item.thumbnail.as_deref(), Some("thumb"));
    }

    #[test]
    fn single_track_overview_prefers_track_fields() {
        let mut item = ResolvedItem::new("deezer", ItemType::Track, "https://www.deezer.com/track/3");
        item.title = Some("Item Title".to_string());
        item.author = Some("Item Artist".to_string());
        item.thumbnail = Some("cover".to_string());
        item.tracks.push(Track {
            title: Some("Track Title".to_string()),
            artist: None,
            duration_ms: Some(215_000),
            service_url: Some("https://www.deezer.com/track/3?x".to_string()),
        });

        let resolution = MetadataResolution {
            service: "deezer",
            yt_query: query::build_query(&item.tracks[0]),
            item,
        };
        let data = resolution.to_event_data();
        assert_eq!(data["title"], "Track Title");
        assert_eq!(data["uploader"], "Item Artist");
        assert_eq!(data["url"], "https://www.deezer.com/track/3?x");
        assert_eq!(data["thumbnail"], "cover");
        assert_eq!(data["duration"], 215.0);
        assert_eq!(data["type"], "track");
        assert_eq!(data["yt_query"], "ytsearch1:Track Title audio");
        assert_eq!(data["deezer"]["tracks"][0]["deezer_url"], "https://www.deezer.com/track/3?x");
        assert!(data["deezer"]["tracks"][0].get("service_url").is_none());
    }

    #[test]
    fn collection_overview_uses_item_fields() {
        let item = album_with_tracks("spotify", &["One"]);
        let resolution = MetadataResolution { service: "spotify", item, yt_query: None };
        let data = resolution.to_event_data();
        assert_eq!(data["title"], "Album");
        assert_eq!(data["url"], "https://example.test/album/1");
        assert_eq!(data["track_count"], 1);
        assert!(data["duration"].is_null());
        assert_eq!(data["spotify"]["type"], "album");
    }
}
