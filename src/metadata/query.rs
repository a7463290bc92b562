use super::{ResolvedItem, Track};

/// Search directive for a single track, `None` when it has neither a title
/// nor an artist.
pub fn build_query(track: &Track) -> Option<String> {
    let title = track.title.as_deref().map(str::trim).unwrap_or("");
    let artist = track.artist.as_deref().map(str::trim).unwrap_or("");

    let query = match (title.is_empty(), artist.is_empty()) {
        (true, true) => return None,
        (false, false) => format!("{} - {}", artist, title),
        (false, true) => title.to_string(),
        (true, false) => artist.to_string(),
    };

    Some(format!("ytsearch1:{} audio", query))
}

/// One search directive per usable track, in track order.
pub fn build_queries(item: &ResolvedItem) -> Vec<String> {
    item.tracks.iter().filter_map(build_query).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ItemType;

    fn track(title: Option<&str>, artist: Option<&str>) -> Track {
        Track {
            title: title.map(str::to_string),
            artist: artist.map(str::to_string),
            duration_ms: None,
            service_url: None,
        }
    }

    #[test]
    fn artist_and_title_are_joined() {
        assert_eq!(
            build_query(&track(Some("  Song "), Some(" Artist"))).as_deref(),
            Some("ytsearch1:Artist - Song audio")
        );
    }

    #[test]
    fn single_field_is_used_alone() {
        assert_eq!(build_query(&track(Some("Song"), None)).as_deref(), Some("ytsearch1:Song audio"));
        assert_eq!(build_query(&track(Some("  "), Some("Artist"))).as_deref(), Some("ytsearch1:Artist audio"));
    }

    #[test]
    fn blank_tracks_are_skipped() {
        let mut item = ResolvedItem::new("spotify", ItemType::Album, "https://open.spotify.com/album/x");
        item.tracks = vec![
            track(Some("One"), Some("A")),
            track(None, Some("   ")),
            track(Some(""), None),
            track(Some("Two"), None),
        ];
        assert_eq!(
            build_queries(&item),
            vec!["ytsearch1:A - One audio".to_string(), "ytsearch1:Two audio".to_string()]
        );
    }

    #[test]
    fn empty_item_yields_no_queries() {
        let item = ResolvedItem::new("deezer", ItemType::Track, "https://www.deezer.com/track/1");
        assert!(build_queries(&item).is_empty());
    }
}
