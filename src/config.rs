use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::errors::Result;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122 Safari/537.36";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub ytdlp_path: String,
    /// Directory or binary passed to yt-dlp as `--ffmpeg-location` and used
    /// for the bridge's own transcode step.
    pub ffmpeg_location: Option<String>,
    /// Executable basenames whose diagnostic stream is scraped for progress.
    pub transcoder_names: Vec<String>,
    pub extra_path_dirs: Vec<PathBuf>,
    pub network: NetworkConfig,
    pub resolver: ResolverConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub user_agent: String,
    pub redirect_timeout_secs: u64,
    pub lookup_timeout_secs: u64,
    pub proxy: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ResolverConfig {
    pub cache_capacity: usize,
    pub max_tracks: usize,
    pub max_redirect_hops: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_location: None,
            transcoder_names: ["ffmpeg", "ffmpeg.exe", "avconv", "avconv.exe"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_path_dirs: Vec::new(),
            network: NetworkConfig::default(),
            resolver: ResolverConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            redirect_timeout_secs: 6,
            lookup_timeout_secs: 8,
            proxy: None,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 24,
            max_tracks: 200,
            max_redirect_hops: 3,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
        }
    }
}

impl NetworkConfig {
    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_secs(self.redirect_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

impl AppConfig {
    /// Layers an optional config file and `MEDIA_BRIDGE__*` environment
    /// variables over the defaults. An explicit path must exist; the default
    /// location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(default_path) = Self::default_config_path() {
                    builder = builder.add_source(config::File::from(default_path.as_path()).required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MEDIA_BRIDGE")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("media-bridge").join("config.toml"))
    }

    /// Directories appended to `PATH` at startup. yt-dlp looks for a JS
    /// runtime there, and deno installs into `~/.deno/bin`.
    pub fn path_additions(&self) -> Vec<PathBuf> {
        let mut dirs_to_add = self.extra_path_dirs.clone();
        if let Some(home) = dirs::home_dir() {
            let deno = home.join(".deno").join("bin");
            if deno.is_dir() && !dirs_to_add.contains(&deno) {
                dirs_to_add.push(deno);
            }
        }
        dirs_to_add
    }

    /// Path of the transcoder binary the engine launches itself.
    pub fn ffmpeg_binary(&self) -> PathBuf {
        match &self.ffmpeg_location {
            Some(location) => {
                let path = PathBuf::from(location);
                if path.is_dir() {
                    path.join(if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" })
                } else {
                    path
                }
            }
            None => PathBuf::from("ffmpeg"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_limits() {
        let config = AppConfig::default();
        assert_eq!(config.resolver.cache_capacity, 24);
        assert_eq!(config.resolver.max_tracks, 200);
        assert_eq!(config.network.redirect_timeout(), Duration::from_secs(6));
        assert_eq!(config.network.lookup_timeout(), Duration::from_secs(8));
        assert!(config.transcoder_names.iter().any(|n| n == "ffmpeg"));
        assert!(config.transcoder_names.iter().any(|n| n == "avconv.exe"));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "ytdlp_path = \"/opt/yt-dlp\"").unwrap();
        writeln!(file, "[resolver]").unwrap();
        writeln!(file, "max_tracks = 50").unwrap();
        drop(file);

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.ytdlp_path, "/opt/yt-dlp");
        assert_eq!(config.resolver.max_tracks, 50);
        assert_eq!(config.resolver.cache_capacity, 24);
        assert_eq!(config.search.max_limit, 50);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(AppConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn ffmpeg_binary_defaults_to_path_lookup() {
        let config = AppConfig::default();
        assert_eq!(config.ffmpeg_binary(), PathBuf::from("ffmpeg"));
    }
}
