use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{DownloadEngine, DownloadRequest, EngineHooks, EngineOutcome, EngineProgress, EngineStatus};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::processing::{read_diagnostic_stream, ProcessSupervisor};

const PROGRESS_MARKER: &str = "[bridge-progress] ";
const FILE_MARKER: &str = "[bridge-file] ";
const PROGRESS_TEMPLATE: &str = "download:[bridge-progress] %(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.eta)s|%(progress.speed)s|%(progress.filename)s";
const FILE_TEMPLATE: &str = "after_move:[bridge-file] %(filepath)s";

/// Audio extraction lifted out of the yt-dlp call so the bridge runs the
/// transcoder itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioExtraction {
    pub format: String,
    pub quality: Option<String>,
    pub keep_original: bool,
}

impl AudioExtraction {
    /// Encoder and file extension for the requested format; `None` keeps
    /// whatever audio stream was downloaded.
    pub fn target(&self) -> Option<(&'static str, &'static str)> {
        match self.format.to_lowercase().as_str() {
            "mp3" => Some(("libmp3lame", "mp3")),
            "aac" | "m4a" => Some(("aac", "m4a")),
            "alac" => Some(("alac", "m4a")),
            "opus" => Some(("libopus", "opus")),
            "vorbis" | "ogg" => Some(("libvorbis", "ogg")),
            "flac" => Some(("flac", "flac")),
            "wav" => Some(("pcm_s16le", "wav")),
            _ => None,
        }
    }

    fn quality_args(&self, codec: &str) -> Vec<String> {
        let Some(quality) = self.quality.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
            return Vec::new();
        };
        if let Some(kbps) = quality.strip_suffix(|c: char| c == 'K' || c == 'k') {
            return vec!["-b:a".to_string(), format!("{}k", kbps)];
        }
        match (quality.parse::<u8>(), codec) {
            (Ok(level), "libmp3lame" | "libvorbis") if level <= 10 => {
                // ffmpeg's vorbis scale runs the other way round.
                let value = if codec == "libvorbis" { 10 - level } else { level };
                vec!["-q:a".to_string(), value.to_string()]
            }
            _ => Vec::new(),
        }
    }
}

/// Removes the audio-extraction flags from `options` and returns what they
/// asked for.
pub fn take_audio_extraction(options: &mut Vec<String>) -> Option<AudioExtraction> {
    let mut requested = false;
    let mut extraction = AudioExtraction { format: "best".to_string(), ..Default::default() };
    let mut kept = Vec::with_capacity(options.len());
    let mut iter = options.drain(..);

    while let Some(option) = iter.next() {
        match option.as_str() {
            "-x" | "--extract-audio" => requested = true,
            "-k" | "--keep-video" => {
                extraction.keep_original = true;
                kept.push(option);
            }
            "--audio-format" => {
                if let Some(value) = iter.next() {
                    extraction.format = value;
                }
            }
            "--audio-quality" => extraction.quality = iter.next(),
            other => {
                if let Some(value) = other.strip_prefix("--audio-format=") {
                    extraction.format = value.to_string();
                } else if let Some(value) = other.strip_prefix("--audio-quality=") {
                    extraction.quality = Some(value.to_string());
                } else {
                    kept.push(option);
                }
            }
        }
    }
    drop(iter);
    *options = kept;

    requested.then_some(extraction)
}

/// Parses a `[bridge-progress]` line printed through the progress template.
pub fn parse_progress_template(line: &str) -> Option<EngineProgress> {
    let rest = &line[line.find(PROGRESS_MARKER)? + PROGRESS_MARKER.len()..];
    let mut fields = rest.splitn(7, '|');

    let status = match fields.next()?.trim() {
        "downloading" => EngineStatus::Downloading,
        "finished" => EngineStatus::Finished,
        _ => return None,
    };
    let number = |value: Option<&str>| -> Option<f64> {
        value
            .map(str::trim)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    };
    let bytes = |value: Option<&str>| number(value).map(|v| v.max(0.0) as u64);

    Some(EngineProgress {
        status,
        downloaded_bytes: bytes(fields.next()),
        total_bytes: bytes(fields.next()),
        total_bytes_estimate: bytes(fields.next()),
        eta: number(fields.next()),
        speed: number(fields.next()),
        filename: fields.next().map(str::trim).filter(|f| *f != "NA").unwrap_or("").to_string(),
    })
}

/// Drives the `yt-dlp` binary. Every process goes through the supervisor
/// so cancellation reaches it.
pub struct YtDlpEngine {
    ytdlp_path: String,
    ffmpeg_location: Option<String>,
    ffmpeg_binary: PathBuf,
    supervisor: Arc<ProcessSupervisor>,
}

impl YtDlpEngine {
    pub fn new(config: &AppConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            ytdlp_path: config.ytdlp_path.clone(),
            ffmpeg_location: config.ffmpeg_location.clone(),
            ffmpeg_binary: config.ffmpeg_binary(),
            supervisor,
        }
    }

    fn download_args(&self, request: &DownloadRequest, extraction: Option<&AudioExtraction>, options: &[String]) -> Vec<String> {
        let mut args: Vec<String> = [
            "--newline",
            "--no-colors",
            "--progress",
            "--no-simulate",
            "--progress-template",
            PROGRESS_TEMPLATE,
            "--print",
            FILE_TEMPLATE,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(location) = &self.ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(location.clone());
        }

        let has_format = options
            .iter()
            .any(|o| o == "-f" || o == "--format" || o.starts_with("--format="));
        if extraction.is_some() && !has_format {
            args.push("-f".to_string());
            args.push("bestaudio/best".to_string());
        }

        args.extend(options.iter().cloned());
        args.push("--".to_string());
        args.extend(request.targets.iter().cloned());
        args
    }

    /// Runs yt-dlp with both output streams captured in full.
    async fn run_captured(&self, task_id: &str, args: &[String]) -> Result<(ExitStatus, String, String)> {
        let mut cmd = Command::new(&self.ytdlp_path);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = self.supervisor.spawn(task_id, cmd)?;
        let mut stdout = child
            .take_stdout()
            .ok_or_else(|| AppError::Process("yt-dlp stdout not captured".to_string()))?;
        let mut stderr = child
            .take_stderr()
            .ok_or_else(|| AppError::Process("yt-dlp stderr not captured".to_string()))?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (read_out, read_err, status) =
            tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err), child.wait());
        read_out?;
        read_err?;

        Ok((
            status?,
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
        ))
    }

    /// Flat `--dump-json` entries for a `ytsearch<limit>:` query.
    pub async fn search_entries(&self, task_id: &str, query: &str, limit: usize) -> Result<Vec<Value>> {
        let args = vec![
            "--dump-json".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
            "--".to_string(),
            format!("ytsearch{}:{}", limit, query),
        ];
        log::info!("🔍 [SEARCH] Running yt-dlp search for '{}' (limit: {})", query, limit);

        let (status, stdout, stderr) = self.run_captured(task_id, &args).await?;
        if !status.success() {
            return Err(AppError::Search(last_error_line(&stderr).unwrap_or_else(|| "yt-dlp search failed".to_string())));
        }

        let entries: Vec<Value> = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("⚠️ [SEARCH] skipping unparseable line: {}", e);
                    None
                }
            })
            .collect();
        log::info!("📊 [SEARCH] yt-dlp returned {} entries", entries.len());
        Ok(entries)
    }

    async fn extract_audio(
        &self,
        task_id: &str,
        input: &Path,
        extraction: &AudioExtraction,
        hooks: &dyn EngineHooks,
    ) -> Result<Option<EngineOutcome>> {
        let Some((codec, extension)) = extraction.target() else {
            hooks.debug(&format!("[ExtractAudio] Keeping downloaded audio: {}", input.display()));
            return Ok(None);
        };

        let same_extension = input
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        let output = if same_extension {
            input.with_extension(format!("bridge.{}", extension))
        } else {
            input.with_extension(extension)
        };

        let mut cmd = Command::new(&self.ffmpeg_binary);
        cmd.arg("-y")
            .arg("-nostdin")
            .arg("-hide_banner")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-c:a")
            .arg(codec)
            .args(extraction.quality_args(codec))
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        hooks.debug(&format!("[ExtractAudio] Destination: {}", output.display()));
        log::info!("🎵 [TRANSCODE] task={} {} -> {}", task_id, input.display(), output.display());

        let mut child = self.supervisor.spawn(task_id, cmd)?;
        let status = child.wait().await?;
        if !status.success() {
            let diagnostic = child.last_diagnostic();
            log::error!("❌ [TRANSCODE] task={} failed: {:?}", task_id, diagnostic);
            return Ok(Some(EngineOutcome {
                exit_code: status.code().unwrap_or(-1),
                diagnostic,
            }));
        }
        drop(child);

        if same_extension {
            tokio::fs::rename(&output, input).await?;
        } else if !extraction.keep_original {
            if let Err(e) = tokio::fs::remove_file(input).await {
                log::warn!("⚠️ [TRANSCODE] could not remove {}: {}", input.display(), e);
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl DownloadEngine for YtDlpEngine {
    async fn download(&self, task_id: &str, request: &DownloadRequest, hooks: &dyn EngineHooks) -> Result<EngineOutcome> {
        let mut options = request.options.clone();
        let extraction = take_audio_extraction(&mut options);
        let args = self.download_args(request, extraction.as_ref(), &options);
        log::info!("⬇️ [YTDLP] task={} running {} with {} targets", task_id, self.ytdlp_path, request.targets.len());
        log::debug!("[YTDLP] task={} args: {:?}", task_id, args);

        let mut cmd = Command::new(&self.ytdlp_path);
        cmd.args(&args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = self.supervisor.spawn(task_id, cmd)?;
        let stdout = child
            .take_stdout()
            .ok_or_else(|| AppError::Process("yt-dlp stdout not captured".to_string()))?;
        let stderr = child
            .take_stderr()
            .ok_or_else(|| AppError::Process("yt-dlp stderr not captured".to_string()))?;

        let mut files: Vec<PathBuf> = Vec::new();
        let (read_out, read_err, status) = tokio::join!(
            read_diagnostic_stream(stdout, |line| {
                if let Some(progress) = parse_progress_template(line) {
                    hooks.on_progress(&progress);
                } else if let Some(path) = line.strip_prefix(FILE_MARKER.trim_end()) {
                    files.push(PathBuf::from(path.trim()));
                } else {
                    hooks.debug(line);
                }
            }),
            read_diagnostic_stream(stderr, |line| route_stderr_line(line, hooks)),
            child.wait(),
        );
        if let Err(e) = read_out.and(read_err) {
            log::warn!("⚠️ [YTDLP] task={} output stream error: {}", task_id, e);
        }
        let status = status?;
        drop(child);

        if !status.success() {
            log::error!("❌ [YTDLP] task={} exited with {}", task_id, status);
            return Ok(EngineOutcome { exit_code: status.code().unwrap_or(-1), diagnostic: None });
        }

        if let Some(extraction) = &extraction {
            for file in &files {
                if let Some(failed) = self.extract_audio(task_id, file, extraction, hooks).await? {
                    return Ok(failed);
                }
            }
        }

        log::info!("✅ [YTDLP] task={} finished, {} files", task_id, files.len());
        Ok(EngineOutcome { exit_code: 0, diagnostic: None })
    }

    async fn extract_info(&self, task_id: &str, url: &str) -> Result<Value> {
        log::info!("🔍 [EXTRACT] Starting info extraction for URL: {}", url);
        let args = vec![
            "--dump-single-json".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
            "--".to_string(),
            url.to_string(),
        ];

        let (status, stdout, stderr) = self.run_captured(task_id, &args).await?;
        if !status.success() {
            let message = last_error_line(&stderr).unwrap_or_else(|| format!("yt-dlp exited with {}", status));
            log::error!("❌ [EXTRACT] yt-dlp extraction failed: {}", message);
            return Err(AppError::Download(message));
        }
        Ok(serde_json::from_str(stdout.trim())?)
    }
}

fn route_stderr_line(line: &str, hooks: &dyn EngineHooks) {
    if let Some(message) = line.strip_prefix("WARNING:") {
        hooks.warning(message.trim());
    } else if let Some(message) = line.strip_prefix("ERROR:") {
        hooks.error(message.trim());
    } else if let Some(progress) = parse_progress_template(line) {
        hooks.on_progress(&progress);
    } else {
        hooks.debug(line);
    }
}

fn last_error_line(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|l| l.trim_start_matches("ERROR:").trim().to_string())
}

/// Compact summary of an info document for the `metadata` event.
pub fn summarize_info(info: &Value) -> Value {
    let entries: Vec<Value> = info["entries"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    serde_json::json!({
                        "id": entry["id"],
                        "title": entry["title"],
                        "uploader": entry.get("uploader").or_else(|| entry.get("channel")).cloned().unwrap_or(Value::Null),
                        "duration": entry["duration"],
                        "url": entry.get("url").or_else(|| entry.get("webpage_url")).cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    serde_json::json!({
        "id": info["id"],
        "title": info["title"],
        "uploader": info.get("uploader").or_else(|| info.get("channel")).cloned().unwrap_or(Value::Null),
        "thumbnail": info["thumbnail"],
        "url": info.get("webpage_url").or_else(|| info.get("original_url")).cloned().unwrap_or(Value::Null),
        "duration": info["duration"],
        "extractor": info["extractor_key"],
        "entries": entries,
    })
}
