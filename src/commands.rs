use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::api::{CommandEnvelope, CommandKind, Event, EventSink, LogLevel, ProgressUpdate};
use crate::config::AppConfig;
use crate::downloader::manager::TaskRegistry;
use crate::downloader::ytdlp::{summarize_info, YtDlpEngine};
use crate::downloader::{split_args, DownloadEngine, DownloadRequest, EngineHooks, EngineProgress, EngineStatus};
use crate::errors::{AppError, Result};
use crate::metadata::http_pool::HttpPool;
use crate::metadata::ResolverChain;
use crate::processing::progress::parse_progress_line;
use crate::processing::ProcessSupervisor;
use crate::search::ytmusic::MusicSearch;
use crate::search::{parse_limit, SearchBackend, WebSearch};

const POST_PROCESSING_STATUS: &str = "File downloaded, starting post-processing...";

// Shared state
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub events: EventSink,
    pub resolvers: Arc<ResolverChain>,
    pub engine: Arc<dyn DownloadEngine>,
    pub web_search: Arc<dyn SearchBackend>,
    pub music_search: Arc<dyn SearchBackend>,
    pub registry: Arc<TaskRegistry>,
}

impl AppState {
    /// Wires the production collaborators: one HTTP pool for every resolver
    /// and the music search, one supervisor for every child process.
    pub fn from_config(config: AppConfig, events: EventSink) -> Result<Self> {
        let http = HttpPool::new(&config.network)?;
        let supervisor = Arc::new(ProcessSupervisor::new(config.transcoder_names.clone(), events.clone()));
        let engine = Arc::new(YtDlpEngine::new(&config, Arc::clone(&supervisor)));

        Ok(Self {
            resolvers: Arc::new(ResolverChain::from_config(&config, http.clone())),
            web_search: Arc::new(WebSearch::new(Arc::clone(&engine))),
            music_search: Arc::new(MusicSearch::new(http)),
            engine,
            registry: Arc::new(TaskRegistry::new(supervisor)),
            config: Arc::new(config),
            events,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct CommandDispatcher {
    state: Arc<AppState>,
}

impl CommandDispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Announces readiness, then handles commands until `exit` or end of
    /// input. Active tasks are cancelled either way.
    pub async fn run<R>(&self, mut reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.state.events.emit(Event::ready());
        log::info!("✅ [DISPATCH] Bridge ready, waiting for commands");

        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                log::info!("[DISPATCH] Input closed");
                self.shutdown().await;
                return Ok(());
            }

            let line = String::from_utf8_lossy(&buf);
            if self.handle_line(&line).await == Flow::Exit {
                return Ok(());
            }
        }
    }

    pub async fn handle_line(&self, line: &str) -> Flow {
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }

        match serde_json::from_str::<CommandEnvelope>(line) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(e) => {
                log::warn!("⚠️ [DISPATCH] Invalid JSON on input: {}", e);
                self.state.events.emit(Event::error(None, "Invalid JSON"));
                Flow::Continue
            }
        }
    }

    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Flow {
        let kind = CommandKind::parse(envelope.command.as_deref().unwrap_or_default());
        let id = envelope.id.filter(|id| !id.trim().is_empty());
        log::debug!("[DISPATCH] command={} id={:?} args={:?}", kind.as_str(), id, envelope.args);

        match kind {
            CommandKind::Download | CommandKind::Metadata | CommandKind::Search | CommandKind::MusicSearch => {
                self.start_task(kind, id, envelope.args).await;
            }
            CommandKind::Cancel => self.cancel(id).await,
            CommandKind::Exit => {
                log::info!("🛑 [DISPATCH] Exit requested");
                self.shutdown().await;
                return Flow::Exit;
            }
            CommandKind::Unknown(name) => {
                log::warn!("⚠️ [DISPATCH] Ignoring unknown command '{}'", name);
            }
        }
        Flow::Continue
    }

    async fn start_task(&self, kind: CommandKind, id: Option<String>, args: Vec<String>) {
        let Some(id) = id else {
            self.state.events.emit(Event::error(None, "No ID provided"));
            return;
        };

        let state = Arc::clone(&self.state);
        let task_id = id.clone();
        let task_kind = kind.clone();
        let task = async move {
            let result = match task_kind {
                CommandKind::Download => run_download(&state, &task_id, &args).await,
                CommandKind::Metadata => run_metadata(&state, &task_id, &args).await,
                CommandKind::Search => run_search(&state, state.web_search.as_ref(), &task_id, &args).await,
                CommandKind::MusicSearch => run_search(&state, state.music_search.as_ref(), &task_id, &args).await,
                _ => Ok(()),
            };
            match result {
                Ok(()) => state.events.emit(Event::finished_ok(&task_id)),
                Err(e) => {
                    log::error!("❌ [TASK] {} failed: {}", task_id, e);
                    state.events.emit(Event::finished_err(&task_id, failure_message(&e)));
                }
            }
        };

        if let Err(e) = self.state.registry.spawn(&id, kind, task).await {
            log::warn!("⚠️ [DISPATCH] {}", e);
            self.state.events.emit(Event::error(Some(&id), "Task already running"));
        }
    }

    async fn cancel(&self, id: Option<String>) {
        let Some(id) = id else {
            self.state.events.emit(Event::error(None, "No ID provided"));
            return;
        };

        let Some(handle) = self.state.registry.cancel(&id).await else {
            self.state.events.emit(Event::error(Some(&id), "Task not found"));
            return;
        };

        // A task that completed just before the abort already reported its result.
        if let Err(e) = handle.await {
            if e.is_cancelled() {
                self.state.events.emit(Event::finished_err(&id, "Cancelled"));
            } else {
                log::error!("❌ [DISPATCH] Task {} panicked: {}", id, e);
                self.state.events.emit(Event::finished_err(&id, "Task failed"));
            }
        }
        self.state.events.emit(Event::Cancelled { id });
    }

    async fn shutdown(&self) {
        let handles = self.state.registry.shutdown().await;
        futures::future::join_all(handles).await;
    }
}

/// Text of the `error` field of a failed `finished` event.
fn failure_message(error: &AppError) -> String {
    match error {
        AppError::Download(message) | AppError::Search(message) | AppError::Process(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Routes engine callbacks to events for one task.
struct TaskHooks {
    id: String,
    events: EventSink,
}

impl EngineHooks for TaskHooks {
    fn on_progress(&self, progress: &EngineProgress) {
        match progress.status {
            EngineStatus::Downloading => self.events.emit(Event::Progress {
                id: self.id.clone(),
                update: ProgressUpdate::Downloading {
                    percent: progress.percent(),
                    eta: progress.eta,
                    speed: progress.speed,
                    filename: progress.filename.clone(),
                },
            }),
            EngineStatus::Finished => self.events.emit(Event::Status {
                id: self.id.clone(),
                msg: POST_PROCESSING_STATUS.to_string(),
            }),
        }
    }

    fn debug(&self, message: &str) {
        match parse_progress_line(message) {
            Some(progress) => self.events.emit(Event::Progress {
                id: self.id.clone(),
                update: ProgressUpdate::Processing(progress),
            }),
            None => log::debug!("[YTDLP] {}: {}", self.id, message),
        }
    }

    fn warning(&self, message: &str) {
        self.events.emit(Event::log(&self.id, LogLevel::Warning, message));
    }

    fn error(&self, message: &str) {
        self.events.emit(Event::log(&self.id, LogLevel::Error, message));
    }
}

async fn run_download(state: &AppState, id: &str, args: &[String]) -> Result<()> {
    let request = split_args(args);
    let resolved = state.resolvers.resolve_for_download(&request.targets).await?;
    if resolved.expanded_links > 0 {
        state.events.emit(Event::Status {
            id: id.to_string(),
            msg: format!(
                "Resolved {} link(s) into {} search queries",
                resolved.expanded_links, resolved.queries
            ),
        });
    }

    let request = DownloadRequest {
        targets: resolved.targets,
        options: request.options,
    };
    let hooks = TaskHooks {
        id: id.to_string(),
        events: state.events.clone(),
    };

    log::info!("⬇️ [TASK] {} downloading {} targets", id, request.targets.len());
    let outcome = state.engine.download(id, &request, &hooks).await?;
    if outcome.success() {
        Ok(())
    } else {
        Err(AppError::Download(
            outcome.diagnostic.unwrap_or_else(|| "Download failed.".to_string()),
        ))
    }
}

async fn run_metadata(state: &AppState, id: &str, args: &[String]) -> Result<()> {
    let request = split_args(args);
    let url = request
        .targets
        .first()
        .or_else(|| args.iter().find(|arg| !arg.starts_with('-')))
        .ok_or_else(|| AppError::Download("No URL provided".to_string()))?;

    let data = match state.resolvers.resolve_for_metadata(url).await? {
        Some(resolution) => {
            log::info!(
                "📊 [TASK] {} resolved {} {} with {} tracks",
                id,
                resolution.service,
                resolution.item.item_type.as_str(),
                resolution.item.tracks.len()
            );
            resolution.to_event_data()
        }
        None => summarize_info(&state.engine.extract_info(id, url).await?),
    };

    state.events.emit(Event::Metadata {
        id: id.to_string(),
        data,
    });
    Ok(())
}

async fn run_search(state: &AppState, backend: &dyn SearchBackend, id: &str, args: &[String]) -> Result<()> {
    let query = args.first().map(|q| q.trim()).unwrap_or_default();
    if query.is_empty() {
        return Err(AppError::Search(backend.empty_query_error().to_string()));
    }
    let limit = parse_limit(args.get(1).map(String::as_str), &state.config.search);

    let results = backend.search(id, query, limit).await?;
    log::info!("🔍 [TASK] {} {} search returned {} results", id, backend.name(), results.len());
    state.events.emit(Event::SearchResults {
        id: id.to_string(),
        success: true,
        data: results,
    });
    Ok(())
}
