use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// A recognised link the pipeline refuses to expand into tracks.
    /// The message is shown to the caller verbatim.
    #[error("unsupported link")]
    UnsupportedLink,

    #[error("Task already running: {0}")]
    DuplicateTask(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Search error: {0}")]
    Search(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
