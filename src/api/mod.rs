// Wire types shared by the dispatcher, the task handlers and the output writer.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::processing::progress::FfmpegProgress;

/// One line of input as sent by the parent application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "args_as_strings")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Download,
    Metadata,
    Search,
    MusicSearch,
    Cancel,
    Exit,
    Unknown(String),
}

impl CommandKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "download" => CommandKind::Download,
            "metadata" => CommandKind::Metadata,
            "search" => CommandKind::Search,
            "ytmusic_search" => CommandKind::MusicSearch,
            "cancel" => CommandKind::Cancel,
            "exit" => CommandKind::Exit,
            other => CommandKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::Download => "download",
            CommandKind::Metadata => "metadata",
            CommandKind::Search => "search",
            CommandKind::MusicSearch => "ytmusic_search",
            CommandKind::Cancel => "cancel",
            CommandKind::Exit => "exit",
            CommandKind::Unknown(name) => name,
        }
    }
}

fn args_as_strings<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Warning,
    Error,
}

/// Everything the bridge writes to stdout.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Ready {
        message: String,
    },
    Progress {
        id: String,
        #[serde(flatten)]
        update: ProgressUpdate,
    },
    Status {
        id: String,
        msg: String,
    },
    Log {
        id: String,
        level: LogLevel,
        message: String,
    },
    Metadata {
        id: String,
        data: Value,
    },
    SearchResults {
        id: String,
        success: bool,
        data: Vec<SearchResult>,
    },
    Finished {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Cancelled {
        id: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

/// Both progress sources end up in this one shape, tagged by `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressUpdate {
    Downloading {
        percent: f64,
        eta: Option<f64>,
        speed: Option<f64>,
        filename: String,
    },
    Processing(FfmpegProgress),
}

impl Event {
    pub fn ready() -> Self {
        Event::Ready { message: "Bridge is ready".to_string() }
    }

    pub fn finished_ok(id: &str) -> Self {
        Event::Finished { id: id.to_string(), success: true, error: None }
    }

    pub fn finished_err(id: &str, error: impl Into<String>) -> Self {
        Event::Finished { id: id.to_string(), success: false, error: Some(error.into()) }
    }

    pub fn log(id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Event::Log { id: id.to_string(), level, message: message.into() }
    }

    pub fn error(id: Option<&str>, message: impl Into<String>) -> Self {
        Event::Error { id: id.map(str::to_string), message: message.into() }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::Ready { .. } => None,
            Event::Progress { id, .. }
            | Event::Status { id, .. }
            | Event::Log { id, .. }
            | Event::Metadata { id, .. }
            | Event::SearchResults { id, .. }
            | Event::Finished { id, .. }
            | Event::Cancelled { id } => Some(id),
            Event::Error { id, .. } => id.as_deref(),
        }
    }
}

/// A single hit returned by either search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub duration_string: Option<String>,
    pub thumbnail: Option<String>,
    pub url: String,
}

/// Cloneable handle every producer uses to push events to the writer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            log::debug!("[EVENTS] writer closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_stringifies_non_string_args() {
        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"command":"search","id":"t1","args":["lofi", 5]}"#).unwrap();
        assert_eq!(envelope.args, vec!["lofi".to_string(), "5".to_string()]);
        assert_eq!(CommandKind::parse(envelope.command.as_deref().unwrap()), CommandKind::Search);
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let envelope: CommandEnvelope = serde_json::from_str(r#"{"command":"exit"}"#).unwrap();
        assert!(envelope.id.is_none());
        assert!(envelope.args.is_empty());

        let envelope: CommandEnvelope = serde_json::from_str(r#"{"command":"exit","args":null}"#).unwrap();
        assert!(envelope.args.is_empty());
    }

    #[test]
    fn downloading_progress_serializes_flat() {
        let event = Event::Progress {
            id: "a".to_string(),
            update: ProgressUpdate::Downloading {
                percent: 50.0,
                eta: Some(3.0),
                speed: None,
                filename: "x.webm".to_string(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "progress",
                "id": "a",
                "status": "downloading",
                "percent": 50.0,
                "eta": 3.0,
                "speed": null,
                "filename": "x.webm"
            })
        );
    }

    #[test]
    fn processing_progress_omits_missing_fields() {
        let event = Event::Progress {
            id: "a".to_string(),
            update: ProgressUpdate::Processing(FfmpegProgress {
                frame: "0".to_string(),
                time: "00:00:00.00".to_string(),
                q: Some("0.0".to_string()),
                ..Default::default()
            }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "progress",
                "id": "a",
                "status": "processing",
                "frame": "0",
                "time": "00:00:00.00",
                "q": "0.0"
            })
        );
    }

    #[test]
    fn finished_error_only_present_on_failure() {
        let ok = serde_json::to_value(Event::finished_ok("t")).unwrap();
        assert_eq!(ok, json!({"type": "finished", "id": "t", "success": true}));

        let err = serde_json::to_value(Event::finished_err("t", "Cancelled")).unwrap();
        assert_eq!(err["error"], "Cancelled");
        assert_eq!(err["success"], false);
    }

    #[test]
    fn ready_event_has_no_id() {
        let value = serde_json::to_value(Event::ready()).unwrap();
        assert_eq!(value["type"], "ready");
        assert!(value.get("id").is_none());
        assert!(Event::ready().task_id().is_none());
    }

    #[test]
    fn log_levels_are_warning_or_error() {
        let warning = serde_json::to_value(Event::log("t1", LogLevel::Warning, "slow")).unwrap();
        assert_eq!(warning, json!({"type": "log", "id": "t1", "level": "warning", "message": "slow"}));
        let error = serde_json::to_value(Event::log("t1", LogLevel::Error, "boom")).unwrap();
        assert_eq!(error["level"], "error");
    }
}
