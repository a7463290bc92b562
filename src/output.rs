use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::api::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One JSON object per line, for the parent application.
    Json,
    /// Timestamped one-line summaries for a human at a terminal.
    Debug,
}

/// Starts the task that owns the output stream. It ends once every
/// `EventSink` has been dropped and the queue is drained.
pub fn spawn_writer<W>(rx: UnboundedReceiver<Event>, mode: OutputMode, out: W) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut out = out;
        if let Err(e) = write_events(rx, mode, &mut out).await {
            log::error!("❌ [OUTPUT] Event writer stopped: {}", e);
        }
    })
}

pub async fn write_events<W>(mut rx: UnboundedReceiver<Event>, mode: OutputMode, out: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let line = match render(&event, mode) {
            Ok(line) => line,
            Err(e) => {
                log::error!("❌ [OUTPUT] Could not serialize event: {}", e);
                continue;
            }
        };
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
    }
    Ok(())
}

pub fn render(event: &Event, mode: OutputMode) -> serde_json::Result<String> {
    let raw = serde_json::to_string(event)?;
    Ok(match mode {
        OutputMode::Json => raw,
        OutputMode::Debug => {
            let payload: Value = serde_json::from_str(&raw)?;
            let timestamp = chrono::Local::now().format("%H:%M:%S").to_string();
            debug_line(&payload, &raw, &timestamp)
        }
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn debug_line(payload: &Value, raw: &str, timestamp: &str) -> String {
    let mut parts: Vec<String> = ["type", "status", "id"]
        .iter()
        .filter_map(|key| payload.get(*key).map(|v| format!("{}={}", key, display(v))))
        .collect();

    if let Some(percent) = payload.get("percent") {
        match percent.as_f64() {
            Some(p) => parts.push(format!("percent={:.2}", p)),
            None => parts.push(format!("percent={}", display(percent))),
        }
    }
    for (key, label) in [
        ("eta", "eta"),
        ("speed", "speed"),
        ("filename", "file"),
        ("frame", "frame"),
        ("time", "time"),
        ("msg", "msg"),
        ("message", "message"),
        ("error", "error"),
    ] {
        if let Some(value) = payload.get(key) {
            parts.push(format!("{}={}", label, display(value)));
        }
    }

    let summary = if parts.is_empty() { "event".to_string() } else { parts.join(" ") };
    format!("[{}][EVENT] {} | raw={}", timestamp, summary, raw)
}
