use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::api::CommandKind;
use crate::errors::{AppError, Result};
use crate::processing::ProcessSupervisor;

struct TaskEntry {
    generation: u64,
    kind: CommandKind,
    started_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Active tasks keyed by their caller-assigned id.
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
    next_generation: AtomicU64,
    supervisor: Arc<ProcessSupervisor>,
}

impl TaskRegistry {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            supervisor,
        }
    }

    /// Runs `future` as task `id`. The entry removes itself when the future
    /// completes on its own.
    pub async fn spawn<F>(&self, id: &str, kind: CommandKind, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Held across tokio::spawn so the task cannot finish before its entry exists.
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(id) {
            log::warn!("⚠️ [REGISTRY] Rejecting duplicate task id {}", id);
            return Err(AppError::DuplicateTask(id.to_string()));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.tasks);
        let task_id = id.to_string();

        let handle = tokio::spawn(async move {
            future.await;

            let mut tasks = registry.lock().await;
            if tasks.get(&task_id).map(|entry| entry.generation) == Some(generation) {
                if let Some(entry) = tasks.remove(&task_id) {
                    let elapsed = Utc::now() - entry.started_at;
                    log::info!(
                        "✅ [REGISTRY] {} task {} completed in {}ms",
                        entry.kind.as_str(),
                        task_id,
                        elapsed.num_milliseconds()
                    );
                }
            }
        });

        log::info!("🚀 [REGISTRY] Started {} task {}", kind.as_str(), id);
        tasks.insert(
            id.to_string(),
            TaskEntry {
                generation,
                kind,
                started_at: Utc::now(),
                handle,
            },
        );
        Ok(())
    }

    /// Stops task `id`: kills its child processes and aborts its future.
    /// The returned handle resolves once the future has been dropped.
    pub async fn cancel(&self, id: &str) -> Option<JoinHandle<()>> {
        let entry = self.tasks.lock().await.remove(id)?;
        Some(self.stop(id, entry))
    }

    /// Cancels every active task.
    pub async fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let drained: Vec<(String, TaskEntry)> = self.tasks.lock().await.drain().collect();
        if !drained.is_empty() {
            log::info!("🛑 [REGISTRY] Shutting down {} active tasks", drained.len());
        }
        drained
            .into_iter()
            .map(|(id, entry)| self.stop(&id, entry))
            .collect()
    }

    fn stop(&self, id: &str, entry: TaskEntry) -> JoinHandle<()> {
        let killed = self.supervisor.kill_task(id);
        entry.handle.abort();
        log::info!(
            "🛑 [REGISTRY] Cancelled {} task {} ({} child processes signalled)",
            entry.kind.as_str(),
            id,
            killed
        );
        entry.handle
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.tasks.lock().await.contains_key(id)
    }

    pub async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}
