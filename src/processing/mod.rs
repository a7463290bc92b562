pub mod progress;

use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{Event, EventSink, ProgressUpdate};
use crate::errors::{AppError, Result};
use progress::parse_progress_line;

const DIAGNOSTIC_TAIL_LINES: usize = 30;
const READER_GRACE: Duration = Duration::from_secs(1);

type DiagnosticTail = Arc<Mutex<VecDeque<String>>>;
type Registrations = Arc<Mutex<HashMap<String, Vec<ChildRegistration>>>>;

#[derive(Default)]
struct KillSwitch {
    fired: AtomicBool,
    notify: Notify,
}

impl KillSwitch {
    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    async fn fired(&self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }
}

struct ChildRegistration {
    handle_id: Uuid,
    pid: Option<u32>,
    program: String,
    switch: Arc<KillSwitch>,
}

/// Owns every subprocess the bridge launches.
///
/// Transcoder binaries get their stderr scraped for progress; everything
/// else is spawned untouched. All children are tracked per task so a
/// cancellation can find and kill them.
pub struct ProcessSupervisor {
    transcoder_names: Vec<String>,
    events: EventSink,
    children: Registrations,
}

impl ProcessSupervisor {
    pub fn new(transcoder_names: Vec<String>, events: EventSink) -> Self {
        Self {
            transcoder_names: transcoder_names.into_iter().map(|n| n.to_lowercase()).collect(),
            events,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_transcoder(&self, program: &OsStr) -> bool {
        let basename = Path::new(program)
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.transcoder_names.iter().any(|name| *name == basename)
    }

    pub fn spawn(&self, task_id: &str, mut command: Command) -> Result<SupervisedChild> {
        let program = command.as_std().get_program().to_string_lossy().to_string();
        let transcoder = self.is_transcoder(command.as_std().get_program());

        // Only the diagnostic stream is taken over; stdin and stdout stay
        // as the caller configured them.
        if transcoder {
            command.stderr(Stdio::piped());
        }
        // Own process group, so a kill also reaches whatever the child starts.
        #[cfg(unix)]
        command.process_group(0);
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| AppError::Process(format!("failed to start {}: {}", program, e)))?;

        let handle_id = Uuid::new_v4();
        let pid = child.id();
        let switch = Arc::new(KillSwitch::default());
        self.register(task_id, ChildRegistration {
            handle_id,
            pid,
            program: program.clone(),
            switch: Arc::clone(&switch),
        });

        let mut reader = None;
        let mut tail = None;
        if transcoder {
            if let Some(stderr) = child.stderr.take() {
                let lines: DiagnosticTail = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES)));
                reader = Some(self.spawn_diagnostic_reader(task_id, stderr, Arc::clone(&lines)));
                tail = Some(lines);
            }
        }

        log::debug!(
            "[PROCESS] task={} spawned {} pid={:?} transcoder={}",
            task_id, program, pid, transcoder
        );

        Ok(SupervisedChild {
            task_id: task_id.to_string(),
            handle_id,
            pid,
            exited: false,
            program,
            child,
            switch,
            reader,
            tail,
            registrations: Arc::clone(&self.children),
        })
    }

    /// Signals every live child of `task_id` to die. Returns how many were signalled.
    pub fn kill_task(&self, task_id: &str) -> usize {
        let children = match self.children.lock() {
            Ok(children) => children,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(registered) = children.get(task_id) else {
            return 0;
        };
        for registration in registered {
            log::info!(
                "[PROCESS] task={} killing {} pid={:?}",
                task_id, registration.program, registration.pid
            );
            registration.switch.fire();
        }
        registered.len()
    }

    pub fn running_for(&self, task_id: &str) -> usize {
        match self.children.lock() {
            Ok(children) => children.get(task_id).map(Vec::len).unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(task_id).map(Vec::len).unwrap_or(0),
        }
    }

    fn register(&self, task_id: &str, registration: ChildRegistration) {
        let mut children = match self.children.lock() {
            Ok(children) => children,
            Err(poisoned) => poisoned.into_inner(),
        };
        children.entry(task_id.to_string()).or_default().push(registration);
    }

    fn spawn_diagnostic_reader(&self, task_id: &str, stderr: ChildStderr, tail: DiagnosticTail) -> JoinHandle<()> {
        let events = self.events.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let result = read_diagnostic_stream(stderr, |line| {
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == DIAGNOSTIC_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }

                match parse_progress_line(line) {
                    Some(progress) => events.emit(Event::Progress {
                        id: task_id.clone(),
                        update: ProgressUpdate::Processing(progress),
                    }),
                    None => log::debug!("[FFMPEG] task={} {}", task_id, line),
                }
            })
            .await;

            if let Err(e) = result {
                log::warn!("[FFMPEG] task={} diagnostic stream read failed: {}", task_id, e);
            }
        })
    }
}

/// Reads `reader` to EOF and hands every `\r`- or `\n`-delimited fragment to
/// `on_line`, trimmed and lossily decoded. An undelimited trailing fragment
/// is delivered when the stream closes.
pub async fn read_diagnostic_stream<R, F>(mut reader: R, mut on_line: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut buffer: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 4096];

    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            flush_fragment(&mut buffer, &mut on_line);
            return Ok(());
        }

        for &byte in &chunk[..read] {
            if byte == b'\r' || byte == b'\n' {
                flush_fragment(&mut buffer, &mut on_line);
            } else {
                buffer.push(byte);
            }
        }
    }
}

fn flush_fragment<F: FnMut(&str)>(buffer: &mut Vec<u8>, on_line: &mut F) {
    if buffer.is_empty() {
        return;
    }
    {
        let text = String::from_utf8_lossy(buffer);
        let line = text.trim();
        if !line.is_empty() {
            on_line(line);
        }
    }
    buffer.clear();
}

/// A child spawned through the supervisor. Dropping it kills the process
/// tree and removes the child from the task's registrations.
pub struct SupervisedChild {
    task_id: String,
    handle_id: Uuid,
    pid: Option<u32>,
    exited: bool,
    program: String,
    child: Child,
    switch: Arc<KillSwitch>,
    reader: Option<JoinHandle<()>>,
    tail: Option<DiagnosticTail>,
    registrations: Registrations,
}

impl SupervisedChild {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Waits for exit, or kills and reaps the child once the task's kill
    /// switch fires. The diagnostic reader gets a short grace period to drain.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let switch = Arc::clone(&self.switch);
        let status = tokio::select! {
            status = self.child.wait() => status?,
            _ = switch.fired() => {
                log::info!("[PROCESS] task={} terminating {}", self.task_id, self.program);
                if let Some(pid) = self.pid {
                    kill_process_tree(pid);
                }
                if let Err(e) = self.child.kill().await {
                    log::warn!("[PROCESS] task={} kill {} failed: {}", self.task_id, self.program, e);
                }
                self.child.wait().await?
            }
        };

        self.exited = true;

        if let Some(reader) = self.reader.take() {
            if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
                log::debug!("[PROCESS] task={} diagnostic reader still draining", self.task_id);
            }
        }

        log::debug!("[PROCESS] task={} {} exited with {}", self.task_id, self.program, status);
        Ok(status)
    }

    pub fn diagnostic_tail(&self) -> Vec<String> {
        self.tail
            .as_ref()
            .and_then(|tail| tail.lock().ok().map(|lines| lines.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Last diagnostic line that is not a progress update, usually the
    /// transcoder's reason for failing.
    pub fn last_diagnostic(&self) -> Option<String> {
        self.diagnostic_tail()
            .into_iter()
            .rev()
            .find(|line| parse_progress_line(line).is_none())
    }
}

/// Kills `pid` together with every process it started.
fn kill_process_tree(pid: u32) {
    #[cfg(unix)]
    {
        // The child leads its own group; a negative pid addresses the group.
        let result = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if result != 0 {
            log::debug!("[PROCESS] killpg {} failed: {}", pid, std::io::Error::last_os_error());
        }
    }
    #[cfg(windows)]
    {
        let result = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            log::debug!("[PROCESS] taskkill {} failed: {}", pid, e);
        }
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        // On unix the group can outlive its leader, so it is swept even after
        // a normal exit. taskkill needs the parent alive to walk the tree.
        if let Some(pid) = self.pid {
            if cfg!(unix) || !self.exited {
                kill_process_tree(pid);
            }
        }

        let mut children = match self.registrations.lock() {
            Ok(children) => children,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(registered) = children.get_mut(&self.task_id) {
            registered.retain(|r| r.handle_id != self.handle_id);
            if registered.is_empty() {
                children.remove(&self.task_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (ProcessSupervisor, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = EventSink::channel();
        let names = ["ffmpeg", "ffmpeg.exe", "avconv", "avconv.exe"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        (ProcessSupervisor::new(names, events), rx)
    }

    #[tokio::test]
    async fn splits_on_carriage_return_and_flushes_tail() {
        let input: &[u8] =
            b"frame=1 time=00:00:00.10\rframe=2 time=00:00:00.20\r\nError opening output\n\n  Trailing fragment";
        let mut lines = Vec::new();
        read_diagnostic_stream(input, |line| lines.push(line.to_string())).await.unwrap();
        assert_eq!(
            lines,
            vec![
                "frame=1 time=00:00:00.10",
                "frame=2 time=00:00:00.20",
                "Error opening output",
                "Trailing fragment",
            ]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let input: &[u8] = b"caf\xff\n";
        let mut lines = Vec::new();
        read_diagnostic_stream(input, |line| lines.push(line.to_string())).await.unwrap();
        assert_eq!(lines, vec!["caf\u{fffd}"]);
    }

    #[test]
    fn transcoder_detection_uses_basename() {
        let (supervisor, _rx) = supervisor();
        assert!(supervisor.is_transcoder(OsStr::new("ffmpeg")));
        assert!(supervisor.is_transcoder(OsStr::new("/usr/local/bin/ffmpeg")));
        assert!(supervisor.is_transcoder(OsStr::new("FFMPEG.EXE")));
        assert!(supervisor.is_transcoder(OsStr::new("avconv")));
        assert!(!supervisor.is_transcoder(OsStr::new("ffprobe")));
        assert!(!supervisor.is_transcoder(OsStr::new("/usr/bin/yt-dlp")));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn transcoder_stderr_becomes_processing_events() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "ffmpeg",
            concat!(
                "printf 'ffmpeg version n6.0\\n' >&2\n",
                "printf 'frame=   10 fps=0.0 q=-0.0 size=       0kB time=00:00:00.40 bitrate=N/A speed=0.8x\\r' >&2\n",
                "printf 'frame=  120 fps=25 q=28.0 size=1024kB time=00:00:04.80 bitrate=800.0kbits/s speed=1.2x\\r' >&2\n",
                "printf 'Conversion failed!' >&2\n",
                "exit 1",
            ),
        );

        let (supervisor, mut rx) = supervisor();
        let mut child = supervisor.spawn("task-1", Command::new(&script)).unwrap();
        assert_eq!(supervisor.running_for("task-1"), 1);

        let status = child.wait().await.unwrap();
        assert!(!status.success());

        let mut frames = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Progress { id, update: ProgressUpdate::Processing(progress) } => {
                    assert_eq!(id, "task-1");
                    frames.push(progress.frame);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(frames, vec!["10".to_string(), "120".to_string()]);
        assert_eq!(child.last_diagnostic().as_deref(), Some("Conversion failed!"));
        assert_eq!(child.diagnostic_tail().len(), 4);

        drop(child);
        assert_eq!(supervisor.running_for("task-1"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_programs_pass_through() {
        let (supervisor, mut rx) = supervisor();
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg("printf 'frame=1 time=00:00:00.10\\n' >&2; echo out")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = supervisor.spawn("task-2", command).unwrap();

        let mut stdout = child.take_stdout().expect("stdout stays with the caller");
        assert!(child.take_stderr().is_some());
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert!(child.wait().await.unwrap().success());

        assert_eq!(out.trim(), "out");
        assert!(rx.try_recv().is_err());
        assert!(child.diagnostic_tail().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn transcoder_keeps_caller_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "ffmpeg",
            "printf 'frame=5 time=00:00:00.20 speed=1x\\r' >&2\necho encoded",
        );

        let (supervisor, mut rx) = supervisor();
        let mut command = Command::new(&script);
        command.stdout(Stdio::piped());
        let mut child = supervisor.spawn("task-6", command).unwrap();

        let mut stdout = child.take_stdout().expect("caller-piped stdout is left alone");
        assert!(child.take_stderr().is_none());
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert!(child.wait().await.unwrap().success());

        assert_eq!(out.trim(), "encoded");
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::Progress { update: ProgressUpdate::Processing(_), .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_task_terminates_waiting_child() {
        let (supervisor, _rx) = supervisor();
        let mut command = Command::new("sleep");
        command.arg("30");
        let mut child = supervisor.spawn("task-3", command).unwrap();

        let waiter = tokio::spawn(async move { child.wait().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.kill_task("task-3"), 1);

        let status = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("child killed promptly")
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert_eq!(supervisor.running_for("task-3"), 0);
        assert_eq!(supervisor.kill_task("task-3"), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_before_wait_is_not_lost() {
        let (supervisor, _rx) = supervisor();
        let mut command = Command::new("sleep");
        command.arg("30");
        let mut child = supervisor.spawn("task-4", command).unwrap();
        supervisor.kill_task("task-4");

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("pending kill applied on wait")
            .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn spawn_failure_is_a_process_error() {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let (supervisor, _rx) = supervisor();
            let err = supervisor
                .spawn("task-5", Command::new("/definitely/not/a/binary"))
                .err()
                .unwrap();
            assert!(matches!(err, AppError::Process(_)));
            assert_eq!(supervisor.running_for("task-5"), 0);
        });
    }
}
