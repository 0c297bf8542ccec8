use crate::config::DataLayout;
use crate::error::SupervisorError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Longest accepted server id
const MAX_SERVER_ID_LEN: usize = 128;

/// State of a server's frpc process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// A start call has claimed the id and is spawning the process
    Starting,
    /// Process is running
    Running,
    /// Kill has been requested and not yet acknowledged
    Stopping,
    /// Process was stopped or exited on its own
    Stopped,
}

impl ProcessState {
    /// Whether an OS process is (still) attached to the record
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Stopping)
    }
}

/// Reply channel for a kill request sent to the exit watcher
type KillRequest = oneshot::Sender<std::io::Result<()>>;

/// Registry entry for one server id. Retained after the process ends so
/// status and log queries keep working.
struct ProcessRecord {
    state: ProcessState,
    /// OS process id of the most recent process, 0 if none was ever spawned
    pid: u32,
    /// Identifies the spawned process this record refers to
    instance: u64,
    log_path: PathBuf,
    config_path: PathBuf,
    /// Sends kill requests to the task that owns the child handle
    control: Option<mpsc::UnboundedSender<KillRequest>>,
}

/// Status snapshot for one server
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProcessStatus {
    pub server_id: String,
    pub state: ProcessState,
    pub running: bool,
    pub pid: u32,
}

/// Supervises at most one frpc process per server id.
///
/// # Usage
///
/// `ProcessManager` is shared behind an `Arc`; [`new`](ProcessManager::new)
/// returns `Arc<Self>` and [`start`](ProcessManager::start) takes
/// `&Arc<Self>` so the exit watcher it spawns can update the registry.
///
/// ```ignore
/// let manager = ProcessManager::new(layout);
/// let pid = manager.start("home", &config_text).await?;
/// ```
///
/// # Locking
///
/// The whole registry sits behind one `RwLock`. Every check-then-mutate step
/// happens in a single critical section and nothing blocks or awaits while the
/// lock is held. Spawning, file I/O and waiting for exit all happen outside.
///
/// Each spawned process gets its own watcher task which owns the `Child`. The
/// watcher only updates a record whose `instance` still matches the process
/// it watched, so a late exit from an earlier process cannot mark a newer
/// process for the same id as stopped.
pub struct ProcessManager {
    layout: DataLayout,
    processes: RwLock<HashMap<String, ProcessRecord>>,
    next_instance: AtomicU64,
}

impl ProcessManager {
    pub fn new(layout: DataLayout) -> Arc<Self> {
        Arc::new(Self {
            layout,
            processes: RwLock::new(HashMap::new()),
            next_instance: AtomicU64::new(0),
        })
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Current state of a server; ids without a record report `Stopped`
    pub fn get_state(&self, server_id: &str) -> ProcessState {
        self.processes
            .read()
            .get(server_id)
            .map(|r| r.state)
            .unwrap_or(ProcessState::Stopped)
    }

    /// `(running, pid)` for a server; `(false, 0)` when no record exists.
    /// The pid of a stopped server is that of its last process.
    pub fn status(&self, server_id: &str) -> (bool, u32) {
        self.processes
            .read()
            .get(server_id)
            .map(|r| (r.state.is_running(), r.pid))
            .unwrap_or((false, 0))
    }

    /// Status of every server that has been started at least once, sorted by id
    pub fn list(&self) -> Vec<ProcessStatus> {
        let mut statuses: Vec<ProcessStatus> = self
            .processes
            .read()
            .iter()
            .map(|(server_id, record)| ProcessStatus {
                server_id: server_id.clone(),
                state: record.state,
                running: record.state.is_running(),
                pid: record.pid,
            })
            .collect();
        statuses.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        statuses
    }

    /// Write `config_text` to the server's config file and spawn frpc on it,
    /// with stdout and stderr going to the server's (truncated) log file.
    /// Returns the pid of the new process.
    pub async fn start(
        self: &Arc<Self>,
        server_id: &str,
        config_text: &str,
    ) -> Result<u32, SupervisorError> {
        validate_server_id(server_id)?;

        let reservation = self.reserve(server_id)?;
        let instance = reservation.instance;

        let spawned = match self.spawn_frpc(server_id, config_text).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.release_reservation(server_id, reservation);
                return Err(e);
            }
        };

        let pid = spawned.child.id().unwrap_or(0);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        self.processes.write().insert(
            server_id.to_string(),
            ProcessRecord {
                state: ProcessState::Running,
                pid,
                instance,
                log_path: spawned.log_path,
                config_path: spawned.config_path,
                control: Some(control_tx),
            },
        );

        info!(server_id, pid, "frpc started");

        let manager = Arc::clone(self);
        let server_id_owned = server_id.to_string();
        tokio::spawn(async move {
            manager
                .watch_exit(server_id_owned, instance, spawned.child, spawned.log, control_rx)
                .await;
        });

        Ok(pid)
    }

    /// Claim `server_id` for a start. The record is moved to `Starting` under a
    /// new instance number, so watchers of earlier processes no longer match it.
    fn reserve(&self, server_id: &str) -> Result<Reservation, SupervisorError> {
        let mut processes = self.processes.write();
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        match processes.get_mut(server_id) {
            Some(record) if record.state != ProcessState::Stopped => {
                debug!(server_id, state = ?record.state, "Start rejected, process is active");
                Err(SupervisorError::AlreadyRunning(server_id.to_string()))
            }
            Some(record) => {
                record.state = ProcessState::Starting;
                record.instance = instance;
                record.control = None;
                Ok(Reservation {
                    instance,
                    had_record: true,
                })
            }
            None => {
                processes.insert(
                    server_id.to_string(),
                    ProcessRecord {
                        state: ProcessState::Starting,
                        pid: 0,
                        instance,
                        log_path: self.layout.log_path(server_id),
                        config_path: self.layout.conf_path(server_id),
                        control: None,
                    },
                );
                Ok(Reservation {
                    instance,
                    had_record: false,
                })
            }
        }
    }

    /// Undo [`reserve`](Self::reserve) after a failed start
    fn release_reservation(&self, server_id: &str, reservation: Reservation) {
        let mut processes = self.processes.write();
        let owned = processes
            .get(server_id)
            .is_some_and(|r| r.instance == reservation.instance);
        if !owned {
            return;
        }
        if reservation.had_record {
            if let Some(record) = processes.get_mut(server_id) {
                record.state = ProcessState::Stopped;
            }
        } else {
            processes.remove(server_id);
        }
    }

    async fn spawn_frpc(
        &self,
        server_id: &str,
        config_text: &str,
    ) -> Result<SpawnedProcess, SupervisorError> {
        let binary = self.layout.binary_path();
        if !tokio::fs::try_exists(&binary).await.unwrap_or(false) {
            return Err(SupervisorError::BinaryMissing(binary));
        }

        let config_path = self.layout.conf_path(server_id);
        tokio::fs::create_dir_all(self.layout.conf_dir())
            .await
            .map_err(|source| SupervisorError::Io { action: "create config directory", source })?;
        tokio::fs::write(&config_path, config_text)
            .await
            .map_err(|source| SupervisorError::Io { action: "write config", source })?;

        let log_path = self.layout.log_path(server_id);
        tokio::fs::create_dir_all(self.layout.logs_dir())
            .await
            .map_err(|source| SupervisorError::Io { action: "create log directory", source })?;
        let log = tokio::fs::File::create(&log_path)
            .await
            .map_err(|source| SupervisorError::Io { action: "create log file", source })?
            .into_std()
            .await;
        let stdout = log
            .try_clone()
            .map_err(|source| SupervisorError::Io { action: "create log file", source })?;
        let stderr = log
            .try_clone()
            .map_err(|source| SupervisorError::Io { action: "create log file", source })?;

        debug!(server_id, binary = %binary.display(), config = %config_path.display(), "Spawning frpc");

        let mut cmd = Command::new(&binary);
        cmd.arg("-c").arg(&config_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));

        // The log handles are dropped, and so closed, with `cmd` on failure
        let child = cmd
            .spawn()
            .map_err(|source| SupervisorError::Io { action: "start frpc", source })?;

        Ok(SpawnedProcess {
            child,
            log,
            log_path,
            config_path,
        })
    }

    /// Owns the child until it exits, serving kill requests in the meantime
    async fn watch_exit(
        self: Arc<Self>,
        server_id: String,
        instance: u64,
        mut child: Child,
        log: std::fs::File,
        mut control_rx: mpsc::UnboundedReceiver<KillRequest>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(reply) = control_rx.recv() => {
                    let _ = reply.send(child.start_kill());
                }
            }
        };
        drop(log);

        self.mark_exited(&server_id, instance, status);
    }

    fn mark_exited(&self, server_id: &str, instance: u64, status: std::io::Result<ExitStatus>) {
        let updated = {
            let mut processes = self.processes.write();
            match processes.get_mut(server_id) {
                Some(record) if record.instance == instance && record.state.is_running() => {
                    record.state = ProcessState::Stopped;
                    record.control = None;
                    true
                }
                _ => false,
            }
        };

        if !updated {
            debug!(server_id, instance, "Exit of superseded or already stopped frpc process ignored");
        }
        match status {
            Ok(status) => info!(server_id, %status, "frpc process exited"),
            Err(e) => warn!(server_id, error = %e, "Error waiting for frpc process"),
        }
    }

    /// Forcibly terminate the server's process. The record flips to stopped as
    /// soon as the kill is delivered, without waiting for the exit.
    pub async fn stop(&self, server_id: &str) -> Result<(), SupervisorError> {
        validate_server_id(server_id)?;

        let (instance, pid, control) = {
            let mut processes = self.processes.write();
            match processes.get_mut(server_id) {
                Some(record) if record.state == ProcessState::Running => {
                    record.state = ProcessState::Stopping;
                    (record.instance, record.pid, record.control.clone())
                }
                _ => return Err(SupervisorError::NotRunning(server_id.to_string())),
            }
        };

        debug!(server_id, pid, "Killing frpc");
        let kill_result = match control {
            Some(control) => request_kill(&control).await,
            None => None,
        };

        let mut processes = self.processes.write();
        // Only the process this call claimed; a newer start may own the id by now
        let record = processes
            .get_mut(server_id)
            .filter(|r| r.instance == instance && r.state.is_running());

        match kill_result {
            Some(Err(source)) => {
                if let Some(record) = record {
                    if record.state == ProcessState::Stopping {
                        record.state = ProcessState::Running;
                    }
                }
                warn!(server_id, pid, error = %source, "Failed to kill frpc");
                Err(SupervisorError::Kill {
                    server_id: server_id.to_string(),
                    source,
                })
            }
            Some(Ok(())) => {
                if let Some(record) = record {
                    record.state = ProcessState::Stopped;
                }
                info!(server_id, pid, "frpc stopped");
                Ok(())
            }
            None => {
                // Exited before the kill landed; the watcher records the exit
                if let Some(record) = record {
                    record.state = ProcessState::Stopped;
                }
                info!(server_id, pid, "frpc had already exited");
                Ok(())
            }
        }
    }

    /// Stop every running process. Failures are logged, never returned.
    pub async fn stop_all(&self) {
        let running: Vec<String> = self
            .processes
            .read()
            .iter()
            .filter(|(_, record)| record.state == ProcessState::Running)
            .map(|(server_id, _)| server_id.clone())
            .collect();

        for server_id in running {
            match self.stop(&server_id).await {
                Ok(()) => info!(server_id = %server_id, "frpc stopped (shutdown)"),
                Err(SupervisorError::NotRunning(_)) => {}
                Err(e) => error!(server_id = %server_id, error = %e, "Failed to stop frpc during shutdown"),
            }
        }
    }

    /// Last `max_lines` lines of the server's log; the whole log when
    /// `max_lines <= 0`, and an empty string when there is no log yet.
    pub async fn tail_logs(&self, server_id: &str, max_lines: i64) -> Result<String, SupervisorError> {
        validate_server_id(server_id)?;

        let path = self
            .processes
            .read()
            .get(server_id)
            .map(|r| r.log_path.clone())
            .unwrap_or_else(|| self.layout.log_path(server_id));

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(source) => return Err(SupervisorError::Io { action: "read log", source }),
        };

        Ok(tail_lines(&String::from_utf8_lossy(&bytes), max_lines))
    }

    /// Path of the config file most recently written for a server
    pub fn config_path(&self, server_id: &str) -> PathBuf {
        self.processes
            .read()
            .get(server_id)
            .map(|r| r.config_path.clone())
            .unwrap_or_else(|| self.layout.conf_path(server_id))
    }
}

/// Claim on a server id taken by [`ProcessManager::start`] before spawning
#[derive(Debug, Clone, Copy)]
struct Reservation {
    instance: u64,
    had_record: bool,
}

struct SpawnedProcess {
    child: Child,
    log: std::fs::File,
    log_path: PathBuf,
    config_path: PathBuf,
}

/// Ask the exit watcher to kill its child. `None` means the watcher is gone,
/// i.e. the process already exited.
async fn request_kill(
    control: &mpsc::UnboundedSender<KillRequest>,
) -> Option<std::io::Result<()>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    control.send(reply_tx).ok()?;
    reply_rx.await.ok()
}

/// Server ids become file names, so only a conservative character set is
/// accepted: ASCII alphanumerics, `-`, `_` and `.`, not starting with `.`.
pub fn validate_server_id(server_id: &str) -> Result<(), SupervisorError> {
    let valid = !server_id.is_empty()
        && server_id.len() <= MAX_SERVER_ID_LEN
        && !server_id.starts_with('.')
        && server_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SupervisorError::InvalidServerId(server_id.to_string()))
    }
}

/// Keep the last `max_lines` lines of `content`. Content with at most
/// `max_lines` lines, or any content when `max_lines <= 0`, is returned as is.
/// Lines end at `\n`; the kept lines are returned byte for byte, so `\r\n`
/// endings survive trimming.
pub fn tail_lines(content: &str, max_lines: i64) -> String {
    let max = match usize::try_from(max_lines) {
        Ok(0) | Err(_) => return content.to_string(),
        Ok(max) => max,
    };

    // A final newline terminates the last line rather than starting a new one
    let body = content.strip_suffix('\n').unwrap_or(content);
    match body.rmatch_indices('\n').nth(max - 1) {
        Some((start, _)) => content[start + 1..].to_string(),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_manager(dir: &TempDir) -> Arc<ProcessManager> {
        let layout = DataLayout::new(dir.path());
        layout.prepare().unwrap();
        ProcessManager::new(layout)
    }

    /// Stand-in for frpc: prints its config, then idles until killed
    #[cfg(unix)]
    fn install_fake_frpc(manager: &ProcessManager, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = manager.layout().binary_path();
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    const LONG_RUNNING: &str = "echo \"config: $2\"\ncat \"$2\"\nexec sleep 60";

    async fn wait_for_stopped(manager: &ProcessManager, server_id: &str) -> bool {
        for _ in 0..100 {
            if !manager.status(server_id).0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_status_of_unknown_server() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);

        assert_eq!(manager.status("home"), (false, 0));
        assert_eq!(manager.get_state("home"), ProcessState::Stopped);
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_server_is_not_running() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);

        let err = manager.stop("home").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning(ref id) if id == "home"));
    }

    #[tokio::test]
    async fn test_start_without_binary() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);

        let err = manager.start("home", "serverAddr = \"x\"").await.unwrap_err();

        assert!(matches!(err, SupervisorError::BinaryMissing(_)));
        assert_eq!(manager.status("home"), (false, 0));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_server_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);

        for id in ["", "../etc/passwd", "a/b", ".hidden", "with space"] {
            let err = manager.start(id, "").await.unwrap_err();
            assert!(matches!(err, SupervisorError::InvalidServerId(_)), "id {id:?}");
            assert!(matches!(
                manager.stop(id).await.unwrap_err(),
                SupervisorError::InvalidServerId(_)
            ));
        }
        assert!(validate_server_id("home-1_a.b").is_ok());
        assert!(validate_server_id(&"x".repeat(129)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, LONG_RUNNING);

        let pid = manager.start("home", "serverAddr = \"1.2.3.4\"\n").await.unwrap();

        assert!(pid > 0);
        assert_eq!(manager.status("home"), (true, pid));
        assert_eq!(manager.get_state("home"), ProcessState::Running);
        assert_eq!(
            std::fs::read_to_string(manager.config_path("home")).unwrap(),
            "serverAddr = \"1.2.3.4\"\n"
        );

        manager.stop("home").await.unwrap();

        assert_eq!(manager.status("home"), (false, pid));
        assert_eq!(manager.get_state("home"), ProcessState::Stopped);

        let err = manager.stop("home").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, LONG_RUNNING);

        let pid = manager.start("home", "a").await.unwrap();
        let err = manager.start("home", "b").await.unwrap_err();

        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        assert_eq!(manager.status("home"), (true, pid));
        // The second call must not have rewritten the config
        assert_eq!(std::fs::read_to_string(manager.config_path("home")).unwrap(), "a");

        manager.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_previous_watcher_leaves_pending_start_alone() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, LONG_RUNNING);

        let pid = manager.start("home", "").await.unwrap();
        manager.stop("home").await.unwrap();

        // A start that has claimed the id but not spawned yet
        let reservation = manager.reserve("home").unwrap();
        assert_eq!(manager.get_state("home"), ProcessState::Starting);

        // The killed process's watcher observes its exit meanwhile
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(manager.get_state("home"), ProcessState::Starting);
        assert_eq!(manager.status("home"), (false, pid));
        assert!(matches!(
            manager.start("home", "").await.unwrap_err(),
            SupervisorError::AlreadyRunning(_)
        ));

        manager.release_reservation("home", reservation);
        assert_eq!(manager.get_state("home"), ProcessState::Stopped);
        let second = manager.start("home", "").await.unwrap();
        assert_ne!(second, pid);
        manager.stop("home").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_exit_does_not_touch_newer_instance() {
        use std::os::unix::process::ExitStatusExt;

        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, LONG_RUNNING);

        manager.start("home", "").await.unwrap();
        let old_instance = manager.processes.read()["home"].instance;
        manager.stop("home").await.unwrap();

        let reservation = manager.reserve("home").unwrap();
        assert_ne!(reservation.instance, old_instance);

        manager.mark_exited("home", old_instance, Ok(ExitStatus::from_raw(0)));
        assert_eq!(manager.get_state("home"), ProcessState::Starting);

        // The reservation's own release still applies
        manager.release_reservation("home", reservation);
        assert_eq!(manager.get_state("home"), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_release_of_fresh_reservation_removes_record() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);

        let reservation = manager.reserve("home").unwrap();
        assert!(!reservation.had_record);
        assert!(matches!(
            manager.reserve("home").unwrap_err(),
            SupervisorError::AlreadyRunning(_)
        ));

        manager.release_reservation("home", reservation);
        assert!(manager.list().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_gets_new_pid_and_truncates_log() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, LONG_RUNNING);

        let first = manager.start("home", "first-config").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop("home").await.unwrap();

        let second = manager.start("home", "second-config").await.unwrap();
        assert_ne!(first, second);

        // Give the first watcher time to observe its exit
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.status("home"), (true, second));

        let logs = manager.tail_logs("home", 0).await.unwrap();
        assert!(logs.contains("second-config"));
        assert!(!logs.contains("first-config"));

        manager.stop("home").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_self_exit_is_detected() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, "echo bye\nexit 1");

        let pid = manager.start("home", "").await.unwrap();

        assert!(wait_for_stopped(&manager, "home").await);
        assert_eq!(manager.status("home"), (false, pid));
        assert!(matches!(
            manager.stop("home").await.unwrap_err(),
            SupervisorError::NotRunning(_)
        ));
        assert_eq!(manager.tail_logs("home", 10).await.unwrap(), "bye\n");

        // A stopped record can be started again
        install_fake_frpc(&manager, LONG_RUNNING);
        manager.start("home", "").await.unwrap();
        assert!(manager.status("home").0);
        manager.stop("home").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, LONG_RUNNING);

        manager.start("a", "").await.unwrap();
        manager.start("b", "").await.unwrap();
        assert_eq!(manager.list().iter().filter(|s| s.running).count(), 2);

        manager.stop_all().await;

        assert!(!manager.status("a").0);
        assert!(!manager.status("b").0);
        let ids: Vec<String> = manager.list().into_iter().map(|s| s.server_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_starts_for_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, LONG_RUNNING);

        let (a, b) = tokio::join!(manager.start("a", "x"), manager.start("b", "y"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a, b);
        assert_eq!(manager.status("a"), (true, a));
        assert_eq!(manager.status("b"), (true, b));

        manager.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_starts_for_same_id() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        install_fake_frpc(&manager, LONG_RUNNING);

        let (a, b) = tokio::join!(manager.start("home", "x"), manager.start("home", "y"));

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(SupervisorError::AlreadyRunning(_))
        ));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_tail_logs_of_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);

        assert_eq!(manager.tail_logs("never-started", 3).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_tail_logs_reads_log_file() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let content: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(manager.layout().log_path("home"), &content).unwrap();

        assert_eq!(manager.tail_logs("home", 3).await.unwrap(), "line 8\nline 9\nline 10\n");
        assert_eq!(manager.tail_logs("home", 0).await.unwrap(), content);
        assert_eq!(manager.tail_logs("home", -5).await.unwrap(), content);
    }

    #[test]
    fn test_tail_lines() {
        let content = "a\nb\nc\nd";
        assert_eq!(tail_lines(content, 2), "c\nd");
        assert_eq!(tail_lines(content, 4), content);
        assert_eq!(tail_lines(content, 10), content);
        assert_eq!(tail_lines(content, 0), content);
        assert_eq!(tail_lines("", 3), "");
        assert_eq!(tail_lines("a\nb\n", 1), "b\n");
        assert_eq!(tail_lines("a\nb\n", 2), "a\nb\n");
        assert_eq!(tail_lines("\n\n\n", 2), "\n\n");
    }

    #[test]
    fn test_tail_lines_keeps_crlf_endings() {
        let content = "a\r\nb\r\nc\r\n";

        assert_eq!(tail_lines(content, 1), "c\r\n");
        assert_eq!(tail_lines(content, 2), "b\r\nc\r\n");
        assert_eq!(tail_lines(content, 3), content);
        assert_eq!(tail_lines("a\r\nb\nc", 2), "b\nc");
    }

    #[test]
    fn test_process_state_is_running() {
        assert!(ProcessState::Running.is_running());
        assert!(ProcessState::Stopping.is_running());
        assert!(!ProcessState::Starting.is_running());
        assert!(!ProcessState::Stopped.is_running());
        assert_eq!(serde_json::to_string(&ProcessState::Running).unwrap(), "\"running\"");
    }
}
