//! Process tracking - Spawning instances and observing their termination

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::instance::InstanceId;
use crate::error::{InstanceError, Result};
use crate::platform;

/// How long a launched shim gets to report the application's PID
const PID_FILE_TIMEOUT: Duration = Duration::from_secs(10);
const PID_FILE_POLL: Duration = Duration::from_millis(25);

/// How termination of a launched process is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationWatch {
    /// Block a task on the OS wait primitive
    Wait,
    /// Check the child every interval
    Poll(Duration),
}

/// A process believed to be alive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningProcess {
    pub instance_id: InstanceId,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Started through the launcher bundle rather than the binary directly
    pub via_shim: bool,
}

/// Lifecycle notifications for listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Launched(RunningProcess),
    Terminated {
        instance_id: InstanceId,
        pid: u32,
        exit_code: Option<i32>,
    },
}

/// Per-instance state as seen by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotRunning,
    Launching,
    Running(RunningProcess),
}

/// Result of a launch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started(RunningProcess),
    /// A live record (or an in-flight launch) already existed; nothing was spawned
    AlreadyRunning(Option<RunningProcess>),
}

#[derive(Debug, Clone)]
enum Slot {
    Launching,
    Running(RunningProcess),
}

/// Owns the running-process records. At most one live process per instance.
pub struct ProcessTracker {
    slots: Arc<Mutex<HashMap<InstanceId, Slot>>>,
    events: broadcast::Sender<ProcessEvent>,
    watch: TerminationWatch,
    /// Liveness poll interval used when the wait primitive fails
    fallback_interval: Duration,
}

impl ProcessTracker {
    pub fn new(watch: TerminationWatch, fallback_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            events,
            watch,
            fallback_interval,
        }
    }

    /// Receive launch/termination events
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, HashMap<InstanceId, Slot>>> {
        self.slots
            .lock()
            .map_err(|e| InstanceError::Environment(format!("Process table lock poisoned: {}", e)))
    }

    /// Spawn `command` for `id` unless a live record already exists.
    ///
    /// With `pid_file`, `command` is a shell helper that starts the application
    /// elsewhere; the application reports its own PID in that file and that PID
    /// is tracked instead of the helper's.
    pub async fn launch(
        &self,
        id: InstanceId,
        command: Command,
        pid_file: Option<&Path>,
    ) -> Result<LaunchOutcome> {
        {
            let mut slots = self.slots()?;
            match slots.get(&id) {
                Some(Slot::Running(existing)) => {
                    debug!("Instance {} already running as PID {}", id, existing.pid);
                    return Ok(LaunchOutcome::AlreadyRunning(Some(existing.clone())));
                }
                Some(Slot::Launching) => {
                    debug!("Instance {} is already launching", id);
                    return Ok(LaunchOutcome::AlreadyRunning(None));
                }
                None => {
                    slots.insert(id, Slot::Launching);
                }
            }
        }

        match self.start(id, command, pid_file).await {
            Ok(record) => Ok(LaunchOutcome::Started(record)),
            Err(e) => {
                if let Ok(mut slots) = self.slots.lock() {
                    if matches!(slots.get(&id), Some(Slot::Launching)) {
                        slots.remove(&id);
                    }
                }
                error!("Launch of instance {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        id: InstanceId,
        mut command: Command,
        pid_file: Option<&Path>,
    ) -> Result<RunningProcess> {
        if let Some(path) = pid_file {
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(InstanceError::environment("Failed to clear", path, e));
                }
                _ => {}
            }
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        // Detach from our session so the app outlives a closed terminal
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| InstanceError::Launch(format!("Failed to spawn process: {}", e)))?;
        let child_pid = child
            .id()
            .ok_or_else(|| InstanceError::Launch("No process handle returned".to_string()))?;

        let (pid, target) = match pid_file {
            Some(path) => match wait_for_pid_file(path, &mut child).await {
                Ok(pid) => (pid, Target::Adopted { launcher: child }),
                Err(e) => {
                    let _ = child.start_kill();
                    return Err(e);
                }
            },
            None => (child_pid, Target::Child(child)),
        };

        let record = RunningProcess {
            instance_id: id,
            pid,
            started_at: Utc::now(),
            via_shim: pid_file.is_some(),
        };

        match self.slots() {
            Ok(mut slots) => {
                slots.insert(id, Slot::Running(record.clone()));
            }
            Err(e) => {
                // Nothing would ever reap or stop an untracked process
                if let Err(kill_err) = platform::kill_process(pid) {
                    warn!("Failed to kill untracked PID {}: {}", pid, kill_err);
                }
                return Err(e);
            }
        }

        info!("Instance {} running as PID {}", id, pid);
        let _ = self.events.send(ProcessEvent::Launched(record.clone()));

        tokio::spawn(watch_process(
            Arc::clone(&self.slots),
            self.events.clone(),
            id,
            pid,
            target,
            self.watch,
            self.fallback_interval,
        ));

        Ok(record)
    }

    /// Ask the process to quit. Returns false when no live record existed.
    pub fn terminate(&self, id: InstanceId) -> bool {
        self.signal(id, false)
    }

    /// Kill the process. Returns false when no live record existed.
    pub fn force_terminate(&self, id: InstanceId) -> bool {
        self.signal(id, true)
    }

    fn signal(&self, id: InstanceId, force: bool) -> bool {
        let Some(record) = self.running(id) else {
            return false;
        };

        let result = if force {
            platform::kill_process(record.pid)
        } else {
            platform::terminate_process(record.pid)
        };

        match result {
            Ok(()) => {
                info!(
                    "Sent {} to instance {} (PID {})",
                    if force { "kill" } else { "terminate" },
                    id,
                    record.pid
                );
                true
            }
            Err(e) => {
                warn!("Failed to stop instance {}: {}", id, e);
                false
            }
        }
    }

    pub fn state(&self, id: InstanceId) -> ProcessState {
        match self.slots().ok().and_then(|s| s.get(&id).cloned()) {
            Some(Slot::Launching) => ProcessState::Launching,
            Some(Slot::Running(record)) => ProcessState::Running(record),
            None => ProcessState::NotRunning,
        }
    }

    pub fn running(&self, id: InstanceId) -> Option<RunningProcess> {
        match self.state(id) {
            ProcessState::Running(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_running(&self, id: InstanceId) -> bool {
        self.running(id).is_some()
    }

    /// Get the number of running processes
    pub fn running_count(&self) -> usize {
        self.slots()
            .map(|s| s.values().filter(|slot| matches!(slot, Slot::Running(_))).count())
            .unwrap_or(0)
    }
}

/// What the watcher observes
enum Target {
    /// Our own child: wait on it directly
    Child(Child),
    /// A process started by `launcher`; only its liveness can be observed
    Adopted { launcher: Child },
}

/// Runs for the lifetime of one process and finishes exactly once.
async fn watch_process(
    slots: Arc<Mutex<HashMap<InstanceId, Slot>>>,
    events: broadcast::Sender<ProcessEvent>,
    id: InstanceId,
    pid: u32,
    target: Target,
    watch: TerminationWatch,
    fallback_interval: Duration,
) {
    let status = match (target, watch) {
        (Target::Child(mut child), TerminationWatch::Wait) => match child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Waiting on PID {} failed, polling instead: {}", pid, e);
                poll_liveness(pid, fallback_interval).await;
                None
            }
        },
        (Target::Child(mut child), TerminationWatch::Poll(interval)) => {
            poll_child(&mut child, pid, interval).await
        }
        (Target::Adopted { mut launcher }, watch) => {
            tokio::spawn(async move {
                if let Err(e) = launcher.wait().await {
                    debug!("Launcher helper could not be reaped: {}", e);
                }
            });
            let interval = match watch {
                TerminationWatch::Poll(interval) => interval,
                TerminationWatch::Wait => fallback_interval,
            };
            poll_liveness(pid, interval).await;
            None
        }
    };

    let exit_code = status.and_then(|s| s.code());
    if let Ok(mut slots) = slots.lock() {
        if matches!(slots.get(&id), Some(Slot::Running(r)) if r.pid == pid) {
            slots.remove(&id);
        }
    }

    info!("Instance {} (PID {}) terminated, exit code {:?}", id, pid, exit_code);
    let _ = events.send(ProcessEvent::Terminated {
        instance_id: id,
        pid,
        exit_code,
    });
}

/// Wait for a launched shim to record the application's PID. Fails when the
/// helper exits first or the file never appears.
async fn wait_for_pid_file(path: &Path, launcher: &mut Child) -> Result<u32> {
    let deadline = tokio::time::Instant::now() + PID_FILE_TIMEOUT;
    loop {
        if let Some(pid) = read_pid_file(path) {
            return Ok(pid);
        }

        match launcher.try_wait() {
            Ok(Some(status)) => {
                // The helper may exit right after the application wrote its PID
                if let Some(pid) = read_pid_file(path) {
                    return Ok(pid);
                }
                return Err(InstanceError::Launch(format!(
                    "Launcher exited ({}) before the application started",
                    status
                )));
            }
            Ok(None) => {}
            Err(e) => {
                return Err(InstanceError::Launch(format!(
                    "Failed to check launcher: {}",
                    e
                )))
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(InstanceError::Launch(format!(
                "Application did not report its PID in {}",
                path.display()
            )));
        }
        tokio::time::sleep(PID_FILE_POLL).await;
    }
}

/// A complete PID line written by the launch script
fn read_pid_file(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    if !contents.ends_with('\n') {
        return None;
    }
    contents.trim().parse().ok()
}

async fn poll_child(child: &mut Child, pid: u32, interval: Duration) -> Option<ExitStatus> {
    loop {
        tokio::time::sleep(interval).await;
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => continue,
            Err(e) => {
                warn!("Checking PID {} failed, polling liveness: {}", pid, e);
                poll_liveness(pid, interval).await;
                return None;
            }
        }
    }
}

async fn poll_liveness(pid: u32, interval: Duration) {
    while platform::is_process_running(pid) {
        tokio::time::sleep(interval).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sleeper(secs: u32) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(format!("exec sleep {}", secs));
        cmd
    }

    async fn next_termination(rx: &mut broadcast::Receiver<ProcessEvent>) -> ProcessEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.unwrap();
                if matches!(event, ProcessEvent::Terminated { .. }) {
                    return event;
                }
            }
        })
        .await
        .expect("termination event")
    }

    #[tokio::test]
    async fn test_launch_and_terminate() {
        let tracker = ProcessTracker::new(TerminationWatch::Wait, Duration::from_millis(50));
        let mut rx = tracker.subscribe();
        let id = InstanceId::new();

        let outcome = tracker.launch(id, sleeper(30), None).await.unwrap();
        let LaunchOutcome::Started(record) = outcome else {
            panic!("expected a new process");
        };
        assert_eq!(tracker.running(id), Some(record.clone()));
        assert!(matches!(rx.recv().await.unwrap(), ProcessEvent::Launched(_)));

        assert!(tracker.terminate(id));
        let event = next_termination(&mut rx).await;
        assert!(matches!(event, ProcessEvent::Terminated { pid, .. } if pid == record.pid));
        assert_eq!(tracker.state(id), ProcessState::NotRunning);
        assert!(!tracker.terminate(id));
    }

    #[tokio::test]
    async fn test_concurrent_launch_spawns_once() {
        let tracker = ProcessTracker::new(TerminationWatch::Wait, Duration::from_millis(50));
        let id = InstanceId::new();

        let (a, b) = tokio::join!(
            tracker.launch(id, sleeper(30), None),
            tracker.launch(id, sleeper(30), None)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let started = outcomes
            .iter()
            .filter(|o| matches!(o, LaunchOutcome::Started(_)))
            .count();
        assert_eq!(started, 1);
        assert_eq!(tracker.running_count(), 1);

        assert!(tracker.force_terminate(id));
    }

    #[tokio::test]
    async fn test_second_launch_returns_existing_record() {
        let tracker = ProcessTracker::new(TerminationWatch::Wait, Duration::from_millis(50));
        let id = InstanceId::new();
        let LaunchOutcome::Started(first) = tracker.launch(id, sleeper(30), None).await.unwrap()
        else {
            panic!("expected a new process");
        };
        let second = tracker.launch(id, sleeper(30), None).await.unwrap();
        assert_eq!(second, LaunchOutcome::AlreadyRunning(Some(first)));
        tracker.force_terminate(id);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_record() {
        let tracker = ProcessTracker::new(TerminationWatch::Wait, Duration::from_millis(50));
        let id = InstanceId::new();
        let err = tracker
            .launch(id, Command::new("/nonexistent/binary"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::Launch(_)));
        assert_eq!(tracker.state(id), ProcessState::NotRunning);
    }

    #[tokio::test]
    async fn test_poll_mode_observes_exit() {
        let tracker = ProcessTracker::new(
            TerminationWatch::Poll(Duration::from_millis(20)),
            Duration::from_millis(20),
        );
        let mut rx = tracker.subscribe();
        let id = InstanceId::new();

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("exit 3");
        tracker.launch(id, cmd, None).await.unwrap();

        let event = next_termination(&mut rx).await;
        assert!(matches!(
            event,
            ProcessEvent::Terminated { exit_code: Some(3), .. }
        ));
        assert!(!tracker.is_running(id));
    }

    /// Starts the application in the background and waits for it, the way
    /// `open -n -W` does. The application records its PID in `pid_file`.
    fn open_like(pid_file: &Path) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(r#"/bin/sh -c 'echo $$ > "$0"; exec sleep 30' "$0" & wait"#)
            .arg(pid_file);
        cmd
    }

    #[tokio::test]
    async fn test_adopts_pid_reported_by_launcher() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("app.pid");
        let tracker = ProcessTracker::new(TerminationWatch::Wait, Duration::from_millis(20));
        let mut rx = tracker.subscribe();
        let id = InstanceId::new();

        let outcome = tracker
            .launch(id, open_like(&pid_file), Some(&pid_file))
            .await
            .unwrap();
        let LaunchOutcome::Started(record) = outcome else {
            panic!("expected a new process");
        };
        let reported: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(record.via_shim);
        assert_eq!(record.pid, reported);
        assert!(platform::is_process_running(reported));

        assert!(tracker.terminate(id));
        let event = next_termination(&mut rx).await;
        assert!(matches!(event, ProcessEvent::Terminated { pid, .. } if pid == reported));
        assert!(!platform::is_process_running(reported));
        assert!(!tracker.is_running(id));
    }

    #[tokio::test]
    async fn test_launcher_exit_without_pid_fails() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("app.pid");
        // A file left by an earlier run must not be adopted
        std::fs::write(&pid_file, format!("{}\n", std::process::id())).unwrap();
        let tracker = ProcessTracker::new(TerminationWatch::Wait, Duration::from_millis(20));
        let id = InstanceId::new();

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("exit 1");
        let err = tracker.launch(id, cmd, Some(&pid_file)).await.unwrap_err();
        assert!(matches!(err, InstanceError::Launch(_)));
        assert_eq!(tracker.state(id), ProcessState::NotRunning);
    }

    #[tokio::test]
    async fn test_liveness_poll_sees_exit() {
        let mut child = sleeper(1).spawn().unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        assert!(platform::is_process_running(pid));
        tokio::time::timeout(
            Duration::from_secs(10),
            poll_liveness(pid, Duration::from_millis(20)),
        )
        .await
        .expect("liveness poll finished");
        assert!(reaper.await.unwrap().unwrap().success());
        assert!(!platform::is_process_running(pid));
    }

    #[tokio::test]
    async fn test_poisoned_table_kills_spawned_process() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("app.pid");
        let tracker = ProcessTracker::new(TerminationWatch::Wait, Duration::from_millis(20));
        let id = InstanceId::new();

        let mut slow = Command::new("/bin/sh");
        slow.arg("-c")
            .arg(r#"/bin/sh -c 'sleep 0.5; echo $$ > "$0"; exec sleep 30' "$0" & wait"#)
            .arg(&pid_file);

        let slots = Arc::clone(&tracker.slots);
        let (result, _) = tokio::join!(tracker.launch(id, slow, Some(&pid_file)), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = std::thread::spawn(move || {
                let _guard = slots.lock().unwrap();
                panic!("poison the process table");
            })
            .join();
        });
        assert!(result.is_err());

        let pid = read_pid_file(&pid_file).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while platform::is_process_running(pid) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("untracked process was killed");
    }

    #[test]
    fn test_partial_pid_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.pid");
        std::fs::write(&path, "123").unwrap();
        assert_eq!(read_pid_file(&path), None);
        std::fs::write(&path, "123\n").unwrap();
        assert_eq!(read_pid_file(&path), Some(123));
        assert_eq!(read_pid_file(&dir.path().join("missing")), None);
    }
}
