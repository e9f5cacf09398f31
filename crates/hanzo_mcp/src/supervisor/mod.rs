//! Process Supervisor - Child Process Lifecycle
//!
//! Launches children, captures their output into ring + spill storage,
//! auto-backgrounds long foreground waits, serves idempotent log reads,
//! delivers signals, and reaps exits. Sessions stay indexed until
//! explicitly removed or the server shuts down; session ids are never
//! reused.
//!
//! Per child there are three tasks: two collectors (one per stream) that
//! append to the spill files and the session record, and a monitor that
//! owns the `Child`, delivers signal requests, and broadcasts the exit
//! status over a watch channel.

mod ring;
mod session;

pub use session::{ProcessSession, SessionSnapshot, SessionState, StreamKind};

use crate::error::{ToolError, ToolResult};
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Signals a client may deliver to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Terminate,
    Kill,
    Interrupt,
}

impl SignalKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "terminate" => Some(Self::Terminate),
            "kill" => Some(Self::Kill),
            "interrupt" => Some(Self::Interrupt),
            _ => None,
        }
    }
}

/// Result of a foreground wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForegroundOutcome {
    /// Child exited within the deadline.
    Exited { exit_status: i32 },
    /// Deadline elapsed with the child still live; session transitioned.
    Backgrounded,
}

/// Everything needed to launch one child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

/// A page of combined output plus the session's current disposition.
#[derive(Debug)]
pub struct LogSlice {
    pub bytes: Vec<u8>,
    pub from: u64,
    pub total: u64,
    pub state: SessionState,
    pub exit_status: Option<i32>,
}

struct SessionEntry {
    session: Arc<RwLock<ProcessSession>>,
    exit_rx: watch::Receiver<Option<i32>>,
    signal_tx: mpsc::UnboundedSender<SignalKind>,
}

/// Index of all known process sessions.
pub struct ProcessSupervisor {
    sessions: DashMap<String, SessionEntry>,
    /// Tombstones so reads on removed sessions answer `Gone`, not `NotFound`.
    removed: DashMap<String, ()>,
    processes_dir: PathBuf,
    ring_bytes: usize,
    kill_grace: Duration,
}

/// Environment variables a child inherits from the server besides declared
/// additions.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG", "TERM", "TMPDIR"];

/// Per-read ceiling for log fetches; the token budgeter cuts further.
const MAX_LOG_READ: usize = 512 * 1024;

impl ProcessSupervisor {
    pub fn new(processes_dir: PathBuf, ring_bytes: usize, kill_grace: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            removed: DashMap::new(),
            processes_dir,
            ring_bytes,
            kill_grace,
        }
    }

    /// Launch a child and start collecting its output. Returns the new
    /// session id; the caller decides whether to wait in the foreground.
    pub async fn spawn(&self, spec: SpawnSpec) -> ToolResult<String> {
        let session_id = format!("proc_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let spill_dir = self.processes_dir.join(&session_id);
        tokio::fs::create_dir_all(&spill_dir).await.map_err(|e| {
            ToolError::ExecutionFailed(format!(
                "cannot create spill dir {}: {}",
                spill_dir.display(),
                e
            ))
        })?;

        let mut command = Command::new(&spec.argv[0]);
        command
            .args(&spec.argv[1..])
            .current_dir(&spec.cwd)
            .env_clear()
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in INHERITED_ENV {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to spawn {}: {}", spec.argv[0], e))
        })?;

        if let Some(data) = spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                // best effort; a child that never reads stdin is its own problem
                tokio::spawn(async move {
                    let _ = stdin.write_all(&data).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let mut session = ProcessSession::new(
            session_id.clone(),
            spec.argv.clone(),
            spec.cwd.clone(),
            spec.env.clone(),
            spill_dir.clone(),
            self.ring_bytes,
        );
        session.pid = child.id();
        let session = Arc::new(RwLock::new(session));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(stream) = stdout {
            spawn_collector(
                stream,
                StreamKind::Stdout,
                Arc::clone(&session),
                spill_dir.clone(),
            );
        }
        if let Some(stream) = stderr {
            spawn_collector(
                stream,
                StreamKind::Stderr,
                Arc::clone(&session),
                spill_dir.clone(),
            );
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        spawn_monitor(child, Arc::clone(&session), exit_tx, signal_rx);

        info!(session_id = %session_id, command = %spec.argv[0], "spawned process session");
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                session,
                exit_rx,
                signal_tx,
            },
        );
        Ok(session_id)
    }

    /// Wait for exit or the foreground deadline, whichever first.
    ///
    /// `deadline` of `None` waits indefinitely (auto-background forbidden);
    /// `Some(Duration::ZERO)` backgrounds immediately.
    pub async fn wait_foreground(
        &self,
        session_id: &str,
        deadline: Option<Duration>,
    ) -> ToolResult<ForegroundOutcome> {
        let mut exit_rx = self.entry(session_id)?.exit_rx.clone();

        let wait_exit = async {
            let status = exit_rx
                .wait_for(Option::is_some)
                .await
                .map(|v| v.expect("guarded by wait_for"))
                .unwrap_or(-1);
            ForegroundOutcome::Exited {
                exit_status: status,
            }
        };

        match deadline {
            None => Ok(wait_exit.await),
            Some(d) => {
                match tokio::time::timeout(d, wait_exit).await {
                    Ok(outcome) => Ok(outcome),
                    Err(_) => {
                        let entry = self.entry(session_id)?;
                        // the child may have exited in the race with the timer
                        if let Some(code) = *entry.exit_rx.borrow() {
                            return Ok(ForegroundOutcome::Exited { exit_status: code });
                        }
                        let mut session = entry.session.write().expect("session lock");
                        if session.state == SessionState::Running {
                            session.state = SessionState::Backgrounded;
                            info!(session_id, "auto-backgrounded");
                        }
                        Ok(ForegroundOutcome::Backgrounded)
                    }
                }
            }
        }
    }

    /// Block until the session exits, returning its status. Used by the DAG
    /// runner, which bounds itself via the invocation deadline.
    pub async fn wait_exit(&self, session_id: &str) -> ToolResult<i32> {
        let mut exit_rx = self.entry(session_id)?.exit_rx.clone();
        let status = exit_rx
            .wait_for(Option::is_some)
            .await
            .map(|v| v.expect("guarded by wait_for"))
            .unwrap_or(-1);
        Ok(status)
    }

    /// Idempotent read of the combined output stream from `from`.
    pub fn read_logs(&self, session_id: &str, from: u64) -> ToolResult<LogSlice> {
        let entry = self.entry(session_id)?;
        let session = entry.session.read().expect("session lock");
        let total = session.total_bytes();
        let from = from.min(total);
        let bytes = session.read_combined(from, MAX_LOG_READ)?;
        Ok(LogSlice {
            bytes,
            from,
            total,
            state: session.state,
            exit_status: session.exit_status,
        })
    }

    /// Snapshot of every known session, newest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|entry| entry.session.read().expect("session lock").snapshot())
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    /// Deliver a signal. Delivering to an already-exited session is a no-op.
    ///
    /// `interrupt` has no counterpart outside POSIX and is rejected there
    /// rather than silently escalated to a hard stop.
    pub fn signal(&self, session_id: &str, signal: SignalKind) -> ToolResult<SessionState> {
        #[cfg(not(unix))]
        if signal == SignalKind::Interrupt {
            return Err(ToolError::InvalidArguments(
                "signal `interrupt` is not supported on this platform".into(),
            ));
        }

        let entry = self.entry(session_id)?;
        {
            let mut session = entry.session.write().expect("session lock");
            if session.state.is_live() {
                session.signalled = true;
                debug!(session_id, ?signal, "delivering signal");
            }
        }
        // monitor gone means the child already exited; nothing to deliver
        let _ = entry.signal_tx.send(signal);
        let state = entry.session.read().expect("session lock").state;
        Ok(state)
    }

    /// Drop a finished session from the index. Live sessions must be
    /// signalled first.
    pub fn remove(&self, session_id: &str) -> ToolResult<()> {
        let entry = self.entry(session_id)?;
        if entry.session.read().expect("session lock").state.is_live() {
            return Err(ToolError::InvalidArguments(format!(
                "session still live: {} (signal it first)",
                session_id
            )));
        }
        drop(entry);
        self.sessions.remove(session_id);
        self.removed.insert(session_id.to_string(), ());
        Ok(())
    }

    /// Terminate everything live, escalate to kill after the grace window.
    pub async fn shutdown(&self) {
        let live: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.session.read().expect("session lock").state.is_live())
            .map(|e| e.key().clone())
            .collect();
        if live.is_empty() {
            return;
        }

        info!(count = live.len(), "terminating live sessions");
        for sid in &live {
            let _ = self.signal(sid, SignalKind::Terminate);
        }
        tokio::time::sleep(self.kill_grace).await;
        for sid in &live {
            let still_live = self
                .sessions
                .get(sid)
                .map(|e| e.session.read().expect("session lock").state.is_live())
                .unwrap_or(false);
            if still_live {
                warn!(session_id = %sid, "escalating to kill");
                let _ = self.signal(sid, SignalKind::Kill);
            }
        }
    }

    /// Kill grace window, shared with tool bodies that escalate themselves.
    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    fn entry(
        &self,
        session_id: &str,
    ) -> ToolResult<dashmap::mapref::one::Ref<'_, String, SessionEntry>> {
        if let Some(entry) = self.sessions.get(session_id) {
            return Ok(entry);
        }
        if self.removed.contains_key(session_id) {
            Err(ToolError::Gone(format!(
                "session removed: {}",
                session_id
            )))
        } else {
            Err(ToolError::NotFound(format!(
                "unknown session: {}",
                session_id
            )))
        }
    }
}

fn spawn_collector(
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    kind: StreamKind,
    session: Arc<RwLock<ProcessSession>>,
    spill_dir: PathBuf,
) {
    tokio::spawn(async move {
        let spill_path = spill_dir.join(kind.spill_name());
        let mut spill = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spill_path)
            .await
        {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %spill_path.display(), %err, "spill file unavailable");
                return;
            }
        };

        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = spill.write_all(&buf[..n]).await {
                        warn!(path = %spill_path.display(), %err, "spill write failed");
                        break;
                    }
                    session
                        .write()
                        .expect("session lock")
                        .record_chunk(kind, &buf[..n]);
                }
                Err(err) => {
                    debug!(?kind, %err, "collector read ended");
                    break;
                }
            }
        }
        let _ = spill.flush().await;
    });
}

fn spawn_monitor(
    mut child: tokio::process::Child,
    session: Arc<RwLock<ProcessSession>>,
    exit_tx: watch::Sender<Option<i32>>,
    mut signal_rx: mpsc::UnboundedReceiver<SignalKind>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => exit_code(status),
                        Err(err) => {
                            warn!(%err, "wait on child failed");
                            -1
                        }
                    };
                    let session_id = {
                        let mut session = session.write().expect("session lock");
                        session.mark_exited(code);
                        session.session_id.clone()
                    };
                    debug!(session_id = %session_id, code, "reaped child");
                    let _ = exit_tx.send(Some(code));
                    break;
                }
                Some(signal) = signal_rx.recv() => {
                    deliver_signal(&mut child, signal);
                }
            }
        }
    });
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn deliver_signal(child: &mut tokio::process::Child, signal: SignalKind) {
    let Some(pid) = child.id() else {
        return;
    };
    let signo = match signal {
        SignalKind::Terminate => libc::SIGTERM,
        SignalKind::Kill => libc::SIGKILL,
        SignalKind::Interrupt => libc::SIGINT,
    };
    unsafe {
        libc::kill(pid as libc::pid_t, signo);
    }
}

#[cfg(not(unix))]
fn deliver_signal(child: &mut tokio::process::Child, signal: SignalKind) {
    // interrupt never reaches this point; signal() rejects it up front.
    // terminate and kill both map to the host's customary hard stop.
    match signal {
        SignalKind::Terminate | SignalKind::Kill => {
            let _ = child.start_kill();
        }
        SignalKind::Interrupt => {}
    }
}
