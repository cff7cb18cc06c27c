//! Script Registry - child processes spawned on behalf of the UI
//!
//! Each script gets:
//! - stdout/stderr capture into a bounded output log
//! - a consuming cursor for polling (`output`)
//! - two-phase termination: cooperative signal now, forced kill later
//!
//! The child handle is owned by a single waiter task. Signals are routed
//! through it so a kill can never hit a pid the OS has already reused.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};
use crate::{port, utils};

/// Maximum number of records kept per script.
pub const OUTPUT_CAPACITY: usize = 100;

pub const STDERR_PREFIX: &str = "ERROR: ";
pub const TERMINATED_BY_USER: &str = "Process terminated by user";

/// How long the waiter lets the output readers drain after exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Output Log ──────────────────────────────────────────────

/// Ring buffer of output records with a single consuming cursor.
///
/// Records carry sequence numbers so the cursor stays correct when old
/// records are evicted.
#[derive(Debug)]
pub struct OutputLog {
    records: VecDeque<(u64, String)>,
    next_seq: u64,
    cursor: u64,
    capacity: usize,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::with_capacity(OUTPUT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            next_seq: 0,
            cursor: 0,
            capacity,
        }
    }

    pub fn push(&mut self, record: String) {
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back((self.next_seq, record));
        self.next_seq += 1;
    }

    /// Records appended since the previous drain; advances the cursor.
    pub fn drain_new(&mut self) -> Vec<String> {
        let cursor = self.cursor;
        let fresh = self
            .records
            .iter()
            .filter(|(seq, _)| *seq >= cursor)
            .map(|(_, record)| record.clone())
            .collect();
        self.cursor = self.next_seq;
        fresh
    }

    /// Every retained record, cursor untouched.
    pub fn snapshot(&self) -> Vec<String> {
        self.records.iter().map(|(_, record)| record.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Script Entry ────────────────────────────────────────────

enum Control {
    Terminate(oneshot::Sender<std::io::Result<()>>),
    Kill,
}

struct ScriptState {
    log: OutputLog,
    running: bool,
    exited: bool,
    kill_timer: Option<JoinHandle<()>>,
}

/// A spawned script. Kept after exit so its final output stays readable.
pub struct ScriptEntry {
    pub pid: u32,
    pub command: String,
    pub effective_port: u16,
    pub requested_port: u16,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    state: Mutex<ScriptState>,
    control: mpsc::Sender<Control>,
    exited_rx: watch::Receiver<bool>,
}

impl ScriptEntry {
    /// Dropped once the exit record is in: it is always the last record.
    async fn append(&self, record: String) {
        let mut state = self.state.lock().await;
        if !state.exited {
            state.log.push(record);
        }
    }

    /// The OS process is gone; output may still be draining.
    async fn on_reaped(&self) {
        self.state.lock().await.running = false;
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Resolves once the OS process has been reaped.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.exited_rx.clone();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    async fn on_exit(&self, exit_record: String) {
        let mut state = self.state.lock().await;
        state.log.push(exit_record);
        state.running = false;
        state.exited = true;
        if let Some(timer) = state.kill_timer.take() {
            timer.abort();
        }
    }

    async fn summary(&self) -> ScriptSummary {
        ScriptSummary {
            pid: self.pid,
            command: self.command.clone(),
            effective_port: self.effective_port,
            requested_port: self.requested_port,
            working_dir: self.working_dir.clone(),
            started_at: self.started_at,
            running: self.is_running().await,
        }
    }
}

/// Result of a successful `execute`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOutcome {
    pub pid: u32,
    pub effective_port: u16,
    pub port_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputChunk {
    pub output: Vec<String>,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSummary {
    pub pid: u32,
    pub command: String,
    pub effective_port: u16,
    pub requested_port: u16,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub running: bool,
}

// ─── Script Registry ─────────────────────────────────────────

#[derive(Clone)]
pub struct ScriptRegistry {
    scripts: Arc<Mutex<HashMap<u32, Arc<ScriptEntry>>>>,
    reserved_port: u16,
    kill_grace: Duration,
}

impl ScriptRegistry {
    /// `reserved_port` is the core's own server port; scripts never get it.
    pub fn new(reserved_port: u16, kill_grace: Duration) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            reserved_port,
            kill_grace,
        }
    }

    pub fn reserved_port(&self) -> u16 {
        self.reserved_port
    }

    /// Spawn `command` with `PORT` set, moving it to a free port if the
    /// requested one is reserved or taken.
    pub async fn execute(
        &self,
        command: &str,
        requested_port: u16,
        working_dir: Option<&Path>,
    ) -> CoreResult<ExecuteOutcome> {
        let (program, args) = utils::split_command(command)
            .ok_or_else(|| CoreError::InvalidInput("Script command is empty".to_string()))?;

        let (effective_port, port_message) = self.resolve_port(requested_port)?;

        let working_dir = match working_dir {
            Some(dir) if dir.is_dir() => dir.to_path_buf(),
            Some(dir) => return Err(CoreError::InvalidWorkingDirectory(dir.display().to_string())),
            None => std::env::current_dir()?,
        };

        let args = if effective_port != requested_port {
            utils::substitute_port(&args, requested_port, effective_port)
        } else {
            args
        };

        let mut cmd = TokioCommand::new(&program);
        cmd.args(&args)
            .current_dir(&working_dir)
            .env("PORT", effective_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        utils::apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|source| CoreError::SpawnFailed { program: program.clone(), source })?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Spawned process '{}' has no PID", program))?;

        let (control_tx, control_rx) = mpsc::channel::<Control>(8);
        let (exited_tx, exited_rx) = watch::channel(false);

        let entry = Arc::new(ScriptEntry {
            pid,
            command: command.to_string(),
            effective_port,
            requested_port,
            working_dir,
            started_at: Utc::now(),
            state: Mutex::new(ScriptState {
                log: OutputLog::new(),
                running: true,
                exited: false,
                kill_timer: None,
            }),
            control: control_tx,
            exited_rx,
        });

        // Registered before any output can arrive
        self.scripts.lock().await.insert(pid, entry.clone());
        tracing::info!(
            "Script '{}' started with PID {} on port {}",
            command,
            pid,
            effective_port
        );

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, entry.clone(), ""));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, entry.clone(), STDERR_PREFIX));
        }
        tokio::spawn(supervise(child, entry, control_rx, exited_tx, readers));

        Ok(ExecuteOutcome { pid, effective_port, port_message })
    }

    fn resolve_port(&self, requested: u16) -> CoreResult<(u16, Option<String>)> {
        let reason = if requested == self.reserved_port {
            "reserved by LocalWrap"
        } else if !port::is_available(requested as i64) {
            "already in use"
        } else {
            return Ok((requested, None));
        };

        let start = requested.checked_add(1).unwrap_or(requested);
        let effective = port::find_available(start, Some(self.reserved_port))?;
        let message = format!(
            "Port {} is {}, using port {} instead",
            requested, reason, effective
        );
        tracing::info!("{}", message);
        Ok((effective, Some(message)))
    }

    /// Cooperative termination now, forced kill after the grace period.
    ///
    /// Marks the entry stopped immediately without waiting for the
    /// process to die.
    pub async fn stop(&self, pid: u32) -> CoreResult<()> {
        let entry = self.get(pid).await.ok_or(CoreError::ScriptNotFound(pid))?;

        {
            let mut state = entry.state.lock().await;
            if !state.running {
                return Err(CoreError::ScriptNotRunning(pid));
            }
            state.running = false;
            state.log.push(TERMINATED_BY_USER.to_string());
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if entry.control.send(Control::Terminate(ack_tx)).await.is_ok() {
            if let Ok(Err(e)) = ack_rx.await {
                tracing::warn!("Failed to signal PID {}: {}", pid, e);
            }
        }

        let control = entry.control.clone();
        let grace = self.kill_grace;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = control.send(Control::Kill).await;
        });

        let mut state = entry.state.lock().await;
        if state.exited {
            timer.abort();
        } else {
            state.kill_timer = Some(timer);
        }

        tracing::info!("Script PID {} terminated by user", pid);
        Ok(())
    }

    /// New records since the last call, plus the running flag.
    pub async fn output(&self, pid: u32) -> CoreResult<OutputChunk> {
        let entry = self.get(pid).await.ok_or(CoreError::ScriptNotFound(pid))?;
        let mut state = entry.state.lock().await;
        Ok(OutputChunk {
            output: state.log.drain_new(),
            running: state.running,
        })
    }

    /// Whole retained log without moving the cursor.
    pub async fn full_output(&self, pid: u32) -> CoreResult<OutputChunk> {
        let entry = self.get(pid).await.ok_or(CoreError::ScriptNotFound(pid))?;
        let state = entry.state.lock().await;
        Ok(OutputChunk {
            output: state.log.snapshot(),
            running: state.running,
        })
    }

    pub async fn get(&self, pid: u32) -> Option<Arc<ScriptEntry>> {
        self.scripts.lock().await.get(&pid).cloned()
    }

    pub async fn list(&self) -> Vec<ScriptSummary> {
        let entries: Vec<Arc<ScriptEntry>> = self.scripts.lock().await.values().cloned().collect();
        let mut list = Vec::with_capacity(entries.len());
        for entry in entries {
            list.push(entry.summary().await);
        }
        list.sort_by_key(|s| s.pid);
        list
    }

    /// A running script currently bound to `port`, if any.
    pub async fn find_running_by_port(&self, port: u16) -> Option<ScriptSummary> {
        for summary in self.list().await {
            if summary.running && summary.effective_port == port {
                return Some(summary);
            }
        }
        None
    }

    /// Drop entries whose process has exited.
    pub async fn cleanup_finished(&self) -> usize {
        let entries: Vec<Arc<ScriptEntry>> = self.scripts.lock().await.values().cloned().collect();
        let mut finished = Vec::new();
        for entry in entries {
            if entry.state.lock().await.exited {
                finished.push(entry.pid);
            }
        }

        let mut map = self.scripts.lock().await;
        for pid in &finished {
            map.remove(pid);
            tracing::info!("Cleaning up finished script PID {}", pid);
        }
        finished.len()
    }

    /// Terminate everything still running, wait for the processes to go
    /// away, then clear the registry.
    pub async fn shutdown_all(&self) {
        let entries: Vec<Arc<ScriptEntry>> = self.scripts.lock().await.values().cloned().collect();

        for entry in &entries {
            if entry.is_running().await {
                if let Err(e) = self.stop(entry.pid).await {
                    tracing::warn!("Failed to stop script PID {}: {}", entry.pid, e);
                }
            }
        }

        let deadline = self.kill_grace + READER_DRAIN_TIMEOUT;
        for entry in &entries {
            if tokio::time::timeout(deadline, entry.wait_for_exit()).await.is_err() {
                tracing::warn!("Script PID {} did not exit before shutdown", entry.pid);
            }
        }

        self.scripts.lock().await.clear();
    }
}

// ─── Tasks ───────────────────────────────────────────────────

fn spawn_reader<R>(stream: R, entry: Arc<ScriptEntry>, prefix: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(&['\r', '\n'][..]);
                    if line.trim().is_empty() {
                        continue;
                    }
                    entry.append(format!("{}{}", prefix, line)).await;
                }
            }
        }
    })
}

/// Owns the child: applies control messages and records the exit.
async fn supervise(
    mut child: Child,
    entry: Arc<ScriptEntry>,
    mut control_rx: mpsc::Receiver<Control>,
    exited_tx: watch::Sender<bool>,
    readers: Vec<JoinHandle<()>>,
) {
    let pid = entry.pid;
    let exit_record = loop {
        tokio::select! {
            status = child.wait() => break exit_message(status),
            Some(control) = control_rx.recv() => match control {
                Control::Terminate(ack) => {
                    let result = match child.id() {
                        Some(id) => utils::send_terminate(id),
                        None => Ok(()),
                    };
                    let _ = ack.send(result);
                }
                Control::Kill => {
                    tracing::warn!("PID {} still alive after grace period, killing", pid);
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill PID {}: {}", pid, e);
                    }
                }
            },
        }
    };

    // A late `stop` must see the script as finished from here on
    entry.on_reaped().await;

    // Pipes stay open while a background grandchild holds them
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            tracing::debug!("PID {}: output still open after exit, dropping reader", pid);
            reader.abort();
        }
    }

    tracing::info!("Script PID {}: {}", pid, exit_record);
    entry.on_exit(exit_record).await;
    let _ = exited_tx.send(true);
}

fn exit_message(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("Process exited with code {}", code),
            None => "Process exited due to a signal".to_string(),
        },
        Err(e) => format!("Failed to wait for process: {}", e),
    }
}

// ─── Tests ───────────────────────────────────────────────────
