//! Peripheral supervisor - owns the worker subprocess and its lifecycle.
//!
//! Flow:
//! 1. Spawn worker subprocess (stdin = command stream, stdout = result stream)
//! 2. Register its pid with the application's ProcessRegistry
//! 3. Route commands out and results back through two bounded queues
//! 4. On stop: stop flag, then SIGTERM, then SIGKILL, 200 ms apart
//!
//! Nothing that happens inside the worker reaches the caller as an error:
//! crashes, hangs, timeouts and error results all come back as `None`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    Command, CommandId, DEFAULT_SCAN_RETRIES, DriverMode, Outcome, QUEUE_DEPTH, Reply, ScanHit,
    WorkerRequest, WorkerResponse,
};
use crate::frame::Frame;
use crate::registry::ProcessRegistry;
use crate::state::WorkerState;

/// Wait bound for each rung of the escalation ladder.
pub const STOP_GRACE: Duration = Duration::from_millis(200);
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// `shutdown()` gives the driver this long to release before escalating.
pub const SHUTDOWN_CLEANUP_TIMEOUT: Duration = Duration::from_millis(300);

const REGISTRY_LABEL: &str = "peripheral-worker";

#[derive(Debug, Clone, Default)]
pub struct WorkerSpawnConfig {
    /// Extra environment for the worker process.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The child must have piped stdin and stdout.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Spawns an arbitrary program as the worker.
pub struct ProgramSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProgramSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl WorkerSpawner for ProgramSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let child = ProcessCommand::new(&self.program)
            .args(&self.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Re-executes the current binary with the `worker` subcommand.
pub struct SelfExecSpawner;

impl WorkerSpawner for SelfExecSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let exe = std::env::current_exe()
            .map_err(|e| SpawnError::Other(format!("cannot locate current executable: {}", e)))?;
        ProgramSpawner::new(exe).arg("worker").spawn(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub struct SupervisorConfig {
    pub stop_grace: Duration,
    pub enqueue_timeout: Duration,
    pub command_timeout: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub env: Vec<(String, String)>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self {
            stop_grace: STOP_GRACE,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            spawner: Arc::new(SelfExecSpawner),
            env: Vec::new(),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Shared stop flag. Set by the supervisor, observed by the command writer,
/// which forwards it to the worker as an out-of-band Stop frame.
#[derive(Debug, Clone)]
pub struct StopFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Everything tied to one live worker process.
struct WorkerLink {
    child: Child,
    pid: u32,
    commands: mpsc::Sender<WorkerRequest>,
    results: mpsc::Receiver<(CommandId, Outcome)>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl WorkerLink {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait up to `grace` for the worker to exit.
    async fn exited_within(&mut self, grace: Duration) -> bool {
        matches!(
            tokio::time::timeout(grace, self.child.wait()).await,
            Ok(Ok(_))
        )
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Ok(raw) = i32::try_from(self.pid)
                && let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM)
            {
                tracing::debug!(pid = self.pid, error = %e, "SIGTERM failed");
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.start_kill() {
                tracing::debug!(pid = self.pid, error = %e, "Terminate failed");
            }
        }
    }
}

/// Supervises one isolated peripheral worker.
pub struct PeripheralSupervisor {
    config: SupervisorConfig,
    registry: ProcessRegistry,
    state: WorkerState,
    stop_flag: StopFlag,
    link: Option<WorkerLink>,
}

impl PeripheralSupervisor {
    pub fn new(config: SupervisorConfig, registry: ProcessRegistry) -> Self {
        Self {
            config,
            registry,
            state: WorkerState::Stopped,
            stop_flag: StopFlag::new(),
            link: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.link.as_ref().map(|link| link.pid)
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop_flag
    }

    pub fn is_worker_alive(&mut self) -> bool {
        self.link.as_mut().is_some_and(WorkerLink::is_alive)
    }

    /// Start the worker. A no-op while a live worker is running; a dead one is
    /// reaped with `stop()` first.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.link.is_some() {
            if self.is_worker_alive() {
                tracing::debug!(pid = ?self.pid(), "Worker already running");
                return Ok(());
            }
            tracing::warn!(pid = ?self.pid(), "Worker died, restarting");
            self.stop().await;
        }

        self.state = WorkerState::Starting;
        match self.spawn_link() {
            Ok(link) => {
                self.registry.register(link.pid, REGISTRY_LABEL);
                tracing::info!(pid = link.pid, "Peripheral worker started");
                self.link = Some(link);
                self.state = WorkerState::Running;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start peripheral worker");
                self.state = WorkerState::Stopped;
                Err(e)
            }
        }
    }

    fn spawn_link(&self) -> Result<WorkerLink, SupervisorError> {
        let spawn_config = WorkerSpawnConfig {
            env: self.config.env.clone(),
        };
        let mut child = self.config.spawner.spawn(&spawn_config)?;

        let (stdin, stdout, pid) = match (child.stdin.take(), child.stdout.take(), child.id()) {
            (Some(stdin), Some(stdout), Some(pid)) => (stdin, stdout, pid),
            _ => {
                let _ = child.start_kill();
                return Err(SupervisorError::Protocol(
                    "worker pipes not captured or worker already exited".to_string(),
                ));
            }
        };

        let (command_tx, command_rx) = mpsc::channel(QUEUE_DEPTH);
        let (result_tx, result_rx) = mpsc::channel(QUEUE_DEPTH);

        let writer_task = tokio::spawn(forward_commands(
            FramedWrite::new(stdin, JsonCodec::<WorkerRequest>::new()),
            command_rx,
            self.stop_flag.subscribe(),
        ));
        let reader_task = tokio::spawn(route_responses(
            FramedRead::new(stdout, JsonCodec::<WorkerResponse>::new()),
            result_tx,
            pid,
        ));

        Ok(WorkerLink {
            child,
            pid,
            commands: command_tx,
            results: result_rx,
            writer_task,
            reader_task,
        })
    }

    /// Stop the worker. Always returns, within three grace periods plus reaping.
    pub async fn stop(&mut self) {
        let Some(mut link) = self.link.take() else {
            self.stop_flag.clear();
            self.state = WorkerState::Stopped;
            return;
        };

        self.state = WorkerState::Stopping;
        let pid = link.pid;
        let grace = self.config.stop_grace;

        self.stop_flag.set();
        let mut exited = link.exited_within(grace).await;

        if !exited {
            tracing::info!(pid, "Worker ignored stop flag, sending SIGTERM");
            link.terminate();
            exited = link.exited_within(grace).await;
        }

        if !exited {
            tracing::warn!(pid, "Worker ignored SIGTERM, killing");
            if let Err(e) = link.child.start_kill() {
                tracing::debug!(pid, error = %e, "Kill failed");
            }
            exited = link.exited_within(grace).await;
        }

        if !exited {
            tracing::error!(pid, "ProcessUnresponsive: worker survived SIGKILL, abandoning it");
        }

        self.registry.unregister(pid);

        link.writer_task.abort();
        link.reader_task.abort();
        let mut discarded = 0;
        while link.results.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(pid, discarded, "Discarded unread worker results");
        }
        drop(link);

        self.stop_flag.clear();
        self.state = WorkerState::Stopped;
        tracing::info!(pid, "Peripheral worker stopped");
    }

    /// Send a command and wait up to `timeout` for its result.
    ///
    /// Returns `None` on queue full, timeout, closed channel, a stopped
    /// supervisor or an error result. Each case is logged.
    pub async fn send_command(&mut self, command: Command, timeout: Duration) -> Option<Reply> {
        let name = command.name();
        let Some(link) = self.link.as_mut() else {
            tracing::warn!(command = name, "Worker not started");
            return None;
        };

        let id = CommandId::new();
        match link
            .commands
            .send_timeout(command.into_request(id), self.config.enqueue_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::error!(command = name, "Command queue full");
                return None;
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::error!(command = name, "Command channel closed");
                return None;
            }
        }

        let results = &mut link.results;
        let matching = async {
            loop {
                match results.recv().await {
                    None => return None,
                    Some((result_id, _)) if result_id != id => {
                        tracing::warn!(command = name, stale = %result_id, "Discarding late result");
                    }
                    Some((_, outcome)) => return Some(outcome),
                }
            }
        };

        // One timeout around the whole wait; `Duration::MAX` waits indefinitely.
        match tokio::time::timeout(timeout, matching).await {
            Err(_) => {
                tracing::warn!(command = name, ?timeout, "Timed out waiting for worker result");
                None
            }
            Ok(None) => {
                tracing::error!(command = name, "Result channel closed (worker exited?)");
                None
            }
            Ok(Some(Outcome::Ok(reply))) => Some(reply),
            Ok(Some(Outcome::Error(error))) => {
                tracing::warn!(command = name, %error, "Worker returned error");
                None
            }
        }
    }

    /// Bring the camera up. Returns the driver kind in use.
    pub async fn init_driver(&mut self, mode: DriverMode) -> Option<String> {
        let timeout = self.config.command_timeout;
        match self.send_command(Command::Init { mode }, timeout).await? {
            Reply::Init { driver_kind, .. } => Some(driver_kind),
            other => unexpected_reply("init", other),
        }
    }

    pub async fn capture(&mut self) -> Option<Frame> {
        let timeout = self.config.command_timeout;
        match self.send_command(Command::Capture, timeout).await? {
            Reply::Capture(payload) => Frame::try_from(payload)
                .map_err(|e| tracing::warn!(error = %e, "Worker sent malformed frame"))
                .ok(),
            other => unexpected_reply("capture", other),
        }
    }

    pub async fn scan(&mut self, retries: Option<u32>) -> Option<ScanHit> {
        let timeout = self.config.command_timeout;
        let retries = retries.unwrap_or(DEFAULT_SCAN_RETRIES);
        match self.send_command(Command::Scan { retries }, timeout).await? {
            Reply::Scan(hit) => Some(hit),
            other => unexpected_reply("scan", other),
        }
    }

    /// Ask the worker to release the camera. The worker exits after answering.
    pub async fn cleanup(&mut self, timeout: Duration) -> bool {
        matches!(
            self.send_command(Command::Cleanup, timeout).await,
            Some(Reply::Cleanup { success: true })
        )
    }

    /// Release the camera if the worker answers quickly, then stop it.
    pub async fn shutdown(&mut self) {
        if self.is_worker_alive() && !self.cleanup(SHUTDOWN_CLEANUP_TIMEOUT).await {
            tracing::warn!("Camera cleanup did not complete before shutdown");
        }
        self.stop().await;
    }
}

impl Drop for PeripheralSupervisor {
    fn drop(&mut self) {
        if let Some(mut link) = self.link.take() {
            tracing::warn!(pid = link.pid, "Supervisor dropped with live worker, killing");
            let _ = link.child.start_kill();
            link.writer_task.abort();
            link.reader_task.abort();
            self.registry.unregister(link.pid);
        }
    }
}

fn unexpected_reply<T>(command: &str, reply: Reply) -> Option<T> {
    tracing::error!(command, ?reply, "Worker answered with the wrong reply type");
    None
}

async fn forward_commands(
    mut writer: FramedWrite<ChildStdin, JsonCodec<WorkerRequest>>,
    mut commands: mpsc::Receiver<WorkerRequest>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            stopped = stop.wait_for(|set| *set).map(|res| res.is_ok()) => {
                if stopped {
                    tracing::trace!("Forwarding stop signal to worker");
                    let _ = writer.send(WorkerRequest::Stop).await;
                }
                break;
            }

            request = commands.recv() => match request {
                Some(request) => {
                    if let Err(e) = writer.send(request).await {
                        tracing::warn!(error = %e, "Failed to write command to worker");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    tracing::trace!("Command writer exiting");
}

async fn route_responses(
    mut reader: FramedRead<ChildStdout, JsonCodec<WorkerResponse>>,
    results: mpsc::Sender<(CommandId, Outcome)>,
    pid: u32,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(WorkerResponse::Result { id, outcome }) => {
                if results.send((id, outcome)).await.is_err() {
                    break;
                }
            }
            Ok(WorkerResponse::WorkerLog {
                target,
                level,
                message,
            }) => emit_worker_log(pid, &target, &level, &message),
            Ok(WorkerResponse::Ready { pid: worker_pid }) => {
                tracing::debug!(pid = worker_pid, "Worker ready");
            }
            Ok(WorkerResponse::Fatal { reason }) => {
                tracing::error!(pid, %reason, "Worker fatal");
            }
            Err(e) => {
                tracing::error!(pid, error = %e, "Result stream error");
                break;
            }
        }
    }
    tracing::debug!(pid, "Result stream closed");
}

/// Re-emit a worker log event under the `progbot::worker` target.
fn emit_worker_log(pid: u32, target: &str, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "progbot::worker", pid, source = target, "{}", message),
        "warn" => tracing::warn!(target: "progbot::worker", pid, source = target, "{}", message),
        "debug" => tracing::debug!(target: "progbot::worker", pid, source = target, "{}", message),
        "trace" => tracing::trace!(target: "progbot::worker", pid, source = target, "{}", message),
        _ => tracing::info!(target: "progbot::worker", pid, source = target, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_set_and_clear() {
        let flag = StopFlag::new();
        let other = flag.clone();
        assert!(!flag.is_set());

        other.set();
        assert!(flag.is_set());
        flag.clear();
        assert!(!other.is_set());
    }

    #[tokio::test]
    async fn stop_flag_wakes_subscribers() {
        let flag = StopFlag::new();
        let mut rx = flag.subscribe();
        let waiter = tokio::spawn(async move { rx.wait_for(|set| *set).await.is_ok() });

        flag.set();
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn config_builder() {
        let config = SupervisorConfig::new()
            .with_enqueue_timeout(Duration::from_millis(50))
            .with_command_timeout(Duration::from_secs(2))
            .with_env("PROGBOT_SYNTHETIC_CODE", "X");

        assert_eq!(config.stop_grace, STOP_GRACE);
        assert_eq!(config.enqueue_timeout, Duration::from_millis(50));
        assert_eq!(config.command_timeout, Duration::from_secs(2));
        assert_eq!(config.env, vec![("PROGBOT_SYNTHETIC_CODE".to_string(), "X".to_string())]);
    }

    #[tokio::test]
    async fn send_without_worker_returns_none() {
        let mut supervisor =
            PeripheralSupervisor::new(SupervisorConfig::new(), ProcessRegistry::new());
        assert!(
            supervisor
                .send_command(Command::Capture, Duration::from_millis(50))
                .await
                .is_none()
        );
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn stop_without_worker_is_noop() {
        let mut supervisor =
            PeripheralSupervisor::new(SupervisorConfig::new(), ProcessRegistry::new());
        supervisor.stop_flag().set();
        supervisor.stop().await;

        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert!(!supervisor.stop_flag().is_set());
    }

    /// Worker stand-in: a real process plus hand-held ends of both queues.
    #[cfg(unix)]
    struct FakeWorker {
        registry: ProcessRegistry,
        commands: mpsc::Receiver<WorkerRequest>,
        results: mpsc::Sender<(CommandId, Outcome)>,
    }

    #[cfg(unix)]
    fn fake_worker(config: SupervisorConfig) -> (PeripheralSupervisor, FakeWorker) {
        let child = ProcessCommand::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let (command_tx, command_rx) = mpsc::channel(QUEUE_DEPTH);
        let (result_tx, result_rx) = mpsc::channel(QUEUE_DEPTH);

        let registry = ProcessRegistry::new();
        let mut supervisor = PeripheralSupervisor::new(config, registry.clone());
        supervisor.link = Some(WorkerLink {
            child,
            pid,
            commands: command_tx,
            results: result_rx,
            writer_task: tokio::spawn(async {}),
            reader_task: tokio::spawn(async {}),
        });
        supervisor.state = WorkerState::Running;
        registry.register(pid, REGISTRY_LABEL);

        let worker = FakeWorker {
            registry,
            commands: command_rx,
            results: result_tx,
        };
        (supervisor, worker)
    }

    #[cfg(unix)]
    fn request_id(request: WorkerRequest) -> CommandId {
        match request {
            WorkerRequest::Command { id, .. } => id,
            WorkerRequest::Stop => panic!("expected a command"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn full_command_queue_returns_none_within_enqueue_timeout() {
        let (mut supervisor, worker) = fake_worker(
            SupervisorConfig::new().with_enqueue_timeout(Duration::from_millis(100)),
        );

        // Nobody drains the command queue, so the next send can only time out.
        let commands = supervisor.link.as_ref().unwrap().commands.clone();
        for _ in 0..QUEUE_DEPTH {
            commands.try_send(WorkerRequest::Stop).unwrap();
        }

        let started = std::time::Instant::now();
        let reply = supervisor
            .send_command(Command::Capture, Duration::from_secs(10))
            .await;
        assert!(reply.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        supervisor.stop().await;
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert!(worker.registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unbounded_wait_on_closed_results_returns_none() {
        let (mut supervisor, worker) = fake_worker(SupervisorConfig::new());
        let FakeWorker {
            registry,
            commands: _commands,
            results,
        } = worker;
        drop(results);

        let reply = supervisor
            .send_command(Command::Capture, Duration::MAX)
            .await;
        assert!(reply.is_none());

        supervisor.stop().await;
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn late_result_from_abandoned_command_is_skipped() {
        let (mut supervisor, mut worker) = fake_worker(SupervisorConfig::new());

        let responder = tokio::spawn(async move {
            let id = request_id(worker.commands.recv().await.unwrap());
            worker
                .results
                .send((CommandId::new(), Outcome::Ok(Reply::Cleanup { success: true })))
                .await
                .unwrap();
            worker
                .results
                .send((
                    id,
                    Outcome::Ok(Reply::Init {
                        success: true,
                        driver_kind: "fake".to_string(),
                    }),
                ))
                .await
                .unwrap();
            worker
        });

        let reply = supervisor
            .send_command(
                Command::Init {
                    mode: DriverMode::Primary,
                },
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(
            reply,
            Some(Reply::Init {
                success: true,
                driver_kind: "fake".to_string()
            })
        );

        let _worker = responder.await.unwrap();
        supervisor.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn only_late_results_time_out_to_none() {
        let (mut supervisor, mut worker) = fake_worker(SupervisorConfig::new());

        let responder = tokio::spawn(async move {
            let _ = request_id(worker.commands.recv().await.unwrap());
            worker
                .results
                .send((CommandId::new(), Outcome::Ok(Reply::Cleanup { success: true })))
                .await
                .unwrap();
            worker
        });

        let started = std::time::Instant::now();
        let reply = supervisor
            .send_command(Command::Capture, Duration::from_millis(300))
            .await;
        assert!(reply.is_none());
        assert!(started.elapsed() >= Duration::from_millis(300));

        // Keep the result sender alive until the wait has timed out.
        let _worker = responder.await.unwrap();
        supervisor.stop().await;
    }
}
