//! Worker subprocess - runs the peripheral driver in isolation.
//!
//! This module provides the child side of the worker protocol. The parent side
//! (spawning, escalation ladder, result routing) is in supervisor.rs.
//!
//! Architecture:
//! - Command stream (stdin): Command requests and the Stop signal
//! - Result stream (original stdout, moved off fd 1): Ready, results, logs, Fatal
//!
//! Driver calls run on the blocking pool. The event loop keeps seeing the stop
//! flag and signals while a call is stuck.
//!
//! Two ways out besides a closed channel:
//! - `cleanup` command or Stop signal: the loop exits and the driver is
//!   released (normal path).
//! - SIGTERM/SIGINT: immediate exit without releasing the driver (abort path).
//!   Driver resources are left to the OS; the camera's release call can hang
//!   when the hardware is in a bad state.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    Command, CommandId, Outcome, POLL_INTERVAL, QUEUE_DEPTH, WorkerRequest, WorkerResponse,
};
use crate::driver::{DriverError, PeripheralDriver, dispatch};

type ResultWriter =
    Arc<tokio::sync::Mutex<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<WorkerResponse>>>>;

/// Byte streams the worker talks over, plus an optional feed of log frames.
pub struct WorkerIo {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    logs: Option<mpsc::Receiver<WorkerResponse>>,
}

impl WorkerIo {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            logs: None,
        }
    }

    /// Forward log frames (see `logging::init_worker_tracing`) on the result stream.
    pub fn with_logs(mut self, logs: mpsc::Receiver<WorkerResponse>) -> Self {
        self.logs = Some(logs);
        self
    }
}

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop flag observed.
    Stopped,
    /// `cleanup` command answered.
    CleanedUp,
    /// Supervisor went away (command stream EOF or result stream broken).
    ChannelClosed,
    /// Driver could not be constructed.
    Fatal,
}

impl WorkerExit {
    pub fn code(&self) -> i32 {
        match self {
            Self::Fatal => 1,
            _ => 0,
        }
    }
}

/// Lock the driver, recovering from poison left by a panicked call.
fn lock_driver<D>(driver: &StdMutex<D>) -> MutexGuard<'_, D> {
    match driver.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Driver mutex poisoned by an earlier panic, continuing");
            poisoned.into_inner()
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "driver call cancelled".to_string();
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("driver panicked: {}", detail)
}

async fn send_response(writer: &ResultWriter, response: WorkerResponse) -> io::Result<()> {
    let mut w = writer.lock().await;
    w.send(response).await
}

/// Run the worker event loop.
///
/// Constructs the driver with `factory`, announces Ready, then serves commands
/// until cleanup, the stop signal, or the command stream closing.
pub async fn run_worker<D, F>(factory: F, io: WorkerIo) -> io::Result<WorkerExit>
where
    D: PeripheralDriver,
    F: FnOnce() -> Result<D, DriverError> + Send + 'static,
{
    let WorkerIo {
        reader,
        writer,
        logs,
    } = io;

    let writer: ResultWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        writer,
        JsonCodec::<WorkerResponse>::new(),
    )));

    let log_forwarder = logs.map(|mut rx| {
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if send_response(&writer, msg).await.is_err() {
                    break;
                }
            }
        })
    });

    // Requests are read in their own task so the Stop signal is seen while a
    // command is executing.
    let stop = Arc::new(AtomicBool::new(false));
    let (command_tx, mut command_rx) = mpsc::channel(QUEUE_DEPTH);
    let request_reader = tokio::spawn(read_requests(
        FramedRead::new(reader, JsonCodec::<WorkerRequest>::new()),
        command_tx,
        Arc::clone(&stop),
    ));

    let exit = match tokio::task::spawn_blocking(factory).await {
        Ok(Ok(driver)) => serve(driver, &writer, &mut command_rx, &stop).await,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Driver construction failed");
            let _ = send_response(
                &writer,
                WorkerResponse::Fatal {
                    reason: e.to_string(),
                },
            )
            .await;
            WorkerExit::Fatal
        }
        Err(e) => {
            let reason = panic_message(e);
            tracing::error!(%reason, "Driver construction panicked");
            let _ = send_response(&writer, WorkerResponse::Fatal { reason }).await;
            WorkerExit::Fatal
        }
    };

    request_reader.abort();
    if let Some(forwarder) = log_forwarder {
        forwarder.abort();
    }
    tracing::info!(?exit, "Worker exiting");
    Ok(exit)
}

async fn serve<D: PeripheralDriver>(
    driver: D,
    writer: &ResultWriter,
    commands: &mut mpsc::Receiver<(CommandId, String, Vec<serde_json::Value>)>,
    stop: &AtomicBool,
) -> WorkerExit {
    if let Err(e) = send_response(
        writer,
        WorkerResponse::Ready {
            pid: std::process::id(),
        },
    )
    .await
    {
        tracing::error!(error = %e, "Failed to announce Ready");
        return WorkerExit::ChannelClosed;
    }
    tracing::info!("Worker ready");

    let driver = Arc::new(StdMutex::new(driver));
    let mut released = false;

    let exit = loop {
        if stop.load(Ordering::Acquire) {
            tracing::info!("Stop flag set, leaving command loop");
            break WorkerExit::Stopped;
        }

        let (id, name, args) = match tokio::time::timeout(POLL_INTERVAL, commands.recv()).await {
            Err(_) => continue,
            Ok(Some(request)) => request,
            Ok(None) if stop.load(Ordering::Acquire) => break WorkerExit::Stopped,
            Ok(None) => {
                tracing::warn!("Command stream closed (supervisor died?), exiting");
                break WorkerExit::ChannelClosed;
            }
        };

        let outcome = match Command::parse(&name, &args) {
            Ok(command) => {
                let is_cleanup = command == Command::Cleanup;
                let outcome = execute(&driver, command).await;
                if is_cleanup {
                    released = true;
                    if send_response(writer, WorkerResponse::Result { id, outcome })
                        .await
                        .is_err()
                    {
                        break WorkerExit::ChannelClosed;
                    }
                    break WorkerExit::CleanedUp;
                }
                outcome
            }
            Err(message) => {
                tracing::warn!(command = %name, "Rejecting command");
                Outcome::Error(message)
            }
        };

        if let Err(e) = send_response(writer, WorkerResponse::Result { id, outcome }).await {
            tracing::error!(error = %e, "Result stream broken, exiting");
            break WorkerExit::ChannelClosed;
        }
    };

    if !released {
        let driver = Arc::clone(&driver);
        let result = tokio::task::spawn_blocking(move || lock_driver(&driver).release()).await;
        match result {
            Ok(Ok(())) => tracing::debug!("Driver released"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Driver release failed"),
            Err(e) => tracing::warn!(error = %panic_message(e), "Driver release failed"),
        }
    }

    exit
}

async fn execute<D: PeripheralDriver>(driver: &Arc<StdMutex<D>>, command: Command) -> Outcome {
    let name = command.name();
    tracing::debug!(command = name, "Executing command");

    let driver = Arc::clone(driver);
    let joined = tokio::task::spawn_blocking(move || {
        let mut guard = lock_driver(&driver);
        dispatch(&mut *guard, command)
    })
    .await;

    match joined {
        Ok(Ok(reply)) => Outcome::Ok(reply),
        Ok(Err(e)) => {
            tracing::debug!(command = name, error = %e, "Command failed");
            Outcome::error(e.to_string())
        }
        Err(e) => {
            let message = panic_message(e);
            tracing::error!(command = name, error = %message, "Command panicked");
            Outcome::Error(message)
        }
    }
}

async fn read_requests(
    mut reader: FramedRead<Box<dyn AsyncRead + Send + Unpin>, JsonCodec<WorkerRequest>>,
    tx: mpsc::Sender<(CommandId, String, Vec<serde_json::Value>)>,
    stop: Arc<AtomicBool>,
) {
    loop {
        match reader.next().await {
            Some(Ok(WorkerRequest::Command { id, name, args })) => {
                tracing::trace!(%id, command = %name, "Command received");
                if tx.send((id, name, args)).await.is_err() {
                    break;
                }
            }
            Some(Ok(WorkerRequest::Stop)) => {
                tracing::debug!("Stop signal received");
                stop.store(true, Ordering::Release);
                break;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Command stream error");
                break;
            }
            None => {
                tracing::trace!("Command stream closed");
                break;
            }
        }
    }
}

/// Abort transition: SIGTERM/SIGINT exit immediately without releasing the driver.
///
/// Must be called from within the runtime.
#[cfg(unix)]
pub fn install_abort_handlers() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        };
        tracing::warn!(signal = name, "Worker aborting without driver release");
        std::process::exit(0);
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn install_abort_handlers() -> io::Result<()> {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Worker aborting without driver release");
            std::process::exit(0);
        }
    });
    Ok(())
}

/// Entry point for the `worker` subcommand: serve on stdin and the original stdout.
pub async fn run_stdio_worker<D, F>(
    factory: F,
    logs: Option<mpsc::Receiver<WorkerResponse>>,
) -> io::Result<WorkerExit>
where
    D: PeripheralDriver,
    F: FnOnce() -> Result<D, DriverError> + Send + 'static,
{
    install_abort_handlers()?;

    let mut io = match crate::fd_redirect::isolate_result_stream() {
        Ok(results) => WorkerIo::new(tokio::io::stdin(), tokio::fs::File::from_std(results)),
        Err(e) => {
            tracing::warn!(error = %e, "Serving results on stdout without isolation");
            WorkerIo::new(tokio::io::stdin(), tokio::io::stdout())
        }
    };
    if let Some(logs) = logs {
        io = io.with_logs(logs);
    }
    run_worker(factory, io).await
}
