//! Tracing setup for the station process and the worker subprocess.

use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::protocol::WorkerResponse;
use crate::worker_tracing_layer::WorkerTracingLayer;

/// Log frames buffered between the worker's tracing layer and the result stream.
pub const WORKER_LOG_QUEUE_DEPTH: usize = 500;

fn base_level() -> &'static str {
    match std::env::var("PROGBOT_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    }
}

/// `RUST_LOG` wins; otherwise `PROGBOT_LOG` picks the level for our targets.
fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let filter_str = format!(
            "progbot_io={level},progbot={level},progbot_io::bridge=off",
            level = base_level()
        );
        EnvFilter::new(filter_str)
    }
}

/// Initialize tracing with PROGBOT_LOG and LOG_FORMAT support. Output goes to stderr.
pub fn init_tracing() {
    let filter = env_filter();
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Initialize tracing inside the worker: events are shipped to the supervisor
/// instead of being printed.
///
/// Returns the receiver to hand to `WorkerIo::with_logs`.
pub fn init_worker_tracing() -> mpsc::Receiver<WorkerResponse> {
    let (tx, rx) = mpsc::channel(WORKER_LOG_QUEUE_DEPTH);
    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(WorkerTracingLayer::new(tx));
    let _ = subscriber.try_init();
    rx
}
