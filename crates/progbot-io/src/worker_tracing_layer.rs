//! Custom tracing layer for the worker subprocess.
//!
//! Ships structured tracing events over the result stream to the supervisor,
//! preserving target and level. Optionally also writes them to stderr for
//! direct debugging (`PROGBOT_WORKER_DIRECT_LOG=1`).

use std::io::Write;

use tokio::sync::mpsc;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::protocol::WorkerResponse;

/// Events from the codec itself are never shipped, or encoding a log frame
/// would emit another log frame.
const SUPPRESSED_TARGET_PREFIX: &str = "progbot_io::bridge";

pub struct WorkerTracingLayer {
    tx: mpsc::Sender<WorkerResponse>,
    direct_log: bool,
}

impl WorkerTracingLayer {
    pub fn new(tx: mpsc::Sender<WorkerResponse>) -> Self {
        let direct_log = std::env::var("PROGBOT_WORKER_DIRECT_LOG").as_deref() == Ok("1");
        Self { tx, direct_log }
    }

    fn level_to_string(level: &Level) -> &'static str {
        match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(SUPPRESSED_TARGET_PREFIX) {
            return;
        }
        let level = Self::level_to_string(metadata.level());

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.finish();

        if self.direct_log {
            let _ = writeln!(
                std::io::stderr().lock(),
                "worker_direct_log::{} [{}] {}",
                target,
                level,
                message
            );
        }

        // A full log queue drops the event rather than stall the driver thread.
        let _ = self.tx.try_send(WorkerResponse::WorkerLog {
            target: target.to_string(),
            level: level.to_string(),
            message,
        });
    }
}

/// Collects the message plus any structured fields as `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture_logs(emit: impl FnOnce()) -> Vec<WorkerResponse> {
        let (tx, mut rx) = mpsc::channel(16);
        let subscriber = tracing_subscriber::registry().with(WorkerTracingLayer::new(tx));
        tracing::subscriber::with_default(subscriber, emit);

        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn ships_message_with_fields() {
        let logs = capture_logs(|| {
            tracing::warn!(target: "progbot_io::driver", attempt = 2, "Capture failed");
        });

        assert_eq!(logs.len(), 1);
        match &logs[0] {
            WorkerResponse::WorkerLog {
                target,
                level,
                message,
            } => {
                assert_eq!(target, "progbot_io::driver");
                assert_eq!(level, "warn");
                assert_eq!(message, "Capture failed attempt=2");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn codec_events_are_not_shipped() {
        let logs = capture_logs(|| {
            tracing::debug!(target: "progbot_io::bridge::codec", "Large frame being encoded");
        });
        assert!(logs.is_empty());
    }
}
