//! Wire protocol types for supervisor-worker communication.
//!
//! Two streams, both length-prefixed JSON frames:
//! - **Command stream** (worker stdin): Command requests and the Stop signal
//! - **Result stream** (worker stdout): Command results, forwarded logs, Ready/Fatal

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Depth of both the command and the result queue. A full queue is reported
/// to the caller, never waited on indefinitely.
pub const QUEUE_DEPTH: usize = 10;

/// How often the worker loop wakes to check the stop flag when idle.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Unique identifier for one command exchange.
///
/// Results carry the id of the command they answer so the supervisor can tell
/// a late result (from an abandoned wait) apart from the one it is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(uuid::Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which camera driver the worker should bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    /// The board camera (CSI) driver.
    Primary,
    /// A generic capture device selected by index.
    Device { index: u32 },
}

/// Default attempt count for `scan` when the caller passes no argument.
pub const DEFAULT_SCAN_RETRIES: u32 = 3;

/// Commands understood by the peripheral worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init { mode: DriverMode },
    Capture,
    Scan { retries: u32 },
    /// Release driver resources. The worker loop exits after answering.
    Cleanup,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Capture => "capture",
            Self::Scan { .. } => "scan",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::Init { mode } => vec![serde_json::to_value(mode).unwrap_or(Value::Null)],
            Self::Scan { retries } => vec![Value::from(*retries)],
            Self::Capture | Self::Cleanup => Vec::new(),
        }
    }

    /// Rebuild a command from its wire name and positional arguments.
    ///
    /// The error string is sent back verbatim as the `{error}` result.
    pub fn parse(name: &str, args: &[Value]) -> Result<Self, String> {
        match name {
            "init" => {
                let mode = match args.first() {
                    Some(value) => serde_json::from_value(value.clone())
                        .map_err(|e| format!("invalid init mode: {}", e))?,
                    None => DriverMode::Primary,
                };
                Ok(Self::Init { mode })
            }
            "capture" => Ok(Self::Capture),
            "scan" => {
                let retries = match args.first() {
                    Some(value) => value
                        .as_u64()
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| format!("invalid scan retries: {}", value))?,
                    None => DEFAULT_SCAN_RETRIES,
                };
                Ok(Self::Scan { retries })
            }
            "cleanup" => Ok(Self::Cleanup),
            other => Err(format!("unknown command: {}", other)),
        }
    }

    pub fn into_request(self, id: CommandId) -> WorkerRequest {
        WorkerRequest::Command {
            id,
            name: self.name().to_string(),
            args: self.args(),
        }
    }
}

/// Messages from supervisor to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Command {
        id: CommandId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Stop flag raised: the worker leaves its loop at the next poll.
    Stop,
}

/// Messages from worker to supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Driver constructed, command loop running.
    Ready { pid: u32 },

    Result { id: CommandId, outcome: Outcome },

    /// Worker tracing event (structured logging shipped over IPC).
    WorkerLog {
        target: String,
        level: String,
        message: String,
    },

    /// Worker cannot continue (driver construction failed). It exits after sending this.
    Fatal { reason: String },
}

/// Result of one command: a payload or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Reply),
    Error(String),
}

impl Outcome {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl<E: std::fmt::Display> From<Result<Reply, E>> for Outcome {
    fn from(result: Result<Reply, E>) -> Self {
        match result {
            Ok(reply) => Self::Ok(reply),
            Err(e) => Self::Error(e.to_string()),
        }
    }
}

/// Command-specific success payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Init { success: bool, driver_kind: String },
    Capture(FramePayload),
    Scan(ScanHit),
    Cleanup { success: bool },
}

/// Raw frame as shipped across the process boundary.
///
/// Pixels travel as one base64 string plus shape/dtype metadata rather than a
/// nested JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    #[serde(with = "frame_bytes")]
    pub frame_bytes: Vec<u8>,
    /// `[height, width]` or `[height, width, channels]`.
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// Which decoder produced a scan hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// Full-size symbol decoder.
    Primary,
    /// Fallback decoder for the small symbol variant.
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHit {
    pub data: String,
    #[serde(rename = "type")]
    pub kind: SymbolKind,
    /// 1-based index of the frame that decoded.
    pub attempt: u32,
}

mod frame_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
