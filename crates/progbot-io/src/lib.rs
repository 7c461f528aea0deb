//! progbot-io: peripheral isolation and serial command channels for the test station.
//!
//! - [`SerialLink`]: line-oriented request/response over a serial port
//! - [`PeripheralSupervisor`]: camera driver isolated in a worker subprocess

mod fd_redirect;
mod state;
mod worker_tracing_layer;

pub mod bridge;
pub mod config;
pub mod driver;
pub mod frame;
pub mod logging;
pub mod registry;
pub mod serial;
pub mod supervisor;
pub mod worker;

pub use bridge::protocol::{Command, DriverMode, Outcome, Reply, ScanHit, SymbolKind};
pub use config::{CameraConfig, ConfigError, SerialConfig, StationConfig};
pub use driver::{DriverError, PeripheralDriver, SyntheticConfig, SyntheticDriver};
pub use frame::{Frame, FrameError};
pub use registry::{ExitGuard, ProcessRegistry};
pub use serial::{LinkError, SerialLink};
pub use state::WorkerState;
pub use supervisor::{
    PeripheralSupervisor, ProgramSpawner, SelfExecSpawner, SpawnError, StopFlag, SupervisorConfig,
    SupervisorError, WorkerSpawnConfig, WorkerSpawner,
};
pub use worker::{WorkerExit, WorkerIo, run_worker};
