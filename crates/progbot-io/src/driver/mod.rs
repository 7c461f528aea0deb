//! Peripheral driver abstraction used inside the worker process.
//!
//! Implementations talk to the camera hardware directly and are allowed to
//! block (or hang) in any call. They only ever run inside the worker
//! subprocess, where a stuck call costs the supervisor nothing but a
//! stop-ladder escalation.

pub mod synthetic;

use crate::bridge::protocol::{DriverMode, Reply, ScanHit, SymbolKind};
use crate::frame::{Frame, FrameError};

pub use synthetic::{FaultPoint, SyntheticConfig, SyntheticDriver};

/// Errors raised by a peripheral driver. They never leave the worker as
/// anything but an `{error}` result.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no camera initialized")]
    NotInitialized,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Device(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl DriverError {
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }
}

/// Camera acquisition and symbol decoding.
pub trait PeripheralDriver: Send + 'static {
    /// Bring the camera up. Returns the driver kind actually in use.
    fn init(&mut self, mode: DriverMode) -> Result<String, DriverError>;

    fn capture(&mut self) -> Result<Frame, DriverError>;

    /// Full-size symbol decode on a preprocessed (square, grayscale) frame.
    fn decode_primary(&mut self, frame: &Frame) -> Option<String>;

    /// Small-variant decode, tried when the primary decoder finds nothing.
    fn decode_secondary(&mut self, frame: &Frame) -> Result<Option<String>, DriverError>;

    /// Release the camera. Known to hang on some hardware in a bad state.
    fn release(&mut self) -> Result<(), DriverError>;
}

/// Capture up to `retries` frames and return the first successful decode.
pub fn scan<D: PeripheralDriver + ?Sized>(
    driver: &mut D,
    retries: u32,
) -> Result<ScanHit, DriverError> {
    for attempt in 1..=retries {
        let frame = match driver.capture() {
            Ok(frame) => frame,
            Err(DriverError::NotInitialized) => return Err(DriverError::NotInitialized),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Capture failed during scan");
                continue;
            }
        };
        let frame = frame.center_square().to_grayscale();

        if let Some(data) = driver.decode_primary(&frame) {
            return Ok(ScanHit {
                data,
                kind: SymbolKind::Primary,
                attempt,
            });
        }

        match driver.decode_secondary(&frame) {
            Ok(Some(data)) => {
                return Ok(ScanHit {
                    data,
                    kind: SymbolKind::Secondary,
                    attempt,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(attempt, error = %e, "Secondary decoder error"),
        }
    }

    Err(DriverError::NotFound)
}

/// Run one typed command against the driver.
pub(crate) fn dispatch<D: PeripheralDriver + ?Sized>(
    driver: &mut D,
    command: crate::bridge::protocol::Command,
) -> Result<Reply, DriverError> {
    use crate::bridge::protocol::Command;

    match command {
        Command::Init { mode } => driver.init(mode).map(|driver_kind| Reply::Init {
            success: true,
            driver_kind,
        }),
        Command::Capture => driver
            .capture()
            .map(|frame| Reply::Capture(frame.into_payload())),
        Command::Scan { retries } => scan(driver, retries).map(Reply::Scan),
        Command::Cleanup => driver.release().map(|()| Reply::Cleanup { success: true }),
    }
}
