//! Deterministic bench driver.
//!
//! Stands in for the camera on machines without one (CI, dry runs). Every
//! behaviour the supervisor has to survive can be provoked from the
//! environment: a late hit, a hang in any call, a panic, a failed
//! construction.

use std::thread;
use std::time::Duration;

use super::{DriverError, PeripheralDriver};
use crate::bridge::protocol::{DriverMode, SymbolKind};
use crate::frame::Frame;

/// Driver call that a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Init,
    Capture,
    Release,
}

impl FaultPoint {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "init" => Some(Self::Init),
            "capture" => Some(Self::Capture),
            "release" | "cleanup" => Some(Self::Release),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Payload returned by a successful decode.
    pub code: String,
    /// Decode succeeds from this capture onwards (1-based). `None` never decodes.
    pub hit_after: Option<u32>,
    /// Which decoder reports the hit.
    pub variant: SymbolKind,
    pub width: usize,
    pub height: usize,
    /// Call that blocks forever.
    pub hang: Option<FaultPoint>,
    /// Call that panics.
    pub panic_on: Option<FaultPoint>,
    /// Refuse construction.
    pub fail_construct: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            code: "SYNTH-0001".to_string(),
            hit_after: Some(1),
            variant: SymbolKind::Primary,
            width: 64,
            height: 48,
            hang: None,
            panic_on: None,
            fail_construct: false,
        }
    }
}

impl SyntheticConfig {
    /// Read `PROGBOT_SYNTHETIC_*` variables. Unset or unparsable values keep defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(code) = lookup("PROGBOT_SYNTHETIC_CODE") {
            config.code = code;
        }
        if let Some(raw) = lookup("PROGBOT_SYNTHETIC_HIT_AFTER") {
            match raw.trim() {
                "never" | "none" => config.hit_after = None,
                n => {
                    if let Ok(n) = n.parse() {
                        config.hit_after = Some(n);
                    }
                }
            }
        }
        if let Some(raw) = lookup("PROGBOT_SYNTHETIC_VARIANT") {
            match raw.trim() {
                "secondary" | "micro" => config.variant = SymbolKind::Secondary,
                "primary" | "standard" => config.variant = SymbolKind::Primary,
                other => tracing::warn!(value = %other, "Ignoring unknown synthetic variant"),
            }
        }
        if let Some(n) = lookup("PROGBOT_SYNTHETIC_WIDTH").and_then(|v| v.parse().ok()) {
            config.width = n;
        }
        if let Some(n) = lookup("PROGBOT_SYNTHETIC_HEIGHT").and_then(|v| v.parse().ok()) {
            config.height = n;
        }
        config.hang = lookup("PROGBOT_SYNTHETIC_HANG").and_then(|v| FaultPoint::parse(&v));
        config.panic_on = lookup("PROGBOT_SYNTHETIC_PANIC").and_then(|v| FaultPoint::parse(&v));
        config.fail_construct = lookup("PROGBOT_SYNTHETIC_FAIL")
            .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"));

        config
    }
}

pub struct SyntheticDriver {
    config: SyntheticConfig,
    kind: Option<String>,
    captured: u32,
}

impl SyntheticDriver {
    pub fn new(config: SyntheticConfig) -> Result<Self, DriverError> {
        if config.fail_construct {
            return Err(DriverError::device("synthetic driver refused to start"));
        }
        Ok(Self {
            config,
            kind: None,
            captured: 0,
        })
    }

    pub fn from_env() -> Result<Self, DriverError> {
        Self::new(SyntheticConfig::from_env())
    }

    fn fault(&self, point: FaultPoint) {
        if self.config.panic_on == Some(point) {
            panic!("synthetic {:?} fault", point);
        }
        if self.config.hang == Some(point) {
            tracing::warn!(?point, "Synthetic driver hanging");
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
    }

    fn decodes(&self, variant: SymbolKind) -> Option<String> {
        let hit_after = self.config.hit_after?;
        (variant == self.config.variant && self.captured >= hit_after)
            .then(|| self.config.code.clone())
    }
}

impl PeripheralDriver for SyntheticDriver {
    fn init(&mut self, mode: DriverMode) -> Result<String, DriverError> {
        self.fault(FaultPoint::Init);
        let kind = match mode {
            DriverMode::Primary => "synthetic-primary".to_string(),
            DriverMode::Device { index } => format!("synthetic-device{}", index),
        };
        tracing::info!(driver_kind = %kind, "Synthetic camera initialized");
        self.kind = Some(kind.clone());
        Ok(kind)
    }

    fn capture(&mut self) -> Result<Frame, DriverError> {
        if self.kind.is_none() {
            return Err(DriverError::NotInitialized);
        }
        self.fault(FaultPoint::Capture);
        self.captured += 1;

        let (width, height) = (self.config.width, self.config.height);
        let mut data = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[
                    (x * 255 / width.max(1)) as u8,
                    (y * 255 / height.max(1)) as u8,
                    (self.captured % 256) as u8,
                ]);
            }
        }
        Ok(Frame::new(width, height, 3, data)?)
    }

    fn decode_primary(&mut self, _frame: &Frame) -> Option<String> {
        self.decodes(SymbolKind::Primary)
    }

    fn decode_secondary(&mut self, _frame: &Frame) -> Result<Option<String>, DriverError> {
        Ok(self.decodes(SymbolKind::Secondary))
    }

    fn release(&mut self) -> Result<(), DriverError> {
        self.fault(FaultPoint::Release);
        if self.kind.take().is_some() {
            tracing::info!("Synthetic camera released");
        }
        Ok(())
    }
}
