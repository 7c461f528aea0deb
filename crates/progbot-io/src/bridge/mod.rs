//! IPC bridge for supervisor-worker communication.
//!
//! This module provides the wire protocol and codec shared by the peripheral
//! supervisor (parent) and the worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerRequest/Response, Command, Outcome)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
