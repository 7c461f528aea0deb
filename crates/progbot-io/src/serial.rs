//! Line-oriented request/response over a serial link.
//!
//! One background task reads `\n`-terminated lines and queues them; each
//! exchange drains stale lines, writes the command and waits for exactly one
//! new line. `send_command` takes `&mut self`, so only one exchange can be in
//! flight per link. Share a link across tasks behind a `tokio::sync::Mutex`.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;

/// Read timeout configured on the port itself.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `disconnect()` waits for the reader task after aborting it.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between attempts after a per-attempt timeout.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error(
        "device {port} failed to respond after {attempts} attempts (timeout={}s)",
        .timeout.as_secs_f64()
    )]
    Timeout {
        port: String,
        attempts: u32,
        timeout: Duration,
    },

    #[error("serial port {port} is not connected")]
    NotConnected { port: String },

    #[error("write to {port} failed: {source}")]
    Write {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("serial reader for {port} has stopped")]
    Closed { port: String },
}

trait Transport: AsyncRead + AsyncWrite + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + 'static> Transport for T {}

struct Connection {
    writer: WriteHalf<Box<dyn Transport + Unpin>>,
    lines: mpsc::UnboundedReceiver<String>,
    reader_task: JoinHandle<()>,
}

/// Owns one serial connection and its background reader.
pub struct SerialLink {
    port: String,
    baud: u32,
    conn: Option<Connection>,
}

impl SerialLink {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            conn: None,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Open the port (8N1, no flow control) and start the reader.
    /// A no-op when already connected.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        if self.is_connected() {
            tracing::debug!(port = %self.port, "Already connected");
            return Ok(());
        }

        let stream = tokio_serial::new(self.port.as_str(), self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open_native_async()
            .map_err(|source| LinkError::Connection {
                port: self.port.clone(),
                source,
            })?;

        self.attach(stream);
        tracing::info!(port = %self.port, baud = self.baud, "Serial link connected");
        Ok(())
    }

    /// Run the link over an already-open byte stream instead of a serial port.
    ///
    /// Replaces any existing connection. Must be called within a tokio runtime.
    pub fn attach<T>(&mut self, transport: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if let Some(old) = self.conn.take() {
            old.reader_task.abort();
        }

        let boxed: Box<dyn Transport + Unpin> = Box::new(transport);
        let (reader, writer) = tokio::io::split(boxed);
        let (tx, lines) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_lines(reader, tx, self.port.clone()));

        self.conn = Some(Connection {
            writer,
            lines,
            reader_task,
        });
    }

    /// Drop the connection without a graceful close.
    ///
    /// Returns within `DISCONNECT_TIMEOUT` even if the reader is stuck.
    pub async fn disconnect(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Connection {
            writer,
            lines,
            reader_task,
        } = conn;

        drop(writer);
        reader_task.abort();
        match tokio::time::timeout(DISCONNECT_TIMEOUT, reader_task).await {
            Ok(_) => tracing::debug!(port = %self.port, "Reader task stopped"),
            Err(_) => tracing::warn!(port = %self.port, "Reader task did not stop in time"),
        }
        drop(lines);
        tracing::info!(port = %self.port, "Serial link disconnected");
    }

    /// Discard lines the device sent without being asked. Returns how many.
    pub fn drain_pending(&mut self) -> usize {
        let Some(conn) = self.conn.as_mut() else {
            return 0;
        };
        let mut drained = 0;
        while let Ok(line) = conn.lines.try_recv() {
            tracing::warn!(port = %self.port, %line, "Discarding stale line");
            drained += 1;
        }
        drained
    }

    /// Send one command line and return the next line the device produces.
    ///
    /// `timeout` is split evenly across `retries` attempts. A `retries` of 0
    /// is treated as 1.
    pub async fn send_command(
        &mut self,
        command: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<String, LinkError> {
        if self.conn.is_none() {
            return Err(LinkError::NotConnected {
                port: self.port.clone(),
            });
        }

        let attempts = retries.max(1);
        let per_attempt = timeout / attempts;
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let command = command.trim_end();

        for attempt in 1..=attempts {
            self.drain_pending();

            let port = &self.port;
            let Some(conn) = self.conn.as_mut() else {
                return Err(LinkError::NotConnected { port: port.clone() });
            };

            tracing::debug!(%port, command, attempt, "Sending command");
            let written = async {
                conn.writer.write_all(line.as_bytes()).await?;
                conn.writer.flush().await
            }
            .await;
            if let Err(source) = written {
                return Err(LinkError::Write {
                    port: port.clone(),
                    source,
                });
            }

            match tokio::time::timeout(per_attempt, conn.lines.recv()).await {
                Ok(Some(response)) => {
                    tracing::debug!(%port, command, attempt, %response, "Received response");
                    return Ok(response);
                }
                Ok(None) => return Err(LinkError::Closed { port: port.clone() }),
                Err(_) => {
                    tracing::warn!(
                        %port,
                        command,
                        attempt,
                        attempts,
                        timeout = ?per_attempt,
                        "No response"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }

        Err(LinkError::Timeout {
            port: self.port.clone(),
            attempts,
            timeout,
        })
    }
}

/// Decode one raw line: every byte maps to one char, surrounding whitespace trimmed.
pub fn decode_line(raw: &[u8]) -> String {
    let decoded: String = raw.iter().map(|&b| char::from(b)).collect();
    decoded.trim().to_string()
}

async fn read_lines<R: AsyncRead + Unpin>(
    reader: R,
    tx: mpsc::UnboundedSender<String>,
    port: String,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::debug!(%port, "Serial link closed by device");
                break;
            }
            Ok(_) => {
                let line = decode_line(&buf);
                tracing::trace!(%port, %line, "Line received");
                if tx.send(line).is_err() {
                    break;
                }
            }
            // Port-level read timeout with nothing pending.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                tracing::warn!(%port, error = %e, "Serial read failed, reader exiting");
                break;
            }
        }
    }
}
