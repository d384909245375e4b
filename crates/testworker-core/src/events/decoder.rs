//! Line decoder for the worker's stdout.
//!
//! Each newline-delimited line is parsed as JSON. An object carrying a
//! string `type` field becomes an [`Event`] on the bus; every other line is
//! handed verbatim to a [`ConsoleSink`]. Lines are processed strictly in
//! arrival order and the bus handlers for one line finish before the next
//! line is read.

use std::io::Write;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use super::{Event, EventBus};

/// Destination for stdout lines that are not structured events.
pub trait ConsoleSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Echoes pass-through lines on the harness's own stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl ConsoleSink for StdoutSink {
    fn write_line(&self, line: &str) {
        // A closed stdout must not take the harness down.
        let _ = writeln!(std::io::stdout().lock(), "{line}");
    }
}

/// Forwards pass-through lines to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ConsoleSink for TracingSink {
    fn write_line(&self, line: &str) {
        tracing::info!(target: "testworker::worker_stdout", "{line}");
    }
}

/// Decode one line into an event, or `None` if it is not a typed record.
pub fn decode_line(line: &str) -> Option<Event> {
    let record: Value = serde_json::from_str(line).ok()?;
    let kind = record.get("type")?.as_str()?.to_owned();
    Some(Event {
        kind,
        payload: record,
    })
}

/// Counters reported when a decoded stream ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    /// Lines emitted as events.
    pub events: u64,
    /// Lines forwarded to the console sink.
    pub passthrough: u64,
}

/// Turns a byte stream into bus events and console output.
#[derive(Clone)]
pub struct EventDecoder {
    bus: EventBus,
    sink: Arc<dyn ConsoleSink>,
}

impl std::fmt::Debug for EventDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDecoder").field("bus", &self.bus).finish()
    }
}

impl EventDecoder {
    pub fn new(bus: EventBus, sink: Arc<dyn ConsoleSink>) -> Self {
        Self { bus, sink }
    }

    /// Handle a single line (without its terminator). Returns `true` if an
    /// event was emitted.
    pub fn feed_line(&self, line: &str) -> bool {
        match decode_line(line) {
            Some(event) => {
                debug!(kind = %event.kind, payload = %event.payload, "emit");
                self.bus.emit(&event);
                true
            }
            None => {
                self.sink.write_line(line);
                false
            }
        }
    }

    /// Read `reader` to EOF, decoding every line.
    ///
    /// A final line without a trailing newline is still decoded. Invalid
    /// UTF-8 is replaced rather than rejected. A read error ends decoding
    /// with a warning; it is never returned to the caller.
    pub async fn run<R>(&self, reader: R) -> DecodeStats
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut stats = DecodeStats::default();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    let line = String::from_utf8_lossy(&buf);
                    if self.feed_line(&line) {
                        stats.events += 1;
                    } else {
                        stats.passthrough += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "error reading worker stdout");
                    break;
                }
            }
        }

        debug!(events = stats.events, passthrough = stats.passthrough, "worker stdout closed");
        stats
    }
}
