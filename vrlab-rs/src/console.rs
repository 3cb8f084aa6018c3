use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The console transport is gone (remote end closed the
    /// connection, or the underlying stream reported EOF). This is
    /// fatal: nothing more can be done with the appliance, callers
    /// must propagate it rather than retry.
    #[error("console transport closed")]
    TransportClosed,

    /// Any other I/O error on the underlying transport.
    #[error("console I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a single bounded [`ConsoleChannel::expect`] read.
#[derive(Debug, Clone, Default)]
pub struct ExpectOutcome {
    /// Index into the pattern slice of the first pattern that
    /// matched, or `None` if the read window elapsed without a
    /// match.
    pub matched: Option<usize>,

    /// Raw console output buffered during this read window. Returned
    /// regardless of whether a pattern matched, so callers can log
    /// boot output for debugging.
    pub buffer: Vec<u8>,
}

/// Bidirectional byte channel to a booting appliance's serial
/// console.
///
/// Implementations wrap whatever terminal transport the hypervisor
/// exposes (typically a telnet-style TCP socket). Patterns are plain
/// byte substrings, not regular grammars. `expect` returns the
/// *first* pattern that matches within the window -- first-match,
/// not best-match -- and implementations must scan patterns in slice
/// order when more than one could apply to the buffered output.
#[async_trait]
pub trait ConsoleChannel: Send {
    /// Send raw bytes to the console.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ConsoleError>;

    /// Block until one of `patterns` appears in the console output,
    /// or until `window` elapses. A timeout is not an error; it is
    /// reported as `matched: None`.
    async fn expect(
        &mut self,
        patterns: &[&[u8]],
        window: Duration,
    ) -> Result<ExpectOutcome, ConsoleError>;

    /// Best-effort drain of any output the appliance has already
    /// produced. Transport errors are swallowed; this is only used
    /// to collect trailing output for logs.
    async fn read_remaining(&mut self) -> Vec<u8>;
}

impl ConsoleError {
    /// Whether this error means the console is gone for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsoleError::TransportClosed)
    }
}
