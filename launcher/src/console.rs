//! TCP console transport.
//!
//! The hypervisor exposes the appliance's serial console as a raw
//! TCP socket. This module adapts that socket to the
//! [`ConsoleChannel`] trait: a rolling receive buffer with
//! first-match substring scanning, so a pattern split across two
//! read windows is still found.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{event, Level};

use vrlab_rs::console::{ConsoleChannel, ConsoleError, ExpectOutcome};

/// Upper bound on retained unmatched output. Boot logs can be
/// chatty; anything older than this can no longer contain a pending
/// milestone pattern.
const BUFFER_CAP: usize = 64 * 1024;
const BUFFER_KEEP: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

pub struct TcpConsole {
    stream: TcpStream,
    buffer: Vec<u8>,
}

fn map_io_error(e: std::io::Error) -> ConsoleError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::UnexpectedEof => ConsoleError::TransportClosed,
        _ => ConsoleError::Io(e),
    }
}

impl TcpConsole {
    /// Connect to the serial console socket, retrying on a 1-second
    /// cadence while the hypervisor is still bringing the port up.
    pub async fn connect(addr: SocketAddr, attempts: u32) -> Result<TcpConsole> {
        let mut last_err = None;
        for attempt in 1..=attempts {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    event!(Level::INFO, %addr, attempt, "Connected to console socket");
                    return Ok(TcpConsole {
                        stream,
                        buffer: Vec::new(),
                    });
                }
                Err(e) => {
                    event!(Level::DEBUG, %addr, attempt, error = %e, "Console socket not up yet");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        match last_err {
            Some(e) => Err(e).with_context(|| {
                format!("Opening console socket connection at {addr} ({attempts} attempts)")
            }),
            None => anyhow::bail!("No console connection attempts were permitted"),
        }
    }

    /// First pattern (in slice order) present anywhere in the
    /// buffer, together with the end offset of its occurrence.
    fn scan(&self, patterns: &[&[u8]]) -> Option<(usize, usize)> {
        for (idx, pattern) in patterns.iter().enumerate() {
            if pattern.is_empty() {
                continue;
            }
            if let Some(pos) = self
                .buffer
                .windows(pattern.len())
                .position(|w| w == *pattern)
            {
                return Some((idx, pos + pattern.len()));
            }
        }
        None
    }

    fn trim_buffer(&mut self) {
        if self.buffer.len() > BUFFER_CAP {
            let excess = self.buffer.len() - BUFFER_KEEP;
            self.buffer.drain(..excess);
        }
    }
}

#[async_trait]
impl ConsoleChannel for TcpConsole {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ConsoleError> {
        self.stream.write_all(bytes).await.map_err(map_io_error)?;
        self.stream.flush().await.map_err(map_io_error)
    }

    async fn expect(
        &mut self,
        patterns: &[&[u8]],
        window: Duration,
    ) -> Result<ExpectOutcome, ConsoleError> {
        let deadline = tokio::time::Instant::now() + window;

        // Output that arrives during *this* window; the retained
        // buffer tail from previous windows is only used for
        // matching, not reported again.
        let window_start = self.buffer.len();

        loop {
            if let Some((idx, end)) = self.scan(patterns) {
                let consumed: Vec<u8> = self.buffer.drain(..end).collect();
                return Ok(ExpectOutcome {
                    matched: Some(idx),
                    buffer: consumed,
                });
            }

            let remaining = deadline - tokio::time::Instant::now();
            if remaining.is_zero() {
                let fresh = self.buffer[window_start.min(self.buffer.len())..].to_vec();
                self.trim_buffer();
                return Ok(ExpectOutcome {
                    matched: None,
                    buffer: fresh,
                });
            }

            let mut chunk = [0u8; READ_CHUNK];
            match tokio::time::timeout(remaining, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ConsoleError::TransportClosed),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(map_io_error(e)),
                Err(_elapsed) => {
                    let fresh = self.buffer[window_start.min(self.buffer.len())..].to_vec();
                    self.trim_buffer();
                    return Ok(ExpectOutcome {
                        matched: None,
                        buffer: fresh,
                    });
                }
            }
        }
    }

    async fn read_remaining(&mut self) -> Vec<u8> {
        let mut drained = std::mem::take(&mut self.buffer);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match tokio::time::timeout(Duration::from_millis(100), self.stream.read(&mut chunk))
                .await
            {
                Ok(Ok(n)) if n > 0 => drained.extend_from_slice(&chunk[..n]),
                // EOF, error or timeout: we got what we got.
                _ => break,
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpConsole, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (console, (peer, _)) =
            tokio::join!(async { TcpConsole::connect(addr, 3).await.unwrap() }, async {
                listener.accept().await.unwrap()
            });
        (console, peer)
    }

    #[tokio::test]
    async fn matches_pattern_split_across_writes() {
        let (mut console, mut peer) = pair().await;

        peer.write_all(b"appliance log").await.unwrap();
        peer.flush().await.unwrap();
        tokio::task::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            peer.write_all(b"in: ").await.unwrap();
            peer.flush().await.unwrap();
            // Keep the peer alive until the read completes.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let outcome = console
            .expect(&[b"login:"], Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(outcome.matched, Some(0));
        assert!(outcome.buffer.ends_with(b"login:"));
    }

    #[tokio::test]
    async fn first_pattern_in_slice_order_wins() {
        let (mut console, mut peer) = pair().await;

        peer.write_all(b"... login: and a banner ...").await.unwrap();
        peer.flush().await.unwrap();

        let outcome = console
            .expect(&[b"banner", b"login:"], Duration::from_secs(2))
            .await
            .unwrap();

        // "login:" occurs earlier in the stream, but "banner" comes
        // first in the pattern slice.
        assert_eq!(outcome.matched, Some(0));
    }

    #[tokio::test]
    async fn window_timeout_reports_no_match() {
        let (mut console, _peer) = pair().await;

        let outcome = console
            .expect(&[b"login:"], Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(outcome.matched, None);
        assert!(outcome.buffer.is_empty());
    }

    #[tokio::test]
    async fn peer_close_is_transport_closed() {
        let (mut console, peer) = pair().await;
        drop(peer);

        match console.expect(&[b"login:"], Duration::from_secs(2)).await {
            Err(ConsoleError::TransportClosed) => {}
            other => panic!("expected TransportClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_output_is_retained_across_windows() {
        let (mut console, mut peer) = pair().await;

        peer.write_all(b"appliance log").await.unwrap();
        peer.flush().await.unwrap();

        let first = console
            .expect(&[b"login:"], Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(first.matched, None);
        assert_eq!(first.buffer, b"appliance log");

        peer.write_all(b"in: ").await.unwrap();
        peer.flush().await.unwrap();

        let second = console
            .expect(&[b"login:"], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(second.matched, Some(0));
    }
}
