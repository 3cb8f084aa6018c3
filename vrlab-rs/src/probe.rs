use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{event, Level};

/// Attempt budget and per-attempt connect timeout for one probe run.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTuning {
    pub attempts: u32,
    pub attempt_timeout: Duration,
}

/// Tuning used while waiting for the management interface to obtain
/// its first address after boot.
pub const SHORT_POLL: ProbeTuning = ProbeTuning {
    attempts: 60,
    attempt_timeout: Duration::from_secs(2),
};

/// Tuning used while waiting for an appliance to come back from a
/// reboot it triggered itself.
pub const LONG_POLL: ProbeTuning = ProbeTuning {
    attempts: 180,
    attempt_timeout: Duration::from_secs(2),
};

#[derive(Debug, Error)]
#[error("management endpoint {endpoint} not reachable after {attempts} attempts")]
pub struct ProbeTimeout {
    pub endpoint: SocketAddr,
    pub attempts: u32,
}

/// Poll `endpoint` until one TCP connection attempt succeeds.
///
/// The connection is closed immediately on success; reachability is
/// the only signal, no protocol exchange is performed (the endpoint
/// is usually an HTTPS port, but no TLS handshake happens here).
///
/// The cadence is a fixed one-second sleep before each attempt -- no
/// jitter, no backoff. This deliberately matches the one-second boot
/// polling cadence so interleaved progress logs stay readable, and
/// it means a probe that succeeds on attempt N has slept exactly N
/// seconds.
pub async fn probe(endpoint: SocketAddr, tuning: ProbeTuning) -> Result<(), ProbeTimeout> {
    for attempt in 1..=tuning.attempts {
        tokio::time::sleep(Duration::from_secs(1)).await;

        match tokio::time::timeout(tuning.attempt_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                // Liveness confirmed, drop the connection right away.
                drop(stream);
                event!(
                    Level::INFO,
                    %endpoint,
                    attempt,
                    "Management endpoint is responsive"
                );
                return Ok(());
            }
            Ok(Err(connect_err)) => {
                event!(Level::TRACE, %endpoint, attempt, ?connect_err, "Probe attempt failed");
            }
            Err(_elapsed) => {
                event!(Level::TRACE, %endpoint, attempt, "Probe attempt timed out");
            }
        }

        if attempt % 10 == 0 {
            event!(
                Level::INFO,
                %endpoint,
                attempt,
                max_attempts = tuning.attempts,
                "Still waiting for management endpoint"
            );
        }
    }

    Err(ProbeTimeout {
        endpoint,
        attempts: tuning.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    // These tests run on real time: the probe cadence is fixed at
    // one second and the attempt budgets are kept small.

    #[tokio::test]
    async fn succeeds_on_first_attempt_when_endpoint_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();

        let started = Instant::now();
        probe(
            endpoint,
            ProbeTuning {
                attempts: 3,
                attempt_timeout: Duration::from_secs(2),
            },
        )
        .await
        .unwrap();

        // One cadence sleep, then an immediate loopback connect.
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn exhausts_attempt_budget_against_dead_endpoint() {
        // Bind and immediately drop to get a port that refuses
        // connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();
        drop(listener);

        let started = Instant::now();
        let err = probe(
            endpoint,
            ProbeTuning {
                attempts: 2,
                attempt_timeout: Duration::from_secs(2),
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 2);
        // Two cadence sleeps; refused connects return immediately on
        // loopback, so the attempt timeout contributes nothing.
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn returns_as_soon_as_endpoint_comes_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap();
        drop(listener);

        // Bring the endpoint up between the fourth and fifth
        // attempt. The probe must succeed on attempt five and sleep
        // five seconds total, not run out its 60-attempt budget.
        let rebind = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4500)).await;
            TcpListener::bind(endpoint).await.unwrap()
        });

        let started = Instant::now();
        probe(endpoint, SHORT_POLL).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(7));
        drop(rebind.await.unwrap());
    }
}
