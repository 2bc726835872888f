//! Readiness probing of the listen socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Wait until `addr` accepts TCP connections or `deadline` elapses.
///
/// Returns the time it took, or `None` on timeout.
pub async fn wait_until_listening(addr: SocketAddr, deadline: Duration) -> Option<Duration> {
    let start = Instant::now();

    loop {
        if let Ok(Ok(_stream)) = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            return Some(start.elapsed());
        }

        if start.elapsed() >= deadline {
            return None;
        }
        sleep(POLL_INTERVAL).await;
    }
}
