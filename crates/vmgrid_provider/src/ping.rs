//! TCP liveness probe shared by the adapters and the pool.

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// Per-attempt connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between attempts.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Probe `ip:port` until it accepts a TCP connection or `deadline` elapses.
pub async fn ping_vm(ip: IpAddr, port: u16, deadline: Duration) -> bool {
    let started = Instant::now();

    loop {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect((ip, port))).await {
            Ok(Ok(_)) => return true,
            Ok(Err(e)) => {
                log::debug!("ping {ip}:{port} refused: {e}");
            }
            Err(_) => {
                log::debug!("ping {ip}:{port} timed out");
            }
        }

        if started.elapsed() + RETRY_PAUSE >= deadline {
            return false;
        }
        sleep(RETRY_PAUSE).await;
    }
}
