//! Ephemeral loopback listeners

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;

use rand::Rng;
use tokio::net::TcpListener;
use tracing::debug;

use super::transport::{TransportError, TransportResult};

/// Transcoder-facing address of a loopback port.
pub fn loopback_address(port: u16) -> String {
    format!("tcp://127.0.0.1:{port}")
}

/// Binds a listener on 127.0.0.1 using random ports from `ports`.
///
/// Each failed bind retries with a fresh random port.
///
/// # Errors
///
/// - `TransportError::BindFailed` - No port could be bound within `attempts` tries
pub async fn bind_ephemeral_listener(
    ports: &RangeInclusive<u16>,
    attempts: u32,
) -> TransportResult<(TcpListener, u16)> {
    let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "no bind attempted");

    for attempt in 1..=attempts.max(1) {
        let port = rand::rng().random_range(ports.clone());
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        match TcpListener::bind(addr).await {
            Ok(listener) => {
                debug!("Bound loopback listener on port {} (attempt {})", port, attempt);
                return Ok((listener, port));
            }
            Err(e) => {
                debug!("Port {} unavailable: {}", port, e);
                last_error = e;
            }
        }
    }

    Err(TransportError::BindFailed {
        attempts,
        source: last_error,
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn test_binds_within_range() {
        let ports = 20_000..=30_000;
        let (listener, port) = bind_ephemeral_listener(&ports, 8).await.unwrap();

        assert!(ports.contains(&port));
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_retries_past_occupied_port() {
        let (_held, port) = bind_ephemeral_listener(&(30_001..=39_999), 8)
            .await
            .unwrap();
        let neighbour = if port == 39_999 { port - 1 } else { port + 1 };
        let ports = port.min(neighbour)..=port.max(neighbour);

        let (_listener, bound) = bind_ephemeral_listener(&ports, 64).await.unwrap();
        assert_eq!(bound, neighbour);
    }

    #[tokio::test]
    async fn test_fails_when_only_port_is_taken() {
        let (_held, port) = bind_ephemeral_listener(&(20_000..=30_000), 8)
            .await
            .unwrap();

        let result = bind_ephemeral_listener(&(port..=port), 3).await;
        assert!(matches!(
            result,
            Err(TransportError::BindFailed { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_listener_accepts_local_client() {
        let (listener, port) = bind_ephemeral_listener(&(20_000..=30_000), 8)
            .await
            .unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let (mut accepted, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();

        assert_eq!(loopback_address(port), format!("tcp://127.0.0.1:{port}"));
    }
}
