#![allow(dead_code)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use color_eyre::{eyre::eyre, Result};
use serial_hub::{
    bridge::Bridge,
    config::{Config, SerialSettings},
    mock::{MockBackend, MockDevice},
};
use tokio::{io::AsyncReadExt, net::TcpStream, time::timeout};
use tracing::info;

pub const MOCK_DEVICE: &str = "/dev/ttyMOCK0";

pub fn test_config() -> Config {
    Config {
        // Port 0 has the server pick a free one.
        tcp_port: 0,
        serial: SerialSettings {
            device: MOCK_DEVICE.into(),
            // Fast reads and reconnect polls keep these tests snappy.
            timeout_ms: 50,
            ..Default::default()
        },
        keep_active: true,
    }
}

/// A started bridge over a mock device, plus the port it serves.
pub async fn start_bridge(device_present: bool) -> Result<(Arc<Bridge>, MockDevice, u16)> {
    let device = MockDevice::new(device_present);
    let backend = Arc::new(MockBackend::new(MOCK_DEVICE, device.clone()));

    let bridge = Bridge::with_backend(test_config(), backend);
    let port = bridge.start().await?;

    Ok((bridge, device, port))
}

pub async fn connect(port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    info!("Connected to 127.0.0.1:{port}");

    Ok(stream)
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Read until the needle has been seen, returning everything read.
pub async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        if contains(&collected, needle) {
            return Ok(collected);
        }

        let n = timeout(Duration::from_secs(5), stream.read(&mut buf)).await??;

        if n == 0 {
            return Err(eyre!(
                "Stream closed while waiting for {:?}, got {:?}",
                String::from_utf8_lossy(needle),
                String::from_utf8_lossy(&collected)
            ));
        }

        collected.extend_from_slice(&buf[..n]);
    }
}

/// Read until the peer closes the stream, returning everything read.
pub async fn read_until_eof(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf)).await??;

        if n == 0 {
            return Ok(collected);
        }

        collected.extend_from_slice(&buf[..n]);
    }
}

/// Poll a condition until it holds.
pub async fn eventually(what: impl Fn() -> bool, description: &str) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        if what() {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Err(eyre!("Timed out waiting for: {description}"))
}
