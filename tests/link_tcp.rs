//! Integration tests for the TCP controller link
//!
//! A loopback listener plays the controller so the connect-time flush and the one-read
//! reply framing are exercised over a real socket.

use ao_guider::config::GuiderConfig;
use ao_guider::hardware::{Codec, Link, StreamLink};
use ao_guider::{Guider, GuiderError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn test_connect_flushes_then_exchanges() -> anyhow::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();

    let controller = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        let mut buf = [0u8; 64];

        let n = socket.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"\r");
        socket.write_all(b":").await?;

        let n = socket.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"TPA\r");
        socket.write_all(b" -20845\r\n:").await?;

        let n = socket.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"BGA\r");
        socket.write_all(b":").await?;
        anyhow::Ok(())
    });

    let link: Arc<dyn Link> =
        Arc::new(StreamLink::connect(Ipv4Addr::LOCALHOST, port, Duration::from_secs(2)).await?);
    let codec = Codec::new(link, 80, 512);

    assert_eq!(codec.ask_long("TPA").await?, -20845);
    codec.tell("BGA").await?;

    controller.await??;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_controller_is_connection_failure() -> anyhow::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let mut config = GuiderConfig::default();
    config.controller.host = "127.0.0.1".to_string();
    config.controller.port = port;
    config.controller.read_timeout_ms = 500;

    let result = Guider::connect(config).await;
    assert!(matches!(result, Err(GuiderError::ConnectionFailure(_))));
    Ok(())
}

#[tokio::test]
async fn test_invalid_host_is_rejected_before_connecting() {
    let mut config = GuiderConfig::default();
    config.controller.host = "guider-galil".to_string();

    let result = Guider::connect(config).await;
    assert!(matches!(result, Err(GuiderError::Configuration(_))));
}
