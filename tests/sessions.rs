mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use color_eyre::Result;
use common::*;
use serial_hub::session::{Session, SessionCallbacks};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};

#[tokio::test]
async fn the_greeting_comes_first() -> Result<()> {
    let (bridge, _device, port) = start_bridge(true).await?;

    let mut client = connect(port).await?;
    let seen = read_until(&mut client, b"\r\n").await?;

    assert!(seen.starts_with(b"Connection established: "));

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn a_half_closed_peer_is_dropped_and_the_device_released() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;

    let mut client = connect(port).await?;
    read_until(&mut client, b"is connected").await?;
    eventually(|| device.is_open(), "the device to be opened").await?;

    // Shut our write half down. The server sees end of stream, gives up
    // on the session after its error budget, and closes the socket.
    client.shutdown().await?;
    read_until_eof(&mut client).await?;

    eventually(
        || bridge.server().sessions().is_empty(),
        "the session to be dropped",
    )
    .await?;

    // The last peer leaving releases the device.
    eventually(|| !device.is_open(), "the device to be released").await?;

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn a_vanishing_peer_does_not_disturb_the_rest() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;

    let mut staying = connect(port).await?;
    read_until(&mut staying, b"is connected").await?;

    let leaving = connect(port).await?;
    eventually(
        || bridge.server().sessions().len() == 2,
        "both peers to be registered",
    )
    .await?;

    drop(leaving);
    eventually(
        || bridge.server().sessions().len() == 1,
        "the vanished peer to be dropped",
    )
    .await?;

    // One peer is still here, the device stays open and serves it.
    assert!(device.is_open());

    device.feed(b"still here\r\n");
    read_until(&mut staying, b"still here").await?;

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn repeated_receive_errors_end_the_session_with_one_disconnect() -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();

    let client = TcpStream::connect(("127.0.0.1", port)).await?;
    let (accepted, _peer) = listener.accept().await?;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);

    let callbacks = SessionCallbacks {
        on_disconnect: Arc::new(move |_session| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        ..Default::default()
    };

    let session = Session::new(accepted, callbacks)?;
    session.start();

    // Half-close our side. The session now reads end of stream over and
    // over, burns through its error budget and gives up on its own.
    let (mut rx, mut tx) = client.into_split();
    tx.shutdown().await?;

    let mut buf = [0u8; 256];
    loop {
        let n = timeout(Duration::from_secs(5), rx.read(&mut buf)).await??;
        if n == 0 {
            break;
        }
    }

    eventually(
        || disconnects.load(Ordering::SeqCst) == 1,
        "the disconnect hook to fire",
    )
    .await?;

    // Once, not more.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn stopping_a_session_twice_disconnects_once() -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();

    // Kept open so the session has nothing to complain about, the stops
    // below are the only reason it winds down.
    let _client = TcpStream::connect(("127.0.0.1", port)).await?;
    let (accepted, _peer) = listener.accept().await?;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);

    let callbacks = SessionCallbacks {
        on_disconnect: Arc::new(move |_session| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        ..Default::default()
    };

    let session = Session::new(accepted, callbacks)?;
    session.start();

    session.stop();
    session.stop();

    eventually(
        || disconnects.load(Ordering::SeqCst) == 1,
        "the disconnect hook to fire",
    )
    .await?;

    // Stopping once the task is gone stays a no-op.
    session.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn peers_can_come_and_go() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;

    for round in 0..3 {
        let mut client = connect(port).await?;
        read_until(&mut client, b"Baudrate").await?;

        let line = format!("round {round}\r\n");
        device.feed(line.as_bytes());
        read_until(&mut client, line.as_bytes()).await?;

        client.shutdown().await?;
        read_until_eof(&mut client).await?;

        eventually(
            || bridge.server().sessions().is_empty(),
            "the peer to be dropped",
        )
        .await?;
    }

    bridge.shutdown().await;
    Ok(())
}
