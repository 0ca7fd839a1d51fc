mod common;

use std::time::Duration;

use color_eyre::Result;
use common::*;
use serial_hub::bridge::{CLOSE_NOTICE, EXIT_SENTINEL};
use tokio::{io::AsyncWriteExt, time::timeout};

#[tokio::test]
async fn banner_when_the_device_is_present() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;

    let mut client = connect(port).await?;
    let seen = read_until(&mut client, b"is connected").await?;

    assert!(contains(&seen, b"Connection established: "));
    assert!(contains(&seen, b"\x02Device: /dev/ttyMOCK0\x03\r\n"));
    assert!(contains(&seen, b"\x02Baudrate: 115200\x03\r\n"));
    assert!(contains(&seen, b"\x02Device: /dev/ttyMOCK0 is connected\x03\r\n"));
    assert!(!contains(&seen, b"not accessible"));

    eventually(|| device.is_open(), "the device to be opened").await?;
    assert!(bridge.link().is_connected());

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_device_is_announced_and_picked_up_later() -> Result<()> {
    let (bridge, device, port) = start_bridge(false).await?;

    let mut client = connect(port).await?;
    let seen = read_until(&mut client, b"is not accessible").await?;

    assert!(contains(&seen, b"\x02Device: /dev/ttyMOCK0\x03\r\n"));
    assert!(contains(&seen, b"\x02Baudrate: 115200\x03\r\n"));
    assert!(contains(&seen, b"\x02Device: /dev/ttyMOCK0 is not accessible\x03\r\n"));

    // Plugging the device in heals the link on the same connection.
    device.set_present(true);
    read_until(&mut client, b"is connected").await?;

    device.feed(b"hello from the device\r\n");
    read_until(&mut client, b"hello from the device").await?;

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn device_output_reaches_every_client() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;

    let mut first = connect(port).await?;
    read_until(&mut first, b"is connected").await?;

    let mut second = connect(port).await?;
    read_until(&mut second, b"Baudrate").await?;

    device.feed(b"boot ok\r\n");

    read_until(&mut first, b"boot ok").await?;
    read_until(&mut second, b"boot ok").await?;

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn client_writes_reach_the_device_and_echo_to_everyone() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;
    device.set_echo(true);

    let mut talker = connect(port).await?;
    read_until(&mut talker, b"is connected").await?;

    let mut listener = connect(port).await?;
    read_until(&mut listener, b"Baudrate").await?;

    talker.write_all(b"AT+GMR\r\n").await?;

    eventually(
        || device.written() == b"AT+GMR\r\n",
        "the command to reach the device",
    )
    .await?;

    // The echo comes back off the wire and is broadcast like any other
    // device output, the talker included.
    read_until(&mut talker, b"AT+GMR").await?;
    read_until(&mut listener, b"AT+GMR").await?;

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn arrow_up_replays_the_last_line_to_its_sender_only() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;

    let mut client = connect(port).await?;
    read_until(&mut client, b"is connected").await?;

    client.write_all(b"version\r\n").await?;
    eventually(
        || contains(&device.written(), b"version\r\n"),
        "the line to reach the device",
    )
    .await?;

    client.write_all(b"\x1b[A\r").await?;
    let seen = read_until(&mut client, b"version\r\n").await?;
    assert!(contains(&seen, b"version\r\n"));

    // The escape never goes to the device.
    eventually(
        || !contains(&device.written(), b"\x1b"),
        "the device to stay clear of escapes",
    )
    .await?;

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn the_exit_sentinel_takes_the_whole_server_down() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;

    let mut asking = connect(port).await?;
    read_until(&mut asking, b"is connected").await?;

    let mut bystander = connect(port).await?;
    read_until(&mut bystander, b"Baudrate").await?;

    asking.write_all(EXIT_SENTINEL).await?;

    // Both peers get the goodbye, end-of-transmission last, then the
    // sockets close.
    let rest = read_until_eof(&mut asking).await?;
    assert!(contains(&rest, CLOSE_NOTICE));

    let rest = read_until_eof(&mut bystander).await?;
    assert!(contains(&rest, CLOSE_NOTICE));

    timeout(Duration::from_secs(10), bridge.wait_closed()).await?;

    // The sentinel itself never reaches the device.
    assert!(!contains(&device.written(), b"exit"));

    // The device is released by the time the shutdown is observable.
    assert!(!device.is_open());
    assert!(!bridge.link().is_connected());

    // Nobody can connect anymore.
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_err());

    // A second shutdown is a no-op.
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn an_unplug_is_announced_and_healed() -> Result<()> {
    let (bridge, device, port) = start_bridge(true).await?;

    let mut client = connect(port).await?;
    read_until(&mut client, b"is connected").await?;

    device.set_present(false);
    read_until(&mut client, b"\x02Device: /dev/ttyMOCK0 is disconnected\x03\r\n").await?;

    device.set_present(true);
    read_until(&mut client, b"is connected").await?;

    device.feed(b"survived the unplug\r\n");
    read_until(&mut client, b"survived the unplug").await?;

    bridge.shutdown().await;
    Ok(())
}
