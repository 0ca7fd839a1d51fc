//! Glue between the serial link and the TCP server.
//!
//! The [`Bridge`] owns one [`Link`] and one [`Server`] and moves bytes
//! between them: everything the device says is broadcast to every session,
//! everything any session says is queued onto the device. Link and session
//! lifecycle events funnel through one ordered event loop, so every peer
//! sees the same things in the same order.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch, Mutex as TokioMutex, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    error::Error,
    link::{Backend, Link, LinkCallbacks, SystemBackend},
    server::Server,
    session::{Session, SessionCallbacks},
};

/// Receiving this from any peer shuts the whole server down.
pub const EXIT_SENTINEL: &[u8] = b"exit\xff";

/// The goodbye sent to every peer on shutdown, end-of-transmission last.
pub const CLOSE_NOTICE: &[u8] = b"\x02Session is closed\x03\r\n\x04";

enum Event {
    /// The device emitted bytes.
    FromLink(Bytes),
    /// The device was opened.
    LinkUp,
    /// The device was lost or closed.
    LinkDown,
    /// A session started serving a peer.
    Connected(Arc<Session>),
    /// A session ended.
    Disconnected(std::net::SocketAddr),
}

/// One serial device, many TCP peers.
pub struct Bridge {
    config: Config,
    link: Arc<Link>,
    server: Arc<Server>,

    exit_requested: Arc<Notify>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    shutdown_done: TokioMutex<bool>,
    closed: watch::Sender<bool>,
}

impl Bridge {
    /// A bridge over the operating system's serial devices.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_backend(config, Arc::new(SystemBackend))
    }

    /// A bridge over the given backend, with the default exit sentinel.
    ///
    /// Must be called within a tokio runtime.
    pub fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Arc<Self> {
        Self::with_exit_sentinel(config, backend, EXIT_SENTINEL.to_vec())
    }

    /// A bridge whose peers shut it down by sending `exit_sentinel`.
    ///
    /// Must be called within a tokio runtime.
    pub fn with_exit_sentinel(
        config: Config,
        backend: Arc<dyn Backend>,
        exit_sentinel: Vec<u8>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (to_serial_tx, to_serial_rx) = mpsc::unbounded_channel();
        let exit_requested = Arc::new(Notify::new());

        let link_callbacks = LinkCallbacks {
            on_received: {
                let events = events_tx.clone();
                Arc::new(move |data| {
                    let _ = events.send(Event::FromLink(Bytes::copy_from_slice(data)));
                })
            },
            on_connect: {
                let events = events_tx.clone();
                Arc::new(move || {
                    let _ = events.send(Event::LinkUp);
                })
            },
            on_disconnect: {
                let events = events_tx.clone();
                Arc::new(move || {
                    let _ = events.send(Event::LinkDown);
                })
            },
        };

        let link = Arc::new(Link::new(
            config.serial.clone(),
            config.keep_active,
            link_callbacks,
            backend,
        ));

        let session_callbacks = SessionCallbacks {
            on_received: {
                let exit = Arc::clone(&exit_requested);
                Arc::new(move |data| {
                    if contains(data, &exit_sentinel) {
                        info!("Exit requested by a peer");
                        exit.notify_one();
                        return;
                    }

                    let _ = to_serial_tx.send(Bytes::copy_from_slice(data));
                })
            },
            on_connect: {
                let events = events_tx.clone();
                Arc::new(move |session| {
                    let _ = events.send(Event::Connected(Arc::clone(session)));
                })
            },
            on_disconnect: {
                let events = events_tx;
                Arc::new(move |session| {
                    let _ = events.send(Event::Disconnected(session.peer()));
                })
            },
        };

        let server = Server::new(session_callbacks);

        let tasks = vec![
            tokio::spawn(
                event_loop(Arc::clone(&link), Arc::clone(&server), events_rx)
                    .instrument(info_span!("bridge")),
            ),
            tokio::spawn(
                serial_write_loop(Arc::clone(&link), to_serial_rx)
                    .instrument(info_span!("serial-write")),
            ),
        ];

        let (closed, _) = watch::channel(false);

        Arc::new(Self {
            config,
            link,
            server,
            exit_requested,
            tasks: StdMutex::new(tasks),
            shutdown_done: TokioMutex::new(false),
            closed,
        })
    }

    /// Validate the configuration and start serving.
    ///
    /// The device itself is only opened once the first peer connects.
    /// Returns the actual TCP port.
    pub async fn start(self: &Arc<Self>) -> Result<u16, Error> {
        self.config.validate()?;

        let port = self.server.run(self.config.tcp_port).await?;

        // One peer sending the exit sentinel takes the whole server down.
        // A sentinel received before this point is kept by the notify.
        let bridge = Arc::clone(self);
        tokio::spawn(
            async move {
                bridge.exit_requested.notified().await;
                bridge.shutdown().await;
            }
            .instrument(info_span!("exit-watch")),
        );

        info!(
            device = %self.config.serial.device,
            port,
            "Bridging the device"
        );

        Ok(port)
    }

    /// Take everything down in order.
    ///
    /// Every peer gets the close notice, the notices flush while the
    /// sessions stop, then the device is released. Idempotent, and safe
    /// to race from several tasks.
    pub async fn shutdown(&self) {
        let mut done = self.shutdown_done.lock().await;
        if *done {
            return;
        }
        *done = true;

        info!("Shutting down");

        self.server.broadcast(Bytes::from_static(CLOSE_NOTICE));
        self.server.stop().await;
        self.link.close().await;

        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        // `send_replace`, not `send`: the value must stick even when
        // nobody is waiting yet.
        self.closed.send_replace(true);
        info!("Shutdown complete");
    }

    /// Resolves once [`Bridge::shutdown`] has completed.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// The serial side.
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// The TCP side.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().expect("bridge task lock should not be poisoned")
    }
}

/// Frame a status message the way peers see them, STX and ETX around
/// the text.
fn status_line(message: &str) -> Bytes {
    Bytes::from(format!("\x02{message}\x03\r\n"))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

async fn event_loop(link: Arc<Link>, server: Arc<Server>, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Connected(session) => {
                // First peer in wakes the device up.
                if !link.is_connected() {
                    if let Err(e) = link.open() {
                        warn!(%e, "Could not open the device for a new session");
                    }
                }

                let device = &link.settings().device;

                let mut banner = vec![
                    status_line(&format!("Device: {device}")),
                    status_line(&format!("Baudrate: {}", link.settings().baudrate)),
                ];
                if !link.is_connected() {
                    banner.push(status_line(&format!("Device: {device} is not accessible")));
                }

                for line in banner {
                    if let Err(e) = session.send(line) {
                        debug!(%session, %e, "Could not send the banner");
                        break;
                    }
                }
            }
            Event::Disconnected(peer) => {
                debug!(%peer, "Session ended");

                // Last peer out releases the device.
                if server.sessions().is_empty() {
                    info!("No sessions left, releasing the device");
                    link.close().await;
                }
            }
            Event::FromLink(data) => server.broadcast(data),
            Event::LinkUp => {
                let device = &link.settings().device;
                server.broadcast(status_line(&format!("Device: {device} is connected")));
            }
            Event::LinkDown => {
                let device = &link.settings().device;
                server.broadcast(status_line(&format!("Device: {device} is disconnected")));
            }
        }
    }

    debug!("Event loop stopped");
}

/// Writes from all sessions funnel through here, one at a time, so paced
/// writes to a slow device never interleave.
async fn serial_write_loop(link: Arc<Link>, mut to_serial: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(data) = to_serial.recv().await {
        link.send(data).await;
    }

    debug!("Serial write loop stopped");
}
