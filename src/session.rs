//! One TCP client of the server.
//!
//! A [`Session`] owns the socket to a single peer. Received data is handed
//! to [`SessionCallbacks::on_received`], outgoing data goes through an
//! unbounded outbox drained by a writer task, so a slow peer never stalls
//! whoever is broadcasting.
//!
//! Each session also keeps a small history of what the peer sent and plays
//! the most recent entry back when the peer presses arrow-up, which is what
//! interactive use over plain `nc` needs most.

use std::{
    collections::VecDeque,
    fmt::Display,
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::error::Error;

/// A session gives up once it has seen more than this many receive errors.
pub const MAX_ERRORS: u32 = 5;

/// How many received chunks a session keeps around for replay.
pub const HISTORY_CAPACITY: usize = 10;

/// Arrow-up followed by enter, the way a raw terminal sends it.
pub const REPLAY_ESCAPE: &[u8] = b"\x1b[A\r";

// One receive attempt waits this long before the session re-checks whether
// it should still be running.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Invoked with every chunk the session receives from its peer.
pub type OnSessionReceived = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Invoked when a session starts or stops serving its peer.
pub type OnSessionEvent = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Hooks into the session lifecycle.
///
/// All hooks default to no-ops. They are called from the session's own task
/// and must not block.
#[derive(Clone)]
pub struct SessionCallbacks {
    /// The peer sent a chunk of bytes.
    pub on_received: OnSessionReceived,

    /// The session task started serving the peer.
    pub on_connect: OnSessionEvent,

    /// The session task stopped, the peer is gone.
    pub on_disconnect: OnSessionEvent,
}

impl Default for SessionCallbacks {
    fn default() -> Self {
        Self {
            on_received: Arc::new(|_| {}),
            on_connect: Arc::new(|_| {}),
            on_disconnect: Arc::new(|_| {}),
        }
    }
}

struct SessionIo {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outbox_rx: UnboundedReceiver<Bytes>,
}

/// A connected TCP peer.
///
/// Sessions compare, hash and display as their peer address.
pub struct Session {
    peer: SocketAddr,
    callbacks: SessionCallbacks,

    running: AtomicBool,
    errors: AtomicU32,

    history: Mutex<VecDeque<Bytes>>,
    outbox: Mutex<Option<UnboundedSender<Bytes>>>,

    io: Mutex<Option<SessionIo>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Wrap an accepted connection.
    ///
    /// Configures the socket for interactive use (no Nagle, aggressive
    /// keepalive) but does not read from it until [`Session::start`].
    pub fn new(stream: TcpStream, callbacks: SessionCallbacks) -> Result<Arc<Self>, Error> {
        let peer = stream.peer_addr()?;
        configure_socket(&stream)?;

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (reader, writer) = stream.into_split();

        Ok(Arc::new(Self {
            peer,
            callbacks,
            running: AtomicBool::new(false),
            errors: AtomicU32::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            outbox: Mutex::new(Some(outbox_tx)),
            io: Mutex::new(Some(SessionIo {
                reader,
                writer,
                outbox_rx,
            })),
            task: Mutex::new(None),
        }))
    }

    /// Start serving the peer.
    pub fn start(self: &Arc<Self>) {
        let Some(io) = self.lock_io().take() else {
            warn!(peer = %self.peer, "Session was already started");
            return;
        };

        self.errors.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let session = Arc::clone(self);
        let span = info_span!("session", peer = %self.peer);
        let task = tokio::spawn(async move { session.run(io).await }.instrument(span));

        *self.lock_task() = Some(task);
    }

    async fn run(self: Arc<Self>, io: SessionIo) {
        let SessionIo {
            mut reader,
            writer,
            outbox_rx,
        } = io;

        let writer_task = tokio::spawn(write_loop(writer, outbox_rx).instrument(Span::current()));

        debug!("Session started");

        let greeting = format!("Connection established: {}\r\n", self.peer);
        if let Err(e) = self.send(Bytes::from(greeting)) {
            debug!(%e, "Could not greet the peer");
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        (self.callbacks.on_connect)(&self);

        let mut buf = vec![0u8; 2048];

        while self.running.load(Ordering::SeqCst) {
            match timeout(RECEIVE_TIMEOUT, reader.read(&mut buf)).await {
                // Nothing yet, go around and re-check the running flag.
                Err(_elapsed) => {}
                Ok(Ok(0)) => {
                    debug!("End of stream from the peer");
                    self.errors.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Ok(n)) => self.handle_received(&buf[..n]),
                Ok(Err(e)) => {
                    debug!(%e, "Receive failed");
                    self.errors.fetch_add(1, Ordering::SeqCst);
                }
            }

            if self.errors.load(Ordering::SeqCst) > MAX_ERRORS {
                debug!("Too many errors, closing the session");
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);

        // Dropping the outbox lets the writer drain anything still queued,
        // the close notice included, and then push a FIN.
        drop(self.lock_outbox().take());

        let abort_writer = writer_task.abort_handle();
        if timeout(Duration::from_secs(1), writer_task).await.is_err() {
            abort_writer.abort();
        }

        drop(reader);

        debug!("Session stopped");
        (self.callbacks.on_disconnect)(&self);
    }

    fn handle_received(&self, data: &[u8]) {
        if contains_replay_escape(data) {
            let replayed = self.lock_history().pop_back();

            match replayed {
                Some(chunk) => {
                    debug!(bytes = chunk.len(), "Replaying the last received chunk");

                    if let Err(e) = self.send(chunk) {
                        debug!(%e, "Could not replay to the peer");
                        self.errors.fetch_add(1, Ordering::SeqCst);
                    }
                }
                None => debug!("Nothing to replay"),
            }

            return;
        }

        {
            let mut history = self.lock_history();
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(Bytes::copy_from_slice(data));
        }

        (self.callbacks.on_received)(data);
    }

    /// Queue bytes for the peer.
    ///
    /// Fails once the session has stopped and its outbox is gone.
    pub fn send(&self, data: Bytes) -> Result<(), Error> {
        self.lock_outbox()
            .as_ref()
            .ok_or(Error::SessionClosed(self.peer))?
            .send(data)
            .map_err(|_| Error::SessionClosed(self.peer))
    }

    /// Ask the session task to wind down. Returns immediately.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the session task to finish.
    pub(crate) async fn join(&self) {
        let task = self.lock_task().take();

        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// The peer this session serves.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.history.lock().expect("session history lock should not be poisoned")
    }

    fn lock_outbox(&self) -> std::sync::MutexGuard<'_, Option<UnboundedSender<Bytes>>> {
        self.outbox.lock().expect("session outbox lock should not be poisoned")
    }

    fn lock_io(&self) -> std::sync::MutexGuard<'_, Option<SessionIo>> {
        self.io.lock().expect("session io lock should not be poisoned")
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().expect("session task lock should not be poisoned")
    }

    /// A session with no socket behind it.
    #[cfg(test)]
    pub(crate) fn dummy(
        peer: SocketAddr,
        callbacks: SessionCallbacks,
    ) -> (Arc<Self>, UnboundedReceiver<Bytes>) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                peer,
                callbacks,
                running: AtomicBool::new(false),
                errors: AtomicU32::new(0),
                history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
                outbox: Mutex::new(Some(outbox_tx)),
                io: Mutex::new(None),
                task: Mutex::new(None),
            }),
            outbox_rx,
        )
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer
    }
}

impl Eq for Session {}

impl Hash for Session {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
    }
}

impl Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.peer)
    }
}

// The callbacks are opaque, the peer is what identifies a session.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("peer", &self.peer).finish()
    }
}

fn contains_replay_escape(data: &[u8]) -> bool {
    data.windows(REPLAY_ESCAPE.len()).any(|window| window == REPLAY_ESCAPE)
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbox: UnboundedReceiver<Bytes>) {
    while let Some(data) = outbox.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(%e, "Write to the peer failed");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

fn configure_socket(stream: &TcpStream) -> Result<(), Error> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(1))
        .with_interval(Duration::from_secs(1))
        .with_retries(3);
    sock.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn sessions_are_their_peer_address() {
        let (a, _rx_a) = Session::dummy(addr(10_000), SessionCallbacks::default());
        let (b, _rx_b) = Session::dummy(addr(10_000), SessionCallbacks::default());
        let (c, _rx_c) = Session::dummy(addr(10_001), SessionCallbacks::default());

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn history_is_capped() {
        let (session, _rx) = Session::dummy(addr(10_002), SessionCallbacks::default());

        for n in 0..(HISTORY_CAPACITY + 5) {
            session.handle_received(format!("line {n}\r\n").as_bytes());
        }

        let history = session.lock_history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.front().unwrap().as_ref(), b"line 5\r\n");
        assert_eq!(history.back().unwrap().as_ref(), b"line 14\r\n");
    }

    #[test]
    fn replay_returns_the_last_chunk_and_consumes_it() {
        let forwarded = Arc::new(Mutex::new(Vec::<u8>::new()));
        let sink = Arc::clone(&forwarded);

        let callbacks = SessionCallbacks {
            on_received: Arc::new(move |data| {
                sink.lock().unwrap().extend_from_slice(data);
            }),
            ..Default::default()
        };

        let (session, mut rx) = Session::dummy(addr(10_003), callbacks);

        session.handle_received(b"first\r\n");
        session.handle_received(b"second\r\n");
        session.handle_received(REPLAY_ESCAPE);

        // The replayed chunk goes back to the peer.
        assert_eq!(rx.try_recv().unwrap().as_ref(), b"second\r\n");

        // The escape itself was not forwarded.
        assert_eq!(forwarded.lock().unwrap().as_slice(), b"first\r\nsecond\r\n");

        // Replay is destructive.
        session.handle_received(REPLAY_ESCAPE);
        assert_eq!(rx.try_recv().unwrap().as_ref(), b"first\r\n");

        session.handle_received(REPLAY_ESCAPE);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn replay_with_empty_history_does_nothing() {
        let (session, mut rx) = Session::dummy(addr(10_004), SessionCallbacks::default());

        session.handle_received(REPLAY_ESCAPE);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_fails_once_the_peer_is_gone() {
        let (session, rx) = Session::dummy(addr(10_005), SessionCallbacks::default());
        drop(rx);

        let error = session.send(Bytes::from_static(b"late")).unwrap_err();
        assert!(matches!(error, Error::SessionClosed(_)));
    }
}
