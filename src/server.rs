//! The TCP server and its session registry.
//!
//! The server accepts connections, wraps each one in a
//! [`Session`] and keeps the live ones in a registry so data from the
//! serial side can be broadcast to everyone at once. Sessions remove
//! themselves from the registry through their disconnect hook.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::Error,
    session::{Session, SessionCallbacks},
};

/// The port served when none is configured, "telnet" twice.
pub const DEFAULT_PORT: u16 = 2323;

// One accept attempt waits this long before re-checking the running flag.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Accepts TCP peers and tracks their sessions.
pub struct Server {
    callbacks: SessionCallbacks,
    registry: Mutex<HashSet<Arc<Session>>>,
    running: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// A server which will hand every accepted session the given callbacks.
    pub fn new(callbacks: SessionCallbacks) -> Arc<Self> {
        Arc::new(Self {
            callbacks,
            registry: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            accept_task: Mutex::new(None),
        })
    }

    /// Bind and start accepting.
    ///
    /// Returns the actual port, which matters when asked to bind port `0`.
    pub async fn run(self: &Arc<Self>, port: u16) -> Result<u16, Error> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| Error::Bind { port, source })?;

        let addr = listener.local_addr()?;
        info!(%addr, "Listening");

        self.running.store(true, Ordering::SeqCst);

        let server = Arc::clone(self);
        let task = tokio::spawn(
            async move { server.accept_loop(listener).await }.instrument(info_span!("accept")),
        );
        *self.lock_accept() = Some(task);

        Ok(addr.port())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
                // Nothing new, go around and re-check the running flag.
                Err(_elapsed) => {}
                Ok(Ok((stream, peer))) => {
                    debug!(%peer, "Accepted");
                    self.register(stream);
                }
                Ok(Err(e)) => warn!(%e, "Accept failed"),
            }
        }

        // Returning drops the listener, the port is released before the
        // sessions are taken down.
        debug!("Accept loop stopped");
    }

    fn register(self: &Arc<Self>, stream: TcpStream) {
        let server = Arc::clone(self);
        let outer_disconnect = Arc::clone(&self.callbacks.on_disconnect);

        // Sessions deregister themselves before the user hook runs.
        let callbacks = SessionCallbacks {
            on_disconnect: Arc::new(move |session| {
                server.remove(session);
                (outer_disconnect)(session);
            }),
            ..self.callbacks.clone()
        };

        match Session::new(stream, callbacks) {
            Ok(session) => {
                self.add(Arc::clone(&session));
                session.start();
            }
            Err(e) => warn!(%e, "Could not set up the session"),
        }
    }

    fn add(&self, session: Arc<Session>) {
        let mut registry = self.lock_registry();

        // Keyed on the peer address, a reconnect from the same address
        // collapses onto one entry.
        registry.insert(session);
        debug!(sessions = registry.len(), "Session registered");
    }

    fn remove(&self, session: &Arc<Session>) {
        let mut registry = self.lock_registry();
        registry.remove(session);
        debug!(sessions = registry.len(), "Session deregistered");
    }

    /// Queue bytes to every connected session.
    ///
    /// A session which cannot take the data is skipped and the rest still
    /// get theirs.
    pub fn broadcast(&self, data: Bytes) {
        for session in self.sessions() {
            if let Err(e) = session.send(data.clone()) {
                debug!(%session, %e, "Skipping the session for this broadcast");
            }
        }
    }

    /// A snapshot of the connected sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.lock_registry().iter().cloned().collect()
    }

    /// Stop accepting, then stop and join every session.
    ///
    /// The listening socket closes before the sessions are joined, so
    /// nobody new connects while the goodbyes go out. Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        for session in self.sessions() {
            session.stop();
        }

        // Bind first, the lock guard must not live across the await.
        let task = self.lock_accept().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        // Catches sessions accepted while we were signalling, too.
        for session in self.sessions() {
            session.stop();
            session.join().await;
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashSet<Arc<Session>>> {
        self.registry.lock().expect("server registry lock should not be poisoned")
    }

    fn lock_accept(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.accept_task.lock().expect("server accept lock should not be poisoned")
    }
}
