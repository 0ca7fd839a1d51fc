//! The serial link supervisor.
//!
//! One [`Link`] owns the one physical serial device the server exposes. It
//! keeps a reader on a blocking thread, hands every received chunk to the
//! [`LinkCallbacks::on_received`] hook, and (when `keep_active` is set)
//! runs a reconnect task which polls for the device whenever the handle is
//! lost, so an unplugged cable heals without anyone asking.

use std::{
    io,
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

use bytes::Bytes;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{config::SerialSettings, error::Error};

/// Invoked by the read task with every chunk received from the device.
pub type OnReceived = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Invoked when the link changes state.
pub type OnLinkEvent = Arc<dyn Fn() + Send + Sync>;

/// Hooks into the link lifecycle.
///
/// All hooks default to no-ops, so users only set the ones they care about.
/// They are called from the link's own tasks and must not block.
#[derive(Clone)]
pub struct LinkCallbacks {
    /// A chunk of bytes arrived from the device.
    pub on_received: OnReceived,

    /// The device was opened and is being read.
    pub on_connect: OnLinkEvent,

    /// An open device handle was lost or closed.
    pub on_disconnect: OnLinkEvent,
}

impl Default for LinkCallbacks {
    fn default() -> Self {
        Self {
            on_received: Arc::new(|_| {}),
            on_connect: Arc::new(|| {}),
            on_disconnect: Arc::new(|| {}),
        }
    }
}

/// Access to the serial devices of a system.
///
/// The link goes through this trait both to open its device and to poll
/// which devices are currently attached, which is what lets tests swap in
/// [`crate::mock::MockBackend`] and unplug a fake device at will.
pub trait Backend: Send + Sync {
    /// Identifiers of the currently attached serial devices.
    fn available_ports(&self) -> Vec<String>;

    /// Open a handle to the device described by the settings.
    fn open(&self, settings: &SerialSettings) -> serialport::Result<Box<dyn serialport::SerialPort>>;
}

/// [`Backend`] over the operating system's real serial devices.
pub struct SystemBackend;

impl Backend for SystemBackend {
    fn available_ports(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|port| port.port_name).collect(),
            Err(e) => {
                warn!(%e, "Could not enumerate serial devices");
                vec![]
            }
        }
    }

    fn open(&self, settings: &SerialSettings) -> serialport::Result<Box<dyn serialport::SerialPort>> {
        let parity = settings
            .parity
            .to_serialport()
            .map_err(|e| serialport::Error::new(serialport::ErrorKind::InvalidInput, e.to_string()))?;

        serialport::new(settings.device.as_str(), settings.baudrate)
            .parity(parity)
            .stop_bits(settings.stop_bits.to_serialport())
            .flow_control(if settings.xonxoff {
                serialport::FlowControl::Software
            } else {
                serialport::FlowControl::None
            })
            .timeout(settings.timeout())
            .open()
    }
}

/// The externally visible state of a [`Link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No device handle, and nobody is looking for one.
    Closed,

    /// The device handle is open and the read task is running.
    Open,

    /// No device handle, the reconnect task is polling for the device.
    Reconnecting,
}

struct Inner {
    port: Option<Box<dyn serialport::SerialPort>>,
    read_task: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Shared {
    settings: SerialSettings,
    keep_active: bool,
    callbacks: LinkCallbacks,
    backend: Arc<dyn Backend>,

    inner: Mutex<Inner>,

    connected: AtomicBool,
    close_requested: AtomicBool,

    // How many read tasks are still alive. Each holds its own clone of
    // the device handle, so closing is only done once this reaches zero.
    readers: watch::Sender<usize>,

    // Most recently received byte, `0` meaning "nothing yet".
    // Paced writes use it to detect the echo of the byte they just sent.
    last_byte: AtomicU8,

    // Bumped on every successful open so a read task which lost a race
    // can tell that the handle it was started for is gone.
    generation: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("link state lock should not be poisoned")
    }

    fn serving(&self, generation: u64) -> bool {
        self.connected.load(Ordering::SeqCst)
            && !self.close_requested.load(Ordering::SeqCst)
            && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Open the device and start its read task. The caller holds the lock
    /// and has checked that no handle is currently open.
    fn open_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<(), Error> {
        let open_error = |source| Error::OpenFailed {
            device: self.settings.device.clone(),
            source,
        };

        let port = self.backend.open(&self.settings).map_err(open_error)?;
        let reader = port.try_clone().map_err(open_error)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.port = Some(port);
        self.connected.store(true, Ordering::SeqCst);

        self.readers.send_modify(|count| *count += 1);

        let shared = Arc::clone(self);
        inner.read_task = Some(tokio::task::spawn_blocking(move || {
            read_loop(shared, reader, generation)
        }));

        info!(
            device = %self.settings.device,
            baudrate = self.settings.baudrate,
            "Serial device opened"
        );

        Ok(())
    }

    /// Drop the device handle (if any) and fire `on_disconnect` when there
    /// was one to drop. The caller holds the lock.
    fn drop_handle_locked(&self, inner: &mut Inner) {
        let was_open = inner.port.take().is_some();
        self.connected.store(false, Ordering::SeqCst);

        if was_open {
            info!(device = %self.settings.device, "Serial device closed");
            (self.callbacks.on_disconnect)();
        }
    }

    /// Start the reconnect task unless one is already running.
    /// The caller holds the lock.
    fn spawn_reconnect_locked(self: &Arc<Self>, inner: &mut Inner) {
        if inner.reconnect.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let shared = Arc::clone(self);
        let span = info_span!("reconnect", device = %self.settings.device);
        inner.reconnect = Some(tokio::spawn(
            async move { shared.reconnect_loop().await }.instrument(span),
        ));
    }

    /// The read task saw the device fail. Clean up the dead handle and,
    /// if the link is kept active, start looking for the device again.
    fn read_failed(self: &Arc<Self>, generation: u64) {
        if self.close_requested.load(Ordering::SeqCst) {
            return;
        }

        if self.keep_active {
            let mut inner = self.lock();

            // A close or a newer open may have won the race to this lock.
            if self.close_requested.load(Ordering::SeqCst)
                || self.generation.load(Ordering::SeqCst) != generation
            {
                return;
            }

            self.drop_handle_locked(&mut inner);
            self.spawn_reconnect_locked(&mut inner);
        } else {
            self.close_requested.store(true, Ordering::SeqCst);

            let mut inner = self.lock();
            self.drop_handle_locked(&mut inner);
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let interval = self.settings.timeout();
        info!("Looking for the device");

        loop {
            if self.close_requested.load(Ordering::SeqCst) || self.connected.load(Ordering::SeqCst) {
                break;
            }

            let present = self
                .backend
                .available_ports()
                .iter()
                .any(|name| name == &self.settings.device);

            if present {
                if let Err(e) = self.reconnect_open() {
                    debug!(%e, "Open attempt failed");
                }
            }

            // Skip the nap when the attempt above just succeeded.
            if self.close_requested.load(Ordering::SeqCst) || self.connected.load(Ordering::SeqCst) {
                break;
            }

            tokio::time::sleep(interval).await;
        }

        debug!("Reconnect task stopped");
    }

    fn reconnect_open(self: &Arc<Self>) -> Result<(), Error> {
        let mut inner = self.lock();

        if self.close_requested.load(Ordering::SeqCst) || inner.port.is_some() {
            return Ok(());
        }

        self.open_locked(&mut inner)
    }

    fn blocking_send(&self, data: &[u8]) {
        let mut inner = self.lock();

        let Some(port) = inner.port.as_mut() else {
            debug!(bytes = data.len(), "Device not open, dropping write");
            return;
        };

        let paced = self.settings.char_delay().is_some() || self.settings.wait_echo().is_some();

        let result = if paced {
            self.send_paced(port.as_mut(), data)
        } else {
            port.write_all(data)
        };

        match result {
            Ok(()) => trace!(bytes = data.len(), "Sent"),
            Err(e) => warn!(%e, "Sending to the serial device failed"),
        }
    }

    /// Write one byte at a time, optionally sleeping between bytes and
    /// optionally waiting for each byte to be echoed back before sending
    /// the next one. Meant for devices which drop input when it arrives
    /// faster than they poll their UART.
    fn send_paced(&self, port: &mut dyn serialport::SerialPort, data: &[u8]) -> io::Result<()> {
        let char_delay = self.settings.char_delay();
        let wait_echo = self.settings.wait_echo();

        for &byte in data {
            port.write_all(&[byte])?;

            if let Some(delay) = char_delay {
                std::thread::sleep(delay);
            }

            if let Some(bound) = wait_echo {
                // NUL doubles as the nothing-received marker, never wait for it.
                if byte != 0 {
                    let deadline = Instant::now() + bound;

                    while self.last_byte.load(Ordering::Relaxed) != byte
                        && Instant::now() < deadline
                    {
                        std::hint::spin_loop();
                    }

                    self.last_byte.store(0, Ordering::Relaxed);
                }
            }
        }

        Ok(())
    }
}

/// Blocking loop reading the device until it fails or the link stops serving
/// the handle's generation.
fn read_loop(shared: Arc<Shared>, mut port: Box<dyn serialport::SerialPort>, generation: u64) {
    let span = info_span!("link-read", device = %shared.settings.device);
    let _enter = span.enter();

    debug!("Read task started");
    (shared.callbacks.on_connect)();

    let failed = loop {
        if !shared.serving(generation) {
            break false;
        }

        // Read whatever is buffered, or block (until the device timeout)
        // for a single byte when nothing is.
        let want = match port.bytes_to_read() {
            Ok(n) => (n as usize).max(1),
            Err(e) => {
                debug!(%e, "Could not query waiting bytes");
                break true;
            }
        };

        let mut chunk = vec![0u8; want];

        match port.read(&mut chunk) {
            Ok(0) => {
                debug!("End of file from the device");
                break true;
            }
            Ok(n) => {
                chunk.truncate(n);

                // Pick up anything which arrived while we were reading,
                // so one callback covers the whole burst.
                if let Ok(more) = port.bytes_to_read() {
                    let more = more as usize;
                    if more > 1 {
                        let first = chunk.len();
                        chunk.resize(first + more, 0);
                        match port.read(&mut chunk[first..]) {
                            Ok(m) => chunk.truncate(first + m),
                            Err(_) => chunk.truncate(first),
                        }
                    }
                }

                let last = *chunk.last().expect("chunk holds at least one byte");
                shared.last_byte.store(last, Ordering::Relaxed);

                trace!(bytes = chunk.len(), "Received");
                (shared.callbacks.on_received)(&chunk);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(%e, "Read failed");
                break true;
            }
        }
    };

    if failed {
        shared.read_failed(generation);
    }

    // The handle clone must be gone before the reader count drops,
    // `close` takes the count reaching zero as "device released".
    drop(port);
    shared.readers.send_modify(|count| *count -= 1);

    debug!("Read task stopped");
}

/// Supervisor for the one serial device this server fronts.
///
/// Opening is idempotent, closing is idempotent, and with `keep_active`
/// a lost device is re-acquired automatically. Writes from any number of
/// callers funnel through [`Link::send`], which serializes them onto the
/// device.
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    /// A closed link for the given device.
    ///
    /// `keep_active` decides what happens when the device is missing or
    /// lost: retry forever (polling every [`SerialSettings::timeout`]),
    /// or give up.
    pub fn new(
        settings: SerialSettings,
        keep_active: bool,
        callbacks: LinkCallbacks,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let (readers, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                settings,
                keep_active,
                callbacks,
                backend,
                inner: Mutex::new(Inner {
                    port: None,
                    read_task: None,
                    reconnect: None,
                }),
                connected: AtomicBool::new(false),
                close_requested: AtomicBool::new(false),
                readers,
                last_byte: AtomicU8::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Open the device and start reading it.
    ///
    /// Already open means success. When the open fails and the link is
    /// kept active, the error is logged, the reconnect task takes over
    /// and `Ok` is returned; otherwise the error goes to the caller.
    ///
    /// Must be called within a tokio runtime.
    pub fn open(&self) -> Result<(), Error> {
        let shared = &self.shared;
        shared.close_requested.store(false, Ordering::SeqCst);

        let mut inner = shared.lock();

        if inner.port.is_some() {
            return Ok(());
        }

        match shared.open_locked(&mut inner) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(%e, "Could not open the serial device");

                if shared.keep_active {
                    shared.spawn_reconnect_locked(&mut inner);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Close the device and stop the read and reconnect tasks.
    ///
    /// Idempotent. When this returns, no link task is running and no
    /// reconnect will be attempted until [`Link::open`] is called again.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.close_requested.store(true, Ordering::SeqCst);

        let (read_task, reconnect) = {
            let mut inner = shared.lock();
            shared.drop_handle_locked(&mut inner);
            (inner.read_task.take(), inner.reconnect.take())
        };

        // Join outside the lock, the tasks may need it to wind down.
        if let Some(task) = reconnect {
            let _ = task.await;
        }
        if let Some(task) = read_task {
            let _ = task.await;
        }

        // The read task holds its own clone of the device handle, and a
        // racing close may have taken its join handle. Wait for the task
        // itself either way.
        let mut readers = shared.readers.subscribe();
        let _ = readers.wait_for(|count| *count == 0).await;

        debug!(device = %shared.settings.device, "Link closed");
    }

    /// Send bytes to the device.
    ///
    /// The write happens on a blocking thread and respects the configured
    /// pacing. When the device is not open the data is dropped, matching
    /// what a broadcast to zero listeners would do in the other direction.
    pub async fn send(&self, data: Bytes) {
        let shared = Arc::clone(&self.shared);

        if let Err(e) = tokio::task::spawn_blocking(move || shared.blocking_send(&data)).await {
            error!(%e, "Serial send task failed");
        }
    }

    /// Whether the device handle is currently open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LinkState {
        if self.shared.connected.load(Ordering::SeqCst) {
            return LinkState::Open;
        }

        let inner = self.shared.lock();
        if inner.reconnect.as_ref().is_some_and(|task| !task.is_finished()) {
            LinkState::Reconnecting
        } else {
            LinkState::Closed
        }
    }

    /// The settings the link was created with.
    pub fn settings(&self) -> &SerialSettings {
        &self.shared.settings
    }
}
