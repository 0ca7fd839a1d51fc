//! A mock serial device, useful to test the server without actual serial ports.
//!
//! [`MockDevice`] is the controller side handed to tests: plug and unplug the
//! device, feed it bytes to emit, inspect what was written to it.
//! [`MockBackend`] plugs into [`crate::link::Backend`] so a
//! [`crate::link::Link`] drives the mock exactly like a real port.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::{config::SerialSettings, link::Backend};

#[derive(Default)]
struct DeviceState {
    present: bool,
    echo: bool,
    open_handles: usize,

    // Device to host.
    rx: VecDeque<u8>,
    // Host to device.
    tx: Vec<u8>,
}

/// Handle to a fake serial device shared with any number of open ports.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    /// A new device, attached or not.
    pub fn new(present: bool) -> Self {
        let device = Self::default();
        device.lock().present = present;
        device
    }

    /// Plug the device in or yank it out.
    ///
    /// Yanking makes every open handle fail its next operation, the same
    /// way a real USB adapter disappears mid-read.
    pub fn set_present(&self, present: bool) {
        self.lock().present = present;
    }

    /// Let the device emit bytes towards the host.
    pub fn feed(&self, data: &[u8]) {
        self.lock().rx.extend(data.iter().copied());
    }

    /// Everything the host has written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().tx.clone()
    }

    /// When enabled, every byte written to the device is also emitted
    /// back towards the host, like a modem with echo on.
    pub fn set_echo(&self, echo: bool) {
        self.lock().echo = echo;
    }

    /// Whether any port handle to the device is currently open.
    pub fn is_open(&self) -> bool {
        self.lock().open_handles > 0
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("mock device lock should not be poisoned")
    }
}

/// [`Backend`] which exposes a single [`MockDevice`] under a fixed name.
pub struct MockBackend {
    name: String,
    device: MockDevice,
}

impl MockBackend {
    /// A backend where `name` resolves to the given device.
    pub fn new(name: &str, device: MockDevice) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }
}

impl Backend for MockBackend {
    fn available_ports(&self) -> Vec<String> {
        if self.device.lock().present {
            vec![self.name.clone()]
        } else {
            vec![]
        }
    }

    fn open(&self, settings: &SerialSettings) -> serialport::Result<Box<dyn SerialPort>> {
        if settings.device != self.name {
            return Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                format!("No such mock device: {}", settings.device),
            ));
        }

        let parity = settings
            .parity
            .to_serialport()
            .map_err(|e| serialport::Error::new(serialport::ErrorKind::InvalidInput, e.to_string()))?;

        let mut state = self.device.lock();
        if !state.present {
            return Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                format!("Mock device {} is not present", self.name),
            ));
        }

        state.open_handles += 1;
        drop(state);

        debug!(device = %self.name, "Opening mock device");

        Ok(Box::new(MockPort {
            state: Arc::clone(&self.device.state),
            name: self.name.clone(),
            baud_rate: settings.baudrate,
            data_bits: DataBits::Eight,
            parity,
            stop_bits: settings.stop_bits.to_serialport(),
            flow_control: if settings.xonxoff {
                FlowControl::Software
            } else {
                FlowControl::None
            },
            timeout: settings.timeout(),
        }))
    }
}

/// One open handle to a [`MockDevice`].
struct MockPort {
    state: Arc<Mutex<DeviceState>>,
    name: String,
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    flow_control: FlowControl,
    timeout: Duration,
}

impl MockPort {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("mock device lock should not be poisoned")
    }
}

impl Drop for MockPort {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

impl io::Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;

        loop {
            {
                let mut state = self.lock();

                // A yanked device reads as end of file.
                if !state.present {
                    return Ok(0);
                }

                if !state.rx.is_empty() {
                    let n = buf.len().min(state.rx.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = state.rx.pop_front().expect("rx is non-empty");
                    }
                    return Ok(n);
                }
            }

            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "No data within the port timeout",
                ));
            }

            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl io::Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();

        if !state.present {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Device is gone"));
        }

        state.tx.extend_from_slice(buf);

        if state.echo {
            state.rx.extend(buf.iter().copied());
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialPort for MockPort {
    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(self.baud_rate)
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        Ok(self.data_bits)
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        Ok(self.flow_control)
    }

    fn parity(&self) -> serialport::Result<Parity> {
        Ok(self.parity)
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        Ok(self.stop_bits)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> serialport::Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn set_data_bits(&mut self, data_bits: DataBits) -> serialport::Result<()> {
        self.data_bits = data_bits;
        Ok(())
    }

    fn set_flow_control(&mut self, flow_control: FlowControl) -> serialport::Result<()> {
        self.flow_control = flow_control;
        Ok(())
    }

    fn set_parity(&mut self, parity: Parity) -> serialport::Result<()> {
        self.parity = parity;
        Ok(())
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> serialport::Result<()> {
        self.stop_bits = stop_bits;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn bytes_to_read(&self) -> serialport::Result<u32> {
        let state = self.lock();

        if !state.present {
            return Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "Device is gone",
            ));
        }

        Ok(state.rx.len() as u32)
    }

    fn bytes_to_write(&self) -> serialport::Result<u32> {
        Ok(0)
    }

    fn clear(&self, buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
        let mut state = self.lock();

        match buffer_to_clear {
            ClearBuffer::Input => state.rx.clear(),
            ClearBuffer::Output => state.tx.clear(),
            ClearBuffer::All => {
                state.rx.clear();
                state.tx.clear();
            }
        }

        Ok(())
    }

    fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
        let mut state = self.lock();
        state.open_handles += 1;
        drop(state);

        Ok(Box::new(MockPort {
            state: Arc::clone(&self.state),
            name: self.name.clone(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
            flow_control: self.flow_control,
            timeout: self.timeout,
        }))
    }

    fn set_break(&self) -> serialport::Result<()> {
        Ok(())
    }

    fn clear_break(&self) -> serialport::Result<()> {
        Ok(())
    }
}
