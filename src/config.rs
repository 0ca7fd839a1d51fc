use std::{fmt, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Parity bit setting for the serial device.
///
/// The full five-letter surface (`N`/`E`/`O`/`S`/`M`) can be expressed,
/// but the serial backend only implements the first three.
/// [`Config::validate`] rejects the rest up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit.
    None,
    /// The parity bit makes the number of set bits even.
    Even,
    /// The parity bit makes the number of set bits odd.
    Odd,
    /// Parity bit always zero.
    Space,
    /// Parity bit always one.
    Mark,
}

impl Parity {
    pub(crate) fn to_serialport(self) -> Result<serialport::Parity, Error> {
        match self {
            Parity::None => Ok(serialport::Parity::None),
            Parity::Even => Ok(serialport::Parity::Even),
            Parity::Odd => Ok(serialport::Parity::Odd),
            Parity::Space | Parity::Mark => Err(Error::BadConfig(format!(
                "Parity `{self}` is not supported by the serial backend, use one of N/E/O"
            ))),
        }
    }
}

impl FromStr for Parity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "N" => Ok(Parity::None),
            "E" => Ok(Parity::Even),
            "O" => Ok(Parity::Odd),
            "S" => Ok(Parity::Space),
            "M" => Ok(Parity::Mark),
            other => Err(Error::BadConfig(format!(
                "`{other}` is not a parity, use one of N/E/O/S/M"
            ))),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
            Parity::Space => "S",
            Parity::Mark => "M",
        };
        write!(f, "{letter}")
    }
}

/// Number of stop bits transmitted after every character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit.
    One,
    /// Two stop bits.
    Two,
}

impl StopBits {
    pub(crate) fn to_serialport(self) -> serialport::StopBits {
        match self {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// How the serial device should be opened and driven.
// TODO: Data bits are fixed at the backend default of 8, expose them if a 7E1 device shows up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// The device to bridge.
    /// Likely "/dev/ttyACMx" or "COMx".
    pub device: String,

    /// Baud rate, e.g. 115200.
    pub baudrate: u32,

    /// Parity bit setting.
    pub parity: Parity,

    /// Stop bit setting.
    pub stop_bits: StopBits,

    /// Software (XON/XOFF) flow control.
    pub xonxoff: bool,

    /// Serial read timeout, in milliseconds.
    /// Doubles as the reconnect supervisor's poll interval.
    pub timeout_ms: u64,

    /// Delay inserted after each transmitted character, in milliseconds.
    /// Enables the paced write mode.
    pub char_delay_ms: Option<u64>,

    /// How long a paced write may wait for a transmitted character to be
    /// echoed back, in milliseconds. Enables the paced write mode.
    pub wait_echo_ms: Option<u64>,
}

impl SerialSettings {
    /// The serial read timeout and reconnect poll interval.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The per-character delay, if pacing is enabled.
    pub fn char_delay(&self) -> Option<Duration> {
        self.char_delay_ms.map(Duration::from_millis)
    }

    /// The echo wait bound, if echo suppression is enabled.
    pub fn wait_echo(&self) -> Option<Duration> {
        self.wait_echo_ms.map(Duration::from_millis)
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: String::new(),
            baudrate: 115_200,
            parity: Parity::None,
            stop_bits: StopBits::One,
            xonxoff: false,
            timeout_ms: 2000,
            char_delay_ms: None,
            wait_echo_ms: None,
        }
    }
}

/// The configuration used for running the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The TCP port sessions connect to.
    pub tcp_port: u16,

    /// The serial side of the bridge.
    pub serial: SerialSettings,

    /// Keep polling for the device and reopen it whenever it reappears.
    pub keep_active: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: crate::server::DEFAULT_PORT,
            serial: SerialSettings::default(),
            keep_active: true,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Panics if the input is not valid .ron.
    pub fn deserialize(input: &str) -> Self {
        Self::ron().from_str::<Config>(input).unwrap()
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            tcp_port: crate::server::DEFAULT_PORT,
            serial: SerialSettings {
                device: "/dev/ttyUSB0".into(),
                baudrate: 115_200,
                parity: Parity::None,
                stop_bits: StopBits::One,
                xonxoff: false,
                timeout_ms: 2000,
                char_delay_ms: Some(10),
                wait_echo_ms: Some(50),
            },
            keep_active: true,
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Self {
        let s = std::fs::read_to_string(p).unwrap();

        Self::deserialize(&s)
    }

    fn check_device(&self) -> Result<(), Error> {
        if self.serial.device.is_empty() {
            return Err(Error::BadConfig(
                "No serial device given, set one e.g. via `--device /dev/ttyUSB0`".into(),
            ));
        }

        Ok(())
    }

    fn check_baudrate(&self) -> Result<(), Error> {
        if self.serial.baudrate == 0 {
            return Err(Error::BadConfig("A baudrate of 0 is not usable".into()));
        }

        Ok(())
    }

    fn check_parity(&self) -> Result<(), Error> {
        self.serial.parity.to_serialport().map(|_| ())
    }

    fn check_timeout(&self) -> Result<(), Error> {
        if self.serial.timeout_ms == 0 {
            return Err(Error::BadConfig(
                "A timeout of 0 ms would spin the reconnect poll, use at least 1 ms".into(),
            ));
        }

        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        self.check_device()?;
        self.check_baudrate()?;
        self.check_parity()?;
        self.check_timeout()?;

        Ok(())
    }
}
