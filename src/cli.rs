use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::config::{Config, Parity};

/// The command line interface for serial hub.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// The serial device to bridge, overrides the configuration file
    #[arg(short, long)]
    pub device: Option<String>,

    /// The TCP port to serve sessions on
    #[arg(short = 'p', long)]
    pub tcp_port: Option<u16>,

    /// Serial baudrate
    #[arg(short, long)]
    pub baudrate: Option<u32>,

    /// Parity as a letter, one of N/E/O (S and M parse but the serial backend rejects them)
    #[arg(long)]
    pub parity: Option<Parity>,

    /// Use software (XON/XOFF) flow control
    #[arg(long)]
    pub xonxoff: bool,

    /// Delay between transmitted characters, in milliseconds
    #[arg(long, value_name = "MS")]
    pub char_delay: Option<u64>,

    /// How long to wait for each transmitted character's echo, in milliseconds
    #[arg(long, value_name = "MS")]
    pub wait_echo: Option<u64>,

    /// Stdout log level
    #[arg(short = 'v', long, default_value = "info", value_name = "LEVEL")]
    pub log_level: Level,

    /// Also write daily log files into this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Lay the command line overrides over a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.serial.device = device.clone();
        }
        if let Some(port) = self.tcp_port {
            config.tcp_port = port;
        }
        if let Some(baudrate) = self.baudrate {
            config.serial.baudrate = baudrate;
        }
        if let Some(parity) = self.parity {
            config.serial.parity = parity;
        }
        if self.xonxoff {
            config.serial.xonxoff = true;
        }
        if let Some(ms) = self.char_delay {
            config.serial.char_delay_ms = Some(ms);
        }
        if let Some(ms) = self.wait_echo {
            config.serial.wait_echo_ms = Some(ms);
        }
    }
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// List the serial devices attached to this system.
    List,

    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

/// Run a subcommand to completion.
pub fn handle_command(command: Commands) {
    match command {
        Commands::List => list_devices(),
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty());
        }
    }
}

fn list_devices() {
    match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => println!("No serial devices found"),
        Ok(ports) => {
            for port in ports {
                match port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => {
                        let product = usb.product.unwrap_or_else(|| "unknown".into());
                        println!(
                            "{}\tUSB {:04x}:{:04x} {product}",
                            port.port_name, usb.vid, usb.pid
                        );
                    }
                    _ => println!("{}", port.port_name),
                }
            }
        }
        Err(e) => eprintln!("Could not list serial devices: {e}"),
    }
}
