use serialport::SerialPortType;

use crate::channel::{ChannelError, SerialChannel};
use crate::consumer::LinkConsumer;
use crate::protocol::DEFAULT_BAUD_RATE;
use crate::session::{LinkConfig, LinkError, LinkSession};

/// USB serial bridges the oscilloscope boards ship with.
const KNOWN_BRIDGES: [(u16, &str); 3] = [
    (0x2341, "Arduino"),
    (0x0403, "FTDI"),
    (0x1a86, "CH340"),
];

#[derive(Debug, Clone)]
pub struct OscopeDevice {
    pub name: String,
    pub port: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Port {port} is not a known oscilloscope bridge")]
    InvalidPort { port: String },

    #[error("No oscilloscope found. Please connect one or specify the port manually")]
    DeviceNotFound,
}

pub struct OscopeConnector;

impl OscopeConnector {
    /// Connect to an oscilloscope and start the handshake.
    ///
    /// Without a port, the first known USB bridge is used. A given port must
    /// belong to a known bridge; use [`OscopeConnector::open`] to skip that
    /// check.
    pub fn connect<K: LinkConsumer>(
        port: Option<&str>,
        consumer: K,
        config: LinkConfig,
    ) -> Result<LinkSession<SerialChannel, K>, ConnectorError> {
        let port = match port {
            Some(port) => {
                Self::validate_port(port)?;
                port.to_string()
            }
            None => Self::get_device_port()?,
        };
        Self::open(&port, DEFAULT_BAUD_RATE, consumer, config)
    }

    /// Open `port` as-is and send the initial PING.
    pub fn open<K: LinkConsumer>(
        port: &str,
        baud_rate: u32,
        consumer: K,
        config: LinkConfig,
    ) -> Result<LinkSession<SerialChannel, K>, ConnectorError> {
        log::debug!("Connecting to oscilloscope on port {}", port);
        let channel = SerialChannel::open(port, baud_rate)?;
        let mut session = LinkSession::new(channel, consumer, config);
        session.connect()?;
        Ok(session)
    }

    fn validate_port(port: &str) -> Result<(), ConnectorError> {
        let devices = Self::get_available_devices()?;
        if !devices.iter().any(|d| d.port == port) {
            return Err(ConnectorError::InvalidPort {
                port: port.to_string(),
            });
        }
        Ok(())
    }

    /// Name of the bridge for a USB vendor id, if it is one we know.
    fn bridge_name(vid: u16) -> Option<&'static str> {
        KNOWN_BRIDGES
            .iter()
            .find(|(known, _)| *known == vid)
            .map(|(_, name)| *name)
    }

    /// All serial ports that look like an oscilloscope.
    pub fn get_available_devices() -> Result<Vec<OscopeDevice>, ConnectorError> {
        let devices = serialport::available_ports()?
            .into_iter()
            .filter_map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => {
                    let bridge = Self::bridge_name(usb.vid)?;
                    Some(OscopeDevice {
                        name: usb.product.unwrap_or_else(|| bridge.to_string()),
                        port: info.port_name,
                    })
                }
                _ => None,
            })
            .collect();
        Ok(devices)
    }

    fn get_device_port() -> Result<String, ConnectorError> {
        log::debug!("Searching for oscilloscope");
        Self::get_available_devices()?
            .into_iter()
            .next()
            .map(|device| device.port)
            .ok_or(ConnectorError::DeviceNotFound)
    }
}
