use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// Read timeout for a single poll of the port. Short, since reads are driven
/// by an outer event loop and must not stall it.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A reliable, ordered byte pipe to the device.
///
/// Writes may be buffered, but a backend is free to put bytes on the wire as
/// soon as [`ByteChannel::write_bytes`] returns `Ok`. A failed
/// [`ByteChannel::flush`] therefore does not mean nothing was sent.
pub trait ByteChannel {
    /// Read whatever is pending without blocking. Returns `Ok(0)` when there
    /// is nothing to read.
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError>;

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError>;

    fn flush(&mut self) -> Result<(), ChannelError>;
}

/// Serial port backend, raw 8N1.
pub struct SerialChannel {
    serial: Box<dyn SerialPort>,
    port: String,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl SerialChannel {
    /// Open and configure a serial port. Any failure here is fatal for the
    /// link and is returned to the caller.
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, ChannelError> {
        log::debug!("Opening {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open()?;

        let mut channel = Self {
            serial,
            port: port.to_string(),
        };
        channel.discard_input()?;
        log::info!("Opened device '{}'", port);
        Ok(channel)
    }

    pub fn port_name(&self) -> &str {
        &self.port
    }

    /// Drop anything the device sent before we were listening.
    pub fn discard_input(&mut self) -> Result<(), ChannelError> {
        self.serial.clear(ClearBuffer::All)?;
        Ok(())
    }
}

impl ByteChannel for SerialChannel {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        match self.serial.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.serial.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ChannelError> {
        self.serial.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::{ByteChannel, ChannelError};
    use crate::frame::{Frame, FrameDecoder};
    use std::collections::VecDeque;

    /// In-memory channel recording everything the host flushed.
    #[derive(Debug, Default)]
    pub struct MockChannel {
        pub inbound: VecDeque<u8>,
        pending: Vec<u8>,
        pub flushed: Vec<u8>,
        pub flushes: usize,
        pub fail_next_write: bool,
        pub fail_next_flush: bool,
    }

    impl MockChannel {
        pub fn new() -> Self {
            Self::default()
        }

        /// Decode and clear everything flushed so far.
        pub fn take_frames(&mut self) -> Vec<Frame> {
            let mut decoder = FrameDecoder::new();
            let bytes = std::mem::take(&mut self.flushed);
            bytes
                .into_iter()
                .filter_map(|b| decoder.push(b).ok().flatten())
                .collect()
        }

        pub fn take_bytes(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.flushed)
        }
    }

    impl ByteChannel for MockChannel {
        fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
            let n = buf.len().min(self.inbound.len());
            for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
            if self.fail_next_write {
                self.fail_next_write = false;
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write failed").into());
            }
            self.pending.extend_from_slice(bytes);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), ChannelError> {
            if self.fail_next_flush {
                self.fail_next_flush = false;
                self.pending.clear();
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "flush failed").into());
            }
            self.flushes += 1;
            self.flushed.append(&mut self.pending);
            Ok(())
        }
    }

    #[test]
    fn test_mock_flush_gates_delivery() {
        let mut channel = MockChannel::new();
        channel.write_bytes(&[1, 2, 3]).unwrap();
        assert!(channel.flushed.is_empty());
        channel.flush().unwrap();
        assert_eq!(channel.take_bytes(), vec![1, 2, 3]);
    }

    #[test]
    fn test_mock_read_drains_inbound() {
        let mut channel = MockChannel::new();
        channel.inbound.extend([9, 8, 7]);
        let mut buf = [0u8; 2];
        assert_eq!(channel.read_bytes(&mut buf).unwrap(), 2);
        assert_eq!(buf, [9, 8]);
        assert_eq!(channel.read_bytes(&mut buf).unwrap(), 1);
        assert_eq!(channel.read_bytes(&mut buf).unwrap(), 0);
    }
}
