//! Fixed-layout reply payloads.
//!
//! Every layout is packed with no padding. Multi-byte fields follow the
//! [`ByteOrder`] configured on the link; firmware revisions disagree on it.

use crate::protocol::{ReplyKind, VoltageReference, FLAG_DUAL_CHANNEL, FLAG_INVERT_TRIGGER};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyDecodeError {
    #[error("{} payload too short: expected {expected} bytes, got {actual}", .kind.as_str())]
    TooShort {
        kind: ReplyKind,
        expected: usize,
        actual: usize,
    },
}

/// Byte order of multi-byte payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
        }
    }

    fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
        }
    }

    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }

    fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }
}

/// Sequential reader over a payload whose length was already checked.
struct FieldReader<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
}

impl<'a> FieldReader<'a> {
    fn new(
        kind: ReplyKind,
        bytes: &'a [u8],
        expected: usize,
        order: ByteOrder,
    ) -> Result<Self, ReplyDecodeError> {
        if bytes.len() < expected {
            return Err(ReplyDecodeError::TooShort {
                kind,
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes, order })
    }

    fn u8(&mut self) -> u8 {
        let (head, rest) = self.bytes.split_at(1);
        self.bytes = rest;
        head[0]
    }

    fn u16(&mut self) -> u16 {
        let (head, rest) = self.bytes.split_at(2);
        self.bytes = rest;
        self.order.read_u16([head[0], head[1]])
    }

    fn u32(&mut self) -> u32 {
        let (head, rest) = self.bytes.split_at(4);
        self.bytes = rest;
        self.order.read_u32([head[0], head[1], head[2], head[3]])
    }
}

/// Acquisition settings reported by the device.
///
/// A snapshot: each PARAMETERS_REPLY replaces the previous one wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceParameters {
    pub trigger_level: u8,
    pub holdoff_samples: u8,
    pub adc_ref: u8,
    /// log2 of the ADC clock divider.
    pub prescale: u8,
    pub num_samples: u16,
    pub flags: u8,
    pub channels: u8,
    pub autotrigger_samples: u16,
}

impl DeviceParameters {
    pub const WIRE_SIZE: usize = 10;

    pub fn decode(payload: &[u8], order: ByteOrder) -> Result<Self, ReplyDecodeError> {
        let mut r = FieldReader::new(ReplyKind::Parameters, payload, Self::WIRE_SIZE, order)?;
        Ok(Self {
            trigger_level: r.u8(),
            holdoff_samples: r.u8(),
            adc_ref: r.u8(),
            prescale: r.u8(),
            num_samples: r.u16(),
            flags: r.u8(),
            channels: r.u8(),
            autotrigger_samples: r.u16(),
        })
    }

    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.extend_from_slice(&[
            self.trigger_level,
            self.holdoff_samples,
            self.adc_ref,
            self.prescale,
        ]);
        out.extend_from_slice(&order.u16_bytes(self.num_samples));
        out.extend_from_slice(&[self.flags, self.channels]);
        out.extend_from_slice(&order.u16_bytes(self.autotrigger_samples));
        out
    }

    pub fn trigger_inverted(&self) -> bool {
        self.flags & FLAG_INVERT_TRIGGER != 0
    }

    pub fn dual_channel(&self) -> bool {
        self.flags & FLAG_DUAL_CHANNEL != 0
    }

    pub fn vref(&self) -> VoltageReference {
        VoltageReference::from_bits(self.adc_ref)
    }

    /// Effective sample rate for a device clocked at `cpu_hz`.
    pub fn sample_rate_hz(&self, cpu_hz: u32) -> f64 {
        crate::sample::sample_rate_hz(cpu_hz, self.prescale)
    }
}

/// Configuration of the first PWM generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PwmConfig {
    pub clock_divider: u8,
    pub max: u16,
    pub count_a: u16,
    pub count_b: u16,
}

impl PwmConfig {
    pub const WIRE_SIZE: usize = 7;

    pub fn decode(payload: &[u8], order: ByteOrder) -> Result<Self, ReplyDecodeError> {
        let mut r = FieldReader::new(ReplyKind::Pwm1, payload, Self::WIRE_SIZE, order)?;
        Ok(Self {
            clock_divider: r.u8(),
            max: r.u16(),
            count_a: r.u16(),
            count_b: r.u16(),
        })
    }

    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.push(self.clock_divider);
        out.extend_from_slice(&order.u16_bytes(self.max));
        out.extend_from_slice(&order.u16_bytes(self.count_a));
        out.extend_from_slice(&order.u16_bytes(self.count_b));
        out
    }
}

/// Board constants: CPU clock and the two reference voltages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceConstants {
    pub frequency_hz: u32,
    pub avcc_millivolts: u16,
    pub vref_millivolts: u16,
}

impl DeviceConstants {
    pub const WIRE_SIZE: usize = 8;

    pub fn decode(payload: &[u8], order: ByteOrder) -> Result<Self, ReplyDecodeError> {
        let mut r = FieldReader::new(ReplyKind::Constants, payload, Self::WIRE_SIZE, order)?;
        Ok(Self {
            frequency_hz: r.u32(),
            avcc_millivolts: r.u16(),
            vref_millivolts: r.u16(),
        })
    }

    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.extend_from_slice(&order.u32_bytes(self.frequency_hz));
        out.extend_from_slice(&order.u16_bytes(self.avcc_millivolts));
        out.extend_from_slice(&order.u16_bytes(self.vref_millivolts));
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl FirmwareVersion {
    pub fn decode(payload: &[u8]) -> Result<Self, ReplyDecodeError> {
        let mut r = FieldReader::new(ReplyKind::Version, payload, 2, ByteOrder::default())?;
        Ok(Self {
            major: r.u8(),
            minor: r.u8(),
        })
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OSCOPE {}.{}", self.major, self.minor)
    }
}
