//! Command identifiers and protocol constants.
//!
//! Command ids differ between firmware revisions, so they are carried in a
//! [`CommandTable`] instead of being hard-coded. The default table matches the
//! most complete revision of the oscilloscope firmware.

/// Trigger on the falling edge instead of the rising edge.
pub const FLAG_INVERT_TRIGGER: u8 = 1 << 0;
/// Sample two inputs alternately.
pub const FLAG_DUAL_CHANNEL: u8 = 1 << 1;

/// Default serial baud rate of the firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Largest total length (command byte plus payload) the size field can express.
pub const MAX_FRAME_LENGTH: usize = 0x7FFF;

/// Number of channels the firmware can interleave.
pub const MAX_CHANNELS: u8 = 4;

/// Mapping from logical commands to their wire ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    pub ping: u8,
    pub get_version: u8,
    pub get_constants: u8,
    pub start_sampling: u8,
    pub set_trigger: u8,
    pub set_holdoff: u8,
    pub set_vref: u8,
    pub set_prescaler: u8,
    pub get_parameters: u8,
    pub set_samples: u8,
    pub set_autotrig: u8,
    pub set_flags: u8,
    pub set_channels: u8,
    pub write_scratchpad: u8,
    pub read_scratchpad: u8,
    pub set_pwm1: u8,
    pub get_pwm1: u8,

    pub version_reply: u8,
    pub buffer_seg: u8,
    pub parameters_reply: u8,
    pub constants_reply: u8,
    pub scratchpad_reply: u8,
    pub pwm1_reply: u8,
    pub pong: u8,
    pub error: u8,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self {
            ping: 0x3E,
            get_version: 0x40,
            start_sampling: 0x41,
            set_trigger: 0x42,
            set_holdoff: 0x43,
            set_vref: 0x45,
            set_prescaler: 0x46,
            get_parameters: 0x47,
            set_samples: 0x48,
            set_autotrig: 0x49,
            set_flags: 0x50,
            set_channels: 0x51,
            get_constants: 0x52,
            write_scratchpad: 0x53,
            read_scratchpad: 0x54,
            set_pwm1: 0x55,
            get_pwm1: 0x56,

            version_reply: 0x80,
            buffer_seg: 0x81,
            parameters_reply: 0x87,
            constants_reply: 0x88,
            scratchpad_reply: 0x89,
            pwm1_reply: 0x8A,
            pong: 0xE3,
            error: 0xFF,
        }
    }
}

impl CommandTable {
    /// Wire id of a host to device command.
    pub fn id(&self, command: Command) -> u8 {
        match command {
            Command::Ping => self.ping,
            Command::GetVersion => self.get_version,
            Command::GetConstants => self.get_constants,
            Command::StartSampling => self.start_sampling,
            Command::SetTrigger => self.set_trigger,
            Command::SetHoldoff => self.set_holdoff,
            Command::SetVref => self.set_vref,
            Command::SetPrescaler => self.set_prescaler,
            Command::GetParameters => self.get_parameters,
            Command::SetSamples => self.set_samples,
            Command::SetAutotrig => self.set_autotrig,
            Command::SetFlags => self.set_flags,
            Command::SetChannels => self.set_channels,
            Command::WriteScratchpad => self.write_scratchpad,
            Command::ReadScratchpad => self.read_scratchpad,
            Command::SetPwm1 => self.set_pwm1,
            Command::GetPwm1 => self.get_pwm1,
        }
    }

    /// Look up a device to host command id.
    ///
    /// Returns `None` for ids this table does not know about.
    pub fn reply_kind(&self, id: u8) -> Option<ReplyKind> {
        ReplyKind::ALL
            .iter()
            .copied()
            .find(|kind| self.reply_id(*kind) == id)
    }

    pub fn reply_id(&self, kind: ReplyKind) -> u8 {
        match kind {
            ReplyKind::Version => self.version_reply,
            ReplyKind::BufferSeg => self.buffer_seg,
            ReplyKind::Parameters => self.parameters_reply,
            ReplyKind::Constants => self.constants_reply,
            ReplyKind::Scratchpad => self.scratchpad_reply,
            ReplyKind::Pwm1 => self.pwm1_reply,
            ReplyKind::Pong => self.pong,
            ReplyKind::Error => self.error,
        }
    }
}

/// Commands sent from the host to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    GetVersion,
    GetConstants,
    StartSampling,
    SetTrigger,
    SetHoldoff,
    SetVref,
    SetPrescaler,
    GetParameters,
    SetSamples,
    SetAutotrig,
    SetFlags,
    SetChannels,
    WriteScratchpad,
    ReadScratchpad,
    SetPwm1,
    GetPwm1,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::GetVersion => "GET_VERSION",
            Command::GetConstants => "GET_CONSTANTS",
            Command::StartSampling => "START_SAMPLING",
            Command::SetTrigger => "SET_TRIGGER",
            Command::SetHoldoff => "SET_HOLDOFF",
            Command::SetVref => "SET_VREF",
            Command::SetPrescaler => "SET_PRESCALER",
            Command::GetParameters => "GET_PARAMETERS",
            Command::SetSamples => "SET_SAMPLES",
            Command::SetAutotrig => "SET_AUTOTRIG",
            Command::SetFlags => "SET_FLAGS",
            Command::SetChannels => "SET_CHANNELS",
            Command::WriteScratchpad => "WRITE_SCRATCHPAD",
            Command::ReadScratchpad => "READ_SCRATCHPAD",
            Command::SetPwm1 => "SET_PWM1",
            Command::GetPwm1 => "GET_PWM1",
        }
    }
}

/// Replies sent from the device to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Version,
    BufferSeg,
    Parameters,
    Constants,
    Scratchpad,
    Pwm1,
    Pong,
    Error,
}

impl ReplyKind {
    pub const ALL: [ReplyKind; 8] = [
        ReplyKind::Version,
        ReplyKind::BufferSeg,
        ReplyKind::Parameters,
        ReplyKind::Constants,
        ReplyKind::Scratchpad,
        ReplyKind::Pwm1,
        ReplyKind::Pong,
        ReplyKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyKind::Version => "VERSION_REPLY",
            ReplyKind::BufferSeg => "BUFFER_SEG",
            ReplyKind::Parameters => "PARAMETERS_REPLY",
            ReplyKind::Constants => "CONSTANTS_REPLY",
            ReplyKind::Scratchpad => "SCRATCHPAD_REPLY",
            ReplyKind::Pwm1 => "PWM1_REPLY",
            ReplyKind::Pong => "PONG",
            ReplyKind::Error => "ERROR",
        }
    }
}

/// ADC reference source selected with SET_VREF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageReference {
    /// External AREF pin.
    Aref,
    /// Analog supply voltage.
    Avcc,
    /// Internal 1.1V bandgap.
    Internal,
}

impl VoltageReference {
    pub fn to_bits(self) -> u8 {
        match self {
            VoltageReference::Aref => 0,
            VoltageReference::Avcc => 1,
            VoltageReference::Internal => 3,
        }
    }

    /// Firmware reports anything other than 0 and 1 as the internal reference.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => VoltageReference::Aref,
            1 => VoltageReference::Avcc,
            _ => VoltageReference::Internal,
        }
    }
}
