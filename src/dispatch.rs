//! Turning decoded frames into typed replies.
//!
//! Lookup goes through the link's [`CommandTable`]; the resulting [`Reply`]
//! is matched exhaustively by the session, so adding a reply kind forces every
//! handler to be revisited.

use crate::frame::Frame;
use crate::parameters::{
    ByteOrder, DeviceConstants, DeviceParameters, FirmwareVersion, PwmConfig, ReplyDecodeError,
};
use crate::protocol::{CommandTable, ReplyKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown command {0:#04x}")]
    UnknownCommand(u8),

    #[error("Malformed reply: {0}")]
    Malformed(#[from] ReplyDecodeError),
}

/// A device to host message with its payload decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Version(FirmwareVersion),
    BufferSeg(Vec<u8>),
    Parameters(DeviceParameters),
    Constants(DeviceConstants),
    Scratchpad(Vec<u8>),
    Pwm1(PwmConfig),
    Pong(Vec<u8>),
    Error(Vec<u8>),
}

/// Which part of the link handles a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Updates cached state and notifies the consumer in any phase.
    Stateless,
    /// Only meaningful in particular acquisition phases.
    PhaseSensitive,
}

impl Reply {
    pub fn decode(
        frame: Frame,
        table: &CommandTable,
        order: ByteOrder,
    ) -> Result<Self, DispatchError> {
        let kind = table
            .reply_kind(frame.command)
            .ok_or(DispatchError::UnknownCommand(frame.command))?;

        let reply = match kind {
            ReplyKind::Version => Reply::Version(FirmwareVersion::decode(&frame.payload)?),
            ReplyKind::BufferSeg => Reply::BufferSeg(frame.payload),
            ReplyKind::Parameters => {
                Reply::Parameters(DeviceParameters::decode(&frame.payload, order)?)
            }
            ReplyKind::Constants => {
                Reply::Constants(DeviceConstants::decode(&frame.payload, order)?)
            }
            ReplyKind::Scratchpad => Reply::Scratchpad(frame.payload),
            ReplyKind::Pwm1 => Reply::Pwm1(PwmConfig::decode(&frame.payload, order)?),
            ReplyKind::Pong => Reply::Pong(frame.payload),
            ReplyKind::Error => Reply::Error(frame.payload),
        };
        Ok(reply)
    }

    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::Version(_) => ReplyKind::Version,
            Reply::BufferSeg(_) => ReplyKind::BufferSeg,
            Reply::Parameters(_) => ReplyKind::Parameters,
            Reply::Constants(_) => ReplyKind::Constants,
            Reply::Scratchpad(_) => ReplyKind::Scratchpad,
            Reply::Pwm1(_) => ReplyKind::Pwm1,
            Reply::Pong(_) => ReplyKind::Pong,
            Reply::Error(_) => ReplyKind::Error,
        }
    }

    pub fn route(&self) -> Route {
        match self {
            Reply::Version(_)
            | Reply::Parameters(_)
            | Reply::Constants(_)
            | Reply::Scratchpad(_)
            | Reply::Pwm1(_)
            | Reply::Error(_) => Route::Stateless,
            Reply::BufferSeg(_) | Reply::Pong(_) => Route::PhaseSensitive,
        }
    }
}
