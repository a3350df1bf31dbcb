//! # oscope-link
//!
//! Host side of the serial link to a small sampling oscilloscope.
//!
//! The crate decodes the device's size-prefixed, XOR-checksummed frames,
//! dispatches the decoded replies, and runs the acquisition loop: the
//! ping/version/parameters handshake followed by continuous or single-shot
//! sampling with at most one request in flight.
//!
//! ## Features
//!
//! - **Self-synchronizing framing**: corrupt frames are dropped, a zero size byte
//!   or a run of zeros resynchronizes the decoder
//! - **Configurable command ids and byte order** for different firmware revisions
//! - **Non-blocking session**: feed it bytes as they arrive, nothing waits on replies
//! - **Freeze and single-shot** capture control
//! - **DataFrame output**: captured buffers convert to `polars` frames
//!
//! ## Examples
//!
//! ### Connecting and streaming
//!
//! ```rust,no_run
//! use oscope_link::{LinkConfig, LinkConsumer, OscopeConnector};
//! use std::time::Instant;
//!
//! struct Printer;
//!
//! impl LinkConsumer for Printer {
//!     fn on_sample_frame(&mut self, samples: &[u8]) {
//!         println!("Captured {} bytes", samples.len());
//!     }
//! }
//!
//! let mut session = OscopeConnector::connect(None, Printer, LinkConfig::default())?;
//! loop {
//!     session.pump()?;
//!     session.poll(Instant::now())?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Single-shot capture
//!
//! ```rust,no_run
//! use oscope_link::{LinkConfig, OscopeConnector, TriggerConfig};
//!
//! let mut session = OscopeConnector::connect(None, (), LinkConfig::default())?;
//! let trigger = TriggerConfig::start_capturing_when()
//!     .rising_edge(0x80)
//!     .holdoff(4);
//! session.apply_trigger(&trigger)?;
//! session.set_freeze(true);
//! session.arm_oneshot(Some(Box::new(|| println!("Triggered"))))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Framing
//!
//! ```rust
//! use oscope_link::frame::{encode_frame, FrameDecoder};
//!
//! let bytes = encode_frame(0x42, &[0x80]).unwrap();
//! let mut decoder = FrameDecoder::new();
//! let frames: Vec<_> = bytes
//!     .iter()
//!     .filter_map(|b| decoder.push(*b).ok().flatten())
//!     .collect();
//! assert_eq!(frames[0].payload, vec![0x80]);
//! ```

/// Opens a tracy zone for the rest of the enclosing scope when built with
/// the `cpu-profiling` feature.
macro_rules! profile_scope {
    ($name:literal) => {
        #[cfg(feature = "cpu-profiling")]
        let _profile_span = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!($name), 0));
    };
}

pub mod channel;
pub mod connector;
pub mod consumer;
pub mod dispatch;
pub mod frame;
pub mod parameters;
pub mod protocol;
pub mod sample;
pub mod session;
pub mod trigger_config;

pub use channel::{ByteChannel, ChannelError, SerialChannel};

pub use connector::{ConnectorError, OscopeConnector, OscopeDevice};

pub use consumer::{LinkConsumer, OneshotCallback};

pub use dispatch::{DispatchError, Reply};

pub use frame::{Frame, FrameDecoder, FrameError};

pub use parameters::{ByteOrder, DeviceConstants, DeviceParameters, FirmwareVersion, PwmConfig};

pub use protocol::{Command, CommandTable, ReplyKind, VoltageReference};

pub use sample::{SampleFrame, SampleFrameError};

pub use session::{HandshakeRetry, LinkConfig, LinkError, LinkSession, LinkStats, Phase};

pub use trigger_config::{TriggerConfig, TriggerEdge};
