//! The link session: handshake, sampling loop, freeze and single-shot.
//!
//! A [`LinkSession`] owns the channel, the frame decoder and every piece of
//! link state. It is driven from a single event loop: received bytes go in
//! through [`LinkSession::feed`] (or [`LinkSession::pump`]), user actions come
//! in through the setter methods, and nothing blocks waiting for a reply.
//!
//! The sampling loop keeps at most one START_SAMPLING outstanding. Each
//! BUFFER_SEG reply completes the outstanding request and leads to exactly one
//! of: issuing the next request, firing the armed one-shot callback, or going
//! quiet because the link is frozen.

use std::time::{Duration, Instant};

use crate::channel::{ByteChannel, ChannelError};
use crate::consumer::{LinkConsumer, OneshotCallback};
use crate::dispatch::{DispatchError, Reply};
use crate::frame::{encode_frame, reset_sequence, Frame, FrameDecoder, FrameError};
use crate::parameters::{ByteOrder, DeviceConstants, DeviceParameters, FirmwareVersion, PwmConfig};
use crate::protocol::{
    Command, CommandTable, VoltageReference, FLAG_DUAL_CHANNEL, FLAG_INVERT_TRIGGER,
    MAX_CHANNELS, MAX_FRAME_LENGTH,
};
use crate::trigger_config::TriggerConfig;

const READ_CHUNK: usize = 256;

/// Reads per [`LinkSession::pump`] call. A streaming device never leaves the
/// line idle, so draining until empty would never return.
const MAX_READS_PER_PUMP: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Oscilloscope not responding after {attempts} pings")]
    NotResponding { attempts: u32 },
}

/// Handshake and sampling phases, in the order a healthy link walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Ping,
    GettingVersion,
    GettingParameters,
    Sampling,
}

/// Re-ping policy while waiting for the first PONG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRetry {
    pub timeout: Duration,
    /// Total number of pings, the initial one included.
    pub attempts: u32,
}

impl Default for HandshakeRetry {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub commands: CommandTable,
    pub byte_order: ByteOrder,
    pub max_frame_length: usize,
    /// Zero bytes sent by [`LinkSession::reset_target`].
    pub reset_length: usize,
    pub ping_payload: Vec<u8>,
    pub handshake_retry: Option<HandshakeRetry>,
    /// SET_AUTOTRIG threshold sent when a single-shot capture is armed.
    pub oneshot_autotrigger: u8,
    /// SET_AUTOTRIG threshold sent when returning to continuous capture.
    pub continuous_autotrigger: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            commands: CommandTable::default(),
            byte_order: ByteOrder::BigEndian,
            max_frame_length: MAX_FRAME_LENGTH,
            reset_length: 512,
            ping_payload: vec![1, 2, 3, 4],
            handshake_retry: Some(HandshakeRetry::default()),
            oneshot_autotrigger: 0,
            continuous_autotrigger: 100,
        }
    }
}

impl LinkConfig {
    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_reset_length(mut self, reset_length: usize) -> Self {
        self.reset_length = reset_length;
        self
    }

    pub fn with_handshake_retry(mut self, retry: Option<HandshakeRetry>) -> Self {
        self.handshake_retry = retry;
        self
    }

    pub fn with_autotrigger(mut self, oneshot: u8, continuous: u8) -> Self {
        self.oneshot_autotrigger = oneshot;
        self.continuous_autotrigger = continuous;
        self
    }
}

/// Counters for everything the link dropped or did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames: u64,
    pub checksum_errors: u64,
    pub invalid_lengths: u64,
    pub malformed: u64,
    /// Unknown commands and replies that arrived in the wrong phase.
    pub ignored: u64,
    pub sampling_requests: u64,
    pub sample_frames: u64,
}

/// Mutable state of the acquisition flow.
#[derive(Default)]
struct LinkState {
    phase: Phase,
    in_request: bool,
    freeze: bool,
    delay_request: bool,
    trigger_invert: bool,
    dual_channel: bool,
    oneshot: Option<OneshotCallback>,
}

#[derive(Debug, Default)]
struct HandshakeTracker {
    pings_sent: u32,
    last_ping: Option<Instant>,
    gave_up: bool,
}

pub struct LinkSession<C: ByteChannel, K: LinkConsumer> {
    channel: C,
    consumer: K,
    config: LinkConfig,
    decoder: FrameDecoder,
    state: LinkState,
    handshake: HandshakeTracker,
    version: Option<FirmwareVersion>,
    parameters: Option<DeviceParameters>,
    constants: Option<DeviceConstants>,
    pwm: Option<PwmConfig>,
    stats: LinkStats,
}

impl<C: ByteChannel, K: LinkConsumer> LinkSession<C, K> {
    /// Wrap an open channel. Nothing is sent until [`LinkSession::connect`].
    pub fn new(channel: C, consumer: K, config: LinkConfig) -> Self {
        let decoder = FrameDecoder::with_max_length(config.max_frame_length);
        Self {
            channel,
            consumer,
            config,
            decoder,
            state: LinkState::default(),
            handshake: HandshakeTracker::default(),
            version: None,
            parameters: None,
            constants: None,
            pwm: None,
            stats: LinkStats::default(),
        }
    }

    /// Start the handshake from scratch by pinging the device.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn connect(&mut self) -> Result<(), LinkError> {
        self.decoder.reset();
        self.state = LinkState::default();
        self.handshake = HandshakeTracker::default();
        self.version = None;
        self.parameters = None;
        self.constants = None;
        self.pwm = None;
        self.stats = LinkStats::default();
        log::debug!("Pinging device...");
        self.send_ping(Instant::now())
    }

    /// Hand back the channel and consumer, ending the session.
    pub fn into_parts(self) -> (C, K) {
        (self.channel, self.consumer)
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Feed received bytes through the decoder and dispatch every completed
    /// frame.
    ///
    /// Framing and sequencing problems are logged and counted, never
    /// returned. An error here means a reply could not be sent.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        profile_scope!("LinkSession::feed");

        for &byte in bytes {
            self.feed_byte(byte)?;
        }
        Ok(())
    }

    pub fn feed_byte(&mut self, byte: u8) -> Result<(), LinkError> {
        match self.decoder.push(byte) {
            Ok(Some(frame)) => self.handle_frame(frame),
            Ok(None) => Ok(()),
            Err(e @ FrameError::Checksum { .. }) => {
                self.stats.checksum_errors += 1;
                log::warn!("{}", e);
                Ok(())
            }
            Err(e) => {
                self.stats.invalid_lengths += 1;
                log::warn!("{}", e);
                Ok(())
            }
        }
    }

    /// Read what is pending on the channel, up to a bounded number of
    /// chunks, and feed it. Returns the number of bytes consumed; more may
    /// still be waiting.
    pub fn pump(&mut self) -> Result<usize, LinkError> {
        let mut buf = [0u8; READ_CHUNK];
        let mut total = 0;
        for _ in 0..MAX_READS_PER_PUMP {
            let n = self.channel.read_bytes(&mut buf)?;
            if n == 0 {
                break;
            }
            total += n;
            self.feed(&buf[..n])?;
        }
        Ok(total)
    }

    /// Drive time-based behaviour. Only the handshake retry uses it: while
    /// waiting for a PONG, an unanswered ping is followed by a target reset
    /// and a fresh ping, until the configured attempts run out.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn poll(&mut self, now: Instant) -> Result<(), LinkError> {
        let Some(retry) = self.config.handshake_retry else {
            return Ok(());
        };
        if self.state.phase != Phase::Ping || self.handshake.gave_up {
            return Ok(());
        }
        let Some(sent_at) = self.handshake.last_ping else {
            return Ok(());
        };
        if now.saturating_duration_since(sent_at) < retry.timeout {
            return Ok(());
        }

        if self.handshake.pings_sent >= retry.attempts {
            self.handshake.gave_up = true;
            log::error!("Oscilloscope not responding!");
            return Err(LinkError::NotResponding {
                attempts: self.handshake.pings_sent,
            });
        }

        log::info!("Resetting and pinging again...");
        self.reset_target()?;
        self.send_ping(now)
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), LinkError> {
        self.stats.frames += 1;
        let reply = match Reply::decode(frame, &self.config.commands, self.config.byte_order) {
            Ok(reply) => reply,
            Err(DispatchError::UnknownCommand(id)) => {
                self.stats.ignored += 1;
                log::warn!("Invalid packet {:#04x} in state {:?}", id, self.state.phase);
                return Ok(());
            }
            Err(e) => {
                self.stats.malformed += 1;
                log::warn!("{}", e);
                return Ok(());
            }
        };
        log::trace!("< {} ({:?})", reply.kind().as_str(), reply.route());

        match reply {
            Reply::Pong(_) => self.handle_pong(),
            Reply::Version(version) => self.handle_version(version),
            Reply::Parameters(parameters) => self.handle_parameters(parameters),
            Reply::BufferSeg(samples) => self.handle_buffer(&samples),
            Reply::Constants(constants) => {
                log::debug!(
                    "Constants: {} Hz, AVcc {} mV, Vref {} mV",
                    constants.frequency_hz,
                    constants.avcc_millivolts,
                    constants.vref_millivolts
                );
                self.constants = Some(constants);
                self.consumer.on_constants(
                    constants.frequency_hz,
                    constants.avcc_millivolts,
                    constants.vref_millivolts,
                );
                Ok(())
            }
            Reply::Scratchpad(data) => {
                self.consumer.on_scratchpad(&data);
                Ok(())
            }
            Reply::Pwm1(config) => {
                self.pwm = Some(config);
                self.consumer.on_pwm(&config);
                Ok(())
            }
            Reply::Error(payload) => {
                log::warn!("Device reported error {:02x?}", payload);
                self.consumer.on_device_error(&payload);
                Ok(())
            }
        }
    }

    fn handle_pong(&mut self) -> Result<(), LinkError> {
        if self.state.phase != Phase::Ping {
            return self.ignore("PONG");
        }
        log::info!("Got ping reply");
        self.send(Command::GetVersion, &[])?;
        self.state.phase = Phase::GettingVersion;
        Ok(())
    }

    fn handle_version(&mut self, version: FirmwareVersion) -> Result<(), LinkError> {
        log::info!("Got version: {}", version);
        self.version = Some(version);
        self.consumer.on_version(version);

        if self.state.phase == Phase::GettingVersion {
            self.send(Command::GetParameters, &[])?;
            self.state.phase = Phase::GettingParameters;
        }
        Ok(())
    }

    fn handle_parameters(&mut self, parameters: DeviceParameters) -> Result<(), LinkError> {
        log::debug!(
            "Parameters: {} samples, {} channel(s), flags {:#04x}",
            parameters.num_samples,
            parameters.channels,
            parameters.flags
        );
        self.state.trigger_invert = parameters.trigger_inverted();
        self.state.dual_channel = parameters.dual_channel();
        self.parameters = Some(parameters);
        self.consumer.on_parameters(&parameters);

        if self.state.phase == Phase::GettingParameters {
            log::debug!("Requesting samples");
            self.request_samples()?;
            self.state.phase = Phase::Sampling;
        }
        Ok(())
    }

    fn handle_buffer(&mut self, samples: &[u8]) -> Result<(), LinkError> {
        if self.state.phase != Phase::Sampling {
            return self.ignore("BUFFER_SEG");
        }
        log::trace!("Got analog data, {} samples", samples.len());
        self.stats.sample_frames += 1;
        self.consumer.on_sample_frame(samples);
        self.state.in_request = false;

        let result = if self.state.oneshot.is_some() && !self.state.delay_request {
            if let Some(callback) = self.state.oneshot.take() {
                log::debug!("One-shot capture complete");
                callback();
            }
            Ok(())
        } else if !self.state.freeze || self.state.delay_request {
            self.request_samples()
        } else {
            log::debug!("Frozen, not requesting more samples");
            Ok(())
        };

        self.state.delay_request = false;
        result
    }

    fn ignore(&mut self, what: &str) -> Result<(), LinkError> {
        self.stats.ignored += 1;
        log::warn!("Unexpected {} in state {:?}, ignoring", what, self.state.phase);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Acquisition control
    // ------------------------------------------------------------------------

    /// Arm (`Some`) or disarm (`None`) a single-shot capture.
    ///
    /// Arming lowers the autotrigger threshold so the next capture fires
    /// quickly; disarming restores it and returns to continuous capture. A
    /// new sampling request goes out immediately when none is outstanding,
    /// otherwise it is deferred until the outstanding reply arrives.
    #[tracing::instrument(level = "debug", skip_all, fields(arming = callback.is_some()))]
    pub fn arm_oneshot(&mut self, callback: Option<OneshotCallback>) -> Result<(), LinkError> {
        let threshold = if callback.is_some() {
            self.config.oneshot_autotrigger
        } else {
            self.config.continuous_autotrigger
        };
        self.state.oneshot = callback;
        self.send(Command::SetAutotrig, &[threshold])?;

        if self.state.phase != Phase::Sampling {
            // The handshake issues the first request itself.
            return Ok(());
        }
        if self.state.in_request {
            log::debug!("Request in flight, deferring");
            self.state.delay_request = true;
            Ok(())
        } else {
            self.request_samples()
        }
    }

    /// Stop (or allow) automatic re-requests after the next completed
    /// capture. Never sends anything by itself.
    pub fn set_freeze(&mut self, freeze: bool) {
        log::debug!("{}", if freeze { "Freezing" } else { "Unfreezing" });
        self.state.freeze = freeze;
    }

    /// Flush a possibly desynchronized receiver on the device with a run of
    /// zero bytes.
    pub fn reset_target(&mut self) -> Result<(), LinkError> {
        let zeros = reset_sequence(self.config.reset_length);
        self.channel.write_bytes(&zeros)?;
        self.channel.flush()?;
        Ok(())
    }

    fn request_samples(&mut self) -> Result<(), LinkError> {
        self.write(Command::StartSampling, &[])?;
        // Once written the request may be on the wire even if flush fails.
        self.state.in_request = true;
        self.stats.sampling_requests += 1;
        self.channel.flush()?;
        Ok(())
    }

    fn send_ping(&mut self, now: Instant) -> Result<(), LinkError> {
        let payload = self.config.ping_payload.clone();
        self.send(Command::Ping, &payload)?;
        self.handshake.pings_sent += 1;
        self.handshake.last_ping = Some(now);
        Ok(())
    }

    fn send(&mut self, command: Command, payload: &[u8]) -> Result<(), LinkError> {
        self.write(command, payload)?;
        self.channel.flush()?;
        Ok(())
    }

    fn write(&mut self, command: Command, payload: &[u8]) -> Result<(), LinkError> {
        let bytes = encode_frame(self.config.commands.id(command), payload)?;
        log::trace!("> {} ({} bytes)", command.as_str(), payload.len());
        self.channel.write_bytes(&bytes)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Device settings
    // ------------------------------------------------------------------------

    pub fn set_trigger_level(&mut self, level: u8) -> Result<(), LinkError> {
        self.send(Command::SetTrigger, &[level])
    }

    pub fn set_holdoff(&mut self, holdoff: u8) -> Result<(), LinkError> {
        self.send(Command::SetHoldoff, &[holdoff])
    }

    pub fn set_vref(&mut self, vref: VoltageReference) -> Result<(), LinkError> {
        self.send(Command::SetVref, &[vref.to_bits()])
    }

    /// Set the ADC clock divider as its log2 (1 = /2 ... 7 = /128).
    pub fn set_prescaler(&mut self, prescale: u8) -> Result<(), LinkError> {
        if !(1..=7).contains(&prescale) {
            return Err(LinkError::InvalidArgument(format!(
                "prescaler {} out of range 1..=7",
                prescale
            )));
        }
        self.send(Command::SetPrescaler, &[prescale])
    }

    pub fn set_num_samples(&mut self, samples: u16) -> Result<(), LinkError> {
        let bytes = self.config.byte_order.u16_bytes(samples);
        self.send(Command::SetSamples, &bytes)
    }

    pub fn set_trigger_invert(&mut self, invert: bool) -> Result<(), LinkError> {
        self.state.trigger_invert = invert;
        self.send_flags()
    }

    pub fn set_dual_channel(&mut self, dual: bool) -> Result<(), LinkError> {
        self.state.dual_channel = dual;
        self.send_flags()
    }

    fn send_flags(&mut self) -> Result<(), LinkError> {
        let mut flags = 0u8;
        if self.state.trigger_invert {
            flags |= FLAG_INVERT_TRIGGER;
        }
        if self.state.dual_channel {
            flags |= FLAG_DUAL_CHANNEL;
        }
        self.send(Command::SetFlags, &[flags])
    }

    pub fn set_channels(&mut self, channels: u8) -> Result<(), LinkError> {
        if !(1..=MAX_CHANNELS).contains(&channels) {
            return Err(LinkError::InvalidArgument(format!(
                "channel count {} out of range 1..={}",
                channels, MAX_CHANNELS
            )));
        }
        self.send(Command::SetChannels, &[channels])
    }

    /// Send the settings of a [`TriggerConfig`] in one go.
    pub fn apply_trigger(&mut self, trigger: &TriggerConfig) -> Result<(), LinkError> {
        self.set_trigger_level(trigger.level)?;
        if let Some(holdoff) = trigger.holdoff {
            self.set_holdoff(holdoff)?;
        }
        self.set_trigger_invert(trigger.inverted())
    }

    pub fn request_parameters(&mut self) -> Result<(), LinkError> {
        self.send(Command::GetParameters, &[])
    }

    pub fn request_constants(&mut self) -> Result<(), LinkError> {
        self.send(Command::GetConstants, &[])
    }

    pub fn write_scratchpad(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.send(Command::WriteScratchpad, data)
    }

    pub fn read_scratchpad(&mut self) -> Result<(), LinkError> {
        self.send(Command::ReadScratchpad, &[])
    }

    pub fn set_pwm1(&mut self, config: &PwmConfig) -> Result<(), LinkError> {
        let bytes = config.encode(self.config.byte_order);
        self.send(Command::SetPwm1, &bytes)
    }

    pub fn request_pwm1(&mut self) -> Result<(), LinkError> {
        self.send(Command::GetPwm1, &[])
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn in_request(&self) -> bool {
        self.state.in_request
    }

    pub fn delay_request(&self) -> bool {
        self.state.delay_request
    }

    pub fn is_frozen(&self) -> bool {
        self.state.freeze
    }

    pub fn oneshot_armed(&self) -> bool {
        self.state.oneshot.is_some()
    }

    pub fn trigger_inverted(&self) -> bool {
        self.state.trigger_invert
    }

    pub fn version(&self) -> Option<FirmwareVersion> {
        self.version
    }

    pub fn parameters(&self) -> Option<&DeviceParameters> {
        self.parameters.as_ref()
    }

    pub fn constants(&self) -> Option<&DeviceConstants> {
        self.constants.as_ref()
    }

    pub fn pwm(&self) -> Option<&PwmConfig> {
        self.pwm.as_ref()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn consumer(&self) -> &K {
        &self.consumer
    }

    pub fn consumer_mut(&mut self) -> &mut K {
        &mut self.consumer
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;
    use crate::consumer::recording::RecordingConsumer;
    use crate::protocol::ReplyKind;
    use std::cell::Cell;
    use std::rc::Rc;

    type TestSession = LinkSession<MockChannel, RecordingConsumer>;

    fn reply(kind: ReplyKind, payload: &[u8]) -> Vec<u8> {
        let table = CommandTable::default();
        encode_frame(table.reply_id(kind), payload).unwrap()
    }

    fn scope_parameters() -> DeviceParameters {
        DeviceParameters {
            trigger_level: 0x80,
            num_samples: 962,
            channels: 1,
            ..DeviceParameters::default()
        }
    }

    fn sent_commands(session: &mut TestSession) -> Vec<u8> {
        session
            .channel_mut()
            .take_frames()
            .into_iter()
            .map(|f| f.command)
            .collect()
    }

    fn new_session() -> TestSession {
        LinkSession::new(
            MockChannel::new(),
            RecordingConsumer::default(),
            LinkConfig::default(),
        )
    }

    /// A session that has completed the handshake with one request in flight.
    fn sampling_session() -> TestSession {
        let mut session = new_session();
        session.connect().unwrap();
        session.feed(&reply(ReplyKind::Pong, &[])).unwrap();
        session.feed(&reply(ReplyKind::Version, &[4, 3])).unwrap();
        let params = scope_parameters().encode(ByteOrder::BigEndian);
        session.feed(&reply(ReplyKind::Parameters, &params)).unwrap();
        session.channel_mut().take_bytes();
        session
    }

    fn buffer() -> Vec<u8> {
        reply(ReplyKind::BufferSeg, &[0, 0, 10, 20, 30])
    }

    const START: u8 = 0x41;
    const AUTOTRIG: u8 = 0x49;

    #[test]
    fn test_connect_sends_ping() {
        let mut session = new_session();
        session.connect().unwrap();
        let frames = session.channel_mut().take_frames();
        assert_eq!(frames, vec![Frame::new(0x3E, vec![1, 2, 3, 4])]);
        assert_eq!(session.phase(), Phase::Ping);
        assert!(!session.in_request());
    }

    #[test]
    fn test_full_handshake_and_first_capture() {
        let mut session = new_session();
        session.connect().unwrap();
        session.channel_mut().take_bytes();

        session.feed(&reply(ReplyKind::Pong, &[])).unwrap();
        assert_eq!(sent_commands(&mut session), vec![0x40]);
        assert_eq!(session.phase(), Phase::GettingVersion);

        session.feed(&reply(ReplyKind::Version, &[4, 3])).unwrap();
        assert_eq!(sent_commands(&mut session), vec![0x47]);
        assert_eq!(session.phase(), Phase::GettingParameters);
        assert_eq!(session.version(), Some(FirmwareVersion { major: 4, minor: 3 }));

        let params = scope_parameters().encode(ByteOrder::BigEndian);
        session.feed(&reply(ReplyKind::Parameters, &params)).unwrap();
        assert_eq!(sent_commands(&mut session), vec![START]);
        assert_eq!(session.phase(), Phase::Sampling);
        assert!(session.in_request());
        assert_eq!(session.parameters(), Some(&scope_parameters()));
        assert_eq!(session.consumer().parameters, vec![scope_parameters()]);

        let samples: Vec<u8> = (0..962u32).map(|i| (i % 251) as u8).collect();
        session.feed(&reply(ReplyKind::BufferSeg, &samples)).unwrap();
        assert_eq!(session.consumer().sample_frames, vec![samples]);
        assert_eq!(sent_commands(&mut session), vec![START]);
        assert!(session.in_request());
    }

    #[test]
    fn test_bytes_arriving_one_at_a_time() {
        let mut session = sampling_session();
        for byte in buffer() {
            session.feed_byte(byte).unwrap();
        }
        assert_eq!(session.consumer().sample_frames.len(), 1);
        assert_eq!(sent_commands(&mut session), vec![START]);
    }

    #[test]
    fn test_pump_reads_from_channel() {
        let mut session = sampling_session();
        let mut inbound = buffer();
        inbound.extend(buffer());
        session.channel_mut().inbound.extend(inbound.iter().copied());
        assert_eq!(session.pump().unwrap(), inbound.len());
        assert_eq!(session.consumer().sample_frames.len(), 2);
    }

    #[test]
    fn test_out_of_phase_replies_ignored() {
        let mut session = new_session();
        session.connect().unwrap();
        session.channel_mut().take_bytes();

        session.feed(&buffer()).unwrap();
        session.feed(&reply(ReplyKind::Scratchpad, &[1])).unwrap();
        assert_eq!(session.phase(), Phase::Ping);
        assert!(session.consumer().sample_frames.is_empty());
        assert!(sent_commands(&mut session).is_empty());
        assert_eq!(session.stats().ignored, 1);

        // Version is cached in any phase but only advances the handshake
        // from GettingVersion.
        session.feed(&reply(ReplyKind::Version, &[1, 0])).unwrap();
        assert_eq!(session.phase(), Phase::Ping);
        assert!(sent_commands(&mut session).is_empty());
        assert_eq!(session.consumer().versions.len(), 1);
    }

    #[test]
    fn test_pong_while_sampling_ignored() {
        let mut session = sampling_session();
        session.feed(&reply(ReplyKind::Pong, &[])).unwrap();
        assert_eq!(session.phase(), Phase::Sampling);
        assert!(sent_commands(&mut session).is_empty());
        assert_eq!(session.stats().ignored, 1);
    }

    #[test]
    fn test_continuous_loop_one_request_per_frame() {
        let mut session = sampling_session();
        for _ in 0..5 {
            session.feed(&buffer()).unwrap();
            assert_eq!(sent_commands(&mut session), vec![START]);
            assert!(session.in_request());
        }
        assert_eq!(session.stats().sample_frames, 5);
    }

    #[test]
    fn test_freeze_mid_flight() {
        let mut session = sampling_session();
        session.set_freeze(true);
        assert!(sent_commands(&mut session).is_empty());

        session.feed(&buffer()).unwrap();
        assert_eq!(session.consumer().sample_frames.len(), 1);
        assert!(sent_commands(&mut session).is_empty());
        assert!(!session.in_request());

        session.set_freeze(false);
        assert!(sent_commands(&mut session).is_empty());
        assert!(!session.in_request());
    }

    #[test]
    fn test_oneshot_armed_while_idle() {
        let mut session = sampling_session();
        session.set_freeze(true);
        session.feed(&buffer()).unwrap();
        session.channel_mut().take_bytes();

        let fired = Rc::new(Cell::new(0));
        let counter = Rc::clone(&fired);
        session
            .arm_oneshot(Some(Box::new(move || counter.set(counter.get() + 1))))
            .unwrap();
        let frames = session.channel_mut().take_frames();
        assert_eq!(
            frames,
            vec![Frame::new(AUTOTRIG, vec![0]), Frame::new(START, vec![])]
        );
        assert!(session.in_request());
        assert!(!session.delay_request());

        session.feed(&buffer()).unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!session.oneshot_armed());
        assert!(!session.in_request());
        assert!(sent_commands(&mut session).is_empty());
    }

    #[test]
    fn test_oneshot_armed_in_flight_is_deferred() {
        let mut session = sampling_session();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        session
            .arm_oneshot(Some(Box::new(move || flag.set(true))))
            .unwrap();

        assert_eq!(sent_commands(&mut session), vec![AUTOTRIG]);
        assert!(session.delay_request());
        assert!(session.in_request());

        // The in-flight reply completes and releases the deferred request.
        session.feed(&buffer()).unwrap();
        assert!(!fired.get());
        assert_eq!(sent_commands(&mut session), vec![START]);
        assert!(!session.delay_request());
        assert!(session.in_request());

        // The capture the one-shot asked for.
        session.feed(&buffer()).unwrap();
        assert!(fired.get());
        assert!(sent_commands(&mut session).is_empty());
        assert_eq!(session.consumer().sample_frames.len(), 2);
    }

    #[test]
    fn test_deferred_request_issued_even_when_frozen() {
        let mut session = sampling_session();
        session.set_freeze(true);
        session.arm_oneshot(Some(Box::new(|| {}))).unwrap();
        session.channel_mut().take_bytes();

        session.feed(&buffer()).unwrap();
        assert_eq!(sent_commands(&mut session), vec![START]);
        assert!(session.oneshot_armed());
    }

    #[test]
    fn test_repeated_arming_never_double_requests() {
        let mut session = sampling_session();
        session.set_freeze(true);
        session.feed(&buffer()).unwrap();
        session.channel_mut().take_bytes();

        session.arm_oneshot(Some(Box::new(|| {}))).unwrap();
        session.arm_oneshot(Some(Box::new(|| {}))).unwrap();
        session.arm_oneshot(None).unwrap();

        let starts = sent_commands(&mut session)
            .into_iter()
            .filter(|c| *c == START)
            .count();
        assert_eq!(starts, 1);
        assert!(session.delay_request());
    }

    #[test]
    fn test_disarm_returns_to_continuous() {
        let mut session = sampling_session();
        session.set_freeze(true);
        session.feed(&buffer()).unwrap();
        session.set_freeze(false);
        session.channel_mut().take_bytes();

        session.arm_oneshot(None).unwrap();
        let frames = session.channel_mut().take_frames();
        assert_eq!(
            frames,
            vec![Frame::new(AUTOTRIG, vec![100]), Frame::new(START, vec![])]
        );

        session.feed(&buffer()).unwrap();
        assert_eq!(sent_commands(&mut session), vec![START]);
    }

    #[test]
    fn test_arm_before_sampling_only_registers() {
        let mut session = new_session();
        session.connect().unwrap();
        session.channel_mut().take_bytes();

        session.arm_oneshot(Some(Box::new(|| {}))).unwrap();
        assert_eq!(sent_commands(&mut session), vec![AUTOTRIG]);
        assert!(!session.in_request());
        assert!(session.oneshot_armed());
    }

    #[test]
    fn test_parameters_pushed_while_sampling() {
        let mut session = sampling_session();
        let pushed = DeviceParameters {
            flags: FLAG_INVERT_TRIGGER,
            ..scope_parameters()
        };
        session
            .feed(&reply(ReplyKind::Parameters, &pushed.encode(ByteOrder::BigEndian)))
            .unwrap();
        assert!(session.trigger_inverted());
        assert_eq!(session.parameters(), Some(&pushed));
        assert!(sent_commands(&mut session).is_empty());
        assert_eq!(session.phase(), Phase::Sampling);
    }

    #[test]
    fn test_checksum_error_is_counted_and_skipped() {
        let mut session = sampling_session();
        let mut corrupted = buffer();
        corrupted[3] ^= 0x10;
        session.feed(&corrupted).unwrap();
        assert_eq!(session.stats().checksum_errors, 1);
        assert!(session.consumer().sample_frames.is_empty());
        assert!(session.in_request());

        session.feed(&buffer()).unwrap();
        assert_eq!(session.consumer().sample_frames.len(), 1);
    }

    #[test]
    fn test_unknown_and_malformed_replies() {
        let mut session = sampling_session();
        session.feed(&encode_frame(0x99, &[1, 2]).unwrap()).unwrap();
        session.feed(&reply(ReplyKind::Parameters, &[1, 2])).unwrap();
        let stats = session.stats();
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(session.phase(), Phase::Sampling);
    }

    #[test]
    fn test_stateless_replies_reach_consumer() {
        let mut session = sampling_session();
        let constants = DeviceConstants {
            frequency_hz: 16_000_000,
            avcc_millivolts: 5000,
            vref_millivolts: 1100,
        };
        let pwm = PwmConfig {
            clock_divider: 1,
            max: 1000,
            count_a: 250,
            count_b: 750,
        };
        session
            .feed(&reply(ReplyKind::Constants, &constants.encode(ByteOrder::BigEndian)))
            .unwrap();
        session.feed(&reply(ReplyKind::Scratchpad, b"hello")).unwrap();
        session
            .feed(&reply(ReplyKind::Pwm1, &pwm.encode(ByteOrder::BigEndian)))
            .unwrap();
        session.feed(&reply(ReplyKind::Error, &[0x02])).unwrap();

        let consumer = session.consumer();
        assert_eq!(consumer.constants, vec![(16_000_000, 5000, 1100)]);
        assert_eq!(consumer.scratchpads, vec![b"hello".to_vec()]);
        assert_eq!(consumer.pwm, vec![pwm]);
        assert_eq!(consumer.device_errors, vec![vec![0x02]]);
        assert_eq!(session.constants(), Some(&constants));
        assert_eq!(session.pwm(), Some(&pwm));
        assert!(sent_commands(&mut session).is_empty());
    }

    #[test]
    fn test_flush_failure_surfaces_and_keeps_state() {
        let mut session = sampling_session();
        session.channel_mut().fail_next_flush = true;
        let err = session.set_trigger_level(0x40).unwrap_err();
        assert!(matches!(err, LinkError::Channel(ChannelError::Io(_))));
        assert!(session.in_request());

        // A START that was never written is not outstanding.
        session.channel_mut().fail_next_write = true;
        assert!(session.feed(&buffer()).is_err());
        assert_eq!(session.consumer().sample_frames.len(), 1);
        assert!(!session.in_request());
        assert!(!session.delay_request());
        assert_eq!(session.stats().sampling_requests, 1);
    }

    #[test]
    fn test_written_start_counts_even_if_flush_fails() {
        let mut session = sampling_session();
        session.channel_mut().fail_next_flush = true;
        assert!(session.feed(&buffer()).is_err());
        assert!(session.in_request());
        assert_eq!(session.stats().sampling_requests, 2);

        // Arming now defers instead of sending a second START.
        session.arm_oneshot(Some(Box::new(|| {}))).unwrap();
        assert_eq!(sent_commands(&mut session), vec![AUTOTRIG]);
        assert!(session.delay_request());
    }

    #[test]
    fn test_settings_commands() {
        let mut session = sampling_session();
        session.set_trigger_level(0x90).unwrap();
        session.set_holdoff(3).unwrap();
        session.set_vref(VoltageReference::Internal).unwrap();
        session.set_prescaler(7).unwrap();
        session.set_num_samples(962).unwrap();
        session.set_channels(2).unwrap();
        session.set_trigger_invert(true).unwrap();
        session.set_dual_channel(true).unwrap();
        session.write_scratchpad(&[0xAA, 0x55]).unwrap();

        let frames = session.channel_mut().take_frames();
        assert_eq!(
            frames,
            vec![
                Frame::new(0x42, vec![0x90]),
                Frame::new(0x43, vec![3]),
                Frame::new(0x45, vec![3]),
                Frame::new(0x46, vec![7]),
                Frame::new(0x48, vec![0x03, 0xC2]),
                Frame::new(0x51, vec![2]),
                Frame::new(0x50, vec![FLAG_INVERT_TRIGGER]),
                Frame::new(0x50, vec![FLAG_INVERT_TRIGGER | FLAG_DUAL_CHANNEL]),
                Frame::new(0x53, vec![0xAA, 0x55]),
            ]
        );
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut session = sampling_session();
        assert!(matches!(
            session.set_channels(5),
            Err(LinkError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.set_channels(0),
            Err(LinkError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.set_prescaler(0),
            Err(LinkError::InvalidArgument(_))
        ));
        assert!(sent_commands(&mut session).is_empty());
    }

    #[test]
    fn test_apply_trigger() {
        let mut session = sampling_session();
        let trigger = TriggerConfig::start_capturing_when()
            .falling_edge(0x30)
            .holdoff(8);
        session.apply_trigger(&trigger).unwrap();
        let frames = session.channel_mut().take_frames();
        assert_eq!(
            frames,
            vec![
                Frame::new(0x42, vec![0x30]),
                Frame::new(0x43, vec![8]),
                Frame::new(0x50, vec![FLAG_INVERT_TRIGGER]),
            ]
        );
    }

    #[test]
    fn test_handshake_retry() {
        let mut session = new_session();
        session.connect().unwrap();
        session.channel_mut().take_bytes();
        let start = Instant::now();

        session.poll(start).unwrap();
        assert!(sent_commands(&mut session).is_empty());

        session.poll(start + Duration::from_secs(3)).unwrap();
        let bytes = session.channel_mut().take_bytes();
        assert!(bytes[..512].iter().all(|b| *b == 0));
        assert_eq!(
            encode_frame(0x3E, &[1, 2, 3, 4]).unwrap(),
            bytes[512..].to_vec()
        );

        session.poll(start + Duration::from_secs(6)).unwrap();
        assert_eq!(sent_commands(&mut session), vec![0x3E]);

        assert!(matches!(
            session.poll(start + Duration::from_secs(9)),
            Err(LinkError::NotResponding { attempts: 3 })
        ));
        session.poll(start + Duration::from_secs(12)).unwrap();
        assert!(sent_commands(&mut session).is_empty());
    }

    #[test]
    fn test_no_retry_once_answered_or_disabled() {
        let mut session = new_session();
        session.connect().unwrap();
        session.feed(&reply(ReplyKind::Pong, &[])).unwrap();
        session.channel_mut().take_bytes();
        session
            .poll(Instant::now() + Duration::from_secs(60))
            .unwrap();
        assert!(sent_commands(&mut session).is_empty());

        let mut quiet = LinkSession::new(
            MockChannel::new(),
            RecordingConsumer::default(),
            LinkConfig::default().with_handshake_retry(None),
        );
        quiet.connect().unwrap();
        quiet.channel_mut().take_bytes();
        quiet.poll(Instant::now() + Duration::from_secs(60)).unwrap();
        assert!(quiet.channel_mut().take_bytes().is_empty());
    }

    #[test]
    fn test_custom_command_table() {
        let commands = CommandTable {
            pong: 0x3F,
            get_version: 0x10,
            ..CommandTable::default()
        };
        let mut session = LinkSession::new(
            MockChannel::new(),
            RecordingConsumer::default(),
            LinkConfig::default().with_commands(commands),
        );
        session.connect().unwrap();
        session.channel_mut().take_bytes();

        session.feed(&reply(ReplyKind::Pong, &[])).unwrap();
        assert_eq!(session.phase(), Phase::Ping);

        session.feed(&encode_frame(0x3F, &[]).unwrap()).unwrap();
        assert_eq!(session.phase(), Phase::GettingVersion);
        assert_eq!(sent_commands(&mut session), vec![0x10]);
    }

    #[test]
    fn test_little_endian_link() {
        let mut session = LinkSession::new(
            MockChannel::new(),
            RecordingConsumer::default(),
            LinkConfig::default().with_byte_order(ByteOrder::LittleEndian),
        );
        session.connect().unwrap();
        session.feed(&reply(ReplyKind::Pong, &[])).unwrap();
        session.feed(&reply(ReplyKind::Version, &[4, 3])).unwrap();
        let params = scope_parameters().encode(ByteOrder::LittleEndian);
        session.feed(&reply(ReplyKind::Parameters, &params)).unwrap();
        assert_eq!(session.parameters().map(|p| p.num_samples), Some(962));
    }

    #[test]
    fn test_reconnect_resets_state() {
        let mut session = sampling_session();
        session.feed(&buffer()).unwrap();
        session.set_freeze(true);
        assert!(session.version().is_some());
        session.connect().unwrap();
        assert_eq!(session.phase(), Phase::Ping);
        assert!(!session.in_request());
        assert!(!session.is_frozen());
        assert_eq!(session.version(), None);
        assert_eq!(session.parameters(), None);
        assert_eq!(session.constants(), None);
        assert_eq!(session.pwm(), None);
        assert_eq!(session.stats(), LinkStats::default());
        let (channel, consumer) = session.into_parts();
        assert_eq!(channel.flushes, 6);
        assert_eq!(consumer.sample_frames.len(), 1);
    }

    /// Answers every flushed START_SAMPLING with a sample buffer, like a
    /// device running short captures back to back.
    #[derive(Debug, Default)]
    struct StreamingChannel {
        inner: MockChannel,
        start_written: bool,
    }

    impl ByteChannel for StreamingChannel {
        fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
            self.inner.read_bytes(buf)
        }

        fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
            if bytes == encode_frame(START, &[]).unwrap().as_slice() {
                self.start_written = true;
            }
            self.inner.write_bytes(bytes)
        }

        fn flush(&mut self) -> Result<(), ChannelError> {
            self.inner.flush()?;
            if std::mem::take(&mut self.start_written) {
                let samples = [0x42u8; 200];
                self.inner
                    .inbound
                    .extend(reply(ReplyKind::BufferSeg, &samples));
            }
            Ok(())
        }
    }

    #[test]
    fn test_pump_returns_while_device_streams() {
        let mut session = LinkSession::new(
            StreamingChannel::default(),
            RecordingConsumer::default(),
            LinkConfig::default(),
        );
        session.connect().unwrap();
        session.feed(&reply(ReplyKind::Pong, &[])).unwrap();
        session.feed(&reply(ReplyKind::Version, &[4, 3])).unwrap();
        let params = scope_parameters().encode(ByteOrder::BigEndian);
        session.feed(&reply(ReplyKind::Parameters, &params)).unwrap();

        let consumed = session.pump().unwrap();
        assert!(consumed > 0 && consumed <= READ_CHUNK * MAX_READS_PER_PUMP);
        assert!(!session.channel().inner.inbound.is_empty());
        let delivered = session.consumer().sample_frames.len();
        assert_eq!(delivered, MAX_READS_PER_PUMP);

        session.pump().unwrap();
        assert!(session.consumer().sample_frames.len() > delivered);
    }
}
