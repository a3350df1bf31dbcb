//! Outbound interface from the link to whatever displays the data.

use crate::parameters::{DeviceParameters, FirmwareVersion, PwmConfig};

/// Fired once when an armed single-shot capture completes. Any data the
/// caller wants back travels in the closure's captures.
pub type OneshotCallback = Box<dyn FnOnce()>;

/// Receives everything the device reports.
///
/// Every method has an empty default so a consumer only implements what it
/// draws.
pub trait LinkConsumer {
    /// A captured buffer, exactly as received.
    fn on_sample_frame(&mut self, _samples: &[u8]) {}

    fn on_parameters(&mut self, _parameters: &DeviceParameters) {}

    fn on_constants(&mut self, _frequency_hz: u32, _avcc_millivolts: u16, _vref_millivolts: u16) {}

    fn on_version(&mut self, _version: FirmwareVersion) {}

    fn on_scratchpad(&mut self, _data: &[u8]) {}

    fn on_pwm(&mut self, _config: &PwmConfig) {}

    fn on_device_error(&mut self, _payload: &[u8]) {}
}

impl LinkConsumer for () {}
