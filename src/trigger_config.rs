use crate::parameters::DeviceParameters;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TriggerConfigError {
    #[error("Trigger voltage {volts} V outside of 0..={full_scale} V")]
    VoltageOutOfRange { volts: f64, full_scale: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    Rising,
    Falling,
}

impl TriggerEdge {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEdge::Rising => "+",
            TriggerEdge::Falling => "-",
        }
    }
}

#[derive(Debug, Default)]
pub struct TriggerBuilder {
    _private: (),
}

impl TriggerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rising_edge(self, level: u8) -> TriggerConfig {
        TriggerConfig::new(level, TriggerEdge::Rising)
    }

    pub fn falling_edge(self, level: u8) -> TriggerConfig {
        TriggerConfig::new(level, TriggerEdge::Falling)
    }

    /// Same as [`TriggerBuilder::rising_edge`], with the level given in volts
    /// against the ADC's full scale reference.
    pub fn rising_edge_volts(
        self,
        volts: f64,
        full_scale: f64,
    ) -> Result<TriggerConfig, TriggerConfigError> {
        Ok(TriggerConfig::new(volts_to_raw(volts, full_scale)?, TriggerEdge::Rising))
    }

    pub fn falling_edge_volts(
        self,
        volts: f64,
        full_scale: f64,
    ) -> Result<TriggerConfig, TriggerConfigError> {
        Ok(TriggerConfig::new(volts_to_raw(volts, full_scale)?, TriggerEdge::Falling))
    }
}

fn volts_to_raw(volts: f64, full_scale: f64) -> Result<u8, TriggerConfigError> {
    if !(0.0..=full_scale).contains(&volts) || full_scale <= 0.0 {
        return Err(TriggerConfigError::VoltageOutOfRange { volts, full_scale });
    }
    Ok((volts / full_scale * 255.0 + 0.5) as u8)
}

/// Trigger level, edge and holdoff, sent to the device with
/// [`crate::LinkSession::apply_trigger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Raw 8-bit ADC level.
    pub level: u8,
    pub edge: TriggerEdge,
    /// Samples to skip after a capture before re-arming. `None` leaves the
    /// device setting alone.
    pub holdoff: Option<u8>,
}

impl TriggerConfig {
    pub fn new(level: u8, edge: TriggerEdge) -> Self {
        Self {
            level,
            edge,
            holdoff: None,
        }
    }

    pub fn start_capturing_when() -> TriggerBuilder {
        TriggerBuilder::new()
    }

    pub fn holdoff(mut self, samples: u8) -> Self {
        self.holdoff = Some(samples);
        self
    }

    pub fn inverted(&self) -> bool {
        self.edge == TriggerEdge::Falling
    }

    /// The trigger the device reports it is currently using.
    pub fn from_parameters(parameters: &DeviceParameters) -> Self {
        let edge = if parameters.trigger_inverted() {
            TriggerEdge::Falling
        } else {
            TriggerEdge::Rising
        };
        Self::new(parameters.trigger_level, edge).holdoff(parameters.holdoff_samples)
    }
}

impl std::fmt::Display for TriggerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:#04x}", self.edge.as_str(), self.level)?;
        if let Some(holdoff) = self.holdoff {
            write!(f, " holdoff {}", holdoff)?;
        }
        Ok(())
    }
}
