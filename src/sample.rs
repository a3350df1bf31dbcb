//! Captured sample buffers and their conversion to a `DataFrame`.
//!
//! A BUFFER_SEG payload starts with a two byte header (channel count minus one,
//! then the flags the capture ran with) followed by 8-bit samples, interleaved
//! across channels.

use polars::prelude::*;

use crate::protocol::{FLAG_DUAL_CHANNEL, FLAG_INVERT_TRIGGER, MAX_CHANNELS};

pub const TIME_COLUMN_NAME: &str = "time";

/// CPU clock of the stock boards.
pub const DEFAULT_CPU_HZ: u32 = 16_000_000;

/// ADC clock cycles per conversion.
const ADC_CYCLES_PER_SAMPLE: f64 = 13.0;

const HEADER_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SampleFrameError {
    #[error("Sample frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid channel count {0}, must be between 1 and 4")]
    InvalidChannels(u16),
}

/// Effective sample rate of a device clocked at `cpu_hz` with the given
/// ADC prescaler (log2 of the divider).
pub fn sample_rate_hz(cpu_hz: u32, prescale: u8) -> f64 {
    f64::from(cpu_hz) / 2f64.powi(i32::from(prescale)) / ADC_CYCLES_PER_SAMPLE
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFrame {
    channels: u8,
    flags: u8,
    samples: Vec<u8>,
}

impl SampleFrame {
    pub fn parse(payload: &[u8]) -> Result<Self, SampleFrameError> {
        if payload.len() < HEADER_LEN {
            return Err(SampleFrameError::TooShort(payload.len()));
        }
        let channels = u16::from(payload[0]) + 1;
        if channels > u16::from(MAX_CHANNELS) {
            return Err(SampleFrameError::InvalidChannels(channels));
        }
        Ok(Self {
            channels: channels as u8,
            flags: payload[1],
            samples: payload[HEADER_LEN..].to_vec(),
        })
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn trigger_inverted(&self) -> bool {
        self.flags & FLAG_INVERT_TRIGGER != 0
    }

    pub fn dual_channel(&self) -> bool {
        self.flags & FLAG_DUAL_CHANNEL != 0
    }

    /// Raw interleaved samples.
    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    /// Complete samples per channel. A trailing partial group is not counted.
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// De-interleave one channel. `None` if the frame has no such channel.
    pub fn channel(&self, index: usize) -> Option<Vec<u8>> {
        let channels = usize::from(self.channels);
        if index >= channels {
            return None;
        }
        Some(
            self.samples
                .iter()
                .skip(index)
                .step_by(channels)
                .take(self.samples_per_channel())
                .copied()
                .collect(),
        )
    }

    /// One row per sample with a `time` column in seconds and a `ch{n}`
    /// column per channel.
    pub fn to_dataframe(&self, sample_rate_hz: f64) -> PolarsResult<DataFrame> {
        profile_scope!("SampleFrame::to_dataframe");

        let mut columns = Vec::with_capacity(usize::from(self.channels));
        let mut selection = vec![col(TIME_COLUMN_NAME)];
        for index in 0..usize::from(self.channels) {
            let name = format!("ch{}", index);
            let values: Vec<u32> = self
                .channel(index)
                .unwrap_or_default()
                .into_iter()
                .map(u32::from)
                .collect();
            selection.push(col(name.as_str()));
            let column: Column = Series::new(name.into(), values).into();
            columns.push(column);
        }

        DataFrame::new(columns)?
            .lazy()
            .with_row_index("row_index", Some(0))
            .with_columns([(col("row_index").cast(DataType::Float64)
                * lit(1.0 / sample_rate_hz))
            .alias(TIME_COLUMN_NAME)])
            .select(selection)
            .collect()
    }
}
