//! Runtime configuration.

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::{
    ad4115::ChannelConfig,
    ad5791::Calibration,
    AdcChannel, Error, ADC_CHANNELS, DAC_CHANNELS,
};

/// An ADC channel enabled at boot.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdcInput {
    /// Channel register 0..=15
    pub channel: u8,
    /// Setup slot 0..=7
    pub setup: u8,
    pub input_positive: u8,
    /// Negative input, 16 selects VINCOM.
    pub input_negative: u8,
}

impl AdcInput {
    pub fn config(&self) -> Result<ChannelConfig, Error> {
        ChannelConfig::new(
            AdcChannel::new(self.channel)?,
            1,
            self.setup,
            self.input_positive,
            self.input_negative,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Identification returned by `*IDN?`.
    pub name: String<32>,

    /// DAC gain and offset errors, indexed by output channel.
    pub calibration: [Calibration; DAC_CHANNELS],

    /// ADC data ready timeout in microseconds. `None` waits forever.
    pub adc_ready_timeout_us: Option<u32>,

    /// ADC channels enabled at boot.
    pub adc_inputs: Vec<AdcInput, ADC_CHANNELS>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut name = String::new();
        // Fits the capacity.
        name.push_str("DAC-ADC-RAMP").ok();

        Self {
            name,
            calibration: Default::default(),
            adc_ready_timeout_us: Some(1_000_000),
            adc_inputs: default_inputs(),
        }
    }
}

#[cfg(all(feature = "all_differential", not(feature = "all_single_ended")))]
fn default_inputs() -> Vec<AdcInput, ADC_CHANNELS> {
    // The 8 differential pairs on channels 0..=7.
    (0..ADC_CHANNELS as u8 / 2)
        .map(|ch| AdcInput {
            channel: ch,
            setup: 0,
            input_positive: 2 * ch,
            input_negative: 2 * ch + 1,
        })
        .collect()
}

#[cfg(feature = "all_single_ended")]
fn default_inputs() -> Vec<AdcInput, ADC_CHANNELS> {
    use crate::ad4115::VINCOM;

    (0..ADC_CHANNELS as u8)
        .map(|ch| AdcInput {
            channel: ch,
            setup: 0,
            input_positive: ch,
            input_negative: VINCOM,
        })
        .collect()
}

#[cfg(not(any(feature = "all_differential", feature = "all_single_ended")))]
fn default_inputs() -> Vec<AdcInput, ADC_CHANNELS> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad4115::VINCOM;

    #[test]
    fn default_inputs_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.name.as_str(), "DAC-ADC-RAMP");
        for input in settings.adc_inputs.iter() {
            let config = input.config().unwrap();
            assert!(config.enabled());
            assert_eq!(config.channel().index(), input.channel as usize);
        }
        assert_eq!(settings.calibration[3], Calibration::default());
    }

    #[test]
    fn invalid_input_is_rejected() {
        let input = AdcInput {
            channel: 16,
            setup: 0,
            input_positive: 0,
            input_negative: VINCOM,
        };
        assert_eq!(input.config(), Err(Error::InvalidChannel));
        let input = AdcInput {
            channel: 2,
            input_negative: 5,
            ..input
        };
        assert_eq!(input.config(), Err(Error::InvalidInputPair));
    }
}
