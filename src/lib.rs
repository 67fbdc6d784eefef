#![cfg_attr(not(test), no_std)]

#[cfg(target_os = "none")]
pub mod hardware;

pub mod ad4115;
pub mod ad5791;
pub mod command;
pub mod convert;
pub mod frame;
pub mod ramp;
pub mod settings;

#[cfg(test)]
mod mock;

use arbitrary_int::u4;

/// Number of DAC output channels.
pub const DAC_CHANNELS: usize = 4;

/// Number of ADC input channels.
pub const ADC_CHANNELS: usize = 16;

/// DAC output channel. Each channel is a separate AD5791 with its own sync line.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::EnumIter, num_enum::TryFromPrimitive,
)]
#[repr(u8)]
pub enum DacChannel {
    Zero = 0,
    One = 1,
    Two = 2,
    Three = 3,
}

impl DacChannel {
    pub const ALL: [Self; DAC_CHANNELS] = [Self::Zero, Self::One, Self::Two, Self::Three];

    pub fn new(index: u8) -> Result<Self, Error> {
        Self::try_from(index).map_err(|_| Error::InvalidChannel)
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// AD4115 channel register index (0..=15).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdcChannel(u4);

impl AdcChannel {
    pub fn new(index: u8) -> Result<Self, Error> {
        u4::try_new(index)
            .map(Self)
            .map_err(|_| Error::InvalidChannel)
    }

    pub fn index(self) -> usize {
        self.0.value() as usize
    }

    /// All 16 channels in register order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ADC_CHANNELS as u8).map(|i| Self(u4::new(i)))
    }
}

impl TryFrom<u8> for AdcChannel {
    type Error = Error;
    fn try_from(index: u8) -> Result<Self, Error> {
        Self::new(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid channel state")]
    InvalidState,
    #[error("Invalid setup")]
    InvalidSetup,
    #[error("Invalid input pair")]
    InvalidInputPair,
    #[error("Invalid positive input")]
    InvalidInput1,
    #[error("Invalid negative input")]
    InvalidInput2,
    #[error("VOLTAGE OVERRANGE")]
    VoltageOverrange,
    #[error("Invalid step count")]
    InvalidStepCount,
    #[error("Data ready timeout")]
    DataReadyTimeout,
    #[error("Frame capacity exceeded")]
    FrameCapacityExceeded,
    #[error("Invalid channel")]
    InvalidChannel,
    #[error("Refusing to transfer a poisoned frame")]
    PoisonedFrame,
    #[error("ADC acquisition out of sequence")]
    Sequence,
    #[error("Ramp cancelled")]
    Cancelled,
    #[error("Invalid ADC ID {0:#06x}")]
    AdcId(u16),
    #[error("Output write failed")]
    Output,
    #[error("SPI")]
    Spi,
    #[error("GPIO")]
    Pin,
}
