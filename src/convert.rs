use arbitrary_int::{u20, Number};
use num_traits::float::Float;

use crate::Error;

/// DAC output full scale in volt. The output span is `-FULL_SCALE..=FULL_SCALE`.
pub const FULL_SCALE: f64 = 10.0;

/// A type representing an AD5791 20 bit two's complement DAC code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DacCode(u20);

impl DacCode {
    // Codes per full scale. The positive and negative half spans differ by one code.
    const POSITIVE_SPAN: f64 = ((1 << 19) - 1) as f64;
    const NEGATIVE_SPAN: f64 = (1 << 19) as f64;
    const MODULUS: i32 = 1 << 20;

    /// Largest positive code.
    pub const MAX: i32 = (1 << 19) - 1;
    /// Most negative code.
    pub const MIN: i32 = -(1 << 19);

    /// Voltage resolution of one code on the positive half span.
    pub const LSB: f64 = FULL_SCALE / Self::POSITIVE_SPAN;

    /// Construct a code from the 20 data bits of a register word. Higher bits are dropped.
    pub fn from_raw(raw: u32) -> Self {
        Self(u20::new(raw & u20::MAX.value()))
    }

    /// The unsigned register representation.
    pub fn raw(self) -> u32 {
        self.0.value()
    }

    /// The signed code value in `MIN..=MAX`.
    pub fn signed(self) -> i32 {
        let raw = self.raw() as i32;
        if raw > Self::MAX {
            raw - Self::MODULUS
        } else {
            raw
        }
    }

    pub fn voltage(self) -> f64 {
        self.into()
    }
}

impl TryFrom<f64> for DacCode {
    type Error = Error;

    /// Convert a voltage to the nearest DAC code.
    fn try_from(voltage: f64) -> Result<Self, Error> {
        // Also rejects NaN.
        if !(voltage.abs() <= FULL_SCALE) {
            return Err(Error::VoltageOverrange);
        }
        let code = if voltage < 0.0 {
            (voltage * Self::NEGATIVE_SPAN / FULL_SCALE).round() as i32 + Self::MODULUS
        } else {
            (voltage * Self::POSITIVE_SPAN / FULL_SCALE).round() as i32
        };
        // A negative voltage rounding to code zero wraps back to zero.
        Ok(Self::from_raw(code as u32))
    }
}

impl From<DacCode> for f64 {
    fn from(code: DacCode) -> f64 {
        let raw = code.raw();
        if raw as i32 <= DacCode::MAX {
            raw as f64 * FULL_SCALE / DacCode::POSITIVE_SPAN
        } else {
            -((DacCode::MODULUS - raw as i32) as f64) * FULL_SCALE / DacCode::NEGATIVE_SPAN
        }
    }
}

impl From<DacCode> for u32 {
    fn from(code: DacCode) -> u32 {
        code.raw()
    }
}

/// A type representing an AD4115 24 bit offset binary conversion result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdcCode(u32);

impl AdcCode {
    // Mid scale code, zero volt in bipolar mode.
    const MID_SCALE: f64 = (1 << 23) as f64;
    // Input span in volt on either side of zero.
    const SPAN: f64 = 25.0;

    /// Concatenate the three data bytes of a read, MSB first.
    pub fn from_be_bytes(bytes: [u8; 3]) -> Self {
        Self(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    pub fn to_be_bytes(self) -> [u8; 3] {
        let [_, b0, b1, b2] = self.0.to_be_bytes();
        [b0, b1, b2]
    }

    pub fn voltage(self) -> f64 {
        self.into()
    }
}

impl From<u32> for AdcCode {
    fn from(value: u32) -> Self {
        Self(value & 0xff_ffff)
    }
}

impl From<AdcCode> for u32 {
    fn from(code: AdcCode) -> u32 {
        code.0
    }
}

impl From<AdcCode> for f64 {
    fn from(code: AdcCode) -> f64 {
        (code.0 as f64 / AdcCode::MID_SCALE - 1.0) * AdcCode::SPAN
    }
}
