//! # DAC/ADC ramp controller firmware
//!
//! Hardware specific setup etc.

pub use stm32h7xx_hal as hal;

pub mod delay;
pub mod setup;
pub mod usb;

use hal::{
    gpio::{ErasedPin, Input, Output, PushPull},
    spi::{Enabled, Spi},
    stm32::{SPI3, SPI4},
};

use crate::{ad4115::Ad4115, ad5791::Ad5791};

/// System timer (RTIC Monotonic) tick frequency
pub const MONOTONIC_FREQUENCY: u32 = 1_000;
rtic_monotonics::systick_monotonic!(Systick, MONOTONIC_FREQUENCY);

pub type UsbBus = stm32h7xx_hal::usb_hs::UsbBus<stm32h7xx_hal::usb_hs::USB2>;

// Type alias for the USB device.
pub type UsbDevice = usb_device::device::UsbDevice<'static, UsbBus>;

pub type SerialPort =
    usbd_serial::SerialPort<'static, UsbBus, &'static mut [u8], &'static mut [u8]>;

/// The four AD5791 outputs on SPI3, one sync line each plus the shared LDAC.
pub type Dac = Ad5791<
    Spi<SPI3, Enabled, u8>,
    ErasedPin<Output<PushPull>>,
    ErasedPin<Output<PushPull>>,
>;

/// The AD4115 on SPI4 with its chip select and the data ready line sensed on MISO.
pub type Adc = Ad4115<Spi<SPI4, Enabled, u8>, ErasedPin<Output<PushPull>>, ErasedPin<Input>>;
