//! AD5791 DAC driver
//!
//! Four AD5791 20 bit DACs share one SPI bus. Each DAC is addressed by its own
//! "sync" signal, similar to a chip select signal. All DACs share one LDAC line:
//! a low pulse moves the written codes of every DAC to the analog outputs at once.
//! DAC datasheet: https://www.analog.com/media/en/technical-documentation/data-sheets/ad5791.pdf

use core::fmt::Debug;

use arbitrary_int::{u20, u24};
use bitbybit::{bitenum, bitfield};
use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    convert::DacCode,
    frame::{pin_error, Frame},
    DacChannel, Error, DAC_CHANNELS,
};

#[bitenum(u3, exhaustive = false)]
#[derive(Debug, PartialEq)]
enum DacReg {
    Nop = 0b000,
    Dac = 0b001,
    Control = 0b010,
    ClearCode = 0b011,
    SoftwareControl = 0b100,
}

/// 24 bit input shift register word.
#[bitfield(u24, default = 0)]
#[derive(Debug, PartialEq)]
struct Command {
    #[bit(23, rw)]
    read: bool,
    #[bits(20..=22, rw)]
    addr: Option<DacReg>,
    #[bits(0..=19, rw)]
    data: u20,
}

impl Command {
    fn to_bytes(self) -> [u8; 3] {
        let [_, b0, b1, b2] = self.raw_value().value().to_be_bytes();
        [b0, b1, b2]
    }
}

/// Control register payload.
#[bitfield(u20, default = 0)]
#[derive(Debug, PartialEq)]
struct Control {
    #[bit(1, rw)]
    rbuf: bool,
    #[bit(2, rw)]
    opgnd: bool,
    #[bit(3, rw)]
    dactri: bool,
    #[bit(4, rw)]
    offset_binary: bool,
    #[bit(5, rw)]
    sdodis: bool,
}

fn write_frame(reg: DacReg, data: u20) -> Result<Frame, Error> {
    let cmd = Command::builder()
        .with_read(false)
        .with_addr(reg)
        .with_data(data)
        .build();
    Frame::single(&cmd.to_bytes())
}

fn read_request_frame(reg: DacReg) -> Result<Frame, Error> {
    let cmd = Command::builder()
        .with_read(true)
        .with_addr(reg)
        .with_data(u20::new(0))
        .build();
    Frame::single(&cmd.to_bytes())
}

/// Exit tristate and output clamp, two's complement coding, internal amplifier mode.
fn control_frame() -> Result<Frame, Error> {
    let control = Control::builder()
        .with_rbuf(true)
        .with_opgnd(false)
        .with_dactri(false)
        .with_offset_binary(false)
        .with_sdodis(false)
        .build();
    write_frame(DacReg::Control, control.raw_value())
}

/// Decode a register readback. The read flag and address bits of the first byte are dropped.
fn decode_readback(bytes: [u8; 3]) -> DacCode {
    let cmd = Command::new_with_raw_value(u24::new(u32::from_be_bytes([
        0,
        bytes[0] & 0x0f,
        bytes[1],
        bytes[2],
    ])));
    DacCode::from_raw(cmd.data().value())
}

/// Gain and offset error factors of one output channel.
///
/// These are carried with the channel state; conversions do not apply them.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub gain_error: f64,
    pub offset: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            gain_error: 1.0,
            offset: 0.0,
        }
    }
}

/// Bookkeeping of one output channel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DacChannelState {
    /// Last code written to the DAC register.
    pub code: DacCode,
    /// Code last moved to the analog output by an LDAC pulse.
    pub latched: DacCode,
    /// Last voltage read back from the DAC register.
    pub readback: Option<f64>,
    pub calibration: Calibration,
}

impl Default for DacChannelState {
    fn default() -> Self {
        Self {
            code: DacCode::from_raw(0),
            latched: DacCode::from_raw(0),
            readback: None,
            calibration: Calibration::default(),
        }
    }
}

/// DAC driver struct containing the SPI bus, the sync pins and the LDAC pin.
pub struct Ad5791<SPI, SYNC, LDAC> {
    spi: SPI,
    sync: [SYNC; DAC_CHANNELS],
    ldac: LDAC,
    channels: [DacChannelState; DAC_CHANNELS],
}

impl<SPI, SYNC, LDAC> Ad5791<SPI, SYNC, LDAC>
where
    SPI: Transfer<u8>,
    SPI::Error: Debug,
    SYNC: OutputPin,
    SYNC::Error: Debug,
    LDAC: OutputPin,
    LDAC::Error: Debug,
{
    /// Construct a new DAC driver for all output channels.
    ///
    /// # Args
    /// * `spi` - SPI bus, mode 1
    /// * `sync` - DAC sync pins, indexed by output channel
    /// * `ldac` - Shared LDAC pin
    pub fn new(spi: SPI, sync: [SYNC; DAC_CHANNELS], ldac: LDAC) -> Result<Self, Error> {
        let mut dac = Self {
            spi,
            sync,
            ldac,
            channels: Default::default(),
        };
        dac.begin()?;
        Ok(dac)
    }

    /// Drive all sync pins and LDAC to their idle (high) level.
    pub fn begin(&mut self) -> Result<(), Error> {
        for sync in self.sync.iter_mut() {
            sync.set_high().map_err(pin_error)?;
        }
        self.ldac.set_high().map_err(pin_error)
    }

    fn send(&mut self, channel: DacChannel, frame: &Frame) -> Result<Frame, Error> {
        frame.transfer(&mut self.spi, &mut self.sync[channel.index()], false)
    }

    /// Take all DACs out of their power on tristate into normal operation.
    pub fn initialize_all(&mut self) -> Result<(), Error> {
        let frame = control_frame()?;
        for channel in DacChannel::ALL {
            self.send(channel, &frame)?;
        }
        info!("DAC channels initialized");
        Ok(())
    }

    /// Write a voltage to an output channel.
    ///
    /// # Args
    /// * `channel` - Output channel
    /// * `voltage` - Output voltage in volt, within `±FULL_SCALE`
    /// * `update` - Pulse LDAC after the write, moving all written codes to the outputs
    ///
    /// # Returns
    /// The voltage the written code represents.
    pub fn set_voltage(
        &mut self,
        channel: DacChannel,
        voltage: f64,
        update: bool,
    ) -> Result<f64, Error> {
        let code = DacCode::try_from(voltage).inspect_err(|_| {
            warn!("DAC {} voltage {} out of range", channel.index(), voltage)
        })?;
        self.send(channel, &write_frame(DacReg::Dac, u20::new(code.raw()))?)?;
        self.channels[channel.index()].code = code;
        debug!(
            "DAC {}: {} V requested, {} V written",
            channel.index(),
            voltage,
            code.voltage()
        );
        if update {
            self.update_analog_outputs()?;
        }
        Ok(code.voltage())
    }

    /// Pulse LDAC. All channels move to their last written code simultaneously.
    pub fn update_analog_outputs(&mut self) -> Result<(), Error> {
        self.ldac.set_low().map_err(pin_error)?;
        self.ldac.set_high().map_err(pin_error)?;
        for state in self.channels.iter_mut() {
            state.latched = state.code;
        }
        Ok(())
    }

    /// Read back the DAC register of a channel.
    ///
    /// The DAC shifts the register out during the transfer following the read request.
    pub fn read_dac_register(&mut self, channel: DacChannel) -> Result<DacCode, Error> {
        self.send(channel, &read_request_frame(DacReg::Dac)?)?;
        let response = self.send(channel, &Frame::single(&[0; 3])?)?;
        let bytes = response.as_bytes();
        Ok(decode_readback([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn read_voltage(&mut self, channel: DacChannel) -> Result<f64, Error> {
        let voltage = self.read_dac_register(channel)?.voltage();
        self.channels[channel.index()].readback = Some(voltage);
        Ok(voltage)
    }

    pub fn channel(&self, channel: DacChannel) -> &DacChannelState {
        &self.channels[channel.index()]
    }

    pub fn set_calibration(&mut self, channel: DacChannel, calibration: Calibration) {
        self.channels[channel.index()].calibration = calibration;
    }
}
