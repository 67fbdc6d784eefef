//! AD4115 16 channel ADC driver
//!
//! (AD4115 https://www.analog.com/media/en/technical-documentation/data-sheets/ad4115.pdf)
//!
//! The ADC is operated in single conversion mode. A conversion pass over all
//! enabled channels is started by a mode register write; the ADC then signals each
//! result by pulling DOUT/RDY low. DOUT/RDY is only driven while the ADC is selected,
//! so the select line is held for the whole pass and released afterwards.

use core::fmt::Debug;

use arbitrary_int::{u3, u5, u6};
use bitbybit::{bitenum, bitfield};
use embedded_hal::{
    blocking::{
        delay::{DelayMs, DelayUs},
        spi::Transfer,
    },
    digital::v2::{InputPin, OutputPin},
};
use log::{debug, info, warn};

use crate::{
    convert::AdcCode,
    frame::{pin_error, Frame},
    AdcChannel, Error, ADC_CHANNELS,
};

/// The common mode input (VINCOM) used as the negative input of a single ended channel.
pub const VINCOM: u8 = 16;

// Highest analog input index usable as a positive input.
const MAX_INPUT: u8 = 15;

// Data ready polling interval.
const POLL_INTERVAL_US: u32 = 1;

// ADC Register Adresses
#[allow(unused)]
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum AdcReg {
    Status = 0x00,
    AdcMode = 0x01,
    IfMode = 0x02,
    Data = 0x04,
    Id = 0x07,
    Ch0 = 0x10,
    SetupCon0 = 0x20,
    FiltCon0 = 0x28,
    Offset0 = 0x30,
    Gain0 = 0x38,
}

/// Communications register, the first byte of every transaction.
#[bitfield(u8, default = 0)]
#[derive(Debug, PartialEq)]
struct Comms {
    #[bit(6, rw)]
    read: bool,
    #[bits(0..=5, rw)]
    addr: u6,
}

impl Comms {
    fn write_cmd(addr: u8) -> u8 {
        Self::builder()
            .with_read(false)
            .with_addr(u6::new(addr))
            .build()
            .raw_value()
    }

    fn read_cmd(addr: u8) -> u8 {
        Self::builder()
            .with_read(true)
            .with_addr(u6::new(addr))
            .build()
            .raw_value()
    }
}

/// Channel register CH0..CH15 payload.
#[bitfield(u16, default = 0)]
#[derive(Debug, PartialEq)]
struct ChannelRegister {
    #[bit(15, rw)]
    ch_en: bool,
    #[bits(12..=14, rw)]
    setup_sel: u3,
    #[bits(5..=9, rw)]
    ainpos: u5,
    #[bits(0..=4, rw)]
    ainneg: u5,
}

#[bitenum(u3, exhaustive = false)]
#[derive(Debug, PartialEq)]
enum Mode {
    ContinuousConversion = 0b000,
    SingleConversion = 0b001,
    Standby = 0b010,
    PowerDown = 0b011,
}

#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq)]
enum Clocksel {
    InternalOscillator = 0b00,
    InternalOscillatorOutput = 0b01,
    ExternalClock = 0b10,
    ExternalCrystal = 0b11,
}

/// ADCMODE register payload.
#[bitfield(u16, default = 0)]
#[derive(Debug, PartialEq)]
struct AdcMode {
    #[bit(15, rw)]
    ref_en: bool,
    #[bits(4..=6, rw)]
    mode: Option<Mode>,
    #[bits(2..=3, rw)]
    clocksel: Clocksel,
}

#[bitenum(u2, exhaustive = false)]
#[derive(Debug, PartialEq)]
enum RefSel {
    External = 0b00,
    Internal = 0b10,
    Avdd = 0b11,
}

/// SETUPCON0..SETUPCON7 register payload.
#[bitfield(u16, default = 0)]
#[derive(Debug, PartialEq)]
struct SetupCon {
    #[bit(12, rw)]
    bipolar: bool,
    #[bit(11, rw)]
    refbuf_p: bool,
    #[bit(10, rw)]
    refbuf_n: bool,
    #[bit(9, rw)]
    ainbuf_p: bool,
    #[bit(8, rw)]
    ainbuf_n: bool,
    #[bits(4..=5, rw)]
    ref_sel: Option<RefSel>,
}

/// IFMODE register payload.
#[bitfield(u16, default = 0)]
#[derive(Debug, PartialEq)]
struct IfMode {
    #[bit(6, rw)]
    data_stat: bool,
}

fn register_write(addr: u8, payload: u16) -> [u8; 3] {
    let [hi, lo] = payload.to_be_bytes();
    [Comms::write_cmd(addr), hi, lo]
}

/// A validated channel register configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    channel: AdcChannel,
    enabled: bool,
    setup: u3,
    input_positive: u5,
    input_negative: u5,
}

impl ChannelConfig {
    /// Validate a channel configuration.
    ///
    /// # Args
    /// * `channel` - Channel register to configure
    /// * `state` - 1 enables, 0 disables the channel
    /// * `setup` - Setup slot 0..=7 the channel uses
    /// * `input_positive` - Positive analog input 0..=15
    /// * `input_negative` - Negative analog input 0..=15 or [VINCOM]
    ///
    /// The inputs must form one of the adjacent differential pairs `{0, 1}` .. `{14, 15}`
    /// (in either order) unless the negative input is [VINCOM].
    pub fn new(
        channel: AdcChannel,
        state: u8,
        setup: u8,
        input_positive: u8,
        input_negative: u8,
    ) -> Result<Self, Error> {
        let enabled = match state {
            0 => false,
            1 => true,
            _ => return Err(Error::InvalidState),
        };
        let setup = u3::try_new(setup).map_err(|_| Error::InvalidSetup)?;
        let pair = input_positive.abs_diff(input_negative) == 1
            && input_positive.min(input_negative) % 2 == 0;
        if !(input_negative == VINCOM || pair) {
            return Err(Error::InvalidInputPair);
        }
        if input_positive > MAX_INPUT {
            return Err(Error::InvalidInput1);
        }
        if input_negative > VINCOM {
            return Err(Error::InvalidInput2);
        }
        Ok(Self {
            channel,
            enabled,
            setup,
            input_positive: u5::new(input_positive),
            input_negative: u5::new(input_negative),
        })
    }

    /// The pattern used to switch a channel off.
    pub fn disabled(channel: AdcChannel) -> Self {
        Self {
            channel,
            enabled: false,
            setup: u3::new(0),
            input_positive: u5::new(0),
            input_negative: u5::new(1),
        }
    }

    /// Decode a channel register write.
    pub fn decode(bytes: [u8; 3]) -> Result<Self, Error> {
        let channel = bytes[0]
            .checked_sub(AdcReg::Ch0 as u8)
            .ok_or(Error::InvalidChannel)
            .and_then(AdcChannel::new)?;
        let reg = ChannelRegister::new_with_raw_value(u16::from_be_bytes([bytes[1], bytes[2]]));
        Self::new(
            channel,
            reg.ch_en() as u8,
            reg.setup_sel().value(),
            reg.ainpos().value(),
            reg.ainneg().value(),
        )
    }

    pub fn channel(&self) -> AdcChannel {
        self.channel
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn setup(&self) -> u8 {
        self.setup.value()
    }

    pub fn inputs(&self) -> (u8, u8) {
        (self.input_positive.value(), self.input_negative.value())
    }

    /// Register address followed by the big endian register payload.
    pub fn to_bytes(&self) -> [u8; 3] {
        // A VINCOM negative input encodes as 0b10000, the marker bit followed by 4 zeros.
        let reg = ChannelRegister::builder()
            .with_ch_en(self.enabled)
            .with_setup_sel(self.setup)
            .with_ainpos(self.input_positive)
            .with_ainneg(self.input_negative)
            .build();
        register_write(
            AdcReg::Ch0 as u8 + self.channel.index() as u8,
            reg.raw_value(),
        )
    }

    pub fn frame(&self) -> Result<Frame, Error> {
        Frame::single(&self.to_bytes())
    }
}

/// Encode a channel register write from raw operator values.
///
/// A rejected configuration yields a poisoned frame that will not be transferred.
pub fn encode_channel(
    channel: AdcChannel,
    state: u8,
    setup: u8,
    input_positive: u8,
    input_negative: u8,
) -> Frame {
    match ChannelConfig::new(channel, state, setup, input_positive, input_negative)
        .and_then(|config| config.frame())
    {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Channel {} configuration rejected: {}", channel.index(), e);
            Frame::poisoned(3)
        }
    }
}

/// One 48 byte frame disabling all 16 channels. Channel `i` occupies bytes `3 * i..3 * i + 3`.
pub fn disable_all_frame() -> Result<Frame, Error> {
    let mut bytes = [0u8; 3 * ADC_CHANNELS];
    for (chunk, channel) in bytes.chunks_mut(3).zip(AdcChannel::all()) {
        chunk.copy_from_slice(&ChannelConfig::disabled(channel).to_bytes());
    }
    Frame::single(&bytes)
}

fn adc_mode_frame() -> Result<Frame, Error> {
    let mode = AdcMode::builder()
        .with_ref_en(false)
        .with_mode(Mode::SingleConversion)
        .with_clocksel(Clocksel::ExternalCrystal)
        .build();
    Frame::single(&register_write(AdcReg::AdcMode as u8, mode.raw_value()))
}

fn setup_config_frame() -> Result<Frame, Error> {
    let setup = SetupCon::builder()
        .with_bipolar(true)
        .with_refbuf_p(true)
        .with_refbuf_n(true)
        .with_ainbuf_p(true)
        .with_ainbuf_n(true)
        .with_ref_sel(RefSel::External)
        .build();
    Frame::single(&register_write(AdcReg::SetupCon0 as u8, setup.raw_value()))
}

fn interface_mode_frame() -> Result<Frame, Error> {
    let ifmode = IfMode::builder().with_data_stat(false).build();
    Frame::single(&register_write(AdcReg::IfMode as u8, ifmode.raw_value()))
}

/// Conversion results of one pass over the enabled channels.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct AdcReading {
    codes: [Option<AdcCode>; ADC_CHANNELS],
}

impl AdcReading {
    pub fn code(&self, channel: AdcChannel) -> Option<AdcCode> {
        self.codes[channel.index()]
    }

    pub fn voltage(&self, channel: AdcChannel) -> Option<f64> {
        self.code(channel).map(f64::from)
    }

    /// Channels with a result, in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (AdcChannel, AdcCode)> + '_ {
        AdcChannel::all().filter_map(|ch| self.code(ch).map(|code| (ch, code)))
    }

    /// Keep only the channels selected in `mask`.
    pub fn masked(&self, mask: &[bool; ADC_CHANNELS]) -> Self {
        let mut codes = self.codes;
        for (code, &keep) in codes.iter_mut().zip(mask.iter()) {
            if !keep {
                *code = None;
            }
        }
        Self { codes }
    }

    pub fn is_empty(&self) -> bool {
        self.codes.iter().all(Option::is_none)
    }
}

pub mod sm {
    use smlang::statemachine;

    statemachine! {
        transitions: {
            *Idle | ModeSelected | AwaitingDataReady | DataCaptured + SelectMode = ModeSelected,
            ModeSelected | DataCaptured + WaitReady = AwaitingDataReady,
            AwaitingDataReady + Capture = DataCaptured,
            AwaitingDataReady + Timeout = Idle,
            ModeSelected | DataCaptured + Finish = Idle,
            Idle | ModeSelected | AwaitingDataReady | DataCaptured + Reset = Idle
        }
    }
}

/// Acquisition sequencing context.
pub struct Acquisition;

impl sm::StateMachineContext for Acquisition {}

pub struct Ad4115<SPI, CS, DRDY> {
    spi: SPI,
    cs: CS,
    drdy: DRDY,
    enabled: [bool; ADC_CHANNELS],
    timeout_us: Option<u32>,
    acquisition: sm::StateMachine<Acquisition>,
}

impl<SPI, CS, DRDY> Ad4115<SPI, CS, DRDY>
where
    SPI: Transfer<u8>,
    SPI::Error: Debug,
    CS: OutputPin,
    CS::Error: Debug,
    DRDY: InputPin,
    DRDY::Error: Debug,
{
    /// Construct a new ADC driver.
    ///
    /// # Args
    /// * `spi` - SPI bus, mode 3
    /// * `cs` - ADC chip select (sync) line
    /// * `drdy` - Data ready input (DOUT/RDY), active low
    pub fn new(spi: SPI, mut cs: CS, drdy: DRDY) -> Result<Self, Error> {
        cs.set_high().map_err(pin_error)?;
        Ok(Self {
            spi,
            cs,
            drdy,
            enabled: [false; ADC_CHANNELS],
            timeout_us: None,
            acquisition: sm::StateMachine::new(Acquisition),
        })
    }

    /// Bound the data ready wait. `None` waits forever.
    pub fn set_data_ready_timeout(&mut self, timeout_us: Option<u32>) {
        self.timeout_us = timeout_us;
    }

    fn event(&mut self, event: sm::Events) -> Result<(), Error> {
        self.acquisition
            .process_event(event)
            .map(|_| ())
            .map_err(|_| Error::Sequence)
    }

    fn send(&mut self, frame: &Frame, hold: bool) -> Result<Frame, Error> {
        frame.transfer(&mut self.spi, &mut self.cs, hold)
    }

    /// Reset the serial interface and all registers: 64 clocks with DIN high.
    pub fn reset(&mut self, delay: &mut impl DelayMs<u32>) -> Result<(), Error> {
        self.send(&Frame::new(&[0xff; 8], 1, 8)?, false)?;
        delay.delay_ms(1);
        // Only CH0 is enabled after reset.
        self.enabled = [false; ADC_CHANNELS];
        self.enabled[0] = true;
        self.event(sm::Events::Reset)?;
        info!("ADC reset");
        Ok(())
    }

    /// Read the 16 bit ID register.
    pub fn read_id(&mut self) -> Result<u16, Error> {
        let request = Frame::single(&[Comms::read_cmd(AdcReg::Id as u8), 0, 0])?;
        let response = self.send(&request, false)?;
        let bytes = response.as_bytes();
        Ok(u16::from_be_bytes([bytes[1], bytes[2]]))
    }

    /// Check that the ID register reads `0x38DX`, as per datasheet.
    pub fn verify_id(&mut self) -> Result<u16, Error> {
        let id = self.read_id()?;
        info!("ADC id: {:#06x}", id);
        if id & 0xfff0 != 0x38d0 {
            return Err(Error::AdcId(id));
        }
        Ok(id)
    }

    /// Configure setup 0: bipolar, reference and input buffers enabled, external reference.
    pub fn setup_config(&mut self) -> Result<(), Error> {
        self.send(&setup_config_frame()?, false)?;
        Ok(())
    }

    /// Configure the interface mode register to its plain data output format.
    pub fn interface_mode(&mut self) -> Result<(), Error> {
        self.send(&interface_mode_frame()?, false)?;
        Ok(())
    }

    /// Write a channel configuration. The enabled table only changes once the write succeeded.
    pub fn configure_channel(&mut self, config: &ChannelConfig) -> Result<(), Error> {
        self.send(&config.frame()?, false)?;
        self.enabled[config.channel().index()] = config.enabled();
        debug!(
            "ADC channel {} enabled: {}",
            config.channel().index(),
            config.enabled()
        );
        Ok(())
    }

    /// Channel configuration followed by setup and interface mode configuration.
    pub fn general_config(&mut self, config: &ChannelConfig) -> Result<(), Error> {
        self.configure_channel(config)?;
        self.setup_config()?;
        self.interface_mode()
    }

    pub fn disable_all_channels(&mut self) -> Result<(), Error> {
        self.send(&disable_all_frame()?, false)?;
        self.enabled = [false; ADC_CHANNELS];
        Ok(())
    }

    /// Refresh the enabled table from the channel registers.
    pub fn update_channel_states(&mut self) -> Result<[bool; ADC_CHANNELS], Error> {
        let mut request = [0u8; 3 * ADC_CHANNELS];
        for (chunk, channel) in request.chunks_mut(3).zip(AdcChannel::all()) {
            chunk[0] = Comms::read_cmd(AdcReg::Ch0 as u8 + channel.index() as u8);
        }
        let response = self.send(&Frame::new(&request, 3, ADC_CHANNELS)?, true)?;
        self.cs.set_high().map_err(pin_error)?;
        for (enabled, block) in self.enabled.iter_mut().zip(response.blocks()) {
            *enabled =
                ChannelRegister::new_with_raw_value(u16::from_be_bytes([block[1], block[2]]))
                    .ch_en();
        }
        Ok(self.enabled)
    }

    pub fn enabled_channels(&self) -> [bool; ADC_CHANNELS] {
        self.enabled
    }

    pub fn is_enabled(&self, channel: AdcChannel) -> bool {
        self.enabled[channel.index()]
    }

    /// Start a single conversion pass over the enabled channels.
    pub fn select_mode(&mut self) -> Result<(), Error> {
        self.event(sm::Events::SelectMode)?;
        self.send(&adc_mode_frame()?, true)?;
        Ok(())
    }

    /// Block until DOUT/RDY signals a conversion result.
    pub fn wait_data_ready(&mut self, delay: &mut impl DelayUs<u32>) -> Result<(), Error> {
        self.event(sm::Events::WaitReady)?;
        let mut waited = 0u32;
        while self.drdy.is_high().map_err(pin_error)? {
            if matches!(self.timeout_us, Some(timeout) if waited >= timeout) {
                warn!("ADC data ready timeout after {} us", waited);
                self.event(sm::Events::Timeout)?;
                return Err(Error::DataReadyTimeout);
            }
            delay.delay_us(POLL_INTERVAL_US);
            waited = waited.saturating_add(POLL_INTERVAL_US);
        }
        Ok(())
    }

    /// Read the conversion result signalled by the last data ready wait.
    pub fn read_channel(&mut self) -> Result<AdcCode, Error> {
        self.event(sm::Events::Capture)?;
        let request = Frame::single(&[Comms::read_cmd(AdcReg::Data as u8), 0, 0, 0])?;
        let response = self.send(&request, true)?;
        let bytes = response.as_bytes();
        Ok(AdcCode::from_be_bytes([bytes[1], bytes[2], bytes[3]]))
    }

    /// Convert every enabled channel once, in channel order.
    pub fn full_reading(&mut self, delay: &mut impl DelayUs<u32>) -> Result<AdcReading, Error> {
        let result = self.sample_enabled(delay);
        self.cs.set_high().map_err(pin_error)?;
        let reading = result?;
        self.event(sm::Events::Finish)?;
        Ok(reading)
    }

    fn sample_enabled(&mut self, delay: &mut impl DelayUs<u32>) -> Result<AdcReading, Error> {
        self.select_mode()?;
        let enabled = self.enabled;
        let mut reading = AdcReading::default();
        for channel in AdcChannel::all().filter(|ch| enabled[ch.index()]) {
            self.wait_data_ready(delay)?;
            let code = self.read_channel()?;
            debug!("ADC channel {}: {:?}", channel.index(), code);
            reading.codes[channel.index()] = Some(code);
        }
        Ok(reading)
    }
}
