//! Line oriented serial command interface.
//!
//! Commands are ASCII lines terminated by `\r`. Spaces and `\n` are ignored, fields
//! are separated by `,` or `:`. Every command answers with one `\r\n` terminated
//! line, `BUFFER_RAMP` streams its raw ADC codes before that line.

use core::fmt::{Debug, Write as _};
use core::str::FromStr;

use embedded_hal::{
    blocking::{
        delay::{DelayMs, DelayUs},
        spi::Transfer,
    },
    digital::v2::{InputPin, OutputPin},
};
use embedded_io::Write;
use heapless::{String, Vec};
use log::{error, info, warn};
use strum::EnumString;

use crate::{
    ad4115::{Ad4115, AdcReading, ChannelConfig},
    ad5791::Ad5791,
    ramp::{NeverCancel, RampPlan, RampSequencer},
    settings::Settings,
    AdcChannel, DacChannel, Error, ADC_CHANNELS, DAC_CHANNELS,
};

/// Longest accepted command line.
pub const LINE_CAPACITY: usize = 256;

/// Most fields in one command line.
pub const MAX_TOKENS: usize = 30;

/// Assembles command lines from received bytes.
#[derive(Default)]
pub struct LineBuffer {
    line: String<LINE_CAPACITY>,
    discard: bool,
}

impl LineBuffer {
    /// Feed one byte. Returns the completed line on `\r`.
    ///
    /// Overlong and non ASCII lines are dropped as a whole.
    pub fn push(&mut self, byte: u8) -> Option<String<LINE_CAPACITY>> {
        match byte {
            b'\r' => {
                let line = core::mem::take(&mut self.line);
                if core::mem::take(&mut self.discard) {
                    warn!("Dropping malformed command line");
                    None
                } else {
                    Some(line)
                }
            }
            b'\n' | b' ' => None,
            b if b.is_ascii() => {
                self.discard |= self.line.push(b as char).is_err();
                None
            }
            _ => {
                self.discard = true;
                None
            }
        }
    }
}

/// Split a line on `,` and `:`. Trailing empty fields are dropped.
pub fn tokenize(line: &str) -> Option<Vec<&str, MAX_TOKENS>> {
    let mut tokens = Vec::new();
    for token in line.split([',', ':']) {
        tokens.push(token).ok()?;
    }
    while tokens.last().is_some_and(|t: &&str| t.is_empty()) {
        tokens.pop();
    }
    Some(tokens)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString)]
enum Verb {
    #[strum(serialize = "NOP")]
    Nop,
    #[strum(serialize = "*IDN?")]
    Identify,
    #[strum(serialize = "*RDY?")]
    Ready,
    #[strum(serialize = "INITIALIZE")]
    Initialize,
    #[strum(serialize = "DACWRITE")]
    DacWrite,
    #[strum(serialize = "GET_DAC")]
    GetDac,
    #[strum(serialize = "ADC_CH_CONFIG")]
    AdcChannelConfig,
    #[strum(serialize = "ADC_DISABLE_ALL")]
    AdcDisableAll,
    #[strum(serialize = "ADC_ID")]
    AdcId,
    #[strum(serialize = "ADC_READ")]
    AdcRead,
    #[strum(serialize = "RAMP")]
    Ramp,
    #[strum(serialize = "BUFFER_RAMP")]
    BufferRamp,
}

enum Failure {
    Unknown,
    Arguments,
    Device(Error),
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Self::Device(e)
    }
}

/// Longest reply line.
pub const REPLY_CAPACITY: usize = 512;

type Reply = String<REPLY_CAPACITY>;

fn reply(args: core::fmt::Arguments) -> Reply {
    let mut line = Reply::new();
    if line.write_fmt(args).is_err() {
        error!("Reply truncated");
    }
    line
}

fn arg<T: FromStr>(args: &[&str], index: usize) -> Result<T, Failure> {
    args.get(index)
        .and_then(|s| s.parse().ok())
        .ok_or(Failure::Arguments)
}

fn expect(args: &[&str], count: usize) -> Result<(), Failure> {
    if args.len() == count {
        Ok(())
    } else {
        Err(Failure::Arguments)
    }
}

/// Parse a channel mask of `0`/`1` digits, channel 0 first.
fn mask<const N: usize>(token: &str) -> Result<[bool; N], Failure> {
    if token.len() != N {
        return Err(Failure::Arguments);
    }
    let mut mask = [false; N];
    for (m, c) in mask.iter_mut().zip(token.bytes()) {
        *m = match c {
            b'0' => false,
            b'1' => true,
            _ => return Err(Failure::Arguments),
        };
    }
    Ok(mask)
}

/// `<dacMask>,<vi0..vi3>,<vf0..vf3>,<steps>,<delayMs>` followed by the ADC mask if any.
fn ramp_plan(args: &[&str], active_adc: [bool; ADC_CHANNELS]) -> Result<RampPlan, Failure> {
    let active_dac = mask::<DAC_CHANNELS>(args.first().ok_or(Failure::Arguments)?)?;
    let mut initial = [0.0; DAC_CHANNELS];
    let mut end = [0.0; DAC_CHANNELS];
    for i in 0..DAC_CHANNELS {
        initial[i] = arg(args, 1 + i)?;
        end[i] = arg(args, 1 + DAC_CHANNELS + i)?;
    }
    let steps = arg(args, 1 + 2 * DAC_CHANNELS)?;
    let step_delay_ms = arg(args, 2 + 2 * DAC_CHANNELS)?;
    Ok(RampPlan::new(
        active_dac,
        initial,
        end,
        steps,
        step_delay_ms,
        active_adc,
    )?)
}

/// Owns the instrument and executes command lines against it.
pub struct Dispatcher<DAC, ADC, D> {
    dac: DAC,
    adc: ADC,
    delay: D,
    settings: Settings,
}

impl<DacSpi, SyncPin, Ldac, AdcSpi, Cs, Drdy, D>
    Dispatcher<Ad5791<DacSpi, SyncPin, Ldac>, Ad4115<AdcSpi, Cs, Drdy>, D>
where
    DacSpi: Transfer<u8>,
    DacSpi::Error: Debug,
    SyncPin: OutputPin,
    SyncPin::Error: Debug,
    Ldac: OutputPin,
    Ldac::Error: Debug,
    AdcSpi: Transfer<u8>,
    AdcSpi::Error: Debug,
    Cs: OutputPin,
    Cs::Error: Debug,
    Drdy: InputPin,
    Drdy::Error: Debug,
    D: DelayMs<u32> + DelayUs<u32>,
{
    pub fn new(
        mut dac: Ad5791<DacSpi, SyncPin, Ldac>,
        mut adc: Ad4115<AdcSpi, Cs, Drdy>,
        delay: D,
        settings: Settings,
    ) -> Self {
        for (ch, cal) in DacChannel::ALL.into_iter().zip(settings.calibration) {
            dac.set_calibration(ch, cal);
        }
        adc.set_data_ready_timeout(settings.adc_ready_timeout_us);
        Self {
            dac,
            adc,
            delay,
            settings,
        }
    }

    /// Bring both chips into operation and apply the boot ADC channel layout.
    pub fn boot(&mut self) -> Result<(), Error> {
        self.dac.initialize_all()?;
        self.adc.reset(&mut self.delay)?;
        self.adc.verify_id()?;
        self.adc.setup_config()?;
        self.adc.interface_mode()?;
        self.adc.disable_all_channels()?;
        for input in self.settings.adc_inputs.iter() {
            self.adc.configure_channel(&input.config()?)?;
        }
        info!(
            "{} ready, {} ADC inputs",
            self.settings.name,
            self.settings.adc_inputs.len()
        );
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Execute one command line and write its reply to `out`.
    pub fn dispatch<W: Write>(&mut self, line: &str, out: &mut W) -> Result<(), W::Error> {
        let result = match tokenize(line) {
            Some(tokens) if !tokens.is_empty() => self.execute(&tokens, out),
            Some(_) => return Ok(()),
            None => Err(Failure::Arguments),
        };
        let text = match result {
            Ok(text) => text,
            Err(Failure::Unknown) => {
                warn!("Unknown command: {}", line);
                reply(format_args!("UNKNOWN COMMAND"))
            }
            Err(Failure::Arguments) => {
                warn!("Invalid arguments: {}", line);
                reply(format_args!("INVALID ARGUMENTS"))
            }
            Err(Failure::Device(e)) => reply(format_args!("{}", e)),
        };
        out.write_all(text.as_bytes())?;
        out.write_all(b"\r\n")
    }

    fn execute<W: Write>(&mut self, tokens: &[&str], out: &mut W) -> Result<Reply, Failure> {
        let verb: Verb = tokens[0].parse().map_err(|_| Failure::Unknown)?;
        let args = &tokens[1..];
        Ok(match verb {
            Verb::Nop => reply(format_args!("NOP")),
            Verb::Identify => reply(format_args!("{}", self.settings.name)),
            Verb::Ready => reply(format_args!("READY")),
            Verb::Initialize => {
                expect(args, 0)?;
                self.dac.initialize_all()?;
                reply(format_args!("OK"))
            }
            Verb::DacWrite => {
                expect(args, 2)?;
                let ch = DacChannel::new(arg(args, 0)?)?;
                let v = self.dac.set_voltage(ch, arg(args, 1)?, true)?;
                reply(format_args!("{:.6}", v))
            }
            Verb::GetDac => {
                expect(args, 1)?;
                let ch = DacChannel::new(arg(args, 0)?)?;
                let v = self.dac.read_voltage(ch)?;
                reply(format_args!("{:.6}", v))
            }
            Verb::AdcChannelConfig => {
                expect(args, 5)?;
                let config = ChannelConfig::new(
                    AdcChannel::new(arg(args, 0)?)?,
                    arg(args, 1)?,
                    arg(args, 2)?,
                    arg(args, 3)?,
                    arg(args, 4)?,
                )?;
                self.adc.configure_channel(&config)?;
                reply(format_args!("OK"))
            }
            Verb::AdcDisableAll => {
                expect(args, 0)?;
                self.adc.disable_all_channels()?;
                reply(format_args!("OK"))
            }
            Verb::AdcId => {
                expect(args, 0)?;
                let id = self.adc.read_id()?;
                reply(format_args!("{:#06x}", id))
            }
            Verb::AdcRead => {
                expect(args, 0)?;
                let reading = self.adc.full_reading(&mut self.delay)?;
                let voltages: Vec<f64, ADC_CHANNELS> =
                    reading.iter().map(|(_, code)| code.voltage()).collect();
                serde_json_core::to_string(&voltages).map_err(|_| Error::Output)?
            }
            Verb::Ramp => {
                expect(args, 3 + 2 * DAC_CHANNELS)?;
                let plan = ramp_plan(args, [false; ADC_CHANNELS])?;
                RampSequencer::new(plan).run(&mut self.dac, &mut self.delay, &mut NeverCancel)?;
                reply(format_args!("RAMP_FINISHED"))
            }
            Verb::BufferRamp => {
                expect(args, 4 + 2 * DAC_CHANNELS)?;
                let active_adc = mask::<ADC_CHANNELS>(args[3 + 2 * DAC_CHANNELS])?;
                let plan = ramp_plan(args, active_adc)?;
                // Raw codes of the reported channels, 3 bytes MSB first each.
                let mut sink = |_: u32, reading: &AdcReading| -> Result<(), Error> {
                    for (_, code) in reading.iter() {
                        out.write_all(&code.to_be_bytes()).map_err(|e| {
                            error!("Reading stream failed: {:?}", e);
                            Error::Output
                        })?;
                    }
                    Ok(())
                };
                RampSequencer::new(plan).run_buffered(
                    &mut self.dac,
                    &mut self.adc,
                    &mut self.delay,
                    &mut NeverCancel,
                    &mut sink,
                )?;
                reply(format_args!("RAMP_FINISHED"))
            }
        })
    }
}
