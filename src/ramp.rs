//! Coordinated voltage ramps over the DAC channels.
//!
//! A ramp primes every active DAC channel to its initial voltage, then walks all
//! active channels towards their final voltage in equal steps. Within a step all
//! codes are written before the shared LDAC pulse, so the outputs move together.
//! A buffered ramp additionally takes an ADC reading after each step settled.

use core::fmt::Debug;

use embedded_hal::{
    blocking::{
        delay::{DelayMs, DelayUs},
        spi::Transfer,
    },
    digital::v2::{InputPin, OutputPin},
};
use log::{debug, info, warn};

use crate::{
    ad4115::{Ad4115, AdcReading},
    ad5791::Ad5791,
    convert::FULL_SCALE,
    DacChannel, Error, ADC_CHANNELS, DAC_CHANNELS,
};

/// DAC operations a ramp drives.
pub trait Outputs {
    /// Write a voltage, optionally latching it. Returns the written voltage.
    fn set_voltage(&mut self, channel: DacChannel, voltage: f64, update: bool)
        -> Result<f64, Error>;
    /// Latch all written codes onto the outputs.
    fn update_analog_outputs(&mut self) -> Result<(), Error>;
}

impl<SPI, SYNC, LDAC> Outputs for Ad5791<SPI, SYNC, LDAC>
where
    SPI: Transfer<u8>,
    SPI::Error: Debug,
    SYNC: OutputPin,
    SYNC::Error: Debug,
    LDAC: OutputPin,
    LDAC::Error: Debug,
{
    fn set_voltage(
        &mut self,
        channel: DacChannel,
        voltage: f64,
        update: bool,
    ) -> Result<f64, Error> {
        Ad5791::set_voltage(self, channel, voltage, update)
    }

    fn update_analog_outputs(&mut self) -> Result<(), Error> {
        Ad5791::update_analog_outputs(self)
    }
}

/// ADC acquisition a buffered ramp triggers.
pub trait Sampler {
    fn full_reading<D: DelayUs<u32>>(&mut self, delay: &mut D) -> Result<AdcReading, Error>;
}

impl<SPI, CS, DRDY> Sampler for Ad4115<SPI, CS, DRDY>
where
    SPI: Transfer<u8>,
    SPI::Error: Debug,
    CS: OutputPin,
    CS::Error: Debug,
    DRDY: InputPin,
    DRDY::Error: Debug,
{
    fn full_reading<D: DelayUs<u32>>(&mut self, delay: &mut D) -> Result<AdcReading, Error> {
        Ad4115::full_reading(self, delay)
    }
}

/// Cooperative cancellation, polled at every step boundary.
pub trait Cancel {
    fn cancelled(&mut self) -> bool;
}

impl<F: FnMut() -> bool> Cancel for F {
    fn cancelled(&mut self) -> bool {
        self()
    }
}

/// A ramp that always runs to completion.
pub struct NeverCancel;

impl Cancel for NeverCancel {
    fn cancelled(&mut self) -> bool {
        false
    }
}

/// Receiver of buffered ramp readings.
pub trait ReadingSink {
    /// Called with the baseline reading (`step == 0`) and the reading after each step.
    fn reading(&mut self, step: u32, reading: &AdcReading) -> Result<(), Error>;
}

impl<F: FnMut(u32, &AdcReading) -> Result<(), Error>> ReadingSink for F {
    fn reading(&mut self, step: u32, reading: &AdcReading) -> Result<(), Error> {
        self(step, reading)
    }
}

/// A validated ramp.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RampPlan {
    active_dac: [bool; DAC_CHANNELS],
    initial: [f64; DAC_CHANNELS],
    end: [f64; DAC_CHANNELS],
    steps: u32,
    step_delay_ms: u32,
    active_adc: [bool; ADC_CHANNELS],
}

impl RampPlan {
    /// Validate a ramp.
    ///
    /// # Args
    /// * `active_dac` - DAC channels taking part
    /// * `initial` - Initial voltages, indexed by DAC channel
    /// * `end` - Final voltages, indexed by DAC channel
    /// * `steps` - Number of steps, at least 1
    /// * `step_delay_ms` - Settle time after priming and after every step
    /// * `active_adc` - ADC channels reported by a buffered ramp
    ///
    /// Voltages of inactive channels are ignored.
    pub fn new(
        active_dac: [bool; DAC_CHANNELS],
        initial: [f64; DAC_CHANNELS],
        end: [f64; DAC_CHANNELS],
        steps: u32,
        step_delay_ms: u32,
        active_adc: [bool; ADC_CHANNELS],
    ) -> Result<Self, Error> {
        if steps == 0 {
            return Err(Error::InvalidStepCount);
        }
        for ch in DacChannel::ALL.into_iter().filter(|ch| active_dac[ch.index()]) {
            let (vi, vf) = (initial[ch.index()], end[ch.index()]);
            if !(vi.abs() <= FULL_SCALE && vf.abs() <= FULL_SCALE) {
                warn!("Ramp endpoints {} V -> {} V out of range", vi, vf);
                return Err(Error::VoltageOverrange);
            }
        }
        Ok(Self {
            active_dac,
            initial,
            end,
            steps,
            step_delay_ms,
            active_adc,
        })
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn step_delay_ms(&self) -> u32 {
        self.step_delay_ms
    }

    pub fn active_adc(&self) -> &[bool; ADC_CHANNELS] {
        &self.active_adc
    }

    fn active(&self) -> impl Iterator<Item = DacChannel> + '_ {
        DacChannel::ALL
            .into_iter()
            .filter(|ch| self.active_dac[ch.index()])
    }

    /// Per step voltage increments. Zero for inactive channels.
    pub fn dv(&self) -> [f64; DAC_CHANNELS] {
        let mut dv = [0.0; DAC_CHANNELS];
        for ch in self.active() {
            let i = ch.index();
            dv[i] = (self.end[i] - self.initial[i]) / self.steps as f64;
        }
        dv
    }

    /// Target voltage of a channel after `step` steps.
    ///
    /// Step `steps` lands exactly on the end point. A buffered ramp stops after step
    /// `steps - 1` and so ends one `dv` short of it.
    pub fn voltage(&self, channel: DacChannel, step: u32) -> f64 {
        let i = channel.index();
        if step >= self.steps {
            self.end[i]
        } else {
            self.initial[i] + step as f64 * self.dv()[i]
        }
    }
}

pub mod sm {
    use smlang::statemachine;

    statemachine! {
        transitions: {
            *Configured + Start = SteppingWithoutCapture,
            Configured + StartBuffered = SteppingWithCapture,
            SteppingWithoutCapture | SteppingWithCapture + Finish = Complete,
            SteppingWithoutCapture | SteppingWithCapture + Abort = Aborted
        }
    }
}

pub struct RampContext;

impl sm::StateMachineContext for RampContext {}

/// Outcome of a completed ramp.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RampReport {
    /// Steps committed by an LDAC pulse.
    pub steps: u32,
    /// ADC readings delivered to the sink.
    pub readings: u32,
    /// Last written voltage of every active channel.
    pub voltages: [Option<f64>; DAC_CHANNELS],
}

/// Runs one [RampPlan]. A sequencer runs at most once.
pub struct RampSequencer {
    plan: RampPlan,
    state: sm::StateMachine<RampContext>,
    report: RampReport,
}

impl RampSequencer {
    pub fn new(plan: RampPlan) -> Self {
        Self {
            plan,
            state: sm::StateMachine::new(RampContext),
            report: RampReport::default(),
        }
    }

    pub fn plan(&self) -> &RampPlan {
        &self.plan
    }

    fn event(&mut self, event: sm::Events) -> Result<(), Error> {
        self.state
            .process_event(event)
            .map(|_| ())
            .map_err(|_| Error::Sequence)
    }

    /// Step without ADC capture: `steps` latched updates ending on the final voltages.
    pub fn run<DAC, D, C>(
        &mut self,
        dac: &mut DAC,
        delay: &mut D,
        cancel: &mut C,
    ) -> Result<RampReport, Error>
    where
        DAC: Outputs,
        D: DelayMs<u32>,
        C: Cancel,
    {
        self.event(sm::Events::Start)?;
        info!("Ramp: {} steps", self.plan.steps);
        let result = self.simple(dac, delay, cancel);
        self.conclude(result)
    }

    /// Step with ADC capture: a baseline reading, then a reading after each of the
    /// `steps - 1` steps, `steps` readings in total.
    pub fn run_buffered<DAC, ADC, D, C, S>(
        &mut self,
        dac: &mut DAC,
        adc: &mut ADC,
        delay: &mut D,
        cancel: &mut C,
        sink: &mut S,
    ) -> Result<RampReport, Error>
    where
        DAC: Outputs,
        ADC: Sampler,
        D: DelayMs<u32> + DelayUs<u32>,
        C: Cancel,
        S: ReadingSink,
    {
        self.event(sm::Events::StartBuffered)?;
        info!("Buffered ramp: {} readings", self.plan.steps);
        let result = self.buffered(dac, adc, delay, cancel, sink);
        self.conclude(result)
    }

    fn conclude(&mut self, result: Result<(), Error>) -> Result<RampReport, Error> {
        match result {
            Ok(()) => {
                self.event(sm::Events::Finish)?;
                info!(
                    "Ramp complete: {} steps, {} readings",
                    self.report.steps, self.report.readings
                );
                Ok(self.report)
            }
            Err(e) => {
                self.event(sm::Events::Abort)?;
                warn!("Ramp aborted after {} steps: {}", self.report.steps, e);
                Err(e)
            }
        }
    }

    fn prime<DAC: Outputs, D: DelayMs<u32>>(
        &mut self,
        dac: &mut DAC,
        delay: &mut D,
    ) -> Result<(), Error> {
        for ch in DacChannel::ALL {
            if self.plan.active_dac[ch.index()] {
                let v = dac.set_voltage(ch, self.plan.initial[ch.index()], true)?;
                self.report.voltages[ch.index()] = Some(v);
            }
        }
        delay.delay_ms(self.plan.step_delay_ms);
        Ok(())
    }

    fn step<DAC: Outputs, D: DelayMs<u32>, C: Cancel>(
        &mut self,
        step: u32,
        dac: &mut DAC,
        delay: &mut D,
        cancel: &mut C,
    ) -> Result<(), Error> {
        if cancel.cancelled() {
            return Err(Error::Cancelled);
        }
        for ch in DacChannel::ALL {
            if self.plan.active_dac[ch.index()] {
                let v = dac.set_voltage(ch, self.plan.voltage(ch, step), false)?;
                self.report.voltages[ch.index()] = Some(v);
            }
        }
        dac.update_analog_outputs()?;
        self.report.steps = step;
        debug!("Ramp step {} committed", step);
        delay.delay_ms(self.plan.step_delay_ms);
        Ok(())
    }

    fn simple<DAC: Outputs, D: DelayMs<u32>, C: Cancel>(
        &mut self,
        dac: &mut DAC,
        delay: &mut D,
        cancel: &mut C,
    ) -> Result<(), Error> {
        self.prime(dac, delay)?;
        for step in 1..=self.plan.steps {
            self.step(step, dac, delay, cancel)?;
        }
        Ok(())
    }

    fn buffered<DAC, ADC, D, C, S>(
        &mut self,
        dac: &mut DAC,
        adc: &mut ADC,
        delay: &mut D,
        cancel: &mut C,
        sink: &mut S,
    ) -> Result<(), Error>
    where
        DAC: Outputs,
        ADC: Sampler,
        D: DelayMs<u32> + DelayUs<u32>,
        C: Cancel,
        S: ReadingSink,
    {
        self.prime(dac, delay)?;
        self.capture(0, adc, delay, sink)?;
        for step in 1..self.plan.steps {
            self.step(step, dac, delay, cancel)?;
            self.capture(step, adc, delay, sink)?;
        }
        Ok(())
    }

    fn capture<ADC: Sampler, D: DelayUs<u32>, S: ReadingSink>(
        &mut self,
        step: u32,
        adc: &mut ADC,
        delay: &mut D,
        sink: &mut S,
    ) -> Result<(), Error> {
        let reading = adc.full_reading(delay)?.masked(&self.plan.active_adc);
        sink.reading(step, &reading)?;
        self.report.readings += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ad4115::ChannelConfig,
        mock::{Event, Log, MockDelay, MockPin, MockSpi},
        AdcChannel,
    };

    const NO_ADC: [bool; ADC_CHANNELS] = [false; ADC_CHANNELS];

    fn dac(log: &Log) -> Ad5791<MockSpi, MockPin, MockPin> {
        let dac = Ad5791::new(
            MockSpi::new("dac", log),
            [
                MockPin::new("sync0", log),
                MockPin::new("sync1", log),
                MockPin::new("sync2", log),
                MockPin::new("sync3", log),
            ],
            MockPin::new("ldac", log),
        )
        .unwrap();
        log.clear();
        dac
    }

    fn adc(log: &Log) -> Ad4115<MockSpi, MockPin, MockPin> {
        let mut adc = Ad4115::new(
            MockSpi::new("adc", log),
            MockPin::new("adc_cs", log),
            MockPin::input("drdy", log, false),
        )
        .unwrap();
        for (ch, in_p, in_n) in [(0, 0, 1), (1, 2, 3)] {
            let config = ChannelConfig::new(AdcChannel::new(ch).unwrap(), 1, 0, in_p, in_n);
            adc.configure_channel(&config.unwrap()).unwrap();
        }
        log.clear();
        adc
    }

    fn decode(bytes: &[u8]) -> f64 {
        let code = u32::from_be_bytes([0, bytes[0] & 0x0f, bytes[1], bytes[2]]);
        crate::convert::DacCode::from_raw(code).voltage()
    }

    #[test]
    fn plan_validation() {
        let one = [true, false, false, false];
        assert_eq!(
            RampPlan::new(one, [0.0; 4], [5.0; 4], 0, 10, NO_ADC),
            Err(Error::InvalidStepCount)
        );
        assert_eq!(
            RampPlan::new(one, [0.0; 4], [10.5, 0.0, 0.0, 0.0], 4, 10, NO_ADC),
            Err(Error::VoltageOverrange)
        );
        // Inactive channels are not checked.
        assert!(RampPlan::new(one, [0.0; 4], [1.0, 99.0, 0.0, 0.0], 4, 10, NO_ADC).is_ok());

        let plan = RampPlan::new(
            [true; 4],
            [0.0, 1.0, -1.0, 0.0],
            [4.0, 1.0, -3.0, 0.0],
            4,
            0,
            NO_ADC,
        )
        .unwrap();
        assert_eq!(plan.dv(), [1.0, 0.0, -0.5, 0.0]);
        assert_eq!(plan.voltage(DacChannel::Two, 2), -2.0);
    }

    #[test]
    fn last_step_lands_on_end_point() {
        let plan = RampPlan::new(
            [true, false, false, false],
            [-10.0, 0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0, 0.0],
            3,
            0,
            NO_ADC,
        )
        .unwrap();
        assert_eq!(plan.voltage(DacChannel::Zero, 3), 10.0);
    }

    #[test]
    fn five_step_ramp() {
        let log = Log::default();
        let mut dac = dac(&log);
        let mut delay = MockDelay::new(&log);
        let plan = RampPlan::new(
            [true, false, false, false],
            [0.0; 4],
            [5.0, 0.0, 0.0, 0.0],
            5,
            10,
            NO_ADC,
        )
        .unwrap();
        let report = RampSequencer::new(plan)
            .run(&mut dac, &mut delay, &mut NeverCancel)
            .unwrap();
        assert_eq!(report.steps, 5);
        assert_eq!(report.readings, 0);
        assert!((report.voltages[0].unwrap() - 5.0).abs() <= crate::convert::DacCode::LSB);
        assert_eq!(report.voltages[1], None);

        // Priming write and latch, then settle.
        let events = log.events();
        let prime_end = events
            .iter()
            .position(|e| *e == Event::DelayMs(10))
            .unwrap();
        assert_eq!(
            events[..prime_end]
                .iter()
                .filter(|e| **e == Event::Pin("ldac", false))
                .count(),
            1
        );

        // Each step: one write, then the latch pulse, then the settle delay.
        let steps = &events[prime_end + 1..];
        assert_eq!(steps.len(), 5 * 6);
        for (i, step) in steps.chunks(6).enumerate() {
            assert_eq!(step[0], Event::Pin("sync0", false));
            match &step[1] {
                Event::Spi("dac", bytes) => {
                    assert!((decode(bytes) - (i + 1) as f64).abs() <= crate::convert::DacCode::LSB)
                }
                e => panic!("unexpected {e:?}"),
            }
            assert_eq!(
                step[2..],
                [
                    Event::Pin("sync0", true),
                    Event::Pin("ldac", false),
                    Event::Pin("ldac", true),
                    Event::DelayMs(10),
                ]
            );
        }
        assert_eq!(dac.channel(DacChannel::Zero).latched, dac.channel(DacChannel::Zero).code);
    }

    #[test]
    fn writes_precede_the_latch() {
        let log = Log::default();
        let mut dac = dac(&log);
        let mut delay = MockDelay::new(&log);
        let plan = RampPlan::new(
            [true, false, true, true],
            [0.0; 4],
            [1.0, 0.0, -1.0, 2.0],
            2,
            1,
            NO_ADC,
        )
        .unwrap();
        RampSequencer::new(plan)
            .run(&mut dac, &mut delay, &mut NeverCancel)
            .unwrap();
        let events = log.events();
        let last_delay = events.iter().rposition(|e| *e == Event::DelayMs(1)).unwrap();
        // The latch of the last step follows all three channel writes of that step.
        let step = &events[last_delay - 11..last_delay];
        assert_eq!(step.iter().filter(|e| matches!(e, Event::Spi(..))).count(), 3);
        assert_eq!(step[9..], [Event::Pin("ldac", false), Event::Pin("ldac", true)]);
    }

    #[test]
    fn buffered_single_step_reads_once() {
        let log = Log::default();
        let mut dac = dac(&log);
        let mut adc = adc(&log);
        let mut delay = MockDelay::new(&log);
        let mut mask = NO_ADC;
        mask[1] = true;
        let plan = RampPlan::new(
            [false, true, false, false],
            [0.0, 2.0, 0.0, 0.0],
            [0.0, 4.0, 0.0, 0.0],
            1,
            5,
            mask,
        )
        .unwrap();

        let mut readings = std::vec::Vec::new();
        let report = RampSequencer::new(plan)
            .run_buffered(
                &mut dac,
                &mut adc,
                &mut delay,
                &mut NeverCancel,
                &mut |step: u32, reading: &AdcReading| -> Result<(), Error> {
                    readings.push((step, *reading));
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(report.steps, 0);
        assert_eq!(report.readings, 1);
        assert!((report.voltages[1].unwrap() - 2.0).abs() <= crate::convert::DacCode::LSB);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].0, 0);
        // Both enabled channels are converted, only the masked one is reported.
        assert_eq!(log.spi("adc").len(), 3);
        assert_eq!(readings[0].1.iter().count(), 1);
        assert!(readings[0].1.code(AdcChannel::new(1).unwrap()).is_some());
        // Priming latch only.
        assert_eq!(log.pulses("ldac"), 1);
    }

    #[test]
    fn buffered_captures_after_settling() {
        let log = Log::default();
        let mut dac = dac(&log);
        let mut adc = adc(&log);
        let mut delay = MockDelay::new(&log);
        let plan = RampPlan::new(
            [true, false, false, false],
            [0.0; 4],
            [3.0, 0.0, 0.0, 0.0],
            3,
            7,
            [true; ADC_CHANNELS],
        )
        .unwrap();
        assert_eq!(plan.voltage(DacChannel::Zero, 2), 2.0);
        assert_eq!(plan.voltage(DacChannel::Zero, 3), 3.0);
        let mut steps = std::vec::Vec::new();
        let report = RampSequencer::new(plan)
            .run_buffered(
                &mut dac,
                &mut adc,
                &mut delay,
                &mut NeverCancel,
                &mut |step: u32, _: &AdcReading| -> Result<(), Error> {
                    steps.push(step);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(steps, [0, 1, 2]);
        assert_eq!(report.readings, 3);
        assert_eq!(report.steps, 2);
        // The buffered ramp stops one dv short of the end point.
        let last = report.voltages[0].unwrap();
        assert!((last - 2.0).abs() <= crate::convert::DacCode::LSB);

        // Every ADC mode write follows a settle delay.
        let events = log.events();
        for (i, e) in events.iter().enumerate() {
            if *e == Event::Spi("adc", std::vec![0x01, 0x00, 0x1c]) {
                assert_eq!(events[i - 2], Event::DelayMs(7));
            }
        }
    }

    #[test]
    fn cancellation_at_step_boundary() {
        let log = Log::default();
        let mut dac = dac(&log);
        let mut delay = MockDelay::new(&log);
        let plan = RampPlan::new(
            [true, false, false, false],
            [0.0; 4],
            [5.0, 0.0, 0.0, 0.0],
            5,
            0,
            NO_ADC,
        )
        .unwrap();
        let mut polls = 0;
        let mut cancel = || {
            polls += 1;
            polls > 2
        };
        let mut sequencer = RampSequencer::new(plan);
        assert_eq!(
            sequencer.run(&mut dac, &mut delay, &mut cancel),
            Err(Error::Cancelled)
        );
        // Priming plus two committed steps.
        assert_eq!(log.pulses("ldac"), 3);
        // A sequencer runs once.
        assert_eq!(
            sequencer.run(&mut dac, &mut delay, &mut NeverCancel),
            Err(Error::Sequence)
        );
    }
}
