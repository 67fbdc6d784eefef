//! Bus, pin and delay doubles sharing one ordered event log.

use core::convert::Infallible;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::{InputPin, OutputPin};

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Output pin driven to a level (`true` = high).
    Pin(&'static str, bool),
    /// One SPI transfer call: bus name and the bytes shifted out.
    Spi(&'static str, Vec<u8>),
    DelayUs(u32),
    DelayMs(u32),
}

#[derive(Clone, Default)]
pub struct Log(Rc<RefCell<Vec<Event>>>);

impl Log {
    pub fn push(&self, event: Event) {
        self.0.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    /// All bytes shifted out on a bus, one entry per transfer call.
    pub fn spi(&self, bus: &str) -> Vec<Vec<u8>> {
        self.0
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Spi(b, bytes) if *b == bus => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of low-then-high pulses seen on a pin.
    pub fn pulses(&self, pin: &str) -> usize {
        self.0
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Pin(p, false) if *p == pin))
            .count()
    }
}

#[derive(Debug, PartialEq)]
pub struct MockError;

pub struct MockSpi {
    name: &'static str,
    log: Log,
    responses: Rc<RefCell<VecDeque<u8>>>,
    fail: bool,
}

impl MockSpi {
    pub fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: log.clone(),
            responses: Default::default(),
            fail: false,
        }
    }

    pub fn failing(name: &'static str, log: &Log) -> Self {
        Self {
            fail: true,
            ..Self::new(name, log)
        }
    }

    /// Handle used to queue bytes clocked in on subsequent transfers.
    pub fn responses(&self) -> Rc<RefCell<VecDeque<u8>>> {
        self.responses.clone()
    }
}

impl Transfer<u8> for MockSpi {
    type Error = MockError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], MockError> {
        if self.fail {
            return Err(MockError);
        }
        self.log.push(Event::Spi(self.name, words.to_vec()));
        let mut responses = self.responses.borrow_mut();
        for word in words.iter_mut() {
            *word = responses.pop_front().unwrap_or(0);
        }
        Ok(words)
    }
}

pub struct MockPin {
    name: &'static str,
    log: Log,
    levels: Rc<RefCell<VecDeque<bool>>>,
    idle: bool,
}

impl MockPin {
    pub fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: log.clone(),
            levels: Default::default(),
            idle: false,
        }
    }

    /// An input that reads `idle` once the queued levels are exhausted.
    pub fn input(name: &'static str, log: &Log, idle: bool) -> Self {
        Self {
            idle,
            ..Self::new(name, log)
        }
    }

    pub fn levels(&self) -> Rc<RefCell<VecDeque<bool>>> {
        self.levels.clone()
    }
}

impl OutputPin for MockPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.log.push(Event::Pin(self.name, false));
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.log.push(Event::Pin(self.name, true));
        Ok(())
    }
}

impl InputPin for MockPin {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Infallible> {
        Ok(self.levels.borrow_mut().pop_front().unwrap_or(self.idle))
    }

    fn is_low(&self) -> Result<bool, Infallible> {
        self.is_high().map(|high| !high)
    }
}

pub struct MockDelay {
    log: Log,
}

impl MockDelay {
    pub fn new(log: &Log) -> Self {
        Self { log: log.clone() }
    }
}

impl DelayUs<u32> for MockDelay {
    fn delay_us(&mut self, us: u32) {
        self.log.push(Event::DelayUs(us));
    }
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.log.push(Event::DelayMs(ms));
    }
}
