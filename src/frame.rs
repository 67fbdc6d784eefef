//! Register transaction frames.
//!
//! A [Frame] is a bounded byte buffer divided into `block_count` blocks of
//! `block_size` bytes. Each block is clocked out inside one assertion of the
//! target's select (sync / chip select) line. Frames carry no knowledge of the
//! register content, validation is up to the chip specific encoders.

use core::fmt::Debug;

use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};
use log::{debug, error};

use crate::Error;

/// Maximum size of a frame in bytes.
pub const CAPACITY: usize = 64;

// Fill value of a frame produced by a failed encoding.
const POISON: u8 = 0xFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    data: [u8; CAPACITY],
    block_size: usize,
    block_count: usize,
    poisoned: bool,
}

impl Frame {
    /// Build a frame of `block_count` blocks of `block_size` bytes.
    ///
    /// `bytes` fills the frame from the start, the remainder is zero.
    pub fn new(bytes: &[u8], block_size: usize, block_count: usize) -> Result<Self, Error> {
        let len = block_size
            .checked_mul(block_count)
            .ok_or(Error::FrameCapacityExceeded)?;
        if len > CAPACITY || bytes.len() > len {
            return Err(Error::FrameCapacityExceeded);
        }
        let mut data = [0; CAPACITY];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            data,
            block_size,
            block_count,
            poisoned: false,
        })
    }

    /// A frame consisting of a single block.
    pub fn single(bytes: &[u8]) -> Result<Self, Error> {
        Self::new(bytes, bytes.len(), 1)
    }

    /// The sentinel frame produced by a rejected encoding.
    ///
    /// All bytes read as `0xFF`; [Frame::transfer] refuses to send it.
    pub fn poisoned(block_size: usize) -> Self {
        Self {
            data: [POISON; CAPACITY],
            block_size: block_size.min(CAPACITY),
            block_count: 1,
            poisoned: true,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn len(&self) -> usize {
        self.block_size * self.block_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// Iterate the blocks in transmission order.
    pub fn blocks(&self) -> impl Iterator<Item = &[u8]> {
        // `chunks` panics on zero size; a zero sized frame has no blocks.
        self.as_bytes().chunks(self.block_size.max(1))
    }

    /// Clock the frame out on `spi`, asserting (driving low) `select` around each block.
    ///
    /// With `hold` set, `select` stays asserted after every block so that subsequent
    /// frames continue the same transaction. Without `hold`, `select` is also released
    /// when the bus fails.
    ///
    /// # Returns
    /// The frame of bytes clocked in during the transfer, with the same geometry.
    pub fn transfer<SPI, CS>(
        &self,
        spi: &mut SPI,
        select: &mut CS,
        hold: bool,
    ) -> Result<Frame, Error>
    where
        SPI: Transfer<u8>,
        SPI::Error: Debug,
        CS: OutputPin,
        CS::Error: Debug,
    {
        if self.poisoned {
            error!("Poisoned frame dropped");
            return Err(Error::PoisonedFrame);
        }

        let mut response = *self;
        let block_size = self.block_size.max(1);
        for block in response.data[..self.len()].chunks_mut(block_size) {
            select.set_low().map_err(pin_error)?;
            debug!("SPI > {:02x?}", block);
            if let Err(e) = spi.transfer(block) {
                // Release select so the next transaction starts a fresh frame.
                if !hold {
                    select.set_high().map_err(pin_error)?;
                }
                return Err(spi_error(e));
            }
            debug!("SPI < {:02x?}", block);
            if !hold {
                select.set_high().map_err(pin_error)?;
            }
        }
        Ok(response)
    }
}

pub(crate) fn spi_error<E: Debug>(e: E) -> Error {
    error!("SPI transfer failed: {:?}", e);
    Error::Spi
}

pub(crate) fn pin_error<E: Debug>(e: E) -> Error {
    error!("GPIO access failed: {:?}", e);
    Error::Pin
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, Log, MockPin, MockSpi};

    #[test]
    fn capacity() {
        assert!(Frame::new(&[], 48, 1).is_ok());
        assert!(Frame::new(&[], 16, 4).is_ok());
        assert_eq!(Frame::new(&[], 13, 5), Err(Error::FrameCapacityExceeded));
        assert_eq!(Frame::new(&[0; 4], 3, 1), Err(Error::FrameCapacityExceeded));
        assert_eq!(
            Frame::new(&[], usize::MAX, 2),
            Err(Error::FrameCapacityExceeded)
        );
    }

    #[test]
    fn layout() {
        let frame = Frame::new(&[1, 2, 3, 4], 2, 3).unwrap();
        assert_eq!(frame.len(), 6);
        assert_eq!(frame.as_bytes(), &[1, 2, 3, 4, 0, 0]);
        let blocks: [&[u8]; 3] = [&[1, 2], &[3, 4], &[0, 0]];
        assert!(frame.blocks().eq(blocks));
    }

    #[test]
    fn select_per_block() {
        let log = Log::default();
        let mut spi = MockSpi::new("spi", &log);
        let mut cs = MockPin::new("cs", &log);
        spi.responses().borrow_mut().extend([9, 8, 7]);

        let frame = Frame::new(&[0xff; 3], 1, 3).unwrap();
        let response = frame.transfer(&mut spi, &mut cs, false).unwrap();

        assert_eq!(response.as_bytes(), &[9, 8, 7]);
        assert_eq!(frame.as_bytes(), &[0xff; 3]);
        let expected: std::vec::Vec<Event> = (0..3)
            .flat_map(|_| {
                [
                    Event::Pin("cs", false),
                    Event::Spi("spi", std::vec![0xff]),
                    Event::Pin("cs", true),
                ]
            })
            .collect();
        assert_eq!(log.events(), expected);
    }

    #[test]
    fn hold_keeps_select_asserted() {
        let log = Log::default();
        let mut spi = MockSpi::new("spi", &log);
        let mut cs = MockPin::new("cs", &log);
        Frame::single(&[0x44, 0, 0, 0])
            .unwrap()
            .transfer(&mut spi, &mut cs, true)
            .unwrap();
        assert_eq!(
            log.events(),
            [
                Event::Pin("cs", false),
                Event::Spi("spi", std::vec![0x44, 0, 0, 0])
            ]
        );
    }

    #[test]
    fn poisoned_frames_stay_off_the_bus() {
        let log = Log::default();
        let mut spi = MockSpi::new("spi", &log);
        let mut cs = MockPin::new("cs", &log);
        let frame = Frame::poisoned(3);
        assert!(frame.as_bytes().iter().all(|&b| b == 0xff));
        assert_eq!(
            frame.transfer(&mut spi, &mut cs, false),
            Err(Error::PoisonedFrame)
        );
        assert!(log.events().is_empty());
    }

    #[test]
    fn bus_errors() {
        let log = Log::default();
        let mut spi = MockSpi::failing("spi", &log);
        let mut cs = MockPin::new("cs", &log);
        assert_eq!(
            Frame::single(&[0]).unwrap().transfer(&mut spi, &mut cs, false),
            Err(Error::Spi)
        );
        assert_eq!(log.events().last(), Some(&Event::Pin("cs", true)));

        // A held transaction leaves select to the caller.
        log.clear();
        assert_eq!(
            Frame::single(&[0]).unwrap().transfer(&mut spi, &mut cs, true),
            Err(Error::Spi)
        );
        assert_eq!(log.events(), [Event::Pin("cs", false)]);
    }
}
