use super::{SerialPort, UsbDevice};
use usb_device::UsbError;

/// USB CDC-ACM command interface.
pub struct SerialInterface {
    usb_device: UsbDevice,
    usb_serial: SerialPort,
}

#[derive(Debug)]
pub struct Error(UsbError);

impl From<UsbError> for Error {
    fn from(e: UsbError) -> Self {
        Self(e)
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

impl embedded_io::ErrorType for SerialInterface {
    type Error = Error;
}

impl embedded_io::Read for SerialInterface {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        match self.usb_serial.read(buf) {
            Err(UsbError::WouldBlock) => Ok(0),
            other => other.map_err(From::from),
        }
    }
}

impl embedded_io::Write for SerialInterface {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        // Replies and BUFFER_RAMP streams can outgrow the write store.
        // Keep servicing the bus until the host drains it.
        loop {
            match self.usb_serial.write(buf) {
                Err(UsbError::WouldBlock) => self.process(),
                other => return other.map_err(From::from),
            }
        }
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        loop {
            match self.usb_serial.flush() {
                Err(UsbError::WouldBlock) => self.process(),
                other => return other.map_err(From::from),
            }
        }
    }
}

impl SerialInterface {
    pub fn new(usb_device: UsbDevice, usb_serial: SerialPort) -> Self {
        Self {
            usb_device,
            usb_serial,
        }
    }

    /// Service the USB peripheral. Returns true if the serial class has pending events.
    pub fn process(&mut self) -> bool {
        self.usb_device.poll(&mut [&mut self.usb_serial])
    }
}
