//! # Ramp controller
//!
//! Firmware for a 4 channel AD5791 / 16 channel AD4115 voltage ramp generator
//! driven by line oriented commands over USB serial.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use panic_probe as _; // global panic handler

#[cfg(not(target_os = "none"))]
fn main() {
    use dac_adc_ramp::settings::Settings;
    let s = Settings::default();
    println!("{}", serde_json::to_string_pretty(&s).unwrap());
}

#[cfg(target_os = "none")]
#[cfg_attr(target_os = "none", rtic::app(device = hal::stm32, peripherals = true, dispatchers=[DCMI]))]
mod app {
    use dac_adc_ramp::{
        command::{Dispatcher, LineBuffer},
        hardware::{
            delay::AsmDelay, hal, setup::setup, usb::SerialInterface, Adc, Dac,
            Systick,
        },
        settings::Settings,
    };
    use embedded_io::Read;
    use fugit::ExtU32;
    use rtic_monotonics::Monotonic;

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        usb_serial: SerialInterface,
        dispatcher: Dispatcher<Dac, Adc, AsmDelay>,
        line: LineBuffer,
    }

    #[init]
    fn init(c: init::Context) -> (Shared, Local) {
        let devices = setup(c.core, c.device);

        let mut dispatcher =
            Dispatcher::new(devices.dac, devices.adc, devices.delay, Settings::default());
        if let Err(e) = dispatcher.boot() {
            log::error!("Boot failed: {e}");
        }

        usb::spawn().unwrap();

        (
            Shared {},
            Local {
                usb_serial: devices.usb_serial,
                dispatcher,
                line: LineBuffer::default(),
            },
        )
    }

    #[task(priority = 1, local=[usb_serial, dispatcher, line])]
    async fn usb(c: usb::Context) {
        let mut buf = [0u8; 64];
        loop {
            c.local.usb_serial.process();

            match c.local.usb_serial.read(&mut buf) {
                Ok(len) => {
                    for &byte in &buf[..len] {
                        if let Some(line) = c.local.line.push(byte) {
                            if let Err(e) =
                                c.local.dispatcher.dispatch(&line, c.local.usb_serial)
                            {
                                log::warn!("Reply dropped: {e:?}");
                            }
                        }
                    }
                }
                Err(e) => log::warn!("USB read failed: {e:?}"),
            }

            Systick::delay(1.millis()).await;
        }
    }
}
