//! Ramp controller hardware configuration
//!
//! This file contains all of the hardware-specific configuration of the controller.
use stm32h7xx_hal::{self as hal, gpio::Speed, prelude::*};

use super::{
    delay::AsmDelay, usb::SerialInterface, Adc, Dac, SerialPort, Systick, UsbBus,
};
use crate::{ad4115::Ad4115, ad5791::Ad5791};

/// AD5791 SPI clock. The chip allows 35 MHz but the isolated lines do not.
const DAC_SCK: u32 = 8_000_000;

/// AD4115 SPI clock.
const ADC_SCK: u32 = 12_500_000;

/// System clock.
const SYSCLK: u32 = 400_000_000;

/// Container method for all devices on the main board.
pub struct RampDevices {
    pub dac: Dac,
    pub adc: Adc,
    pub delay: AsmDelay,
    pub usb_serial: SerialInterface,
}

/// Configure the controller hardware.
///
/// # Args
/// * `core` - The cortex-m peripherals.
/// * `device` - The microcontroller peripherals to be configured.
///
/// # Returns
/// `RampDevices` with both converters idle and unconfigured.
pub fn setup(
    mut core: stm32h7xx_hal::stm32::CorePeripherals,
    device: stm32h7xx_hal::stm32::Peripherals,
) -> RampDevices {
    // Set up RTT logging
    {
        // Enable debug during WFE/WFI-induced sleep
        device.DBGMCU.cr.modify(|_, w| w.dbgsleep_d1().set_bit());

        rtt_target::rtt_init_print!();

        static LOGGER: rtt_logger::RTTLogger =
            rtt_logger::RTTLogger::new(log::LevelFilter::Info);
        log::set_logger(&LOGGER)
            .map(|()| log::set_max_level(log::LevelFilter::Trace))
            .unwrap();
        log::info!("Starting");
    }

    let pwr = device.PWR.constrain();
    let vos = pwr.freeze();

    // Clear reset flags.
    device.RCC.rsr.write(|w| w.rmvf().set_bit());

    // Select the PLLs for SPI.
    device
        .RCC
        .d2ccip1r
        .modify(|_, w| w.spi123sel().pll2_p().spi45sel().pll2_q());

    let rcc = device.RCC.constrain();
    let mut ccdr = rcc
        .use_hse(8.MHz())
        .sysclk(SYSCLK.Hz())
        .hclk(200.MHz())
        .pll2_p_ck(100.MHz())
        .pll2_q_ck(100.MHz())
        .freeze(vos, &device.SYSCFG);

    // Set up USB clocks.
    ccdr.clocks.hsi48_ck().unwrap();
    ccdr.peripheral
        .kernel_usb_clk_mux(stm32h7xx_hal::rcc::rec::UsbClkSel::Hsi48);

    Systick::start(core.SYST, ccdr.clocks.sysclk().to_Hz());

    core.SCB.enable_icache();

    let delay = AsmDelay::new(ccdr.clocks.c_ck().to_Hz());

    let gpioa = device.GPIOA.split(ccdr.peripheral.GPIOA);
    let gpioc = device.GPIOC.split(ccdr.peripheral.GPIOC);
    let gpioe = device.GPIOE.split(ccdr.peripheral.GPIOE);
    let gpiog = device.GPIOG.split(ccdr.peripheral.GPIOG);

    // The four DACs share SPI3 and are addressed by their sync lines.
    // Data is shifted on the rising edge and latched on the falling edge (mode 1).
    let dac = {
        let sck = gpioc.pc10.into_alternate().speed(Speed::VeryHigh);
        let miso = gpioc.pc11.into_alternate().speed(Speed::VeryHigh);
        let mosi = gpioc.pc12.into_alternate().speed(Speed::VeryHigh);

        let spi: hal::spi::Spi<_, _, u8> = device.SPI3.spi(
            (sck, miso, mosi),
            hal::spi::MODE_1,
            DAC_SCK.Hz(),
            ccdr.peripheral.SPI3,
            &ccdr.clocks,
        );

        let sync = [
            gpiog.pg3.into_push_pull_output().erase(),
            gpiog.pg2.into_push_pull_output().erase(),
            gpiog.pg1.into_push_pull_output().erase(),
            gpiog.pg0.into_push_pull_output().erase(),
        ];
        let ldac = gpiog.pg4.into_push_pull_output().erase();

        Ad5791::new(spi, sync, ldac).unwrap()
    };

    // The AD4115 idles SCLK high (mode 3). DOUT/RDY is mirrored to a GPIO for data ready polling.
    let adc = {
        let sck = gpioe.pe2.into_alternate().speed(Speed::VeryHigh);
        let miso = gpioe.pe5.into_alternate().speed(Speed::VeryHigh);
        let mosi = gpioe.pe6.into_alternate().speed(Speed::VeryHigh);

        let spi: hal::spi::Spi<_, _, u8> = device.SPI4.spi(
            (sck, miso, mosi),
            hal::spi::MODE_3,
            ADC_SCK.Hz(),
            ccdr.peripheral.SPI4,
            &ccdr.clocks,
        );

        let cs = gpioe.pe0.into_push_pull_output().erase();
        let drdy = gpioe.pe3.into_floating_input().erase();

        Ad4115::new(spi, cs, drdy).unwrap()
    };

    let usb_serial = {
        let usb_n = gpioa.pa11.into_alternate();
        let usb_p = gpioa.pa12.into_alternate();
        let usb = stm32h7xx_hal::usb_hs::USB2::new(
            device.OTG2_HS_GLOBAL,
            device.OTG2_HS_DEVICE,
            device.OTG2_HS_PWRCLK,
            usb_n,
            usb_p,
            ccdr.peripheral.USB2OTG,
            &ccdr.clocks,
        );

        let endpoint_memory =
            cortex_m::singleton!(: [u32; 1024] = [0; 1024]).unwrap();
        let usb_bus = cortex_m::singleton!(: usb_device::bus::UsbBusAllocator<UsbBus> =
            stm32h7xx_hal::usb_hs::UsbBus::new(usb, &mut endpoint_memory[..]))
        .unwrap();

        let read_store = cortex_m::singleton!(: [u8; 128] = [0; 128]).unwrap();
        let write_store =
            cortex_m::singleton!(: [u8; 1024] = [0; 1024]).unwrap();
        let serial: SerialPort = usbd_serial::SerialPort::new_with_store(
            usb_bus,
            &mut read_store[..],
            &mut write_store[..],
        );

        let usb_device = usb_device::device::UsbDeviceBuilder::new(
            usb_bus,
            usb_device::device::UsbVidPid(0x1209, 0x392F),
        )
        .strings(&[usb_device::device::StringDescriptors::default()
            .manufacturer("QUARTIQ")
            .product("DAC-ADC ramp controller")
            .serial_number("0")])
        .unwrap()
        .device_class(usbd_serial::USB_CLASS_CDC)
        .build();

        SerialInterface::new(usb_device, serial)
    };

    log::info!("setup() complete");

    RampDevices {
        dac,
        adc,
        delay,
        usb_serial,
    }
}
