//! MIDI Transport is [Embassy](https://embassy.dev)-based firmware which presents the [Nucleo-F767ZI development
//! board](https://www.st.com/en/evaluation-tools/nucleo-f767zi.html) to a USB host as a class-compliant MIDI device.
//!
//! All protocol work happens in [`midi_transport_lib`]; this binary brings up the clocks and the USB peripheral,
//! connects the driver's rings to the MIDI endpoints, and then exercises the driver: once initialized, it sends the
//! modulation wheel controller on channel 1 every 100 ms with a value ramping from 0 to 127, and polls for inbound
//! traffic on every pass through the main loop. Open any MIDI monitor on the host to watch it.
//!
//! The green LED (LD1) is lit while the driver is ready. If the driver cannot be initialized at all, the red LED
//! (LD3) blinks and the firmware goes no further.

#![no_std]
#![no_main]

#[macro_use]
mod log;
mod usb;

use crate::usb::{RX_QUEUE_LEN, TX_QUEUE_LEN};
use embassy_executor::Spawner;
use embassy_stm32::{
    Config,
    gpio::{Level, Output, Speed},
    time::Hertz,
};
use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::OutputPin;
use midi_transport_lib::{
    CableNumber, DriverConfig, DriverState, Message, MidiHandler, MidiTransportDriver, error_code_to_string,
    port::{LinkStatus, MidiPort, PortQueues},
};
use static_cell::StaticCell;
use wmidi::ControlFunction;

#[cfg(feature = "defmt-rtt")]
use defmt_rtt as _;
#[cfg(not(feature = "panic-probe"))]
use panic_halt as _;
#[cfg(feature = "panic-probe")]
use panic_probe as _;

/// Channel 1, zero-indexed.
const MIDI_CHANNEL: u8 = 0;
const CC_NUMBER: ControlFunction = ControlFunction::MODULATION_WHEEL;
const SEND_INTERVAL: Duration = Duration::from_millis(100);
/// How long the main loop sleeps between calls to `update()`.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bus state shared by the USB stack, the I/O task and the driver.
static LINK_STATUS: LinkStatus = LinkStatus::new();

static PORT_QUEUES: StaticCell<PortQueues<TX_QUEUE_LEN, RX_QUEUE_LEN>> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Initializing MIDI Transport");

    let p = embassy_stm32::init(clock_config());

    let mut ready_led = Output::new(p.PB0, Level::Low, Speed::Low);
    let fault_led = Output::new(p.PB14, Level::Low, Speed::Low);

    let (usb, class) = usb::build(p.USB_OTG_FS, p.PA12, p.PA11, &LINK_STATUS);
    let (port, tx, rx) = PORT_QUEUES.init(PortQueues::new()).split(&LINK_STATUS);

    spawner.must_spawn(usb::usb_task(usb));
    spawner.must_spawn(usb::midi_io_task(class, tx, rx));

    let mut driver = MidiTransportDriver::with_handler(port, log_inbound, DriverConfig::default());
    if let Err(_code) = driver.init() {
        error!("MIDI init failed: {}", error_code_to_string(_code));
        halt(fault_led).await;
    }

    info!(
        "MIDI initialized; sending CC {} on channel {} every {} ms",
        u8::from(CC_NUMBER.0),
        MIDI_CHANNEL + 1,
        SEND_INTERVAL.as_millis()
    );

    let mut value: u8 = 0;
    let mut last_send = Instant::now();
    loop {
        if last_send.elapsed() >= SEND_INTERVAL {
            last_send = Instant::now();
            send_value(&mut driver, value);
            value = (value + 1) % 128;
        }

        driver.update();
        ready_led.set_level(Level::from(driver.is_ready()));
        Timer::after(POLL_INTERVAL).await;
    }
}

/// Sends one step of the controller ramp, starting a new session if the last one ended in a fault.
fn send_value<P: MidiPort, H: MidiHandler>(driver: &mut MidiTransportDriver<P, H>, value: u8) {
    match driver.send_cc(MIDI_CHANNEL, u8::from(CC_NUMBER.0), value) {
        Ok(()) => {
            debug!("CC {} = {}", u8::from(CC_NUMBER.0), value);
        }
        Err(code) if code.is_retryable() => {
            debug!("CC {} = {} skipped: {}", u8::from(CC_NUMBER.0), value, code.as_str());
        }
        Err(_code) => {
            warn!("CC {} = {} failed: {}", u8::from(CC_NUMBER.0), value, error_code_to_string(_code));
            if driver.state() == DriverState::Faulted {
                if let Err(_code) = driver.init() {
                    warn!("MIDI re-init failed: {}", error_code_to_string(_code));
                }
            }
        }
    }
}

/// Inbound traffic is only logged.
fn log_inbound(_cable: CableNumber, _message: Message<'_>) {
    debug!("Received {} on cable {}", _message, _cable.get());
}

/// Blinks the fault LED forever.
async fn halt(mut led: impl OutputPin) -> ! {
    loop {
        // the pins are infallible
        let _ = led.set_high();
        Timer::after_millis(250).await;
        let _ = led.set_low();
        Timer::after_millis(750).await;
    }
}

fn clock_config() -> Config {
    use embassy_stm32::rcc::*;

    let mut config = embassy_stm32::Config::default();
    // hse: high-speed external clock, supplied by the ST-LINK's MCO
    config.rcc.hse = Some(Hse {
        freq: Hertz(8_000_000),
        mode: HseMode::Bypass,
    });

    config.rcc.pll_src = PllSource::HSE;
    config.rcc.pll = Some(Pll {
        prediv: PllPreDiv::DIV4,
        mul: PllMul::MUL216,
        divp: Some(PllPDiv::DIV2), // 8mhz / 4 * 216 / 2 = 216Mhz
        // USB OTG FS needs exactly 48MHz, which on this part can only come from PLLQ or PLLSAI (RM0410, 5.2)
        divq: Some(PllQDiv::DIV9), // 8mhz / 4 * 216 / 9 = 48Mhz
        divr: None,
    });
    config.rcc.ahb_pre = AHBPrescaler::DIV1;
    config.rcc.apb1_pre = APBPrescaler::DIV4;
    config.rcc.apb2_pre = APBPrescaler::DIV2;
    config.rcc.sys = Sysclk::PLL1_P;
    config.rcc.mux.clk48sel = mux::Clk48sel::PLL1_Q;
    config
}
