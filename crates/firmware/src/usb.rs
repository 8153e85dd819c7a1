//! USB device bring-up and the task which moves packets between the endpoints and the driver's rings.

use core::convert::Infallible;
use embassy_futures::select::{Either, select};
use embassy_stm32::{
    Peri, bind_interrupts,
    peripherals::{self, PA11, PA12, USB_OTG_FS},
    usb,
};
use embassy_usb::{
    Builder, Handler, UsbDevice,
    class::midi::{MidiClass, Receiver, Sender},
    driver::EndpointError,
};
use midi_transport_lib::{
    packet::PACKET_LEN,
    port::{LinkState, LinkStatus, RxWriter, TxReader},
};
use static_cell::StaticCell;

bind_interrupts!(
    #[doc(hidden)]
    struct Irqs {
        OTG_FS => usb::InterruptHandler<peripherals::USB_OTG_FS>;
    }
);

pub type UsbDriver = usb::Driver<'static, peripherals::USB_OTG_FS>;

/// Packets buffered towards the host. A `heapless` ring of N holds N - 1.
pub const TX_QUEUE_LEN: usize = 64;
/// Packets buffered from the host.
pub const RX_QUEUE_LEN: usize = 64;

/// Full-speed bulk endpoints carry 64 bytes, i.e. 16 event packets, per transfer.
const MAX_PACKET_SIZE: u16 = 64;

/// Publishes bus events from the USB stack as a [`LinkState`].
struct LinkHandler {
    status: &'static LinkStatus,
    configured: bool,
}

impl Handler for LinkHandler {
    fn enabled(&mut self, enabled: bool) {
        if !enabled {
            self.configured = false;
            self.status.set_state(LinkState::Detached);
        }
    }

    fn reset(&mut self) {
        self.configured = false;
        self.status.set_state(LinkState::Attached);
    }

    fn configured(&mut self, configured: bool) {
        self.configured = configured;
        self.status.set_state(if configured {
            LinkState::Configured
        } else {
            LinkState::Attached
        });
    }

    fn suspended(&mut self, suspended: bool) {
        self.status.set_state(match (suspended, self.configured) {
            (true, _) => LinkState::Suspended,
            (false, true) => LinkState::Configured,
            (false, false) => LinkState::Attached,
        });
    }
}

/// Builds the USB device with a single MIDI function: one IN jack, one OUT jack.
pub fn build(
    peripheral: Peri<'static, USB_OTG_FS>,
    dp: Peri<'static, PA12>,
    dm: Peri<'static, PA11>,
    status: &'static LinkStatus,
) -> (UsbDevice<'static, UsbDriver>, MidiClass<'static, UsbDriver>) {
    static ENDPOINT_OUT_BUFFER: StaticCell<[u8; 256]> = StaticCell::new();
    let mut config = usb::Config::default();

    // The Nucleo cannot be powered from CN13 (UM1974, section 6.10), so it is self-powered and must watch VBUS
    // to notice the host going away.
    config.vbus_detection = true;

    let driver = usb::Driver::new_fs(peripheral, Irqs, dp, dm, ENDPOINT_OUT_BUFFER.init([0; 256]), config);

    // per https://pid.codes, FOSS projects can apply to be listed under the vendor ID owned by InterBiometrics
    let vendor_id = 0x1209;
    let product_id = 0x0001;

    let mut config = embassy_usb::Config::new(vendor_id, product_id);
    config.manufacturer = Some("MIDI Transport contributors");
    config.product = Some("MIDI Transport");
    config.self_powered = true;
    config.max_power = 0;

    static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static CONTROL_BUFFER: StaticCell<[u8; 64]> = StaticCell::new();
    static LINK_HANDLER: StaticCell<LinkHandler> = StaticCell::new();

    let mut builder = Builder::new(
        driver,
        config,
        CONFIG_DESCRIPTOR.init([0; 256]),
        BOS_DESCRIPTOR.init([0; 256]),
        &mut [], // no msos descriptors
        CONTROL_BUFFER.init([0; 64]),
    );
    builder.handler(LINK_HANDLER.init(LinkHandler {
        status,
        configured: false,
    }));

    let class = MidiClass::new(&mut builder, 1, 1, MAX_PACKET_SIZE);
    (builder.build(), class)
}

#[embassy_executor::task]
pub async fn usb_task(mut usb: UsbDevice<'static, UsbDriver>) -> ! {
    usb.run().await
}

/// Why a pump stopped.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum PumpError {
    Disabled,
    Overflow,
}

impl From<EndpointError> for PumpError {
    fn from(val: EndpointError) -> Self {
        match val {
            EndpointError::BufferOverflow => PumpError::Overflow,
            EndpointError::Disabled => PumpError::Disabled,
        }
    }
}

/// Moves packets between the bulk endpoints and the driver's rings for as long as the device stays connected.
///
/// This task is the only consumer of the TX ring and the only producer of the RX ring.
#[embassy_executor::task]
pub async fn midi_io_task(
    class: MidiClass<'static, UsbDriver>,
    mut tx: TxReader<'static, TX_QUEUE_LEN>,
    mut rx: RxWriter<'static, RX_QUEUE_LEN>,
) -> ! {
    let (mut sender, mut receiver) = class.split();
    loop {
        receiver.wait_connection().await;
        rx.reconnected();
        info!("USB MIDI connected");

        let error = match select(pump_in(&mut receiver, &mut rx), pump_out(&mut sender, &mut tx)).await {
            Either::First(Err(e)) | Either::Second(Err(e)) => e,
        };
        match error {
            PumpError::Disabled => {
                info!("USB MIDI disconnected");
            }
            PumpError::Overflow => {
                error!("USB MIDI endpoint overflowed");
                rx.set_link(LinkState::Fault);
            }
        }

        // whatever was queued for the old session is stale now
        let mut stale = 0_usize;
        while tx.next_packet().is_some() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} unsent packets", stale);
        }
    }
}

async fn pump_in(
    receiver: &mut Receiver<'static, UsbDriver>,
    rx: &mut RxWriter<'static, RX_QUEUE_LEN>,
) -> Result<Infallible, PumpError> {
    let mut buf = [0; MAX_PACKET_SIZE as usize];
    loop {
        let n = receiver.read_packet(&mut buf).await?;
        let queued = rx.push_bytes(&buf[..n]);
        if queued * PACKET_LEN < n {
            warn!("Dropped {} inbound bytes", n - queued * PACKET_LEN);
        }
    }
}

async fn pump_out(
    sender: &mut Sender<'static, UsbDriver>,
    tx: &mut TxReader<'static, TX_QUEUE_LEN>,
) -> Result<Infallible, PumpError> {
    let mut buf = [0; MAX_PACKET_SIZE as usize];
    loop {
        tx.ready().await;
        let n = tx.fill(&mut buf);
        sender.write_packet(&buf[..n]).await?;
    }
}
