use embassy_futures::select::{Either, select};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{
    BufferedInterruptHandler, BufferedUart, Config as UartConfig, DataBits, Parity, StopBits,
};
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use node_core::link::{LinkEvent, parse_event};
use static_cell::StaticCell;

use super::{InitError, fatal};
use crate::link::{Assembled, LINK_LINE_CAPACITY, LineAssembler, LinkChannels, cycle_event};
use crate::shutdown::TaskShutdown;

const LINK_UART_BUFFER_SIZE: usize = LINK_LINE_CAPACITY * 2;
const LINK_UART_BAUD: u32 = 115_200;
const LINK_READ_CHUNK: usize = 64;

static UART_TX_BUFFER: StaticCell<[u8; LINK_UART_BUFFER_SIZE]> = StaticCell::new();
static UART_RX_BUFFER: StaticCell<[u8; LINK_UART_BUFFER_SIZE]> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART3_4_5_6_LPUART1 => BufferedInterruptHandler<hal::peripherals::USART5>;
});

#[embassy_executor::task]
pub async fn run(
    link: &'static LinkChannels,
    shutdown: &'static TaskShutdown,
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = LINK_UART_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let uart = match BufferedUart::new(
        usart,
        rx_pin,
        tx_pin,
        UART_TX_BUFFER.init([0; LINK_UART_BUFFER_SIZE]),
        UART_RX_BUFFER.init([0; LINK_UART_BUFFER_SIZE]),
        UartIrqs,
        config,
    ) {
        Ok(uart) => uart,
        Err(_) => fatal(InitError::Uart),
    };

    let (mut uart_tx, mut uart_rx) = uart.split();

    let commands = link.command_receiver();
    let events = link.event_sender();

    // Returns once shutdown is requested and every queued line is on the wire.
    let outbound = async move {
        loop {
            match select(commands.receive(), shutdown.requested()).await {
                Either::First(line) => write_line(&mut uart_tx, line.as_bytes()).await,
                Either::Second(()) => {
                    while let Ok(line) = commands.try_receive() {
                        write_line(&mut uart_tx, line.as_bytes()).await;
                    }
                    return;
                }
            }
        }
    };

    let inbound = async move {
        let mut assembler = LineAssembler::new();
        let mut ingress = [0u8; LINK_READ_CHUNK];
        loop {
            let count = match uart_rx.read(&mut ingress).await {
                Ok(count) => count,
                Err(_) => {
                    defmt::warn!("link: UART read error");
                    Timer::after(Duration::from_millis(5)).await;
                    continue;
                }
            };

            for &byte in &ingress[..count] {
                let event = match assembler.push(byte) {
                    Assembled::Pending => continue,
                    Assembled::Dropped => {
                        defmt::warn!("link: dropping malformed line");
                        continue;
                    }
                    Assembled::Line(line) => match parse_event(line) {
                        Ok(LinkEvent::Error(text)) => {
                            defmt::warn!("link: coprocessor error {=str}", text);
                            continue;
                        }
                        Ok(event) => cycle_event(event),
                        Err(err) => {
                            defmt::warn!(
                                "link: ignoring line ({})",
                                defmt::Display2Format(&err)
                            );
                            continue;
                        }
                    },
                };
                if let Some(event) = event {
                    events.send(event).await;
                }
            }
        }
    };

    // Both UART halves are dropped with this future, which disables USART5
    // and returns PB0/PB1 to their reset state.
    select(outbound, inbound).await;
    shutdown.release();
    loop {
        core::future::pending::<()>().await;
    }
}

async fn write_line<W: Write>(uart_tx: &mut W, line: &[u8]) {
    if uart_tx.write_all(line).await.is_err() {
        defmt::warn!("link: UART write error");
        Timer::after(Duration::from_millis(5)).await;
        return;
    }
    if uart_tx.flush().await.is_err() {
        defmt::warn!("link: UART flush error");
        Timer::after(Duration::from_millis(5)).await;
    }
}
