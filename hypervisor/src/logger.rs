//! The module containing the UART (serial port) logger implementation.
//!
//! Host log lines go to COM1 prefixed with the APIC id of the emitting
//! processor, so interleaved output from multiple VMs stays attributable.

use crate::{
    config::LOGGING_LEVEL,
    x86_instructions::{inb, outb},
};
use core::{fmt, fmt::Write};
use spin::Mutex;

/// Initializes the logger instance.
pub(crate) fn init_uart_logger() {
    log::set_logger(&UART_LOGGER)
        .map(|()| log::set_max_level(LOGGING_LEVEL))
        .unwrap();
}

const UART_COM1: u16 = 0x3f8;
const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0;
const UART_OFFSET_LINE_STATUS: u16 = 5;
const UART_LINE_STATUS_THR_EMPTY: u8 = 0x20;

struct Uart {
    io_port_base: u16,
}

impl Write for Uart {
    fn write_str(&mut self, string: &str) -> Result<(), fmt::Error> {
        for byte in string.bytes() {
            while (inb(self.io_port_base + UART_OFFSET_LINE_STATUS) & UART_LINE_STATUS_THR_EMPTY)
                == 0
            {}
            outb(
                self.io_port_base + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER,
                byte,
            );
        }
        Ok(())
    }
}

struct UartLogger {
    port: Mutex<Uart>,
}

impl log::Log for UartLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                self.port.lock(),
                "#{}:{}: {}",
                apic_id(),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Writes raw guest output bytes to the serial port, bypassing the line
/// format. Used by the serial I/O forwarder and the print hypercall.
pub(crate) fn write_guest_bytes(bytes: &[u8]) {
    let uart = UART_LOGGER.port.lock();
    for &byte in bytes {
        while (inb(uart.io_port_base + UART_OFFSET_LINE_STATUS) & UART_LINE_STATUS_THR_EMPTY) == 0 {
        }
        outb(
            uart.io_port_base + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER,
            byte,
        );
    }
}

/// Gets an APIC ID.
fn apic_id() -> u32 {
    // See: (AMD) CPUID Fn0000_0001_EBX LocalApicId, LogicalProcessorCount, CLFlush
    // See: (Intel) Table 3-8. Information Returned by CPUID Instruction
    x86::cpuid::cpuid!(0x1).ebx >> 24
}

static UART_LOGGER: UartLogger = UartLogger {
    port: Mutex::new(Uart {
        io_port_base: UART_COM1,
    }),
};
