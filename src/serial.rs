//! Serial console logging backend.
//!
//! All `log` records from the VM core end up here. On bare metal the
//! records go to COM1 (QEMU's `-serial stdio`); host test builds print to
//! stderr so failing tests show the paging trace.

use log::{LevelFilter, Log, Metadata, Record};

#[cfg(target_os = "none")]
mod port {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut serial_port = unsafe { SerialPort::new(0x3F8) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }

    pub fn write(args: core::fmt::Arguments) {
        use core::fmt::Write;
        // Disable interrupts while holding the serial lock to prevent
        // deadlock if a timer interrupt fires mid-print.
        x86_64::instructions::interrupts::without_interrupts(|| {
            let _ = SERIAL1.lock().write_fmt(args);
        });
    }
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    #[cfg(target_os = "none")]
    port::write(args);

    #[cfg(all(test, not(target_os = "none")))]
    std::eprint!("{}", args);

    #[cfg(all(not(test), not(target_os = "none")))]
    let _ = args;
}

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            _print(format_args!("[{:<5}] {}\n", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger. Later calls only adjust the level.
pub fn init(level: LevelFilter) {
    // Another logger may already be installed by the embedding kernel.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
