//! Serial port driver for the kernel console.
//!
//! Uses the `uart_16550` crate to interface with COM1 at I/O port 0x3F8
//! (8N1, FIFO enabled). Everything the kernel prints -- boot diagnostics,
//! log records, userspace writes to stdout/stderr -- ends up here.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod port {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            // SAFETY: 0x3F8 is the standard COM1 base; the six I/O ports
            // starting there belong to the UART and nothing else touches
            // them.
            let mut serial_port = unsafe { SerialPort::new(0x3F8) };
            serial_port.init();
            Mutex::new(serial_port)
        };
    }
}

/// Bring the UART up early so boot diagnostics are visible before the rest
/// of the kernel initializes.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // First access runs SerialPort::init().
        let _ = port::SERIAL1.lock();
    }
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use core::fmt::Write;

        use x86_64::instructions::interrupts;

        interrupts::without_interrupts(|| {
            port::SERIAL1
                .lock()
                .write_fmt(args)
                .expect("Printing to serial failed");
        });
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = args;
    }
}

/// Write raw bytes to the console. Used by the `write`/`writev` syscalls
/// for fds 1 and 2.
pub fn write_bytes(bytes: &[u8]) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::instructions::interrupts;

        interrupts::without_interrupts(|| {
            let mut uart = port::SERIAL1.lock();
            for &b in bytes {
                uart.send(b);
            }
        });
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = bytes;
    }
}
