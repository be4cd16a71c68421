// kernel/src/serial.rs
//
// Kernel console output.
//
//   1. serial_print!/serial_println! go through a lock.  Do NOT use from
//      inside the heap allocator or while the console lock may be held.
//
//   2. serial_print_raw!/serial_println_raw! take no lock and allocate
//      nothing.  Safe from any context: fault paths, allocators, panic.
//      Concurrent writers may interleave at the byte level.
//
// The bytes go to whatever `ConsoleSink` the boot path registered (COM1 on
// x86, the PL011 on arm64 boards).  Until then output is dropped.  Host
// test builds print to stdout instead.

use core::fmt;
use spin::{Mutex, Once};

/// Byte sink behind the console (a UART driver).
pub trait ConsoleSink: Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

static SINK: Once<&'static dyn ConsoleSink> = Once::new();
static CONSOLE_LOCK: Mutex<()> = Mutex::new(());

/// Register the console device.  Only the first call has an effect.
pub fn set_sink(sink: &'static dyn ConsoleSink) {
    SINK.call_once(|| sink);
}

/// Write raw bytes to the console without taking the lock.
pub fn write_bytes(bytes: &[u8]) {
    #[cfg(test)]
    {
        std::print!("{}", alloc::string::String::from_utf8_lossy(bytes));
    }
    #[cfg(not(test))]
    {
        if let Some(sink) = SINK.get() {
            sink.write_bytes(bytes);
        }
    }
}

// ============================================================================
// Writers
// ============================================================================

/// Lock-free, allocation-free writer.  `format_args!` keeps all of its
/// state on the stack so this is usable from fault handlers.
pub struct RawSerialWriter;

impl fmt::Write for RawSerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _guard = CONSOLE_LOCK.lock();
    let _ = RawSerialWriter.write_fmt(args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

/// Lock-free print with full formatting support.
#[macro_export]
macro_rules! serial_print_raw {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::serial::RawSerialWriter, $($arg)*);
    }};
}

/// Lock-free println with full formatting support.
#[macro_export]
macro_rules! serial_println_raw {
    () => ($crate::serial_print_raw!("\n"));
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::serial::RawSerialWriter, $($arg)*);
    }};
}

/// Chatty per-page / per-hit tracing, compiled in with the `trace` feature.
#[cfg(feature = "trace")]
#[macro_export]
macro_rules! serial_trace {
    ($($arg:tt)*) => ($crate::serial_println!($($arg)*));
}

#[cfg(not(feature = "trace"))]
#[macro_export]
macro_rules! serial_trace {
    ($($arg:tt)*) => {{
        if false {
            $crate::serial_println!($($arg)*);
        }
    }};
}
