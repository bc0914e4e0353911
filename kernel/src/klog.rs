//! Ambient logging. Out-of-scope hardware (UART, console) means this
//! core cannot write to a real device, so diagnostics go through a
//! mutex-protected writer that forwards to a sink function the
//! embedding kernel installs.

use crate::spinlock::SpinMutex as Mutex;
use core::fmt;

/// A sink takes one formatted line of kernel diagnostics. The
/// embedding kernel installs one over its UART driver; under test we
/// default to the host's stdout.
pub type SinkFn = fn(&str);

fn null_sink(_s: &str) {}

#[cfg(test)]
fn stdout_sink(s: &str) {
    print!("{s}");
}

#[cfg(test)]
static SINK: Mutex<SinkFn> = Mutex::new("klog", stdout_sink);
#[cfg(not(test))]
static SINK: Mutex<SinkFn> = Mutex::new("klog", null_sink);

/// Install the embedding kernel's real sink (a UART driver, typically).
/// Until this is called in a non-test build, diagnostics are dropped.
pub fn set_sink(sink: SinkFn) {
    SINK.with_lock(|s| *s = sink);
}

struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        SINK.with_lock(|sink| sink(s));
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = Writer.write_fmt(args);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::klog::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => ($crate::kprintln!("warning: {}", format_args!($($arg)*)));
}
