//! Crash diagnostics
//!
//! Panics and fatal signals are appended to `crash.log` next to the regular
//! logs. Camera and encoder backends call [`mark_hardware_call`] before
//! driver work so a crash inside an ioctl leaves a breadcrumb naming the
//! operation that was running.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{error, trace};

const CRASH_LOG_FILENAME: &str = "crash.log";

static CRASH_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Descriptor used by the signal handler, which may not allocate or open files
#[cfg(unix)]
static CRASH_LOG_FD: OnceLock<std::os::unix::io::RawFd> = OnceLock::new();

/// Install the panic hook and fatal signal handlers. Returns the crash log path.
pub fn init_crash_handler(log_dir: &Path) -> std::io::Result<PathBuf> {
    let path = log_dir.join(CRASH_LOG_FILENAME);
    let file = open_crash_log(&path)?;
    let _ = CRASH_LOG_PATH.set(path.clone());

    #[cfg(unix)]
    {
        use std::os::unix::io::IntoRawFd;
        let _ = CRASH_LOG_FD.set(file.into_raw_fd());
    }
    #[cfg(not(unix))]
    drop(file);

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        record_panic(info);
        default_hook(info);
    }));

    #[cfg(unix)]
    install_signal_handlers();

    Ok(path)
}

fn open_crash_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

fn append(report: &str) {
    let Some(path) = CRASH_LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = open_crash_log(path) {
        let _ = file.write_all(report.as_bytes());
        let _ = file.sync_data();
    }
}

/// Leave a breadcrumb before calling into a camera or encoder driver
pub fn mark_hardware_call(operation: &str) {
    trace!("hardware call: {}", operation);
    append(&format!("[{}] hardware call: {}\n", timestamp(), operation));
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn record_panic(info: &PanicHookInfo<'_>) {
    let location = info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "unknown location".to_string());
    let message = panic_message(info);
    let thread = std::thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_string();

    append(&format!(
        "\n==== PANIC {} ====\nThread: {}\nLocation: {}\nMessage: {}\n\n{}\n",
        timestamp(),
        thread,
        location,
        message,
        std::backtrace::Backtrace::force_capture()
    ));

    error!("Panic on thread {} at {}: {}", thread, location, message);
}

#[cfg(unix)]
const FATAL_SIGNALS: [(libc::c_int, &str); 5] = [
    (libc::SIGSEGV, "SIGSEGV"),
    (libc::SIGBUS, "SIGBUS"),
    (libc::SIGABRT, "SIGABRT"),
    (libc::SIGFPE, "SIGFPE"),
    (libc::SIGILL, "SIGILL"),
];

#[cfg(unix)]
fn install_signal_handlers() {
    for (signal, _) in FATAL_SIGNALS {
        // SAFETY: the action is fully initialized before sigaction reads it,
        // and the handler only calls async-signal-safe functions.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_fatal_signal as *const () as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }
    }
}

#[cfg(unix)]
extern "C" fn on_fatal_signal(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let name = FATAL_SIGNALS
        .iter()
        .find(|(s, _)| *s == signal)
        .map(|(_, name)| *name)
        .unwrap_or("signal");
    // SAFETY: `info` comes from the kernel for SA_SIGINFO handlers
    let addr = if info.is_null() {
        0
    } else {
        unsafe { (*info).si_addr() as usize }
    };

    let mut report = SignalReport::new();
    report.push(b"\n==== FATAL ");
    report.push(name.as_bytes());
    report.push(b" (");
    report.push_decimal(signal as usize);
    report.push(b")");
    if addr != 0 {
        report.push(b" at 0x");
        report.push_hex(addr);
    }
    report.push(b" ====\n");

    // SAFETY: write, fsync, signal and raise are async-signal-safe
    unsafe {
        if let Some(&fd) = CRASH_LOG_FD.get() {
            libc::write(fd, report.bytes().as_ptr().cast(), report.len);
            libc::fsync(fd);
        }
        libc::write(libc::STDERR_FILENO, report.bytes().as_ptr().cast(), report.len);

        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

/// Fixed-size message buffer usable inside a signal handler
#[cfg(unix)]
struct SignalReport {
    buf: [u8; 256],
    len: usize,
}

#[cfg(unix)]
impl SignalReport {
    fn new() -> Self {
        Self {
            buf: [0; 256],
            len: 0,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Append as much of `bytes` as fits
    fn push(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    fn push_radix(&mut self, mut n: usize, radix: usize) {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut tmp = [0u8; 20];
        let mut i = tmp.len();
        loop {
            i -= 1;
            tmp[i] = DIGITS[n % radix];
            n /= radix;
            if n == 0 {
                break;
            }
        }
        self.push(&tmp[i..]);
    }

    fn push_decimal(&mut self, n: usize) {
        self.push_radix(n, 10);
    }

    fn push_hex(&mut self, n: usize) {
        self.push_radix(n, 16);
    }
}
