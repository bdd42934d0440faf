//! Interrupt handling.
//!
//! SIGINT and SIGTERM only raise a process-wide flag. Event loops poll it
//! between waits and return, which lets their owned resources drop normally.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// The flag raised by the installed handler.
pub fn shutdown_flag() -> &'static AtomicBool {
    &SHUTDOWN
}

extern "C" fn handle_shutdown(_signum: libc::c_int) {
    // Only async-signal-safe work here.
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the handler for SIGINT and SIGTERM.
///
/// `SA_RESTART` is left off so a blocking wait returns `EINTR` and the
/// flag is seen right away.
pub fn install() -> io::Result<()> {
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only touches an atomic, and the sigaction
        // struct is fully initialized before use.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_shutdown as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
