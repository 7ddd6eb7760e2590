//! Cooperative batch cancellation
//!
//! A [`StopSignal`] is checked by the coordinator before each unit starts.
//! A unit that is already running always finishes (and is recorded) before
//! the batch stops. The binary wires SIGINT, SIGTERM and SIGHUP to the flag;
//! a second signal exits immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop flag
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the current batch to stop before its next unit
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the next batch can run
    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that trip `stop`.
///
/// Call this once at program start. The first signal requests a stop; a
/// second one exits with `128 + signal`.
pub fn init_signal_handlers(stop: StopSignal) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            if stop.is_requested() {
                tracing::warn!(signal = signal_name, "Second signal received, exiting");
                std::process::exit(128 + sig);
            }

            tracing::info!(
                signal = signal_name,
                "Stop requested; finishing the current migration"
            );
            stop.request_stop();
        }
    });

    Ok(())
}
