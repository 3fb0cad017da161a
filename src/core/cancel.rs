//! Cooperative cancellation, checked by the scheduler between steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    watch_interrupt: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also observes Ctrl-C once [`install_interrupt_handler`]
    /// has run.
    pub fn interruptible() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            watch_interrupt: true,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.watch_interrupt && INTERRUPTED.load(Ordering::SeqCst))
    }
}

/// Exit status used when a second Ctrl-C ends the process.
const INTERRUPT_EXIT_CODE: i32 = 130;

fn on_interrupt() {
    // A second Ctrl-C terminates immediately.
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        std::process::exit(INTERRUPT_EXIT_CODE);
    }
    log_status!("deploy", "Interrupted, stopping after the current step");
}

/// Route Ctrl-C to the process-wide interrupt flag. Call once per process.
pub fn install_interrupt_handler() -> Result<()> {
    ctrlc::set_handler(on_interrupt).map_err(|e| {
        Error::internal_unexpected(format!("Failed to install Ctrl-C handler: {}", e))
    })
}
