//! Restart through process exit

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::capability::DeviceRestart;
use crate::scheduler::ShutdownSignal;

/// Restarts by shutting the daemon down; the service manager starts it again
/// on the freshly activated image.
pub struct ShutdownRestart {
    signal: ShutdownSignal,
    requested: AtomicBool,
}

impl ShutdownRestart {
    /// Restart capability that triggers `signal`
    pub fn new(signal: ShutdownSignal) -> Self {
        Self {
            signal,
            requested: AtomicBool::new(false),
        }
    }

    /// Whether a restart has been requested
    pub fn restart_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl DeviceRestart for ShutdownRestart {
    fn restart(&self) {
        if self.requested.swap(true, Ordering::AcqRel) {
            warn!("Restart already requested");
            return;
        }
        info!("Restart requested, shutting down into the new firmware image");
        self.signal.trigger();
    }
}
