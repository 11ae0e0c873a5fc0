//! Host-supplied resource pressure signals polled by the daemon reaper.

use std::sync::Mutex;

use sysinfo::System;

/// Tells the daemon pool whether the host is short on resources.
///
/// While this reports pressure, the reaper terminates idle daemons
/// oldest-idle-first.
pub trait ResourcePressure: Send + Sync {
    fn is_under_pressure(&self) -> bool;
}

impl<F> ResourcePressure for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_under_pressure(&self) -> bool {
        self()
    }
}

/// Never reports pressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPressure;

impl ResourcePressure for NoPressure {
    fn is_under_pressure(&self) -> bool {
        false
    }
}

/// Reports pressure when available system memory drops below a threshold.
pub struct AvailableMemoryThreshold {
    min_available_bytes: u64,
    system: Mutex<System>,
}

impl AvailableMemoryThreshold {
    pub fn new(min_available_bytes: u64) -> Self {
        Self {
            min_available_bytes,
            system: Mutex::new(System::new()),
        }
    }

    pub fn min_available_bytes(&self) -> u64 {
        self.min_available_bytes
    }

    /// Currently available memory in bytes, if it could be sampled.
    pub fn available_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        Some(system.available_memory())
    }
}

impl ResourcePressure for AvailableMemoryThreshold {
    fn is_under_pressure(&self) -> bool {
        match self.available_bytes() {
            Some(available) => {
                let low = available < self.min_available_bytes;
                if low {
                    tracing::debug!(
                        available,
                        threshold = self.min_available_bytes,
                        "available memory below threshold"
                    );
                }
                low
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for AvailableMemoryThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailableMemoryThreshold")
            .field("min_available_bytes", &self.min_available_bytes)
            .finish()
    }
}
