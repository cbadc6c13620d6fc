//! Resident memory sampling of the benchmark process.

use std::sync::Mutex;

use sysinfo::{Pid, System};

/// Change of resident memory across a measured phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryDelta {
    /// Resident bytes before the measured phase.
    pub before: u64,
    /// Resident bytes after the measured phase.
    pub after: u64,
}

impl MemoryDelta {
    /// Growth in bytes; negative if memory was released.
    pub fn growth(&self) -> i64 {
        self.after as i64 - self.before as i64
    }
}

impl From<(u64, u64)> for MemoryDelta {
    fn from((before, after): (u64, u64)) -> Self {
        Self { before, after }
    }
}

/// Samples the resident memory of the current process.
#[derive(Debug)]
pub struct MemorySampler {
    pid: Pid,
    system: Mutex<System>,
}

impl MemorySampler {
    /// Creates a sampler for the current process.
    ///
    /// Returns `None` on platforms where the process cannot be inspected.
    pub fn new() -> Option<Self> {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(error) => {
                tracing::warn!(error, "memory profiling is not supported on this platform");
                return None;
            }
        };
        Some(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }

    /// Returns the current resident memory in bytes.
    pub fn sample(&self) -> Option<u64> {
        let mut system = self.system.lock().unwrap();
        if !system.refresh_process(self.pid) {
            return None;
        }
        system.process(self.pid).map(|process| process.memory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_signed() {
        assert_eq!(MemoryDelta::from((100, 150)).growth(), 50);
        assert_eq!(MemoryDelta::from((150, 100)).growth(), -50);
    }
}
