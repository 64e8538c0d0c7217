//! Fault injection points for device I/O.
//!
//! Tests arm read or write faults against byte ranges of a physical
//! device's data region; the armed fault makes the next overlapping
//! operation fail with an injected I/O error. Disarmed sets cost one
//! relaxed atomic load on the data path.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct FaultRange {
    offset: u64,
    len: u64,
}

impl FaultRange {
    fn overlaps(&self, offset: u64, len: u64) -> bool {
        offset < self.offset.saturating_add(self.len) && self.offset < offset.saturating_add(len)
    }
}

/// Per-device set of armed I/O faults.
#[derive(Debug, Default)]
pub struct FaultSet {
    armed: AtomicBool,
    read_faults: Mutex<Vec<FaultRange>>,
    write_faults: Mutex<Vec<FaultRange>>,
}

impl FaultSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a read fault over `[offset, offset + len)` of the data region.
    pub fn arm_read_fault(&self, offset: u64, len: u64) {
        self.read_faults.lock().push(FaultRange { offset, len });
        self.armed.store(true, Ordering::Release);
    }

    /// Arm a write fault over `[offset, offset + len)` of the data region.
    pub fn arm_write_fault(&self, offset: u64, len: u64) {
        self.write_faults.lock().push(FaultRange { offset, len });
        self.armed.store(true, Ordering::Release);
    }

    /// Disarm every fault.
    pub fn clear(&self) {
        self.read_faults.lock().clear();
        self.write_faults.lock().clear();
        self.armed.store(false, Ordering::Release);
    }

    pub(crate) fn check_read(&self, dev: &str, offset: u64, len: u64) -> io::Result<()> {
        if !self.armed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self
            .read_faults
            .lock()
            .iter()
            .any(|f| f.overlaps(offset, len))
        {
            warn!(
                target: "strata::device::fault",
                dev,
                offset,
                len,
                "injected_read_fault"
            );
            return Err(io::Error::new(io::ErrorKind::Other, "injected read fault"));
        }
        Ok(())
    }

    pub(crate) fn check_write(&self, dev: &str, offset: u64, len: u64) -> io::Result<()> {
        if !self.armed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self
            .write_faults
            .lock()
            .iter()
            .any(|f| f.overlaps(offset, len))
        {
            warn!(
                target: "strata::device::fault",
                dev,
                offset,
                len,
                "injected_write_fault"
            );
            return Err(io::Error::new(io::ErrorKind::Other, "injected write fault"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarmed_set_passes() {
        let faults = FaultSet::new();
        assert!(faults.check_read("dev0", 0, 4096).is_ok());
        assert!(faults.check_write("dev0", 0, 4096).is_ok());
    }

    #[test]
    fn armed_read_fault_hits_overlap_only() {
        let faults = FaultSet::new();
        faults.arm_read_fault(4096, 4096);
        assert!(faults.check_read("dev0", 0, 4096).is_ok());
        assert!(faults.check_read("dev0", 4096, 512).is_err());
        assert!(faults.check_read("dev0", 8000, 512).is_err());
        assert!(faults.check_read("dev0", 8192, 512).is_ok());
        // Writes unaffected by a read fault.
        assert!(faults.check_write("dev0", 4096, 512).is_ok());

        faults.clear();
        assert!(faults.check_read("dev0", 4096, 512).is_ok());
    }
}
