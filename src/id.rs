//! Identifiers shared between processes.

use std::fmt;

/// Public 32-bit identifier of a registered buffer.
///
/// `0` and `u32::MAX` are reserved by the registry (empty and tombstone slot
/// tags) and are never handed out.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, rkyv::Archive, rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct BufferId(u32);

impl BufferId {
    /// Tag of a registry slot that has never been used.
    pub(crate) const EMPTY: u32 = 0;
    /// Tag of a registry slot whose entry was removed.
    pub(crate) const TOMBSTONE: u32 = u32::MAX;

    /// Wrap a raw id. Returns `None` for the reserved values.
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == Self::EMPTY || raw == Self::TOMBSTONE {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// The raw 32-bit value.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// OS process identity used for same-process privilege checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Identity of the calling process.
    pub fn current() -> Self {
        Self(rustix::process::getpid().as_raw_nonzero().get())
    }

    /// Wrap a raw pid.
    ///
    /// Useful for running several logical "processes" inside one test binary.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw pid.
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of an OS shared-memory region, stable across processes.
///
/// The high 32 bits carry the creating process id and the low 32 bits a
/// per-process counter, so handles from different processes never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionHandle(u64);

impl RegionHandle {
    /// Compose a handle from its creating process and a per-process serial.
    pub const fn compose(process: ProcessId, serial: u32) -> Self {
        Self(((process.as_raw() as u32 as u64) << 32) | serial as u64)
    }

    /// Wrap a raw handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_buffer_ids_rejected() {
        assert!(BufferId::new(0).is_none());
        assert!(BufferId::new(u32::MAX).is_none());
        assert_eq!(BufferId::new(7).map(BufferId::as_raw), Some(7));
    }

    #[test]
    fn test_region_handle_compose() {
        let handle = RegionHandle::compose(ProcessId::from_raw(0x1234), 5);
        assert_eq!(handle.as_raw(), 0x0000_1234_0000_0005);
        assert_eq!(handle.to_string(), "0000123400000005");
    }

    #[test]
    fn test_current_process_matches_getpid() {
        let pid = ProcessId::current();
        assert_eq!(pid.as_raw() as u32, std::process::id());
    }
}
