//! Request and export flags

use std::fmt;

/// Per-request flags passed down the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFlags(u32);

impl RequestFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Zero request may deallocate the range
    pub const MAY_TRIM: Self = Self(1 << 0);
    /// Force unit access (write-through)
    pub const FUA: Self = Self(1 << 1);
    /// Extents: caller needs only the first extent
    pub const REQ_ONE: Self = Self(1 << 2);
    /// Zero: fail fast instead of falling back to a slow write
    pub const FAST_ZERO: Self = Self(1 << 3);

    /// Create new flags
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Check if no flags are set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Check if all flags in `other` are set
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if only flags in `allowed` are set
    pub fn is_subset_of(&self, allowed: Self) -> bool {
        self.0 & !allowed.0 == 0
    }

    /// Clear the flags in `other`
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Check FUA flag
    pub fn has_fua(&self) -> bool {
        self.contains(Self::FUA)
    }

    /// Check fast zero flag
    pub fn has_fast_zero(&self) -> bool {
        self.contains(Self::FAST_ZERO)
    }

    /// Check may-trim flag
    pub fn has_may_trim(&self) -> bool {
        self.contains(Self::MAY_TRIM)
    }

    /// Check req-one flag
    pub fn has_req_one(&self) -> bool {
        self.contains(Self::REQ_ONE)
    }
}

impl std::ops::BitOr for RequestFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for RequestFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "may_trim={} fua={} req_one={} fast={}",
            self.has_may_trim() as u8,
            self.has_fua() as u8,
            self.has_req_one() as u8,
            self.has_fast_zero() as u8
        )
    }
}

/// NBD transmission flags advertised for an export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionFlags(u16);

impl TransmissionFlags {
    /// Has flags (always set)
    pub const HAS_FLAGS: u16 = 1 << 0;
    /// Read-only export
    pub const READ_ONLY: u16 = 1 << 1;
    /// Send FLUSH command
    pub const SEND_FLUSH: u16 = 1 << 2;
    /// Send FUA (Force Unit Access)
    pub const SEND_FUA: u16 = 1 << 3;
    /// Rotational media (not SSD)
    pub const ROTATIONAL: u16 = 1 << 4;
    /// Send TRIM command
    pub const SEND_TRIM: u16 = 1 << 5;
    /// Send WRITE_ZEROES command
    pub const SEND_WRITE_ZEROES: u16 = 1 << 6;
    /// Send DF (Don't Fragment)
    pub const SEND_DF: u16 = 1 << 7;
    /// Can multi-conn
    pub const CAN_MULTI_CONN: u16 = 1 << 8;
    /// Send resize
    pub const SEND_RESIZE: u16 = 1 << 9;
    /// Send cache
    pub const SEND_CACHE: u16 = 1 << 10;
    /// Send fast zero
    pub const SEND_FAST_ZERO: u16 = 1 << 11;

    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Check if `flag` is set
    pub fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    /// Set `flag` when `cond` holds
    pub fn set_if(&mut self, flag: u16, cond: bool) {
        if cond {
            self.0 |= flag;
        }
    }
}

impl Default for TransmissionFlags {
    fn default() -> Self {
        Self(Self::HAS_FLAGS)
    }
}
