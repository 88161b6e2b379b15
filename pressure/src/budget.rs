//! Memory budget arithmetic

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Amount of memory to hold, minus a safety margin
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SizeBudget {
    /// Amount of memory that was asked for, in bytes
    pub target_bytes: u64,

    /// Safety margin that must be left unallocated, in bytes
    pub headroom_bytes: u64,
}
//
impl SizeBudget {
    /// Set up a memory budget
    pub fn new(target_bytes: u64, headroom_bytes: u64) -> Self {
        Self {
            target_bytes,
            headroom_bytes,
        }
    }

    /// Maximal amount of memory that may be allocated
    ///
    /// This is zero whenever the headroom is at least as large as the target.
    ///
    pub fn ceiling_bytes(&self) -> u64 {
        self.target_bytes.saturating_sub(self.headroom_bytes)
    }
}

/// Display a byte count using binary units, e.g. "64.00 MiB"
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HumanBytes(pub u64);
//
impl Display for HumanBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
        let mut value = self.0 as f64;
        for (idx, unit) in UNITS.iter().enumerate() {
            if value < 1024.0 || idx == UNITS.len() - 1 {
                return write!(f, "{value:.2} {unit}");
            }
            value /= 1024.0;
        }
        unreachable!("The last unit is always used")
    }
}
