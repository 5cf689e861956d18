use derive_more::{Add, AddAssign, Sub, SubAssign, Sum};
use serde::{Deserialize, Serialize};

/// Number of units of a resource (cores, devices, MiB of memory, ...)
#[derive(
    Debug,
    Default,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    AddAssign,
    SubAssign,
    Sub,
    Add,
    Sum,
)]
pub struct ResourceAmount(u64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);

    #[inline]
    pub const fn new(units: u64) -> Self {
        ResourceAmount(units)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn saturating_sub(self, other: ResourceAmount) -> ResourceAmount {
        ResourceAmount(self.0.saturating_sub(other.0))
    }
}

impl From<u64> for ResourceAmount {
    #[inline]
    fn from(value: u64) -> Self {
        ResourceAmount(value)
    }
}

impl From<u32> for ResourceAmount {
    #[inline]
    fn from(value: u32) -> Self {
        ResourceAmount(value as u64)
    }
}

impl std::fmt::Display for ResourceAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
