//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep core ids, core sets and time values apart in
//! function signatures.

use std::fmt;

use memlat_common::MAX_CPUS;
use serde::Serialize;

/// CPU ID
///
/// Represents a CPU core ID (0, 1, 2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Returns true if this core fits in a [`CpuMask`]
    #[must_use]
    pub fn fits_mask(self) -> bool {
        (self.0 as usize) < MAX_CPUS
    }

    /// Position of this core in a per-cpu array
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Set of cores, one bit per core id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask(pub u64);

impl CpuMask {
    pub const EMPTY: CpuMask = CpuMask(0);

    /// Build a mask from core ids (panics if a core does not fit)
    pub fn from_cpus(cpus: impl IntoIterator<Item = CpuId>) -> Self {
        let mut mask = Self::EMPTY;
        for cpu in cpus {
            mask.insert(cpu);
        }
        mask
    }

    /// Single-core mask (panics if the core does not fit)
    #[must_use]
    pub fn bit(cpu: CpuId) -> Self {
        assert!(cpu.fits_mask(), "{cpu} does not fit in a CpuMask");
        CpuMask(1u64 << cpu.0)
    }

    pub fn insert(&mut self, cpu: CpuId) {
        self.0 |= Self::bit(cpu).0;
    }

    pub fn remove(&mut self, cpu: CpuId) {
        if cpu.fits_mask() {
            self.0 &= !(1u64 << cpu.0);
        }
    }

    #[must_use]
    pub fn contains(self, cpu: CpuId) -> bool {
        cpu.fits_mask() && self.0 & (1u64 << cpu.0) != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest core in the set
    #[must_use]
    pub fn first(self) -> Option<CpuId> {
        (!self.is_empty()).then(|| CpuId(self.0.trailing_zeros()))
    }

    /// Highest core in the set
    #[must_use]
    pub fn last(self) -> Option<CpuId> {
        (!self.is_empty()).then(|| CpuId(63 - self.0.leading_zeros()))
    }

    #[must_use]
    pub fn intersection(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    #[must_use]
    pub fn difference(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & !other.0)
    }

    /// Cores in ascending order
    #[must_use]
    pub fn iter(self) -> CpuMaskIter {
        CpuMaskIter(self.0)
    }
}

impl IntoIterator for CpuMask {
    type Item = CpuId;
    type IntoIter = CpuMaskIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        Self::from_cpus(iter)
    }
}

/// Ascending iterator over the cores of a [`CpuMask`]
#[derive(Debug, Clone)]
pub struct CpuMaskIter(u64);

impl Iterator for CpuMaskIter {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(CpuId(cpu))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for CpuMaskIter {}

/// Formats as a cpu list, e.g. `0-3,6`
impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.iter().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while let Some(&next) = cpus.peek() {
                if next.0 != end.0 + 1 {
                    break;
                }
                end = next;
                cpus.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start.0)?;
            } else {
                write!(f, "{}-{}", start.0, end.0)?;
            }
        }
        Ok(())
    }
}

/// Monotonic time in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct Micros(pub u64);

impl Micros {
    /// Time elapsed since `earlier`, floored at 1us so it can divide
    #[must_use]
    pub fn elapsed_since(self, earlier: Micros) -> u64 {
        self.0.saturating_sub(earlier.0).max(1)
    }

    /// Convert to milliseconds (f64)
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000.0
    }
}

impl fmt::Display for Micros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_id_display() {
        assert_eq!(CpuId(5).to_string(), "CPU:5");
    }

    #[test]
    fn test_mask_iterates_ascending() {
        let mask = CpuMask::from_cpus([CpuId(6), CpuId(0), CpuId(3)]);
        let cpus: Vec<u32> = mask.iter().map(|c| c.0).collect();
        assert_eq!(cpus, vec![0, 3, 6]);
        assert_eq!(mask.len(), 3);
        assert_eq!(mask.first(), Some(CpuId(0)));
        assert_eq!(mask.last(), Some(CpuId(6)));
    }

    #[test]
    fn test_mask_set_operations() {
        let mut mask = CpuMask(0b1111);
        mask.remove(CpuId(2));
        assert!(!mask.contains(CpuId(2)));
        assert!(mask.contains(CpuId(3)));
        assert_eq!(mask.intersection(CpuMask(0b0011)), CpuMask(0b0011));
        assert_eq!(mask.difference(CpuMask(0b0001)), CpuMask(0b1010));
        assert!(!mask.contains(CpuId(64)));
    }

    #[test]
    fn test_mask_display_collapses_ranges() {
        let mask = CpuMask::from_cpus([0, 1, 2, 3, 6, 8, 9].map(CpuId));
        assert_eq!(mask.to_string(), "0-3,6,8-9");
        assert_eq!(CpuMask::EMPTY.to_string(), "");
    }

    #[test]
    #[should_panic(expected = "does not fit in a CpuMask")]
    fn test_mask_rejects_large_cpu() {
        let _ = CpuMask::bit(CpuId(64));
    }

    #[test]
    fn test_elapsed_floor() {
        assert_eq!(Micros(10).elapsed_since(Micros(10)), 1);
        assert_eq!(Micros(5).elapsed_since(Micros(10)), 1);
        assert_eq!(Micros(1_010).elapsed_since(Micros(10)), 1_000);
    }
}
