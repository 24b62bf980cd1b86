//! Near-time-ordered 32-bit id generation
//!
//! Ids pack `(unix_seconds % cycle)` into the high 19 bits and a
//! per-second sequence counter into the low 12 bits, leaving the sign
//! bit clear. Ids are coarsely ordered by time, unique within a second
//! up to 4096 generations, and wrap with the configured cycle.

use crate::error::PromiseError;
use std::time::{SystemTime, UNIX_EPOCH};

const ID_BITS: u32 = 32;
const TIME_PART_BITS: u32 = 19;
const TIME_PART_MAX: u32 = (1 << TIME_PART_BITS) - 1;
const COUNT_PART_BITS: u32 = ID_BITS - 1 - TIME_PART_BITS;
const COUNT_PART_MAX: u32 = (1 << COUNT_PART_BITS) - 1;

/// Default wraparound period: 6 days, the widest cycle that leaves a
/// comfortable margin inside the 19-bit time window.
pub const DEFAULT_CYCLE: u32 = 6 * 24 * 60 * 60;

/// Generator of near-time-ordered 32-bit ids.
///
/// Not internally synchronized; callers that share one generator guard
/// it with a lock.
#[derive(Debug)]
pub struct IdGenerator {
    cycle: u32,
    last_time: u64,
    count: u32,
}

impl IdGenerator {
    /// Creates a generator with the given wraparound cycle in seconds.
    pub fn new(cycle: u32) -> Result<Self, PromiseError> {
        if cycle < 1 || cycle > TIME_PART_MAX {
            return Err(PromiseError::InvalidCycle(cycle));
        }
        Ok(Self {
            cycle,
            // Sentinel so the first generation starts a fresh tick.
            last_time: u64::MAX,
            count: 0,
        })
    }

    /// Reports whether an id lies within this generator's value range.
    pub fn check(&self, id: u32) -> bool {
        id <= (self.cycle << COUNT_PART_BITS) | COUNT_PART_MAX
    }

    /// Produces the next id for the current wall-clock second.
    pub fn generate(&mut self) -> u32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.generate_at(now)
    }

    /// Core algorithm, parameterized on the clock for testability.
    ///
    /// Counter policy: within one tick the counter increments and resets
    /// to 0 once it overflows its 12-bit width.
    fn generate_at(&mut self, now_secs: u64) -> u32 {
        let time = now_secs % self.cycle as u64;
        if time == self.last_time {
            self.count = (self.count + 1) & COUNT_PART_MAX;
        } else {
            self.count = 0;
            self.last_time = time;
        }
        ((time as u32) << COUNT_PART_BITS) | self.count
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CYCLE).expect("default cycle is within the 19-bit window")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_bounds() {
        assert!(IdGenerator::new(0).is_err());
        assert!(IdGenerator::new(TIME_PART_MAX + 1).is_err());
        assert!(IdGenerator::new(1).is_ok());
        assert!(IdGenerator::new(TIME_PART_MAX).is_ok());
    }

    #[test]
    fn test_check_range() {
        let gen = IdGenerator::new(DEFAULT_CYCLE).unwrap();
        let max = DEFAULT_CYCLE * 4096 + 4095;
        assert!(gen.check(max));
        assert!(!gen.check(max + 1));
    }

    #[test]
    fn test_same_tick_increments_counter() {
        let mut gen = IdGenerator::new(DEFAULT_CYCLE).unwrap();
        let a = gen.generate_at(1000);
        let b = gen.generate_at(1000);
        let c = gen.generate_at(1000);
        assert_eq!(a & COUNT_PART_MAX, 0);
        assert_eq!(b, a + 1);
        assert_eq!(c, a + 2);
    }

    #[test]
    fn test_next_tick_resets_counter() {
        let mut gen = IdGenerator::new(DEFAULT_CYCLE).unwrap();
        gen.generate_at(1000);
        gen.generate_at(1000);
        let next = gen.generate_at(1001);
        assert_eq!(next & COUNT_PART_MAX, 0);
        assert_eq!(next >> COUNT_PART_BITS, 1001);
    }

    #[test]
    fn test_counter_wraps_to_zero() {
        let mut gen = IdGenerator::new(DEFAULT_CYCLE).unwrap();
        let mut id = 0;
        for _ in 0..=COUNT_PART_MAX {
            id = gen.generate_at(50);
        }
        assert_eq!(id & COUNT_PART_MAX, COUNT_PART_MAX);
        let wrapped = gen.generate_at(50);
        assert_eq!(wrapped & COUNT_PART_MAX, 0);
    }

    #[test]
    fn test_time_wraps_with_cycle() {
        let mut gen = IdGenerator::new(100).unwrap();
        let id = gen.generate_at(250);
        assert_eq!(id >> COUNT_PART_BITS, 50);
    }

    #[test]
    fn test_sign_bit_clear() {
        let mut gen = IdGenerator::new(TIME_PART_MAX).unwrap();
        let id = gen.generate_at(TIME_PART_MAX as u64 - 1);
        assert_eq!(id & 0x8000_0000, 0);
    }
}
