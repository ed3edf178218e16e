use log::info;
use num_bigint::BigUint;
use std::fmt;

/// Retarget happens at block ids that are multiples of this
pub const RETARGET_INTERVAL: u32 = 60;
/// Trailing window, in seconds, over which block production is counted
pub const RETARGET_WINDOW_SECS: u64 = 3600;
/// More blocks than this in the window makes the target harder
const FAST_BLOCK_COUNT: u32 = 70;
/// Fewer blocks than this in the window makes the target easier
const SLOW_BLOCK_COUNT: u32 = 50;

/// 256-bit big-endian difficulty target. A block hash must be numerically
/// less than or equal to it; smaller means harder.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target([u8; 32]);

impl Target {
    /// Hardest allowed target, `0x00..00FFFF`
    pub const HARDEST: Target = Target(hardest_bytes());
    /// Easiest allowed target and the genesis target, `0x000FFF..FF`
    pub const EASIEST: Target = Target(easiest_bytes());

    pub fn from_bytes(bytes: [u8; 32]) -> Target {
        Target(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Big-endian byte arrays of equal length compare like the integers they encode
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        hash <= &self.0
    }

    fn to_biguint(self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    fn from_biguint(value: &BigUint) -> Target {
        let bytes = value.to_bytes_be();
        let mut out = [0u8; 32];
        let len = bytes.len().min(32);
        out[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
        Target(out)
    }

    /// Half the target, clamped at the hardest bound
    pub fn harder(&self) -> Target {
        let halved = Self::from_biguint(&(self.to_biguint() >> 1u32));
        halved.max(Self::HARDEST)
    }

    /// Double the target plus one, clamped at the easiest bound
    pub fn easier(&self) -> Target {
        let doubled = (self.to_biguint() << 1u32) | BigUint::from(1u8);
        if doubled >= Self::EASIEST.to_biguint() {
            return Self::EASIEST;
        }
        Self::from_biguint(&doubled)
    }
}

const fn hardest_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[30] = 0xFF;
    bytes[31] = 0xFF;
    bytes
}

const fn easiest_bytes() -> [u8; 32] {
    let mut bytes = [0xFFu8; 32];
    bytes[0] = 0x00;
    bytes[1] = 0x0F;
    bytes
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({self})")
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&data_encoding::HEXLOWER.encode(&self.0))
    }
}

/// Target required for block `block_id`, given the previous block's target
/// and how many blocks landed in the trailing hour ending at the previous
/// block's time. Only ids divisible by [`RETARGET_INTERVAL`] may change it.
pub fn next_target(block_id: u32, previous: &Target, blocks_in_window: u32) -> Target {
    if block_id == 0 || block_id % RETARGET_INTERVAL != 0 {
        return *previous;
    }
    let next = if blocks_in_window > FAST_BLOCK_COUNT && *previous > Target::HARDEST {
        previous.harder()
    } else if blocks_in_window < SLOW_BLOCK_COUNT && *previous < Target::EASIEST {
        previous.easier()
    } else {
        *previous
    };
    if next != *previous {
        info!("Retarget at block {block_id}: {blocks_in_window} blocks in window, {previous} -> {next}");
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn low_bits_target(bits: u32) -> Target {
        let value = (BigUint::from(1u8) << bits) - BigUint::from(1u8);
        Target::from_biguint(&value)
    }

    #[test]
    fn test_bounds() {
        assert!(Target::HARDEST < Target::EASIEST);
        assert_eq!(Target::HARDEST, low_bits_target(16));
        assert_eq!(Target::EASIEST, low_bits_target(244));
        assert_eq!(Target::HARDEST.harder(), Target::HARDEST);
        assert_eq!(Target::EASIEST.easier(), Target::EASIEST);
    }

    #[test]
    fn test_is_met_by() {
        let target = Target::HARDEST;
        let mut hash = [0u8; 32];
        hash[31] = 0xFF;
        hash[30] = 0xFF;
        assert!(target.is_met_by(&hash));
        hash[29] = 0x01;
        assert!(!target.is_met_by(&hash));
    }

    #[test]
    fn test_only_retarget_ids_change() {
        let previous = low_bits_target(100);
        assert_eq!(next_target(59, &previous, 500), previous);
        assert_eq!(next_target(61, &previous, 0), previous);
        assert_eq!(next_target(0, &previous, 500), previous);
        assert_eq!(next_target(60, &previous, 71), low_bits_target(99));
        assert_eq!(next_target(60, &previous, 49), low_bits_target(101));
        assert_eq!(next_target(60, &previous, 70), previous);
        assert_eq!(next_target(60, &previous, 50), previous);
    }

    #[test]
    fn test_fast_blocks_harden_monotonically_until_bound() {
        let mut target = low_bits_target(20);
        let mut previous_step = target;
        let mut reached_bound_at = None;
        for block_id in 1..=600u32 {
            let next = next_target(block_id, &target, 80);
            if block_id % RETARGET_INTERVAL == 0 {
                if previous_step > Target::HARDEST {
                    assert!(next < previous_step, "block {block_id} did not harden");
                } else {
                    assert_eq!(next, Target::HARDEST);
                }
                if next == Target::HARDEST && reached_bound_at.is_none() {
                    reached_bound_at = Some(block_id);
                }
                previous_step = next;
            } else {
                assert_eq!(next, target);
            }
            target = next;
        }
        assert_eq!(reached_bound_at, Some(240));
        assert_eq!(target, Target::HARDEST);
    }

    #[test]
    fn test_slow_blocks_ease_until_bound() {
        let mut target = low_bits_target(240);
        for step in 1..=10u32 {
            target = next_target(step * RETARGET_INTERVAL, &target, 10);
        }
        assert_eq!(target, Target::EASIEST);
    }

    #[test]
    fn test_easier_clamps_odd_targets() {
        let nearly_easiest = Target::from_biguint(&(Target::EASIEST.to_biguint() - 5u32));
        assert_eq!(nearly_easiest.easier(), Target::EASIEST);
        let nearly_hardest = Target::from_biguint(&(Target::HARDEST.to_biguint() + 1u32));
        assert_eq!(nearly_hardest.harder(), Target::HARDEST);
    }
}
