//! Proof of work: compact targets, work per block, difficulty retargeting

use crate::constants::*;
use crate::params::ChainParams;
use crate::types::Uint256;
use primitive_types::U256;

/// ExpandTarget: compact bits → target.
///
/// Returns `None` for negative or overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<U256> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let target = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };
    let negative = word != 0 && bits & 0x0080_0000 != 0;
    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    if negative || overflow {
        return None;
    }
    Some(target)
}

/// CompressTarget: target → compact bits
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() as u32 + 7) / 8;
    let mut compact = if size <= 3 {
        target.low_u64() << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3))).low_u64()
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    (compact as u32 & 0x007f_ffff) | (size << 24)
}

/// CheckProofOfWork: hash as a little-endian integer must not exceed the
/// target, and the target must be within the network's limit.
pub fn check_proof_of_work(hash: &Uint256, bits: u32, pow_limit: U256) -> bool {
    let target = match compact_to_target(bits) {
        Some(t) if !t.is_zero() && t <= pow_limit => t,
        _ => return false,
    };
    U256::from_little_endian(&hash.0) <= target
}

/// Expected number of hashes for a block at `bits`: 2^256 / (target + 1)
pub fn block_work(bits: u32) -> U256 {
    match compact_to_target(bits) {
        Some(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

/// Timestamp and bits of an ancestor, looked up by height on the branch
/// being extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AncestorInfo {
    pub time: u32,
    pub bits: u32,
}

/// GetNextWorkRequired: parent × new time → bits
///
/// 1. Off a retarget boundary the parent's bits carry over, except on
///    networks allowing min difficulty: a block more than 20 minutes after
///    its parent may use the limit, otherwise the last non-limit bits of
///    the current period apply
/// 2. On a boundary, scale the parent's target by the actual timespan of
///    the last period, clamped to [timespan/4, timespan*4]
/// 3. Never exceed the network's proof-of-work limit
pub fn get_next_work_required<F>(
    params: &ChainParams,
    parent_height: u32,
    parent: AncestorInfo,
    new_time: u32,
    ancestor: F,
) -> u32
where
    F: Fn(u32) -> Option<AncestorInfo>,
{
    let interval = DIFFICULTY_ADJUSTMENT_INTERVAL;
    if (parent_height + 1) % interval != 0 {
        if params.allow_min_difficulty {
            if new_time > parent.time + 2 * TARGET_TIME_PER_BLOCK {
                return params.pow_limit_bits;
            }
            let mut height = parent_height;
            let mut bits = parent.bits;
            while height > 0 && height % interval != 0 && bits == params.pow_limit_bits {
                height -= 1;
                match ancestor(height) {
                    Some(a) => bits = a.bits,
                    None => break,
                }
            }
            return bits;
        }
        return parent.bits;
    }
    if params.no_retargeting {
        return parent.bits;
    }

    let first_height = parent_height.saturating_sub(interval - 1);
    let first = match ancestor(first_height) {
        Some(a) => a,
        None => return parent.bits,
    };
    let mut actual = parent.time.saturating_sub(first.time);
    actual = actual.clamp(TARGET_TIMESPAN / 4, TARGET_TIMESPAN * 4);

    let old = match compact_to_target(parent.bits) {
        Some(t) => t,
        None => return params.pow_limit_bits,
    };
    let mut new = old.saturating_mul(U256::from(actual)) / U256::from(TARGET_TIMESPAN);
    if new > params.pow_limit {
        new = params.pow_limit;
    }
    target_to_compact(new)
}
