//! Jump consistent hash over MD5-derived seeds.
//!
//! Keys (restaurant ids) map to a bucket in `[0, num_buckets)`. Growing the
//! bucket count from `n` to `n + 1` moves roughly `1 / (n + 1)` of keys, and
//! only to the new bucket.

use crate::defaults::{JUMP_HASH_INCREMENT, JUMP_HASH_MULTIPLIER};

/// 64-bit seed for a key: the first 8 bytes of its MD5 digest, big-endian.
pub fn key_seed(key: &str) -> u64 {
    let digest = md5::compute(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(bytes)
}

/// Lamping–Veach jump consistent hash of a seed.
///
/// Returns 0 when `num_buckets` is 0.
pub fn jump(mut seed: u64, num_buckets: usize) -> usize {
    if num_buckets == 0 {
        return 0;
    }
    let n = num_buckets as i64;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < n {
        b = j;
        seed = seed
            .wrapping_mul(JUMP_HASH_MULTIPLIER)
            .wrapping_add(JUMP_HASH_INCREMENT);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((seed >> 33) + 1) as f64)) as i64;
    }
    (b % n) as usize
}

/// Bucket for a string key.
pub fn jump_hash(key: &str, num_buckets: usize) -> usize {
    jump(key_seed(key), num_buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_seed_is_md5_prefix() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(key_seed(""), 0xd41d8cd98f00b204);
    }

    #[test]
    fn test_single_bucket() {
        for i in 0..100 {
            assert_eq!(jump_hash(&format!("restaurant-{}", i), 1), 0);
        }
    }

    #[test]
    fn test_zero_buckets() {
        assert_eq!(jump_hash("r1", 0), 0);
    }

    #[test]
    fn test_in_range_and_deterministic() {
        for n in 1..=16 {
            for i in 0..200 {
                let key = format!("restaurant-{}", i);
                let a = jump_hash(&key, n);
                assert!(a < n);
                assert_eq!(a, jump_hash(&key, n));
            }
        }
    }

    #[test]
    fn test_keys_spread_over_buckets() {
        let mut counts = [0usize; 4];
        for i in 0..4000 {
            counts[jump_hash(&format!("restaurant-{}", i), 4)] += 1;
        }
        for count in counts {
            assert!(count > 700 && count < 1300, "uneven spread: {:?}", counts);
        }
    }

    #[test]
    fn test_growth_moves_only_to_new_bucket() {
        let mut moved = 0;
        for i in 0..1000 {
            let key = format!("restaurant-{}", i);
            let before = jump_hash(&key, 3);
            let after = jump_hash(&key, 4);
            if before != after {
                assert_eq!(after, 3, "key {} moved between old buckets", key);
                moved += 1;
            }
        }
        // Expected about 250 of 1000.
        assert!(moved > 180 && moved < 320, "moved {}", moved);
    }
}
