//! Stateless integer hashing for deterministic per-agent and per-cell variation.

use glam::Vec3;

/// Integer avalanche (lowbias32).
pub fn hash_u32(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

pub fn hash3(a: u32, b: u32, c: u32) -> u32 {
    let h = hash_u32(a.wrapping_add(0x9e37_79b9));
    let h = hash_u32(h ^ b.wrapping_mul(0x85eb_ca6b));
    hash_u32(h ^ c.wrapping_mul(0xc2b2_ae35))
}

/// Uniform value in [-1, 1].
pub fn hash_unit(a: u32, b: u32, c: u32) -> f32 {
    let h = hash3(a, b, c);
    (h >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
}

/// Uniform value in [0, 1).
pub fn hash_01(a: u32, b: u32, c: u32) -> f32 {
    (hash3(a, b, c) >> 8) as f32 / (1u32 << 24) as f32
}

/// Unit direction derived from a seed, never zero.
pub fn hash_direction(seed: u32, salt: u32) -> Vec3 {
    let theta = hash_01(seed, salt, 0) * std::f32::consts::TAU;
    let y = hash_unit(seed, salt, 1);
    let r = (1.0 - y * y).max(0.0).sqrt();
    Vec3::new(r * theta.cos(), y, r * theta.sin())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_unit_is_bounded_and_repeatable() {
        for i in 0..1_000 {
            let v = hash_unit(i, 7, 3);
            assert!((-1.0..=1.0).contains(&v));
            assert_eq!(v, hash_unit(i, 7, 3));
        }
    }

    #[test]
    fn hash_direction_is_unit_length() {
        for i in 0..256 {
            let d = hash_direction(i, 11);
            assert!((d.length() - 1.0).abs() < 1.0e-4);
        }
    }
}
