use glam::Vec3;
use serde::{Deserialize, Serialize};

pub const EPSILON: f32 = 1.0e-6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathMode {
    #[default]
    Accurate,
    Fast,
}

impl MathMode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Fast,
            _ => Self::Accurate,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Accurate => 0,
            Self::Fast => 1,
        }
    }
}

pub fn normalize_to_magnitude(mode: MathMode, v: Vec3, magnitude: f32) -> Vec3 {
    let mag_sq = v.length_squared();
    if mag_sq <= EPSILON {
        return Vec3::ZERO;
    }

    v * (magnitude * inverse_sqrt(mode, mag_sq))
}

pub fn limit_magnitude(mode: MathMode, v: Vec3, max_magnitude: f32) -> Vec3 {
    if max_magnitude <= 0.0 {
        return Vec3::ZERO;
    }

    let mag_sq = v.length_squared();
    if mag_sq <= max_magnitude * max_magnitude {
        return v;
    }

    let limited = v * (max_magnitude * inverse_sqrt(mode, mag_sq));
    // The fast path can overshoot by a hair; clamps are hard guarantees.
    match mode {
        MathMode::Accurate => limited,
        MathMode::Fast => limited.clamp_length_max(max_magnitude),
    }
}

/// Unit vector of `v`, or `fallback` when `v` is (nearly) zero.
pub fn normalize_or(v: Vec3, fallback: Vec3) -> Vec3 {
    let len_sq = v.length_squared();
    if len_sq <= EPSILON {
        return fallback;
    }
    v / len_sq.sqrt()
}

/// Reynolds steering: desired velocity along `desired` at `speed`, minus the
/// current velocity.
pub fn steer_towards(mode: MathMode, desired: Vec3, velocity: Vec3, speed: f32) -> Vec3 {
    if desired.length_squared() <= EPSILON {
        return Vec3::ZERO;
    }
    normalize_to_magnitude(mode, desired, speed) - velocity
}

pub fn saturate(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

pub fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if !value.is_finite() {
        return fallback;
    }
    value.clamp(min, max)
}

pub fn is_finite_vec(v: Vec3) -> bool {
    v.x.is_finite() && v.y.is_finite() && v.z.is_finite()
}

fn inverse_sqrt(mode: MathMode, value: f32) -> f32 {
    match mode {
        MathMode::Accurate => 1.0 / value.sqrt(),
        MathMode::Fast => fast_inverse_sqrt(value),
    }
}

// One Newton-Raphson refinement keeps this fast while staying stable enough
// for steering vectors where small precision drift is acceptable.
fn fast_inverse_sqrt(value: f32) -> f32 {
    let half = 0.5 * value;
    let mut i = value.to_bits();
    i = 0x5f37_59df_u32.wrapping_sub(i >> 1);
    let mut y = f32::from_bits(i);
    y *= 1.5 - half * y * y;
    y.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::{limit_magnitude, normalize_or, normalize_to_magnitude, steer_towards, MathMode};
    use glam::Vec3;

    #[test]
    fn fast_mode_normalize_is_reasonable() {
        let accurate = normalize_to_magnitude(MathMode::Accurate, Vec3::new(3.0, 4.0, 0.0), 10.0);
        let fast = normalize_to_magnitude(MathMode::Fast, Vec3::new(3.0, 4.0, 0.0), 10.0);

        assert!((accurate - fast).abs().max_element() < 0.2);
    }

    #[test]
    fn limited_vector_never_exceeds_bound_in_either_mode() {
        for mode in [MathMode::Accurate, MathMode::Fast] {
            let limited = limit_magnitude(mode, Vec3::new(0.0, 0.0, 10.0), 2.0);
            assert!(limited.length() <= 2.0 + 1.0e-5);
        }
    }

    #[test]
    fn zero_vectors_stay_zero() {
        assert_eq!(normalize_to_magnitude(MathMode::Accurate, Vec3::ZERO, 3.0), Vec3::ZERO);
        assert_eq!(steer_towards(MathMode::Accurate, Vec3::ZERO, Vec3::X, 1.0), Vec3::ZERO);
        assert_eq!(normalize_or(Vec3::ZERO, Vec3::Y), Vec3::Y);
    }

    #[test]
    fn steering_subtracts_current_velocity() {
        let steer = steer_towards(MathMode::Accurate, Vec3::X * 5.0, Vec3::X, 2.0);
        assert!((steer - Vec3::X).length() < 1.0e-5);
    }
}
