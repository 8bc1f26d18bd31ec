//! Environment bounds: wall proximity probe, containment and depth normalization.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::math::{clamp_finite, normalize_or, saturate, EPSILON};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum BoundsShape {
    Box { half_extents: Vec3 },
    Sphere { radius: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentBounds {
    pub center: Vec3,
    pub shape: BoundsShape,
    /// Distance from a wall at which danger starts to rise above zero.
    pub wall_margin: f32,
}

impl Default for EnvironmentBounds {
    fn default() -> Self {
        Self::cuboid(Vec3::ZERO, Vec3::splat(25.0))
    }
}

/// Result of probing one agent position against the walls.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WallProbe {
    /// 0 far from every wall, 1 at (or beyond) a wall.
    pub danger: f32,
    /// Unit vector pointing back into the volume; zero when danger is zero.
    pub inward: Vec3,
}

impl EnvironmentBounds {
    pub fn cuboid(center: Vec3, half_extents: Vec3) -> Self {
        Self {
            center,
            shape: BoundsShape::Box { half_extents },
            wall_margin: 2.0,
        }
    }

    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self {
            center,
            shape: BoundsShape::Sphere { radius },
            wall_margin: 2.0,
        }
    }

    pub fn sanitize(&mut self) {
        self.shape = match self.shape {
            BoundsShape::Box { half_extents } => BoundsShape::Box {
                half_extents: Vec3::new(
                    clamp_finite(half_extents.x, EPSILON, f32::MAX, 1.0),
                    clamp_finite(half_extents.y, EPSILON, f32::MAX, 1.0),
                    clamp_finite(half_extents.z, EPSILON, f32::MAX, 1.0),
                ),
            },
            BoundsShape::Sphere { radius } => BoundsShape::Sphere {
                radius: clamp_finite(radius, EPSILON, f32::MAX, 1.0),
            },
        };
        self.wall_margin = clamp_finite(self.wall_margin, 0.0, f32::MAX, 2.0);
    }

    /// Half extents of the axis-aligned box enclosing the volume.
    pub fn half_extents(&self) -> Vec3 {
        match self.shape {
            BoundsShape::Box { half_extents } => half_extents,
            BoundsShape::Sphere { radius } => Vec3::splat(radius),
        }
    }

    pub fn min_corner(&self) -> Vec3 {
        self.center - self.half_extents()
    }

    pub fn contains(&self, position: Vec3, tolerance: f32) -> bool {
        let local = position - self.center;
        match self.shape {
            BoundsShape::Box { half_extents } => {
                local.abs().cmple(half_extents + Vec3::splat(tolerance)).all()
            }
            BoundsShape::Sphere { radius } => local.length() <= radius + tolerance,
        }
    }

    pub fn probe(&self, position: Vec3) -> WallProbe {
        let margin = self.wall_margin;
        let local = position - self.center;

        match self.shape {
            BoundsShape::Box { half_extents } => {
                let mut inward = Vec3::ZERO;
                let mut danger = 0.0_f32;
                for axis in 0..3 {
                    let gap = half_extents[axis] - local[axis].abs();
                    let axis_danger = wall_danger(gap, margin);
                    if axis_danger > 0.0 {
                        let mut push = Vec3::ZERO;
                        push[axis] = -local[axis].signum() * axis_danger;
                        inward += push;
                        danger = danger.max(axis_danger);
                    }
                }
                if danger <= 0.0 {
                    return WallProbe::default();
                }
                WallProbe {
                    danger,
                    inward: normalize_or(inward, normalize_or(-local, Vec3::ZERO)),
                }
            }
            BoundsShape::Sphere { radius } => {
                let distance = local.length();
                let danger = wall_danger(radius - distance, margin);
                if danger <= 0.0 {
                    return WallProbe::default();
                }
                WallProbe {
                    danger,
                    inward: normalize_or(-local, Vec3::ZERO),
                }
            }
        }
    }

    /// Clamps `position` into the volume and reflects the outward part of
    /// `velocity`, keeping `restitution` of it.
    pub fn contain(&self, position: Vec3, velocity: Vec3, restitution: f32) -> (Vec3, Vec3) {
        let local = position - self.center;

        match self.shape {
            BoundsShape::Box { half_extents } => {
                let mut p = local;
                let mut v = velocity;
                for axis in 0..3 {
                    let limit = half_extents[axis];
                    if p[axis] > limit {
                        p[axis] = limit;
                        if v[axis] > 0.0 {
                            v[axis] = -v[axis] * restitution;
                        }
                    } else if p[axis] < -limit {
                        p[axis] = -limit;
                        if v[axis] < 0.0 {
                            v[axis] = -v[axis] * restitution;
                        }
                    }
                }
                (self.center + p, v)
            }
            BoundsShape::Sphere { radius } => {
                let distance = local.length();
                if distance <= radius {
                    return (position, velocity);
                }
                let normal = local / distance;
                let outward_speed = velocity.dot(normal);
                let v = if outward_speed > 0.0 {
                    velocity - normal * outward_speed * (1.0 + restitution)
                } else {
                    velocity
                };
                (self.center + normal * radius, v)
            }
        }
    }

    /// Normalized depth: 0 at the top of the volume, 1 at the floor.
    pub fn normalized_depth(&self, position: Vec3) -> f32 {
        let half_height = self.half_extents().y;
        if half_height <= EPSILON {
            return 0.0;
        }
        let top = self.center.y + half_height;
        saturate((top - position.y) / (2.0 * half_height))
    }

    /// World-space height of the full depth range.
    pub fn depth_span(&self) -> f32 {
        2.0 * self.half_extents().y
    }
}

fn wall_danger(gap: f32, margin: f32) -> f32 {
    if gap <= 0.0 {
        return 1.0;
    }
    if margin <= EPSILON {
        return 0.0;
    }
    saturate(1.0 - gap / margin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_quiet_in_the_middle_and_dangerous_at_walls() {
        let bounds = EnvironmentBounds::cuboid(Vec3::ZERO, Vec3::splat(10.0));
        assert_eq!(bounds.probe(Vec3::ZERO).danger, 0.0);

        let near = bounds.probe(Vec3::new(9.5, 0.0, 0.0));
        assert!(near.danger > 0.7);
        assert!((near.inward - Vec3::NEG_X).length() < 1.0e-5);

        let outside = bounds.probe(Vec3::new(0.0, -12.0, 0.0));
        assert_eq!(outside.danger, 1.0);
        assert!((outside.inward - Vec3::Y).length() < 1.0e-5);
    }

    #[test]
    fn sphere_probe_points_to_center() {
        let bounds = EnvironmentBounds::sphere(Vec3::new(1.0, 0.0, 0.0), 5.0);
        let probe = bounds.probe(Vec3::new(1.0, 0.0, 4.5));
        assert!(probe.danger > 0.0);
        assert!((probe.inward - Vec3::NEG_Z).length() < 1.0e-5);
    }

    #[test]
    fn contain_clamps_and_reflects_box() {
        let bounds = EnvironmentBounds::cuboid(Vec3::ZERO, Vec3::splat(5.0));
        let (p, v) = bounds.contain(Vec3::new(6.0, 0.0, -7.0), Vec3::new(2.0, 1.0, -1.0), 0.5);
        assert_eq!(p, Vec3::new(5.0, 0.0, -5.0));
        assert_eq!(v, Vec3::new(-1.0, 1.0, 0.5));
    }

    #[test]
    fn contain_projects_onto_sphere() {
        let bounds = EnvironmentBounds::sphere(Vec3::ZERO, 2.0);
        let (p, v) = bounds.contain(Vec3::new(0.0, 3.0, 0.0), Vec3::new(0.0, 1.0, 0.0), 0.0);
        assert!((p - Vec3::new(0.0, 2.0, 0.0)).length() < 1.0e-5);
        assert!(v.y.abs() < 1.0e-5);
    }

    #[test]
    fn depth_is_zero_at_top_and_one_at_floor() {
        let bounds = EnvironmentBounds::cuboid(Vec3::ZERO, Vec3::new(5.0, 10.0, 5.0));
        assert_eq!(bounds.normalized_depth(Vec3::new(0.0, 10.0, 0.0)), 0.0);
        assert_eq!(bounds.normalized_depth(Vec3::new(0.0, -10.0, 0.0)), 1.0);
        assert!((bounds.normalized_depth(Vec3::ZERO) - 0.5).abs() < 1.0e-6);
    }
}
