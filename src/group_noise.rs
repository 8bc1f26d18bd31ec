//! Per-cell procedural direction field. Exactly one pattern is active at a
//! time; the field is evaluated once per cell per tick and sampled by every
//! agent in that cell, which gives correlated motion across a school.

use glam::{IVec3, Vec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::grid::GridLayout;
use crate::hash::{hash3, hash_01, hash_unit};
use crate::math::{normalize_or, EPSILON};

/// Settings shared by every pattern.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupNoiseCommon {
    /// Global multiplier on field magnitude.
    pub strength: f32,
    /// Time multiplier for the field's evolution.
    pub time_scale: f32,
    /// Per-cell phase jitter in radians.
    pub cell_jitter: f32,
    pub seed: u32,
}

impl Default for GroupNoiseCommon {
    fn default() -> Self {
        Self {
            strength: 1.0,
            time_scale: 1.0,
            cell_jitter: 0.5,
            seed: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimpleSineNoise {
    pub spatial_frequency: f32,
    pub vertical_scale: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerticalBandsNoise {
    pub band_height: f32,
    /// Heading of even bands in the horizontal plane, radians.
    pub heading: f32,
    pub vertical_amplitude: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VortexNoise {
    pub center: Vec3,
    pub axis: Vec3,
    /// Sign selects the rotation sense.
    pub angular_speed: f32,
    pub radial_pull: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SphereShellNoise {
    pub center: Vec3,
    pub radius: f32,
    pub thickness: f32,
    pub swirl: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum GroupNoisePattern {
    SimpleSine(SimpleSineNoise),
    VerticalBands(VerticalBandsNoise),
    Vortex(VortexNoise),
    SphereShell(SphereShellNoise),
}

/// Cached per-cell directions for the active pattern.
#[derive(Clone, Debug, Default)]
pub struct GroupNoiseField {
    active: Option<(GroupNoiseCommon, GroupNoisePattern)>,
    directions: Vec<Vec3>,
}

impl GroupNoiseField {
    pub fn allocate(layout: &GridLayout) -> Self {
        Self {
            active: None,
            directions: vec![Vec3::ZERO; layout.cell_count()],
        }
    }

    pub fn set(&mut self, common: GroupNoiseCommon, pattern: GroupNoisePattern) {
        self.active = Some((common, pattern));
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.directions.iter_mut().for_each(|d| *d = Vec3::ZERO);
    }

    pub fn active(&self) -> Option<&(GroupNoiseCommon, GroupNoisePattern)> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Re-evaluates every cell at `time`. No-op when no pattern is active.
    pub fn update(&mut self, layout: &GridLayout, time: f32) {
        let Some((common, pattern)) = self.active else {
            return;
        };
        self.directions
            .par_iter_mut()
            .enumerate()
            .for_each(|(cell, direction)| {
                *direction = evaluate(&common, &pattern, layout, cell, time);
            });
    }

    pub fn sample(&self, cell: usize) -> Vec3 {
        self.directions.get(cell).copied().unwrap_or(Vec3::ZERO)
    }
}

fn evaluate(
    common: &GroupNoiseCommon,
    pattern: &GroupNoisePattern,
    layout: &GridLayout,
    cell: usize,
    time: f32,
) -> Vec3 {
    let coord = layout.coord_of(cell);
    let center = layout.cell_center(cell);
    let t = time * common.time_scale;
    let jitter = cell_phase(common.seed, coord) * common.cell_jitter;

    let direction = match *pattern {
        GroupNoisePattern::SimpleSine(sine) => {
            let p = center * sine.spatial_frequency;
            Vec3::new(
                (p.z + t + jitter).sin(),
                (p.x + 0.7 * t + jitter).sin() * sine.vertical_scale,
                (p.y + p.x + 1.3 * t - jitter).cos(),
            )
        }
        GroupNoisePattern::VerticalBands(bands) => {
            let band_height = bands.band_height.max(EPSILON);
            let band = (center.y / band_height).floor() as i32;
            let sign = if band.rem_euclid(2) == 0 { 1.0 } else { -1.0 };
            let heading = bands.heading + jitter * 0.25;
            Vec3::new(
                heading.cos() * sign,
                (t + band as f32 + jitter).sin() * bands.vertical_amplitude,
                heading.sin() * sign,
            )
        }
        GroupNoisePattern::Vortex(vortex) => {
            let axis = normalize_or(vortex.axis, Vec3::Y);
            let offset = center - vortex.center;
            let radial = offset - axis * offset.dot(axis);
            let tangent = normalize_or(axis.cross(radial), Vec3::ZERO) * vortex.angular_speed.signum();
            let inward = normalize_or(-radial, Vec3::ZERO) * vortex.radial_pull;
            let wobble = axis * ((t + jitter).sin() * 0.1);
            tangent * vortex.angular_speed.abs().min(1.0) + inward + wobble
        }
        GroupNoisePattern::SphereShell(shell) => {
            let offset = center - shell.center;
            let distance = offset.length();
            let outward = normalize_or(offset, Vec3::Y);
            let half_thickness = (0.5 * shell.thickness).max(EPSILON);
            let error = distance - shell.radius;
            let radial = -outward * (error / half_thickness).clamp(-1.0, 1.0);
            let swirl_axis = Vec3::new((t * 0.1).sin(), 1.0, (t * 0.1).cos() * 0.2);
            let swirl = normalize_or(swirl_axis.cross(outward), Vec3::ZERO) * shell.swirl;
            radial + swirl
        }
    };

    direction.clamp_length_max(1.0) * common.strength
}

fn cell_phase(seed: u32, coord: IVec3) -> f32 {
    let h = hash3(coord.x as u32, coord.y as u32, coord.z as u32);
    hash_unit(h, seed, 3) * std::f32::consts::PI
}

/// Per-agent view of the cell direction: each agent turns it about Y by a
/// hashed amount that grows with time.
pub fn agent_sample(field_direction: Vec3, agent: u32, time: f32, direction_rate: f32) -> Vec3 {
    if field_direction == Vec3::ZERO {
        return Vec3::ZERO;
    }
    let angle = time * direction_rate * hash_01(agent, 0x6e01, 5);
    let (sin, cos) = angle.sin_cos();
    Vec3::new(
        field_direction.x * cos - field_direction.z * sin,
        field_direction.y,
        field_direction.x * sin + field_direction.z * cos,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;

    fn layout() -> GridLayout {
        GridLayout::new(Vec3::splat(-8.0), 2.0, UVec3::splat(8))
    }

    #[test]
    fn inactive_field_samples_zero() {
        let layout = layout();
        let mut field = GroupNoiseField::allocate(&layout);
        field.update(&layout, 1.0);
        assert_eq!(field.sample(0), Vec3::ZERO);
        assert_eq!(field.sample(usize::MAX), Vec3::ZERO);
    }

    #[test]
    fn field_is_deterministic_and_bounded() {
        let layout = layout();
        let mut a = GroupNoiseField::allocate(&layout);
        let mut b = GroupNoiseField::allocate(&layout);
        let pattern = GroupNoisePattern::SimpleSine(SimpleSineNoise {
            spatial_frequency: 0.3,
            vertical_scale: 0.5,
        });
        a.set(GroupNoiseCommon::default(), pattern);
        b.set(GroupNoiseCommon::default(), pattern);
        a.update(&layout, 2.5);
        b.update(&layout, 2.5);

        for cell in 0..layout.cell_count() {
            assert_eq!(a.sample(cell), b.sample(cell));
            assert!(a.sample(cell).length() <= 1.0 + 1.0e-5);
        }
    }

    #[test]
    fn vortex_circulates_around_axis() {
        let layout = layout();
        let mut field = GroupNoiseField::allocate(&layout);
        field.set(
            GroupNoiseCommon {
                cell_jitter: 0.0,
                ..GroupNoiseCommon::default()
            },
            GroupNoisePattern::Vortex(VortexNoise {
                center: Vec3::ZERO,
                axis: Vec3::Y,
                angular_speed: 1.0,
                radial_pull: 0.0,
            }),
        );
        field.update(&layout, 0.0);

        let cell = layout.cell_id_of(Vec3::new(5.0, 1.0, 1.0));
        let direction = field.sample(cell);
        let offset = layout.cell_center(cell);
        let radial = Vec3::new(offset.x, 0.0, offset.z);
        assert!(direction.length() > 0.5);
        assert!(direction.dot(radial).abs() < 1.0e-3);
    }

    #[test]
    fn vertical_bands_alternate() {
        let layout = layout();
        let mut field = GroupNoiseField::allocate(&layout);
        field.set(
            GroupNoiseCommon {
                cell_jitter: 0.0,
                ..GroupNoiseCommon::default()
            },
            GroupNoisePattern::VerticalBands(VerticalBandsNoise {
                band_height: 2.0,
                heading: 0.0,
                vertical_amplitude: 0.0,
            }),
        );
        field.update(&layout, 0.0);

        let lower = field.sample(layout.cell_id_of(Vec3::new(0.5, 0.5, 0.5)));
        let upper = field.sample(layout.cell_id_of(Vec3::new(0.5, 2.5, 0.5)));
        assert!(lower.x * upper.x < 0.0);
    }

    #[test]
    fn agent_sample_rotates_about_vertical() {
        let field = Vec3::new(1.0, 0.3, 0.0);
        let still = agent_sample(field, 7, 0.0, 2.0);
        assert!((still - field).length() < 1.0e-6);

        let turned = agent_sample(field, 7, 5.0, 2.0);
        assert!((turned.y - 0.3).abs() < 1.0e-6);
        assert!((turned.length() - field.length()).abs() < 1.0e-5);
        assert_eq!(agent_sample(Vec3::ZERO, 7, 5.0, 2.0), Vec3::ZERO);
    }

    #[test]
    fn clear_deactivates_pattern() {
        let layout = layout();
        let mut field = GroupNoiseField::allocate(&layout);
        field.set(
            GroupNoiseCommon::default(),
            GroupNoisePattern::SphereShell(SphereShellNoise {
                center: Vec3::ZERO,
                radius: 4.0,
                thickness: 1.0,
                swirl: 0.5,
            }),
        );
        field.update(&layout, 0.0);
        assert!(field.is_active());
        field.clear();
        assert!(!field.is_active());
        assert_eq!(field.sample(10), Vec3::ZERO);
    }
}
