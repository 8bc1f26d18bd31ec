use serde::{Deserialize, Serialize};

use crate::log::{LogCategory, SimLogger};
use crate::math::{clamp_finite, EPSILON};

/// Relationship masks address at most this many behaviour types.
pub const MAX_RELATIONSHIP_TYPES: usize = 32;

const MAX_WEIGHT: f32 = 1_000.0;
const MAX_RADIUS: f32 = 10_000.0;

/// Parameter set shared by every agent of one type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviourSettings {
    pub name: String,

    pub max_speed: f32,
    pub max_acceleration: f32,
    pub desired_speed: f32,
    pub propulsion_weight: f32,

    pub neighbour_radius: f32,
    pub separation_radius: f32,
    pub body_radius: f32,

    pub alignment_weight: f32,
    pub cohesion_weight: f32,
    pub separation_weight: f32,
    pub influence_weight: f32,
    pub leadership_weight: f32,
    pub group_flow_weight: f32,

    /// Bit `t` set: agents of type `t` school with this one.
    pub group_mask: u32,
    /// Bit `t` set: this type and type `t` avoid each other, weaker yields.
    pub avoid_mask: u32,
    /// Bit `t` set: mild weaker-yields repulsion with type `t`.
    pub neutral_mask: u32,
    pub avoidance_weight: f32,
    pub avoid_response: f32,
    pub neutral_weight: f32,

    /// Target spacing as a multiple of the combined body radius.
    pub schooling_spacing: f32,
    /// Attraction reaches out to `schooling_outer * target` spacing.
    pub schooling_outer: f32,
    pub schooling_inner_softness: f32,
    pub schooling_deadzone_fraction: f32,
    pub schooling_radial_damping: f32,

    pub bounds_weight: f32,
    pub bounds_influence_suppression: f32,
    pub bounds_tangential_damping: f32,

    pub obstacle_avoid_weight: f32,
    pub attraction_weight: f32,
    pub group_attraction_weight: f32,

    pub wander_strength: f32,
    pub wander_frequency: f32,
    pub group_noise_strength: f32,
    pub group_noise_direction_rate: f32,
    pub group_noise_speed_weight: f32,
    pub pattern_weight: f32,

    pub min_group_size: u32,
    pub min_group_size_weight: f32,
    pub loner_cohesion_boost: f32,
    /// Zero disables the overcrowding penalty.
    pub max_group_size: u32,
    pub max_group_size_weight: f32,
    pub overcrowd_separation_boost: f32,
    pub overcrowd_cohesion_penalty: f32,

    pub split_panic_threshold: f32,
    pub split_lateral_weight: f32,
    pub split_accel_boost: f32,

    pub use_preferred_depth: bool,
    /// Normalized depth: 0 at the top of the bounds, 1 at the floor.
    pub preferred_depth_min: f32,
    pub preferred_depth_max: f32,
    pub preferred_depth_weight: f32,
    pub preferred_depth_bias: f32,
    pub preferred_depth_edge_fraction: f32,
    pub depth_wins_over_attractor: bool,

    /// Zero means unlimited.
    pub max_neighbour_checks: u32,
    pub max_friendly_samples: u32,
    pub max_separation_samples: u32,
}

impl Default for BehaviourSettings {
    fn default() -> Self {
        Self {
            name: String::from("fish"),
            max_speed: 3.0,
            max_acceleration: 6.0,
            desired_speed: 1.5,
            propulsion_weight: 1.0,
            neighbour_radius: 3.0,
            separation_radius: 0.6,
            body_radius: 0.25,
            alignment_weight: 1.0,
            cohesion_weight: 0.8,
            separation_weight: 1.5,
            influence_weight: 1.0,
            leadership_weight: 1.0,
            group_flow_weight: 0.3,
            group_mask: 0,
            avoid_mask: 0,
            neutral_mask: 0,
            avoidance_weight: 0.0,
            avoid_response: 1.0,
            neutral_weight: 0.0,
            schooling_spacing: 1.5,
            schooling_outer: 2.5,
            schooling_inner_softness: 0.5,
            schooling_deadzone_fraction: 0.05,
            schooling_radial_damping: 0.3,
            bounds_weight: 1.0,
            bounds_influence_suppression: 0.7,
            bounds_tangential_damping: 0.5,
            obstacle_avoid_weight: 2.0,
            attraction_weight: 1.0,
            group_attraction_weight: 0.5,
            wander_strength: 0.2,
            wander_frequency: 0.5,
            group_noise_strength: 0.0,
            group_noise_direction_rate: 0.0,
            group_noise_speed_weight: 0.0,
            pattern_weight: 1.0,
            min_group_size: 3,
            min_group_size_weight: 1.0,
            loner_cohesion_boost: 1.0,
            max_group_size: 0,
            max_group_size_weight: 1.0,
            overcrowd_separation_boost: 1.0,
            overcrowd_cohesion_penalty: 0.5,
            split_panic_threshold: 0.6,
            split_lateral_weight: 0.8,
            split_accel_boost: 0.5,
            use_preferred_depth: false,
            preferred_depth_min: 0.0,
            preferred_depth_max: 1.0,
            preferred_depth_weight: 1.0,
            preferred_depth_bias: 1.0,
            preferred_depth_edge_fraction: 0.1,
            depth_wins_over_attractor: false,
            max_neighbour_checks: 0,
            max_friendly_samples: 0,
            max_separation_samples: 0,
        }
    }
}

impl BehaviourSettings {
    pub fn sanitize(&mut self) {
        let d = Self::default();

        self.max_speed = weight(self.max_speed, d.max_speed);
        self.max_acceleration = weight(self.max_acceleration, d.max_acceleration);
        self.desired_speed = clamp_finite(self.desired_speed, 0.0, self.max_speed, 0.0);
        self.propulsion_weight = weight(self.propulsion_weight, d.propulsion_weight);

        self.neighbour_radius = radius(self.neighbour_radius, d.neighbour_radius);
        self.separation_radius = radius(self.separation_radius, d.separation_radius);
        self.body_radius = radius(self.body_radius, d.body_radius);

        self.alignment_weight = weight(self.alignment_weight, d.alignment_weight);
        self.cohesion_weight = weight(self.cohesion_weight, d.cohesion_weight);
        self.separation_weight = weight(self.separation_weight, d.separation_weight);
        self.influence_weight = weight(self.influence_weight, d.influence_weight);
        self.leadership_weight = weight(self.leadership_weight, d.leadership_weight);
        self.group_flow_weight = weight(self.group_flow_weight, d.group_flow_weight);

        self.avoidance_weight = weight(self.avoidance_weight, d.avoidance_weight);
        self.avoid_response = weight(self.avoid_response, d.avoid_response);
        self.neutral_weight = weight(self.neutral_weight, d.neutral_weight);

        self.schooling_spacing = weight(self.schooling_spacing, d.schooling_spacing);
        self.schooling_outer = clamp_finite(self.schooling_outer, 1.0, MAX_WEIGHT, d.schooling_outer);
        self.schooling_inner_softness =
            clamp_finite(self.schooling_inner_softness, 0.0, 1.0, d.schooling_inner_softness);
        self.schooling_deadzone_fraction = clamp_finite(
            self.schooling_deadzone_fraction,
            0.0,
            0.5,
            d.schooling_deadzone_fraction,
        );
        self.schooling_radial_damping =
            clamp_finite(self.schooling_radial_damping, 0.0, 1.0, d.schooling_radial_damping);

        self.bounds_weight = weight(self.bounds_weight, d.bounds_weight);
        self.bounds_influence_suppression = clamp_finite(
            self.bounds_influence_suppression,
            0.0,
            1.0,
            d.bounds_influence_suppression,
        );
        self.bounds_tangential_damping =
            weight(self.bounds_tangential_damping, d.bounds_tangential_damping);

        self.obstacle_avoid_weight = weight(self.obstacle_avoid_weight, d.obstacle_avoid_weight);
        self.attraction_weight = weight(self.attraction_weight, d.attraction_weight);
        self.group_attraction_weight =
            weight(self.group_attraction_weight, d.group_attraction_weight);

        self.wander_strength = weight(self.wander_strength, d.wander_strength);
        self.wander_frequency = weight(self.wander_frequency, d.wander_frequency);
        self.group_noise_strength = weight(self.group_noise_strength, d.group_noise_strength);
        self.group_noise_direction_rate = clamp_finite(
            self.group_noise_direction_rate,
            -MAX_WEIGHT,
            MAX_WEIGHT,
            d.group_noise_direction_rate,
        );
        self.group_noise_speed_weight =
            weight(self.group_noise_speed_weight, d.group_noise_speed_weight);
        self.pattern_weight = weight(self.pattern_weight, d.pattern_weight);

        self.min_group_size_weight = weight(self.min_group_size_weight, d.min_group_size_weight);
        self.loner_cohesion_boost = weight(self.loner_cohesion_boost, d.loner_cohesion_boost);
        self.max_group_size_weight = weight(self.max_group_size_weight, d.max_group_size_weight);
        self.overcrowd_separation_boost =
            weight(self.overcrowd_separation_boost, d.overcrowd_separation_boost);
        self.overcrowd_cohesion_penalty =
            weight(self.overcrowd_cohesion_penalty, d.overcrowd_cohesion_penalty);
        if self.max_group_size > 0 {
            self.max_group_size = self.max_group_size.max(self.min_group_size);
        }

        self.split_panic_threshold =
            clamp_finite(self.split_panic_threshold, 0.0, 1.0, d.split_panic_threshold);
        self.split_lateral_weight = weight(self.split_lateral_weight, d.split_lateral_weight);
        self.split_accel_boost = weight(self.split_accel_boost, d.split_accel_boost);

        self.preferred_depth_min =
            clamp_finite(self.preferred_depth_min, 0.0, 1.0, d.preferred_depth_min);
        self.preferred_depth_max =
            clamp_finite(self.preferred_depth_max, 0.0, 1.0, d.preferred_depth_max);
        if self.preferred_depth_min > self.preferred_depth_max {
            std::mem::swap(&mut self.preferred_depth_min, &mut self.preferred_depth_max);
        }
        self.preferred_depth_weight =
            weight(self.preferred_depth_weight, d.preferred_depth_weight);
        self.preferred_depth_bias = weight(self.preferred_depth_bias, d.preferred_depth_bias);
        self.preferred_depth_edge_fraction = clamp_finite(
            self.preferred_depth_edge_fraction,
            0.0,
            0.5,
            d.preferred_depth_edge_fraction,
        );
    }

    /// Logs configuration problems that leave agents unable to move or perceive.
    pub fn validate(&self, index: usize, logger: &SimLogger) {
        if self.max_speed <= EPSILON {
            logger.warn(
                LogCategory::Behaviour,
                format_args!("behaviour {index} ({}) has zero max speed", self.name),
            );
        }
        if self.max_acceleration <= EPSILON {
            logger.warn(
                LogCategory::Behaviour,
                format_args!("behaviour {index} ({}) has zero max acceleration", self.name),
            );
        }
        if self.neighbour_radius <= EPSILON {
            logger.warn(
                LogCategory::Behaviour,
                format_args!("behaviour {index} ({}) has zero neighbour radius", self.name),
            );
        }
    }

    pub fn affinity_bit(behaviour_id: usize) -> u32 {
        if behaviour_id < MAX_RELATIONSHIP_TYPES {
            1 << behaviour_id
        } else {
            0
        }
    }
}

fn weight(value: f32, fallback: f32) -> f32 {
    clamp_finite(value, 0.0, MAX_WEIGHT, fallback)
}

fn radius(value: f32, fallback: f32) -> f32 {
    clamp_finite(value, 0.0, MAX_RADIUS, fallback)
}

/// Sanitized behaviours plus values derived once at initialize.
#[derive(Clone, Debug, Default)]
pub struct BehaviourTable {
    settings: Vec<BehaviourSettings>,
    cell_search_radius: Vec<i32>,
    max_body_radius: f32,
    max_neighbour_radius: f32,
}

impl BehaviourTable {
    pub fn new(mut settings: Vec<BehaviourSettings>, logger: &SimLogger) -> Self {
        if settings.len() > MAX_RELATIONSHIP_TYPES {
            logger.warn(
                LogCategory::Behaviour,
                format_args!(
                    "{} behaviours configured; relationship masks only address the first {}",
                    settings.len(),
                    MAX_RELATIONSHIP_TYPES
                ),
            );
        }

        for (index, behaviour) in settings.iter_mut().enumerate() {
            behaviour.sanitize();
            behaviour.validate(index, logger);
        }

        let max_body_radius = settings
            .iter()
            .map(|b| b.body_radius)
            .fold(0.0_f32, f32::max);
        let max_neighbour_radius = settings
            .iter()
            .map(|b| b.neighbour_radius)
            .fold(0.0_f32, f32::max);

        Self {
            settings,
            cell_search_radius: Vec::new(),
            max_body_radius,
            max_neighbour_radius,
        }
    }

    /// Derives `ceil(neighbour_radius / cell_size)`, at least one cell.
    pub fn derive_search_radii(&mut self, cell_size: f32) {
        self.cell_search_radius = self
            .settings
            .iter()
            .map(|b| cell_search_radius(b.neighbour_radius, cell_size))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&BehaviourSettings> {
        self.settings.get(id as usize)
    }

    pub fn search_radius(&self, id: u32) -> i32 {
        self.cell_search_radius.get(id as usize).copied().unwrap_or(1)
    }

    pub fn body_radius(&self, id: u32) -> f32 {
        self.get(id).map_or(0.0, |b| b.body_radius)
    }

    pub fn max_body_radius(&self) -> f32 {
        self.max_body_radius
    }

    pub fn max_neighbour_radius(&self) -> f32 {
        self.max_neighbour_radius
    }
}

pub fn cell_search_radius(neighbour_radius: f32, cell_size: f32) -> i32 {
    if cell_size <= EPSILON {
        return 1;
    }
    ((neighbour_radius / cell_size).ceil() as i32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_weights_and_ratios() {
        let mut settings = BehaviourSettings {
            max_speed: -4.0,
            separation_weight: f32::NAN,
            schooling_inner_softness: 3.0,
            schooling_deadzone_fraction: 0.9,
            preferred_depth_min: 0.8,
            preferred_depth_max: 0.2,
            desired_speed: 50.0,
            ..BehaviourSettings::default()
        };
        settings.sanitize();

        assert_eq!(settings.max_speed, 0.0);
        assert_eq!(settings.separation_weight, 1.5);
        assert_eq!(settings.schooling_inner_softness, 1.0);
        assert_eq!(settings.schooling_deadzone_fraction, 0.5);
        assert_eq!(settings.preferred_depth_min, 0.2);
        assert_eq!(settings.preferred_depth_max, 0.8);
        assert_eq!(settings.desired_speed, 0.0);
    }

    #[test]
    fn default_hard_separation_sits_inside_schooling_band() {
        let fish = BehaviourSettings::default();
        let band = crate::aggregate::SchoolingBand::between(&fish, &fish);
        let hard = fish.separation_radius.max(2.0 * fish.body_radius);
        assert!(hard < band.inner_edge(), "{hard} >= {}", band.inner_edge());
    }

    #[test]
    fn search_radius_rounds_up_with_minimum_one() {
        assert_eq!(cell_search_radius(3.0, 3.0), 1);
        assert_eq!(cell_search_radius(3.1, 3.0), 2);
        assert_eq!(cell_search_radius(0.0, 3.0), 1);
        assert_eq!(cell_search_radius(7.0, 2.0), 4);
    }

    #[test]
    fn table_tracks_largest_radii() {
        let small = BehaviourSettings {
            body_radius: 0.2,
            neighbour_radius: 2.0,
            ..BehaviourSettings::default()
        };
        let large = BehaviourSettings {
            body_radius: 1.5,
            neighbour_radius: 6.0,
            ..BehaviourSettings::default()
        };
        let mut table = BehaviourTable::new(vec![small, large], &SimLogger::silent());
        table.derive_search_radii(2.0);

        assert_eq!(table.max_body_radius(), 1.5);
        assert_eq!(table.max_neighbour_radius(), 6.0);
        assert_eq!(table.search_radius(0), 1);
        assert_eq!(table.search_radius(1), 3);
        assert_eq!(table.body_radius(7), 0.0);
    }

    #[test]
    fn affinity_bits_ignore_types_past_the_mask_width() {
        assert_eq!(BehaviourSettings::affinity_bit(0), 1);
        assert_eq!(BehaviourSettings::affinity_bit(31), 1 << 31);
        assert_eq!(BehaviourSettings::affinity_bit(32), 0);
    }
}
