//! Steering and integration. `integrate_velocity` is a pure function of one
//! agent's inputs; `integrate_positions` runs afterwards over the new
//! velocities and keeps every agent inside the bounds.

use glam::Vec3;
use rayon::prelude::*;

use crate::aggregate::NeighbourAggregate;
use crate::behaviour::{BehaviourSettings, BehaviourTable};
use crate::environment::{EnvironmentBounds, WallProbe};
use crate::grid::GridLayout;
use crate::group_noise::{agent_sample, GroupNoiseField};
use crate::hash::{hash_direction, hash_u32};
use crate::math::{limit_magnitude, normalize_or, saturate, steer_towards, MathMode, EPSILON};

/// Smallest group that can split when panicking.
const MIN_SPLIT_GROUP: u32 = 3;
const EDGE_BIAS_SCALE: f32 = 0.5;

/// Read-only view of everything the steering pass needs.
pub struct SteeringInputs<'a> {
    pub behaviours: &'a BehaviourTable,
    pub bounds: &'a EnvironmentBounds,
    pub layout: &'a GridLayout,
    pub math_mode: MathMode,
    pub global_damping: f32,
    pub positions: &'a [Vec3],
    pub velocities: &'a [Vec3],
    pub behaviour_ids: &'a [u32],
    pub aggregates: &'a [NeighbourAggregate],
    pub wall_probes: &'a [WallProbe],
    pub obstacle_steering: &'a [Vec3],
    pub attraction_steering: &'a [Vec3],
    pub pattern_steering: &'a [Vec3],
    pub group_noise: &'a GroupNoiseField,
    pub time: f32,
    pub dt: f32,
}

/// Clamped acceleration for one agent plus the limits it was clamped to.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Acceleration {
    pub value: Vec3,
    pub max_speed: f32,
    pub max_acceleration: f32,
}

/// Writes the next velocity of every agent into `out`.
pub fn integrate_velocities(inputs: &SteeringInputs<'_>, out: &mut [Vec3]) {
    out.par_iter_mut()
        .enumerate()
        .for_each(|(i, velocity)| *velocity = integrate_velocity(inputs, i));
}

pub fn integrate_velocity(inputs: &SteeringInputs<'_>, i: usize) -> Vec3 {
    let velocity = inputs.velocities[i];
    let Some(behaviour) = inputs
        .behaviour_ids
        .get(i)
        .and_then(|&id| inputs.behaviours.get(id))
    else {
        return velocity;
    };
    let Some(agg) = inputs.aggregates.get(i) else {
        return velocity;
    };

    let mode = inputs.math_mode;
    let dt = inputs.dt;
    let accel = acceleration(inputs, behaviour, agg, i);

    let mut v = velocity + accel.value * dt;
    v = limit_magnitude(mode, v, accel.max_speed);
    v *= (-inputs.global_damping * dt).exp();

    if behaviour.use_preferred_depth {
        v.y = preferred_depth_bias(inputs.bounds, behaviour, inputs.positions[i], v.y, accel.max_speed, dt);
    }

    let probe = inputs.wall_probes.get(i).copied().unwrap_or_default();
    if probe.danger > 0.0 {
        let normal_part = probe.inward * v.dot(probe.inward);
        let tangential = v - normal_part;
        let keep = 1.0 - saturate(probe.danger * behaviour.bounds_tangential_damping * dt);
        v = normal_part + tangential * keep;
    }

    limit_magnitude(mode, v, accel.max_speed)
}

/// Steps 1 to 6 of the pipeline: everything that produces an acceleration.
pub fn acceleration(
    inputs: &SteeringInputs<'_>,
    behaviour: &BehaviourSettings,
    agg: &NeighbourAggregate,
    i: usize,
) -> Acceleration {
    let mode = inputs.math_mode;
    let position = inputs.positions[i];
    let velocity = inputs.velocities[i];
    let max_accel = behaviour.max_acceleration;
    let desired_speed = behaviour.desired_speed;

    let group_size = agg.friendly_count + 1;
    let pressure = GroupPressure::new(behaviour, group_size);

    let mut flock = Vec3::ZERO;
    if agg.leader_count > 0 {
        let inv = 1.0 / agg.leader_count as f32;
        let heading = agg.alignment * inv;
        let center = agg.cohesion * inv;
        flock += steer_towards(mode, heading, velocity, desired_speed) * pressure.alignment;
        flock += steer_towards(mode, center - position, velocity, desired_speed) * pressure.cohesion;
    }
    if agg.separation_count > 0 {
        let panic = 1.0 + saturate(agg.avoid_danger);
        let average = agg.separation / agg.separation_count as f32;
        flock += average * max_accel * pressure.separation * panic;
    }
    let mut accel = flock * behaviour.influence_weight;
    if agg.friendly_count > 0 && inputs.dt > EPSILON {
        accel += agg.radial_damping / agg.friendly_count as f32 / inputs.dt;
    }
    accel += agg.avoid_separation * max_accel;

    if agg.leader_count > 0 && behaviour.group_flow_weight > 0.0 {
        let heading = agg.alignment / agg.leader_count as f32;
        accel += steer_towards(mode, heading, velocity, desired_speed) * behaviour.group_flow_weight;
    }

    let boost = split_boost(behaviour, agg, group_size);
    if boost > 1.0 {
        accel += split_steering(behaviour, agg, velocity, i) * max_accel;
    }

    accel += inputs.obstacle_steering.get(i).copied().unwrap_or(Vec3::ZERO)
        * behaviour.obstacle_avoid_weight
        * max_accel;

    let mut pull = inputs.attraction_steering.get(i).copied().unwrap_or(Vec3::ZERO);
    if behaviour.use_preferred_depth && behaviour.depth_wins_over_attractor {
        let depth = inputs.bounds.normalized_depth(position);
        if depth < behaviour.preferred_depth_min || depth > behaviour.preferred_depth_max {
            pull.y = 0.0;
        }
    }
    accel += pull * max_accel;

    let noise_direction = if behaviour.group_noise_strength > 0.0 || behaviour.group_noise_speed_weight > 0.0 {
        let field = inputs.group_noise.sample(inputs.layout.cell_id_of(position));
        agent_sample(field, i as u32, inputs.time, behaviour.group_noise_direction_rate)
    } else {
        Vec3::ZERO
    };

    if behaviour.propulsion_weight > 0.0 && desired_speed > 0.0 {
        // A resting agent takes its heading from the steering gathered so far.
        let heading = normalize_or(velocity, normalize_or(accel, Vec3::ZERO));
        if heading != Vec3::ZERO {
            let speed_scale = (1.0 + behaviour.group_noise_speed_weight * noise_direction.dot(heading)).max(0.0);
            let target = desired_speed * speed_scale;
            accel += heading * (target - velocity.dot(heading)) * behaviour.propulsion_weight;
        }
    }

    if behaviour.wander_strength > 0.0 {
        accel += wander(i as u32, inputs.time * behaviour.wander_frequency)
            * behaviour.wander_strength
            * max_accel;
    }

    if behaviour.group_noise_strength > 0.0 {
        accel += noise_direction * behaviour.group_noise_strength * max_accel;
    }

    accel += inputs.pattern_steering.get(i).copied().unwrap_or(Vec3::ZERO) * behaviour.pattern_weight * max_accel;

    let probe = inputs.wall_probes.get(i).copied().unwrap_or_default();
    if probe.danger > 0.0 {
        accel *= (1.0 - probe.danger * behaviour.bounds_influence_suppression).max(0.0);
        accel += probe.inward * probe.danger * behaviour.bounds_weight * max_accel;
    }

    let max_acceleration = max_accel * boost;
    Acceleration {
        value: limit_magnitude(mode, accel, max_acceleration),
        max_speed: behaviour.max_speed * boost,
        max_acceleration,
    }
}

/// Weight multipliers from group-size pressure.
struct GroupPressure {
    alignment: f32,
    cohesion: f32,
    separation: f32,
}

impl GroupPressure {
    fn new(behaviour: &BehaviourSettings, group_size: u32) -> Self {
        let mut pressure = Self {
            alignment: behaviour.alignment_weight,
            cohesion: behaviour.cohesion_weight,
            separation: behaviour.separation_weight,
        };

        let min = behaviour.min_group_size;
        if min > 1 && group_size < min {
            let deficit = (min - group_size) as f32 / min as f32;
            pressure.cohesion *= 1.0 + behaviour.loner_cohesion_boost * deficit * behaviour.min_group_size_weight;
        }

        let max = behaviour.max_group_size;
        if max > 0 && group_size > max {
            let excess = saturate((group_size - max) as f32 / max as f32) * behaviour.max_group_size_weight;
            pressure.separation *= 1.0 + behaviour.overcrowd_separation_boost * excess;
            pressure.cohesion *= (1.0 - behaviour.overcrowd_cohesion_penalty * excess).max(0.0);
        }
        pressure
    }
}

fn split_boost(behaviour: &BehaviourSettings, agg: &NeighbourAggregate, group_size: u32) -> f32 {
    let min_group = behaviour.min_group_size.max(MIN_SPLIT_GROUP);
    if group_size < min_group || agg.avoid_danger <= 0.0 || agg.avoid_danger < behaviour.split_panic_threshold {
        return 1.0;
    }
    1.0 + behaviour.split_accel_boost * saturate(agg.avoid_danger)
}

/// Flee direction with a per-agent sideways branch so a panicking school
/// fans out instead of fleeing as one block.
fn split_steering(behaviour: &BehaviourSettings, agg: &NeighbourAggregate, velocity: Vec3, i: usize) -> Vec3 {
    let flee = normalize_or(
        agg.avoid_separation,
        normalize_or(agg.separation, normalize_or(velocity, Vec3::ZERO)),
    );
    if flee == Vec3::ZERO {
        return Vec3::ZERO;
    }
    let lateral = normalize_or(Vec3::Y.cross(flee), Vec3::X);
    let side = match hash_u32(i as u32) % 3 {
        0 => -1.0,
        1 => 0.0,
        _ => 1.0,
    };
    normalize_or(flee + lateral * side * behaviour.split_lateral_weight, flee) * saturate(agg.avoid_danger)
}

/// Smoothly varying unit-ish direction: blends between hashed directions at
/// integer phase steps.
fn wander(agent: u32, phase: f32) -> Vec3 {
    let step = phase.floor();
    let t = phase - step;
    let smooth = t * t * (3.0 - 2.0 * t);
    let key = step as i64 as u32;
    let seed = hash_u32(agent ^ 0x57a7_d3e1);
    let a = hash_direction(seed, key);
    let b = hash_direction(seed, key.wrapping_add(1));
    normalize_or(a.lerp(b, smooth), a)
}

/// Biases vertical velocity toward the preferred depth band. Depth grows
/// downward, so moving deeper means negative `y` velocity.
fn preferred_depth_bias(
    bounds: &EnvironmentBounds,
    behaviour: &BehaviourSettings,
    position: Vec3,
    vy: f32,
    max_speed: f32,
    dt: f32,
) -> f32 {
    let span = bounds.depth_span();
    if span <= EPSILON {
        return vy;
    }
    let depth = bounds.normalized_depth(position);
    let lo = behaviour.preferred_depth_min;
    let hi = behaviour.preferred_depth_max;
    let gain = behaviour.preferred_depth_weight * behaviour.preferred_depth_bias;

    let adjusted = if depth < lo {
        let outside = (lo - depth) * span;
        vy - gain * (1.0 + outside * outside) * dt
    } else if depth > hi {
        let outside = (depth - hi) * span;
        vy + gain * (1.0 + outside * outside) * dt
    } else {
        let edge = behaviour.preferred_depth_edge_fraction * (hi - lo);
        if edge <= EPSILON {
            vy
        } else if depth - lo < edge {
            vy - gain * EDGE_BIAS_SCALE * (1.0 - (depth - lo) / edge) * dt
        } else if hi - depth < edge {
            vy + gain * EDGE_BIAS_SCALE * (1.0 - (hi - depth) / edge) * dt
        } else {
            vy
        }
    };
    adjusted.clamp(-max_speed, max_speed)
}

/// `p += v dt`, then clamp and reflect against the bounds.
pub fn integrate_positions(
    bounds: &EnvironmentBounds,
    restitution: f32,
    dt: f32,
    positions: &mut [Vec3],
    velocities: &mut [Vec3],
) {
    positions
        .par_iter_mut()
        .zip(velocities.par_iter_mut())
        .for_each(|(position, velocity)| {
            let (p, v) = bounds.contain(*position + *velocity * dt, *velocity, restitution);
            *position = p;
            *velocity = v;
        });
}
