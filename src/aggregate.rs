//! Neighbour aggregation: one pass per agent over the cells around it,
//! classifying every neighbour by relationship and summing the forces the
//! steering stage needs into a [`NeighbourAggregate`].

use glam::{IVec3, Vec3};
use rayon::prelude::*;

use crate::behaviour::{BehaviourSettings, BehaviourTable};
use crate::grid::{AgentGrid, GridLayout};
use crate::hash::{hash3, hash_direction, hash_u32};
use crate::math::{saturate, EPSILON};

/// Entries remembered exactly by the visited filter (512 bytes).
pub const VISITED_CAPACITY: usize = 128;

const LEADERSHIP_TIE: f32 = 1.0e-4;
const MIN_SEPARATION_DISTANCE: f32 = 0.05;
const MAX_INVERSE_PUSH: f32 = 8.0;
const SCHOOLING_ATTRACTION: f32 = 0.5;
const NEUTRAL_REPULSION: f32 = 0.5;

/// Forces accumulated for one agent during one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NeighbourAggregate {
    /// Sum of leader-group neighbour velocities.
    pub alignment: Vec3,
    /// Sum of leader-group neighbour positions.
    pub cohesion: Vec3,
    pub separation: Vec3,
    pub avoid_separation: Vec3,
    pub radial_damping: Vec3,
    pub leader_count: u32,
    pub separation_count: u32,
    pub friendly_count: u32,
    pub avoid_danger: f32,
    pub leader_weight: f32,
    pub neighbours_checked: u32,
}

/// Bounded "probably seen" filter used when agents are stamped into several
/// cells. Once the exact list is full, a bitset hit is treated as already seen,
/// which can under-count in very dense scenes but keeps the cost fixed.
#[derive(Clone, Debug)]
pub struct VisitedFilter {
    seen: [u64; 4],
    list: [u32; VISITED_CAPACITY],
    len: usize,
}

impl Default for VisitedFilter {
    fn default() -> Self {
        Self {
            seen: [0; 4],
            list: [0; VISITED_CAPACITY],
            len: 0,
        }
    }
}

impl VisitedFilter {
    /// Returns `true` the first time `index` is offered.
    pub fn insert(&mut self, index: u32) -> bool {
        let bit = (hash_u32(index) & 0xff) as usize;
        let word = bit >> 6;
        let mask = 1u64 << (bit & 63);

        if self.seen[word] & mask != 0 {
            if self.list[..self.len].contains(&index) {
                return false;
            }
            if self.len == VISITED_CAPACITY {
                return false;
            }
        }

        self.seen[word] |= mask;
        if self.len < VISITED_CAPACITY {
            self.list[self.len] = index;
            self.len += 1;
        }
        true
    }
}

/// Pairwise schooling profile; parameters are the mean of both behaviours.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchoolingBand {
    pub collision: f32,
    pub target: f32,
    pub deadzone: f32,
    pub outer: f32,
    pub softness: f32,
    pub radial_damping: f32,
}

impl SchoolingBand {
    pub fn between(a: &BehaviourSettings, b: &BehaviourSettings) -> Self {
        let collision = a.body_radius + b.body_radius;
        let spacing = 0.5 * (a.schooling_spacing + b.schooling_spacing);
        let target = spacing * collision;
        Self {
            collision,
            target,
            deadzone: 0.5 * (a.schooling_deadzone_fraction + b.schooling_deadzone_fraction) * target,
            outer: 0.5 * (a.schooling_outer + b.schooling_outer) * target,
            softness: 0.5 * (a.schooling_inner_softness + b.schooling_inner_softness),
            radial_damping: 0.5 * (a.schooling_radial_damping + b.schooling_radial_damping),
        }
    }

    /// Distance below which neighbours are pushed apart.
    pub fn inner_edge(&self) -> f32 {
        self.target - self.deadzone
    }

    /// Scalar force at `distance`: positive repels, negative attracts.
    pub fn force(&self, distance: f32) -> f32 {
        if self.collision > EPSILON && distance < self.collision {
            return 1.0 + (self.collision - distance) / self.collision;
        }

        let inner = self.inner_edge();
        if distance < inner {
            let span = (inner - self.collision).max(EPSILON);
            let t = saturate((inner - distance) / span);
            // Softer bands ease in near the target spacing.
            return t.powf(1.0 + 2.0 * self.softness);
        }

        let dead_outer = self.target + self.deadzone;
        if distance <= dead_outer {
            return 0.0;
        }

        if distance < self.outer {
            let span = (self.outer - dead_outer).max(EPSILON);
            let u = (distance - dead_outer) / span;
            return -SCHOOLING_ATTRACTION * (1.0 - u);
        }
        0.0
    }
}

/// Read-only view of everything the aggregation pass needs.
pub struct AggregateInputs<'a> {
    pub layout: &'a GridLayout,
    pub grid: &'a AgentGrid,
    pub behaviours: &'a BehaviourTable,
    pub positions: &'a [Vec3],
    pub velocities: &'a [Vec3],
    pub behaviour_ids: &'a [u32],
}

pub fn aggregate_all(inputs: &AggregateInputs<'_>, out: &mut [NeighbourAggregate]) {
    let dedup = inputs.grid.max_cells_per_agent() > 1;
    out.par_iter_mut()
        .enumerate()
        .for_each(|(i, aggregate)| *aggregate = aggregate_agent(inputs, i, dedup));
}

pub fn aggregate_agent(inputs: &AggregateInputs<'_>, i: usize, dedup: bool) -> NeighbourAggregate {
    let mut acc = NeighbourAggregate::default();
    let Some(&self_id) = inputs.behaviour_ids.get(i) else {
        return acc;
    };
    let Some(behaviour) = inputs.behaviours.get(self_id) else {
        return acc;
    };

    let position = inputs.positions[i];
    let velocity = inputs.velocities[i];
    let self_bit = BehaviourSettings::affinity_bit(self_id as usize);
    let radius = inputs.behaviours.search_radius(self_id);
    let home = inputs.layout.cell_coord(position);
    let lo = inputs.layout.clamp_coord(home - IVec3::splat(radius));
    let hi = inputs.layout.clamp_coord(home + IVec3::splat(radius));

    let check_cap = behaviour.max_neighbour_checks;
    let friendly_cap = behaviour.max_friendly_samples;
    let separation_cap = behaviour.max_separation_samples;
    let mut filter = VisitedFilter::default();

    'scan: for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                let cell = inputs.layout.cell_id(IVec3::new(x, y, z));
                for entry in inputs.grid.cell(cell) {
                    let j = entry.index as usize;
                    if j == i {
                        continue;
                    }
                    if dedup && !filter.insert(entry.index) {
                        continue;
                    }
                    if check_cap > 0 && acc.neighbours_checked >= check_cap {
                        break 'scan;
                    }
                    acc.neighbours_checked += 1;

                    let other_id = inputs.behaviour_ids[j];
                    let Some(other) = inputs.behaviours.get(other_id) else {
                        continue;
                    };
                    let other_bit = BehaviourSettings::affinity_bit(other_id as usize);

                    let delta = inputs.positions[j] - position;
                    let distance = delta.length();
                    let away = if distance > EPSILON {
                        -delta / distance
                    } else {
                        coincident_direction(i, j)
                    };

                    let combined = behaviour.body_radius + other.body_radius;
                    let hard_radius = behaviour.separation_radius.max(combined);
                    if distance < hard_radius {
                        let inverse = (hard_radius / distance.max(MIN_SEPARATION_DISTANCE) - 1.0)
                            .min(MAX_INVERSE_PUSH);
                        let penetration = if combined > EPSILON {
                            ((combined - distance) / combined).max(0.0)
                        } else {
                            0.0
                        };
                        push_separation(&mut acc, away * (inverse + penetration), separation_cap);
                    }

                    if behaviour.neighbour_radius <= EPSILON || distance > behaviour.neighbour_radius {
                        continue;
                    }
                    let proximity = saturate(1.0 - distance / behaviour.neighbour_radius);

                    if behaviour.group_mask & other_bit != 0 {
                        acc.friendly_count += 1;
                        accumulate_leader(&mut acc, other, inputs.positions[j], inputs.velocities[j], friendly_cap);

                        let band = SchoolingBand::between(behaviour, other);
                        let push = band.force(distance);
                        if push != 0.0 {
                            push_separation(&mut acc, away * push, separation_cap);
                        }

                        if band.radial_damping > 0.0 && distance < band.inner_edge() {
                            let closing = (inputs.velocities[j] - velocity).dot(-away);
                            if closing < 0.0 {
                                acc.radial_damping += -away * closing * band.radial_damping;
                            }
                        }
                    }

                    let avoids = behaviour.avoid_mask & other_bit != 0 || other.avoid_mask & self_bit != 0;
                    if avoids && other.avoidance_weight > behaviour.avoidance_weight {
                        let delta_weight =
                            (other.avoidance_weight - behaviour.avoidance_weight) / other.avoidance_weight;
                        let danger = saturate(proximity * delta_weight);
                        acc.avoid_separation += away * danger * behaviour.avoid_response;
                        acc.avoid_danger = acc.avoid_danger.max(danger);
                    }

                    let neutral = behaviour.neutral_mask & other_bit != 0 || other.neutral_mask & self_bit != 0;
                    if neutral && other.neutral_weight > behaviour.neutral_weight {
                        let delta_weight =
                            (other.neutral_weight - behaviour.neutral_weight) / other.neutral_weight;
                        push_separation(&mut acc, away * proximity * delta_weight * NEUTRAL_REPULSION, separation_cap);
                    }
                }
            }
        }
    }

    acc
}

/// Every separation sample counts toward `cap`; zero means unlimited.
fn push_separation(acc: &mut NeighbourAggregate, push: Vec3, cap: u32) {
    if cap == 0 || acc.separation_count < cap {
        acc.separation += push;
        acc.separation_count += 1;
    }
}

/// Only the highest leadership weight among friendly neighbours contributes to
/// alignment and cohesion; equal weights share up to `cap` samples.
fn accumulate_leader(
    acc: &mut NeighbourAggregate,
    other: &BehaviourSettings,
    position: Vec3,
    velocity: Vec3,
    cap: u32,
) {
    let weight = other.leadership_weight;
    if acc.leader_count == 0 || weight > acc.leader_weight + LEADERSHIP_TIE {
        acc.alignment = velocity;
        acc.cohesion = position;
        acc.leader_count = 1;
        acc.leader_weight = weight;
    } else if (weight - acc.leader_weight).abs() <= LEADERSHIP_TIE
        && (cap == 0 || acc.leader_count < cap)
    {
        acc.alignment += velocity;
        acc.cohesion += position;
        acc.leader_count += 1;
    }
}

/// Deterministic split direction for agents sharing a position; opposite for
/// the two members of the pair.
fn coincident_direction(i: usize, j: usize) -> Vec3 {
    let (lo, hi) = if i < j { (i, j) } else { (j, i) };
    let direction = hash_direction(hash3(lo as u32, hi as u32, 0x5eed), 0);
    if i < j {
        direction
    } else {
        -direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::SimLogger;
    use glam::UVec3;

    struct Scene {
        layout: GridLayout,
        grid: AgentGrid,
        behaviours: BehaviourTable,
        positions: Vec<Vec3>,
        velocities: Vec<Vec3>,
        ids: Vec<u32>,
    }

    impl Scene {
        fn new(behaviours: Vec<BehaviourSettings>, agents: &[(Vec3, u32)]) -> Self {
            let layout = GridLayout::new(Vec3::splat(-16.0), 2.0, UVec3::splat(16));
            let mut table = BehaviourTable::new(behaviours, &SimLogger::silent());
            table.derive_search_radii(layout.cell_size());
            let positions: Vec<Vec3> = agents.iter().map(|a| a.0).collect();
            let ids: Vec<u32> = agents.iter().map(|a| a.1).collect();
            let mut grid = AgentGrid::allocate(layout, positions.len(), table.max_body_radius());
            grid.rebuild(&positions, |i| table.body_radius(ids[i])).unwrap();
            Self {
                layout,
                grid,
                behaviours: table,
                velocities: vec![Vec3::ZERO; positions.len()],
                positions,
                ids,
            }
        }

        fn aggregate(&self, i: usize) -> NeighbourAggregate {
            let inputs = AggregateInputs {
                layout: &self.layout,
                grid: &self.grid,
                behaviours: &self.behaviours,
                positions: &self.positions,
                velocities: &self.velocities,
                behaviour_ids: &self.ids,
            };
            aggregate_agent(&inputs, i, self.grid.max_cells_per_agent() > 1)
        }
    }

    fn schooling(mask: u32) -> BehaviourSettings {
        BehaviourSettings {
            group_mask: mask,
            ..BehaviourSettings::default()
        }
    }

    #[test]
    fn schooling_band_has_dead_zone_at_target_spacing() {
        let fish = BehaviourSettings::default();
        let band = SchoolingBand::between(&fish, &fish);

        assert_eq!(band.force(band.target), 0.0);
        let close = band.force(0.5 * band.target);
        let nearer_target = band.force(0.9 * band.target);
        assert!(close > 0.0);
        assert!(close > nearer_target.abs());
        assert!(band.force(1.5 * band.target) < 0.0);
        assert_eq!(band.force(band.outer + 0.1), 0.0);
    }

    #[test]
    fn schooling_band_uses_mean_of_both_behaviours() {
        let a = BehaviourSettings {
            schooling_spacing: 1.0,
            body_radius: 0.5,
            ..BehaviourSettings::default()
        };
        let b = BehaviourSettings {
            schooling_spacing: 3.0,
            body_radius: 0.5,
            ..BehaviourSettings::default()
        };
        let band = SchoolingBand::between(&a, &b);
        assert!((band.target - 2.0).abs() < 1.0e-6);
        assert_eq!(band, SchoolingBand::between(&b, &a));
    }

    #[test]
    fn visited_filter_rejects_repeats() {
        let mut filter = VisitedFilter::default();
        assert!(filter.insert(42));
        assert!(!filter.insert(42));
        for i in 0..64 {
            filter.insert(1_000 + i);
        }
        assert!(!filter.insert(1_010));
    }

    #[test]
    fn close_friends_separate_and_count_each_other() {
        let scene = Scene::new(
            vec![schooling(1)],
            &[(Vec3::ZERO, 0), (Vec3::new(0.5, 0.0, 0.0), 0)],
        );
        let a = scene.aggregate(0);
        assert_eq!(a.friendly_count, 1);
        assert_eq!(a.leader_count, 1);
        assert!(a.separation.x < 0.0);

        let b = scene.aggregate(1);
        assert!(b.separation.x > 0.0);
    }

    #[test]
    fn only_highest_leadership_group_drives_alignment() {
        let follower = schooling(0b11);
        let leader = BehaviourSettings {
            leadership_weight: 5.0,
            group_mask: 0b11,
            ..BehaviourSettings::default()
        };
        let mut scene = Scene::new(
            vec![follower, leader],
            &[
                (Vec3::ZERO, 0),
                (Vec3::new(1.5, 0.0, 0.0), 0),
                (Vec3::new(0.0, 1.5, 0.0), 1),
            ],
        );
        scene.velocities[1] = Vec3::X;
        scene.velocities[2] = Vec3::Z;

        let aggregate = scene.aggregate(0);
        assert_eq!(aggregate.friendly_count, 2);
        assert_eq!(aggregate.leader_count, 1);
        assert_eq!(aggregate.alignment, Vec3::Z);
        assert_eq!(aggregate.leader_weight, 5.0);
    }

    #[test]
    fn weaker_avoider_flees_stronger_one_directionally() {
        // Type 0 lists type 1 in its avoid mask and is the stronger of the two.
        let shark = BehaviourSettings {
            avoid_mask: 0b10,
            avoidance_weight: 4.0,
            ..BehaviourSettings::default()
        };
        let minnow = BehaviourSettings {
            avoidance_weight: 1.0,
            ..BehaviourSettings::default()
        };
        let scene = Scene::new(
            vec![shark, minnow],
            &[(Vec3::ZERO, 0), (Vec3::new(2.0, 0.0, 0.0), 1)],
        );

        let shark_view = scene.aggregate(0);
        assert_eq!(shark_view.avoid_separation, Vec3::ZERO);
        assert_eq!(shark_view.avoid_danger, 0.0);

        let minnow_view = scene.aggregate(1);
        assert!(minnow_view.avoid_separation.x > 0.0);
        assert!(minnow_view.avoid_danger > 0.0);
    }

    #[test]
    fn neutral_neighbours_push_gently_without_danger() {
        let big = BehaviourSettings {
            neutral_mask: 0b10,
            neutral_weight: 2.0,
            ..BehaviourSettings::default()
        };
        let small = BehaviourSettings::default();
        let scene = Scene::new(
            vec![big, small],
            &[(Vec3::ZERO, 0), (Vec3::new(2.0, 0.0, 0.0), 1)],
        );
        let small_view = scene.aggregate(1);
        assert!(small_view.separation.x > 0.0);
        assert_eq!(small_view.avoid_danger, 0.0);
        assert_eq!(scene.aggregate(0).separation, Vec3::ZERO);
    }

    #[test]
    fn neighbour_check_cap_bounds_the_scan() {
        let capped = BehaviourSettings {
            max_neighbour_checks: 2,
            group_mask: 1,
            ..BehaviourSettings::default()
        };
        let agents: Vec<(Vec3, u32)> = (0..6)
            .map(|k| (Vec3::new(0.3 * k as f32, 0.0, 0.0), 0))
            .collect();
        let scene = Scene::new(vec![capped], &agents);
        assert_eq!(scene.aggregate(0).neighbours_checked, 2);
    }

    #[test]
    fn sample_caps_bound_separation_and_leader_counts() {
        let crowd = |capped: bool| {
            let behaviour = BehaviourSettings {
                group_mask: 1,
                max_friendly_samples: if capped { 3 } else { 0 },
                max_separation_samples: if capped { 2 } else { 0 },
                ..BehaviourSettings::default()
            };
            let agents: Vec<(Vec3, u32)> = (0..6)
                .map(|k| (Vec3::new(0.1 * k as f32, 0.0, 0.0), 0))
                .collect();
            Scene::new(vec![behaviour], &agents).aggregate(0)
        };

        let open = crowd(false);
        assert_eq!(open.leader_count, 5);
        assert!(open.separation_count >= 5);

        let capped = crowd(true);
        assert_eq!(capped.friendly_count, 5);
        assert_eq!(capped.leader_count, 3);
        assert_eq!(capped.separation_count, 2);
    }

    #[test]
    fn radial_damping_opposes_closing_motion_only() {
        let mut scene = Scene::new(
            vec![schooling(1)],
            &[(Vec3::ZERO, 0), (Vec3::new(0.5, 0.0, 0.0), 0)],
        );
        let band = SchoolingBand::between(&schooling(1), &schooling(1));
        assert!(0.5 < band.inner_edge());

        scene.velocities[0] = Vec3::X;
        let closing = scene.aggregate(0);
        assert!((closing.radial_damping.x + band.radial_damping).abs() < 1.0e-5);
        assert_eq!(closing.radial_damping.y, 0.0);

        scene.velocities[0] = -Vec3::X;
        assert_eq!(scene.aggregate(0).radial_damping, Vec3::ZERO);
    }

    #[test]
    fn stamped_neighbours_are_counted_once() {
        let large = BehaviourSettings {
            body_radius: 1.5,
            group_mask: 1,
            ..BehaviourSettings::default()
        };
        let scene = Scene::new(
            vec![large],
            &[(Vec3::new(0.1, 0.1, 0.1), 0), (Vec3::new(1.0, 0.9, 0.1), 0)],
        );
        assert!(scene.grid.max_cells_per_agent() > 1);
        let aggregate = scene.aggregate(0);
        assert_eq!(aggregate.friendly_count, 1);
        assert_eq!(aggregate.neighbours_checked, 1);
    }

    #[test]
    fn coincident_agents_get_opposite_pushes() {
        let scene = Scene::new(vec![schooling(1)], &[(Vec3::ZERO, 0), (Vec3::ZERO, 0)]);
        let a = scene.aggregate(0).separation;
        let b = scene.aggregate(1).separation;
        assert!(a.length() > 0.0);
        assert!((a + b).length() < 1.0e-4);
    }

    #[test]
    fn unknown_behaviour_ids_are_ignored() {
        let scene = Scene::new(
            vec![schooling(1)],
            &[(Vec3::ZERO, 0), (Vec3::new(0.5, 0.0, 0.0), 9)],
        );
        assert_eq!(scene.aggregate(1), NeighbourAggregate::default());
        assert_eq!(scene.aggregate(0).friendly_count, 0);
    }
}
