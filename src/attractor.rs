use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::behaviour::BehaviourSettings;
use crate::environment::EnvironmentBounds;
use crate::grid::GridLayout;
use crate::math::{normalize_or, saturate, EPSILON};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttractorUsage {
    /// Pulls each affine agent on its own.
    Individual,
    /// Pulls whole schools; weighted by the behaviour's group attraction weight.
    Group,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttractorShape {
    Sphere { radius: f32 },
    Box { half_extents: Vec3 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttractorData {
    pub position: Vec3,
    pub shape: AttractorShape,
    pub usage: AttractorUsage,
    /// Bit `t` set: behaviour type `t` is drawn to this attractor.
    pub affinity_mask: u32,
    /// Higher priority claims a cell over lower priority.
    pub priority: f32,
    pub strength: f32,
    /// Normalized depth window; agents outside it ignore the attractor.
    pub depth_min: f32,
    pub depth_max: f32,
}

impl AttractorData {
    pub fn sphere(position: Vec3, radius: f32, affinity_mask: u32) -> Self {
        Self {
            position,
            shape: AttractorShape::Sphere { radius },
            usage: AttractorUsage::Individual,
            affinity_mask,
            priority: 0.0,
            strength: 1.0,
            depth_min: 0.0,
            depth_max: 1.0,
        }
    }

    fn half_extents(&self) -> Vec3 {
        match self.shape {
            AttractorShape::Sphere { radius } => Vec3::splat(radius.max(0.0)),
            AttractorShape::Box { half_extents } => half_extents.max(Vec3::ZERO),
        }
    }

    /// 0 at the center, 1 on the surface, greater outside.
    fn relative_distance(&self, point: Vec3) -> f32 {
        let local = point - self.position;
        match self.shape {
            AttractorShape::Sphere { radius } => local.length() / radius.max(EPSILON),
            AttractorShape::Box { half_extents } => {
                (local.abs() / half_extents.max(Vec3::splat(EPSILON))).max_element()
            }
        }
    }

    fn accepts(&self, behaviour_id: u32, depth: f32) -> bool {
        self.affinity_mask & BehaviourSettings::affinity_bit(behaviour_id as usize) != 0
            && depth >= self.depth_min.min(self.depth_max)
            && depth <= self.depth_max.max(self.depth_min)
    }
}

const NO_ATTRACTOR: i32 = -1;

/// Per cell, the highest-priority attractor of each usage whose area covers it.
/// Rebuilt only when marked dirty.
#[derive(Clone, Debug, Default)]
pub struct AttractorGrid {
    individual: Vec<i32>,
    group: Vec<i32>,
    touched: Vec<u32>,
    dirty: bool,
}

impl AttractorGrid {
    pub fn allocate(layout: &GridLayout) -> Self {
        Self {
            individual: vec![NO_ATTRACTOR; layout.cell_count()],
            group: vec![NO_ATTRACTOR; layout.cell_count()],
            touched: Vec::new(),
            dirty: true,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn rebuild_if_dirty(&mut self, layout: &GridLayout, attractors: &[AttractorData]) -> bool {
        if !self.dirty || self.individual.is_empty() {
            return false;
        }

        for &cell in &self.touched {
            self.individual[cell as usize] = NO_ATTRACTOR;
            self.group[cell as usize] = NO_ATTRACTOR;
        }
        self.touched.clear();

        for (index, attractor) in attractors.iter().enumerate() {
            let extent = attractor.half_extents();
            let track = match attractor.usage {
                AttractorUsage::Individual => &mut self.individual,
                AttractorUsage::Group => &mut self.group,
            };
            let touched = &mut self.touched;
            layout.for_each_cell_in_box(attractor.position - extent, attractor.position + extent, |cell| {
                let current = track[cell];
                let claims = current == NO_ATTRACTOR
                    || attractor.priority > attractors[current as usize].priority;
                if claims {
                    track[cell] = index as i32;
                    touched.push(cell as u32);
                }
            });
        }

        self.dirty = false;
        true
    }

    pub fn individual(&self, cell: usize) -> Option<usize> {
        slot(&self.individual, cell)
    }

    pub fn group(&self, cell: usize) -> Option<usize> {
        slot(&self.group, cell)
    }
}

fn slot(track: &[i32], cell: usize) -> Option<usize> {
    match track.get(cell) {
        Some(&index) if index >= 0 => Some(index as usize),
        _ => None,
    }
}

/// Combined pull of the individual and group attractors claiming the agent's cell.
pub fn attraction_steering(
    layout: &GridLayout,
    grid: &AttractorGrid,
    attractors: &[AttractorData],
    bounds: &EnvironmentBounds,
    behaviour: &BehaviourSettings,
    behaviour_id: u32,
    position: Vec3,
) -> Vec3 {
    let cell = layout.cell_id_of(position);
    let depth = bounds.normalized_depth(position);
    let mut steer = Vec3::ZERO;

    let tracks = [
        (grid.individual(cell), behaviour.attraction_weight),
        (grid.group(cell), behaviour.group_attraction_weight),
    ];
    for (index, weight) in tracks {
        let Some(attractor) = index.and_then(|i| attractors.get(i)) else {
            continue;
        };
        if weight <= 0.0 || !attractor.accepts(behaviour_id, depth) {
            continue;
        }
        let direction = normalize_or(attractor.position - position, Vec3::ZERO);
        // Fades out toward the center so agents mill instead of collapsing.
        let falloff = saturate(attractor.relative_distance(position));
        steer += direction * attractor.strength.max(0.0) * weight * falloff;
    }
    steer
}
