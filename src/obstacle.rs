use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::grid::{CellEntry, GridLayout, PackedCells};
use crate::math::{normalize_or, EPSILON};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ObstacleShape {
    Sphere { radius: f32 },
    Box { half_extents: Vec3 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObstacleData {
    pub position: Vec3,
    pub shape: ObstacleShape,
    /// Distance from the surface at which agents start to steer away.
    pub avoid_distance: f32,
}

impl ObstacleData {
    pub fn sphere(position: Vec3, radius: f32) -> Self {
        Self {
            position,
            shape: ObstacleShape::Sphere { radius },
            avoid_distance: 2.0,
        }
    }

    pub fn cuboid(position: Vec3, half_extents: Vec3) -> Self {
        Self {
            position,
            shape: ObstacleShape::Box { half_extents },
            avoid_distance: 2.0,
        }
    }

    fn reach(&self) -> Vec3 {
        let size = match self.shape {
            ObstacleShape::Sphere { radius } => Vec3::splat(radius.max(0.0)),
            ObstacleShape::Box { half_extents } => half_extents.max(Vec3::ZERO),
        };
        size + Vec3::splat(self.avoid_distance.max(0.0))
    }

    /// Signed distance to the surface (negative inside) and the outward normal.
    pub fn surface(&self, point: Vec3) -> (f32, Vec3) {
        let local = point - self.position;
        match self.shape {
            ObstacleShape::Sphere { radius } => {
                let distance = local.length();
                (distance - radius, normalize_or(local, Vec3::Y))
            }
            ObstacleShape::Box { half_extents } => {
                let q = local.abs() - half_extents;
                let outside = q.max(Vec3::ZERO);
                if outside.length_squared() > EPSILON * EPSILON {
                    let closest = local.clamp(-half_extents, half_extents);
                    (outside.length(), normalize_or(local - closest, Vec3::Y))
                } else {
                    // Inside: leave through the nearest face.
                    let axis = if q.x >= q.y && q.x >= q.z {
                        0
                    } else if q.y >= q.z {
                        1
                    } else {
                        2
                    };
                    let mut normal = Vec3::ZERO;
                    normal[axis] = if local[axis] >= 0.0 { 1.0 } else { -1.0 };
                    (q.max_element(), normal)
                }
            }
        }
    }
}

/// Cell to obstacle multimap; obstacles are stamped into every cell their
/// avoidance reach overlaps. Rebuilt only when marked dirty.
#[derive(Clone, Debug, Default)]
pub struct ObstacleGrid {
    cells: PackedCells,
    scratch: Vec<CellEntry>,
    dirty: bool,
}

impl ObstacleGrid {
    pub fn allocate(layout: &GridLayout) -> Self {
        Self {
            cells: PackedCells::with_cells(layout.cell_count()),
            scratch: Vec::new(),
            dirty: true,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns whether a rebuild happened.
    pub fn rebuild_if_dirty(&mut self, layout: &GridLayout, obstacles: &[ObstacleData]) -> bool {
        if !self.dirty || !self.cells.is_allocated() {
            return false;
        }

        self.scratch.clear();
        for (index, obstacle) in obstacles.iter().enumerate() {
            let reach = obstacle.reach();
            layout.for_each_cell_in_box(obstacle.position - reach, obstacle.position + reach, |cell| {
                self.scratch.push(CellEntry {
                    cell: cell as u32,
                    index: index as u32,
                });
            });
        }

        let entries = self.cells.begin(self.scratch.len());
        entries.copy_from_slice(&self.scratch);
        self.cells.finish();
        self.dirty = false;
        true
    }

    pub fn cell(&self, cell: usize) -> &[CellEntry] {
        self.cells.cell(cell)
    }
}

/// Summed push away from every obstacle whose reach covers the agent's cell.
pub fn avoidance_steering(
    layout: &GridLayout,
    grid: &ObstacleGrid,
    obstacles: &[ObstacleData],
    position: Vec3,
    velocity: Vec3,
) -> Vec3 {
    let mut steer = Vec3::ZERO;
    for entry in grid.cell(layout.cell_id_of(position)) {
        let Some(obstacle) = obstacles.get(entry.index as usize) else {
            continue;
        };
        let (distance, normal) = obstacle.surface(position);
        let reach = obstacle.avoid_distance.max(EPSILON);
        if distance >= reach {
            continue;
        }

        // 1 at the surface, growing with penetration.
        let mut strength = 1.0 - distance / reach;
        let approach = velocity.dot(normal);
        if approach < 0.0 {
            // Heading into it: also cancel part of the approach.
            strength *= 1.0 + (-approach / velocity.length().max(EPSILON)) * 0.5;
        }
        steer += normal * strength;
    }
    steer
}
