use serde::{Deserialize, Serialize};

use crate::math::{clamp_finite, MathMode};

pub const MIN_CELL_SIZE: f32 = 0.05;
pub const DEFAULT_MAX_GRID_CELLS: usize = 1 << 21;

/// Simulation-wide tuning that is not specific to one behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Edge length of an agent grid cell. Zero derives it from the largest
    /// behaviour neighbour radius.
    pub cell_size: f32,
    /// Upper bound on grid cells; cell size grows until the grid fits.
    pub max_grid_cells: usize,
    /// Exponential velocity damping per second.
    pub global_damping: f32,
    /// Fraction of the normal velocity kept when an agent is reflected off a wall.
    pub bounds_restitution: f32,
    pub math_mode: MathMode,
    /// Seed for scatter spawning. `None` draws one from the OS.
    pub spawn_seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cell_size: 0.0,
            max_grid_cells: DEFAULT_MAX_GRID_CELLS,
            global_damping: 0.1,
            bounds_restitution: 0.2,
            math_mode: MathMode::Accurate,
            spawn_seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn sanitize(&mut self) {
        self.cell_size = clamp_finite(self.cell_size, 0.0, f32::MAX, 0.0);
        self.max_grid_cells = self.max_grid_cells.max(1);
        self.global_damping = clamp_finite(self.global_damping, 0.0, 100.0, 0.1);
        self.bounds_restitution = clamp_finite(self.bounds_restitution, 0.0, 1.0, 0.2);
    }

    /// Cell size to use given the largest neighbour radius among behaviours.
    pub fn resolve_cell_size(&self, largest_neighbour_radius: f32) -> f32 {
        if self.cell_size > 0.0 {
            self.cell_size.max(MIN_CELL_SIZE)
        } else {
            largest_neighbour_radius.max(MIN_CELL_SIZE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_finite_values() {
        let mut config = SimulationConfig {
            cell_size: f32::NAN,
            max_grid_cells: 0,
            global_damping: f32::INFINITY,
            bounds_restitution: 3.0,
            ..SimulationConfig::default()
        };
        config.sanitize();
        assert_eq!(config.cell_size, 0.0);
        assert_eq!(config.max_grid_cells, 1);
        assert_eq!(config.global_damping, 0.1);
        assert_eq!(config.bounds_restitution, 1.0);
    }

    #[test]
    fn automatic_cell_size_follows_neighbour_radius() {
        let config = SimulationConfig::default();
        assert_eq!(config.resolve_cell_size(4.0), 4.0);
        assert_eq!(config.resolve_cell_size(0.0), MIN_CELL_SIZE);

        let fixed = SimulationConfig {
            cell_size: 2.5,
            ..SimulationConfig::default()
        };
        assert_eq!(fixed.resolve_cell_size(10.0), 2.5);
    }
}
