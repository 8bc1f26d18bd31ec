use glam::Vec3;
use wasm_bindgen::prelude::*;

use crate::behaviour::BehaviourSettings;
use crate::config::SimulationConfig;
use crate::environment::EnvironmentBounds;
use crate::log::SimLogger;
use crate::math::MathMode;
use crate::simulation::{FishSimulation, SimulationDesc, SpawnMode};

/// Host binding: one school of default fish in a `width x height x depth`
/// box whose minimum corner is the origin.
#[wasm_bindgen]
pub struct Sim {
    inner: FishSimulation,
    count: usize,
    seed: u32,
    half: Vec3,
    math_mode: MathMode,
}

#[wasm_bindgen]
impl Sim {
    /// A `seed` of zero draws one from the OS.
    #[wasm_bindgen(constructor)]
    pub fn new(count: usize, seed: u32, width: f32, height: f32, depth: f32) -> Sim {
        let mut sim = Sim {
            inner: FishSimulation::new(),
            count,
            seed,
            half: Vec3::ONE,
            math_mode: MathMode::default(),
        };
        sim.set_bounds(width, height, depth);
        sim
    }

    /// Returns false when the tick was skipped.
    pub fn step(&mut self, dt: f32) -> bool {
        self.inner.schedule_step(dt).is_completed()
    }

    /// Re-initializes with new bounds, keeping count and seed.
    pub fn set_bounds(&mut self, width: f32, height: f32, depth: f32) -> bool {
        self.half = Vec3::new(width, height, depth).max(Vec3::splat(1.0)) * 0.5;
        self.reinitialize()
    }

    /// `1` selects the fast approximations, any other value accurate math.
    /// Re-initializes, keeping count, seed and bounds.
    pub fn set_math_mode(&mut self, mode: u32) -> bool {
        self.math_mode = MathMode::from_u32(mode);
        self.reinitialize()
    }

    pub fn math_mode(&self) -> u32 {
        self.math_mode.as_u32()
    }

    pub fn count(&self) -> usize {
        self.inner.agent_count()
    }

    pub fn time(&self) -> f32 {
        self.inner.time()
    }

    /// Interleaved `x, y, z` per agent.
    pub fn positions(&self) -> Vec<f32> {
        flatten(self.inner.positions())
    }

    /// Interleaved `x, y, z` per agent.
    pub fn velocities(&self) -> Vec<f32> {
        flatten(self.inner.velocities())
    }
}

impl Sim {
    fn reinitialize(&mut self) -> bool {
        let desc = SimulationDesc {
            agent_count: self.count,
            environment: EnvironmentBounds::cuboid(self.half, self.half),
            behaviours: vec![BehaviourSettings {
                group_mask: 1,
                ..BehaviourSettings::default()
            }],
            spawn: SpawnMode::Scatter,
            ..SimulationDesc::default()
        };
        let config = SimulationConfig {
            math_mode: self.math_mode,
            spawn_seed: (self.seed != 0).then_some(u64::from(self.seed)),
            ..SimulationConfig::default()
        };
        self.inner.initialize(desc, config, SimLogger::default()).is_ok()
    }
}

fn flatten(values: &[Vec3]) -> Vec<f32> {
    values.iter().flat_map(|v| v.to_array()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_steps_and_exports_flat_buffers() {
        let mut sim = Sim::new(10, 42, 20.0, 10.0, 20.0);
        assert_eq!(sim.count(), 10);
        assert!(sim.step(1.0 / 60.0));

        let positions = sim.positions();
        assert_eq!(positions.len(), 30);
        for p in positions.chunks(3) {
            assert!(p[0] >= 0.0 && p[0] <= 20.0);
            assert!(p[1] >= 0.0 && p[1] <= 10.0);
            assert!(p[2] >= 0.0 && p[2] <= 20.0);
        }
        assert_eq!(sim.velocities().len(), 30);
    }

    #[test]
    fn seed_makes_spawn_reproducible() {
        let a = Sim::new(5, 9, 10.0, 10.0, 10.0);
        let b = Sim::new(5, 9, 10.0, 10.0, 10.0);
        assert_eq!(a.positions(), b.positions());
    }

    #[test]
    fn math_mode_switch_reinitializes_same_school() {
        let mut sim = Sim::new(8, 3, 10.0, 10.0, 10.0);
        assert_eq!(sim.math_mode(), 0);
        let before = sim.positions();

        assert!(sim.set_math_mode(1));
        assert_eq!(sim.math_mode(), 1);
        assert_eq!(sim.count(), 8);
        assert_eq!(sim.positions(), before);
        assert!(sim.step(1.0 / 60.0));

        assert!(sim.set_math_mode(7));
        assert_eq!(sim.math_mode(), 0);
    }
}
