//! Spatial-grid fish schooling simulation core.
//!
//! [`FishSimulation`] owns every agent buffer and advances them one tick at a
//! time; the other modules are the stages of that tick.

pub mod aggregate;
pub mod attractor;
pub mod behaviour;
pub mod config;
pub mod environment;
pub mod error;
pub mod grid;
pub mod group_noise;
pub mod hash;
pub mod log;
pub mod math;
pub mod obstacle;
pub mod pattern;
pub mod pending;
pub mod simulation;
pub mod steering;
pub mod wasm;

pub use attractor::{AttractorData, AttractorShape, AttractorUsage};
pub use behaviour::{BehaviourSettings, MAX_RELATIONSHIP_TYPES};
pub use config::SimulationConfig;
pub use environment::{BoundsShape, EnvironmentBounds};
pub use error::{GridError, SimError};
pub use group_noise::{
    GroupNoiseCommon, GroupNoisePattern, SimpleSineNoise, SphereShellNoise, VerticalBandsNoise,
    VortexNoise,
};
pub use log::{LogCategory, LogLevel, SimLogger};
pub use math::MathMode;
pub use obstacle::{ObstacleData, ObstacleShape};
pub use pattern::{PatternHandle, PatternShape, PatternVolume};
pub use simulation::{
    AgentSpawn, FishSimulation, SimulationDesc, SpawnMode, StepHandle, StepOutcome, StepStats,
};
pub use wasm::Sim;
