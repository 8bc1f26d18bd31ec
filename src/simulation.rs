//! `FishSimulation`: lifecycle, deferred mutation and the per-tick frame graph.
//!
//! One tick runs these stages in order, each internally parallel:
//!
//! 1. apply pending changes
//! 2. agent grid rebuild + bounds probe, obstacle grid, attractor grid
//! 3. obstacle avoidance, attraction, group-noise field, pattern volumes
//! 4. neighbour aggregation
//! 5. steering into the back velocity buffer
//! 6. position integration, then the velocity buffers swap
//!
//! `schedule_step` takes `&mut self`, so no caller can read or mutate state
//! while a tick is running.

use glam::Vec3;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace_span;

use crate::aggregate::{aggregate_all, AggregateInputs, NeighbourAggregate};
use crate::attractor::{self, AttractorData, AttractorGrid};
use crate::behaviour::{BehaviourSettings, BehaviourTable};
use crate::config::SimulationConfig;
use crate::environment::{BoundsShape, EnvironmentBounds, WallProbe};
use crate::error::SimError;
use crate::grid::{AgentGrid, GridLayout};
use crate::group_noise::{
    GroupNoiseCommon, GroupNoiseField, GroupNoisePattern, SimpleSineNoise, SphereShellNoise,
    VerticalBandsNoise, VortexNoise,
};
use crate::log::{LogCategory, SimLogger};
use crate::math::{clamp_finite, is_finite_vec};
use crate::obstacle::{avoidance_steering, ObstacleData, ObstacleGrid};
use crate::pattern::{pattern_steering_all, PatternArena, PatternHandle, PatternVolume};
use crate::pending::{ChangeTargets, PendingChange, PendingChanges};
use crate::steering::{integrate_positions, integrate_velocities, SteeringInputs};

/// Longest tick accepted; larger deltas are clamped.
pub const MAX_STEP_DT: f32 = 0.25;

/// Used when the OS entropy source is unavailable.
const FALLBACK_SPAWN_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Scatter spawning keeps agents this fraction away from the walls.
const SPAWN_FILL: f32 = 0.9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSpawn {
    pub position: Vec3,
    pub velocity: Vec3,
    pub behaviour_id: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum SpawnMode {
    /// Uniform positions inside the bounds, random headings at desired speed,
    /// behaviour ids assigned round-robin.
    #[default]
    Scatter,
    Explicit(Vec<AgentSpawn>),
}

/// Everything `initialize` needs besides config and logger.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationDesc {
    pub agent_count: usize,
    pub environment: EnvironmentBounds,
    pub behaviours: Vec<BehaviourSettings>,
    pub obstacles: Vec<ObstacleData>,
    pub attractors: Vec<AttractorData>,
    pub spawn: SpawnMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStats {
    pub tick: u64,
    pub neighbours_visited: u64,
    /// `(cell, agent)` pairs in the packed grid, including multi-cell stamps.
    pub grid_entries: usize,
    pub touched_cells: usize,
    /// Agents with a nonzero wall or avoid danger.
    pub agents_in_danger: usize,
    /// Non-finite agents reset by state validation.
    pub repaired_agents: usize,
    pub obstacle_grid_rebuilt: bool,
    pub attractor_grid_rebuilt: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// The tick did not run; nothing was integrated.
    Skipped(SimError),
}

/// Completion handle for one tick. The tick has already finished by the time
/// the handle is returned.
#[must_use]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepHandle {
    tick: u64,
    outcome: StepOutcome,
}

impl StepHandle {
    fn completed(tick: u64) -> Self {
        Self {
            tick,
            outcome: StepOutcome::Completed,
        }
    }

    fn skipped(tick: u64, error: SimError) -> Self {
        Self {
            tick,
            outcome: StepOutcome::Skipped(error),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == StepOutcome::Completed
    }

    pub fn outcome(&self) -> &StepOutcome {
        &self.outcome
    }

    pub fn wait(self) -> StepOutcome {
        self.outcome
    }
}

#[derive(Debug, Default)]
pub struct FishSimulation {
    state: Option<SimState>,
    logger: SimLogger,
}

#[derive(Debug)]
struct SimState {
    config: SimulationConfig,
    logger: SimLogger,
    behaviours: BehaviourTable,
    bounds: EnvironmentBounds,
    layout: GridLayout,

    agent_grid: AgentGrid,
    obstacle_grid: ObstacleGrid,
    attractor_grid: AttractorGrid,
    noise: GroupNoiseField,

    positions: Vec<Vec3>,
    previous_positions: Vec<Vec3>,
    velocity_front: Vec<Vec3>,
    velocity_back: Vec<Vec3>,
    behaviour_ids: Vec<u32>,

    aggregates: Vec<NeighbourAggregate>,
    wall_probes: Vec<WallProbe>,
    obstacle_steering: Vec<Vec3>,
    attraction_steering: Vec<Vec3>,
    pattern_steering: Vec<Vec3>,

    obstacles: Vec<ObstacleData>,
    attractors: Vec<AttractorData>,
    baked_patterns: Vec<PatternVolume>,
    patterns: PatternArena,
    pending: PendingChanges,

    time: f32,
    tick: u64,
    last_stats: StepStats,
}

impl FishSimulation {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)allocates every buffer. Prior state is disposed first, so calling
    /// this again is safe.
    pub fn initialize(
        &mut self,
        desc: SimulationDesc,
        mut config: SimulationConfig,
        logger: SimLogger,
    ) -> Result<(), SimError> {
        if self.state.is_some() {
            self.dispose();
        }
        self.logger = logger.clone();

        let mut behaviours = BehaviourTable::new(desc.behaviours, &logger);
        if behaviours.is_empty() {
            logger.error(LogCategory::Lifecycle, format_args!("initialize called without behaviours"));
            return Err(SimError::NoBehaviours);
        }
        if let SpawnMode::Explicit(agents) = &desc.spawn {
            if agents.len() != desc.agent_count {
                let error = SimError::SpawnCountMismatch {
                    expected: desc.agent_count,
                    actual: agents.len(),
                };
                logger.error(LogCategory::Lifecycle, format_args!("{error}"));
                return Err(error);
            }
        }

        config.sanitize();
        let mut bounds = desc.environment;
        bounds.sanitize();

        let cell_size = config.resolve_cell_size(behaviours.max_neighbour_radius());
        let layout = GridLayout::covering(&bounds, cell_size, config.max_grid_cells, &logger);
        behaviours.derive_search_radii(layout.cell_size());

        let count = desc.agent_count;
        let (positions, velocities, behaviour_ids) = match desc.spawn {
            SpawnMode::Scatter => {
                let seed = config.spawn_seed.unwrap_or_else(|| entropy_seed(&logger));
                scatter_agents(count, &bounds, &behaviours, seed)
            }
            SpawnMode::Explicit(agents) => explicit_agents(&agents, &bounds, config.bounds_restitution),
        };
        let unknown = behaviour_ids
            .iter()
            .filter(|&&id| behaviours.get(id).is_none())
            .count();
        if unknown > 0 {
            logger.warn(
                LogCategory::Behaviour,
                format_args!("{unknown} agents reference a missing behaviour and will be ignored"),
            );
        }

        let agent_grid = AgentGrid::allocate(layout, count, behaviours.max_body_radius());
        let resolution = layout.resolution();
        logger.info(
            LogCategory::Lifecycle,
            format_args!(
                "initialized {count} agents, {} behaviours, grid {}x{}x{} cells of {:.3} ({} cells per agent)",
                behaviours.len(),
                resolution.x,
                resolution.y,
                resolution.z,
                layout.cell_size(),
                agent_grid.max_cells_per_agent()
            ),
        );

        self.state = Some(SimState {
            logger,
            behaviours,
            bounds,
            layout,
            agent_grid,
            obstacle_grid: ObstacleGrid::allocate(&layout),
            attractor_grid: AttractorGrid::allocate(&layout),
            noise: GroupNoiseField::allocate(&layout),
            previous_positions: if cfg!(debug_assertions) {
                positions.clone()
            } else {
                Vec::new()
            },
            positions,
            velocity_back: velocities.clone(),
            velocity_front: velocities,
            behaviour_ids,
            aggregates: vec![NeighbourAggregate::default(); count],
            wall_probes: vec![WallProbe::default(); count],
            obstacle_steering: vec![Vec3::ZERO; count],
            attraction_steering: vec![Vec3::ZERO; count],
            pattern_steering: vec![Vec3::ZERO; count],
            obstacles: desc.obstacles,
            attractors: desc.attractors,
            baked_patterns: Vec::new(),
            patterns: PatternArena::default(),
            pending: PendingChanges::default(),
            time: 0.0,
            tick: 0,
            last_stats: StepStats::default(),
            config,
        });
        Ok(())
    }

    /// Advances one tick. Positions and velocities reflect the tick once the
    /// returned handle exists.
    pub fn schedule_step(&mut self, dt: f32) -> StepHandle {
        match self.state.as_mut() {
            Some(state) => state.step(dt),
            None => {
                self.logger
                    .error(LogCategory::Lifecycle, format_args!("step scheduled before initialize"));
                StepHandle::skipped(0, SimError::NotInitialized)
            }
        }
    }

    /// Releases every buffer. Pending changes and runtime patterns are dropped.
    pub fn dispose(&mut self) {
        if let Some(state) = self.state.take() {
            state.logger.info(
                LogCategory::Lifecycle,
                format_args!("disposed simulation after {} ticks", state.tick),
            );
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn agent_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.positions.len())
    }

    pub fn positions(&self) -> &[Vec3] {
        self.state.as_ref().map(|s| s.positions.as_slice()).unwrap_or_default()
    }

    pub fn velocities(&self) -> &[Vec3] {
        self.state.as_ref().map(|s| s.velocity_front.as_slice()).unwrap_or_default()
    }

    pub fn behaviour_ids(&self) -> &[u32] {
        self.state.as_ref().map(|s| s.behaviour_ids.as_slice()).unwrap_or_default()
    }

    pub fn obstacles(&self) -> &[ObstacleData] {
        self.state.as_ref().map(|s| s.obstacles.as_slice()).unwrap_or_default()
    }

    pub fn attractors(&self) -> &[AttractorData] {
        self.state.as_ref().map(|s| s.attractors.as_slice()).unwrap_or_default()
    }

    pub fn bounds(&self) -> Option<&EnvironmentBounds> {
        self.state.as_ref().map(|s| &s.bounds)
    }

    pub fn layout(&self) -> Option<&GridLayout> {
        self.state.as_ref().map(|s| &s.layout)
    }

    pub fn behaviour(&self, id: u32) -> Option<&BehaviourSettings> {
        self.state.as_ref().and_then(|s| s.behaviours.get(id))
    }

    pub fn last_stats(&self) -> StepStats {
        self.state.as_ref().map_or_else(StepStats::default, |s| s.last_stats)
    }

    pub fn tick(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.tick)
    }

    pub fn time(&self) -> f32 {
        self.state.as_ref().map_or(0.0, |s| s.time)
    }

    pub fn pending_changes(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.pending.len())
    }

    /// Staged until the next step. The slice must hold one id per agent.
    pub fn set_agent_behaviour_ids(&mut self, ids: &[u32]) -> bool {
        let Some(state) = self.state_or_warn("set_agent_behaviour_ids") else {
            return false;
        };
        if ids.len() != state.positions.len() {
            state.logger.warn(
                LogCategory::Behaviour,
                format_args!(
                    "behaviour id update holds {} ids for {} agents; ignored",
                    ids.len(),
                    state.positions.len()
                ),
            );
            return false;
        }
        state.pending.push(PendingChange::BehaviourIds(ids.to_vec()));
        true
    }

    /// Staged until the next step.
    pub fn set_obstacle_data(&mut self, index: usize, data: ObstacleData) -> bool {
        let Some(state) = self.state_or_warn("set_obstacle_data") else {
            return false;
        };
        if index >= state.obstacles.len() {
            state.logger.warn(
                LogCategory::Environment,
                format_args!("obstacle index {index} out of range ({})", state.obstacles.len()),
            );
            return false;
        }
        state.pending.push(PendingChange::Obstacle { index, data });
        true
    }

    /// Staged until the next step.
    pub fn set_attractor_data(&mut self, index: usize, data: AttractorData) -> bool {
        let Some(state) = self.state_or_warn("set_attractor_data") else {
            return false;
        };
        if index >= state.attractors.len() {
            state.logger.warn(
                LogCategory::Environment,
                format_args!("attractor index {index} out of range ({})", state.attractors.len()),
            );
            return false;
        }
        state.pending.push(PendingChange::Attractor { index, data });
        true
    }

    pub fn rebuild_attractor_grid(&mut self) -> bool {
        let Some(state) = self.state_or_warn("rebuild_attractor_grid") else {
            return false;
        };
        state.pending.push(PendingChange::RebuildAttractorGrid);
        true
    }

    pub fn set_group_noise_simple_sine(&mut self, common: GroupNoiseCommon, payload: SimpleSineNoise) -> bool {
        self.set_group_noise(common, GroupNoisePattern::SimpleSine(payload))
    }

    pub fn set_group_noise_vertical_bands(&mut self, common: GroupNoiseCommon, payload: VerticalBandsNoise) -> bool {
        self.set_group_noise(common, GroupNoisePattern::VerticalBands(payload))
    }

    pub fn set_group_noise_vortex(&mut self, common: GroupNoiseCommon, payload: VortexNoise) -> bool {
        self.set_group_noise(common, GroupNoisePattern::Vortex(payload))
    }

    pub fn set_group_noise_sphere_shell(&mut self, common: GroupNoiseCommon, payload: SphereShellNoise) -> bool {
        self.set_group_noise(common, GroupNoisePattern::SphereShell(payload))
    }

    /// Replaces the active group-noise pattern; only one is active at a time.
    pub fn set_group_noise(&mut self, common: GroupNoiseCommon, pattern: GroupNoisePattern) -> bool {
        let Some(state) = self.state_or_warn("set_group_noise") else {
            return false;
        };
        state.logger.debug(LogCategory::Noise, format_args!("group noise set to {pattern:?}"));
        state.noise.set(common, pattern);
        true
    }

    pub fn clear_group_noise(&mut self) -> bool {
        let Some(state) = self.state_or_warn("clear_group_noise") else {
            return false;
        };
        state.noise.clear();
        true
    }

    pub fn group_noise(&self) -> Option<&(GroupNoiseCommon, GroupNoisePattern)> {
        self.state.as_ref().and_then(|s| s.noise.active())
    }

    /// Returns the null handle when the simulation is not initialized.
    pub fn start_pattern_sphere_shell(
        &mut self,
        center: Vec3,
        radius: f32,
        thickness: f32,
        strength: f32,
        behaviour_mask: u32,
    ) -> PatternHandle {
        self.start_pattern(PatternVolume::sphere_shell(center, radius, thickness, strength, behaviour_mask))
    }

    /// Returns the null handle when the simulation is not initialized.
    pub fn start_pattern_box_shell(
        &mut self,
        center: Vec3,
        half_extents: Vec3,
        thickness: f32,
        strength: f32,
        behaviour_mask: u32,
    ) -> PatternHandle {
        self.start_pattern(PatternVolume::box_shell(center, half_extents, thickness, strength, behaviour_mask))
    }

    pub fn update_pattern_sphere_shell(
        &mut self,
        handle: PatternHandle,
        center: Vec3,
        radius: f32,
        thickness: f32,
        strength: f32,
        behaviour_mask: u32,
    ) -> bool {
        self.update_pattern(
            handle,
            PatternVolume::sphere_shell(center, radius, thickness, strength, behaviour_mask),
        )
    }

    pub fn update_pattern_box_shell(
        &mut self,
        handle: PatternHandle,
        center: Vec3,
        half_extents: Vec3,
        thickness: f32,
        strength: f32,
        behaviour_mask: u32,
    ) -> bool {
        self.update_pattern(
            handle,
            PatternVolume::box_shell(center, half_extents, thickness, strength, behaviour_mask),
        )
    }

    /// False for stale handles; a stopped pattern's slot may already hold a
    /// newer pattern, which is left untouched.
    pub fn stop_pattern(&mut self, handle: PatternHandle) -> bool {
        let Some(state) = self.state_or_warn("stop_pattern") else {
            return false;
        };
        let stopped = state.patterns.stop(handle);
        if !stopped {
            state
                .logger
                .debug(LogCategory::Pattern, format_args!("stop_pattern with stale handle {handle:?}"));
        }
        stopped
    }

    pub fn active_patterns(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.patterns.len())
    }

    /// Replaces the baked pattern list.
    pub fn set_baked_patterns(&mut self, patterns: Vec<PatternVolume>) -> bool {
        let Some(state) = self.state_or_warn("set_baked_patterns") else {
            return false;
        };
        state.logger.debug(
            LogCategory::Pattern,
            format_args!("{} baked pattern volumes", patterns.len()),
        );
        state.baked_patterns = patterns;
        true
    }

    fn start_pattern(&mut self, volume: PatternVolume) -> PatternHandle {
        match self.state_or_warn("start_pattern") {
            Some(state) => state.patterns.start(volume),
            None => PatternHandle::default(),
        }
    }

    fn update_pattern(&mut self, handle: PatternHandle, volume: PatternVolume) -> bool {
        let Some(state) = self.state_or_warn("update_pattern") else {
            return false;
        };
        let updated = state.patterns.update(handle, volume);
        if !updated {
            state.logger.debug(
                LogCategory::Pattern,
                format_args!("update rejected for pattern handle {handle:?}"),
            );
        }
        updated
    }

    fn state_or_warn(&mut self, operation: &str) -> Option<&mut SimState> {
        if self.state.is_none() {
            self.logger.warn(
                LogCategory::Lifecycle,
                format_args!("{operation} called before initialize"),
            );
        }
        self.state.as_mut()
    }
}

impl SimState {
    fn step(&mut self, dt: f32) -> StepHandle {
        let tick = self.tick + 1;
        let _step_span = trace_span!("fish_step", tick).entered();

        // Nothing may change before this check, so a failure leaves no partial tick.
        if let Err(error) = self.agent_grid.ready_for(self.positions.len()) {
            self.logger
                .error(LogCategory::Grid, format_args!("agent grid not ready: {error}; tick {tick} skipped"));
            return StepHandle::skipped(tick, error.into());
        }
        let dt = clamp_finite(dt, 0.0, MAX_STEP_DT, 0.0);
        let time = self.time;
        let layout = self.layout;

        let SimState {
            config,
            logger,
            behaviours,
            bounds,
            agent_grid,
            obstacle_grid,
            attractor_grid,
            noise,
            positions,
            previous_positions,
            velocity_front,
            velocity_back,
            behaviour_ids,
            aggregates,
            wall_probes,
            obstacle_steering,
            attraction_steering,
            pattern_steering,
            obstacles,
            attractors,
            baked_patterns,
            patterns,
            pending,
            ..
        } = &mut *self;

        {
            let _stage = trace_span!("apply_pending").entered();
            let applied = pending.apply(ChangeTargets {
                behaviour_ids: behaviour_ids.as_mut_slice(),
                obstacles: obstacles.as_mut_slice(),
                attractors: attractors.as_mut_slice(),
            });
            if applied.obstacles {
                obstacle_grid.mark_dirty();
            }
            if applied.attractors {
                attractor_grid.mark_dirty();
            }
            if applied.behaviour_ids {
                logger.debug(LogCategory::Behaviour, format_args!("behaviour ids updated"));
            }
        }
        if cfg!(debug_assertions) {
            previous_positions.copy_from_slice(positions.as_slice());
        }

        let (grid_result, (obstacle_grid_rebuilt, attractor_grid_rebuilt)) = {
            let _stage = trace_span!("rebuild_grids").entered();
            let positions = positions.as_slice();
            let behaviour_ids = behaviour_ids.as_slice();
            let behaviours = &*behaviours;
            let bounds = &*bounds;
            let obstacles = obstacles.as_slice();
            let attractors = attractors.as_slice();
            rayon::join(
                || {
                    let result =
                        agent_grid.rebuild(positions, |i| behaviours.body_radius(behaviour_ids[i]));
                    wall_probes
                        .par_iter_mut()
                        .zip(positions.par_iter())
                        .for_each(|(probe, &position)| *probe = bounds.probe(position));
                    result
                },
                || {
                    rayon::join(
                        || obstacle_grid.rebuild_if_dirty(&layout, obstacles),
                        || attractor_grid.rebuild_if_dirty(&layout, attractors),
                    )
                },
            )
        };
        if let Err(error) = grid_result {
            logger.error(LogCategory::Grid, format_args!("agent grid rebuild failed: {error}; tick {tick} skipped"));
            return StepHandle::skipped(tick, error.into());
        }
        if obstacle_grid_rebuilt {
            logger.debug(LogCategory::Environment, format_args!("obstacle grid rebuilt"));
        }
        if attractor_grid_rebuilt {
            logger.debug(LogCategory::Environment, format_args!("attractor grid rebuilt"));
        }

        {
            let _stage = trace_span!("sample_environment").entered();
            let positions = positions.as_slice();
            let velocities = velocity_front.as_slice();
            let behaviour_ids = behaviour_ids.as_slice();
            let behaviours = &*behaviours;
            let bounds = &*bounds;
            let obstacle_grid = &*obstacle_grid;
            let attractor_grid = &*attractor_grid;
            let obstacles = obstacles.as_slice();
            let attractors = attractors.as_slice();
            let baked_patterns = baked_patterns.as_slice();
            let patterns = &*patterns;
            rayon::join(
                || {
                    rayon::join(
                        || {
                            if obstacles.is_empty() {
                                obstacle_steering.par_iter_mut().for_each(|s| *s = Vec3::ZERO);
                                return;
                            }
                            obstacle_steering.par_iter_mut().enumerate().for_each(|(i, steer)| {
                                *steer = avoidance_steering(
                                    &layout,
                                    obstacle_grid,
                                    obstacles,
                                    positions[i],
                                    velocities[i],
                                );
                            });
                        },
                        || {
                            if attractors.is_empty() {
                                attraction_steering.par_iter_mut().for_each(|s| *s = Vec3::ZERO);
                                return;
                            }
                            attraction_steering.par_iter_mut().enumerate().for_each(|(i, steer)| {
                                let id = behaviour_ids[i];
                                *steer = match behaviours.get(id) {
                                    Some(behaviour) => attractor::attraction_steering(
                                        &layout,
                                        attractor_grid,
                                        attractors,
                                        bounds,
                                        behaviour,
                                        id,
                                        positions[i],
                                    ),
                                    None => Vec3::ZERO,
                                };
                            });
                        },
                    )
                },
                || {
                    rayon::join(
                        || noise.update(&layout, time),
                        || {
                            pattern_steering_all(
                                baked_patterns,
                                patterns,
                                positions,
                                behaviour_ids,
                                pattern_steering,
                            )
                        },
                    )
                },
            );
        }

        {
            let _stage = trace_span!("aggregate_neighbours").entered();
            let inputs = AggregateInputs {
                layout: &layout,
                grid: &*agent_grid,
                behaviours: &*behaviours,
                positions: positions.as_slice(),
                velocities: velocity_front.as_slice(),
                behaviour_ids: behaviour_ids.as_slice(),
            };
            aggregate_all(&inputs, aggregates.as_mut_slice());
        }

        {
            let _stage = trace_span!("steer").entered();
            let inputs = SteeringInputs {
                behaviours: &*behaviours,
                bounds: &*bounds,
                layout: &layout,
                math_mode: config.math_mode,
                global_damping: config.global_damping,
                positions: positions.as_slice(),
                velocities: velocity_front.as_slice(),
                behaviour_ids: behaviour_ids.as_slice(),
                aggregates: aggregates.as_slice(),
                wall_probes: wall_probes.as_slice(),
                obstacle_steering: obstacle_steering.as_slice(),
                attraction_steering: attraction_steering.as_slice(),
                pattern_steering: pattern_steering.as_slice(),
                group_noise: &*noise,
                time,
                dt,
            };
            integrate_velocities(&inputs, velocity_back.as_mut_slice());
        }

        {
            let _stage = trace_span!("integrate_positions").entered();
            integrate_positions(bounds, config.bounds_restitution, dt, positions.as_mut_slice(), velocity_back.as_mut_slice());
        }

        let repaired_agents = if cfg!(debug_assertions) {
            repair_non_finite(positions, previous_positions, velocity_back, velocity_front)
        } else {
            0
        };
        if repaired_agents > 0 {
            logger.error(
                LogCategory::Lifecycle,
                format_args!("{repaired_agents} agents had non-finite state on tick {tick}; restored previous values"),
            );
        }

        std::mem::swap(velocity_front, velocity_back);

        let agents_in_danger = aggregates
            .par_iter()
            .zip(wall_probes.par_iter())
            .filter(|(aggregate, probe)| aggregate.avoid_danger > 0.0 || probe.danger > 0.0)
            .count();
        let neighbours_visited = aggregates
            .par_iter()
            .map(|aggregate| u64::from(aggregate.neighbours_checked))
            .sum::<u64>();

        self.last_stats = StepStats {
            tick,
            neighbours_visited,
            grid_entries: self.agent_grid.occupied(),
            touched_cells: self.agent_grid.touched_cells(),
            agents_in_danger,
            repaired_agents,
            obstacle_grid_rebuilt,
            attractor_grid_rebuilt,
        };
        self.time += dt;
        self.tick = tick;
        StepHandle::completed(tick)
    }
}

/// Resets agents whose position or velocity went non-finite to the values
/// they had before the tick. Returns how many were reset.
fn repair_non_finite(
    positions: &mut [Vec3],
    previous_positions: &[Vec3],
    velocities: &mut [Vec3],
    previous_velocities: &[Vec3],
) -> usize {
    positions
        .par_iter_mut()
        .zip(velocities.par_iter_mut())
        .enumerate()
        .map(|(i, (position, velocity))| {
            if is_finite_vec(*position) && is_finite_vec(*velocity) {
                return 0;
            }
            *position = previous_positions.get(i).copied().unwrap_or(Vec3::ZERO);
            *velocity = previous_velocities.get(i).copied().unwrap_or(Vec3::ZERO);
            1
        })
        .sum()
}

fn entropy_seed(logger: &SimLogger) -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::fill(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        Err(error) => {
            logger.warn(
                LogCategory::Lifecycle,
                format_args!("entropy source unavailable ({error}); using fixed spawn seed"),
            );
            FALLBACK_SPAWN_SEED
        }
    }
}

fn scatter_agents(
    count: usize,
    bounds: &EnvironmentBounds,
    behaviours: &BehaviourTable,
    seed: u64,
) -> (Vec<Vec3>, Vec<Vec3>, Vec<u32>) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut positions = Vec::with_capacity(count);
    let mut velocities = Vec::with_capacity(count);
    let mut ids = Vec::with_capacity(count);
    let types = behaviours.len().max(1);

    for i in 0..count {
        let id = (i % types) as u32;
        let offset = match bounds.shape {
            BoundsShape::Box { half_extents } => {
                random_in_unit_cube(&mut rng) * half_extents * SPAWN_FILL
            }
            BoundsShape::Sphere { radius } => random_in_unit_ball(&mut rng) * radius * SPAWN_FILL,
        };
        let speed = behaviours.get(id).map_or(0.0, |b| b.desired_speed);
        positions.push(bounds.center + offset);
        velocities.push(random_direction(&mut rng) * speed);
        ids.push(id);
    }
    (positions, velocities, ids)
}

fn explicit_agents(
    agents: &[AgentSpawn],
    bounds: &EnvironmentBounds,
    restitution: f32,
) -> (Vec<Vec3>, Vec<Vec3>, Vec<u32>) {
    let mut positions = Vec::with_capacity(agents.len());
    let mut velocities = Vec::with_capacity(agents.len());
    let mut ids = Vec::with_capacity(agents.len());
    for agent in agents {
        let position = if is_finite_vec(agent.position) {
            agent.position
        } else {
            bounds.center
        };
        let velocity = if is_finite_vec(agent.velocity) {
            agent.velocity
        } else {
            Vec3::ZERO
        };
        let (position, velocity) = bounds.contain(position, velocity, restitution);
        positions.push(position);
        velocities.push(velocity);
        ids.push(agent.behaviour_id);
    }
    (positions, velocities, ids)
}

fn random_in_unit_cube(rng: &mut SmallRng) -> Vec3 {
    Vec3::new(
        rng.gen_range(-1.0..=1.0),
        rng.gen_range(-1.0..=1.0),
        rng.gen_range(-1.0..=1.0),
    )
}

fn random_in_unit_ball(rng: &mut SmallRng) -> Vec3 {
    loop {
        let candidate = random_in_unit_cube(rng);
        if candidate.length_squared() <= 1.0 {
            return candidate;
        }
    }
}

fn random_direction(rng: &mut SmallRng) -> Vec3 {
    loop {
        let candidate = random_in_unit_cube(rng);
        let len_sq = candidate.length_squared();
        if len_sq > 1.0e-4 && len_sq <= 1.0 {
            return candidate / len_sq.sqrt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GridError;

    fn desc(agent_count: usize) -> SimulationDesc {
        SimulationDesc {
            agent_count,
            environment: EnvironmentBounds::cuboid(Vec3::ZERO, Vec3::splat(10.0)),
            behaviours: vec![BehaviourSettings {
                group_mask: 1,
                ..BehaviourSettings::default()
            }],
            ..SimulationDesc::default()
        }
    }

    fn seeded() -> SimulationConfig {
        SimulationConfig {
            spawn_seed: Some(7),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn step_before_initialize_is_skipped() {
        let mut sim = FishSimulation::new();
        let handle = sim.schedule_step(0.1);
        assert_eq!(handle.wait(), StepOutcome::Skipped(SimError::NotInitialized));
        assert!(sim.positions().is_empty());
        assert!(!sim.set_obstacle_data(0, ObstacleData::sphere(Vec3::ZERO, 1.0)));
        assert_eq!(
            sim.start_pattern_sphere_shell(Vec3::ZERO, 1.0, 1.0, 1.0, 1),
            PatternHandle::default()
        );
    }

    #[test]
    fn initialize_requires_behaviours() {
        let mut sim = FishSimulation::new();
        let result = sim.initialize(
            SimulationDesc {
                behaviours: Vec::new(),
                ..desc(4)
            },
            seeded(),
            SimLogger::silent(),
        );
        assert_eq!(result, Err(SimError::NoBehaviours));
        assert!(!sim.is_initialized());
    }

    #[test]
    fn explicit_spawn_count_must_match() {
        let mut sim = FishSimulation::new();
        let result = sim.initialize(
            SimulationDesc {
                spawn: SpawnMode::Explicit(vec![AgentSpawn {
                    position: Vec3::ZERO,
                    velocity: Vec3::ZERO,
                    behaviour_id: 0,
                }]),
                ..desc(3)
            },
            seeded(),
            SimLogger::silent(),
        );
        assert_eq!(
            result,
            Err(SimError::SpawnCountMismatch {
                expected: 3,
                actual: 1
            })
        );
    }

    #[test]
    fn seeded_scatter_is_reproducible_and_inside_bounds() {
        let mut a = FishSimulation::new();
        let mut b = FishSimulation::new();
        assert!(a.initialize(desc(64), seeded(), SimLogger::silent()).is_ok());
        assert!(b.initialize(desc(64), seeded(), SimLogger::silent()).is_ok());
        assert_eq!(a.positions(), b.positions());

        let bounds = EnvironmentBounds::cuboid(Vec3::ZERO, Vec3::splat(10.0));
        assert!(a.positions().iter().all(|&p| bounds.contains(p, 0.0)));
        for v in a.velocities() {
            assert!((v.length() - 1.5).abs() < 1.0e-4);
        }
    }

    #[test]
    fn reinitialize_replaces_state() {
        let mut sim = FishSimulation::new();
        assert!(sim.initialize(desc(16), seeded(), SimLogger::silent()).is_ok());
        let _ = sim.schedule_step(0.1);
        assert_eq!(sim.tick(), 1);

        assert!(sim.initialize(desc(8), seeded(), SimLogger::silent()).is_ok());
        assert_eq!(sim.agent_count(), 8);
        assert_eq!(sim.tick(), 0);
        assert_eq!(sim.active_patterns(), 0);
    }

    #[test]
    fn step_advances_time_and_reports_stats() {
        let mut sim = FishSimulation::new();
        assert!(sim.initialize(desc(32), seeded(), SimLogger::silent()).is_ok());
        let handle = sim.schedule_step(0.05);
        assert!(handle.is_completed());
        assert_eq!(handle.tick(), 1);
        assert!((sim.time() - 0.05).abs() < 1.0e-6);

        let stats = sim.last_stats();
        assert_eq!(stats.tick, 1);
        assert!(stats.grid_entries >= 32);
        assert!(stats.touched_cells > 0);
        assert_eq!(stats.repaired_agents, 0);
    }

    #[test]
    fn oversized_dt_is_clamped() {
        let mut sim = FishSimulation::new();
        assert!(sim.initialize(desc(4), seeded(), SimLogger::silent()).is_ok());
        let _ = sim.schedule_step(10.0);
        assert!((sim.time() - MAX_STEP_DT).abs() < 1.0e-6);
    }

    #[test]
    fn behaviour_ids_apply_on_next_step() {
        let behaviours = vec![BehaviourSettings::default(), BehaviourSettings::default()];
        let mut sim = FishSimulation::new();
        assert!(sim
            .initialize(
                SimulationDesc {
                    behaviours,
                    ..desc(4)
                },
                seeded(),
                SimLogger::silent()
            )
            .is_ok());
        assert_eq!(sim.behaviour_ids(), &[0, 1, 0, 1]);

        assert!(!sim.set_agent_behaviour_ids(&[1, 1]));
        assert!(sim.set_agent_behaviour_ids(&[1, 1, 1, 1]));
        assert_eq!(sim.behaviour_ids(), &[0, 1, 0, 1]);
        let _ = sim.schedule_step(0.1);
        assert_eq!(sim.behaviour_ids(), &[1, 1, 1, 1]);
    }

    #[test]
    fn unready_grid_skips_without_touching_state() {
        let mut sim = FishSimulation::new();
        let with_obstacle = SimulationDesc {
            obstacles: vec![ObstacleData::sphere(Vec3::splat(8.0), 1.0)],
            ..desc(4)
        };
        assert!(sim.initialize(with_obstacle, seeded(), SimLogger::silent()).is_ok());
        let positions = sim.positions().to_vec();
        assert!(sim.set_obstacle_data(0, ObstacleData::sphere(Vec3::ZERO, 1.0)));

        if let Some(state) = sim.state.as_mut() {
            state.agent_grid = AgentGrid::default();
        }
        let handle = sim.schedule_step(0.1);
        assert_eq!(
            handle.wait(),
            StepOutcome::Skipped(SimError::Grid(GridError::NotAllocated))
        );
        assert_eq!(sim.pending_changes(), 1);
        assert_eq!(sim.obstacles()[0].position, Vec3::splat(8.0));
        assert_eq!(sim.positions(), positions.as_slice());
        assert_eq!(sim.tick(), 0);
    }

    #[test]
    fn non_finite_state_is_restored() {
        let mut positions = vec![Vec3::new(f32::NAN, 0.0, 0.0), Vec3::ONE];
        let previous = vec![Vec3::X, Vec3::ONE];
        let mut velocities = vec![Vec3::ZERO, Vec3::new(0.0, f32::INFINITY, 0.0)];
        let previous_velocities = vec![Vec3::Y, Vec3::Z];
        let repaired = repair_non_finite(&mut positions, &previous, &mut velocities, &previous_velocities);
        assert_eq!(repaired, 2);
        assert_eq!(positions, vec![Vec3::X, Vec3::ONE]);
        assert_eq!(velocities, vec![Vec3::Y, Vec3::Z]);
    }
}
