//! Pattern volumes: geometric shells agents are pulled onto. Baked volumes
//! are a plain list; runtime volumes live in a generation-checked arena so a
//! handle to a stopped pattern can never touch a newer one in the same slot.

use glam::Vec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

use crate::behaviour::BehaviourSettings;
use crate::math::{normalize_or, saturate, EPSILON};

new_key_type! {
    /// Slot index plus generation of a runtime pattern.
    pub struct PatternHandle;
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum PatternShape {
    SphereShell { center: Vec3, radius: f32, thickness: f32 },
    BoxShell { center: Vec3, half_extents: Vec3, thickness: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternVolume {
    pub shape: PatternShape,
    pub strength: f32,
    /// Bit `t` set: behaviour type `t` follows this volume.
    pub behaviour_mask: u32,
}

impl PatternVolume {
    pub fn sphere_shell(center: Vec3, radius: f32, thickness: f32, strength: f32, behaviour_mask: u32) -> Self {
        Self {
            shape: PatternShape::SphereShell {
                center,
                radius,
                thickness,
            },
            strength,
            behaviour_mask,
        }
    }

    pub fn box_shell(
        center: Vec3,
        half_extents: Vec3,
        thickness: f32,
        strength: f32,
        behaviour_mask: u32,
    ) -> Self {
        Self {
            shape: PatternShape::BoxShell {
                center,
                half_extents,
                thickness,
            },
            strength,
            behaviour_mask,
        }
    }

    fn thickness(&self) -> f32 {
        match self.shape {
            PatternShape::SphereShell { thickness, .. } | PatternShape::BoxShell { thickness, .. } => thickness,
        }
    }

    /// Nearest point on the shell's mid surface.
    fn nearest_surface_point(&self, position: Vec3) -> Vec3 {
        match self.shape {
            PatternShape::SphereShell { center, radius, .. } => {
                center + normalize_or(position - center, Vec3::Y) * radius.max(0.0)
            }
            PatternShape::BoxShell {
                center, half_extents, ..
            } => {
                let half = half_extents.max(Vec3::ZERO);
                let local = position - center;
                let clamped = local.clamp(-half, half);
                if clamped != local {
                    return center + clamped;
                }
                // Inside: project onto the closest face.
                let gap = half - local.abs();
                let axis = if gap.x <= gap.y && gap.x <= gap.z {
                    0
                } else if gap.y <= gap.z {
                    1
                } else {
                    2
                };
                let mut surface = local;
                surface[axis] = if local[axis] >= 0.0 { half[axis] } else { -half[axis] };
                center + surface
            }
        }
    }

    /// Pull toward the shell for one agent. Fades to zero at the mid surface
    /// and saturates half a thickness away from it.
    pub fn steering(&self, behaviour_id: u32, position: Vec3) -> Vec3 {
        let thickness = self.thickness();
        if self.strength <= 0.0 || thickness <= 0.0 {
            return Vec3::ZERO;
        }
        if self.behaviour_mask & BehaviourSettings::affinity_bit(behaviour_id as usize) == 0 {
            return Vec3::ZERO;
        }

        let to_surface = self.nearest_surface_point(position) - position;
        let distance = to_surface.length();
        if distance <= EPSILON {
            return Vec3::ZERO;
        }
        let falloff = saturate(distance / (0.5 * thickness));
        to_surface / distance * self.strength * falloff
    }
}

/// Runtime-instanced volumes.
#[derive(Clone, Debug, Default)]
pub struct PatternArena {
    volumes: SlotMap<PatternHandle, PatternVolume>,
}

impl PatternArena {
    pub fn start(&mut self, volume: PatternVolume) -> PatternHandle {
        self.volumes.insert(volume)
    }

    /// False when the handle is stale or the new volume changes shape kind.
    pub fn update(&mut self, handle: PatternHandle, volume: PatternVolume) -> bool {
        match self.volumes.get_mut(handle) {
            Some(slot) if std::mem::discriminant(&slot.shape) == std::mem::discriminant(&volume.shape) => {
                *slot = volume;
                true
            }
            _ => false,
        }
    }

    pub fn stop(&mut self, handle: PatternHandle) -> bool {
        self.volumes.remove(handle).is_some()
    }

    pub fn get(&self, handle: PatternHandle) -> Option<&PatternVolume> {
        self.volumes.get(handle)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternVolume> {
        self.volumes.values()
    }
}

/// Writes the summed baked and runtime pattern pull for every agent.
pub fn pattern_steering_all(
    baked: &[PatternVolume],
    runtime: &PatternArena,
    positions: &[Vec3],
    behaviour_ids: &[u32],
    out: &mut [Vec3],
) {
    if baked.is_empty() && runtime.is_empty() {
        out.par_iter_mut().for_each(|steer| *steer = Vec3::ZERO);
        return;
    }
    // Flattened so the per-agent loop does not walk the slot map.
    let volumes: Vec<PatternVolume> = baked.iter().chain(runtime.iter()).copied().collect();
    out.par_iter_mut().enumerate().for_each(|(i, steer)| {
        let id = behaviour_ids.get(i).copied().unwrap_or(u32::MAX);
        *steer = volumes
            .iter()
            .map(|volume| volume.steering(id, positions[i]))
            .fold(Vec3::ZERO, |acc, v| acc + v);
    });
}
