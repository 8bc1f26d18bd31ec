use crate::attractor::AttractorData;
use crate::obstacle::ObstacleData;

/// One staged change, applied in submission order.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingChange {
    BehaviourIds(Vec<u32>),
    Obstacle { index: usize, data: ObstacleData },
    Attractor { index: usize, data: AttractorData },
    RebuildAttractorGrid,
}

/// What draining the queue touched, so the caller can mark grids dirty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub behaviour_ids: bool,
    pub obstacles: bool,
    pub attractors: bool,
}

/// Mutations submitted between steps. Nothing here is visible to the
/// simulation until the next step drains it.
#[derive(Clone, Debug, Default)]
pub struct PendingChanges {
    changes: Vec<PendingChange>,
}

/// The state the queue writes into.
pub struct ChangeTargets<'a> {
    pub behaviour_ids: &'a mut [u32],
    pub obstacles: &'a mut [ObstacleData],
    pub attractors: &'a mut [AttractorData],
}

impl PendingChanges {
    pub fn push(&mut self, change: PendingChange) {
        self.changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Applies and empties the queue. Changes are validated on submission,
    /// so anything out of range here is skipped.
    pub fn apply(&mut self, targets: ChangeTargets<'_>) -> AppliedChanges {
        let mut applied = AppliedChanges::default();
        for change in self.changes.drain(..) {
            match change {
                PendingChange::BehaviourIds(ids) => {
                    let n = ids.len().min(targets.behaviour_ids.len());
                    targets.behaviour_ids[..n].copy_from_slice(&ids[..n]);
                    applied.behaviour_ids = true;
                }
                PendingChange::Obstacle { index, data } => {
                    if let Some(slot) = targets.obstacles.get_mut(index) {
                        *slot = data;
                        applied.obstacles = true;
                    }
                }
                PendingChange::Attractor { index, data } => {
                    if let Some(slot) = targets.attractors.get_mut(index) {
                        *slot = data;
                        applied.attractors = true;
                    }
                }
                PendingChange::RebuildAttractorGrid => applied.attractors = true,
            }
        }
        applied
    }
}
