use thiserror::Error;

/// Failures of the packed spatial grids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("grid buffers are not allocated")]
    NotAllocated,
    #[error("grid holds {capacity} agents but {requested} were submitted")]
    CapacityExceeded { capacity: usize, requested: usize },
}

/// Failures surfaced by simulation lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("at least one behaviour is required")]
    NoBehaviours,
    #[error("simulation is not initialized")]
    NotInitialized,
    #[error("spawn list holds {actual} agents but agent count is {expected}")]
    SpawnCountMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Grid(#[from] GridError),
}
