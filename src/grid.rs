//! Uniform 3D grid over the environment bounds and the packed agent index.
//!
//! The agent index is rebuilt from scratch each tick:
//!   1. every agent lists the cells its body overlaps (at most `max_cells_per_agent`),
//!   2. an exclusive prefix sum over those counts gives each agent a write offset,
//!   3. `(cell, agent)` pairs are scattered into one flat buffer,
//!   4. the occupied prefix is sorted by `(cell, agent)`,
//!   5. one scan records each cell's `[start, count)` range.
//!
//! Only the cells touched last tick are cleared, never the whole table.

use glam::{IVec3, UVec3, Vec3};
use rayon::prelude::*;

use crate::config::MIN_CELL_SIZE;
use crate::environment::EnvironmentBounds;
use crate::error::GridError;
use crate::log::{LogCategory, SimLogger};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridLayout {
    origin: Vec3,
    cell_size: f32,
    inv_cell_size: f32,
    resolution: UVec3,
}

impl GridLayout {
    /// Covers `bounds` with cubic cells, enlarging `cell_size` until the grid
    /// fits within `max_cells`.
    pub fn covering(
        bounds: &EnvironmentBounds,
        cell_size: f32,
        max_cells: usize,
        logger: &SimLogger,
    ) -> Self {
        // Doubling f32::MAX half-extents would give an infinite span.
        let size = (bounds.half_extents() * 2.0).min(Vec3::splat(f32::MAX));
        let requested = cell_size.max(MIN_CELL_SIZE);
        let mut cell_size = requested;
        let mut resolution = resolution_for(size, cell_size);

        while cell_count(resolution) > max_cells.max(1) {
            cell_size *= 1.25;
            resolution = resolution_for(size, cell_size);
        }
        if cell_size > requested {
            logger.warn(
                LogCategory::Grid,
                format_args!(
                    "grid cell size raised from {requested} to {cell_size} to stay within {max_cells} cells"
                ),
            );
        }

        Self::new(bounds.min_corner(), cell_size, resolution)
    }

    pub fn new(origin: Vec3, cell_size: f32, resolution: UVec3) -> Self {
        let cell_size = cell_size.max(MIN_CELL_SIZE);
        Self {
            origin,
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            resolution: resolution.max(UVec3::ONE),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn resolution(&self) -> UVec3 {
        self.resolution
    }

    pub fn cell_count(&self) -> usize {
        cell_count(self.resolution)
    }

    /// Cell coordinate of `position`, clamped onto the grid.
    pub fn cell_coord(&self, position: Vec3) -> IVec3 {
        let raw = ((position - self.origin) * self.inv_cell_size).floor();
        self.clamp_coord(IVec3::new(
            float_to_cell(raw.x),
            float_to_cell(raw.y),
            float_to_cell(raw.z),
        ))
    }

    pub fn clamp_coord(&self, coord: IVec3) -> IVec3 {
        coord.clamp(IVec3::ZERO, self.resolution.as_ivec3() - IVec3::ONE)
    }

    /// Row-major id: `x + y * res.x + z * res.x * res.y`. Expects a clamped coordinate.
    pub fn cell_id(&self, coord: IVec3) -> usize {
        let res = self.resolution;
        coord.x as usize
            + coord.y as usize * res.x as usize
            + coord.z as usize * res.x as usize * res.y as usize
    }

    pub fn cell_id_of(&self, position: Vec3) -> usize {
        self.cell_id(self.cell_coord(position))
    }

    pub fn coord_of(&self, id: usize) -> IVec3 {
        let rx = self.resolution.x as usize;
        let ry = self.resolution.y as usize;
        IVec3::new((id % rx) as i32, ((id / rx) % ry) as i32, (id / (rx * ry)) as i32)
    }

    pub fn cell_center(&self, id: usize) -> Vec3 {
        self.origin + (self.coord_of(id).as_vec3() + Vec3::splat(0.5)) * self.cell_size
    }

    /// Visits every cell id in the clamped cube `center ± radius`.
    pub fn for_each_cell_in_cube(&self, center: IVec3, radius: i32, mut visit: impl FnMut(usize)) {
        let lo = self.clamp_coord(center - IVec3::splat(radius));
        let hi = self.clamp_coord(center + IVec3::splat(radius));
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    visit(self.cell_id(IVec3::new(x, y, z)));
                }
            }
        }
    }

    /// Visits every cell id overlapped by the box `[min, max]`.
    pub fn for_each_cell_in_box(&self, min: Vec3, max: Vec3, mut visit: impl FnMut(usize)) {
        let lo = self.cell_coord(min);
        let hi = self.cell_coord(max);
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    visit(self.cell_id(IVec3::new(x, y, z)));
                }
            }
        }
    }

    /// Upper bound on the cells a sphere of `radius` can overlap.
    pub fn max_cells_for_radius(&self, radius: f32) -> usize {
        let span = ((2.0 * radius.max(0.0) * self.inv_cell_size).ceil() as usize)
            .saturating_add(1)
            .max(1);
        let res = self.resolution;
        span.min(res.x as usize)
            .saturating_mul(span.min(res.y as usize))
            .saturating_mul(span.min(res.z as usize))
    }
}

fn resolution_for(size: Vec3, cell_size: f32) -> UVec3 {
    let cells = (size / cell_size).ceil();
    UVec3::new(
        float_to_cell(cells.x).max(1) as u32,
        float_to_cell(cells.y).max(1) as u32,
        float_to_cell(cells.z).max(1) as u32,
    )
}

/// Saturates so an oversized resolution still compares above any budget.
fn cell_count(resolution: UVec3) -> usize {
    (resolution.x as usize)
        .saturating_mul(resolution.y as usize)
        .saturating_mul(resolution.z as usize)
}

// Saturating conversion; NaN lands in cell 0.
fn float_to_cell(value: f32) -> i32 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(i32::MIN as f32, i32::MAX as f32) as i32
}

/// Contiguous run of pairs belonging to one cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellRange {
    pub start: u32,
    pub count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellEntry {
    pub cell: u32,
    pub index: u32,
}

/// Packed `(cell, index)` multimap with per-cell ranges. Shared by the agent,
/// obstacle and attractor grids.
#[derive(Clone, Debug, Default)]
pub struct PackedCells {
    ranges: Vec<CellRange>,
    entries: Vec<CellEntry>,
    occupied: usize,
    touched: Vec<u32>,
}

impl PackedCells {
    pub fn with_cells(cell_count: usize) -> Self {
        Self {
            ranges: vec![CellRange::default(); cell_count],
            entries: Vec::new(),
            occupied: 0,
            touched: Vec::new(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Scratch buffer sized for `len` entries; fill it then call [`Self::finish`].
    pub fn begin(&mut self, len: usize) -> &mut [CellEntry] {
        for &cell in &self.touched {
            self.ranges[cell as usize] = CellRange::default();
        }
        self.touched.clear();

        if self.entries.len() < len {
            self.entries.resize(len, CellEntry::default());
        }
        self.occupied = len;
        &mut self.entries[..len]
    }

    pub fn finish(&mut self) {
        let occupied = &mut self.entries[..self.occupied];
        occupied.par_sort_unstable();

        let mut i = 0;
        while i < occupied.len() {
            let cell = occupied[i].cell;
            let start = i;
            while i < occupied.len() && occupied[i].cell == cell {
                i += 1;
            }
            self.ranges[cell as usize] = CellRange {
                start: start as u32,
                count: (i - start) as u32,
            };
            self.touched.push(cell);
        }
    }

    pub fn cell(&self, cell: usize) -> &[CellEntry] {
        match self.ranges.get(cell) {
            Some(range) if range.count > 0 => {
                let start = range.start as usize;
                &self.entries[start..start + range.count as usize]
            }
            _ => &[],
        }
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    pub fn touched_cells(&self) -> usize {
        self.touched.len()
    }
}

/// Per-tick agent index with multi-cell stamping for large bodies.
#[derive(Clone, Debug, Default)]
pub struct AgentGrid {
    layout: Option<GridLayout>,
    capacity: usize,
    max_cells_per_agent: usize,
    candidate_cells: Vec<u32>,
    candidate_counts: Vec<u32>,
    offsets: Vec<u32>,
    cells: PackedCells,
}

impl AgentGrid {
    pub fn allocate(layout: GridLayout, agent_capacity: usize, max_body_radius: f32) -> Self {
        let max_cells_per_agent = layout.max_cells_for_radius(max_body_radius).max(1);
        Self {
            layout: Some(layout),
            capacity: agent_capacity,
            max_cells_per_agent,
            candidate_cells: vec![0; agent_capacity.saturating_mul(max_cells_per_agent)],
            candidate_counts: vec![0; agent_capacity],
            offsets: vec![0; agent_capacity],
            cells: PackedCells::with_cells(layout.cell_count()),
        }
    }

    pub fn layout(&self) -> Option<&GridLayout> {
        self.layout.as_ref()
    }

    pub fn max_cells_per_agent(&self) -> usize {
        self.max_cells_per_agent
    }

    /// Checks that a rebuild over `agent_count` agents can succeed.
    pub fn ready_for(&self, agent_count: usize) -> Result<GridLayout, GridError> {
        let layout = match self.layout {
            Some(layout) if self.cells.is_allocated() => layout,
            _ => return Err(GridError::NotAllocated),
        };
        if agent_count > self.capacity {
            return Err(GridError::CapacityExceeded {
                capacity: self.capacity,
                requested: agent_count,
            });
        }
        Ok(layout)
    }

    /// Rebuilds the index. `body_radius(i)` gives agent `i`'s body radius.
    pub fn rebuild<F>(&mut self, positions: &[Vec3], body_radius: F) -> Result<(), GridError>
    where
        F: Fn(usize) -> f32 + Sync,
    {
        let layout = self.ready_for(positions.len())?;
        let count = positions.len();

        let stride = self.max_cells_per_agent;
        self.candidate_cells[..count * stride]
            .par_chunks_mut(stride)
            .zip(self.candidate_counts[..count].par_iter_mut())
            .enumerate()
            .for_each(|(i, (slots, slot_count))| {
                *slot_count = candidate_cells(&layout, positions[i], body_radius(i), slots) as u32;
            });

        let mut total = 0u32;
        for (offset, &cells) in self.offsets[..count]
            .iter_mut()
            .zip(&self.candidate_counts[..count])
        {
            *offset = total;
            total += cells;
        }

        let entries = self.cells.begin(total as usize);
        for i in 0..count {
            let offset = self.offsets[i] as usize;
            let cells = self.candidate_counts[i] as usize;
            let source = &self.candidate_cells[i * stride..i * stride + cells];
            for (entry, &cell) in entries[offset..offset + cells].iter_mut().zip(source) {
                *entry = CellEntry {
                    cell,
                    index: i as u32,
                };
            }
        }
        self.cells.finish();
        Ok(())
    }

    pub fn cell(&self, cell: usize) -> &[CellEntry] {
        self.cells.cell(cell)
    }

    pub fn occupied(&self) -> usize {
        self.cells.occupied()
    }

    pub fn touched_cells(&self) -> usize {
        self.cells.touched_cells()
    }
}

/// Writes the ids of the cells overlapped by a body into `out`; returns how many.
fn candidate_cells(layout: &GridLayout, position: Vec3, body_radius: f32, out: &mut [u32]) -> usize {
    let home = layout.cell_id_of(position);
    if body_radius <= 0.0 || out.len() == 1 {
        out[0] = home as u32;
        return 1;
    }

    let extent = Vec3::splat(body_radius);
    let mut written = 0;
    layout.for_each_cell_in_box(position - extent, position + extent, |cell| {
        if written < out.len() {
            out[written] = cell as u32;
            written += 1;
        }
    });
    if !out[..written].contains(&(home as u32)) {
        // The home cell must always be present; replace the last slot.
        out[written.saturating_sub(1).min(out.len() - 1)] = home as u32;
        written = written.max(1);
    }
    written
}
