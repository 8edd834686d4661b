//! Spatial indexing for agent neighborhood queries.
//!
//! The index is a uniform grid multimap held in two buffers: movement and
//! targeting jobs read the buffer built on the previous tick while the
//! current tick's rebuild fills the other. `swap` flips which buffer is
//! readable at the tick boundary, so readers never wait on the build.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Discretized grid coordinate derived from a world position.
///
/// Never persisted as ground truth; recomputed from positions on every
/// rebuild.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    /// Construct a cell coordinate directly.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Derive the cell containing a world position.
    #[must_use]
    pub fn from_world(x: f32, y: f32, world_offset: f32, cell_size: f32) -> Self {
        Self {
            x: ((x + world_offset) / cell_size).floor() as i32,
            y: ((y + world_offset) / cell_size).floor() as i32,
        }
    }
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]);

    /// Visit agents within the squared radius of `origin`, reading the
    /// buffer published by the most recent `swap`.
    fn neighbors_within(
        &self,
        positions: &[(f32, f32)],
        origin: (f32, f32),
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

#[derive(Debug, Default)]
struct GridBuffer {
    buckets: HashMap<CellCoord, Vec<usize>>,
    built: bool,
}

impl GridBuffer {
    fn clear(&mut self) {
        // Bucket vectors keep their capacity so steady-state rebuilds do
        // not reallocate.
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }
        self.built = false;
    }

    fn insert(&mut self, cell: CellCoord, index: usize) {
        self.buckets.entry(cell).or_default().push(index);
    }

    fn get(&self, cell: CellCoord) -> &[usize] {
        self.buckets.get(&cell).map_or(&[], Vec::as_slice)
    }
}

/// Uniform grid index with double-buffered storage.
///
/// `rebuild` writes into the back buffer while queries read the front one;
/// the owner calls `swap` once per tick after the build completes. A query
/// against an index that has never been built returns nothing.
#[derive(Debug, Serialize, Deserialize)]
pub struct GridIndex {
    /// Edge length of each grid cell used for bucketing agents.
    cell_size: f32,
    /// Offset added to world positions before discretization.
    world_offset: f32,
    #[serde(skip)]
    buffers: [GridBuffer; 2],
    #[serde(skip)]
    read_slot: AtomicUsize,
}

impl GridIndex {
    /// Create a new grid index with the provided cell size and world offset.
    pub fn new(cell_size: f32, world_offset: f32) -> Result<Self, IndexError> {
        if !(cell_size > 0.0) {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if !world_offset.is_finite() {
            return Err(IndexError::InvalidConfig("world_offset must be finite"));
        }
        Ok(Self {
            cell_size,
            world_offset,
            buffers: [GridBuffer::default(), GridBuffer::default()],
            read_slot: AtomicUsize::new(0),
        })
    }

    /// Edge length of one grid cell.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Map a world position onto its grid cell.
    #[must_use]
    pub fn cell_of(&self, x: f32, y: f32) -> CellCoord {
        CellCoord::from_world(x, y, self.world_offset, self.cell_size)
    }

    fn read_index(&self) -> usize {
        self.read_slot.load(Ordering::Acquire)
    }

    fn write_index(&self) -> usize {
        self.read_index() ^ 1
    }

    /// Agents recorded for `cell` in the readable buffer.
    #[must_use]
    pub fn query(&self, cell: CellCoord) -> &[usize] {
        let buffer = &self.buffers[self.read_index()];
        if !buffer.built {
            return &[];
        }
        buffer.get(cell)
    }

    /// Whether the readable buffer has ever been populated.
    #[must_use]
    pub fn is_built(&self) -> bool {
        self.buffers[self.read_index()].built
    }

    /// Publish the freshly built buffer and recycle the stale one for the
    /// next build. Must be called from the single owning step between the
    /// build join and the first reader of the new tick.
    pub fn swap(&mut self) {
        let stale = self.read_index();
        self.read_slot.store(stale ^ 1, Ordering::Release);
        self.buffers[stale].clear();
    }
}

impl NeighborhoodIndex for GridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) {
        let slot = self.write_index();
        let (cell_size, world_offset) = (self.cell_size, self.world_offset);
        let buffer = &mut self.buffers[slot];
        buffer.clear();
        for (index, &(x, y)) in positions.iter().enumerate() {
            buffer.insert(CellCoord::from_world(x, y, world_offset, cell_size), index);
        }
        buffer.built = true;
    }

    fn neighbors_within(
        &self,
        positions: &[(f32, f32)],
        origin: (f32, f32),
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let buffer = &self.buffers[self.read_index()];
        if !buffer.built || radius_sq <= 0.0 {
            return;
        }
        let radius = radius_sq.sqrt();
        let min = self.cell_of(origin.0 - radius, origin.1 - radius);
        let max = self.cell_of(origin.0 + radius, origin.1 + radius);
        for cy in min.y..=max.y {
            for cx in min.x..=max.x {
                for &index in buffer.get(CellCoord::new(cx, cy)) {
                    let Some(&(px, py)) = positions.get(index) else {
                        continue;
                    };
                    let dx = px - origin.0;
                    let dy = py - origin.1;
                    let dist_sq = dx * dx + dy * dy;
                    if dist_sq <= radius_sq {
                        visitor(index, OrderedFloat(dist_sq));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built_index(positions: &[(f32, f32)]) -> GridIndex {
        let mut index = GridIndex::new(10.0, 0.0).expect("index");
        index.rebuild(positions);
        index.swap();
        index
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        assert!(GridIndex::new(0.0, 0.0).is_err());
        assert!(GridIndex::new(-4.0, 0.0).is_err());
    }

    #[test]
    fn unbuilt_index_answers_empty() {
        let index = GridIndex::new(10.0, 0.0).expect("index");
        assert!(!index.is_built());
        assert!(index.query(CellCoord::new(0, 0)).is_empty());
        let mut visited = 0;
        index.neighbors_within(&[], (0.0, 0.0), 100.0, &mut |_, _| visited += 1);
        assert_eq!(visited, 0);
    }

    #[test]
    fn query_returns_exactly_the_agents_in_a_cell() {
        let positions = [(1.0, 1.0), (9.9, 9.9), (10.1, 0.0), (-0.1, 0.0)];
        let index = built_index(&positions);

        let mut origin = index.query(CellCoord::new(0, 0)).to_vec();
        origin.sort_unstable();
        assert_eq!(origin, vec![0, 1]);
        assert_eq!(index.query(CellCoord::new(1, 0)), &[2]);
        assert_eq!(index.query(CellCoord::new(-1, 0)), &[3]);
        assert!(index.query(CellCoord::new(5, 5)).is_empty());
    }

    #[test]
    fn world_offset_shifts_discretization() {
        let mut index = GridIndex::new(10.0, 100.0).expect("index");
        index.rebuild(&[(-95.0, -95.0)]);
        index.swap();
        assert_eq!(index.query(CellCoord::new(0, 0)), &[0]);
    }

    #[test]
    fn swap_publishes_the_previous_build() {
        let mut index = GridIndex::new(10.0, 0.0).expect("index");
        index.rebuild(&[(5.0, 5.0)]);
        // Not yet swapped: the readable side is still the never-built buffer.
        assert!(index.query(CellCoord::new(0, 0)).is_empty());
        index.swap();
        assert_eq!(index.query(CellCoord::new(0, 0)), &[0]);

        // Next rebuild targets the recycled buffer without disturbing reads.
        index.rebuild(&[(25.0, 25.0)]);
        assert_eq!(index.query(CellCoord::new(0, 0)), &[0]);
        index.swap();
        assert!(index.query(CellCoord::new(0, 0)).is_empty());
        assert_eq!(index.query(CellCoord::new(2, 2)), &[0]);
    }

    #[test]
    fn buckets_grow_without_dropping_inserts() {
        let positions: Vec<(f32, f32)> = (0..2_048).map(|_| (3.0, 3.0)).collect();
        let index = built_index(&positions);
        assert_eq!(index.query(CellCoord::new(0, 0)).len(), 2_048);
    }

    #[test]
    fn neighbors_within_filters_by_distance() {
        let positions = [(0.0, 0.0), (3.0, 4.0), (30.0, 0.0)];
        let index = built_index(&positions);

        let mut seen = Vec::new();
        index.neighbors_within(&positions, (0.0, 0.0), 26.0, &mut |idx, dist_sq| {
            seen.push((idx, dist_sq.into_inner()));
        });
        seen.sort_by_key(|&(idx, _)| idx);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[1].0, 1);
        assert!((seen[1].1 - 25.0).abs() < 1e-6);
    }
}
