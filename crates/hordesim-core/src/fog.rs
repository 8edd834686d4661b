//! Fog-of-war visibility state.
//!
//! The core owns the per-cell visibility data and refreshes it from living
//! player positions each tick; syncing tiles or textures from it is the
//! renderer's problem.

use hordesim_index::CellCoord;
use serde::{Deserialize, Serialize};

use crate::Position;

/// Visibility of one fog cell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VisState {
    #[default]
    Hidden,
    Explored,
    Visible,
}

/// Grid of per-cell visibility over the playfield.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisibilityGrid {
    width: u32,
    height: u32,
    cell_size: f32,
    cells: Vec<VisState>,
}

impl VisibilityGrid {
    /// Create a fully hidden grid.
    #[must_use]
    pub fn new(width: u32, height: u32, cell_size: f32) -> Self {
        Self {
            width,
            height,
            cell_size,
            cells: vec![VisState::Hidden; (width as usize) * (height as usize)],
        }
    }

    /// Grid width in cells.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height in cells.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    fn offset(&self, cell: CellCoord) -> Option<usize> {
        if cell.x < 0 || cell.y < 0 || cell.x as u32 >= self.width || cell.y as u32 >= self.height {
            return None;
        }
        Some(cell.y as usize * self.width as usize + cell.x as usize)
    }

    /// Visibility of `cell`; out-of-bounds cells read as hidden.
    #[must_use]
    pub fn state(&self, cell: CellCoord) -> VisState {
        self.offset(cell).map_or(VisState::Hidden, |o| self.cells[o])
    }

    /// Overwrite the visibility of `cell`.
    pub fn set_state(&mut self, cell: CellCoord, state: VisState) {
        if let Some(offset) = self.offset(cell) {
            self.cells[offset] = state;
        }
    }

    /// Demote everything currently visible to explored. Called once per
    /// tick before the fresh sightings are stamped.
    pub fn age_visibility(&mut self) {
        for cell in &mut self.cells {
            if *cell == VisState::Visible {
                *cell = VisState::Explored;
            }
        }
    }

    /// Mark every cell within `radius` of `observer` visible.
    pub fn reveal_around(&mut self, observer: Position, radius: f32) {
        if radius <= 0.0 {
            return;
        }
        let min_x = ((observer.x - radius) / self.cell_size).floor() as i32;
        let max_x = ((observer.x + radius) / self.cell_size).floor() as i32;
        let min_y = ((observer.y - radius) / self.cell_size).floor() as i32;
        let max_y = ((observer.y + radius) / self.cell_size).floor() as i32;
        let radius_sq = radius * radius;
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let cell = CellCoord::new(x, y);
                let center_x = (x as f32 + 0.5) * self.cell_size;
                let center_y = (y as f32 + 0.5) * self.cell_size;
                let dx = center_x - observer.x;
                let dy = center_y - observer.y;
                if dx * dx + dy * dy <= radius_sq {
                    self.set_state(cell, VisState::Visible);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reveal_marks_cells_and_aging_demotes_them() {
        let mut fog = VisibilityGrid::new(16, 16, 10.0);
        let cell = CellCoord::new(4, 4);
        assert_eq!(fog.state(cell), VisState::Hidden);

        fog.reveal_around(Position::new(45.0, 45.0), 25.0);
        assert_eq!(fog.state(cell), VisState::Visible);
        assert_eq!(fog.state(CellCoord::new(15, 15)), VisState::Hidden);

        fog.age_visibility();
        assert_eq!(fog.state(cell), VisState::Explored);

        fog.reveal_around(Position::new(45.0, 45.0), 25.0);
        assert_eq!(fog.state(cell), VisState::Visible);
    }

    #[test]
    fn out_of_bounds_reads_are_hidden_and_writes_are_ignored() {
        let mut fog = VisibilityGrid::new(4, 4, 10.0);
        let outside = CellCoord::new(-1, 9);
        fog.set_state(outside, VisState::Visible);
        assert_eq!(fog.state(outside), VisState::Hidden);
        // Reveals straddling the edge clip to the grid.
        fog.reveal_around(Position::new(0.0, 0.0), 15.0);
        assert_eq!(fog.state(CellCoord::new(0, 0)), VisState::Visible);
    }
}
