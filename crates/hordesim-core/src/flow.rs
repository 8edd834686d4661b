//! Flow-field pathfinding over the battle grid.
//!
//! A breadth-first cost expansion from the goal assigns every walkable cell
//! its integration cost; a second pass points each cell at its cheapest
//! reachable neighbor. Agents sample the resulting vector field as a
//! steering direction and blend it with separation and chase forces.
//!
//! Two fields share one walkability grid: the global field (goal = the
//! crystal) regenerates only when obstacles change, the destination field
//! (goal = the latest move command) regenerates only when the destination
//! itself changes.

use std::collections::{HashMap, VecDeque};

use hordesim_index::CellCoord;
use serde::{Deserialize, Serialize};

use crate::{AgentId, Position};

/// Integration cost marking a cell no path can reach.
pub const UNREACHABLE: u32 = u32::MAX;

/// 4-connected expansion order, also the first four direction candidates.
const ORTHOGONAL: [(i32, i32); 4] = [(0, -1), (1, 0), (0, 1), (-1, 0)];
/// Diagonal direction candidates, examined after the orthogonals.
const DIAGONAL: [(i32, i32); 4] = [(1, -1), (1, 1), (-1, 1), (-1, -1)];

/// Tile footprint an obstacle stamps onto the walkability grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObstacleFootprint {
    pub tiles_w: u32,
    pub tiles_h: u32,
}

impl ObstacleFootprint {
    /// Footprint spanning `tiles_w` by `tiles_h` cells.
    #[must_use]
    pub const fn new(tiles_w: u32, tiles_h: u32) -> Self {
        Self { tiles_w, tiles_h }
    }
}

/// Walkability grid shared by every flow field instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkGrid {
    width: u32,
    height: u32,
    cell_size: f32,
    walkable: Vec<bool>,
}

impl WalkGrid {
    fn new(width: u32, height: u32, cell_size: f32) -> Self {
        Self {
            width,
            height,
            cell_size,
            walkable: vec![true; (width as usize) * (height as usize)],
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

    /// Edge length of one cell in world units.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    fn offset(&self, cell: CellCoord) -> usize {
        cell.y as usize * self.width as usize + cell.x as usize
    }

    /// Whether `cell` lies inside the grid.
    #[must_use]
    pub fn in_bounds(&self, cell: CellCoord) -> bool {
        cell.x >= 0 && cell.y >= 0 && (cell.x as u32) < self.width && (cell.y as u32) < self.height
    }

    /// Whether `cell` is inside the grid and free of obstacles.
    #[must_use]
    pub fn is_walkable(&self, cell: CellCoord) -> bool {
        self.in_bounds(cell) && self.walkable[self.offset(cell)]
    }

    fn set_walkable(&mut self, cell: CellCoord, value: bool) {
        if self.in_bounds(cell) {
            let offset = self.offset(cell);
            self.walkable[offset] = value;
        }
    }

    fn fill_walkable(&mut self) {
        self.walkable.fill(true);
    }

    /// Grid cell containing a world position.
    #[must_use]
    pub fn cell_of(&self, position: Position) -> CellCoord {
        CellCoord::new(
            (position.x / self.cell_size).floor() as i32,
            (position.y / self.cell_size).floor() as i32,
        )
    }

    /// World-space center of a grid cell.
    #[must_use]
    pub fn cell_center(&self, cell: CellCoord) -> Position {
        Position::new(
            (cell.x as f32 + 0.5) * self.cell_size,
            (cell.y as f32 + 0.5) * self.cell_size,
        )
    }
}

/// Steering field produced by one BFS integration pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowField {
    cost: Vec<u32>,
    directions: Vec<(f32, f32)>,
    goal: Option<CellCoord>,
    generation: u64,
}

impl FlowField {
    fn inert(cells: usize) -> Self {
        Self {
            cost: vec![UNREACHABLE; cells],
            directions: vec![(0.0, 0.0); cells],
            goal: None,
            generation: 0,
        }
    }

    /// Number of completed BFS passes over this field.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Current goal cell, if a pass has run.
    #[must_use]
    pub const fn goal(&self) -> Option<CellCoord> {
        self.goal
    }

    /// Integration cost of `cell`; `UNREACHABLE` outside the grid.
    #[must_use]
    pub fn cost_at(&self, grid: &WalkGrid, cell: CellCoord) -> u32 {
        if grid.in_bounds(cell) {
            self.cost[grid.offset(cell)]
        } else {
            UNREACHABLE
        }
    }

    /// Flow direction of `cell`; zero when unreachable, at the goal, or
    /// before the first pass.
    #[must_use]
    pub fn direction_at(&self, grid: &WalkGrid, cell: CellCoord) -> (f32, f32) {
        if grid.in_bounds(cell) {
            self.directions[grid.offset(cell)]
        } else {
            (0.0, 0.0)
        }
    }

    /// Steering vector for an agent standing at `position`.
    #[must_use]
    pub fn sample(&self, grid: &WalkGrid, position: Position) -> (f32, f32) {
        self.direction_at(grid, grid.cell_of(position))
    }

    fn rebuild(&mut self, grid: &WalkGrid, goal: CellCoord) {
        self.cost.fill(UNREACHABLE);
        self.directions.fill((0.0, 0.0));
        self.goal = Some(goal);
        self.generation += 1;
        if !grid.in_bounds(goal) {
            return;
        }

        // Uniform-cost expansion outward from the goal. The FIFO frontier
        // makes tie order deterministic for a fixed grid and goal.
        let mut frontier = VecDeque::new();
        self.cost[grid.offset(goal)] = 0;
        frontier.push_back(goal);
        while let Some(cell) = frontier.pop_front() {
            let next_cost = self.cost[grid.offset(cell)] + 1;
            for (dx, dy) in ORTHOGONAL {
                let neighbor = CellCoord::new(cell.x + dx, cell.y + dy);
                if !grid.is_walkable(neighbor) {
                    continue;
                }
                let offset = grid.offset(neighbor);
                if self.cost[offset] == UNREACHABLE {
                    self.cost[offset] = next_cost;
                    frontier.push_back(neighbor);
                }
            }
        }

        for y in 0..grid.height() as i32 {
            for x in 0..grid.width() as i32 {
                let cell = CellCoord::new(x, y);
                let offset = grid.offset(cell);
                if cell == goal || self.cost[offset] == UNREACHABLE || !grid.is_walkable(cell) {
                    continue;
                }
                let direction = Self::pick_direction(grid, &self.cost, cell);
                self.directions[offset] = direction;
            }
        }
    }

    /// Point toward the cheapest reachable neighbor. Orthogonals are
    /// examined first, then diagonals gated on both adjacent orthogonals
    /// being walkable so the vector never cuts a blocked corner; ties keep
    /// the earliest candidate.
    fn pick_direction(grid: &WalkGrid, costs: &[u32], cell: CellCoord) -> (f32, f32) {
        let mut best_cost = UNREACHABLE;
        let mut best_step = (0i32, 0i32);
        let mut consider = |dx: i32, dy: i32, best_cost: &mut u32, best_step: &mut (i32, i32)| {
            let neighbor = CellCoord::new(cell.x + dx, cell.y + dy);
            if !grid.is_walkable(neighbor) {
                return;
            }
            let cost = costs[grid.offset(neighbor)];
            if cost < *best_cost {
                *best_cost = cost;
                *best_step = (dx, dy);
            }
        };
        for (dx, dy) in ORTHOGONAL {
            consider(dx, dy, &mut best_cost, &mut best_step);
        }
        for (dx, dy) in DIAGONAL {
            if grid.is_walkable(CellCoord::new(cell.x + dx, cell.y))
                && grid.is_walkable(CellCoord::new(cell.x, cell.y + dy))
            {
                consider(dx, dy, &mut best_cost, &mut best_step);
            }
        }
        if best_cost == UNREACHABLE {
            return (0.0, 0.0);
        }
        let (dx, dy) = (best_step.0 as f32, best_step.1 as f32);
        let length = (dx * dx + dy * dy).sqrt();
        (dx / length, dy / length)
    }
}

/// Owner of the walkability grid, both flow fields, and the obstacle set.
#[derive(Debug, Serialize, Deserialize)]
pub struct Navigator {
    grid: WalkGrid,
    global: FlowField,
    destination: FlowField,
    global_goal: CellCoord,
    obstacles: HashMap<AgentId, (CellCoord, CellCoord)>,
    dirty: bool,
}

impl Navigator {
    /// Create the grid and run the initial global pass toward `crystal`.
    #[must_use]
    pub fn new(width_cells: u32, height_cells: u32, cell_size: f32, crystal: Position) -> Self {
        let grid = WalkGrid::new(width_cells, height_cells, cell_size);
        let cells = (width_cells as usize) * (height_cells as usize);
        let global_goal = grid.cell_of(crystal);
        let mut global = FlowField::inert(cells);
        global.rebuild(&grid, global_goal);
        Self {
            grid,
            global,
            destination: FlowField::inert(cells),
            global_goal,
            obstacles: HashMap::new(),
            dirty: false,
        }
    }

    /// Shared walkability grid.
    #[must_use]
    pub fn grid(&self) -> &WalkGrid {
        &self.grid
    }

    /// Field steering toward the crystal.
    #[must_use]
    pub fn global(&self) -> &FlowField {
        &self.global
    }

    /// Field steering toward the latest player move command.
    #[must_use]
    pub fn destination(&self) -> &FlowField {
        &self.destination
    }

    /// Whether an obstacle change is waiting for the next regeneration.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Stamp `footprint` centered on `position` as unwalkable.
    pub fn register_obstacle(
        &mut self,
        id: AgentId,
        position: Position,
        footprint: ObstacleFootprint,
    ) {
        let anchor = self.grid.cell_of(position);
        let min = CellCoord::new(
            anchor.x - (footprint.tiles_w / 2) as i32,
            anchor.y - (footprint.tiles_h / 2) as i32,
        );
        let max = CellCoord::new(
            min.x + footprint.tiles_w.max(1) as i32 - 1,
            min.y + footprint.tiles_h.max(1) as i32 - 1,
        );
        self.obstacles.insert(id, (min, max));
        self.dirty = true;
    }

    /// Remove the obstacle attached to `id`, if any.
    pub fn deregister_obstacle(&mut self, id: AgentId) {
        if self.obstacles.remove(&id).is_some() {
            self.dirty = true;
        }
    }

    /// Whether `id` currently stamps an obstacle.
    #[must_use]
    pub fn has_obstacle(&self, id: AgentId) -> bool {
        self.obstacles.contains_key(&id)
    }

    /// Regenerate the walkability grid and both fields if obstacles changed
    /// since the last pass. Returns whether a regeneration ran.
    pub fn refresh_if_dirty(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.grid.fill_walkable();
        for &(min, max) in self.obstacles.values() {
            for y in min.y..=max.y {
                for x in min.x..=max.x {
                    self.grid.set_walkable(CellCoord::new(x, y), false);
                }
            }
        }
        self.global.rebuild(&self.grid, self.global_goal);
        if let Some(goal) = self.destination.goal() {
            self.destination.rebuild(&self.grid, goal);
        }
        self.dirty = false;
        true
    }

    /// Point the destination field at `position`. A repeated identical
    /// destination is a no-op; returns whether a BFS pass ran.
    pub fn set_destination(&mut self, position: Position) -> bool {
        let goal = self.grid.cell_of(position);
        if self.destination.goal() == Some(goal) {
            return false;
        }
        self.destination.rebuild(&self.grid, goal);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn obstacle_ids(count: usize) -> Vec<AgentId> {
        let mut slots: SlotMap<AgentId, ()> = SlotMap::with_key();
        (0..count).map(|_| slots.insert(())).collect()
    }

    fn obstacle_id() -> AgentId {
        obstacle_ids(1)[0]
    }

    fn navigator_8x8() -> Navigator {
        Navigator::new(8, 8, 10.0, Position::new(5.0, 5.0))
    }

    /// Step one cell along the stored direction vector.
    fn follow(grid: &WalkGrid, field: &FlowField, cell: CellCoord) -> CellCoord {
        let (dx, dy) = field.direction_at(grid, cell);
        let center = grid.cell_center(cell);
        grid.cell_of(Position::new(
            center.x + dx * grid.cell_size(),
            center.y + dy * grid.cell_size(),
        ))
    }

    #[test]
    fn goal_cell_has_zero_cost_and_zero_direction() {
        let nav = navigator_8x8();
        let goal = CellCoord::new(0, 0);
        assert_eq!(nav.global().cost_at(nav.grid(), goal), 0);
        assert_eq!(nav.global().direction_at(nav.grid(), goal), (0.0, 0.0));
    }

    #[test]
    fn following_directions_strictly_decreases_cost_to_goal() {
        let mut nav = navigator_8x8();
        nav.register_obstacle(
            obstacle_id(),
            Position::new(35.0, 35.0),
            ObstacleFootprint::new(2, 2),
        );
        assert!(nav.refresh_if_dirty());

        let grid = nav.grid();
        let field = nav.global();
        let goal = field.goal().expect("goal");
        for y in 0..8 {
            for x in 0..8 {
                let start = CellCoord::new(x, y);
                if field.cost_at(grid, start) == UNREACHABLE {
                    continue;
                }
                let mut cell = start;
                let mut steps = 0;
                while cell != goal {
                    let next = follow(grid, field, cell);
                    assert!(grid.is_walkable(next), "stepped into obstacle from {cell:?}");
                    assert!(
                        field.cost_at(grid, next) < field.cost_at(grid, cell),
                        "cost must strictly decrease along the chain at {cell:?}"
                    );
                    cell = next;
                    steps += 1;
                    assert!(steps <= 64, "direction chain must terminate at the goal");
                }
            }
        }
    }

    #[test]
    fn unreachable_cells_keep_sentinel_and_zero_direction() {
        let mut nav = navigator_8x8();
        // Cut off the rightmost column behind a full-height wall.
        let ids = obstacle_ids(8);
        for (y, &id) in ids.iter().enumerate() {
            nav.register_obstacle(
                id,
                Position::new(65.0, y as f32 * 10.0 + 5.0),
                ObstacleFootprint::new(1, 1),
            );
        }
        assert!(nav.refresh_if_dirty());

        let grid = nav.grid();
        let field = nav.global();
        for y in 0..8 {
            let walled = CellCoord::new(7, y);
            assert_eq!(field.cost_at(grid, walled), UNREACHABLE);
            assert_eq!(field.direction_at(grid, walled), (0.0, 0.0));
        }
    }

    #[test]
    fn field_routes_around_obstacles_beside_the_goal() {
        let mut nav = Navigator::new(8, 8, 10.0, Position::new(35.0, 35.0));
        // Two blocks immediately east and south of the goal cell.
        let ids = obstacle_ids(2);
        nav.register_obstacle(ids[0], Position::new(45.0, 35.0), ObstacleFootprint::new(1, 1));
        nav.register_obstacle(ids[1], Position::new(35.0, 45.0), ObstacleFootprint::new(1, 1));
        assert!(nav.refresh_if_dirty());

        let grid = nav.grid();
        let field = nav.global();
        let goal = field.goal().expect("goal");
        for y in 0..8 {
            for x in 0..8 {
                let cell = CellCoord::new(x, y);
                if cell == goal || field.cost_at(grid, cell) == UNREACHABLE {
                    continue;
                }
                let next = follow(grid, field, cell);
                assert!(
                    grid.is_walkable(next),
                    "direction at {cell:?} points into a blocked cell"
                );
            }
        }
        // The far corner still reaches the goal despite the adjacent blocks.
        assert_ne!(field.cost_at(grid, CellCoord::new(7, 7)), UNREACHABLE);
    }

    #[test]
    fn destination_field_is_inert_until_first_command() {
        let nav = navigator_8x8();
        assert_eq!(nav.destination().generation(), 0);
        assert_eq!(
            nav.destination().sample(nav.grid(), Position::new(44.0, 44.0)),
            (0.0, 0.0)
        );
    }

    #[test]
    fn repeated_destination_does_not_rerun_the_pass() {
        let mut nav = navigator_8x8();
        assert!(nav.set_destination(Position::new(62.0, 62.0)));
        let generation = nav.destination().generation();
        assert!(!nav.set_destination(Position::new(63.0, 61.0)));
        assert_eq!(nav.destination().generation(), generation);
        assert!(nav.set_destination(Position::new(5.0, 62.0)));
        assert_eq!(nav.destination().generation(), generation + 1);
    }

    #[test]
    fn obstacle_change_regenerates_both_fields() {
        let mut nav = navigator_8x8();
        nav.set_destination(Position::new(75.0, 75.0));
        let global_generation = nav.global().generation();
        let destination_generation = nav.destination().generation();

        let id = obstacle_id();
        nav.register_obstacle(id, Position::new(35.0, 35.0), ObstacleFootprint::new(1, 1));
        assert!(nav.refresh_if_dirty());
        assert_eq!(nav.global().generation(), global_generation + 1);
        assert_eq!(nav.destination().generation(), destination_generation + 1);
        assert!(!nav.grid().is_walkable(CellCoord::new(3, 3)));

        nav.deregister_obstacle(id);
        assert!(nav.refresh_if_dirty());
        assert!(nav.grid().is_walkable(CellCoord::new(3, 3)));
        assert!(!nav.refresh_if_dirty(), "clean navigator must not regenerate");
    }
}
