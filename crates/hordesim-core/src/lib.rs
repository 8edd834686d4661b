//! Core simulation engine for the horde battle.
//!
//! The world advances in explicit stages: data-parallel batches (combat
//! evaluation, separation forces) read the previous tick's spatial index
//! and the current flow fields and return plain result values; the
//! order-sensitive steps between them (damage application, noise rolls,
//! buffer swap, death sweep) run single-threaded. Shared state is only ever
//! written by the stage that owns it, so the tick needs no locks.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use hordesim_index::{GridIndex, IndexError, NeighborhoodIndex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use thiserror::Error;

pub mod combat;
pub mod events;
pub mod flow;
pub mod fog;
mod separation;

use combat::{
    AiContext, AiDecision, CombatProfile, CombatRuntime, NoiseParams, Phase, SoldierDecision,
    activation_probability, evaluate_soldier, evaluate_zombie,
};
use events::{CombatDebugEvent, DamageEvent, DiagnosticsQueue, EventBus, NoiseEvent, NoiseMarker};
use flow::{Navigator, ObstacleFootprint};
use fog::VisibilityGrid;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Monotonic tick counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D position (SoA column representation).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// World-space velocity in units per second.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }
}

/// Side an agent fights for, stored as a dense column discriminant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Faction {
    Player,
    Enemy,
    #[default]
    Neutral,
}

fn dist_sq(a: Position, b: Position) -> f32 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    dx * dx + dy * dy
}

/// Scalar fields for a single agent used when inserting or snapshotting
/// from the SoA store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Position,
    pub velocity: Velocity,
    pub heading: f32,
    pub faction: Faction,
    pub health: f32,
    pub max_health: f32,
    pub selected: bool,
}

impl Default for AgentData {
    fn default() -> Self {
        Self {
            position: Position::default(),
            velocity: Velocity::default(),
            heading: 0.0,
            faction: Faction::Neutral,
            health: 1.0,
            max_health: 1.0,
            selected: false,
        }
    }
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    headings: Vec<f32>,
    factions: Vec<Faction>,
    health: Vec<f32>,
    max_health: Vec<f32>,
    selected: Vec<bool>,
}

impl AgentColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            headings: Vec::with_capacity(capacity),
            factions: Vec::with_capacity(capacity),
            health: Vec::with_capacity(capacity),
            max_health: Vec::with_capacity(capacity),
            selected: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve additional capacity in each backing vector.
    pub fn reserve(&mut self, additional: usize) {
        self.positions.reserve(additional);
        self.velocities.reserve(additional);
        self.headings.reserve(additional);
        self.factions.reserve(additional);
        self.health.reserve(additional);
        self.max_health.reserve(additional);
        self.selected.reserve(additional);
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.headings.clear();
        self.factions.clear();
        self.health.clear();
        self.max_health.clear();
        self.selected.clear();
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, agent: AgentData) {
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.headings.push(agent.heading);
        self.factions.push(agent.faction);
        self.health.push(agent.health);
        self.max_health.push(agent.max_health);
        self.selected.push(agent.selected);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> AgentData {
        let removed = AgentData {
            position: self.positions.swap_remove(index),
            velocity: self.velocities.swap_remove(index),
            heading: self.headings.swap_remove(index),
            faction: self.factions.swap_remove(index),
            health: self.health.swap_remove(index),
            max_health: self.max_health.swap_remove(index),
            selected: self.selected.swap_remove(index),
        };
        self.debug_assert_coherent();
        removed
    }

    /// Copy the row at `from` into position `to` without altering length.
    pub fn move_row(&mut self, from: usize, to: usize) {
        debug_assert!(from < self.len(), "move_row from out of bounds");
        debug_assert!(to < self.len(), "move_row to out of bounds");
        if from == to {
            return;
        }
        self.positions[to] = self.positions[from];
        self.velocities[to] = self.velocities[from];
        self.headings[to] = self.headings[from];
        self.factions[to] = self.factions[from];
        self.health[to] = self.health[from];
        self.max_health[to] = self.max_health[from];
        self.selected[to] = self.selected[from];
    }

    /// Truncate all columns to the provided length.
    pub fn truncate(&mut self, len: usize) {
        self.positions.truncate(len);
        self.velocities.truncate(len);
        self.headings.truncate(len);
        self.factions.truncate(len);
        self.health.truncate(len);
        self.max_health.truncate(len);
        self.selected.truncate(len);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            position: self.positions[index],
            velocity: self.velocities[index],
            heading: self.headings[index],
            faction: self.factions[index],
            health: self.health[index],
            max_health: self.max_health[index],
            selected: self.selected[index],
        }
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Mutable access to the positions slice.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.positions
    }

    /// Immutable access to the velocities slice.
    #[must_use]
    pub fn velocities(&self) -> &[Velocity] {
        &self.velocities
    }

    /// Mutable access to the velocities slice.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Velocity] {
        &mut self.velocities
    }

    /// Immutable access to headings.
    #[must_use]
    pub fn headings(&self) -> &[f32] {
        &self.headings
    }

    /// Mutable access to headings.
    #[must_use]
    pub fn headings_mut(&mut self) -> &mut [f32] {
        &mut self.headings
    }

    /// Immutable access to faction discriminants.
    #[must_use]
    pub fn factions(&self) -> &[Faction] {
        &self.factions
    }

    /// Immutable access to health values.
    #[must_use]
    pub fn health(&self) -> &[f32] {
        &self.health
    }

    /// Mutable access to health values.
    #[must_use]
    pub fn health_mut(&mut self) -> &mut [f32] {
        &mut self.health
    }

    /// Immutable access to health maxima.
    #[must_use]
    pub fn max_health(&self) -> &[f32] {
        &self.max_health
    }

    /// Immutable access to selection flags.
    #[must_use]
    pub fn selected(&self) -> &[bool] {
        &self.selected
    }

    /// Mutable access to selection flags.
    #[must_use]
    pub fn selected_mut(&mut self) -> &mut [bool] {
        &mut self.selected
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.headings.len());
        debug_assert_eq!(self.positions.len(), self.factions.len());
        debug_assert_eq!(self.positions.len(), self.health.len());
        debug_assert_eq!(self.positions.len(), self.max_health.len());
        debug_assert_eq!(self.positions.len(), self.selected.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
#[derive(Debug)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl Default for AgentArena {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: AgentColumns::new(),
        }
    }

    /// Create an arena with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            handles: Vec::with_capacity(capacity),
            columns: AgentColumns::with_capacity(capacity),
        }
    }

    /// Number of active agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no agents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Reserve space for additional agents.
    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
        self.handles.reserve(additional);
        self.columns.reserve(additional);
    }

    /// Iterate over active agent handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Handles in dense iteration order.
    #[must_use]
    pub fn handles(&self) -> &[AgentId] {
        &self.handles
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live agent.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: AgentData) -> AgentId {
        let index = self.columns.len();
        self.columns.push(agent);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: AgentId) -> Option<AgentData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Remove all agents whose ids are contained in `dead`, preserving
    /// iteration order.
    pub fn remove_many(&mut self, dead: &HashSet<AgentId>) -> usize {
        if dead.is_empty() {
            return 0;
        }
        let mut write = 0;
        for read in 0..self.handles.len() {
            let id = self.handles[read];
            if dead.contains(&id) {
                self.slots.remove(id);
                continue;
            }
            if write != read {
                self.handles[write] = id;
                self.columns.move_row(read, write);
            }
            if let Some(slot) = self.slots.get_mut(id) {
                *slot = write;
            }
            write += 1;
        }
        let removed = self.handles.len().saturating_sub(write);
        self.handles.truncate(write);
        self.columns.truncate(write);
        removed
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Clear all stored agents.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Spatial index construction failure.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Static configuration for a battle world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Width of the world in world units.
    pub world_width: u32,
    /// Height of the world in world units.
    pub world_height: u32,
    /// Edge length of one navigation cell (must evenly divide width/height).
    pub nav_cell_size: u32,
    /// Edge length of one spatial-hash cell in world units.
    pub index_cell_size: f32,
    /// Offset added to positions before spatial-hash discretization.
    pub world_offset: f32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// World position of the crystal, the global flow-field goal.
    pub crystal: Position,
    /// Starting and maximum crystal charge.
    pub crystal_charge: f32,
    /// Charge drained per adjacent enemy per second.
    pub crystal_drain_per_enemy: f32,
    /// Distance within which an enemy drains the crystal.
    pub crystal_radius: f32,
    /// Neighbor radius for the separation resolver.
    pub separation_radius: f32,
    /// Inverse-distance weight of each pairwise push.
    pub separation_strength: f32,
    /// Cap on the accumulated separation push per agent per tick.
    pub separation_max_push: f32,
    /// Noise activation tunables.
    pub noise: NoiseParams,
    /// Ticks a noise event keeps rolling activations.
    pub noise_lifetime: u8,
    /// Fog reveal radius around each living player agent.
    pub sight_radius: f32,
    /// Living enemy count at which the threat level reads as a siege.
    pub threat_siege_threshold: usize,
    /// Cap on each diagnostic queue.
    pub diagnostics_capacity: usize,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            world_width: 480,
            world_height: 480,
            nav_cell_size: 4,
            index_cell_size: 6.0,
            world_offset: 0.0,
            rng_seed: None,
            crystal: Position::new(240.0, 240.0),
            crystal_charge: 1_000.0,
            crystal_drain_per_enemy: 2.0,
            crystal_radius: 6.0,
            separation_radius: 2.5,
            separation_strength: 6.0,
            separation_max_push: 3.0,
            noise: NoiseParams::default(),
            noise_lifetime: 2,
            sight_radius: 24.0,
            threat_siege_threshold: 200,
            diagnostics_capacity: 1_024,
            history_capacity: 256,
        }
    }
}

impl SimConfig {
    /// Validates the configuration, returning the navigation grid size.
    fn nav_dimensions(&self) -> Result<(u32, u32), WorldError> {
        if self.world_width == 0 || self.world_height == 0 {
            return Err(WorldError::InvalidConfig(
                "world dimensions must be non-zero",
            ));
        }
        if self.nav_cell_size == 0 {
            return Err(WorldError::InvalidConfig("nav_cell_size must be non-zero"));
        }
        if !self.world_width.is_multiple_of(self.nav_cell_size)
            || !self.world_height.is_multiple_of(self.nav_cell_size)
        {
            return Err(WorldError::InvalidConfig(
                "world dimensions must be divisible by nav_cell_size",
            ));
        }
        if self.crystal.x < 0.0
            || self.crystal.y < 0.0
            || self.crystal.x >= self.world_width as f32
            || self.crystal.y >= self.world_height as f32
        {
            return Err(WorldError::InvalidConfig(
                "crystal must sit inside the world",
            ));
        }
        if self.separation_radius < 0.0
            || self.separation_strength < 0.0
            || self.separation_max_push < 0.0
            || self.sight_radius < 0.0
            || self.crystal_radius < 0.0
            || self.crystal_drain_per_enemy < 0.0
            || self.crystal_charge < 0.0
        {
            return Err(WorldError::InvalidConfig(
                "separation, sight, and crystal parameters must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be positive",
            ));
        }
        Ok((
            self.world_width / self.nav_cell_size,
            self.world_height / self.nav_cell_size,
        ))
    }

    /// Returns the configured RNG seed, generating one from entropy if
    /// absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Prefab-style spawn description: faction, durability, combat tuning, and
/// an optional obstacle footprint for structures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpawnTemplate {
    pub faction: Faction,
    pub max_health: f32,
    pub profile: CombatProfile,
    /// Wave spawns press toward the crystal instead of milling in place.
    pub marching: bool,
    pub obstacle: Option<ObstacleFootprint>,
}

impl SpawnTemplate {
    /// Baseline melee zombie.
    #[must_use]
    pub fn zombie() -> Self {
        Self {
            faction: Faction::Enemy,
            max_health: 50.0,
            profile: CombatProfile::zombie(),
            marching: false,
            obstacle: None,
        }
    }

    /// Wave zombie that marches on the crystal.
    #[must_use]
    pub fn marching_zombie() -> Self {
        Self {
            marching: true,
            ..Self::zombie()
        }
    }

    /// Baseline rifle soldier.
    #[must_use]
    pub fn soldier() -> Self {
        Self {
            faction: Faction::Player,
            max_health: 100.0,
            profile: CombatProfile::soldier(),
            marching: false,
            obstacle: None,
        }
    }

    /// Inert structure blocking `tiles_w` by `tiles_h` navigation cells.
    #[must_use]
    pub fn structure(tiles_w: u32, tiles_h: u32, max_health: f32) -> Self {
        Self {
            faction: Faction::Neutral,
            max_health,
            profile: CombatProfile::inert(),
            marching: false,
            obstacle: Some(ObstacleFootprint::new(tiles_w, tiles_h)),
        }
    }
}

/// Wave progress read by UI overlays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WaveStatus {
    pub wave: u32,
    pub spawned: usize,
    pub remaining: usize,
}

/// Crystal charge read by UI overlays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CrystalPower {
    pub charge: f32,
    pub max: f32,
}

impl CrystalPower {
    /// Remaining charge as a fraction of the maximum.
    #[must_use]
    pub fn percent(&self) -> f32 {
        if self.max <= 0.0 {
            0.0
        } else {
            (self.charge / self.max).clamp(0.0, 1.0)
        }
    }
}

/// Coarse pressure reading derived from the living enemy count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ThreatLevel {
    Calm,
    Raid,
    Siege,
}

/// Public per-agent state consumed by rendering, minimap, and UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub position: Position,
    pub heading: f32,
    pub faction: Faction,
    pub health_percent: f32,
    pub alive: bool,
    pub selected: bool,
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    pub obstacles_rebuilt: bool,
    pub destination_rebuilt: bool,
    pub deaths: usize,
    pub crystal_depleted: bool,
}

/// Rolling per-tick summary retained for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub soldiers: usize,
    pub zombies: usize,
    pub deaths: usize,
    pub damage_applied: f32,
    pub noise_active: usize,
}

enum StageDecision {
    Zombie(AiDecision),
    Soldier(SoldierDecision),
    Skip,
}

/// Aggregate world state owning every tick-scoped resource.
pub struct WorldState {
    config: SimConfig,
    tick: Tick,
    rng: SmallRng,
    agents: AgentArena,
    profiles: AgentMap<CombatProfile>,
    runtime: AgentMap<CombatRuntime>,
    index: GridIndex,
    navigator: Navigator,
    fog: VisibilityGrid,
    damage_bus: EventBus<DamageEvent>,
    noise_bus: EventBus<NoiseEvent>,
    active_noise: Vec<NoiseEvent>,
    noise_markers: DiagnosticsQueue<NoiseMarker>,
    combat_debug: DiagnosticsQueue<CombatDebugEvent>,
    pending_deaths: Vec<AgentId>,
    pending_destination: Option<Position>,
    crystal: CrystalPower,
    wave: WaveStatus,
    last_damage_applied: f32,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("agent_count", &self.agents.len())
            .field("wave", &self.wave)
            .finish()
    }
}

impl WorldState {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: SimConfig) -> Result<Self, WorldError> {
        let (nav_w, nav_h) = config.nav_dimensions()?;
        let rng = config.seeded_rng();
        let index = GridIndex::new(config.index_cell_size, config.world_offset)?;
        let navigator = Navigator::new(nav_w, nav_h, config.nav_cell_size as f32, config.crystal);
        let fog = VisibilityGrid::new(nav_w, nav_h, config.nav_cell_size as f32);
        let crystal = CrystalPower {
            charge: config.crystal_charge,
            max: config.crystal_charge,
        };
        let diagnostics_capacity = config.diagnostics_capacity;
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng,
            agents: AgentArena::new(),
            profiles: AgentMap::new(),
            runtime: AgentMap::new(),
            index,
            navigator,
            fog,
            damage_bus: EventBus::new(),
            noise_bus: EventBus::new(),
            active_noise: Vec::new(),
            noise_markers: DiagnosticsQueue::new(diagnostics_capacity),
            combat_debug: DiagnosticsQueue::new(diagnostics_capacity),
            pending_deaths: Vec::new(),
            pending_destination: None,
            crystal,
            wave: WaveStatus::default(),
            last_damage_applied: 0.0,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Execute one simulation tick pipeline returning emitted events.
    pub fn step(&mut self, dt: f32) -> TickEvents {
        let next_tick = self.tick.next();

        // Publish the index built at the end of the previous tick; every
        // batch below reads that buffer while this tick's build waits for
        // the post-sweep rebuild.
        self.index.swap();
        let obstacles_rebuilt = self.navigator.refresh_if_dirty();
        let destination_rebuilt = self.apply_move_command();

        self.stage_combat(dt);
        self.stage_separation();
        self.stage_integrate(dt);
        self.stage_resolve_damage(next_tick);
        self.stage_resolve_noise(next_tick);
        let deaths = self.stage_death_sweep();
        self.stage_rebuild_index();
        self.stage_visibility();
        let crystal_depleted = self.stage_crystal(dt);
        self.stage_summary(next_tick, deaths);

        self.tick = next_tick;
        TickEvents {
            tick: next_tick,
            obstacles_rebuilt,
            destination_rebuilt,
            deaths,
            crystal_depleted,
        }
    }

    fn apply_move_command(&mut self) -> bool {
        match self.pending_destination.take() {
            Some(destination) => self.navigator.set_destination(destination),
            None => false,
        }
    }

    fn stage_combat(&mut self, dt: f32) {
        if self.agents.is_empty() {
            return;
        }
        let position_pairs: Vec<(f32, f32)> = self
            .agents
            .columns()
            .positions()
            .iter()
            .map(|p| (p.x, p.y))
            .collect();

        let decisions: Vec<StageDecision> = {
            let columns = self.agents.columns();
            let profiles = &self.profiles;
            let runtimes = &self.runtime;
            let ctx = AiContext {
                index: &self.index,
                position_pairs: &position_pairs,
                positions: columns.positions(),
                healths: columns.health(),
                factions: columns.factions(),
                headings: columns.headings(),
                handles: self.agents.handles(),
                arena: &self.agents,
                grid: self.navigator.grid(),
                global: self.navigator.global(),
                destination: self.navigator.destination(),
                dt,
                noise_lifetime: self.config.noise_lifetime,
            };
            (0..self.agents.len())
                .into_par_iter()
                .map(|idx| {
                    if ctx.healths[idx] <= 0.0 {
                        return StageDecision::Skip;
                    }
                    let id = ctx.handles[idx];
                    let (Some(profile), Some(runtime)) = (profiles.get(id), runtimes.get(id))
                    else {
                        // Attachments trail the spawn by at most a tick
                        // during wave setup; skip and retry next tick.
                        return StageDecision::Skip;
                    };
                    match ctx.factions[idx] {
                        Faction::Enemy => {
                            StageDecision::Zombie(evaluate_zombie(idx, runtime, profile, &ctx))
                        }
                        Faction::Player => {
                            StageDecision::Soldier(evaluate_soldier(idx, runtime, profile, &ctx))
                        }
                        Faction::Neutral => StageDecision::Skip,
                    }
                })
                .collect()
        };

        let handles: Vec<AgentId> = self.agents.handles().to_vec();
        for (idx, decision) in decisions.iter().enumerate() {
            let id = handles[idx];
            match decision {
                StageDecision::Zombie(d) => {
                    {
                        let columns = self.agents.columns_mut();
                        columns.velocities_mut()[idx] = d.velocity;
                        columns.headings_mut()[idx] = d.heading;
                    }
                    let wander_radius = self.profiles.get(id).map_or(0.0, |p| p.wander_radius);
                    if let Some(runtime) = self.runtime.get_mut(id) {
                        runtime.phase = d.phase;
                        runtime.timer = d.timer;
                        runtime.target = d.target;
                        runtime.cached_target_pos = d.cached_target_pos;
                        runtime.wander_target = d.wander_target;
                        runtime.engaged = d.engaged;
                        runtime.alerted = d.alerted;
                        if d.request_wander_point {
                            let angle = self.rng.random_range(0.0..std::f32::consts::TAU);
                            let dist = wander_radius * self.rng.random::<f32>().sqrt();
                            runtime.wander_target = Position::new(
                                runtime.anchor.x + angle.cos() * dist,
                                runtime.anchor.y + angle.sin() * dist,
                            );
                        }
                    }
                    if let Some(hit) = d.attack {
                        self.damage_bus.push(hit);
                    }
                }
                StageDecision::Soldier(d) => {
                    {
                        let columns = self.agents.columns_mut();
                        columns.velocities_mut()[idx] = d.velocity;
                        columns.headings_mut()[idx] = d.heading;
                    }
                    if let Some(runtime) = self.runtime.get_mut(id) {
                        runtime.timer = d.timer;
                    }
                    if let Some(hit) = d.attack {
                        self.damage_bus.push(hit);
                    }
                    if let Some(noise) = d.noise {
                        self.noise_bus.push(noise);
                    }
                }
                StageDecision::Skip => {}
            }
        }
    }

    fn stage_separation(&mut self) {
        if self.agents.is_empty() {
            return;
        }
        let position_pairs: Vec<(f32, f32)> = self
            .agents
            .columns()
            .positions()
            .iter()
            .map(|p| (p.x, p.y))
            .collect();
        let forces = separation::compute_forces(
            &self.index,
            &position_pairs,
            self.config.separation_radius,
            self.config.separation_strength,
            self.config.separation_max_push,
        );
        let columns = self.agents.columns_mut();
        for (idx, &(fx, fy)) in forces.iter().enumerate() {
            // Structures contribute push but never move themselves.
            if columns.factions()[idx] == Faction::Neutral {
                continue;
            }
            let velocity = &mut columns.velocities_mut()[idx];
            velocity.vx += fx;
            velocity.vy += fy;
        }
    }

    fn stage_integrate(&mut self, dt: f32) {
        let width = self.config.world_width as f32;
        let height = self.config.world_height as f32;
        let grid = self.navigator.grid();
        let columns = self.agents.columns_mut();
        for idx in 0..columns.len() {
            let velocity = columns.velocities()[idx];
            if velocity.vx == 0.0 && velocity.vy == 0.0 {
                continue;
            }
            let current = columns.positions()[idx];
            let next = Position::new(
                (current.x + velocity.vx * dt).clamp(0.0, width - 1e-3),
                (current.y + velocity.vy * dt).clamp(0.0, height - 1e-3),
            );
            // Slide along blocked cells instead of tunneling into them.
            let resolved = if grid.is_walkable(grid.cell_of(next)) {
                next
            } else if grid.is_walkable(grid.cell_of(Position::new(next.x, current.y))) {
                Position::new(next.x, current.y)
            } else if grid.is_walkable(grid.cell_of(Position::new(current.x, next.y))) {
                Position::new(current.x, next.y)
            } else {
                current
            };
            columns.positions_mut()[idx] = resolved;
        }
    }

    fn stage_resolve_damage(&mut self, next_tick: Tick) {
        self.last_damage_applied = 0.0;
        if self.damage_bus.is_empty() {
            return;
        }
        let hits: Vec<DamageEvent> = self.damage_bus.drain().collect();
        for hit in hits {
            let Some(idx) = self.agents.index_of(hit.target) else {
                continue;
            };
            let health = self.agents.columns().health()[idx];
            if health <= 0.0 {
                continue;
            }
            let remaining = (health - hit.amount).max(0.0);
            self.agents.columns_mut().health_mut()[idx] = remaining;
            self.last_damage_applied += hit.amount;
            self.combat_debug.record(CombatDebugEvent {
                attacker: hit.attacker,
                target: hit.target,
                amount: hit.amount,
                from_player: hit.from_player,
                tick: next_tick.0,
            });
            if remaining <= 0.0 {
                self.pending_deaths.push(hit.target);
            }
        }
    }

    fn stage_resolve_noise(&mut self, next_tick: Tick) {
        let incoming: Vec<NoiseEvent> = self.noise_bus.drain().collect();
        for event in incoming {
            self.noise_markers.record(NoiseMarker {
                origin: event.origin,
                radius: event.radius,
                tick: next_tick.0,
            });
            self.active_noise.push(event);
        }
        if self.active_noise.is_empty() {
            return;
        }

        let handles: Vec<AgentId> = self.agents.handles().to_vec();
        for noise_idx in 0..self.active_noise.len() {
            let noise = self.active_noise[noise_idx];
            for (idx, &id) in handles.iter().enumerate() {
                let (position, faction, health) = {
                    let columns = self.agents.columns();
                    (
                        columns.positions()[idx],
                        columns.factions()[idx],
                        columns.health()[idx],
                    )
                };
                if faction != Faction::Enemy || health <= 0.0 {
                    continue;
                }
                let Some(profile) = self.profiles.get(id).copied() else {
                    continue;
                };
                let Some(runtime) = self.runtime.get(id).copied() else {
                    continue;
                };
                if runtime.target.is_some()
                    || !matches!(runtime.phase, Phase::Idle | Phase::Wandering)
                {
                    continue;
                }
                let dist = dist_sq(position, noise.origin).sqrt();
                if dist >= noise.radius {
                    continue;
                }
                let probability = activation_probability(
                    &self.config.noise,
                    dist,
                    noise.radius,
                    profile.noise_sensitivity,
                );
                if self.rng.random::<f32>() >= probability {
                    continue;
                }
                let mut woken = runtime;
                woken.alerted = true;
                let aggro = self.rng.random::<f32>() < self.config.noise.aggro_chance;
                if aggro
                    && let Some((target, target_pos)) =
                        self.nearest_player_to(position, profile.detect_radius_aggro)
                {
                    woken.target = Some(target);
                    woken.cached_target_pos = target_pos;
                    woken.phase = Phase::Chasing;
                } else {
                    woken.phase = Phase::Wandering;
                    woken.wander_target = noise.origin;
                }
                if let Some(slot) = self.runtime.get_mut(id) {
                    *slot = woken;
                }
            }
        }

        for noise in &mut self.active_noise {
            noise.lifetime = noise.lifetime.saturating_sub(1);
        }
        self.active_noise.retain(|noise| noise.lifetime > 0);
    }

    fn nearest_player_to(&self, origin: Position, radius: f32) -> Option<(AgentId, Position)> {
        let columns = self.agents.columns();
        let radius_sq = radius * radius;
        let mut best: Option<(f32, usize)> = None;
        for idx in 0..columns.len() {
            if columns.factions()[idx] != Faction::Player || columns.health()[idx] <= 0.0 {
                continue;
            }
            let d2 = dist_sq(columns.positions()[idx], origin);
            if d2 <= radius_sq && best.is_none_or(|(b, _)| d2 < b) {
                best = Some((d2, idx));
            }
        }
        best.map(|(_, idx)| (self.agents.handles()[idx], columns.positions()[idx]))
    }

    fn stage_death_sweep(&mut self) -> usize {
        if self.pending_deaths.is_empty() {
            return 0;
        }
        let mut dead = HashSet::new();
        for id in self.pending_deaths.drain(..) {
            if self.agents.contains(id) {
                dead.insert(id);
            }
        }
        let mut enemy_dead = 0;
        for &id in &dead {
            if let Some(idx) = self.agents.index_of(id)
                && self.agents.columns().factions()[idx] == Faction::Enemy
            {
                enemy_dead += 1;
            }
            self.runtime.remove(id);
            self.profiles.remove(id);
            self.navigator.deregister_obstacle(id);
        }
        let removed = self.agents.remove_many(&dead);
        self.wave.remaining = self.wave.remaining.saturating_sub(enemy_dead);
        removed
    }

    fn stage_rebuild_index(&mut self) {
        let position_pairs: Vec<(f32, f32)> = self
            .agents
            .columns()
            .positions()
            .iter()
            .map(|p| (p.x, p.y))
            .collect();
        self.index.rebuild(&position_pairs);
    }

    fn stage_visibility(&mut self) {
        self.fog.age_visibility();
        let sight = self.config.sight_radius;
        let columns = self.agents.columns();
        let mut observers = Vec::new();
        for idx in 0..columns.len() {
            if columns.factions()[idx] == Faction::Player && columns.health()[idx] > 0.0 {
                observers.push(columns.positions()[idx]);
            }
        }
        for observer in observers {
            self.fog.reveal_around(observer, sight);
        }
    }

    fn stage_crystal(&mut self, dt: f32) -> bool {
        if self.crystal.charge <= 0.0 {
            return false;
        }
        let attackers = {
            let columns = self.agents.columns();
            let radius_sq = self.config.crystal_radius * self.config.crystal_radius;
            (0..columns.len())
                .filter(|&idx| {
                    columns.factions()[idx] == Faction::Enemy
                        && columns.health()[idx] > 0.0
                        && dist_sq(columns.positions()[idx], self.config.crystal) <= radius_sq
                })
                .count()
        };
        if attackers == 0 {
            return false;
        }
        self.crystal.charge = (self.crystal.charge
            - self.config.crystal_drain_per_enemy * attackers as f32 * dt)
            .max(0.0);
        self.crystal.charge <= 0.0
    }

    fn stage_summary(&mut self, next_tick: Tick, deaths: usize) {
        let columns = self.agents.columns();
        let mut soldiers = 0;
        let mut zombies = 0;
        for idx in 0..columns.len() {
            match columns.factions()[idx] {
                Faction::Player => soldiers += 1,
                Faction::Enemy => zombies += 1,
                Faction::Neutral => {}
            }
        }
        let summary = TickSummary {
            tick: next_tick,
            soldiers,
            zombies,
            deaths,
            damage_applied: self.last_damage_applied,
            noise_active: self.active_noise.len(),
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the agent arena.
    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Mutable access to the agent arena.
    #[must_use]
    pub fn agents_mut(&mut self) -> &mut AgentArena {
        &mut self.agents
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Read-only access to the spatial index.
    #[must_use]
    pub fn index(&self) -> &GridIndex {
        &self.index
    }

    /// Read-only access to the navigator and its flow fields.
    #[must_use]
    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    /// Read-write access to the fog-of-war grid.
    #[must_use]
    pub fn fog_mut(&mut self) -> &mut VisibilityGrid {
        &mut self.fog
    }

    /// Read-only access to the fog-of-war grid.
    #[must_use]
    pub fn fog(&self) -> &VisibilityGrid {
        &self.fog
    }

    /// Crystal charge singleton.
    #[must_use]
    pub const fn crystal_power(&self) -> CrystalPower {
        self.crystal
    }

    /// Wave progress singleton.
    #[must_use]
    pub const fn wave_status(&self) -> WaveStatus {
        self.wave
    }

    /// Coarse threat reading derived from living enemies.
    #[must_use]
    pub fn threat_level(&self) -> ThreatLevel {
        let zombies = self
            .agents
            .columns()
            .factions()
            .iter()
            .zip(self.agents.columns().health())
            .filter(|&(faction, &health)| *faction == Faction::Enemy && health > 0.0)
            .count();
        if zombies == 0 {
            ThreatLevel::Calm
        } else if zombies < self.config.threat_siege_threshold {
            ThreatLevel::Raid
        } else {
            ThreatLevel::Siege
        }
    }

    /// Iterate over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Spawn one agent from `template` at `position`.
    pub fn spawn(&mut self, template: &SpawnTemplate, position: Position) -> AgentId {
        let heading = self
            .rng
            .random_range(-std::f32::consts::PI..std::f32::consts::PI);
        let id = self.agents.insert(AgentData {
            position,
            velocity: Velocity::default(),
            heading,
            faction: template.faction,
            health: template.max_health,
            max_health: template.max_health,
            selected: false,
        });
        self.profiles.insert(id, template.profile);
        let mut runtime = CombatRuntime::at(position, template.profile.idle_duration);
        runtime.march = template.marching;
        self.runtime.insert(id, runtime);
        if let Some(footprint) = template.obstacle {
            self.navigator.register_obstacle(id, position, footprint);
        }
        id
    }

    /// Batch-spawn a wave of `count` agents in a ring around `center`.
    pub fn spawn_wave(
        &mut self,
        template: &SpawnTemplate,
        count: usize,
        center: Position,
        radius: f32,
    ) -> Vec<AgentId> {
        let width = self.config.world_width as f32;
        let height = self.config.world_height as f32;
        let mut ids = Vec::with_capacity(count);
        for slot in 0..count {
            let angle = slot as f32 / count.max(1) as f32 * std::f32::consts::TAU
                + self.rng.random_range(-0.1..0.1);
            let dist = radius * self.rng.random_range(0.75..1.0);
            let position = Position::new(
                (center.x + angle.cos() * dist).clamp(0.0, width - 1.0),
                (center.y + angle.sin() * dist).clamp(0.0, height - 1.0),
            );
            ids.push(self.spawn(template, position));
        }
        if template.faction == Faction::Enemy {
            self.wave.wave += 1;
            self.wave.spawned += count;
            self.wave.remaining += count;
        }
        ids
    }

    /// Remove an agent by handle, dropping every attachment.
    pub fn remove_agent(&mut self, id: AgentId) -> Option<AgentData> {
        self.runtime.remove(id);
        self.profiles.remove(id);
        self.navigator.deregister_obstacle(id);
        let removed = self.agents.remove(id)?;
        if removed.faction == Faction::Enemy && removed.health > 0.0 {
            self.wave.remaining = self.wave.remaining.saturating_sub(1);
        }
        Some(removed)
    }

    /// Remove every surviving enemy (wave cleanup between rounds).
    pub fn clear_wave(&mut self) -> usize {
        let doomed: Vec<AgentId> = {
            let columns = self.agents.columns();
            self.agents
                .handles()
                .iter()
                .enumerate()
                .filter(|&(idx, _)| columns.factions()[idx] == Faction::Enemy)
                .map(|(_, &id)| id)
                .collect()
        };
        let count = doomed.len();
        for id in doomed {
            self.remove_agent(id);
        }
        self.wave.remaining = 0;
        count
    }

    /// Queue a player move command; the destination field regenerates at
    /// the next tick boundary if the target actually changed.
    pub fn command_move(&mut self, destination: Position) {
        self.pending_destination = Some(destination);
    }

    /// Toggle the selection flag rendered around an agent.
    pub fn set_selected(&mut self, id: AgentId, selected: bool) {
        if let Some(idx) = self.agents.index_of(id) {
            self.agents.columns_mut().selected_mut()[idx] = selected;
        }
    }

    /// Enqueue an externally produced hit (scripted hazards, projectiles).
    pub fn enqueue_damage(&mut self, event: DamageEvent) {
        self.damage_bus.push(event);
    }

    /// Enqueue an externally produced noise burst.
    pub fn enqueue_noise(&mut self, event: NoiseEvent) {
        self.noise_bus.push(event);
    }

    /// Drain the noise visualization queue.
    pub fn drain_noise_markers(&mut self) -> Vec<NoiseMarker> {
        self.noise_markers.drain().collect()
    }

    /// Drain the combat debug queue.
    pub fn drain_combat_debug(&mut self) -> Vec<CombatDebugEvent> {
        self.combat_debug.drain().collect()
    }

    /// Borrow combat runtime state for a specific agent.
    #[must_use]
    pub fn agent_runtime(&self, id: AgentId) -> Option<&CombatRuntime> {
        self.runtime.get(id)
    }

    /// Mutably borrow combat runtime state for a specific agent.
    #[must_use]
    pub fn agent_runtime_mut(&mut self, id: AgentId) -> Option<&mut CombatRuntime> {
        self.runtime.get_mut(id)
    }

    /// Borrow the combat profile attached to a specific agent.
    #[must_use]
    pub fn agent_profile(&self, id: AgentId) -> Option<&CombatProfile> {
        self.profiles.get(id)
    }

    /// Public snapshot of one agent for rendering and UI.
    #[must_use]
    pub fn snapshot_agent(&self, id: AgentId) -> Option<AgentSnapshot> {
        let idx = self.agents.index_of(id)?;
        let columns = self.agents.columns();
        let max = columns.max_health()[idx];
        let health = columns.health()[idx];
        Some(AgentSnapshot {
            id,
            position: columns.positions()[idx],
            heading: columns.headings()[idx],
            faction: columns.factions()[idx],
            health_percent: if max > 0.0 {
                (health / max).clamp(0.0, 1.0)
            } else {
                0.0
            },
            alive: health > 0.0,
            selected: columns.selected()[idx],
        })
    }

    /// Snapshots of every live agent in dense order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.agents
            .handles()
            .iter()
            .filter_map(|&id| self.snapshot_agent(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> SimConfig {
        SimConfig {
            world_width: 120,
            world_height: 120,
            nav_cell_size: 4,
            index_cell_size: 6.0,
            crystal: Position::new(60.0, 60.0),
            // Separation off so scripted scenarios stay put.
            separation_strength: 0.0,
            rng_seed: Some(7),
            ..SimConfig::default()
        }
    }

    /// Player-faction target that never shoots back.
    fn dummy_target() -> SpawnTemplate {
        let mut template = SpawnTemplate::soldier();
        template.profile.attack_range = 0.0;
        template
    }

    #[test]
    fn config_validation_rejects_bad_grids() {
        let config = SimConfig {
            world_width: 0,
            ..SimConfig::default()
        };
        assert!(WorldState::new(config).is_err());

        let config = SimConfig {
            world_width: 481,
            ..SimConfig::default()
        };
        assert!(WorldState::new(config).is_err());

        let config = SimConfig {
            crystal: Position::new(9_999.0, 0.0),
            ..SimConfig::default()
        };
        assert!(WorldState::new(config).is_err());

        let config = SimConfig {
            index_cell_size: 0.0,
            ..SimConfig::default()
        };
        assert!(WorldState::new(config).is_err());
    }

    #[test]
    fn spawn_attaches_profile_runtime_and_obstacle() {
        let mut world = WorldState::new(quiet_config()).expect("world");
        let zombie = world.spawn(&SpawnTemplate::zombie(), Position::new(10.0, 10.0));
        let bunker = world.spawn(&SpawnTemplate::structure(2, 2, 200.0), Position::new(30.0, 30.0));

        assert_eq!(world.agent_count(), 2);
        assert!(world.agent_profile(zombie).is_some());
        let runtime = world.agent_runtime(zombie).expect("runtime");
        assert_eq!(runtime.phase, Phase::Idle);
        assert_eq!(runtime.anchor, Position::new(10.0, 10.0));
        assert!(world.navigator().is_dirty());

        let events = world.step(0.1);
        assert!(events.obstacles_rebuilt);
        assert!(world.navigator().has_obstacle(bunker));

        let snapshot = world.snapshot_agent(zombie).expect("snapshot");
        assert!(snapshot.alive);
        assert_eq!(snapshot.faction, Faction::Enemy);
        assert!((snapshot.health_percent - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn step_advances_tick_and_records_history() {
        let mut world = WorldState::new(quiet_config()).expect("world");
        world.spawn_wave(
            &SpawnTemplate::zombie(),
            8,
            Position::new(20.0, 20.0),
            10.0,
        );
        world.spawn(&SpawnTemplate::soldier(), Position::new(100.0, 100.0));

        let events = world.step(0.1);
        assert_eq!(events.tick, Tick(1));
        assert_eq!(world.tick(), Tick(1));
        world.step(0.1);
        assert_eq!(world.tick(), Tick(2));

        let summary = world.history().last().expect("summary");
        assert_eq!(summary.tick, Tick(2));
        assert_eq!(summary.soldiers, 1);
        assert_eq!(summary.zombies, 8);
        assert_eq!(world.threat_level(), ThreatLevel::Raid);
        assert!(world.index().is_built());
    }

    #[test]
    fn windup_gates_the_first_strike() {
        let mut world = WorldState::new(quiet_config()).expect("world");
        let target = world.spawn(&dummy_target(), Position::new(50.0, 50.0));
        let zombie = world.spawn(&SpawnTemplate::zombie(), Position::new(50.0, 50.0));
        let windup = world.agent_profile(zombie).expect("profile").windup;

        let dt = 0.1;
        let mut first_strike_tick = None;
        for _ in 0..80 {
            world.step(dt);
            let hits = world.drain_combat_debug();
            if !hits.is_empty() {
                assert_eq!(hits.len(), 1, "exactly one strike expected");
                assert!(!hits[0].from_player);
                assert_eq!(hits[0].target, target);
                first_strike_tick = Some(world.tick());
                break;
            }
        }
        let first_strike_tick = first_strike_tick.expect("zombie should land a strike");
        // The strike cannot land before the windup has elapsed.
        assert!(first_strike_tick.0 as f32 * dt >= windup);

        let runtime = world.agent_runtime(zombie).expect("runtime");
        assert_eq!(runtime.phase, Phase::Cooldown);
        assert!(runtime.engaged);

        let profile = world.agent_profile(zombie).expect("profile");
        let snapshot = world.snapshot_agent(target).expect("snapshot");
        let expected = (100.0 - profile.damage) / 100.0;
        assert!((snapshot.health_percent - expected).abs() < 1e-5);
    }

    #[test]
    fn engaged_attacker_skips_windup_after_cooldown() {
        let mut world = WorldState::new(quiet_config()).expect("world");
        world.spawn(&dummy_target(), Position::new(50.0, 50.0));
        let zombie = world.spawn(&SpawnTemplate::zombie(), Position::new(50.0, 50.0));
        let profile = *world.agent_profile(zombie).expect("profile");

        let dt = 0.1;
        let mut strike_ticks = Vec::new();
        for _ in 0..200 {
            world.step(dt);
            for hit in world.drain_combat_debug() {
                if !hit.from_player {
                    strike_ticks.push(hit.tick);
                }
            }
            if strike_ticks.len() >= 2 {
                break;
            }
        }
        assert!(strike_ticks.len() >= 2, "expected a follow-up strike");
        let gap = (strike_ticks[1] - strike_ticks[0]) as f32 * dt;
        // Engaged repeat attacks pay only the cooldown, never a second windup.
        assert!(gap >= profile.cooldown - dt);
        assert!(gap < profile.cooldown + profile.windup);
    }

    #[test]
    fn damage_sums_commutatively_across_enqueue_order() {
        let amounts = [4.0f32, 9.0, 1.5, 6.25];
        let mut healths = Vec::new();
        for reversed in [false, true] {
            let mut world = WorldState::new(quiet_config()).expect("world");
            let target = world.spawn(&SpawnTemplate::zombie(), Position::new(20.0, 20.0));
            let attacker = world.spawn(&dummy_target(), Position::new(100.0, 100.0));
            let ordered: Vec<f32> = if reversed {
                amounts.iter().rev().copied().collect()
            } else {
                amounts.to_vec()
            };
            for amount in ordered {
                world.enqueue_damage(DamageEvent {
                    target,
                    amount,
                    direction: (1.0, 0.0),
                    attacker,
                    from_player: true,
                });
            }
            world.step(0.1);
            let snapshot = world.snapshot_agent(target).expect("snapshot");
            healths.push(snapshot.health_percent);
        }
        assert_eq!(healths[0], healths[1]);
        let expected = (50.0 - amounts.iter().sum::<f32>()) / 50.0;
        assert!((healths[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn lethal_damage_soft_deletes_then_sweeps() {
        let mut world = WorldState::new(quiet_config()).expect("world");
        let ids = world.spawn_wave(
            &SpawnTemplate::zombie(),
            3,
            Position::new(30.0, 30.0),
            8.0,
        );
        let victim = ids[0];
        let attacker = world.spawn(&dummy_target(), Position::new(100.0, 100.0));
        assert_eq!(world.wave_status().remaining, 3);

        world.enqueue_damage(DamageEvent {
            target: victim,
            amount: 500.0,
            direction: (0.0, 1.0),
            attacker,
            from_player: true,
        });
        let events = world.step(0.1);
        assert_eq!(events.deaths, 1);
        assert!(!world.agents().contains(victim));
        assert!(world.agent_runtime(victim).is_none());
        assert!(world.agent_profile(victim).is_none());
        assert_eq!(world.wave_status().remaining, 2);
        assert_eq!(world.snapshots().len(), 3);
    }

    #[test]
    fn noise_wakes_dormant_zombies_toward_the_origin() {
        let mut config = quiet_config();
        // Force the roll so the transition is deterministic.
        config.noise.min_probability = 1.0;
        config.noise.max_probability = 1.0;
        config.noise.aggro_chance = 0.0;
        let mut world = WorldState::new(config).expect("world");
        let near = world.spawn(&SpawnTemplate::zombie(), Position::new(40.0, 40.0));
        let far = world.spawn(&SpawnTemplate::zombie(), Position::new(110.0, 110.0));

        let origin = Position::new(48.0, 40.0);
        world.enqueue_noise(NoiseEvent {
            origin,
            radius: 20.0,
            lifetime: 1,
        });
        world.step(0.1);

        let woken = world.agent_runtime(near).expect("near runtime");
        assert_eq!(woken.phase, Phase::Wandering);
        assert!(woken.alerted);
        assert_eq!(woken.wander_target, origin);

        let dormant = world.agent_runtime(far).expect("far runtime");
        assert!(!dormant.alerted, "noise must not reach past its radius");
        assert_eq!(world.drain_noise_markers().len(), 1);
    }

    #[test]
    fn aggro_roll_acquires_a_target_when_one_is_in_reach() {
        let mut config = quiet_config();
        config.noise.min_probability = 1.0;
        config.noise.max_probability = 1.0;
        config.noise.aggro_chance = 1.0;
        let mut world = WorldState::new(config).expect("world");
        let zombie = world.spawn(&SpawnTemplate::zombie(), Position::new(40.0, 40.0));
        // Outside the idle detection radius, inside the aggro radius.
        let soldier = world.spawn(&dummy_target(), Position::new(60.0, 40.0));

        world.enqueue_noise(NoiseEvent {
            origin: Position::new(40.0, 44.0),
            radius: 15.0,
            lifetime: 1,
        });
        world.step(0.1);

        let runtime = world.agent_runtime(zombie).expect("runtime");
        assert_eq!(runtime.phase, Phase::Chasing);
        assert_eq!(runtime.target, Some(soldier));
    }

    #[test]
    fn crystal_drains_while_enemies_stand_on_it() {
        let mut config = quiet_config();
        config.crystal_charge = 1.0;
        config.crystal_drain_per_enemy = 2.0;
        let mut world = WorldState::new(config).expect("world");
        world.spawn(&SpawnTemplate::zombie(), Position::new(60.0, 60.0));

        let before = world.crystal_power().charge;
        let events = world.step(0.1);
        assert!(world.crystal_power().charge < before);
        assert!(!events.crystal_depleted);

        let mut depleted = false;
        for _ in 0..20 {
            if world.step(0.1).crystal_depleted {
                depleted = true;
                break;
            }
        }
        assert!(depleted);
        assert_eq!(world.crystal_power().charge, 0.0);
        assert_eq!(world.crystal_power().percent(), 0.0);
    }

    #[test]
    fn clear_wave_removes_surviving_enemies_only() {
        let mut world = WorldState::new(quiet_config()).expect("world");
        world.spawn_wave(
            &SpawnTemplate::marching_zombie(),
            5,
            Position::new(20.0, 20.0),
            8.0,
        );
        let soldier = world.spawn(&SpawnTemplate::soldier(), Position::new(100.0, 100.0));

        assert_eq!(world.clear_wave(), 5);
        assert_eq!(world.wave_status().remaining, 0);
        assert_eq!(world.agent_count(), 1);
        assert!(world.agents().contains(soldier));
    }

    #[test]
    fn selection_flag_round_trips_through_snapshots() {
        let mut world = WorldState::new(quiet_config()).expect("world");
        let soldier = world.spawn(&SpawnTemplate::soldier(), Position::new(12.0, 12.0));
        world.set_selected(soldier, true);
        assert!(world.snapshot_agent(soldier).expect("snapshot").selected);
        world.set_selected(soldier, false);
        assert!(!world.snapshot_agent(soldier).expect("snapshot").selected);
    }
}
