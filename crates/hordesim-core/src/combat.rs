//! Zombie combat state machine and soldier auto-fire.
//!
//! Per-agent evaluation is pure: it reads the previous tick's spatial index,
//! the current flow fields, and column snapshots, and returns a decision
//! struct plus optional events. The world merges decisions and events at the
//! stage join, so no evaluation ever writes shared state.

use hordesim_index::{GridIndex, NeighborhoodIndex};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::events::{DamageEvent, NoiseEvent};
use crate::flow::{FlowField, WalkGrid};
use crate::{AgentArena, AgentId, Faction, Position, Velocity};

/// Distance treated as "already there" for wander arrival and point-blank
/// attacks.
const ARRIVAL_EPSILON: f32 = 1.0;

/// Phase of the combat state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Wandering,
    Chasing,
    WindingUp,
    Attacking,
    Cooldown,
}

/// Rarely-written combat tuning, attached once at spawn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CombatProfile {
    /// Damage dealt per landed attack.
    pub damage: f32,
    /// Maximum distance at which an attack connects.
    pub attack_range: f32,
    /// Full width of the attack cone, radians.
    pub attack_cone: f32,
    /// Delay between stopping in range and the first strike, seconds.
    pub windup: f32,
    /// Recovery time between strikes, seconds.
    pub cooldown: f32,
    /// Full movement speed, world units per second.
    pub move_speed: f32,
    /// Maximum turn rate, radians per second.
    pub turn_speed: f32,
    /// Speed multiplier while wandering.
    pub wander_speed_fraction: f32,
    /// Maximum wander distance from the spawn anchor.
    pub wander_radius: f32,
    /// Idle time before the next wander leg, seconds.
    pub idle_duration: f32,
    /// Detection radius while dormant.
    pub detect_radius_idle: f32,
    /// Detection radius once alerted.
    pub detect_radius_aggro: f32,
    /// Losing a target past this distance reverts toward Idle.
    pub chase_radius: f32,
    /// Multiplier on noise activation rolls.
    pub noise_sensitivity: f32,
    /// Loudness radius of this agent's own attacks.
    pub noise_radius: f32,
}

impl CombatProfile {
    /// Baseline melee zombie.
    #[must_use]
    pub fn zombie() -> Self {
        Self {
            damage: 10.0,
            attack_range: 1.8,
            attack_cone: std::f32::consts::FRAC_PI_2,
            windup: 0.8,
            cooldown: 1.2,
            move_speed: 4.0,
            turn_speed: 12.0,
            wander_speed_fraction: 0.35,
            wander_radius: 12.0,
            idle_duration: 2.5,
            detect_radius_idle: 8.0,
            detect_radius_aggro: 24.0,
            chase_radius: 40.0,
            noise_sensitivity: 1.0,
            noise_radius: 0.0,
        }
    }

    /// Profile for agents that never fight or move (structures).
    #[must_use]
    pub fn inert() -> Self {
        Self {
            damage: 0.0,
            attack_range: 0.0,
            attack_cone: 0.0,
            windup: 0.0,
            cooldown: 0.0,
            move_speed: 0.0,
            turn_speed: 0.0,
            wander_speed_fraction: 0.0,
            wander_radius: 0.0,
            idle_duration: 0.0,
            detect_radius_idle: 0.0,
            detect_radius_aggro: 0.0,
            chase_radius: 0.0,
            noise_sensitivity: 0.0,
            noise_radius: 0.0,
        }
    }

    /// Baseline rifle soldier.
    #[must_use]
    pub fn soldier() -> Self {
        Self {
            damage: 6.0,
            attack_range: 14.0,
            attack_cone: std::f32::consts::TAU,
            windup: 0.0,
            cooldown: 0.5,
            move_speed: 5.0,
            turn_speed: 16.0,
            wander_speed_fraction: 0.0,
            wander_radius: 0.0,
            idle_duration: 0.0,
            detect_radius_idle: 14.0,
            detect_radius_aggro: 14.0,
            chase_radius: 0.0,
            noise_sensitivity: 0.0,
            noise_radius: 30.0,
        }
    }
}

/// Frequently-mutated combat state, evaluated once per tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CombatRuntime {
    pub phase: Phase,
    /// Countdown driving the current phase (idle wait, windup, cooldown).
    pub timer: f32,
    pub target: Option<AgentId>,
    /// Target position as last refreshed by this state machine; movement
    /// reads this cache instead of chasing live positions across jobs.
    pub cached_target_pos: Position,
    pub wander_target: Position,
    /// Spawn point anchoring the wander area.
    pub anchor: Position,
    /// Set once windup has been paid against the current target; cleared on
    /// target loss.
    pub engaged: bool,
    /// Widens detection to the aggro radius.
    pub alerted: bool,
    /// Wave spawns press toward the crystal instead of milling around.
    pub march: bool,
}

impl CombatRuntime {
    /// Fresh dormant state anchored at the spawn position.
    #[must_use]
    pub fn at(anchor: Position, idle_duration: f32) -> Self {
        Self {
            phase: Phase::Idle,
            timer: idle_duration,
            target: None,
            cached_target_pos: anchor,
            wander_target: anchor,
            anchor,
            engaged: false,
            alerted: false,
            march: false,
        }
    }
}

/// Tunables for noise-driven activation of dormant zombies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NoiseParams {
    /// Activation probability at zero distance before sensitivity scaling.
    pub base_probability: f32,
    /// Exponent shaping the distance falloff.
    pub falloff_exponent: f32,
    /// Lower clamp on the final probability.
    pub min_probability: f32,
    /// Upper clamp on the final probability.
    pub max_probability: f32,
    /// Share of successful rolls that aggro straight into a chase.
    pub aggro_chance: f32,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            base_probability: 0.8,
            falloff_exponent: 1.5,
            min_probability: 0.05,
            max_probability: 0.95,
            aggro_chance: 0.2,
        }
    }
}

/// Probability that a noise at `dist` wakes a zombie with the given
/// sensitivity. Combination order is multiply-then-clamp; the formula is a
/// tunable, not a contract.
#[must_use]
pub fn activation_probability(params: &NoiseParams, dist: f32, radius: f32, sensitivity: f32) -> f32 {
    if radius <= 0.0 || dist >= radius {
        return 0.0;
    }
    let falloff = 1.0 - (dist / radius).powf(params.falloff_exponent);
    (params.base_probability * falloff * sensitivity)
        .clamp(params.min_probability, params.max_probability)
}

/// Read-only inputs shared by every combat evaluation in a tick.
pub(crate) struct AiContext<'a> {
    pub index: &'a GridIndex,
    pub position_pairs: &'a [(f32, f32)],
    pub positions: &'a [Position],
    pub healths: &'a [f32],
    pub factions: &'a [Faction],
    pub headings: &'a [f32],
    pub handles: &'a [AgentId],
    pub arena: &'a AgentArena,
    pub grid: &'a WalkGrid,
    pub global: &'a FlowField,
    pub destination: &'a FlowField,
    pub dt: f32,
    pub noise_lifetime: u8,
}

impl AiContext<'_> {
    /// Dense index and position of a still-living target.
    fn living_target(&self, id: AgentId) -> Option<(usize, Position)> {
        let index = self.arena.index_of(id)?;
        if self.healths[index] > 0.0 {
            Some((index, self.positions[index]))
        } else {
            None
        }
    }

    /// Nearest living agent of `faction` within `radius` of `origin`,
    /// excluding `self_idx`. Reads the previous tick's index buckets.
    fn nearest_living(
        &self,
        self_idx: usize,
        origin: Position,
        radius: f32,
        faction: Faction,
    ) -> Option<(AgentId, Position)> {
        let mut best: Option<(OrderedFloat<f32>, usize)> = None;
        self.index.neighbors_within(
            self.position_pairs,
            (origin.x, origin.y),
            radius * radius,
            &mut |idx, dist_sq| {
                if idx == self_idx || self.factions[idx] != faction || self.healths[idx] <= 0.0 {
                    return;
                }
                if best.is_none_or(|(current, _)| dist_sq < current) {
                    best = Some((dist_sq, idx));
                }
            },
        );
        best.map(|(_, idx)| (self.handles[idx], self.positions[idx]))
    }
}

/// Outcome of one zombie evaluation, applied at the stage join.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AiDecision {
    pub phase: Phase,
    pub timer: f32,
    pub target: Option<AgentId>,
    pub cached_target_pos: Position,
    pub wander_target: Position,
    pub engaged: bool,
    pub alerted: bool,
    pub velocity: Velocity,
    pub heading: f32,
    /// Ask the sequential apply step to roll a fresh wander point.
    pub request_wander_point: bool,
    pub attack: Option<DamageEvent>,
}

/// Outcome of one soldier evaluation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SoldierDecision {
    pub timer: f32,
    pub velocity: Velocity,
    pub heading: f32,
    pub attack: Option<DamageEvent>,
    pub noise: Option<NoiseEvent>,
}

fn wrap_signed_angle(mut angle: f32) -> f32 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle <= -std::f32::consts::PI {
        angle += std::f32::consts::TAU;
    }
    while angle > std::f32::consts::PI {
        angle -= std::f32::consts::TAU;
    }
    angle
}

/// Rotate `current` toward `desired` by at most `max_step` radians.
fn turn_toward(current: f32, desired: f32, max_step: f32) -> f32 {
    let delta = wrap_signed_angle(desired - current);
    if delta.abs() <= max_step {
        desired
    } else {
        wrap_signed_angle(current + delta.signum() * max_step)
    }
}

fn bearing(from: Position, to: Position) -> f32 {
    (to.y - from.y).atan2(to.x - from.x)
}

fn distance(a: Position, b: Position) -> f32 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    (dx * dx + dy * dy).sqrt()
}

fn velocity_toward(from: Position, to: Position, speed: f32) -> Velocity {
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    let length = (dx * dx + dy * dy).sqrt();
    if length <= f32::EPSILON {
        Velocity::default()
    } else {
        Velocity::new(dx / length * speed, dy / length * speed)
    }
}

/// Whether a target at `to` sits inside the attack cone of an agent at
/// `from` facing `heading`. Point-blank contact always passes.
fn within_cone(from: Position, to: Position, heading: f32, cone: f32) -> bool {
    let dist = distance(from, to);
    if dist <= ARRIVAL_EPSILON {
        return true;
    }
    wrap_signed_angle(bearing(from, to) - heading).abs() <= cone * 0.5
}

fn lose_target(decision: &mut AiDecision, idle_duration: f32) {
    decision.target = None;
    decision.engaged = false;
    decision.phase = Phase::Idle;
    decision.timer = idle_duration;
}

/// Resolve an attack the instant the machine enters `Attacking`: the event
/// fires only if the target is in range and inside the cone, and the state
/// always lands in Cooldown afterwards.
fn perform_attack(
    decision: &mut AiDecision,
    me: Position,
    self_id: AgentId,
    target: AgentId,
    profile: &CombatProfile,
    from_player: bool,
) {
    let to = decision.cached_target_pos;
    if distance(me, to) <= profile.attack_range
        && within_cone(me, to, decision.heading, profile.attack_cone)
    {
        let direction = {
            let b = bearing(me, to);
            (b.cos(), b.sin())
        };
        decision.attack = Some(DamageEvent {
            target,
            amount: profile.damage,
            direction,
            attacker: self_id,
            from_player,
        });
        decision.engaged = true;
    }
    decision.phase = Phase::Cooldown;
    decision.timer = profile.cooldown;
}

/// Advance one zombie by one tick. Pure: writes nothing, returns the next
/// state plus any attack to enqueue.
pub(crate) fn evaluate_zombie(
    idx: usize,
    runtime: &CombatRuntime,
    profile: &CombatProfile,
    ctx: &AiContext<'_>,
) -> AiDecision {
    let me = ctx.positions[idx];
    let self_id = ctx.handles[idx];
    let mut decision = AiDecision {
        phase: runtime.phase,
        timer: runtime.timer,
        target: runtime.target,
        cached_target_pos: runtime.cached_target_pos,
        wander_target: runtime.wander_target,
        engaged: runtime.engaged,
        alerted: runtime.alerted,
        velocity: Velocity::default(),
        heading: ctx.headings[idx],
        request_wander_point: false,
        attack: None,
    };

    // Validate and refresh the cached target position first; everything
    // below reads the cache, never live positions.
    if let Some(target) = decision.target {
        match ctx.living_target(target) {
            Some((_, position)) if distance(me, position) <= profile.chase_radius => {
                decision.cached_target_pos = position;
            }
            _ => lose_target(&mut decision, profile.idle_duration),
        }
    }

    if decision.target.is_none() && matches!(decision.phase, Phase::Idle | Phase::Wandering) {
        let radius = if decision.alerted {
            profile.detect_radius_aggro
        } else {
            profile.detect_radius_idle
        };
        if let Some((id, position)) = ctx.nearest_living(idx, me, radius, Faction::Player) {
            decision.target = Some(id);
            decision.cached_target_pos = position;
            decision.alerted = true;
            decision.phase = Phase::Chasing;
        }
    }

    let turn_step = profile.turn_speed * ctx.dt;
    match decision.phase {
        Phase::Idle => {
            decision.timer -= ctx.dt;
            if decision.timer <= 0.0 {
                decision.phase = Phase::Wandering;
                if runtime.march {
                    decision.wander_target = march_waypoint(me, ctx).unwrap_or(me);
                } else {
                    decision.request_wander_point = true;
                }
            }
        }
        Phase::Wandering => {
            if runtime.march {
                // Marching zombies take their waypoints from the global
                // field so the horde keeps pressing toward the crystal.
                match march_waypoint(me, ctx) {
                    Some(waypoint) => {
                        decision.wander_target = waypoint;
                        decision.velocity = velocity_toward(me, waypoint, profile.move_speed);
                        decision.heading =
                            turn_toward(decision.heading, bearing(me, waypoint), turn_step);
                    }
                    None => {
                        decision.phase = Phase::Idle;
                        decision.timer = profile.idle_duration;
                    }
                }
            } else if distance(me, decision.wander_target) <= ARRIVAL_EPSILON {
                decision.phase = Phase::Idle;
                decision.timer = profile.idle_duration;
            } else {
                let speed = profile.move_speed * profile.wander_speed_fraction;
                decision.velocity = velocity_toward(me, decision.wander_target, speed);
                decision.heading =
                    turn_toward(decision.heading, bearing(me, decision.wander_target), turn_step);
            }
        }
        Phase::Chasing => {
            if let Some(target) = decision.target {
                let to = decision.cached_target_pos;
                if distance(me, to) <= profile.attack_range {
                    decision.heading = turn_toward(decision.heading, bearing(me, to), turn_step);
                    if decision.engaged {
                        perform_attack(&mut decision, me, self_id, target, profile, false);
                    } else {
                        decision.phase = Phase::WindingUp;
                        decision.timer = profile.windup;
                    }
                } else {
                    decision.velocity = velocity_toward(me, to, profile.move_speed);
                    decision.heading = turn_toward(decision.heading, bearing(me, to), turn_step);
                }
            }
        }
        Phase::WindingUp => {
            if let Some(target) = decision.target {
                let to = decision.cached_target_pos;
                if distance(me, to) > profile.attack_range {
                    decision.phase = Phase::Chasing;
                } else {
                    decision.heading = turn_toward(decision.heading, bearing(me, to), turn_step);
                    decision.timer -= ctx.dt;
                    if decision.timer <= 0.0 {
                        perform_attack(&mut decision, me, self_id, target, profile, false);
                    }
                }
            }
        }
        Phase::Attacking => {
            // Attacks resolve the tick the machine enters this phase, so a
            // persisted Attacking state only means the target vanished
            // mid-transition; fall back to a chase re-evaluation.
            decision.phase = Phase::Chasing;
        }
        Phase::Cooldown => {
            if let Some(target) = decision.target {
                let to = decision.cached_target_pos;
                decision.heading = turn_toward(decision.heading, bearing(me, to), turn_step);
                decision.timer -= ctx.dt;
                if decision.timer <= 0.0 {
                    if distance(me, to) > profile.attack_range {
                        decision.phase = Phase::Chasing;
                    } else if decision.engaged {
                        perform_attack(&mut decision, me, self_id, target, profile, false);
                    } else {
                        decision.phase = Phase::WindingUp;
                        decision.timer = profile.windup;
                    }
                }
            }
        }
    }

    decision
}

/// Next waypoint for a marching zombie, one flow step ahead; `None` once
/// the field reports arrival (zero vector at the crystal).
fn march_waypoint(me: Position, ctx: &AiContext<'_>) -> Option<Position> {
    let (dx, dy) = ctx.global.sample(ctx.grid, me);
    if dx == 0.0 && dy == 0.0 {
        return None;
    }
    let stride = ctx.grid.cell_size();
    Some(Position::new(me.x + dx * stride, me.y + dy * stride))
}

/// Advance one soldier by one tick: steer along the destination field and
/// fire on cooldown at the nearest living zombie in weapon range.
pub(crate) fn evaluate_soldier(
    idx: usize,
    runtime: &CombatRuntime,
    profile: &CombatProfile,
    ctx: &AiContext<'_>,
) -> SoldierDecision {
    let me = ctx.positions[idx];
    let self_id = ctx.handles[idx];
    let turn_step = profile.turn_speed * ctx.dt;
    let mut decision = SoldierDecision {
        timer: (runtime.timer - ctx.dt).max(0.0),
        velocity: Velocity::default(),
        heading: ctx.headings[idx],
        attack: None,
        noise: None,
    };

    let (dx, dy) = ctx.destination.sample(ctx.grid, me);
    if dx != 0.0 || dy != 0.0 {
        decision.velocity = Velocity::new(dx * profile.move_speed, dy * profile.move_speed);
        decision.heading = turn_toward(decision.heading, dy.atan2(dx), turn_step);
    }

    if let Some((target, position)) =
        ctx.nearest_living(idx, me, profile.attack_range, Faction::Enemy)
    {
        decision.heading = turn_toward(decision.heading, bearing(me, position), turn_step);
        if decision.timer <= 0.0 {
            let b = bearing(me, position);
            decision.attack = Some(DamageEvent {
                target,
                amount: profile.damage,
                direction: (b.cos(), b.sin()),
                attacker: self_id,
                from_player: true,
            });
            decision.noise = Some(NoiseEvent {
                origin: me,
                radius: profile.noise_radius,
                lifetime: ctx.noise_lifetime,
            });
            decision.timer = profile.cooldown;
        }
    }

    decision
}
