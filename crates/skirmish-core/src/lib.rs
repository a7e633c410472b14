//! Deterministic stepping core for the skirmish training environment.
//!
//! A world advances a fixed population of circular agents and a growing
//! population of ballistic projectiles through discrete, bit-reproducible
//! timesteps inside a clamped rectangular arena. The event stream, the
//! state digest, and snapshots are pure functions of the construction
//! parameters, the seed, and the action sequence.

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};
use skirmish_index::{GridError, UniformGrid};
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

new_key_type! {
    /// Stable handle for projectiles.
    pub struct ProjectileId;
}

/// Identifier assigned to an infantry block in registration order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Desired-velocity magnitudes below this keep the previous desired heading.
const DESIRED_SPEED_EPSILON: f32 = 1e-6;

/// Post-resolution penetration slack guaranteed by the collision pass, in
/// meters.
pub const COLLISION_SLACK: f32 = 0.05;

/// Wrap an angle onto (-pi, pi] via the unit circle.
#[inline]
#[must_use]
pub fn wrap_angle(angle: f32) -> f32 {
    angle.sin().atan2(angle.cos())
}

/// High level simulation clock (steps processed since construction or reset).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
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

/// Planar position in arena coordinates (meters).
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

    /// Euclidean distance to another position.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Planar velocity (m/s).
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

    /// Magnitude of the velocity.
    #[must_use]
    pub fn speed(self) -> f32 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }
}

/// Point or velocity in 2.5D space: arena plane plus altitude.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// Construct a new triple.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Per-agent physical and cognitive attributes.
///
/// The stepping core consumes `max_speed`, `acceleration` and `agility`;
/// the remaining fields ride along for the observation, targeting and
/// morale phases layered on top of this crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentAttributes {
    pub strength: f32,
    pub cruise_speed: f32,
    pub max_speed: f32,
    pub acceleration: f32,
    /// Turn rate in rad/s.
    pub agility: f32,
    pub precision: f32,
    pub impetuousness: f32,
    pub timidity: f32,
}

impl Default for AgentAttributes {
    fn default() -> Self {
        Self {
            strength: 1.0,
            cruise_speed: 5.0,
            max_speed: 8.0,
            acceleration: 2.0,
            agility: 3.0,
            precision: 0.7,
            impetuousness: 0.5,
            timidity: 0.5,
        }
    }
}

/// Payload handed to [`World::add_agent`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentSpec {
    pub team: u8,
    pub position: Position,
    pub heading: f32,
    pub attributes: AgentAttributes,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            team: 0,
            position: Position::default(),
            heading: 0.0,
            attributes: AgentAttributes::default(),
        }
    }
}

/// Scalar fields for a single agent, copied out of the SoA store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub team: u8,
    pub position: Position,
    pub velocity: Velocity,
    pub heading: f32,
    pub desired_velocity: Velocity,
    pub desired_heading: f32,
    pub attributes: AgentAttributes,
    pub alive: bool,
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentColumns {
    teams: Vec<u8>,
    positions: Vec<Position>,
    velocities: Vec<Velocity>,
    headings: Vec<f32>,
    desired_velocities: Vec<Velocity>,
    desired_headings: Vec<f32>,
    attributes: Vec<AgentAttributes>,
    alive: Vec<bool>,
}

impl AgentColumns {
    /// Number of rows, live or dead.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.teams.clear();
        self.positions.clear();
        self.velocities.clear();
        self.headings.clear();
        self.desired_velocities.clear();
        self.desired_headings.clear();
        self.attributes.clear();
        self.alive.clear();
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, agent: AgentData) {
        self.teams.push(agent.team);
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.headings.push(agent.heading);
        self.desired_velocities.push(agent.desired_velocity);
        self.desired_headings.push(agent.desired_heading);
        self.attributes.push(agent.attributes);
        self.alive.push(agent.alive);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            team: self.teams[index],
            position: self.positions[index],
            velocity: self.velocities[index],
            heading: self.headings[index],
            desired_velocity: self.desired_velocities[index],
            desired_heading: self.desired_headings[index],
            attributes: self.attributes[index],
            alive: self.alive[index],
        }
    }

    /// Immutable access to team tags.
    #[must_use]
    pub fn teams(&self) -> &[u8] {
        &self.teams
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

    /// Immutable access to desired velocities.
    #[must_use]
    pub fn desired_velocities(&self) -> &[Velocity] {
        &self.desired_velocities
    }

    /// Immutable access to attributes.
    #[must_use]
    pub fn attributes(&self) -> &[AgentAttributes] {
        &self.attributes
    }

    /// Immutable access to liveness flags.
    #[must_use]
    pub fn alive(&self) -> &[bool] {
        &self.alive
    }

    pub(crate) fn set_desired_velocity(&mut self, index: usize, desired: Velocity) {
        self.desired_velocities[index] = desired;
    }

    pub(crate) fn set_alive(&mut self, index: usize, alive: bool) {
        self.alive[index] = alive;
    }

    /// Advance heading, velocity and position for every live row.
    ///
    /// Heading slews toward the desired heading by at most `agility * dt`
    /// on the wrapped circle; velocity moves toward the desired velocity
    /// component-wise by at most `acceleration * dt`, then the speed is
    /// clamped to `max_speed` by uniform scaling; position integrates by
    /// explicit Euler and is clamped into the arena.
    pub(crate) fn advance(&mut self, params: &SimParams) {
        let dt = params.dt;
        for index in 0..self.positions.len() {
            if !self.alive[index] {
                continue;
            }
            let attrs = self.attributes[index];
            let desired = self.desired_velocities[index];

            let desired_speed_sq = desired.vx * desired.vx + desired.vy * desired.vy;
            if desired_speed_sq > DESIRED_SPEED_EPSILON * DESIRED_SPEED_EPSILON {
                self.desired_headings[index] = desired.vy.atan2(desired.vx);
            }
            let max_turn = attrs.agility * dt;
            let turn = wrap_angle(self.desired_headings[index] - self.headings[index])
                .clamp(-max_turn, max_turn);
            self.headings[index] = wrap_angle(self.headings[index] + turn);

            let max_delta = attrs.acceleration * dt;
            let velocity = &mut self.velocities[index];
            velocity.vx += (desired.vx - velocity.vx).clamp(-max_delta, max_delta);
            velocity.vy += (desired.vy - velocity.vy).clamp(-max_delta, max_delta);
            let speed_sq = velocity.vx * velocity.vx + velocity.vy * velocity.vy;
            let max_speed_sq = attrs.max_speed * attrs.max_speed;
            if speed_sq > max_speed_sq {
                let scale = attrs.max_speed / speed_sq.sqrt();
                velocity.vx *= scale;
                velocity.vy *= scale;
            }
            let (vx, vy) = (velocity.vx, velocity.vy);

            let position = &mut self.positions[index];
            position.x += vx * dt;
            position.y += vy * dt;
            self.clamp_row(index, params);
        }
    }

    /// Clamp a row into the arena, zeroing the velocity component on each
    /// axis that made contact.
    pub(crate) fn clamp_row(&mut self, index: usize, params: &SimParams) {
        let radius = params.agent_radius;
        let position = &mut self.positions[index];
        let velocity = &mut self.velocities[index];
        if position.x < radius {
            position.x = radius;
            velocity.vx = 0.0;
        } else if position.x > params.arena_width - radius {
            position.x = params.arena_width - radius;
            velocity.vx = 0.0;
        }
        if position.y < radius {
            position.y = radius;
            velocity.vy = 0.0;
        } else if position.y > params.arena_height - radius {
            position.y = params.arena_height - radius;
            velocity.vy = 0.0;
        }
    }

    /// Narrow-phase test and response for one unordered pair of rows.
    ///
    /// Returns the contact midpoint when the pair overlapped. On exit the
    /// pair is exactly tangent; the normal impulse is applied only when the
    /// pair was approaching.
    pub(crate) fn resolve_pair(
        &mut self,
        row_a: usize,
        row_b: usize,
        radius: f32,
        restitution: f32,
    ) -> Option<Position> {
        let r_sum = 2.0 * radius;
        let r_sum_sq = r_sum * r_sum;
        let (pa, pb) = (self.positions[row_a], self.positions[row_b]);
        let mut dx = pb.x - pa.x;
        let mut dy = pb.y - pa.y;
        let dist_sq = dx * dx + dy * dy;
        if dist_sq >= r_sum_sq {
            return None;
        }

        let dist = if dist_sq == 0.0 {
            // Coincident centers: deterministic tie-break along +x.
            self.positions[row_b].x = pa.x + r_sum;
            dx = r_sum;
            dy = 0.0;
            r_sum
        } else {
            dist_sq.sqrt()
        };
        let normal_x = dx / dist;
        let normal_y = dy / dist;

        let push = 0.5 * (r_sum - dist);
        self.positions[row_a].x -= push * normal_x;
        self.positions[row_a].y -= push * normal_y;
        self.positions[row_b].x += push * normal_x;
        self.positions[row_b].y += push * normal_y;

        let (va, vb) = (self.velocities[row_a], self.velocities[row_b]);
        let approach = (vb.vx - va.vx) * normal_x + (vb.vy - va.vy) * normal_y;
        if approach < 0.0 {
            let impulse = 0.5 * (1.0 + restitution) * approach;
            self.velocities[row_a].vx += impulse * normal_x;
            self.velocities[row_a].vy += impulse * normal_y;
            self.velocities[row_b].vx -= impulse * normal_x;
            self.velocities[row_b].vy -= impulse * normal_y;
        }

        let (pa, pb) = (self.positions[row_a], self.positions[row_b]);
        Some(Position::new(0.5 * (pa.x + pb.x), 0.5 * (pa.y + pb.y)))
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.teams.len());
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.headings.len());
        debug_assert_eq!(self.positions.len(), self.desired_velocities.len());
        debug_assert_eq!(self.positions.len(), self.desired_headings.len());
        debug_assert_eq!(self.positions.len(), self.attributes.len());
        debug_assert_eq!(self.positions.len(), self.alive.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
///
/// Rows are never removed: an agent that dies keeps its row (and its last
/// position) with `alive` lowered, so identities stay stable across an
/// episode. `reset` drops the whole arena, which invalidates every handle
/// from the previous episode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl AgentArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of agents, live or dead.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no agents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over agent handles in insertion (= ascending id) order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Handles in insertion order, indexable by dense row.
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

    /// Returns the dense row for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a stored agent.
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

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Clear all stored agents, invalidating every outstanding handle.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Payload handed to [`World::add_infantry_block`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BlockSpec {
    pub team: u8,
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

/// Static axis-aligned infantry rectangle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InfantryBlock {
    pub team: u8,
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

impl InfantryBlock {
    /// Build a block from a spec, normalizing min/max ordering.
    #[must_use]
    pub fn new(spec: BlockSpec) -> Self {
        Self {
            team: spec.team,
            x_min: spec.x_min.min(spec.x_max),
            x_max: spec.x_min.max(spec.x_max),
            y_min: spec.y_min.min(spec.y_max),
            y_max: spec.y_min.max(spec.y_max),
        }
    }

    /// Point-in-rectangle test, boundary inclusive.
    #[must_use]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.x_min <= x && x <= self.x_max && self.y_min <= y && y <= self.y_max
    }

    /// Distance from a point to the nearest boundary of the block; zero inside.
    #[must_use]
    pub fn distance_to_boundary(&self, x: f32, y: f32) -> f32 {
        if self.contains(x, y) {
            return 0.0;
        }
        let cx = x.clamp(self.x_min, self.x_max);
        let cy = y.clamp(self.y_min, self.y_max);
        let dx = x - cx;
        let dy = y - cy;
        (dx * dx + dy * dy).sqrt()
    }

    /// Center of the rectangle.
    #[must_use]
    pub fn center(&self) -> Position {
        Position::new(0.5 * (self.x_min + self.x_max), 0.5 * (self.y_min + self.y_max))
    }
}

/// Lifecycle tag of a projectile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProjectileLifecycle {
    InFlight,
    GroundImpact,
    OutOfBounds,
    Expired,
}

impl ProjectileLifecycle {
    /// Stable one-byte code used by the canonical state encoding.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::InFlight => 0,
            Self::GroundImpact => 1,
            Self::OutOfBounds => 2,
            Self::Expired => 3,
        }
    }
}

/// Launch parameters for a thrown projectile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ThrowCommand {
    /// Direction in the arena plane, radians, 0 = +x.
    pub azimuth: f32,
    /// Elevation above the horizontal plane, radians, pi/2 = straight up.
    pub loft: f32,
    /// Initial speed in m/s.
    pub speed: f32,
}

impl ThrowCommand {
    fn is_finite(&self) -> bool {
        self.azimuth.is_finite() && self.loft.is_finite() && self.speed.is_finite()
    }
}

/// Outcome of advancing one projectile by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectileOutcome {
    Airborne,
    Impacted,
    LeftArena,
    Expired,
}

/// Single ballistic projectile.
///
/// A projectile whose lifecycle is no longer `InFlight` is frozen: it keeps
/// its terminal position and velocity and is skipped by the step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Projectile {
    pub launcher: AgentId,
    pub team: u8,
    pub position: Vec3,
    pub velocity: Vec3,
    pub lifecycle: ProjectileLifecycle,
    /// Cumulative integrated flight time in seconds.
    pub time_alive: f32,
    pub impact_position: Option<Vec3>,
    pub impact_velocity: Option<Vec3>,
    trajectory: VecDeque<Vec3>,
}

impl Projectile {
    fn launch(launcher: AgentId, team: u8, origin: Position, command: ThrowCommand, params: &SimParams) -> Self {
        let horizontal = command.speed * command.loft.cos();
        let velocity = Vec3::new(
            horizontal * command.azimuth.cos(),
            horizontal * command.azimuth.sin(),
            command.speed * command.loft.sin(),
        );
        let mut projectile = Self {
            launcher,
            team,
            position: Vec3::new(origin.x, origin.y, params.launch_height),
            velocity,
            lifecycle: ProjectileLifecycle::InFlight,
            time_alive: 0.0,
            impact_position: None,
            impact_velocity: None,
            trajectory: VecDeque::new(),
        };
        projectile.log_sample(params.trajectory_capacity);
        projectile
    }

    /// Sampled positions from launch toward impact, oldest first.
    #[must_use]
    pub fn trajectory(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.trajectory.iter().copied()
    }

    /// Number of retained trajectory samples.
    #[must_use]
    pub fn trajectory_len(&self) -> usize {
        self.trajectory.len()
    }

    /// Remaining flight time until the ground plane, from the current state.
    ///
    /// `None` when the trajectory never reaches z = 0 (only possible from
    /// below-plane states that the step never produces).
    #[must_use]
    pub fn flight_time_to_impact(&self, gravity: f32) -> Option<f32> {
        let discriminant = self.velocity.z * self.velocity.z + 2.0 * gravity * self.position.z;
        if discriminant < 0.0 {
            return None;
        }
        Some((self.velocity.z + discriminant.sqrt()) / gravity)
    }

    /// Horizontal distance covered before reaching the ground plane.
    #[must_use]
    pub fn level_ground_range(&self, gravity: f32) -> f32 {
        let Some(flight_time) = self.flight_time_to_impact(gravity) else {
            return 0.0;
        };
        let horizontal =
            (self.velocity.x * self.velocity.x + self.velocity.y * self.velocity.y).sqrt();
        horizontal * flight_time
    }

    /// Integrate one step under constant gravity.
    fn advance(&mut self, params: &SimParams) -> ProjectileOutcome {
        let dt = params.dt;
        let gravity = params.gravity;
        let z_next = self.position.z + self.velocity.z * dt - 0.5 * gravity * dt * dt;

        if z_next > 0.0 {
            self.position.x += self.velocity.x * dt;
            self.position.y += self.velocity.y * dt;
            self.position.z = z_next;
            self.velocity.z -= gravity * dt;
            self.time_alive += dt;
            self.log_sample(params.trajectory_capacity);

            if self.position.x < 0.0
                || self.position.x > params.arena_width
                || self.position.y < 0.0
                || self.position.y > params.arena_height
            {
                self.lifecycle = ProjectileLifecycle::OutOfBounds;
                return ProjectileOutcome::LeftArena;
            }
            if self.time_alive > params.projectile_max_flight {
                self.lifecycle = ProjectileLifecycle::Expired;
                return ProjectileOutcome::Expired;
            }
            return ProjectileOutcome::Airborne;
        }

        // Ground crossing inside this step: solve z + vz*t - g*t^2/2 = 0
        // for the smallest positive root. The discriminant is non-negative
        // whenever z >= 0, so the dt fallback only absorbs float dust.
        let discriminant = self.velocity.z * self.velocity.z + 2.0 * gravity * self.position.z;
        let mut impact_t = if discriminant >= 0.0 {
            (self.velocity.z + discriminant.sqrt()) / gravity
        } else {
            dt
        };
        if !(impact_t > 0.0 && impact_t <= dt) {
            impact_t = dt;
        }

        self.position.x += self.velocity.x * impact_t;
        self.position.y += self.velocity.y * impact_t;
        self.position.z = 0.0;
        self.velocity.z -= gravity * impact_t;
        self.time_alive += impact_t;
        self.lifecycle = ProjectileLifecycle::GroundImpact;
        self.impact_position = Some(self.position);
        self.impact_velocity = Some(self.velocity);
        self.log_sample(params.trajectory_capacity);
        ProjectileOutcome::Impacted
    }

    fn log_sample(&mut self, capacity: Option<usize>) {
        match capacity {
            Some(0) => {}
            Some(cap) => {
                if self.trajectory.len() == cap {
                    self.trajectory.pop_front();
                }
                self.trajectory.push_back(self.position);
            }
            None => self.trajectory.push_back(self.position),
        }
    }
}

/// Kind of a simulation event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventKind {
    AgentCollision,
    ProjectileLaunched,
    ProjectileImpact,
}

/// Where an event happened: in the arena plane or with altitude.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum EventPosition {
    Planar(Position),
    Spatial(Vec3),
}

/// Compact record of a physically meaningful occurrence within a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub step: Tick,
    pub kind: EventKind,
    pub actor: Option<AgentId>,
    pub target: Option<AgentId>,
    pub position: Option<EventPosition>,
    /// Scalar payload reserved for event kinds that carry one.
    pub value: Option<f32>,
}

impl Event {
    fn agent_collision(step: Tick, actor: AgentId, target: AgentId, midpoint: Position) -> Self {
        Self {
            step,
            kind: EventKind::AgentCollision,
            actor: Some(actor),
            target: Some(target),
            position: Some(EventPosition::Planar(midpoint)),
            value: None,
        }
    }

    fn projectile_launched(step: Tick, launcher: AgentId, origin: Position) -> Self {
        Self {
            step,
            kind: EventKind::ProjectileLaunched,
            actor: Some(launcher),
            target: None,
            position: Some(EventPosition::Planar(origin)),
            value: None,
        }
    }

    fn projectile_impact(step: Tick, launcher: AgentId, impact: Vec3) -> Self {
        Self {
            step,
            kind: EventKind::ProjectileImpact,
            actor: Some(launcher),
            target: None,
            position: Some(EventPosition::Spatial(impact)),
            value: None,
        }
    }
}

/// Errors raised while validating simulation parameters.
#[derive(Debug, Error)]
pub enum ParamsError {
    /// Indicates an invalid configuration value.
    #[error("invalid parameters: {0}")]
    InvalidConfig(&'static str),
    /// Propagated broad-phase grid construction failure.
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Immutable configuration for one simulation instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SimParams {
    /// Arena extent along x, meters.
    pub arena_width: f32,
    /// Arena extent along y, meters.
    pub arena_height: f32,
    /// Fixed timestep, seconds.
    pub dt: f32,
    /// Gravitational acceleration, m/s^2.
    pub gravity: f32,
    /// Radius of every agent, meters.
    pub agent_radius: f32,
    /// Edge length of one broad-phase grid cell, meters. Must be at least
    /// one agent diameter so a colliding pair never escapes the 3x3 stencil.
    pub grid_cell_size: f32,
    /// Live-agent count at and below which the all-pairs path is used
    /// instead of the grid.
    pub broad_phase_crossover: usize,
    /// Coefficient of restitution for agent collisions.
    pub restitution: f32,
    /// Altitude projectiles spawn at, meters.
    pub launch_height: f32,
    /// Flight time after which an airborne projectile expires, seconds.
    pub projectile_max_flight: f32,
    /// Trajectory samples retained per projectile: `None` keeps all,
    /// `Some(0)` disables logging, `Some(n)` keeps the newest n. Never part
    /// of the state digest.
    pub trajectory_capacity: Option<usize>,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            arena_width: 100.0,
            arena_height: 100.0,
            dt: 0.1,
            gravity: 9.81,
            agent_radius: 0.3,
            grid_cell_size: 1.0,
            broad_phase_crossover: 150,
            restitution: 1.0,
            launch_height: 1.0,
            projectile_max_flight: 60.0,
            trajectory_capacity: None,
        }
    }
}

impl SimParams {
    /// Fail-fast validation of every configuration value.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let finite = self.arena_width.is_finite()
            && self.arena_height.is_finite()
            && self.dt.is_finite()
            && self.gravity.is_finite()
            && self.agent_radius.is_finite()
            && self.grid_cell_size.is_finite()
            && self.restitution.is_finite()
            && self.launch_height.is_finite()
            && self.projectile_max_flight.is_finite();
        if !finite {
            return Err(ParamsError::InvalidConfig("parameters must be finite"));
        }
        if self.arena_width <= 0.0 || self.arena_height <= 0.0 {
            return Err(ParamsError::InvalidConfig("arena dimensions must be positive"));
        }
        if self.dt <= 0.0 {
            return Err(ParamsError::InvalidConfig("dt must be positive"));
        }
        if self.gravity <= 0.0 {
            return Err(ParamsError::InvalidConfig("gravity must be positive"));
        }
        if self.agent_radius <= 0.0 {
            return Err(ParamsError::InvalidConfig("agent_radius must be positive"));
        }
        if self.grid_cell_size <= 0.0 {
            return Err(ParamsError::InvalidConfig("grid_cell_size must be positive"));
        }
        if self.grid_cell_size > self.arena_width.min(self.arena_height) {
            return Err(ParamsError::InvalidConfig(
                "grid_cell_size must not exceed the smaller arena dimension",
            ));
        }
        if self.grid_cell_size < 2.0 * self.agent_radius {
            return Err(ParamsError::InvalidConfig(
                "grid_cell_size must cover at least one agent diameter",
            ));
        }
        if !(0.0..=1.0).contains(&self.restitution) {
            return Err(ParamsError::InvalidConfig("restitution must lie in [0, 1]"));
        }
        if self.launch_height < 0.0 {
            return Err(ParamsError::InvalidConfig("launch_height must be non-negative"));
        }
        if self.projectile_max_flight <= 0.0 {
            return Err(ParamsError::InvalidConfig(
                "projectile_max_flight must be positive",
            ));
        }
        Ok(())
    }

    /// Stable ordered key/value rendering for run provenance.
    #[must_use]
    pub fn to_key_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("arena_width", self.arena_width.to_string()),
            ("arena_height", self.arena_height.to_string()),
            ("dt", self.dt.to_string()),
            ("gravity", self.gravity.to_string()),
            ("agent_radius", self.agent_radius.to_string()),
            ("grid_cell_size", self.grid_cell_size.to_string()),
            ("broad_phase_crossover", self.broad_phase_crossover.to_string()),
            ("restitution", self.restitution.to_string()),
            ("launch_height", self.launch_height.to_string()),
            ("projectile_max_flight", self.projectile_max_flight.to_string()),
            (
                "trajectory_capacity",
                match self.trajectory_capacity {
                    None => "unbounded".to_owned(),
                    Some(n) => n.to_string(),
                },
            ),
        ]
    }
}

/// Contract violations rejected without touching world state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    /// The referenced agent id does not exist in this episode.
    #[error("operation references unknown agent {0:?}")]
    UnknownAgent(AgentId),
    /// The referenced agent is dead.
    #[error("operation references dead agent {0:?}")]
    DeadAgent(AgentId),
    /// An action carried a NaN or infinite desired velocity.
    #[error("action for agent {0:?} must be finite")]
    NonFiniteAction(AgentId),
    /// A launch parameter was NaN or infinite.
    #[error("launch parameters must be finite")]
    NonFiniteLaunch,
}

/// One agent's control input for a step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentAction {
    pub desired_velocity: Velocity,
    pub throw: Option<ThrowCommand>,
}

impl AgentAction {
    /// Action that only steers.
    #[must_use]
    pub const fn drive(vx: f32, vy: f32) -> Self {
        Self {
            desired_velocity: Velocity::new(vx, vy),
            throw: None,
        }
    }
}

/// Map from agent id to its action for one step.
pub type ActionMap = HashMap<AgentId, AgentAction>;

/// Per-step broad/narrow phase counters. Diagnostics only; never feeds back
/// into the state transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollisionStats {
    pub pairs_checked: usize,
    pub pairs_colliding: usize,
    pub cells_occupied: usize,
}

/// 128-bit digest over the canonical state encoding.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StateDigest([u8; 16]);

impl StateDigest {
    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Debug for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateDigest({})", self.to_hex())
    }
}

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Serializable complete world state for replay and transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub params: SimParams,
    pub seed: u64,
    pub step: Tick,
    pub rng: Pcg64Mcg,
    pub agents: AgentArena,
    pub projectiles: SlotMap<ProjectileId, Projectile>,
    pub projectile_handles: Vec<ProjectileId>,
    pub blocks: Vec<InfantryBlock>,
    pub events: Vec<Event>,
}

/// Simulation world: agents, infantry blocks, projectiles, events and the
/// stepping orchestrator.
pub struct World {
    params: SimParams,
    seed: u64,
    step: Tick,
    rng: Pcg64Mcg,
    agents: AgentArena,
    projectiles: SlotMap<ProjectileId, Projectile>,
    projectile_handles: Vec<ProjectileId>,
    in_flight: Vec<ProjectileId>,
    blocks: Vec<InfantryBlock>,
    grid: UniformGrid,
    events: Vec<Event>,
    stats: CollisionStats,
    live_rows: Vec<usize>,
    live_positions: Vec<(f32, f32)>,
    pair_scratch: Vec<(usize, usize)>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("params", &self.params)
            .field("seed", &self.seed)
            .field("step", &self.step)
            .field("agent_count", &self.agents.len())
            .field("projectile_count", &self.projectile_handles.len())
            .finish()
    }
}

impl World {
    /// Construct an empty world from validated parameters and a seed.
    pub fn new(params: SimParams, seed: u64) -> Result<Self, ParamsError> {
        params.validate()?;
        let grid = UniformGrid::new(params.grid_cell_size, params.arena_width, params.arena_height)?;
        info!(
            seed,
            arena_width = f64::from(params.arena_width),
            arena_height = f64::from(params.arena_height),
            "skirmish world constructed"
        );
        Ok(Self {
            params,
            seed,
            step: Tick::zero(),
            rng: Pcg64Mcg::seed_from_u64(seed),
            agents: AgentArena::new(),
            projectiles: SlotMap::with_key(),
            projectile_handles: Vec::new(),
            in_flight: Vec::new(),
            blocks: Vec::new(),
            grid,
            events: Vec::new(),
            stats: CollisionStats::default(),
            live_rows: Vec::new(),
            live_positions: Vec::new(),
            pair_scratch: Vec::new(),
        })
    }

    /// Rebuild a world from a snapshot; subsequent digests match the
    /// snapshotted world bit-for-bit.
    pub fn from_snapshot(snapshot: WorldSnapshot) -> Result<Self, ParamsError> {
        snapshot.params.validate()?;
        let grid = UniformGrid::new(
            snapshot.params.grid_cell_size,
            snapshot.params.arena_width,
            snapshot.params.arena_height,
        )?;
        let in_flight = snapshot
            .projectile_handles
            .iter()
            .copied()
            .filter(|&id| {
                snapshot
                    .projectiles
                    .get(id)
                    .is_some_and(|p| p.lifecycle == ProjectileLifecycle::InFlight)
            })
            .collect();
        Ok(Self {
            params: snapshot.params,
            seed: snapshot.seed,
            step: snapshot.step,
            rng: snapshot.rng,
            agents: snapshot.agents,
            projectiles: snapshot.projectiles,
            projectile_handles: snapshot.projectile_handles,
            in_flight,
            blocks: snapshot.blocks,
            grid,
            events: snapshot.events,
            stats: CollisionStats::default(),
            live_rows: Vec::new(),
            live_positions: Vec::new(),
            pair_scratch: Vec::new(),
        })
    }

    /// Serializable complete state.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            params: self.params,
            seed: self.seed,
            step: self.step,
            rng: self.rng.clone(),
            agents: self.agents.clone(),
            projectiles: self.projectiles.clone(),
            projectile_handles: self.projectile_handles.clone(),
            blocks: self.blocks.clone(),
            events: self.events.clone(),
        }
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub const fn params(&self) -> &SimParams {
        &self.params
    }

    /// Seed the world was constructed or last reset with.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.step
    }

    /// Borrow the world RNG mutably for deterministic sampling. Stochastic
    /// extensions must draw from this stream and only this stream.
    #[must_use]
    pub fn rng(&mut self) -> &mut Pcg64Mcg {
        &mut self.rng
    }

    /// Read-only access to the agent arena.
    #[must_use]
    pub const fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Mutable access to the agent arena (scenario builders, tests).
    #[must_use]
    pub fn agents_mut(&mut self) -> &mut AgentArena {
        &mut self.agents
    }

    /// Number of agents, live or dead.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Number of live agents.
    #[must_use]
    pub fn live_agent_count(&self) -> usize {
        self.agents.columns().alive().iter().filter(|&&a| a).count()
    }

    /// Registered infantry blocks in registration order.
    #[must_use]
    pub fn blocks(&self) -> &[InfantryBlock] {
        &self.blocks
    }

    /// Look up one infantry block.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&InfantryBlock> {
        self.blocks.get(id.0 as usize)
    }

    /// Look up one projectile.
    #[must_use]
    pub fn projectile(&self, id: ProjectileId) -> Option<&Projectile> {
        self.projectiles.get(id)
    }

    /// Projectile handles in launch (= ascending id) order.
    #[must_use]
    pub fn projectile_handles(&self) -> &[ProjectileId] {
        &self.projectile_handles
    }

    /// Broad/narrow phase counters for the most recent step.
    #[must_use]
    pub const fn collision_stats(&self) -> CollisionStats {
        self.stats
    }

    /// Copy of the scalar state for one agent.
    #[must_use]
    pub fn snapshot_agent(&self, id: AgentId) -> Option<AgentData> {
        self.agents.snapshot(id)
    }

    /// Add an agent, returning its id.
    pub fn add_agent(&mut self, spec: AgentSpec) -> AgentId {
        self.agents.insert(AgentData {
            team: spec.team,
            position: spec.position,
            velocity: Velocity::default(),
            heading: spec.heading,
            desired_velocity: Velocity::default(),
            desired_heading: spec.heading,
            attributes: spec.attributes,
            alive: true,
        })
    }

    /// Add a static infantry block, returning its id.
    pub fn add_infantry_block(&mut self, spec: BlockSpec) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(InfantryBlock::new(spec));
        id
    }

    /// Mark an agent dead. Dead agents keep their last position, are
    /// skipped by kinematics, the index and collisions, and can no longer
    /// act or launch.
    pub fn mark_dead(&mut self, id: AgentId) -> Result<(), WorldError> {
        let row = self.agents.index_of(id).ok_or(WorldError::UnknownAgent(id))?;
        self.agents.columns_mut().set_alive(row, false);
        Ok(())
    }

    /// Clear agents, projectiles and events, reseed the RNG and rewind the
    /// step counter. Infantry blocks are static scenario geometry and
    /// survive. Handles from before the reset no longer resolve.
    pub fn reset(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = Pcg64Mcg::seed_from_u64(seed);
        self.step = Tick::zero();
        self.agents.clear();
        self.projectiles.clear();
        self.projectile_handles.clear();
        self.in_flight.clear();
        self.events.clear();
        self.stats = CollisionStats::default();
        info!(seed, "skirmish world reset");
    }

    /// Launch a projectile from a live agent's current position.
    pub fn launch_projectile(
        &mut self,
        launcher: AgentId,
        azimuth: f32,
        loft: f32,
        speed: f32,
    ) -> Result<ProjectileId, WorldError> {
        let command = ThrowCommand { azimuth, loft, speed };
        let row = self
            .agents
            .index_of(launcher)
            .ok_or(WorldError::UnknownAgent(launcher))?;
        if !self.agents.columns().alive()[row] {
            return Err(WorldError::DeadAgent(launcher));
        }
        if !command.is_finite() {
            return Err(WorldError::NonFiniteLaunch);
        }
        Ok(self.spawn_projectile(launcher, row, command, self.step))
    }

    /// Ordered events accumulated since the previous drain. A second drain
    /// with no intervening step returns nothing.
    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Advance the world one timestep.
    ///
    /// Phase order is fixed: bind actions, agent kinematics and arena
    /// clamp, index rebuild, collision resolution, projectile advance,
    /// counter increment. Any invalid action rejects the whole call before
    /// anything mutates.
    pub fn step(&mut self, actions: &ActionMap) -> Result<Tick, WorldError> {
        self.validate_actions(actions)?;
        let tick = self.step.next();

        self.stage_apply_actions(actions, tick);
        self.agents.columns_mut().advance(&self.params);
        self.stage_rebuild_index();
        self.stage_collisions(tick);
        self.stage_projectiles(tick);

        self.step = tick;
        debug!(
            tick = tick.0,
            pairs_checked = self.stats.pairs_checked,
            pairs_colliding = self.stats.pairs_colliding,
            cells_occupied = self.stats.cells_occupied,
            in_flight = self.in_flight.len(),
            "step complete"
        );
        Ok(tick)
    }

    /// 128-bit digest over the canonical encoding of all mutable state.
    ///
    /// Covers the step counter, every agent in ascending-id order, every
    /// projectile in ascending-id order and the RNG stream position.
    /// Agents and projectiles are keyed by their dense ordinal (the
    /// episode-local integer id), so identically built episodes hash
    /// identically whether they came from `new` or `reset`. Trajectory
    /// logs and the event buffer are excluded.
    #[must_use]
    pub fn state_hash(&self) -> StateDigest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.step.0.to_le_bytes());

        let columns = self.agents.columns();
        hasher.update(&(self.agents.len() as u64).to_le_bytes());
        for row in 0..self.agents.len() {
            hasher.update(&(row as u64).to_le_bytes());
            hasher.update(&[columns.teams()[row]]);
            let position = columns.positions()[row];
            hasher.update(&position.x.to_bits().to_le_bytes());
            hasher.update(&position.y.to_bits().to_le_bytes());
            let velocity = columns.velocities()[row];
            hasher.update(&velocity.vx.to_bits().to_le_bytes());
            hasher.update(&velocity.vy.to_bits().to_le_bytes());
            hasher.update(&columns.headings()[row].to_bits().to_le_bytes());
            let desired = columns.desired_velocities()[row];
            hasher.update(&desired.vx.to_bits().to_le_bytes());
            hasher.update(&desired.vy.to_bits().to_le_bytes());
            hasher.update(&[u8::from(columns.alive()[row])]);
        }

        hasher.update(&(self.projectile_handles.len() as u64).to_le_bytes());
        for (ordinal, &id) in self.projectile_handles.iter().enumerate() {
            let Some(projectile) = self.projectiles.get(id) else {
                continue;
            };
            hasher.update(&(ordinal as u64).to_le_bytes());
            let launcher_ordinal = self
                .agents
                .index_of(projectile.launcher)
                .map_or(u64::MAX, |row| row as u64);
            hasher.update(&launcher_ordinal.to_le_bytes());
            hasher.update(&projectile.position.x.to_bits().to_le_bytes());
            hasher.update(&projectile.position.y.to_bits().to_le_bytes());
            hasher.update(&projectile.position.z.to_bits().to_le_bytes());
            hasher.update(&projectile.velocity.x.to_bits().to_le_bytes());
            hasher.update(&projectile.velocity.y.to_bits().to_le_bytes());
            hasher.update(&projectile.velocity.z.to_bits().to_le_bytes());
            hasher.update(&[projectile.lifecycle.code()]);
            hasher.update(&projectile.time_alive.to_bits().to_le_bytes());
        }

        // RNG stream position probe: changes iff the stream advanced.
        let mut probe = self.rng.clone();
        hasher.update(&probe.next_u64().to_le_bytes());

        let hash = hasher.finalize();
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&hash.as_bytes()[..16]);
        StateDigest(digest)
    }

    fn validate_actions(&self, actions: &ActionMap) -> Result<(), WorldError> {
        for (&id, action) in actions {
            let row = self.agents.index_of(id).ok_or(WorldError::UnknownAgent(id))?;
            if !self.agents.columns().alive()[row] {
                return Err(WorldError::DeadAgent(id));
            }
            if !action.desired_velocity.vx.is_finite() || !action.desired_velocity.vy.is_finite() {
                return Err(WorldError::NonFiniteAction(id));
            }
            if let Some(throw) = &action.throw {
                if !throw.is_finite() {
                    return Err(WorldError::NonFiniteLaunch);
                }
            }
        }
        Ok(())
    }

    fn stage_apply_actions(&mut self, actions: &ActionMap, tick: Tick) {
        if actions.is_empty() {
            return;
        }
        // Bind in handle order so throw events never depend on map order.
        let mut throws: Vec<(AgentId, usize, ThrowCommand)> = Vec::new();
        let handles: Vec<AgentId> = self.agents.iter_handles().collect();
        for (row, id) in handles.into_iter().enumerate() {
            if let Some(action) = actions.get(&id) {
                self.agents
                    .columns_mut()
                    .set_desired_velocity(row, action.desired_velocity);
                if let Some(throw) = action.throw {
                    throws.push((id, row, throw));
                }
            }
        }
        for (id, row, command) in throws {
            self.spawn_projectile(id, row, command, tick);
        }
    }

    fn spawn_projectile(
        &mut self,
        launcher: AgentId,
        launcher_row: usize,
        command: ThrowCommand,
        tick: Tick,
    ) -> ProjectileId {
        let columns = self.agents.columns();
        let origin = columns.positions()[launcher_row];
        let team = columns.teams()[launcher_row];
        let projectile = Projectile::launch(launcher, team, origin, command, &self.params);
        let id = self.projectiles.insert(projectile);
        self.projectile_handles.push(id);
        self.in_flight.push(id);
        self.events
            .push(Event::projectile_launched(tick, launcher, origin));
        id
    }

    fn stage_rebuild_index(&mut self) {
        self.live_rows.clear();
        self.live_positions.clear();
        let columns = self.agents.columns();
        let positions = columns.positions();
        for (row, &alive) in columns.alive().iter().enumerate() {
            if alive {
                self.live_rows.push(row);
                self.live_positions.push((positions[row].x, positions[row].y));
            }
        }
        self.grid.rebuild(&self.live_positions);
        self.stats.cells_occupied = self.grid.occupied_cells();
    }

    fn stage_collisions(&mut self, tick: Tick) {
        self.stats.pairs_checked = 0;
        self.stats.pairs_colliding = 0;
        let radius = self.params.agent_radius;
        let restitution = self.params.restitution;
        let live = std::mem::take(&mut self.live_rows);

        if live.len() <= self.params.broad_phase_crossover {
            for i in 0..live.len() {
                for j in (i + 1)..live.len() {
                    self.try_resolve(live[i], live[j], tick, radius, restitution);
                }
            }
        } else {
            let mut pairs = std::mem::take(&mut self.pair_scratch);
            self.grid.candidate_pairs(&mut pairs);
            // Ascending live order matches the all-pairs path, so the two
            // sources produce bit-identical cluster resolution.
            pairs.sort_unstable();
            for &(a, b) in pairs.iter() {
                self.try_resolve(live[a], live[b], tick, radius, restitution);
            }
            self.pair_scratch = pairs;
        }

        // The overlap push can cross the walls; re-apply the arena clamp.
        for &row in &live {
            self.agents.columns_mut().clamp_row(row, &self.params);
        }
        self.live_rows = live;
    }

    fn try_resolve(&mut self, row_a: usize, row_b: usize, tick: Tick, radius: f32, restitution: f32) {
        self.stats.pairs_checked += 1;
        if let Some(midpoint) = self
            .agents
            .columns_mut()
            .resolve_pair(row_a, row_b, radius, restitution)
        {
            self.stats.pairs_colliding += 1;
            let actor = self.agents.handles()[row_a];
            let target = self.agents.handles()[row_b];
            self.events
                .push(Event::agent_collision(tick, actor, target, midpoint));
        }
    }

    fn stage_projectiles(&mut self, tick: Tick) {
        if self.in_flight.is_empty() {
            return;
        }
        let airborne = std::mem::take(&mut self.in_flight);
        let mut kept = Vec::with_capacity(airborne.len());
        for id in airborne {
            let Some(projectile) = self.projectiles.get_mut(id) else {
                continue;
            };
            match projectile.advance(&self.params) {
                ProjectileOutcome::Airborne => kept.push(id),
                ProjectileOutcome::Impacted => {
                    let launcher = projectile.launcher;
                    let impact = projectile.position;
                    self.events.push(Event::projectile_impact(tick, launcher, impact));
                }
                ProjectileOutcome::LeftArena | ProjectileOutcome::Expired => {}
            }
        }
        self.in_flight = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_world(seed: u64) -> World {
        World::new(SimParams::default(), seed).expect("world")
    }

    fn drive(world: &mut World, id: AgentId, vx: f32, vy: f32) {
        let mut actions = ActionMap::new();
        actions.insert(id, AgentAction::drive(vx, vy));
        world.step(&actions).expect("step");
    }

    #[test]
    fn params_validation_rejects_bad_values() {
        let cases = [
            SimParams {
                arena_width: -1.0,
                ..SimParams::default()
            },
            SimParams {
                dt: 0.0,
                ..SimParams::default()
            },
            SimParams {
                agent_radius: 0.0,
                ..SimParams::default()
            },
            SimParams {
                grid_cell_size: 0.0,
                ..SimParams::default()
            },
            SimParams {
                // Below one agent diameter: a colliding pair could escape
                // the 3x3 stencil.
                grid_cell_size: 0.5,
                ..SimParams::default()
            },
            SimParams {
                grid_cell_size: 200.0,
                ..SimParams::default()
            },
            SimParams {
                restitution: 1.5,
                ..SimParams::default()
            },
            SimParams {
                gravity: f32::NAN,
                ..SimParams::default()
            },
            SimParams {
                projectile_max_flight: 0.0,
                ..SimParams::default()
            },
        ];
        for params in cases {
            assert!(params.validate().is_err(), "{params:?} should be rejected");
            assert!(World::new(params, 1).is_err());
        }
        assert!(SimParams::default().validate().is_ok());
    }

    #[test]
    fn params_key_values_are_stable() {
        let kv = SimParams::default().to_key_values();
        assert_eq!(kv[0], ("arena_width", "100".to_owned()));
        assert_eq!(kv.last().unwrap().0, "trajectory_capacity");
        let keys: Vec<_> = kv.iter().map(|(k, _)| *k).collect();
        let again: Vec<_> = SimParams::default()
            .to_key_values()
            .iter()
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(keys, again);
    }

    #[test]
    fn wrap_angle_maps_onto_principal_range() {
        assert!((wrap_angle(0.0)).abs() < 1e-6);
        assert!((wrap_angle(3.0 * std::f32::consts::PI).abs() - std::f32::consts::PI).abs() < 1e-5);
        assert!((wrap_angle(-0.5) + 0.5).abs() < 1e-6);
        for k in -8i32..=8 {
            let a = 0.7 + k as f32 * std::f32::consts::TAU;
            assert!((wrap_angle(a) - 0.7).abs() < 1e-4, "k={k}");
        }
    }

    #[test]
    fn heading_slew_is_rate_limited() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            heading: 0.0,
            ..AgentSpec::default()
        });
        // Demand a 180 degree turn; agility 3 rad/s limits each step to 0.3 rad.
        drive(&mut world, id, -5.0, 0.0);
        let first = world.snapshot_agent(id).unwrap().heading;
        assert!((first.abs() - 0.3).abs() < 1e-5, "heading={first}");
        let mut previous = first;
        for _ in 0..20 {
            drive(&mut world, id, -5.0, 0.0);
            let heading = world.snapshot_agent(id).unwrap().heading;
            let turned = wrap_angle(heading - previous).abs();
            assert!(turned <= 0.3 + 1e-5, "turned {turned} in one step");
            previous = heading;
        }
        assert!((previous.abs() - std::f32::consts::PI).abs() < 1e-4);
    }

    #[test]
    fn velocity_is_acceleration_limited_and_speed_capped() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        drive(&mut world, id, 100.0, 0.0);
        let v1 = world.snapshot_agent(id).unwrap().velocity;
        // acceleration 2 m/s^2 over dt 0.1 allows 0.2 m/s per step.
        assert!((v1.vx - 0.2).abs() < 1e-6);
        for _ in 0..200 {
            drive(&mut world, id, 100.0, 100.0);
            let v = world.snapshot_agent(id).unwrap().velocity;
            assert!(v.speed() <= 8.0 + 1e-4, "speed {}", v.speed());
        }
    }

    #[test]
    fn corner_stress_pins_agent_at_radius_with_zero_velocity() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(0.5, 0.5),
            ..AgentSpec::default()
        });
        for _ in 0..20 {
            drive(&mut world, id, -100.0, -100.0);
        }
        let agent = world.snapshot_agent(id).unwrap();
        assert!((agent.position.x - 0.3).abs() < 1e-6, "x={}", agent.position.x);
        assert!((agent.position.y - 0.3).abs() < 1e-6, "y={}", agent.position.y);
        assert_eq!(agent.velocity, Velocity::new(0.0, 0.0));
    }

    #[test]
    fn collision_separates_and_swaps_normal_velocity() {
        let mut world = default_world(0);
        let a = world.add_agent(AgentSpec {
            position: Position::new(49.8, 50.0),
            ..AgentSpec::default()
        });
        let b = world.add_agent(AgentSpec {
            position: Position::new(50.2, 50.0),
            ..AgentSpec::default()
        });
        {
            let velocities = world.agents_mut().columns_mut().velocities_mut();
            velocities[0] = Velocity::new(1.5, 0.0);
            velocities[1] = Velocity::new(-1.5, 0.0);
        }
        let energy_before = {
            let v = world.agents().columns().velocities();
            v[0].speed().powi(2) + v[1].speed().powi(2)
        };

        // Sustain the closing velocities so the deceleration stage does not
        // bleed them off before contact.
        let mut actions = ActionMap::new();
        actions.insert(a, AgentAction::drive(1.5, 0.0));
        actions.insert(b, AgentAction::drive(-1.5, 0.0));
        world.step(&actions).expect("step");

        let sa = world.snapshot_agent(a).unwrap();
        let sb = world.snapshot_agent(b).unwrap();
        let distance = sa.position.distance_to(sb.position);
        assert!(
            distance >= 2.0 * 0.3 - COLLISION_SLACK,
            "post-collision distance {distance}"
        );
        // Equal masses, head on: normal components swap exactly.
        assert!((sa.velocity.vx + 1.5).abs() < 1e-5, "va={:?}", sa.velocity);
        assert!((sb.velocity.vx - 1.5).abs() < 1e-5, "vb={:?}", sb.velocity);
        let energy_after = sa.velocity.speed().powi(2) + sb.velocity.speed().powi(2);
        assert!(energy_after <= energy_before + 1e-4);

        let events = world.drain_events();
        let collision = events
            .iter()
            .find(|e| e.kind == EventKind::AgentCollision)
            .expect("collision event");
        assert_eq!(collision.actor, Some(a));
        assert_eq!(collision.target, Some(b));
        assert_eq!(collision.step, Tick(1));
        match collision.position {
            Some(EventPosition::Planar(p)) => {
                assert!((p.x - 50.0).abs() < 0.1);
                assert!((p.y - 50.0).abs() < 1e-5);
            }
            other => panic!("unexpected position {other:?}"),
        }
    }

    #[test]
    fn separating_pair_gets_overlap_correction_without_impulse() {
        let mut world = default_world(0);
        let a = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        let b = world.add_agent(AgentSpec {
            position: Position::new(50.3, 50.0),
            ..AgentSpec::default()
        });
        {
            let velocities = world.agents_mut().columns_mut().velocities_mut();
            velocities[0] = Velocity::new(-1.0, 0.0);
            velocities[1] = Velocity::new(1.0, 0.0);
        }
        let mut actions = ActionMap::new();
        actions.insert(a, AgentAction::drive(-1.0, 0.0));
        actions.insert(b, AgentAction::drive(1.0, 0.0));
        world.step(&actions).expect("step");
        let columns = world.agents().columns();
        let distance = columns.positions()[0].distance_to(columns.positions()[1]);
        assert!(distance >= 2.0 * 0.3 - COLLISION_SLACK);
        // Velocities untouched by the separating pair.
        assert!((columns.velocities()[0].vx + 1.0).abs() < 1e-6);
        assert!((columns.velocities()[1].vx - 1.0).abs() < 1e-6);
    }

    #[test]
    fn coincident_agents_resolve_deterministically() {
        let run = |seed: u64| {
            let mut world = default_world(seed);
            world.add_agent(AgentSpec {
                position: Position::new(50.0, 50.0),
                ..AgentSpec::default()
            });
            world.add_agent(AgentSpec {
                position: Position::new(50.0, 50.0),
                ..AgentSpec::default()
            });
            world.step(&ActionMap::new()).expect("step");
            let columns = world.agents().columns();
            (columns.positions()[0], columns.positions()[1], world.state_hash())
        };
        let (pa, pb, hash_a) = run(7);
        let (qa, qb, hash_b) = run(7);
        assert_eq!((pa, pb), (qa, qb));
        assert_eq!(hash_a, hash_b);
        let distance = pa.distance_to(pb);
        assert!(distance >= 2.0 * 0.3 - COLLISION_SLACK, "distance {distance}");
        // Tie-break pushes b along +x.
        assert!(pb.x > pa.x);
    }

    #[test]
    fn dead_agents_are_skipped_by_collisions_and_kinematics() {
        let mut world = default_world(0);
        let _a = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        let b = world.add_agent(AgentSpec {
            position: Position::new(50.25, 50.0),
            ..AgentSpec::default()
        });
        world.mark_dead(b).expect("mark dead");
        world.step(&ActionMap::new()).expect("step");
        assert!(world.drain_events().is_empty(), "dead pair must not collide");
        let sb = world.snapshot_agent(b).unwrap();
        assert_eq!(sb.position, Position::new(50.25, 50.0));
        assert!(!sb.alive);
        assert_eq!(world.live_agent_count(), 1);

        let mut actions = ActionMap::new();
        actions.insert(b, AgentAction::drive(1.0, 0.0));
        assert_eq!(world.step(&actions), Err(WorldError::DeadAgent(b)));
        assert_eq!(world.launch_projectile(b, 0.0, 0.5, 10.0), Err(WorldError::DeadAgent(b)));
    }

    #[test]
    fn contract_violations_leave_state_untouched() {
        let mut world = default_world(3);
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        drive(&mut world, id, 1.0, 0.0);
        let _ = world.drain_events();
        let hash_before = world.state_hash();

        // An id minted by a more populated world has no slot here.
        let mut other = default_world(3);
        other.add_agent(AgentSpec::default());
        let stranger = other.add_agent(AgentSpec::default());
        drop(other);
        let mut actions = ActionMap::new();
        actions.insert(id, AgentAction::drive(1.0, 0.0));
        actions.insert(stranger, AgentAction::drive(0.0, 1.0));
        assert!(matches!(
            world.step(&actions),
            Err(WorldError::UnknownAgent(_))
        ));
        assert_eq!(world.state_hash(), hash_before);
        assert!(world.drain_events().is_empty());

        assert_eq!(
            world.launch_projectile(id, f32::NAN, 0.5, 10.0),
            Err(WorldError::NonFiniteLaunch)
        );
        assert_eq!(world.state_hash(), hash_before);
        assert!(world.drain_events().is_empty());
        assert_eq!(world.tick(), Tick(1));
    }

    #[test]
    fn launch_emits_event_and_steps_to_impact() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        let projectile_id = world
            .launch_projectile(id, 0.0, std::f32::consts::FRAC_PI_4, 10.0)
            .expect("launch");
        let events = world.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ProjectileLaunched);
        assert_eq!(events[0].actor, Some(id));

        let mut impacts = 0;
        for _ in 0..200 {
            world.step(&ActionMap::new()).expect("step");
            impacts += world
                .drain_events()
                .iter()
                .filter(|e| e.kind == EventKind::ProjectileImpact)
                .count();
        }
        assert_eq!(impacts, 1, "exactly one impact event");
        let projectile = world.projectile(projectile_id).expect("projectile");
        assert_eq!(projectile.lifecycle, ProjectileLifecycle::GroundImpact);
        let impact = projectile.impact_position.expect("impact position");
        assert_eq!(impact.z, 0.0);
        assert!(projectile.impact_velocity.expect("impact velocity").z < 0.0);
    }

    #[test]
    fn impact_position_matches_closed_form_range() {
        let params = SimParams {
            launch_height: 1.5,
            ..SimParams::default()
        };
        let mut world = World::new(params, 0).expect("world");
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        let projectile_id = world
            .launch_projectile(id, 0.0, std::f32::consts::FRAC_PI_4, 20.0)
            .expect("launch");
        let expected_range = world
            .projectile(projectile_id)
            .unwrap()
            .level_ground_range(params.gravity);
        // Ballistic range from z0 = 0 would be v^2 sin(2*loft)/g = 40.77 m;
        // the shoulder-height launch lands a little farther out.
        assert!(expected_range > 40.0 && expected_range < 44.0, "{expected_range}");

        for _ in 0..100 {
            world.step(&ActionMap::new()).expect("step");
        }
        let projectile = world.projectile(projectile_id).unwrap();
        assert_eq!(projectile.lifecycle, ProjectileLifecycle::GroundImpact);
        let impact = projectile.impact_position.unwrap();
        assert!(
            (impact.x - (50.0 + expected_range)).abs() < 0.2,
            "impact x {} expected {}",
            impact.x,
            50.0 + expected_range
        );
        assert!((impact.y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn flat_throw_from_ground_level_impacts_within_one_step() {
        let params = SimParams {
            launch_height: 0.0,
            ..SimParams::default()
        };
        let mut world = World::new(params, 0).expect("world");
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        let projectile_id = world.launch_projectile(id, 0.0, 0.0, 20.0).expect("launch");
        world.step(&ActionMap::new()).expect("step");
        assert_eq!(
            world.projectile(projectile_id).unwrap().lifecycle,
            ProjectileLifecycle::GroundImpact
        );
    }

    #[test]
    fn vertical_throw_returns_to_launch_column() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        let projectile_id = world
            .launch_projectile(id, 0.0, std::f32::consts::FRAC_PI_2, 20.0)
            .expect("launch");
        for _ in 0..100 {
            world.step(&ActionMap::new()).expect("step");
        }
        let projectile = world.projectile(projectile_id).unwrap();
        assert_eq!(projectile.lifecycle, ProjectileLifecycle::GroundImpact);
        let impact = projectile.impact_position.unwrap();
        assert!((impact.x - 50.0).abs() < 1e-3, "x drift {}", impact.x - 50.0);
        assert!((impact.y - 50.0).abs() < 1e-3, "y drift {}", impact.y - 50.0);
    }

    #[test]
    fn projectile_altitude_is_strictly_concave_over_samples() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(10.0, 50.0),
            ..AgentSpec::default()
        });
        let projectile_id = world
            .launch_projectile(id, 0.0, 1.2, 15.0)
            .expect("launch");
        for _ in 0..60 {
            world.step(&ActionMap::new()).expect("step");
        }
        let projectile = world.projectile(projectile_id).unwrap();
        assert_eq!(projectile.lifecycle, ProjectileLifecycle::GroundImpact);
        let mut samples: Vec<f32> = projectile.trajectory().map(|p| p.z).collect();
        // The terminal sample sits at a partial-step offset; concavity is a
        // property of the uniformly spaced flight samples.
        samples.pop();
        assert!(samples.len() > 3);
        for window in samples.windows(3) {
            let second_difference = window[2] - 2.0 * window[1] + window[0];
            assert!(second_difference < 0.0, "z samples not concave: {window:?}");
        }
    }

    #[test]
    fn projectile_leaving_arena_is_tagged_without_impact_event() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(99.0, 50.0),
            ..AgentSpec::default()
        });
        let projectile_id = world
            .launch_projectile(id, 0.0, 1.0, 30.0)
            .expect("launch");
        let _ = world.drain_events();
        for _ in 0..40 {
            world.step(&ActionMap::new()).expect("step");
        }
        assert_eq!(
            world.projectile(projectile_id).unwrap().lifecycle,
            ProjectileLifecycle::OutOfBounds
        );
        assert!(
            world
                .drain_events()
                .iter()
                .all(|e| e.kind != EventKind::ProjectileImpact)
        );
    }

    #[test]
    fn projectile_expires_past_max_flight() {
        let params = SimParams {
            arena_width: 100.0,
            arena_height: 100.0,
            projectile_max_flight: 0.25,
            ..SimParams::default()
        };
        let mut world = World::new(params, 0).expect("world");
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        let projectile_id = world
            .launch_projectile(id, 0.0, std::f32::consts::FRAC_PI_2, 30.0)
            .expect("launch");
        for _ in 0..10 {
            world.step(&ActionMap::new()).expect("step");
        }
        assert_eq!(
            world.projectile(projectile_id).unwrap().lifecycle,
            ProjectileLifecycle::Expired
        );
    }

    #[test]
    fn trajectory_capacity_caps_samples_and_never_touches_the_hash() {
        let run = |capacity: Option<usize>| {
            let params = SimParams {
                trajectory_capacity: capacity,
                ..SimParams::default()
            };
            let mut world = World::new(params, 11).expect("world");
            let id = world.add_agent(AgentSpec {
                position: Position::new(50.0, 50.0),
                ..AgentSpec::default()
            });
            let projectile_id = world
                .launch_projectile(id, 0.3, 1.0, 18.0)
                .expect("launch");
            for _ in 0..30 {
                world.step(&ActionMap::new()).expect("step");
            }
            (world.projectile(projectile_id).unwrap().trajectory_len(), world.state_hash())
        };
        let (full, hash_full) = run(None);
        let (capped, hash_capped) = run(Some(4));
        let (disabled, hash_disabled) = run(Some(0));
        assert!(full > 4);
        assert_eq!(capped, 4);
        assert_eq!(disabled, 0);
        assert_eq!(hash_full, hash_capped);
        assert_eq!(hash_full, hash_disabled);
    }

    #[test]
    fn drain_events_is_idempotent_between_steps() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        world.launch_projectile(id, 0.0, 0.7, 12.0).expect("launch");
        assert!(!world.drain_events().is_empty());
        assert!(world.drain_events().is_empty());
    }

    #[test]
    fn state_hash_reacts_to_death_and_rng_draws() {
        let mut world = default_world(0);
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        let baseline = world.state_hash();
        assert_eq!(world.state_hash(), baseline, "hashing must be pure");

        world.mark_dead(id).expect("mark dead");
        let after_death = world.state_hash();
        assert_ne!(baseline, after_death);

        let _ = world.rng().next_u64();
        assert_ne!(world.state_hash(), after_death);
    }

    #[test]
    fn reset_clears_mutable_state_and_invalidates_handles() {
        let mut world = default_world(5);
        world.add_infantry_block(BlockSpec {
            team: 0,
            x_min: 20.0,
            y_min: 25.0,
            x_max: 60.0,
            y_max: 50.0,
        });
        let id = world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        world.launch_projectile(id, 0.0, 0.5, 10.0).expect("launch");
        drive(&mut world, id, 5.0, 0.0);
        assert_eq!(world.tick(), Tick(1));

        world.reset(9);
        assert_eq!(world.tick(), Tick(0));
        assert_eq!(world.agent_count(), 0);
        assert!(world.projectile_handles().is_empty());
        assert!(world.drain_events().is_empty());
        assert_eq!(world.blocks().len(), 1, "blocks survive reset");
        assert!(world.snapshot_agent(id).is_none(), "stale handle resolves to nothing");
        let mut actions = ActionMap::new();
        actions.insert(id, AgentAction::drive(1.0, 0.0));
        assert_eq!(world.step(&actions), Err(WorldError::UnknownAgent(id)));
    }

    #[test]
    fn infantry_block_queries() {
        let mut world = default_world(0);
        let block_id = world.add_infantry_block(BlockSpec {
            team: 1,
            x_min: 80.0,
            y_min: 25.0,
            x_max: 40.0,
            y_max: 50.0,
        });
        let block = world.block(block_id).expect("block");
        // min/max normalized regardless of input ordering.
        assert_eq!(block.x_min, 40.0);
        assert_eq!(block.x_max, 80.0);
        assert!(block.contains(60.0, 30.0));
        assert!(block.contains(40.0, 25.0), "boundary inclusive");
        assert!(!block.contains(30.0, 30.0));
        assert_eq!(block.distance_to_boundary(60.0, 30.0), 0.0);
        assert!((block.distance_to_boundary(30.0, 30.0) - 10.0).abs() < 1e-6);
        assert!((block.distance_to_boundary(85.0, 55.0) - (50.0f32).sqrt()).abs() < 1e-5);
        assert_eq!(block.center(), Position::new(60.0, 37.5));
    }

    #[test]
    fn snapshot_roundtrip_preserves_the_digest() {
        let mut world = default_world(21);
        let a = world.add_agent(AgentSpec {
            position: Position::new(30.0, 40.0),
            ..AgentSpec::default()
        });
        world.add_agent(AgentSpec {
            team: 1,
            position: Position::new(70.0, 40.0),
            ..AgentSpec::default()
        });
        world.launch_projectile(a, 0.5, 0.8, 15.0).expect("launch");
        drive(&mut world, a, 3.0, 1.0);

        let snapshot = world.snapshot();
        let mut restored = World::from_snapshot(snapshot).expect("restore");
        assert_eq!(world.state_hash(), restored.state_hash());
        assert_eq!(world.drain_events(), restored.drain_events());

        // Stepping the restored world tracks the original bit-for-bit.
        for _ in 0..50 {
            world.step(&ActionMap::new()).expect("step");
            restored.step(&ActionMap::new()).expect("step");
            assert_eq!(world.state_hash(), restored.state_hash());
        }
    }

    #[test]
    fn collision_stats_are_populated() {
        let mut world = default_world(0);
        world.add_agent(AgentSpec {
            position: Position::new(50.0, 50.0),
            ..AgentSpec::default()
        });
        world.add_agent(AgentSpec {
            position: Position::new(50.3, 50.0),
            ..AgentSpec::default()
        });
        world.step(&ActionMap::new()).expect("step");
        let stats = world.collision_stats();
        assert_eq!(stats.pairs_checked, 1);
        assert_eq!(stats.pairs_colliding, 1);
        assert!(stats.cells_occupied >= 1);
    }
}
