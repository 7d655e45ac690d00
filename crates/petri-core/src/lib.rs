//! Headless petri-dish simulation engine.
//!
//! The world holds three entity populations: movers (genetically
//! characterized agents that seek food, spend energy, and reproduce), food
//! pellets, and inert debris. Entities live in a slotmap keyed arena with
//! dense per-kind columns, and movers and food are mirrored into a uniform
//! grid index so neighborhood queries and pointer hit-tests stay cheap.
//!
//! A tick runs a fixed stage pipeline: sense, move, interact, energy,
//! reproduce, cleanup, bookkeeping. Sensing is read-only and fans out across
//! threads; every stage that consumes randomness runs serially against the
//! world's own seeded generator, so a seeded world replays identically.

use std::collections::{HashSet, VecDeque};
use std::f32::consts::{PI, TAU};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ordered_float::OrderedFloat;
use petri_index::{GridIndex, IndexError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, Key, SlotMap};
use thiserror::Error;
use tracing::{debug, warn};

/// Hard ceiling on a mover's stored energy.
pub const ENERGY_MAX: f32 = 2.0;

new_key_type! {
    /// Generational handle for any entity in the world.
    pub struct EntityId;
}

/// Monotonic simulation tick counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Lineage depth of a mover, incremented for each child.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u32);

impl Generation {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// World-space point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[must_use]
    pub fn distance_to(self, other: Position) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Heritable traits of a mover: skin and eye colour plus cruising speed.
///
/// Colour channels mutate by a bounded step rather than a fresh draw, so
/// lineages drift visibly instead of flickering. Speed is clamped to
/// [`Genome::SPEED_MIN`], [`Genome::SPEED_MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub skin: [u8; 3],
    pub eye: [u8; 3],
    pub speed: f32,
}

impl Genome {
    pub const SPEED_MIN: f32 = 0.25;
    pub const SPEED_MAX: f32 = 3.0;
    const COLOUR_STEP: i16 = 32;
    const SPEED_STEP: f32 = 0.25;

    /// Draw a fully random genome.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            skin: [rng.random(), rng.random(), rng.random()],
            eye: [rng.random(), rng.random(), rng.random()],
            speed: rng.random_range(Self::SPEED_MIN..=Self::SPEED_MAX),
        }
    }

    /// Combine two parent genomes, picking each trait from either parent.
    pub fn inherit<R: Rng + ?Sized>(a: &Self, b: &Self, rng: &mut R) -> Self {
        let mut child = *a;
        for channel in 0..3 {
            if rng.random_bool(0.5) {
                child.skin[channel] = b.skin[channel];
            }
            if rng.random_bool(0.5) {
                child.eye[channel] = b.eye[channel];
            }
        }
        if rng.random_bool(0.5) {
            child.speed = b.speed;
        }
        child
    }

    /// Copy of this genome with each trait independently perturbed at `rate`.
    #[must_use]
    pub fn mutated<R: Rng + ?Sized>(&self, rate: f32, rng: &mut R) -> Self {
        let rate = f64::from(rate.clamp(0.0, 1.0));
        let mut out = *self;
        for channel in 0..3 {
            if rng.random_bool(rate) {
                out.skin[channel] = nudge_channel(out.skin[channel], rng);
            }
            if rng.random_bool(rate) {
                out.eye[channel] = nudge_channel(out.eye[channel], rng);
            }
        }
        if rng.random_bool(rate) {
            out.speed = (out.speed + rng.random_range(-Self::SPEED_STEP..=Self::SPEED_STEP))
                .clamp(Self::SPEED_MIN, Self::SPEED_MAX);
        }
        out
    }
}

fn nudge_channel<R: Rng + ?Sized>(channel: u8, rng: &mut R) -> u8 {
    let delta = rng.random_range(-Genome::COLOUR_STEP..=Genome::COLOUR_STEP);
    (i16::from(channel) + delta).clamp(0, 255) as u8
}

/// Discriminates the three entity populations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Mover,
    Food,
    Debris,
}

/// Full per-mover state, used when spawning and when reading one mover back
/// out of the columns.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MoverData {
    position: Position,
    heading: f32,
    energy: f32,
    age: u32,
    offspring: u32,
    since_reproduction: u32,
    generation: Generation,
    genome: Genome,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FoodData {
    position: Position,
    value: f32,
}

/// Dense mover state, one parallel column per field.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct MoverColumns {
    positions: Vec<Position>,
    headings: Vec<f32>,
    energies: Vec<f32>,
    ages: Vec<u32>,
    offspring: Vec<u32>,
    since_reproduction: Vec<u32>,
    generations: Vec<Generation>,
    genomes: Vec<Genome>,
}

impl MoverColumns {
    fn len(&self) -> usize {
        self.positions.len()
    }

    fn push(&mut self, data: MoverData) {
        self.positions.push(data.position);
        self.headings.push(data.heading);
        self.energies.push(data.energy);
        self.ages.push(data.age);
        self.offspring.push(data.offspring);
        self.since_reproduction.push(data.since_reproduction);
        self.generations.push(data.generation);
        self.genomes.push(data.genome);
    }

    fn swap_remove(&mut self, index: usize) {
        self.positions.swap_remove(index);
        self.headings.swap_remove(index);
        self.energies.swap_remove(index);
        self.ages.swap_remove(index);
        self.offspring.swap_remove(index);
        self.since_reproduction.swap_remove(index);
        self.generations.swap_remove(index);
        self.genomes.swap_remove(index);
    }

    fn get(&self, index: usize) -> MoverData {
        MoverData {
            position: self.positions[index],
            heading: self.headings[index],
            energy: self.energies[index],
            age: self.ages[index],
            offspring: self.offspring[index],
            since_reproduction: self.since_reproduction[index],
            generation: self.generations[index],
            genome: self.genomes[index],
        }
    }

    fn debug_assert_coherent(&self) {
        let n = self.positions.len();
        debug_assert_eq!(n, self.headings.len());
        debug_assert_eq!(n, self.energies.len());
        debug_assert_eq!(n, self.ages.len());
        debug_assert_eq!(n, self.offspring.len());
        debug_assert_eq!(n, self.since_reproduction.len());
        debug_assert_eq!(n, self.generations.len());
        debug_assert_eq!(n, self.genomes.len());
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct FoodColumns {
    positions: Vec<Position>,
    values: Vec<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Slot {
    kind: EntityKind,
    index: usize,
}

/// Arena for all live entities.
///
/// The slotmap hands out versioned ids, so a handle to a removed entity can
/// never resolve to whatever later reuses its storage. Each slot records the
/// entity's kind and its position in that kind's dense columns; removal
/// swap-removes the dense row and patches the slot of whichever entity was
/// moved into the hole.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct EntityStore {
    slots: SlotMap<EntityId, Slot>,
    mover_handles: Vec<EntityId>,
    movers: MoverColumns,
    food_handles: Vec<EntityId>,
    food: FoodColumns,
    debris_handles: Vec<EntityId>,
    debris: Vec<Position>,
}

impl EntityStore {
    fn spawn_mover(&mut self, data: MoverData) -> EntityId {
        let index = self.movers.len();
        let id = self.slots.insert(Slot {
            kind: EntityKind::Mover,
            index,
        });
        self.mover_handles.push(id);
        self.movers.push(data);
        id
    }

    fn spawn_food(&mut self, data: FoodData) -> EntityId {
        let index = self.food.positions.len();
        let id = self.slots.insert(Slot {
            kind: EntityKind::Food,
            index,
        });
        self.food_handles.push(id);
        self.food.positions.push(data.position);
        self.food.values.push(data.value);
        id
    }

    fn spawn_debris(&mut self, position: Position) -> EntityId {
        let index = self.debris.len();
        let id = self.slots.insert(Slot {
            kind: EntityKind::Debris,
            index,
        });
        self.debris_handles.push(id);
        self.debris.push(position);
        id
    }

    fn remove(&mut self, id: EntityId) -> Option<EntityKind> {
        let slot = self.slots.remove(id)?;
        match slot.kind {
            EntityKind::Mover => {
                self.mover_handles.swap_remove(slot.index);
                self.movers.swap_remove(slot.index);
                if let Some(&moved) = self.mover_handles.get(slot.index) {
                    self.slots[moved].index = slot.index;
                }
            }
            EntityKind::Food => {
                self.food_handles.swap_remove(slot.index);
                self.food.positions.swap_remove(slot.index);
                self.food.values.swap_remove(slot.index);
                if let Some(&moved) = self.food_handles.get(slot.index) {
                    self.slots[moved].index = slot.index;
                }
            }
            EntityKind::Debris => {
                self.debris_handles.swap_remove(slot.index);
                self.debris.swap_remove(slot.index);
                if let Some(&moved) = self.debris_handles.get(slot.index) {
                    self.slots[moved].index = slot.index;
                }
            }
        }
        Some(slot.kind)
    }

    fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(id)
    }

    fn kind(&self, id: EntityId) -> Option<EntityKind> {
        self.slots.get(id).map(|slot| slot.kind)
    }

    fn mover_index(&self, id: EntityId) -> Option<usize> {
        match self.slots.get(id) {
            Some(slot) if slot.kind == EntityKind::Mover => Some(slot.index),
            _ => None,
        }
    }

    fn position_of(&self, id: EntityId) -> Option<Position> {
        let slot = self.slots.get(id)?;
        Some(match slot.kind {
            EntityKind::Mover => self.movers.positions[slot.index],
            EntityKind::Food => self.food.positions[slot.index],
            EntityKind::Debris => self.debris[slot.index],
        })
    }

    fn food_value(&self, id: EntityId) -> Option<f32> {
        match self.slots.get(id) {
            Some(slot) if slot.kind == EntityKind::Food => Some(self.food.values[slot.index]),
            _ => None,
        }
    }

    fn set_food_position(&mut self, id: EntityId, position: Position) {
        if let Some(slot) = self.slots.get(id) {
            if slot.kind == EntityKind::Food {
                self.food.positions[slot.index] = position;
            }
        }
    }

    fn debug_assert_coherent(&self) {
        self.movers.debug_assert_coherent();
        debug_assert_eq!(self.mover_handles.len(), self.movers.len());
        debug_assert_eq!(self.food_handles.len(), self.food.positions.len());
        debug_assert_eq!(self.food.positions.len(), self.food.values.len());
        debug_assert_eq!(self.debris_handles.len(), self.debris.len());
        debug_assert_eq!(
            self.slots.len(),
            self.mover_handles.len() + self.food_handles.len() + self.debris_handles.len()
        );
        #[cfg(debug_assertions)]
        for (id, slot) in &self.slots {
            let back = match slot.kind {
                EntityKind::Mover => self.mover_handles[slot.index],
                EntityKind::Food => self.food_handles[slot.index],
                EntityKind::Debris => self.debris_handles[slot.index],
            };
            debug_assert_eq!(back, id, "slot index does not round-trip");
        }
    }
}

/// Errors surfaced by world construction and mutation.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors from the key/value configuration surface.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),
    #[error("configuration key `{key}` expects {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("failed to encode json: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Loosely typed value accepted by the runtime configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Boolean(bool),
    Number(f64),
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl ConfigValue {
    fn as_f32(self, key: &str) -> Result<f32, ConfigError> {
        match self {
            Self::Number(n) if n.is_finite() => Ok(n as f32),
            _ => Err(ConfigError::WrongType {
                key: key.to_string(),
                expected: "a finite number",
            }),
        }
    }

    fn as_count(self, key: &str) -> Result<u64, ConfigError> {
        match self {
            Self::Number(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 => Ok(n as u64),
            _ => Err(ConfigError::WrongType {
                key: key.to_string(),
                expected: "a non-negative integer",
            }),
        }
    }

    fn as_usize(self, key: &str) -> Result<usize, ConfigError> {
        usize::try_from(self.as_count(key)?).map_err(|_| ConfigError::WrongType {
            key: key.to_string(),
            expected: "a non-negative integer",
        })
    }

    fn as_u32(self, key: &str) -> Result<u32, ConfigError> {
        u32::try_from(self.as_count(key)?).map_err(|_| ConfigError::WrongType {
            key: key.to_string(),
            expected: "a 32-bit unsigned integer",
        })
    }

    fn as_bool(self, key: &str) -> Result<bool, ConfigError> {
        match self {
            Self::Boolean(b) => Ok(b),
            Self::Number(_) => Err(ConfigError::WrongType {
                key: key.to_string(),
                expected: "a boolean",
            }),
        }
    }
}

/// Tunable world parameters.
///
/// Every field is reachable at runtime through [`WorldConfig::apply`] under
/// its field name. `world_width`, `world_height`, and `rng_seed` are recorded
/// immediately but only take effect when the world is reinitialised; the
/// rest apply from the next tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldConfig {
    pub world_width: f32,
    pub world_height: f32,
    pub cell_size: f32,
    pub starting_population: usize,
    pub max_population: usize,
    pub food_count: usize,
    pub food_energy: f32,
    pub food_respawns: bool,
    pub eat_radius: f32,
    pub sense_radius: f32,
    pub metabolic_cost: f32,
    pub speed_cost: f32,
    pub wander_turn: f32,
    pub reproduction_threshold: f32,
    pub reproduction_cost: f32,
    pub reproduction_cooldown: u32,
    pub child_energy: f32,
    pub spawn_jitter: f32,
    pub mutation_rate: f32,
    pub sexual_reproduction: bool,
    pub mate_radius: f32,
    pub predation: bool,
    pub predation_transfer: f32,
    pub collision_radius: f32,
    pub max_age: u32,
    pub hit_radius: f32,
    pub debris_density: u32,
    pub warmup_ticks: u32,
    pub history_capacity: usize,
    pub rng_seed: Option<u64>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            world_width: 250.0,
            world_height: 250.0,
            cell_size: 25.0,
            starting_population: 20,
            max_population: 256,
            food_count: 60,
            food_energy: 0.6,
            food_respawns: true,
            eat_radius: 6.0,
            sense_radius: 40.0,
            metabolic_cost: 0.004,
            speed_cost: 0.004,
            wander_turn: 0.2,
            reproduction_threshold: 1.4,
            reproduction_cost: 0.7,
            reproduction_cooldown: 60,
            child_energy: 0.8,
            spawn_jitter: 8.0,
            mutation_rate: 0.08,
            sexual_reproduction: false,
            mate_radius: 25.0,
            predation: false,
            predation_transfer: 0.05,
            collision_radius: 5.0,
            max_age: 0,
            hit_radius: 10.0,
            debris_density: 5000,
            warmup_ticks: 0,
            history_capacity: 256,
            rng_seed: None,
        }
    }
}

impl WorldConfig {
    /// Check the whole configuration for internal consistency.
    pub fn validate(&self) -> Result<(), WorldError> {
        if !self.world_width.is_finite() || self.world_width <= 0.0 {
            return Err(WorldError::InvalidConfig("world_width must be positive"));
        }
        if !self.world_height.is_finite() || self.world_height <= 0.0 {
            return Err(WorldError::InvalidConfig("world_height must be positive"));
        }
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(WorldError::InvalidConfig("cell_size must be positive"));
        }
        if self.max_population == 0 {
            return Err(WorldError::InvalidConfig("max_population must be at least 1"));
        }
        if self.starting_population > self.max_population {
            return Err(WorldError::InvalidConfig(
                "starting_population cannot exceed max_population",
            ));
        }
        for (value, message) in [
            (self.food_energy, "food_energy must be finite and non-negative"),
            (self.eat_radius, "eat_radius must be finite and non-negative"),
            (self.sense_radius, "sense_radius must be finite and non-negative"),
            (self.metabolic_cost, "metabolic_cost must be finite and non-negative"),
            (self.speed_cost, "speed_cost must be finite and non-negative"),
            (self.wander_turn, "wander_turn must be finite and non-negative"),
            (self.reproduction_cost, "reproduction_cost must be finite and non-negative"),
            (self.spawn_jitter, "spawn_jitter must be finite and non-negative"),
            (self.mate_radius, "mate_radius must be finite and non-negative"),
            (self.predation_transfer, "predation_transfer must be finite and non-negative"),
            (self.collision_radius, "collision_radius must be finite and non-negative"),
            (self.hit_radius, "hit_radius must be finite and non-negative"),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(WorldError::InvalidConfig(message));
            }
        }
        if !self.reproduction_threshold.is_finite() || self.reproduction_threshold <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "reproduction_threshold must be positive",
            ));
        }
        if self.reproduction_cost > self.reproduction_threshold {
            return Err(WorldError::InvalidConfig(
                "reproduction_cost cannot exceed reproduction_threshold",
            ));
        }
        if !self.child_energy.is_finite() || self.child_energy <= 0.0 || self.child_energy > ENERGY_MAX
        {
            return Err(WorldError::InvalidConfig(
                "child_energy must be positive and at most the energy ceiling",
            ));
        }
        if !self.mutation_rate.is_finite() || !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(WorldError::InvalidConfig(
                "mutation_rate must lie within [0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Set one field by key. Type errors leave the configuration untouched;
    /// range checking is [`WorldConfig::validate`]'s job.
    pub fn apply(&mut self, key: &str, value: ConfigValue) -> Result<(), ConfigError> {
        match key {
            "world_width" => self.world_width = value.as_f32(key)?,
            "world_height" => self.world_height = value.as_f32(key)?,
            "cell_size" => self.cell_size = value.as_f32(key)?,
            "starting_population" => self.starting_population = value.as_usize(key)?,
            "max_population" => self.max_population = value.as_usize(key)?,
            "food_count" => self.food_count = value.as_usize(key)?,
            "food_energy" => self.food_energy = value.as_f32(key)?,
            "food_respawns" => self.food_respawns = value.as_bool(key)?,
            "eat_radius" => self.eat_radius = value.as_f32(key)?,
            "sense_radius" => self.sense_radius = value.as_f32(key)?,
            "metabolic_cost" => self.metabolic_cost = value.as_f32(key)?,
            "speed_cost" => self.speed_cost = value.as_f32(key)?,
            "wander_turn" => self.wander_turn = value.as_f32(key)?,
            "reproduction_threshold" => self.reproduction_threshold = value.as_f32(key)?,
            "reproduction_cost" => self.reproduction_cost = value.as_f32(key)?,
            "reproduction_cooldown" => self.reproduction_cooldown = value.as_u32(key)?,
            "child_energy" => self.child_energy = value.as_f32(key)?,
            "spawn_jitter" => self.spawn_jitter = value.as_f32(key)?,
            "mutation_rate" => self.mutation_rate = value.as_f32(key)?,
            "sexual_reproduction" => self.sexual_reproduction = value.as_bool(key)?,
            "mate_radius" => self.mate_radius = value.as_f32(key)?,
            "predation" => self.predation = value.as_bool(key)?,
            "predation_transfer" => self.predation_transfer = value.as_f32(key)?,
            "collision_radius" => self.collision_radius = value.as_f32(key)?,
            "max_age" => self.max_age = value.as_u32(key)?,
            "hit_radius" => self.hit_radius = value.as_f32(key)?,
            "debris_density" => self.debris_density = value.as_u32(key)?,
            "warmup_ticks" => self.warmup_ticks = value.as_u32(key)?,
            "history_capacity" => self.history_capacity = value.as_usize(key)?,
            "rng_seed" => self.rng_seed = Some(value.as_count(key)?),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Whole configuration as a JSON object keyed by field name.
    pub fn snapshot(&self) -> Result<serde_json::Value, ConfigError> {
        Ok(serde_json::to_value(self)?)
    }

    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        }
    }
}

/// Per-tick aggregate pushed onto the world's bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub population: usize,
    pub food_items: usize,
    pub births: usize,
    pub deaths: usize,
    pub total_energy: f32,
    pub mean_energy: f32,
    pub max_generation: u32,
}

/// Aggregate world statistics for external consumers, including the
/// descriptor of the currently selected entity while it is alive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorldReport {
    pub tick: u64,
    pub width: f32,
    pub height: f32,
    pub population: usize,
    pub food_items: usize,
    pub debris_items: usize,
    pub births: usize,
    pub deaths: usize,
    pub births_total: u64,
    pub deaths_total: u64,
    pub total_energy: f32,
    pub mean_energy: f32,
    pub mean_age: f32,
    pub max_generation: u32,
    pub mean_speed: f32,
    pub selected: Option<EntityDescriptor>,
}

/// Snapshot of a single entity, as returned by selection queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    pub id: u64,
    pub kind: EntityKind,
    pub position: Position,
    pub energy: f32,
    pub detail: Option<MoverDetail>,
}

/// Mover-only fields of an [`EntityDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoverDetail {
    pub age: u32,
    pub offspring: u32,
    pub generation: u32,
    pub heading: f32,
    pub skin: [u8; 3],
    pub eye: [u8; 3],
    pub speed: f32,
}

/// Render-ready copy of everything visible in the world.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSnapshot {
    pub tick: u64,
    pub width: f32,
    pub height: f32,
    pub movers: Vec<MoverSprite>,
    pub food: Vec<FoodSprite>,
    pub debris: Vec<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoverSprite {
    pub id: u64,
    pub position: Position,
    pub heading: f32,
    pub skin: [u8; 3],
    pub eye: [u8; 3],
    pub speed: f32,
    pub energy: f32,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoodSprite {
    pub id: u64,
    pub position: Position,
    pub value: f32,
}

/// The simulation itself. Owns the entity arena, the spatial index, and the
/// random generator; a tick mutates everything in place.
#[derive(Debug)]
pub struct World {
    config: WorldConfig,
    width: f32,
    height: f32,
    tick: Tick,
    rng: SmallRng,
    store: EntityStore,
    index: GridIndex<EntityId>,
    targets: Vec<Option<Position>>,
    pending_deaths: Vec<EntityId>,
    pending_spawns: Vec<MoverData>,
    selected: Option<EntityId>,
    births_last_tick: usize,
    deaths_last_tick: usize,
    births_total: u64,
    deaths_total: u64,
    history: VecDeque<TickSummary>,
}

impl World {
    /// Build and seed a world. Runs any configured warm-up ticks, then
    /// resets the clock so observers start from tick zero.
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let index = GridIndex::new(config.cell_size, config.world_width, config.world_height)?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        let mut world = Self {
            width: config.world_width,
            height: config.world_height,
            config,
            tick: Tick::zero(),
            rng,
            store: EntityStore::default(),
            index,
            targets: Vec::new(),
            pending_deaths: Vec::new(),
            pending_spawns: Vec::new(),
            selected: None,
            births_last_tick: 0,
            deaths_last_tick: 0,
            births_total: 0,
            deaths_total: 0,
            history: VecDeque::with_capacity(history_capacity.min(1024)),
        };
        world.seed_entities();
        world.run_warmup();
        Ok(world)
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn bounds(&self) -> (f32, f32) {
        (self.width, self.height)
    }

    pub fn population(&self) -> usize {
        self.store.movers.len()
    }

    pub fn food_items(&self) -> usize {
        self.store.food_handles.len()
    }

    pub fn debris_items(&self) -> usize {
        self.store.debris.len()
    }

    /// Oldest-first iterator over retained tick summaries.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    fn random_position(&mut self) -> Position {
        Position {
            x: self.rng.random_range(0.0..=self.width),
            y: self.rng.random_range(0.0..=self.height),
        }
    }

    fn seed_entities(&mut self) {
        for _ in 0..self.config.starting_population {
            let data = MoverData {
                position: self.random_position(),
                heading: self.rng.random_range(0.0..TAU),
                energy: 1.0,
                age: 0,
                offspring: 0,
                since_reproduction: 0,
                generation: Generation(0),
                genome: Genome::random(&mut self.rng),
            };
            let position = data.position;
            let id = self.store.spawn_mover(data);
            self.index.insert(id, position.x, position.y);
        }
        for _ in 0..self.config.food_count {
            let position = self.random_position();
            let value = self.config.food_energy;
            let id = self.store.spawn_food(FoodData { position, value });
            self.index.insert(id, position.x, position.y);
        }
        if self.config.debris_density > 0 {
            let area = f64::from(self.width) * f64::from(self.height);
            let count = (area / f64::from(self.config.debris_density)) as usize;
            for _ in 0..count {
                let position = self.random_position();
                self.store.spawn_debris(position);
            }
        }
    }

    fn run_warmup(&mut self) {
        if self.config.warmup_ticks == 0 {
            return;
        }
        for _ in 0..self.config.warmup_ticks {
            self.step();
        }
        self.tick = Tick::zero();
        self.history.clear();
        self.births_last_tick = 0;
        self.deaths_last_tick = 0;
        self.births_total = 0;
        self.deaths_total = 0;
    }

    /// Tear the world down and reseed it over a new extent. The stored
    /// configuration is revalidated first and left untouched on failure.
    pub fn reinitialise(&mut self, width: f32, height: f32) -> Result<(), WorldError> {
        let mut config = self.config.clone();
        config.world_width = width;
        config.world_height = height;
        config.validate()?;
        let index = GridIndex::new(config.cell_size, width, height)?;
        debug!(width, height, "reinitialising world");
        self.rng = config.seeded_rng();
        self.config = config;
        self.width = width;
        self.height = height;
        self.index = index;
        self.store = EntityStore::default();
        self.targets.clear();
        self.pending_deaths.clear();
        self.pending_spawns.clear();
        self.selected = None;
        self.tick = Tick::zero();
        self.history.clear();
        self.births_last_tick = 0;
        self.deaths_last_tick = 0;
        self.births_total = 0;
        self.deaths_total = 0;
        self.seed_entities();
        self.run_warmup();
        Ok(())
    }

    /// Apply one configuration change, rejecting it atomically if the
    /// resulting configuration would be invalid.
    pub fn update_config(&mut self, key: &str, value: ConfigValue) -> Result<(), WorldError> {
        let mut candidate = self.config.clone();
        candidate.apply(key, value)?;
        candidate.validate()?;
        let rebuild = (candidate.cell_size - self.config.cell_size).abs() > f32::EPSILON;
        self.config = candidate;
        if rebuild {
            self.rebuild_index()?;
        }
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
        debug!(key, "configuration updated");
        Ok(())
    }

    fn rebuild_index(&mut self) -> Result<(), WorldError> {
        let mut index = GridIndex::new(self.config.cell_size, self.width, self.height)?;
        for (i, id) in self.store.mover_handles.iter().enumerate() {
            let position = self.store.movers.positions[i];
            index.insert(*id, position.x, position.y);
        }
        for (i, id) in self.store.food_handles.iter().enumerate() {
            let position = self.store.food.positions[i];
            index.insert(*id, position.x, position.y);
        }
        self.index = index;
        Ok(())
    }

    /// Advance the simulation one tick and return its summary.
    pub fn step(&mut self) -> TickSummary {
        let population_before = self.store.movers.len();
        self.births_last_tick = 0;
        self.deaths_last_tick = 0;
        self.stage_sense();
        self.stage_move();
        self.stage_interact();
        self.stage_energy();
        self.stage_reproduce();
        self.stage_cleanup();
        let summary = self.stage_bookkeeping(population_before);
        self.tick = self.tick.next();
        summary
    }

    /// Read-only pass: each mover picks the nearest food within its sense
    /// radius, or the nearest strictly weaker mover when predation is on.
    fn stage_sense(&mut self) {
        let mover_count = self.store.movers.len();
        self.targets.clear();
        self.targets.resize(mover_count, None);
        let store = &self.store;
        let index = &self.index;
        let sense_radius = self.config.sense_radius;
        let predation = self.config.predation;
        self.targets
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, target)| {
                let me = store.mover_handles[i];
                let origin = store.movers.positions[i];
                let my_energy = store.movers.energies[i];
                let mut best: Option<(OrderedFloat<f32>, EntityId)> = None;
                index.query_radius((origin.x, origin.y), sense_radius, &mut |key, dist| {
                    if key == me {
                        return;
                    }
                    let eligible = match store.kind(key) {
                        Some(EntityKind::Food) => true,
                        Some(EntityKind::Mover) if predation => store
                            .mover_index(key)
                            .is_some_and(|j| store.movers.energies[j] < my_energy),
                        _ => false,
                    };
                    if !eligible {
                        return;
                    }
                    let candidate = (OrderedFloat(dist), key);
                    if best.is_none_or(|current| candidate < current) {
                        best = Some(candidate);
                    }
                });
                *target = best.and_then(|(_, key)| store.position_of(key));
            });
    }

    /// Serial pass: steer toward the sensed target or wander, displace by
    /// genome speed, and reflect off the boundary. Movers whose state has
    /// gone non-finite are quarantined for removal instead of written back.
    fn stage_move(&mut self) {
        let Self {
            config,
            width,
            height,
            store,
            index,
            rng,
            targets,
            pending_deaths,
            ..
        } = self;
        let movers = &mut store.movers;
        let handles = &store.mover_handles;
        for i in 0..handles.len() {
            let origin = movers.positions[i];
            let speed = movers.genomes[i].speed;
            let mut heading = movers.headings[i];
            if let Some(goal) = targets.get(i).copied().flatten() {
                heading = (goal.y - origin.y).atan2(goal.x - origin.x);
            } else {
                heading += rng.random_range(-config.wander_turn..=config.wander_turn);
            }
            let mut x = origin.x + heading.cos() * speed;
            let mut y = origin.y + heading.sin() * speed;
            if !x.is_finite() || !y.is_finite() || !heading.is_finite() {
                warn!(
                    mover = handles[i].data().as_ffi(),
                    "quarantining mover with non-finite state"
                );
                pending_deaths.push(handles[i]);
                continue;
            }
            if x < 0.0 {
                x = -x;
                heading = PI - heading;
            } else if x > *width {
                x = 2.0 * *width - x;
                heading = PI - heading;
            }
            if y < 0.0 {
                y = -y;
                heading = -heading;
            } else if y > *height {
                y = 2.0 * *height - y;
                heading = -heading;
            }
            let x = x.clamp(0.0, *width);
            let y = y.clamp(0.0, *height);
            movers.positions[i] = Position { x, y };
            movers.headings[i] = heading % TAU;
            index.update(handles[i], x, y);
        }
    }

    /// Feeding and, when enabled, predation. Each food pellet is consumed by
    /// at most one mover per tick; consumed pellets respawn elsewhere or
    /// disappear depending on configuration.
    fn stage_interact(&mut self) {
        let eat_radius = self.config.eat_radius;
        let mover_count = self.store.movers.len();

        let mut claimed: HashSet<EntityId> = HashSet::new();
        let mut meals: Vec<(usize, EntityId)> = Vec::new();
        let mut scratch: Vec<(OrderedFloat<f32>, EntityId)> = Vec::new();
        for i in 0..mover_count {
            let origin = self.store.movers.positions[i];
            scratch.clear();
            let store = &self.store;
            self.index
                .query_radius((origin.x, origin.y), eat_radius, &mut |key, dist| {
                    if store.kind(key) == Some(EntityKind::Food) {
                        scratch.push((OrderedFloat(dist), key));
                    }
                });
            scratch.sort_unstable();
            if let Some(&(_, food)) = scratch.iter().find(|(_, key)| !claimed.contains(key)) {
                claimed.insert(food);
                meals.push((i, food));
            }
        }
        for (i, food) in meals {
            let Some(value) = self.store.food_value(food) else {
                continue;
            };
            let energy = &mut self.store.movers.energies[i];
            *energy = (*energy + value).min(ENERGY_MAX);
            if self.config.food_respawns {
                let position = self.random_position();
                self.store.set_food_position(food, position);
                self.index.update(food, position.x, position.y);
            } else {
                if self.selected == Some(food) {
                    self.selected = None;
                }
                self.store.remove(food);
                self.index.remove(food);
            }
        }

        if self.config.predation && self.config.predation_transfer > 0.0 {
            let radius = self.config.collision_radius;
            let mut drains: Vec<(usize, usize)> = Vec::new();
            {
                let store = &self.store;
                let index = &self.index;
                for i in 0..mover_count {
                    let origin = store.movers.positions[i];
                    let my_energy = store.movers.energies[i];
                    let me = store.mover_handles[i];
                    index.query_radius((origin.x, origin.y), radius, &mut |key, _| {
                        if key == me || store.kind(key) != Some(EntityKind::Mover) {
                            return;
                        }
                        let Some(j) = store.mover_index(key) else {
                            return;
                        };
                        if store.movers.energies[j] < my_energy {
                            drains.push((i, j));
                        }
                    });
                }
            }
            let transfer = self.config.predation_transfer;
            for (hunter, prey) in drains {
                let amount = transfer.min(self.store.movers.energies[prey].max(0.0));
                if amount <= 0.0 {
                    continue;
                }
                self.store.movers.energies[prey] -= amount;
                let gain = &mut self.store.movers.energies[hunter];
                *gain = (*gain + amount).min(ENERGY_MAX);
            }
        }
    }

    /// Upkeep: pay metabolic and speed costs, age everyone, and mark the
    /// starved, the expired, and anything with corrupt energy for removal.
    fn stage_energy(&mut self) {
        let config = &self.config;
        let movers = &mut self.store.movers;
        let handles = &self.store.mover_handles;
        let pending = &mut self.pending_deaths;
        for i in 0..handles.len() {
            let upkeep = config.metabolic_cost + config.speed_cost * movers.genomes[i].speed;
            movers.energies[i] -= upkeep;
            movers.ages[i] = movers.ages[i].saturating_add(1);
            movers.since_reproduction[i] = movers.since_reproduction[i].saturating_add(1);
            let energy = movers.energies[i];
            let expired = config.max_age > 0 && movers.ages[i] > config.max_age;
            if energy <= 0.0 || !energy.is_finite() || expired {
                pending.push(handles[i]);
            }
        }
    }

    /// Movers past the energy threshold and cooldown spawn a child nearby,
    /// bounded by the population ceiling. Under sexual reproduction a parent
    /// additionally needs a mate within range and the child mixes both
    /// genomes before mutation.
    fn stage_reproduce(&mut self) {
        let population = self.store.movers.len();
        let budget = self.config.max_population.saturating_sub(population);
        if budget == 0 || population == 0 {
            return;
        }
        let threshold = self.config.reproduction_threshold;
        let cooldown = self.config.reproduction_cooldown;
        let sexual = self.config.sexual_reproduction;
        let mate_radius = self.config.mate_radius;

        let mut parents: Vec<(usize, Option<usize>)> = Vec::new();
        {
            let store = &self.store;
            let index = &self.index;
            for i in 0..population {
                if parents.len() == budget {
                    break;
                }
                if store.movers.energies[i] < threshold
                    || store.movers.since_reproduction[i] < cooldown
                {
                    continue;
                }
                if sexual {
                    let me = store.mover_handles[i];
                    let origin = store.movers.positions[i];
                    let mut best: Option<(OrderedFloat<f32>, EntityId)> = None;
                    index.query_radius((origin.x, origin.y), mate_radius, &mut |key, dist| {
                        if key == me || store.kind(key) != Some(EntityKind::Mover) {
                            return;
                        }
                        let candidate = (OrderedFloat(dist), key);
                        if best.is_none_or(|current| candidate < current) {
                            best = Some(candidate);
                        }
                    });
                    let Some((_, mate)) = best else {
                        continue;
                    };
                    let Some(j) = store.mover_index(mate) else {
                        continue;
                    };
                    parents.push((i, Some(j)));
                } else {
                    parents.push((i, None));
                }
            }
        }

        for (i, mate) in parents {
            let (base, lineage) = {
                let movers = &self.store.movers;
                match mate {
                    Some(j) => (
                        Genome::inherit(&movers.genomes[i], &movers.genomes[j], &mut self.rng),
                        Generation(movers.generations[i].0.max(movers.generations[j].0)),
                    ),
                    None => (movers.genomes[i], movers.generations[i]),
                }
            };
            let genome = base.mutated(self.config.mutation_rate, &mut self.rng);
            let jitter = self.config.spawn_jitter;
            let origin = self.store.movers.positions[i];
            let x = (origin.x + self.rng.random_range(-jitter..=jitter)).clamp(0.0, self.width);
            let y = (origin.y + self.rng.random_range(-jitter..=jitter)).clamp(0.0, self.height);
            let heading = self.rng.random_range(0.0..TAU);
            self.store.movers.energies[i] -= self.config.reproduction_cost;
            self.store.movers.since_reproduction[i] = 0;
            self.store.movers.offspring[i] += 1;
            self.pending_spawns.push(MoverData {
                position: Position { x, y },
                heading,
                energy: self.config.child_energy,
                age: 0,
                offspring: 0,
                since_reproduction: 0,
                generation: lineage.next(),
                genome,
            });
        }

        for data in mem::take(&mut self.pending_spawns) {
            if self.store.movers.len() >= self.config.max_population {
                break;
            }
            let position = data.position;
            let id = self.store.spawn_mover(data);
            self.index.insert(id, position.x, position.y);
            self.births_last_tick += 1;
        }
    }

    /// Commit deferred removals. Duplicate marks collapse to one removal and
    /// a dead selection degrades to no selection.
    fn stage_cleanup(&mut self) {
        let mut seen: HashSet<EntityId> = HashSet::new();
        for id in mem::take(&mut self.pending_deaths) {
            if !seen.insert(id) || !self.store.contains(id) {
                continue;
            }
            if self.selected == Some(id) {
                self.selected = None;
            }
            self.store.remove(id);
            self.index.remove(id);
            self.deaths_last_tick += 1;
        }
    }

    fn stage_bookkeeping(&mut self, population_before: usize) -> TickSummary {
        self.store.debug_assert_coherent();
        let movers = &self.store.movers;
        let population = movers.len();
        debug_assert_eq!(
            population + self.deaths_last_tick,
            population_before + self.births_last_tick,
            "population ledger out of balance"
        );
        let total_energy: f32 = movers.energies.iter().sum();
        let summary = TickSummary {
            tick: self.tick,
            population,
            food_items: self.store.food_handles.len(),
            births: self.births_last_tick,
            deaths: self.deaths_last_tick,
            total_energy,
            mean_energy: if population == 0 {
                0.0
            } else {
                total_energy / population as f32
            },
            max_generation: movers.generations.iter().map(|g| g.0).max().unwrap_or(0),
        };
        self.births_total += self.births_last_tick as u64;
        self.deaths_total += self.deaths_last_tick as u64;
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    /// Select whatever indexed entity sits nearest the pointer, within the
    /// configured hit radius. A miss clears the selection. Debris is inert
    /// and never indexed, so it is never selectable.
    pub fn select_at(&mut self, x: f32, y: f32) -> Option<EntityDescriptor> {
        let hit = self.index.nearest_within((x, y), self.config.hit_radius);
        self.selected = hit.map(|(id, _)| id);
        debug!(x, y, hit = self.selected.is_some(), "pointer selection");
        self.selected.and_then(|id| self.describe(id))
    }

    /// Current selection, re-resolved against the live store.
    pub fn selected(&self) -> Option<EntityDescriptor> {
        self.selected.and_then(|id| self.describe(id))
    }

    /// Describe one entity by handle. Stale handles resolve to `None`.
    pub fn describe(&self, id: EntityId) -> Option<EntityDescriptor> {
        let slot = self.store.slots.get(id)?;
        let numeric = id.data().as_ffi();
        Some(match slot.kind {
            EntityKind::Mover => {
                let data = self.store.movers.get(slot.index);
                EntityDescriptor {
                    id: numeric,
                    kind: EntityKind::Mover,
                    position: data.position,
                    energy: data.energy,
                    detail: Some(MoverDetail {
                        age: data.age,
                        offspring: data.offspring,
                        generation: data.generation.0,
                        heading: data.heading,
                        skin: data.genome.skin,
                        eye: data.genome.eye,
                        speed: data.genome.speed,
                    }),
                }
            }
            EntityKind::Food => EntityDescriptor {
                id: numeric,
                kind: EntityKind::Food,
                position: self.store.food.positions[slot.index],
                energy: self.store.food.values[slot.index],
                detail: None,
            },
            EntityKind::Debris => EntityDescriptor {
                id: numeric,
                kind: EntityKind::Debris,
                position: self.store.debris[slot.index],
                energy: 0.0,
                detail: None,
            },
        })
    }

    /// Copy out everything a renderer needs for one frame.
    pub fn frame(&self) -> FrameSnapshot {
        let movers = &self.store.movers;
        let mover_sprites = self
            .store
            .mover_handles
            .iter()
            .enumerate()
            .map(|(i, id)| MoverSprite {
                id: id.data().as_ffi(),
                position: movers.positions[i],
                heading: movers.headings[i],
                skin: movers.genomes[i].skin,
                eye: movers.genomes[i].eye,
                speed: movers.genomes[i].speed,
                energy: movers.energies[i],
                selected: self.selected == Some(*id),
            })
            .collect();
        let food_sprites = self
            .store
            .food_handles
            .iter()
            .enumerate()
            .map(|(i, id)| FoodSprite {
                id: id.data().as_ffi(),
                position: self.store.food.positions[i],
                value: self.store.food.values[i],
            })
            .collect();
        FrameSnapshot {
            tick: self.tick.0,
            width: self.width,
            height: self.height,
            movers: mover_sprites,
            food: food_sprites,
            debris: self.store.debris.clone(),
        }
    }

    /// Aggregate statistics for dashboards and over-the-wire reporting.
    pub fn report(&self) -> WorldReport {
        let movers = &self.store.movers;
        let population = movers.len();
        let total_energy: f32 = movers.energies.iter().sum();
        WorldReport {
            tick: self.tick.0,
            width: self.width,
            height: self.height,
            population,
            food_items: self.store.food_handles.len(),
            debris_items: self.store.debris.len(),
            births: self.births_last_tick,
            deaths: self.deaths_last_tick,
            births_total: self.births_total,
            deaths_total: self.deaths_total,
            total_energy,
            mean_energy: if population == 0 {
                0.0
            } else {
                total_energy / population as f32
            },
            mean_age: if population == 0 {
                0.0
            } else {
                movers.ages.iter().map(|&age| age as f32).sum::<f32>() / population as f32
            },
            max_generation: movers.generations.iter().map(|g| g.0).max().unwrap_or(0),
            mean_speed: if population == 0 {
                0.0
            } else {
                movers.genomes.iter().map(|g| g.speed).sum::<f32>() / population as f32
            },
            selected: self.selected(),
        }
    }
}

/// Shared ownership of one world behind a mutex. The handle is the only
/// writer surface; clones are cheap and all funnel through the same lock.
pub type SharedWorld = Arc<Mutex<World>>;

/// Cloneable front door for driving a [`World`] from UI or network code.
#[derive(Clone)]
pub struct WorldHandle {
    world: SharedWorld,
}

impl WorldHandle {
    /// Build a world with default parameters over the given extent.
    pub fn initialise(width: f32, height: f32) -> Result<Self, WorldError> {
        let config = WorldConfig {
            world_width: width,
            world_height: height,
            ..WorldConfig::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: WorldConfig) -> Result<Self, WorldError> {
        Ok(Self {
            world: Arc::new(Mutex::new(World::new(config)?)),
        })
    }

    pub fn from_shared(world: SharedWorld) -> Self {
        Self { world }
    }

    pub fn shared(&self) -> SharedWorld {
        Arc::clone(&self.world)
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance one tick.
    pub fn tick(&self) -> TickSummary {
        self.lock().step()
    }

    pub fn reinitialise(&self, width: f32, height: f32) -> Result<(), WorldError> {
        self.lock().reinitialise(width, height)
    }

    pub fn update_config(&self, key: &str, value: ConfigValue) -> Result<(), WorldError> {
        let result = self.lock().update_config(key, value);
        if let Err(error) = &result {
            warn!(%error, key, "rejected configuration update");
        }
        result
    }

    pub fn get_config(&self) -> Result<serde_json::Value, ConfigError> {
        self.lock().config().snapshot()
    }

    pub fn get_world_data(&self) -> Result<serde_json::Value, ConfigError> {
        Ok(serde_json::to_value(self.lock().report())?)
    }

    pub fn on_click(&self, x: f32, y: f32) -> Option<EntityDescriptor> {
        self.lock().select_at(x, y)
    }

    pub fn selected(&self) -> Option<EntityDescriptor> {
        self.lock().selected()
    }

    pub fn frame(&self) -> FrameSnapshot {
        self.lock().frame()
    }

    pub fn history(&self) -> Vec<TickSummary> {
        self.lock().history().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config(seed: u64) -> WorldConfig {
        WorldConfig {
            rng_seed: Some(seed),
            debris_density: 0,
            ..WorldConfig::default()
        }
    }

    #[test]
    fn store_keeps_slots_coherent_across_swap_removal() {
        let mut store = EntityStore::default();
        let mut rng = SmallRng::seed_from_u64(1);
        let ids: Vec<EntityId> = (0..3)
            .map(|i| {
                store.spawn_mover(MoverData {
                    position: Position {
                        x: i as f32 * 10.0,
                        y: 5.0,
                    },
                    heading: 0.0,
                    energy: 1.0,
                    age: 0,
                    offspring: 0,
                    since_reproduction: 0,
                    generation: Generation(0),
                    genome: Genome::random(&mut rng),
                })
            })
            .collect();

        assert_eq!(store.remove(ids[1]), Some(EntityKind::Mover));
        assert!(!store.contains(ids[1]));
        assert_eq!(store.remove(ids[1]), None);

        // The survivor that replaced the hole still resolves correctly.
        let third = store.mover_index(ids[2]).expect("third mover alive");
        assert_eq!(store.movers.positions[third].x, 20.0);
        assert_eq!(store.position_of(ids[0]).expect("first alive").x, 0.0);
        store.debug_assert_coherent();
    }

    #[test]
    fn genome_mutation_rate_zero_is_identity() {
        let mut rng = SmallRng::seed_from_u64(2);
        let genome = Genome::random(&mut rng);
        assert_eq!(genome.mutated(0.0, &mut rng), genome);
    }

    #[test]
    fn genome_mutation_stays_within_trait_bounds() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut genome = Genome::random(&mut rng);
        for _ in 0..200 {
            genome = genome.mutated(1.0, &mut rng);
            assert!(genome.speed >= Genome::SPEED_MIN && genome.speed <= Genome::SPEED_MAX);
        }
    }

    #[test]
    fn inherited_traits_come_from_a_parent() {
        let mut rng = SmallRng::seed_from_u64(4);
        let a = Genome::random(&mut rng);
        let b = Genome::random(&mut rng);
        for _ in 0..50 {
            let child = Genome::inherit(&a, &b, &mut rng);
            for c in 0..3 {
                assert!(child.skin[c] == a.skin[c] || child.skin[c] == b.skin[c]);
                assert!(child.eye[c] == a.eye[c] || child.eye[c] == b.eye[c]);
            }
            assert!(child.speed == a.speed || child.speed == b.speed);
        }
    }

    #[test]
    fn default_config_is_valid_and_snapshots_by_field_name() {
        let config = WorldConfig::default();
        config.validate().expect("defaults validate");
        let snapshot = config.snapshot().expect("snapshot");
        assert_eq!(snapshot["food_count"], 60);
        assert_eq!(snapshot["food_respawns"], true);
        assert_eq!(snapshot["rng_seed"], serde_json::Value::Null);
    }

    #[test]
    fn apply_rejects_unknown_keys_and_wrong_types() {
        let mut config = WorldConfig::default();
        assert!(matches!(
            config.apply("gravity", ConfigValue::from(1.0)),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            config.apply("food_count", ConfigValue::from(true)),
            Err(ConfigError::WrongType { .. })
        ));
        assert!(matches!(
            config.apply("food_count", ConfigValue::from(1.5)),
            Err(ConfigError::WrongType { .. })
        ));
        assert_eq!(config, WorldConfig::default());
    }

    #[test]
    fn invalid_update_leaves_world_config_untouched() {
        let mut world = World::new(quiet_config(5)).expect("world");
        let err = world
            .update_config("mutation_rate", ConfigValue::from(2.0))
            .expect_err("out of range");
        assert!(matches!(err, WorldError::InvalidConfig(_)));
        assert_eq!(world.config().mutation_rate, 0.08);
    }

    #[test]
    fn new_world_seeds_configured_populations() {
        let config = WorldConfig {
            rng_seed: Some(6),
            ..WorldConfig::default()
        };
        let world = World::new(config).expect("world");
        assert_eq!(world.population(), 20);
        assert_eq!(world.food_items(), 60);
        // 250 * 250 / 5000
        assert_eq!(world.debris_items(), 12);
        assert_eq!(world.tick(), Tick::zero());
    }

    #[test]
    fn eating_caps_energy_and_relocates_food() {
        let config = WorldConfig {
            starting_population: 1,
            food_count: 1,
            metabolic_cost: 0.0,
            speed_cost: 0.0,
            ..quiet_config(7)
        };
        let mut world = World::new(config).expect("world");
        let food = world.store.food_handles[0];
        let mover_pos = world.store.movers.positions[0];
        world.store.set_food_position(food, mover_pos);
        world.index.update(food, mover_pos.x, mover_pos.y);

        world.store.movers.energies[0] = 1.9;
        world.step();

        assert_eq!(world.store.movers.energies[0], ENERGY_MAX);
        assert_eq!(world.food_items(), 1, "consumed food respawns elsewhere");
    }

    #[test]
    fn consumed_food_disappears_when_respawn_is_off() {
        let config = WorldConfig {
            starting_population: 1,
            food_count: 1,
            food_respawns: false,
            metabolic_cost: 0.0,
            speed_cost: 0.0,
            ..quiet_config(8)
        };
        let mut world = World::new(config).expect("world");
        let food = world.store.food_handles[0];
        let mover_pos = world.store.movers.positions[0];
        world.store.set_food_position(food, mover_pos);
        world.index.update(food, mover_pos.x, mover_pos.y);

        world.step();

        assert_eq!(world.food_items(), 0);
        assert!(!world.index.contains(food));
        assert!((world.store.movers.energies[0] - 1.6).abs() < 1e-6);
    }

    #[test]
    fn reproduction_spawns_a_next_generation_child() {
        let config = WorldConfig {
            starting_population: 1,
            max_population: 8,
            food_count: 0,
            metabolic_cost: 0.0,
            speed_cost: 0.0,
            reproduction_cooldown: 0,
            ..quiet_config(9)
        };
        let mut world = World::new(config).expect("world");
        world.store.movers.energies[0] = 2.0;

        let summary = world.step();

        assert_eq!(summary.births, 1);
        assert_eq!(world.population(), 2);
        let mut generations: Vec<u32> =
            world.store.movers.generations.iter().map(|g| g.0).collect();
        generations.sort_unstable();
        assert_eq!(generations, vec![0, 1]);
        let parent = world
            .store
            .movers
            .generations
            .iter()
            .position(|g| g.0 == 0)
            .expect("parent present");
        assert!((world.store.movers.energies[parent] - 1.3).abs() < 1e-6);
        assert_eq!(world.store.movers.offspring[parent], 1);
    }

    #[test]
    fn starved_movers_are_removed() {
        let config = WorldConfig {
            starting_population: 1,
            food_count: 0,
            metabolic_cost: 0.6,
            speed_cost: 0.0,
            ..quiet_config(10)
        };
        let mut world = World::new(config).expect("world");
        let first = world.step();
        assert_eq!(first.population, 1);
        let second = world.step();
        assert_eq!(second.deaths, 1);
        assert_eq!(second.population, 0);
    }

    #[test]
    fn max_age_expires_movers() {
        let config = WorldConfig {
            starting_population: 1,
            food_count: 0,
            metabolic_cost: 0.0,
            speed_cost: 0.0,
            max_age: 3,
            ..quiet_config(11)
        };
        let mut world = World::new(config).expect("world");
        for _ in 0..3 {
            assert_eq!(world.step().deaths, 0);
        }
        assert_eq!(world.step().deaths, 1);
        assert_eq!(world.population(), 0);
    }

    #[test]
    fn selection_hits_resolve_and_misses_clear() {
        let config = WorldConfig {
            starting_population: 0,
            food_count: 1,
            ..quiet_config(12)
        };
        let mut world = World::new(config).expect("world");
        let target = world.frame().food[0].position;

        let hit = world.select_at(target.x, target.y).expect("direct hit");
        assert_eq!(hit.kind, EntityKind::Food);
        assert!((hit.energy - 0.6).abs() < 1e-6);
        assert!(world.selected().is_some());

        let miss_x = if target.x > 125.0 {
            target.x - 20.0
        } else {
            target.x + 20.0
        };
        assert!(world.select_at(miss_x, target.y).is_none());
        assert!(world.selected().is_none());
    }

    #[test]
    fn selection_degrades_when_the_entity_dies() {
        let config = WorldConfig {
            starting_population: 1,
            food_count: 0,
            metabolic_cost: 0.6,
            speed_cost: 0.0,
            ..quiet_config(13)
        };
        let mut world = World::new(config).expect("world");
        let position = world.store.movers.positions[0];
        let picked = world.select_at(position.x, position.y).expect("mover hit");
        assert_eq!(picked.kind, EntityKind::Mover);

        world.step();
        assert!(world.selected().is_some(), "alive after one tick");
        world.step();
        assert!(world.selected().is_none(), "starved mover deselects");
    }

    #[test]
    fn report_carries_the_selected_descriptor_while_alive() {
        let config = WorldConfig {
            starting_population: 1,
            food_count: 0,
            metabolic_cost: 0.6,
            speed_cost: 0.0,
            ..quiet_config(19)
        };
        let mut world = World::new(config).expect("world");
        let position = world.store.movers.positions[0];
        world.select_at(position.x, position.y).expect("mover hit");

        let report = world.report();
        let picked = report.selected.expect("descriptor present");
        assert_eq!(picked.kind, EntityKind::Mover);
        let detail = picked.detail.expect("mover detail");
        assert_eq!(detail.offspring, 0);
        assert_eq!(detail.generation, 0);

        world.step();
        let mid = world.report();
        assert!((mid.mean_age - 1.0).abs() < 1e-6);
        assert!(mid.selected.is_some(), "alive after one tick");

        world.step();
        let last = world.report();
        assert_eq!(last.deaths, 1);
        assert_eq!(last.births, 0);
        assert!(last.selected.is_none(), "dead selection drops out");
    }

    #[test]
    fn movers_stay_inside_the_boundary() {
        let config = WorldConfig {
            world_width: 30.0,
            world_height: 30.0,
            starting_population: 8,
            max_population: 8,
            food_count: 4,
            metabolic_cost: 0.0,
            speed_cost: 0.0,
            ..quiet_config(14)
        };
        let mut world = World::new(config).expect("world");
        for _ in 0..200 {
            world.step();
            for sprite in world.frame().movers {
                assert!(
                    (0.0..=30.0).contains(&sprite.position.x)
                        && (0.0..=30.0).contains(&sprite.position.y),
                    "mover escaped to {:?}",
                    sprite.position
                );
            }
        }
    }

    #[test]
    fn cell_size_change_rebuilds_a_working_index() {
        let mut world = World::new(quiet_config(15)).expect("world");
        world
            .update_config("cell_size", ConfigValue::from(5.0))
            .expect("rebuild");
        assert_eq!(world.index.len(), world.population() + world.food_items());

        let position = world.store.movers.positions[0];
        let hit = world.select_at(position.x, position.y).expect("hit");
        assert_eq!(hit.kind, EntityKind::Mover);

        let err = world
            .update_config("cell_size", ConfigValue::from(-1.0))
            .expect_err("negative cell");
        assert!(matches!(err, WorldError::InvalidConfig(_)));
        assert_eq!(world.config().cell_size, 5.0);
    }

    #[test]
    fn reinitialise_reseeds_over_the_new_extent() {
        let mut world = World::new(quiet_config(16)).expect("world");
        for _ in 0..10 {
            world.step();
        }
        world.reinitialise(300.0, 200.0).expect("reinit");
        assert_eq!(world.tick(), Tick::zero());
        assert_eq!(world.population(), 20);
        assert_eq!(world.history().count(), 0);
        let frame = world.frame();
        assert_eq!(frame.width, 300.0);
        assert_eq!(frame.height, 200.0);
    }

    #[test]
    fn warmup_runs_then_resets_the_clock() {
        let config = WorldConfig {
            warmup_ticks: 25,
            ..quiet_config(17)
        };
        let world = World::new(config).expect("world");
        assert_eq!(world.tick(), Tick::zero());
        assert_eq!(world.history().count(), 0);
        let ages: u32 = world.store.movers.ages.iter().copied().max().unwrap_or(0);
        assert!(ages >= 25, "warm-up actually aged the population");
    }

    #[test]
    fn handle_drives_the_world_through_the_lock() {
        let config = quiet_config(18);
        let handle = WorldHandle::with_config(config).expect("handle");
        let first = handle.tick();
        assert_eq!(first.tick, Tick(0));

        let config_json = handle.get_config().expect("config json");
        assert_eq!(config_json["food_count"], 60);

        let data = handle.get_world_data().expect("world data");
        assert_eq!(data["population"], 20);

        let twin = handle.clone();
        twin.tick();
        assert_eq!(handle.history().len(), 2);

        handle
            .update_config("nonsense", ConfigValue::from(1.0))
            .expect_err("unknown key is rejected");
    }
}
