//! Multi-ship world: owns every ship and advances them in lockstep

use std::collections::HashMap;
use std::f64::consts::TAU;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use crate::ws::protocol::ShipSnapshot;

use super::physics::{Action, Kinematics, OrbitalParams, PhysicsSystem, Termination};

/// Authoritative state of one ship
#[derive(Debug, Clone)]
pub struct Ship {
    pub id: Uuid,
    pub name: String,
    pub kinematics: Kinematics,
    /// Orbit radius the ship was spawned on
    pub initial_radius: f64,
    pub alive: bool,
    /// Ticks survived so far; frozen once the ship terminates
    pub survived_ticks: u64,
    /// Owning session, `None` once released
    pub owner: Option<Uuid>,
    pub termination: Option<Termination>,
    /// World tick at which the owner let go of this ship
    pub released_at: Option<u64>,
}

impl Ship {
    pub fn snapshot(&self) -> ShipSnapshot {
        ShipSnapshot {
            id: self.id,
            name: self.name.clone(),
            x: self.kinematics.x,
            y: self.kinematics.y,
            vx: self.kinematics.vx,
            vy: self.kinematics.vy,
            heading: self.kinematics.heading,
            alive: self.alive,
            survived_ticks: self.survived_ticks,
            owned: self.owner.is_some(),
            cause: self.termination,
        }
    }
}

/// A ship that stopped flying during a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationEvent {
    pub ship_id: Uuid,
    pub cause: Termination,
}

/// The set of all ships plus the central-body parameters and tick counter
pub struct World {
    params: OrbitalParams,
    spawn_radius: f64,
    /// Ships in spawn order
    ships: Vec<Ship>,
    tick: u64,
    rng: ChaCha8Rng,
}

impl World {
    pub fn new(params: OrbitalParams, spawn_radius: f64, seed: u64) -> Self {
        Self {
            params,
            spawn_radius,
            ships: Vec::new(),
            tick: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn params(&self) -> &OrbitalParams {
        &self.params
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn len(&self) -> usize {
        self.ships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ships.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.ships.iter().filter(|s| s.alive).count()
    }

    pub fn ship(&self, id: Uuid) -> Option<&Ship> {
        self.ships.iter().find(|s| s.id == id)
    }

    fn ship_mut(&mut self, id: Uuid) -> Option<&mut Ship> {
        self.ships.iter_mut().find(|s| s.id == id)
    }

    /// Spawn a ship on a circular orbit at the configured radius.
    ///
    /// Every ship gets the same radius and speed; only the phase angle varies,
    /// so late joiners start on an orbit identical to everyone else's.
    pub fn spawn_ship(&mut self, owner: Uuid, name: String) -> Uuid {
        let phase = self.rng.gen_range(0.0..TAU);
        let ship = Ship {
            id: Uuid::new_v4(),
            name,
            kinematics: Kinematics::circular_orbit(self.spawn_radius, phase, self.params.gm),
            initial_radius: self.spawn_radius,
            alive: true,
            survived_ticks: 0,
            owner: Some(owner),
            termination: None,
            released_at: None,
        };
        let id = ship.id;
        self.ships.push(ship);
        id
    }

    pub fn rename_ship(&mut self, id: Uuid, name: &str) -> bool {
        match self.ship_mut(id) {
            Some(ship) => {
                ship.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Detach a ship from its owner. It keeps coasting until pruned.
    pub fn release_ship(&mut self, id: Uuid) -> bool {
        let tick = self.tick;
        match self.ship_mut(id) {
            Some(ship) if ship.owner.is_some() => {
                ship.owner = None;
                ship.released_at = Some(tick);
                true
            }
            _ => false,
        }
    }

    /// Drop released ships that have lingered for `linger_ticks`. Returns their ids.
    pub fn prune_released(&mut self, linger_ticks: u64) -> Vec<Uuid> {
        let tick = self.tick;
        let mut removed = Vec::new();
        self.ships.retain(|ship| match ship.released_at {
            Some(at) if ship.owner.is_none() && tick.saturating_sub(at) >= linger_ticks => {
                removed.push(ship.id);
                false
            }
            _ => true,
        });
        removed
    }

    /// Advance every live ship by one tick.
    ///
    /// Ships without an entry in `actions` coast with [`Action::NEUTRAL`].
    /// Dead ships are left untouched.
    pub fn step(&mut self, actions: &HashMap<Uuid, Action>) -> Vec<TerminationEvent> {
        self.tick += 1;
        let params = self.params;
        let mut events = Vec::new();

        for ship in self.ships.iter_mut().filter(|s| s.alive) {
            let action = actions.get(&ship.id).copied().unwrap_or(Action::NEUTRAL);
            ship.kinematics = PhysicsSystem::step(&ship.kinematics, action, &params);
            ship.survived_ticks += 1;

            if let Some(cause) = PhysicsSystem::check_termination(&ship.kinematics, &params) {
                ship.alive = false;
                ship.termination = Some(cause);
                events.push(TerminationEvent {
                    ship_id: ship.id,
                    cause,
                });
            }
        }

        events
    }

    /// Public state of every ship, in spawn order
    pub fn snapshot(&self) -> Vec<ShipSnapshot> {
        self.ships.iter().map(Ship::snapshot).collect()
    }
}
