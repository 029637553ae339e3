//! Survival leaderboard, updated in lockstep with the world

use std::collections::HashMap;

use uuid::Uuid;

use crate::ws::protocol::{LeaderboardEntry, ShipSnapshot};

#[derive(Debug, Clone)]
struct Entry {
    ship_id: Uuid,
    name: String,
    steps: u64,
    alive: bool,
}

/// One entry per ship in the world. Entries go when their ship is pruned.
#[derive(Debug, Default)]
pub struct Leaderboard {
    /// Creation order
    entries: Vec<Entry>,
}

impl Leaderboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn entry_mut(&mut self, ship_id: Uuid) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.ship_id == ship_id)
    }

    pub fn register(&mut self, ship_id: Uuid, name: String) {
        if self.entries.iter().any(|e| e.ship_id == ship_id) {
            return;
        }
        self.entries.push(Entry {
            ship_id,
            name,
            steps: 0,
            alive: true,
        });
    }

    /// Fold the latest world snapshot into the standings.
    ///
    /// Steps only grow while an entry is live; dead or retired entries never move.
    pub fn update(&mut self, ships: &[ShipSnapshot]) {
        let by_id: HashMap<Uuid, &ShipSnapshot> = ships.iter().map(|s| (s.id, s)).collect();

        for entry in self.entries.iter_mut().filter(|e| e.alive) {
            let Some(ship) = by_id.get(&entry.ship_id) else {
                continue;
            };
            entry.steps = entry.steps.max(ship.survived_ticks);
            if !ship.alive {
                entry.alive = false;
            }
        }
    }

    /// Mark an entry done without a termination, e.g. when its owner lets go
    pub fn retire(&mut self, ship_id: Uuid) {
        if let Some(entry) = self.entry_mut(ship_id) {
            entry.alive = false;
        }
    }

    pub fn rename(&mut self, ship_id: Uuid, name: &str) {
        if let Some(entry) = self.entry_mut(ship_id) {
            entry.name = name.to_string();
        }
    }

    /// Drop an entry whose ship left the world
    pub fn remove(&mut self, ship_id: Uuid) {
        self.entries.retain(|e| e.ship_id != ship_id);
    }

    /// Most steps first, ties broken by creation order
    pub fn standings(&self) -> Vec<LeaderboardEntry> {
        let mut ranked: Vec<&Entry> = self.entries.iter().collect();
        ranked.sort_by(|a, b| b.steps.cmp(&a.steps));
        ranked
            .into_iter()
            .map(|e| LeaderboardEntry {
                id: e.ship_id,
                name: e.name.clone(),
                steps: e.steps,
                alive: e.alive,
            })
            .collect()
    }
}
