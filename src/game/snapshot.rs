//! Snapshot building and trail history

use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::ws::protocol::{ServerMsg, ShipSnapshot, StateUpdate};

use super::leaderboard::Leaderboard;

/// Builds `state_update` messages and keeps a bounded position trail per ship
pub struct SnapshotBuilder {
    /// Positions kept per ship
    trail_length: usize,
    trails: HashMap<Uuid, VecDeque<[f64; 2]>>,
    stats: SnapshotStats,
}

impl SnapshotBuilder {
    pub fn new(trail_length: usize) -> Self {
        Self {
            trail_length,
            trails: HashMap::new(),
            stats: SnapshotStats::default(),
        }
    }

    pub fn stats(&self) -> &SnapshotStats {
        &self.stats
    }

    /// Append this tick's positions. Dead ships stop growing their trail.
    pub fn record_positions(&mut self, ships: &[ShipSnapshot]) {
        if self.trail_length == 0 {
            return;
        }
        for ship in ships.iter().filter(|s| s.alive) {
            let trail = self.trails.entry(ship.id).or_default();
            if trail.len() == self.trail_length {
                trail.pop_front();
            }
            trail.push_back([ship.x, ship.y]);
        }
    }

    /// Drop trails of ships that left the world
    pub fn forget(&mut self, ship_id: &Uuid) {
        self.trails.remove(ship_id);
    }

    /// Build a snapshot message
    pub fn build(&self, tick: u64, ships: Vec<ShipSnapshot>, leaderboard: &Leaderboard) -> ServerMsg {
        let trails = ships
            .iter()
            .filter_map(|s| {
                self.trails
                    .get(&s.id)
                    .map(|t| (s.id, t.iter().copied().collect()))
            })
            .collect();

        ServerMsg::StateUpdate(StateUpdate {
            tick,
            ships,
            leaderboard: leaderboard.standings(),
            trails,
        })
    }

    pub fn record_sent(&mut self, ship_count: usize, bytes: usize) {
        self.stats.record(ship_count, bytes);
    }
}

/// Snapshot size stats for debugging
#[derive(Debug, Default)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_ships_per_snapshot: f32,
}

impl SnapshotStats {
    pub fn record(&mut self, ship_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_ships_per_snapshot =
            self.avg_ships_per_snapshot * ((n - 1.0) / n) + (ship_count as f32 / n);
    }
}
