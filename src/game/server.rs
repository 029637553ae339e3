//! Tick coordinator: the authoritative fixed-rate loop

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::util::time::{unix_secs_f64, Timer};
use crate::ws::protocol::{ControlMode, ServerMsg, ShipSnapshot};

use super::leaderboard::Leaderboard;
use super::physics::Action;
use super::policy::Policy;
use super::session::SessionRegistry;
use super::snapshot::SnapshotBuilder;
use super::world::World;
use super::Frame;

/// Depth of the connection -> coordinator queue
const INBOUND_QUEUE: usize = 1024;
/// Broadcast frames buffered per receiver before it starts lagging
const BROADCAST_QUEUE: usize = 64;

/// Requests from connection tasks, applied at the start of the next tick
#[derive(Debug)]
pub enum Inbound {
    Connected {
        session_id: Uuid,
        outbound: mpsc::Sender<Frame>,
    },
    JoinMode {
        session_id: Uuid,
        mode: ControlMode,
        name: Option<String>,
    },
    ManualAction {
        session_id: Uuid,
        action: Action,
    },
    CancelControl {
        session_id: Uuid,
    },
    /// Upload decoded and validated on the connection task
    PolicyLoaded {
        session_id: Uuid,
        policy: Box<Policy>,
    },
    /// Upload rejected on the connection task
    PolicyRejected {
        session_id: Uuid,
        error: String,
    },
    Disconnected {
        session_id: Uuid,
    },
}

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// No sessions and no ships; ticks are skipped
    Idle,
    Running,
    /// Shutdown requested; no further steps
    Draining,
}

/// Read-only view of the coordinator for connection handlers and HTTP routes
#[derive(Debug)]
pub struct ServerStatus {
    tick: AtomicU64,
    connections: AtomicUsize,
    ships: AtomicUsize,
    state: RwLock<CoordinatorState>,
    latest_snapshot: RwLock<Option<Frame>>,
}

impl ServerStatus {
    fn new() -> Self {
        Self {
            tick: AtomicU64::new(0),
            connections: AtomicUsize::new(0),
            ships: AtomicUsize::new(0),
            state: RwLock::new(CoordinatorState::Idle),
            latest_snapshot: RwLock::new(None),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn ships(&self) -> usize {
        self.ships.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    /// Most recent encoded `state_update`, if any has been broadcast
    pub fn latest_snapshot(&self) -> Option<Frame> {
        self.latest_snapshot.read().clone()
    }
}

/// Cloneable handle used by connection tasks
#[derive(Clone)]
pub struct ServerHandle {
    inbound_tx: mpsc::Sender<Inbound>,
    frames_tx: broadcast::Sender<Frame>,
    status: Arc<ServerStatus>,
}

impl ServerHandle {
    /// Queue a request for the next tick. Returns false once the coordinator is gone.
    pub async fn send(&self, inbound: Inbound) -> bool {
        self.inbound_tx.send(inbound).await.is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.frames_tx.subscribe()
    }

    pub fn status(&self) -> &Arc<ServerStatus> {
        &self.status
    }
}

/// The authoritative simulation. Owns the world, sessions and leaderboard exclusively.
pub struct TickCoordinator {
    config: GameConfig,
    world: World,
    sessions: SessionRegistry,
    leaderboard: Leaderboard,
    snapshots: SnapshotBuilder,
    inbound_rx: mpsc::Receiver<Inbound>,
    frames_tx: broadcast::Sender<Frame>,
    status: Arc<ServerStatus>,
    state: CoordinatorState,
    /// Sessions whose direct channel closed; removed on the next tick
    closed: Vec<Uuid>,
}

impl TickCoordinator {
    pub fn new(config: GameConfig) -> (Self, ServerHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (frames_tx, _) = broadcast::channel(BROADCAST_QUEUE);
        let status = Arc::new(ServerStatus::new());

        let handle = ServerHandle {
            inbound_tx,
            frames_tx: frames_tx.clone(),
            status: status.clone(),
        };

        let seed = config.world_seed.unwrap_or_else(rand::random);
        let coordinator = Self {
            world: World::new(config.orbital_params(), config.spawn_radius, seed),
            sessions: SessionRegistry::new(),
            leaderboard: Leaderboard::new(),
            snapshots: SnapshotBuilder::new(config.trail_length),
            inbound_rx,
            frames_tx,
            status,
            state: CoordinatorState::Idle,
            closed: Vec::new(),
            config,
        };

        (coordinator, handle)
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Run the fixed-rate loop until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_rate = self.config.tick_rate,
            spawn_radius = self.config.spawn_radius,
            "Tick coordinator started"
        );

        let mut tick_interval = interval(self.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain();
    }

    /// Run one tick. Returns the broadcast tick number, or `None` when idle or draining.
    pub fn tick(&mut self) -> Option<u64> {
        if self.state == CoordinatorState::Draining {
            return None;
        }

        let timer = Timer::new();

        self.process_inbound();
        self.update_state();
        if self.state == CoordinatorState::Idle {
            return None;
        }

        let actions = self.collect_actions();
        let events = self.world.step(&actions);
        let tick = self.world.tick();

        for event in &events {
            info!(
                tick,
                ship_id = %event.ship_id,
                cause = event.cause.as_str(),
                "Ship terminated"
            );
        }

        let ships = self.world.snapshot();
        self.leaderboard.update(&ships);
        self.snapshots.record_positions(&ships);
        self.broadcast_snapshot(ships);
        self.request_manual_actions();
        self.prune_released();
        self.publish_status();

        let elapsed = timer.elapsed();
        if elapsed > self.config.tick_duration() {
            warn!(tick, elapsed_us = elapsed.as_micros() as u64, "Tick overran its budget");
        } else {
            debug!(
                tick,
                elapsed_us = timer.elapsed_micros(),
                ships = self.world.len(),
                alive = self.world.alive_count(),
                "Tick"
            );
        }

        Some(tick)
    }

    /// Stop stepping and emit one last snapshot
    pub fn drain(&mut self) {
        if self.state == CoordinatorState::Draining {
            return;
        }
        self.set_state(CoordinatorState::Draining);

        let ships = self.world.snapshot();
        self.broadcast_snapshot(ships);
        self.publish_status();

        let stats = self.snapshots.stats();
        info!(
            tick = self.world.tick(),
            sessions = self.sessions.len(),
            snapshots_sent = stats.total_snapshots,
            bytes_sent = stats.total_bytes,
            avg_ships = stats.avg_ships_per_snapshot,
            "Tick coordinator drained"
        );
    }

    /// Apply every request queued since the previous tick
    fn process_inbound(&mut self) {
        for session_id in std::mem::take(&mut self.closed) {
            self.disconnect(session_id);
        }

        while let Ok(inbound) = self.inbound_rx.try_recv() {
            self.handle_inbound(inbound);
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Connected {
                session_id,
                outbound,
            } => match self.sessions.connect(session_id, outbound) {
                Ok(()) => info!(session_id = %session_id, "Session connected"),
                Err(e) => warn!(session_id = %session_id, error = %e, "Duplicate connection"),
            },
            Inbound::JoinMode {
                session_id,
                mode,
                name,
            } => self.change_mode(session_id, mode, name),
            Inbound::CancelControl { session_id } => {
                self.change_mode(session_id, ControlMode::Observer, None)
            }
            Inbound::ManualAction { session_id, action } => {
                if let Err(e) = self.sessions.record_manual_action(session_id, action) {
                    self.send_direct(session_id, &ServerMsg::error(e.code(), e.to_string()));
                }
            }
            Inbound::PolicyLoaded { session_id, policy } => {
                let response = match self.sessions.install_policy(session_id, *policy) {
                    Ok(()) => {
                        info!(session_id = %session_id, "Policy installed");
                        ServerMsg::ModelUploadResponse {
                            success: true,
                            error: None,
                        }
                    }
                    Err(e) => ServerMsg::ModelUploadResponse {
                        success: false,
                        error: Some(e.to_string()),
                    },
                };
                self.send_direct(session_id, &response);
            }
            Inbound::PolicyRejected { session_id, error } => {
                warn!(session_id = %session_id, error = %error, "Policy upload rejected");
                self.send_direct(
                    session_id,
                    &ServerMsg::ModelUploadResponse {
                        success: false,
                        error: Some(error),
                    },
                );
            }
            Inbound::Disconnected { session_id } => self.disconnect(session_id),
        }
    }

    fn change_mode(&mut self, session_id: Uuid, mode: ControlMode, name: Option<String>) {
        let result = self.sessions.set_mode(
            session_id,
            mode,
            name,
            &mut self.world,
            &mut self.leaderboard,
        );

        match result {
            Ok(change) => {
                info!(
                    session_id = %session_id,
                    mode = ?change.mode,
                    ship_id = ?change.ship_id,
                    spawned = change.spawned,
                    "Control mode changed"
                );
                self.send_direct(
                    session_id,
                    &ServerMsg::ModeConfirmed {
                        mode: change.mode,
                        ship_id: change.ship_id,
                    },
                );
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Mode change rejected");
                self.send_direct(session_id, &ServerMsg::error(e.code(), e.to_string()));
            }
        }
    }

    fn disconnect(&mut self, session_id: Uuid) {
        let removed = self
            .sessions
            .remove(session_id, &mut self.world, &mut self.leaderboard);
        if let Some(session) = removed {
            info!(
                session_id = %session_id,
                mode = ?session.mode,
                "Session disconnected"
            );
        }
    }

    fn update_state(&mut self) {
        let next = if self.sessions.is_empty() && self.world.is_empty() {
            CoordinatorState::Idle
        } else {
            CoordinatorState::Running
        };
        if next != self.state {
            self.set_state(next);
        }
    }

    fn set_state(&mut self, next: CoordinatorState) {
        info!(from = ?self.state, to = ?next, "Coordinator state change");
        self.state = next;
        *self.status.state.write() = next;
    }

    /// One action per controlled live ship; anything missing coasts on neutral
    fn collect_actions(&mut self) -> HashMap<Uuid, Action> {
        let params = *self.world.params();
        let target_radius = self.config.target_radius;
        let mut actions = HashMap::new();

        for session in self.sessions.iter_mut() {
            let Some(ship_id) = session.ship_id else {
                continue;
            };
            let Some(ship) = self.world.ship(ship_id).filter(|s| s.alive) else {
                continue;
            };

            match session.next_action(ship, &params, target_radius) {
                Ok(Some(action)) => {
                    actions.insert(ship_id, action);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        session_id = %session.id,
                        ship_id = %ship_id,
                        error = %e,
                        "Inference failed, coasting this tick"
                    );
                }
            }
        }

        actions
    }

    fn broadcast_snapshot(&mut self, ships: Vec<ShipSnapshot>) {
        let tick = self.world.tick();
        let ship_count = ships.len();
        let msg = self.snapshots.build(tick, ships, &self.leaderboard);

        match msg.encode(tick, unix_secs_f64()) {
            Ok(text) => {
                self.snapshots.record_sent(ship_count, text.len());
                let frame: Frame = Arc::from(text);
                *self.status.latest_snapshot.write() = Some(frame.clone());
                // No receivers is fine
                let _ = self.frames_tx.send(frame);
            }
            Err(e) => error!(tick, error = %e, "Failed to encode snapshot"),
        }
    }

    fn request_manual_actions(&mut self) {
        let world = &self.world;
        let targets: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.mode == ControlMode::Manual)
            .filter(|s| {
                s.ship_id
                    .and_then(|id| world.ship(id))
                    .is_some_and(|ship| ship.alive)
            })
            .map(|s| s.id)
            .collect();

        if targets.is_empty() {
            return;
        }

        let request = ServerMsg::ActionRequest {};
        match request.encode(self.world.tick(), unix_secs_f64()) {
            Ok(text) => {
                let frame: Frame = Arc::from(text);
                for session_id in targets {
                    self.deliver(session_id, frame.clone());
                }
            }
            Err(e) => error!(error = %e, "Failed to encode action request"),
        }
    }

    fn prune_released(&mut self) {
        for ship_id in self.world.prune_released(self.config.orphan_linger_ticks) {
            self.leaderboard.remove(ship_id);
            self.snapshots.forget(&ship_id);
            debug!(ship_id = %ship_id, "Released ship removed");
        }
    }

    fn publish_status(&self) {
        self.status.tick.store(self.world.tick(), Ordering::Relaxed);
        self.status
            .connections
            .store(self.sessions.len(), Ordering::Relaxed);
        self.status.ships.store(self.world.len(), Ordering::Relaxed);
    }

    fn send_direct(&mut self, session_id: Uuid, msg: &ServerMsg) {
        match msg.encode(self.world.tick(), unix_secs_f64()) {
            Ok(text) => self.deliver(session_id, Arc::from(text)),
            Err(e) => error!(session_id = %session_id, error = %e, "Failed to encode message"),
        }
    }

    /// Never waits: a full queue drops the frame, a closed one schedules removal
    fn deliver(&mut self, session_id: Uuid, frame: Frame) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };

        match session.outbound().try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %session_id, "Client queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %session_id, "Client queue closed");
                if !self.closed.contains(&session_id) {
                    self.closed.push(session_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::policy::tests::linear_artifact;
    use serde_json::Value;
    use std::time::Duration;

    fn config() -> GameConfig {
        GameConfig {
            world_seed: Some(11),
            orphan_linger_ticks: 5,
            ..GameConfig::default()
        }
    }

    fn parse(frame: &Frame) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    fn drain_direct(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(parse(&frame));
        }
        out
    }

    fn last_broadcast(rx: &mut broadcast::Receiver<Frame>) -> Option<Value> {
        let mut last = None;
        loop {
            match rx.try_recv() {
                Ok(frame) => last = Some(parse(&frame)),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        last
    }

    fn connect(handle: &ServerHandle) -> (Uuid, mpsc::Receiver<Frame>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        handle
            .inbound_tx
            .try_send(Inbound::Connected {
                session_id,
                outbound: tx,
            })
            .unwrap();
        (session_id, rx)
    }

    fn join(handle: &ServerHandle, session_id: Uuid, mode: ControlMode) {
        handle
            .inbound_tx
            .try_send(Inbound::JoinMode {
                session_id,
                mode,
                name: None,
            })
            .unwrap();
    }

    fn ship_id_from(messages: &[Value]) -> Uuid {
        let confirmed = messages
            .iter()
            .find(|m| m["header"]["type"] == "mode_confirmed")
            .expect("no mode_confirmed");
        confirmed["payload"]["ship_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn idle_until_someone_connects() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let mut frames = handle.subscribe();

        assert_eq!(coordinator.tick(), None);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert!(frames.try_recv().is_err());

        let (_id, _rx) = connect(&handle);
        assert_eq!(coordinator.tick(), Some(1));
        assert_eq!(coordinator.state(), CoordinatorState::Running);
        assert_eq!(handle.status().state(), CoordinatorState::Running);
        assert_eq!(handle.status().connections(), 1);
    }

    #[test]
    fn broadcast_tick_increases_by_one() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let mut frames = handle.subscribe();
        let (_observer, _rx) = connect(&handle);

        let mut previous = None;
        for _ in 0..20 {
            coordinator.tick();
            let frame = parse(&frames.try_recv().unwrap());
            assert_eq!(frame["header"]["type"], "state_update");
            let tick = frame["payload"]["tick"].as_u64().unwrap();
            assert_eq!(frame["header"]["tick"].as_u64().unwrap(), tick);
            if let Some(prev) = previous {
                assert_eq!(tick, prev + 1);
            }
            previous = Some(tick);
        }
        assert_eq!(handle.status().tick(), 20);
        assert!(handle.status().latest_snapshot().is_some());
    }

    #[test]
    fn simultaneous_joins_get_distinct_ships() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let mut clients: Vec<(Uuid, mpsc::Receiver<Frame>, ControlMode)> = (0..8)
            .map(|i| {
                let (id, rx) = connect(&handle);
                let mode = if i % 2 == 0 {
                    ControlMode::Manual
                } else {
                    ControlMode::Model
                };
                (id, rx, mode)
            })
            .collect();
        for (id, _, mode) in &clients {
            join(&handle, *id, *mode);
        }

        coordinator.tick();

        let mut ships = std::collections::HashSet::new();
        for (_, rx, mode) in clients.iter_mut() {
            let messages = drain_direct(rx);
            let confirmed = messages
                .iter()
                .find(|m| m["header"]["type"] == "mode_confirmed")
                .unwrap();
            let expected = serde_json::to_value(*mode).unwrap();
            assert_eq!(confirmed["payload"]["mode"], expected);
            assert!(ships.insert(ship_id_from(&messages)));
        }
        assert_eq!(handle.status().ships(), 8);
    }

    #[test]
    fn manual_pilots_are_prompted_every_tick() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let (pilot, mut pilot_rx) = connect(&handle);
        let (_observer, mut observer_rx) = connect(&handle);
        join(&handle, pilot, ControlMode::Manual);

        for _ in 0..3 {
            coordinator.tick();
        }

        let prompts = drain_direct(&mut pilot_rx)
            .into_iter()
            .filter(|m| m["header"]["type"] == "action_request")
            .count();
        assert_eq!(prompts, 3);
        assert!(drain_direct(&mut observer_rx).is_empty());
    }

    #[test]
    fn latest_manual_input_wins_then_ship_coasts() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let (pilot, mut rx) = connect(&handle);
        join(&handle, pilot, ControlMode::Manual);
        coordinator.tick();
        let ship_id = ship_id_from(&drain_direct(&mut rx));
        let heading_before = coordinator.world.ship(ship_id).unwrap().kinematics.heading;

        for turn in [60.0, -60.0, 6.0] {
            handle
                .inbound_tx
                .try_send(Inbound::ManualAction {
                    session_id: pilot,
                    action: Action::Steer { turn, thrust: 0.0 },
                })
                .unwrap();
        }
        coordinator.tick();
        let heading_after = coordinator.world.ship(ship_id).unwrap().kinematics.heading;
        let turned = (heading_after - heading_before).rem_euclid(std::f64::consts::TAU);
        assert!((turned - 0.1).abs() < 1e-9);

        // Nothing new arrives: heading holds, ship keeps flying
        for _ in 0..30 {
            coordinator.tick();
        }
        let ship = coordinator.world.ship(ship_id).unwrap();
        assert!((ship.kinematics.heading - heading_after).abs() < 1e-12);
        assert!(ship.alive);
        assert_eq!(ship.survived_ticks, 32);
    }

    #[test]
    fn disconnected_ship_keeps_coasting_then_is_pruned() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let mut frames = handle.subscribe();
        let (pilot, mut rx) = connect(&handle);
        let (_observer, _observer_rx) = connect(&handle);
        join(&handle, pilot, ControlMode::Manual);
        coordinator.tick();
        let ship_id = ship_id_from(&drain_direct(&mut rx));

        handle
            .inbound_tx
            .try_send(Inbound::Disconnected { session_id: pilot })
            .unwrap();
        let before = coordinator.world.ship(ship_id).unwrap().kinematics;
        coordinator.tick();

        let update = last_broadcast(&mut frames).unwrap();
        let ship = update["payload"]["ships"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["id"] == ship_id.to_string())
            .cloned()
            .expect("ship vanished right after disconnect");
        assert_eq!(ship["alive"], true);
        assert_eq!(ship["owned"], false);
        assert_ne!(ship["x"].as_f64().unwrap(), before.x);
        assert!(coordinator.sessions.iter().all(|s| s.ship_id != Some(ship_id)));

        let entry_of = |update: &Value| {
            update["payload"]["leaderboard"]
                .as_array()
                .unwrap()
                .iter()
                .find(|e| e["id"] == ship_id.to_string())
                .cloned()
        };

        // Done as soon as the owner leaves; coasting earns nothing
        let entry = entry_of(&update).expect("leaderboard row missing after disconnect");
        assert_eq!(entry["alive"], false);
        assert_eq!(entry["steps"], 1);

        for _ in 0..3 {
            coordinator.tick();
            let update = last_broadcast(&mut frames).unwrap();
            let entry = entry_of(&update).unwrap();
            assert_eq!(entry["steps"], 1);
            assert_eq!(entry["alive"], false);
        }

        for _ in 0..2 {
            coordinator.tick();
        }
        assert!(coordinator.world.ship(ship_id).is_none());

        let update = last_broadcast(&mut frames).unwrap();
        assert!(entry_of(&update).is_none());
        assert!(update["payload"]["trails"].get(ship_id.to_string()).is_none());
    }

    #[test]
    fn join_cancel_churn_keeps_leaderboard_bounded() {
        let (mut coordinator, handle) = TickCoordinator::new(GameConfig {
            orphan_linger_ticks: 1,
            ..config()
        });
        let mut frames = handle.subscribe();
        let (pilot, _rx) = connect(&handle);

        for _ in 0..200 {
            join(&handle, pilot, ControlMode::Manual);
            handle
                .inbound_tx
                .try_send(Inbound::CancelControl { session_id: pilot })
                .unwrap();
            coordinator.tick();
            assert!(coordinator.leaderboard.len() <= 1);
        }

        coordinator.tick();
        assert_eq!(coordinator.world.len(), 0);
        assert_eq!(coordinator.leaderboard.len(), 0);
        let update = last_broadcast(&mut frames).unwrap();
        assert!(update["payload"]["leaderboard"].as_array().unwrap().is_empty());
        assert!(update["payload"]["ships"].as_array().unwrap().is_empty());
    }

    #[test]
    fn rename_while_flying_reaches_ship_and_leaderboard() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let mut frames = handle.subscribe();
        let (pilot, _rx) = connect(&handle);
        join(&handle, pilot, ControlMode::Manual);
        coordinator.tick();

        handle
            .inbound_tx
            .try_send(Inbound::JoinMode {
                session_id: pilot,
                mode: ControlMode::Model,
                name: Some("Vostok".into()),
            })
            .unwrap();
        coordinator.tick();

        let update = last_broadcast(&mut frames).unwrap();
        let ships = update["payload"]["ships"].as_array().unwrap();
        assert_eq!(ships.len(), 1);
        assert_eq!(ships[0]["name"], "Vostok");
        assert_eq!(update["payload"]["leaderboard"][0]["name"], "Vostok");
    }

    #[test]
    fn rejected_upload_leaves_mode_unchanged() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let (pilot, mut rx) = connect(&handle);
        join(&handle, pilot, ControlMode::Manual);
        coordinator.tick();
        drain_direct(&mut rx);

        handle
            .inbound_tx
            .try_send(Inbound::PolicyRejected {
                session_id: pilot,
                error: "model is not valid base64".into(),
            })
            .unwrap();
        coordinator.tick();

        let messages = drain_direct(&mut rx);
        let response = messages
            .iter()
            .find(|m| m["header"]["type"] == "model_upload_response")
            .unwrap();
        assert_eq!(response["payload"]["success"], false);
        assert!(response["payload"]["error"].is_string());

        let session = coordinator.sessions.get(pilot).unwrap();
        assert_eq!(session.mode, ControlMode::Manual);
        assert!(!session.has_policy());
    }

    #[test]
    fn model_ship_follows_its_policy() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let (driver, mut rx) = connect(&handle);
        join(&handle, driver, ControlMode::Model);

        // Constant full prograde thrust
        let policy = Policy::load(linear_artifact(0, 0.0, 1.0).to_string().as_bytes()).unwrap();
        handle
            .inbound_tx
            .try_send(Inbound::PolicyLoaded {
                session_id: driver,
                policy: Box::new(policy),
            })
            .unwrap();
        coordinator.tick();

        let messages = drain_direct(&mut rx);
        let ship_id = ship_id_from(&messages);
        assert!(messages
            .iter()
            .any(|m| m["header"]["type"] == "model_upload_response"
                && m["payload"]["success"] == true));

        let mut escaped = false;
        for _ in 0..600 {
            coordinator.tick();
            if !coordinator.world.ship(ship_id).unwrap().alive {
                escaped = true;
                break;
            }
        }
        assert!(escaped, "constant prograde thrust should leave the arena");
    }

    #[test]
    fn failing_policy_coasts_without_stalling_others() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let (broken, mut broken_rx) = connect(&handle);
        let (pilot, mut pilot_rx) = connect(&handle);
        join(&handle, broken, ControlMode::Model);
        join(&handle, pilot, ControlMode::Manual);

        // Overflows to infinity on a circular orbit at radius 2
        let mut artifact = linear_artifact(2, 1e308, 0.0);
        artifact["layers"][0]["weights"][0][6] = serde_json::json!(1e308);
        let policy = Policy::load(artifact.to_string().as_bytes()).unwrap();
        handle
            .inbound_tx
            .try_send(Inbound::PolicyLoaded {
                session_id: broken,
                policy: Box::new(policy),
            })
            .unwrap();

        for _ in 0..60 {
            assert!(coordinator.tick().is_some());
        }

        let broken_ship = ship_id_from(&drain_direct(&mut broken_rx));
        let pilot_ship = ship_id_from(&drain_direct(&mut pilot_rx));
        for id in [broken_ship, pilot_ship] {
            let ship = coordinator.world.ship(id).unwrap();
            assert!(ship.alive);
            assert!((ship.kinematics.radius() - 2.0).abs() < 0.01);
        }
        assert!(coordinator.sessions.get(broken).unwrap().has_policy());
    }

    #[test]
    fn protocol_level_rejections_reach_only_the_sender() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let (observer, mut observer_rx) = connect(&handle);
        let (_other, mut other_rx) = connect(&handle);

        handle
            .inbound_tx
            .try_send(Inbound::ManualAction {
                session_id: observer,
                action: Action::NEUTRAL,
            })
            .unwrap();
        coordinator.tick();

        let errors: Vec<Value> = drain_direct(&mut observer_rx);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["header"]["type"], "error");
        assert_eq!(errors[0]["payload"]["code"], "not_manual");
        assert!(drain_direct(&mut other_rx).is_empty());
    }

    #[test]
    fn closed_client_queue_removes_the_session() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let (pilot, rx) = connect(&handle);
        join(&handle, pilot, ControlMode::Manual);
        drop(rx);

        coordinator.tick();
        coordinator.tick();
        assert!(coordinator.sessions.get(pilot).is_none());
        // Ship is still coasting
        assert_eq!(coordinator.world.len(), 1);
    }

    #[test]
    fn draining_emits_final_snapshot_and_stops() {
        let (mut coordinator, handle) = TickCoordinator::new(config());
        let mut frames = handle.subscribe();
        let (_observer, _rx) = connect(&handle);
        coordinator.tick();
        coordinator.tick();
        last_broadcast(&mut frames);

        coordinator.drain();
        let last = last_broadcast(&mut frames).unwrap();
        assert_eq!(last["payload"]["tick"], 2);
        assert_eq!(coordinator.state(), CoordinatorState::Draining);

        assert_eq!(coordinator.tick(), None);
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let (coordinator, handle) = TickCoordinator::new(config());
        let mut frames = handle.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(handle.send(Inbound::Connected {
            session_id: Uuid::new_v4(),
            outbound: mpsc::channel(8).0,
        })
        .await);

        let task = tokio::spawn(coordinator.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("coordinator did not stop")
            .unwrap();

        assert_eq!(handle.status().state(), CoordinatorState::Draining);
        assert!(last_broadcast(&mut frames).is_some());
    }
}
