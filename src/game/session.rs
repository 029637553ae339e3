//! Session registry: one session per connection, at most one ship per session

use std::collections::HashMap;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ws::protocol::ControlMode;

use super::leaderboard::Leaderboard;
use super::physics::{Action, OrbitalParams};
use super::policy::{observe, InferenceError, Policy};
use super::world::{Ship, World};
use super::Frame;

/// One connected client
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    pub mode: ControlMode,
    pub ship_id: Option<Uuid>,
    /// Latest manual input not yet applied; newer inputs overwrite older ones
    pending_action: Option<Action>,
    /// Uploaded policy, kept across mode switches until replaced or disconnected
    policy: Option<Policy>,
    /// Direct messages to this client only
    outbound: mpsc::Sender<Frame>,
}

impl Session {
    pub fn has_policy(&self) -> bool {
        self.policy.is_some()
    }

    pub fn outbound(&self) -> &mpsc::Sender<Frame> {
        &self.outbound
    }

    /// Produce this tick's action for the session's ship.
    ///
    /// Manual sessions hand over their buffered input (consumed once), model sessions
    /// run inference. `Ok(None)` means the ship coasts on the neutral action.
    pub fn next_action(
        &mut self,
        ship: &Ship,
        params: &OrbitalParams,
        target_radius: f64,
    ) -> Result<Option<Action>, InferenceError> {
        match self.mode {
            ControlMode::Observer => Ok(None),
            ControlMode::Manual => Ok(self.pending_action.take()),
            ControlMode::Model => match &self.policy {
                Some(policy) => policy
                    .infer(&observe(ship, params, target_radius))
                    .map(Some),
                None => Ok(None),
            },
        }
    }
}

/// Result of a successful mode change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub mode: ControlMode,
    pub ship_id: Option<Uuid>,
    /// A new ship was spawned for this change
    pub spawned: bool,
    /// The ship that was let go, if any
    pub released: Option<Uuid>,
}

/// Registry errors, reported to the requesting client
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unknown session {0}")]
    UnknownSession(Uuid),

    #[error("Session already registered {0}")]
    AlreadyConnected(Uuid),

    #[error("Manual input requires manual mode")]
    NotManual,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::UnknownSession(_) => "unknown_session",
            SessionError::AlreadyConnected(_) => "already_connected",
            SessionError::NotManual => "not_manual",
        }
    }
}

/// Maps connections to sessions. Owned by the tick coordinator, mutated only
/// between ticks.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Register a new connection as an observer
    pub fn connect(&mut self, id: Uuid, outbound: mpsc::Sender<Frame>) -> Result<(), SessionError> {
        if self.sessions.contains_key(&id) {
            return Err(SessionError::AlreadyConnected(id));
        }
        self.sessions.insert(
            id,
            Session {
                id,
                name: default_name(id),
                mode: ControlMode::Observer,
                ship_id: None,
                pending_action: None,
                policy: None,
                outbound,
            },
        );
        Ok(())
    }

    /// Switch a session's control mode.
    ///
    /// Observer releases the ship to coast. Manual/model keep a live ship and only
    /// swap the controller; a session without a live ship gets a fresh one.
    pub fn set_mode(
        &mut self,
        id: Uuid,
        mode: ControlMode,
        name: Option<String>,
        world: &mut World,
        leaderboard: &mut Leaderboard,
    ) -> Result<ModeChange, SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;

        let renamed = name.is_some();
        if let Some(name) = name {
            session.name = name;
        }
        session.pending_action = None;
        session.mode = mode;

        let mut released = None;
        let mut spawned = false;

        if mode == ControlMode::Observer {
            if let Some(ship_id) = session.ship_id.take() {
                world.release_ship(ship_id);
                leaderboard.retire(ship_id);
                released = Some(ship_id);
            }
        } else {
            let live = session
                .ship_id
                .and_then(|ship_id| world.ship(ship_id))
                .is_some_and(|ship| ship.alive);

            if live {
                if let Some(ship_id) = session.ship_id.filter(|_| renamed) {
                    world.rename_ship(ship_id, &session.name);
                    leaderboard.rename(ship_id, &session.name);
                }
            } else {
                if let Some(dead) = session.ship_id.take() {
                    world.release_ship(dead);
                    leaderboard.retire(dead);
                    released = Some(dead);
                }
                let ship_id = world.spawn_ship(id, session.name.clone());
                leaderboard.register(ship_id, session.name.clone());
                session.ship_id = Some(ship_id);
                spawned = true;
            }
        }

        Ok(ModeChange {
            mode,
            ship_id: session.ship_id,
            spawned,
            released,
        })
    }

    /// Buffer a manual input; only the latest one before a tick is used
    pub fn record_manual_action(&mut self, id: Uuid, action: Action) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        if session.mode != ControlMode::Manual {
            return Err(SessionError::NotManual);
        }
        session.pending_action = Some(action);
        Ok(())
    }

    /// Store or replace a session's policy
    pub fn install_policy(&mut self, id: Uuid, policy: Policy) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        session.policy = Some(policy);
        Ok(())
    }

    /// Drop a session; its ship is released to coast and its standing is frozen
    pub fn remove(
        &mut self,
        id: Uuid,
        world: &mut World,
        leaderboard: &mut Leaderboard,
    ) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        if let Some(ship_id) = session.ship_id.take() {
            world.release_ship(ship_id);
            leaderboard.retire(ship_id);
        }
        Some(session)
    }
}

fn default_name(id: Uuid) -> String {
    format!("Player_{}", &id.to_string()[..8])
}
