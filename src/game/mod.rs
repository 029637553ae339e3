//! Game simulation modules

pub mod leaderboard;
pub mod physics;
pub mod policy;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod world;

pub use server::{CoordinatorState, Inbound, ServerHandle, TickCoordinator};

use std::sync::Arc;

/// An encoded outbound text frame, shared between all receivers
pub type Frame = Arc<str>;
