//! Orbital physics and termination rules

use std::f64::consts::TAU;

use serde::Serialize;

/// Smallest distance used when evaluating gravity
const MIN_GRAVITY_DISTANCE: f64 = 1e-5;

/// Physics constants shared by every ship
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbitalParams {
    /// Gravitational parameter (GM) of the central body
    pub gm: f64,
    /// Fixed time step per tick, in seconds
    pub dt: f64,
    /// Below this distance a ship has crashed into the central body
    pub collision_radius: f64,
    /// Above this distance a ship has left the arena
    pub escape_radius: f64,
    /// Upper bound on manual thrust acceleration
    pub max_thrust: f64,
    /// Upper bound on manual turn rate (rad/s)
    pub max_turn_rate: f64,
    /// Acceleration produced by a policy output of 1.0
    pub model_thrust_scale: f64,
}

/// Position, velocity and heading of one ship
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    /// Heading in radians, normalized to 0..2π
    pub heading: f64,
}

impl Kinematics {
    /// Prograde circular orbit at `radius`, placed at `phase` radians
    pub fn circular_orbit(radius: f64, phase: f64, gm: f64) -> Self {
        let speed = (gm / radius).sqrt();
        let (sin, cos) = phase.sin_cos();
        Self {
            x: radius * cos,
            y: radius * sin,
            vx: -speed * sin,
            vy: speed * cos,
            heading: (phase + std::f64::consts::FRAC_PI_2).rem_euclid(TAU),
        }
    }

    /// Distance from the central body
    pub fn radius(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

/// One tick of control for one ship
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Turn the nose, then thrust along it. Sent by manual pilots.
    Steer { turn: f64, thrust: f64 },
    /// Thrust along the local orbital tangent. Produced by policies, range -1..1.
    Tangential { thrust: f64 },
}

impl Action {
    /// No turn, no thrust
    pub const NEUTRAL: Action = Action::Steer {
        turn: 0.0,
        thrust: 0.0,
    };
}

impl Default for Action {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Why a ship stopped flying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Fell inside the collision radius
    Crashed,
    /// Left the arena bounds
    Escaped,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Crashed => "crashed",
            Termination::Escaped => "escaped",
        }
    }
}

/// Physics system for advancing ships around the central body
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Advance one ship by a single fixed step.
    ///
    /// Steering rotates the heading before thrust is applied. The resulting thrust
    /// acceleration is held constant across the RK4 sub-steps while gravity is
    /// re-evaluated at each of them.
    pub fn step(state: &Kinematics, action: Action, params: &OrbitalParams) -> Kinematics {
        let dt = params.dt;
        let mut heading = state.heading;

        let (thrust_x, thrust_y) = match action {
            Action::Steer { turn, thrust } => {
                let turn = finite_or_zero(turn).clamp(-params.max_turn_rate, params.max_turn_rate);
                heading = (heading + turn * dt).rem_euclid(TAU);

                // No reverse thrusters
                let thrust = finite_or_zero(thrust).clamp(0.0, params.max_thrust);
                (heading.cos() * thrust, heading.sin() * thrust)
            }
            Action::Tangential { thrust } => {
                let thrust = finite_or_zero(thrust).clamp(-1.0, 1.0) * params.model_thrust_scale;
                let r = state.radius();
                if r > MIN_GRAVITY_DISTANCE {
                    (-state.y / r * thrust, state.x / r * thrust)
                } else {
                    (0.0, 0.0)
                }
            }
        };

        let accel = |x: f64, y: f64| {
            let (gx, gy) = Self::gravity(x, y, params.gm);
            (gx + thrust_x, gy + thrust_y)
        };

        let (x, y, vx, vy) = (state.x, state.y, state.vx, state.vy);

        let (a1x, a1y) = accel(x, y);
        let (k1vx, k1vy) = (dt * a1x, dt * a1y);
        let (k1px, k1py) = (dt * vx, dt * vy);

        let (a2x, a2y) = accel(x + 0.5 * k1px, y + 0.5 * k1py);
        let (k2vx, k2vy) = (dt * a2x, dt * a2y);
        let (k2px, k2py) = (dt * (vx + 0.5 * k1vx), dt * (vy + 0.5 * k1vy));

        let (a3x, a3y) = accel(x + 0.5 * k2px, y + 0.5 * k2py);
        let (k3vx, k3vy) = (dt * a3x, dt * a3y);
        let (k3px, k3py) = (dt * (vx + 0.5 * k2vx), dt * (vy + 0.5 * k2vy));

        let (a4x, a4y) = accel(x + k3px, y + k3py);
        let (k4vx, k4vy) = (dt * a4x, dt * a4y);
        let (k4px, k4py) = (dt * (vx + k3vx), dt * (vy + k3vy));

        Kinematics {
            x: x + (k1px + 2.0 * k2px + 2.0 * k3px + k4px) / 6.0,
            y: y + (k1py + 2.0 * k2py + 2.0 * k3py + k4py) / 6.0,
            vx: vx + (k1vx + 2.0 * k2vx + 2.0 * k3vx + k4vx) / 6.0,
            vy: vy + (k1vy + 2.0 * k2vy + 2.0 * k3vy + k4vy) / 6.0,
            heading,
        }
    }

    /// Gravitational acceleration toward the origin
    pub fn gravity(x: f64, y: f64, gm: f64) -> (f64, f64) {
        let dist = (x * x + y * y).sqrt().max(MIN_GRAVITY_DISTANCE);
        let scale = -gm / (dist * dist * dist);
        (x * scale, y * scale)
    }

    /// Check whether a ship has left the flyable region
    pub fn check_termination(state: &Kinematics, params: &OrbitalParams) -> Option<Termination> {
        let r = state.radius();
        if r < params.collision_radius {
            Some(Termination::Crashed)
        } else if !(r <= params.escape_radius) {
            // NaN positions count as out of bounds
            Some(Termination::Escaped)
        } else {
            None
        }
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
