//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::game::physics::OrbitalParams;

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Human-readable or JSON log lines
    pub log_format: LogFormat,
    /// Allowed client origins for CORS (comma-separated), permissive when unset
    pub client_origin: Option<String>,
    /// Simulation and session tuning
    pub game: GameConfig,
}

/// Simulation constants and per-connection limits
#[derive(Clone, Debug)]
pub struct GameConfig {
    /// Ticks per second; physics step is the reciprocal
    pub tick_rate: u32,
    /// GM of the central body
    pub gravitational_parameter: f64,
    /// Ships closer than this to the origin crash
    pub collision_radius: f64,
    /// Ships farther than this from the origin escape
    pub escape_radius: f64,
    /// Circular orbit radius for newly spawned ships
    pub spawn_radius: f64,
    /// Reference orbit radius used by policy observations
    pub target_radius: f64,
    /// Manual thrust clamp (acceleration)
    pub max_thrust: f64,
    /// Manual turn clamp (rad/s)
    pub max_turn_rate: f64,
    /// Policy output multiplier
    pub model_thrust_scale: f64,
    /// Positions kept per ship for trail rendering
    pub trail_length: usize,
    /// Ticks a released ship keeps coasting before it is removed
    pub orphan_linger_ticks: u64,
    /// Largest decoded policy artifact accepted
    pub max_model_bytes: usize,
    /// Inbound messages per second per connection
    pub input_rate_limit: u32,
    /// Per-session direct message queue depth
    pub outbound_buffer: usize,
    /// Seed for spawn placement, random when unset
    pub world_seed: Option<u64>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            gravitational_parameter: 1.0,
            collision_radius: 0.1,
            escape_radius: 5.0,
            spawn_radius: 2.0,
            target_radius: 1.0,
            max_thrust: 50.0,
            max_turn_rate: 200.0,
            model_thrust_scale: 1.0,
            trail_length: 120,
            orphan_linger_ticks: 180,
            max_model_bytes: 4 * 1024 * 1024,
            input_rate_limit: 120,
            outbound_buffer: 64,
            world_seed: None,
        }
    }
}

impl GameConfig {
    /// Load simulation settings, falling back to defaults for unset variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            tick_rate: parse_or("TICK_RATE", defaults.tick_rate)?,
            gravitational_parameter: parse_or(
                "GRAVITATIONAL_PARAMETER",
                defaults.gravitational_parameter,
            )?,
            collision_radius: parse_or("COLLISION_RADIUS", defaults.collision_radius)?,
            escape_radius: parse_or("ESCAPE_RADIUS", defaults.escape_radius)?,
            spawn_radius: parse_or("SPAWN_RADIUS", defaults.spawn_radius)?,
            target_radius: parse_or("TARGET_RADIUS", defaults.target_radius)?,
            max_thrust: parse_or("MAX_THRUST", defaults.max_thrust)?,
            max_turn_rate: parse_or("MAX_TURN_RATE", defaults.max_turn_rate)?,
            model_thrust_scale: parse_or("MODEL_THRUST_SCALE", defaults.model_thrust_scale)?,
            trail_length: parse_or("TRAIL_LENGTH", defaults.trail_length)?,
            orphan_linger_ticks: parse_or("ORPHAN_LINGER_TICKS", defaults.orphan_linger_ticks)?,
            max_model_bytes: parse_or("MAX_MODEL_BYTES", defaults.max_model_bytes)?,
            input_rate_limit: parse_or("INPUT_RATE_LIMIT", defaults.input_rate_limit)?,
            outbound_buffer: parse_or("OUTBOUND_BUFFER", defaults.outbound_buffer)?,
            world_seed: match env::var("WORLD_SEED") {
                Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid("WORLD_SEED"))?),
                Err(_) => None,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the simulation cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Inconsistent("TICK_RATE must be positive".into()));
        }
        if self.gravitational_parameter <= 0.0 || !self.gravitational_parameter.is_finite() {
            return Err(ConfigError::Inconsistent(
                "GRAVITATIONAL_PARAMETER must be a positive number".into(),
            ));
        }
        if !(self.collision_radius > 0.0
            && self.collision_radius < self.spawn_radius
            && self.spawn_radius < self.escape_radius)
        {
            return Err(ConfigError::Inconsistent(format!(
                "expected 0 < COLLISION_RADIUS ({}) < SPAWN_RADIUS ({}) < ESCAPE_RADIUS ({})",
                self.collision_radius, self.spawn_radius, self.escape_radius
            )));
        }
        if self.outbound_buffer == 0 || self.input_rate_limit == 0 {
            return Err(ConfigError::Inconsistent(
                "OUTBOUND_BUFFER and INPUT_RATE_LIMIT must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Wall-clock interval between ticks
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate as u64)
    }

    /// Physics constants shared by every ship
    pub fn orbital_params(&self) -> OrbitalParams {
        OrbitalParams {
            gm: self.gravitational_parameter,
            dt: 1.0 / self.tick_rate as f64,
            collision_radius: self.collision_radius,
            escape_radius: self.escape_radius,
            max_thrust: self.max_thrust,
            max_turn_rate: self.max_turn_rate,
            model_thrust_scale: self.model_thrust_scale,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Cloud hosts provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("text") | Err(_) => LogFormat::Text,
            Ok(_) => return Err(ConfigError::Invalid("LOG_FORMAT")),
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            client_origin: env::var("CLIENT_ORIGIN").ok().filter(|s| !s.trim().is_empty()),
            game: GameConfig::from_env()?,
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}
