//! Policy runtime: decodes uploaded control policies and runs per-tick inference
//!
//! Artifacts are JSON documents describing a small feed-forward network, delivered
//! base64-encoded. Decoding never happens on the tick loop; inference is a handful of
//! dot products and runs inline.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use super::physics::{Action, OrbitalParams};
use super::world::Ship;

/// Format tag every artifact must carry
pub const ARTIFACT_FORMAT: &str = "orbital-mlp";
/// Artifact schema version understood by this server
pub const ARTIFACT_VERSION: u32 = 1;
/// Length of the observation vector fed to policies
pub const OBSERVATION_DIM: usize = 7;
/// Policies output a single tangential thrust command
pub const ACTION_DIM: usize = 1;

/// Radius tolerance for the "on target" observation flag
const ON_TARGET_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Tanh,
    Relu,
    Sigmoid,
    Linear,
}

impl Activation {
    fn apply(self, value: f64) -> f64 {
        match self {
            Activation::Tanh => value.tanh(),
            Activation::Relu => value.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-value).exp()),
            Activation::Linear => value,
        }
    }
}

/// Fully-connected layer: `out = activation(weights · in + biases)`
#[derive(Debug, Clone, Deserialize)]
pub struct DenseLayer {
    /// Row-major `out × in`
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<f64>,
    pub activation: Activation,
}

impl DenseLayer {
    fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.biases)
            .map(|(row, bias)| {
                let sum: f64 = row.iter().zip(input).map(|(w, x)| w * x).sum();
                self.activation.apply(sum + bias)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct PolicyArtifact {
    format: String,
    version: u32,
    observation_dim: usize,
    action_dim: usize,
    layers: Vec<DenseLayer>,
}

/// A decoded, validated policy. Owned by exactly one session.
#[derive(Debug, Clone)]
pub struct Policy {
    layers: Vec<DenseLayer>,
}

impl Policy {
    /// Decode a base64 upload, enforcing the decoded size limit
    pub fn from_base64(encoded: &str, max_bytes: usize) -> Result<Self, ModelLoadError> {
        let encoded = encoded.trim();
        // Base64 inflates by 4/3, reject early before allocating
        if encoded.len() / 4 * 3 > max_bytes + 3 {
            return Err(ModelLoadError::TooLarge { limit: max_bytes });
        }
        let raw = STANDARD.decode(encoded)?;
        if raw.len() > max_bytes {
            return Err(ModelLoadError::TooLarge { limit: max_bytes });
        }
        Self::load(&raw)
    }

    /// Parse and validate raw artifact bytes
    pub fn load(raw: &[u8]) -> Result<Self, ModelLoadError> {
        if raw.is_empty() {
            return Err(ModelLoadError::Empty);
        }
        let artifact: PolicyArtifact = serde_json::from_slice(raw)?;

        if artifact.format != ARTIFACT_FORMAT {
            return Err(ModelLoadError::UnsupportedFormat(artifact.format));
        }
        if artifact.version != ARTIFACT_VERSION {
            return Err(ModelLoadError::UnsupportedVersion(artifact.version));
        }
        if artifact.observation_dim != OBSERVATION_DIM {
            return Err(ModelLoadError::Incompatible(format!(
                "observation_dim is {}, expected {}",
                artifact.observation_dim, OBSERVATION_DIM
            )));
        }
        if artifact.action_dim != ACTION_DIM {
            return Err(ModelLoadError::Incompatible(format!(
                "action_dim is {}, expected {}",
                artifact.action_dim, ACTION_DIM
            )));
        }
        if artifact.layers.is_empty() {
            return Err(ModelLoadError::Incompatible("no layers".into()));
        }

        let mut width = OBSERVATION_DIM;
        for (i, layer) in artifact.layers.iter().enumerate() {
            let out = layer.weights.len();
            if out == 0 {
                return Err(ModelLoadError::Incompatible(format!("layer {i} has no outputs")));
            }
            if layer.biases.len() != out {
                return Err(ModelLoadError::Incompatible(format!(
                    "layer {i} has {} biases for {out} outputs",
                    layer.biases.len()
                )));
            }
            if let Some(row) = layer.weights.iter().find(|row| row.len() != width) {
                return Err(ModelLoadError::Incompatible(format!(
                    "layer {i} expects {} inputs, previous width is {width}",
                    row.len()
                )));
            }
            let finite = layer.biases.iter().all(|b| b.is_finite())
                && layer.weights.iter().flatten().all(|w| w.is_finite());
            if !finite {
                return Err(ModelLoadError::NonFinite { layer: i });
            }
            width = out;
        }
        if width != ACTION_DIM {
            return Err(ModelLoadError::Incompatible(format!(
                "final layer outputs {width} values, expected {ACTION_DIM}"
            )));
        }

        Ok(Self {
            layers: artifact.layers,
        })
    }

    /// Run the network on one observation
    pub fn infer(&self, observation: &[f64]) -> Result<Action, InferenceError> {
        if observation.len() != OBSERVATION_DIM {
            return Err(InferenceError::ShapeMismatch {
                expected: OBSERVATION_DIM,
                actual: observation.len(),
            });
        }
        if observation.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::NonFiniteObservation);
        }

        let mut activations = observation.to_vec();
        for layer in &self.layers {
            activations = layer.forward(&activations);
        }

        match activations.as_slice() {
            [thrust] if thrust.is_finite() => Ok(Action::Tangential {
                thrust: thrust.clamp(-1.0, 1.0),
            }),
            [_] => Err(InferenceError::NonFiniteOutput),
            other => Err(InferenceError::ShapeMismatch {
                expected: ACTION_DIM,
                actual: other.len(),
            }),
        }
    }
}

/// Build the policy observation for one ship.
///
/// Layout: scaled radial error, radial velocity, tangential velocity, `1 - r0`,
/// on-target flag, specific orbital energy, specific angular momentum.
pub fn observe(ship: &Ship, params: &OrbitalParams, target_radius: f64) -> [f64; OBSERVATION_DIM] {
    let k = &ship.kinematics;
    let r = k.radius().max(1e-5);
    let v_radial = (k.x * k.vx + k.y * k.vy) / r;
    let v_tangential = (k.x * k.vy - k.y * k.vx) / r;

    let max_err = (ship.initial_radius - target_radius).abs().max(1e-2);
    let scaled_r_err = ((r - target_radius) / max_err * 2.0).clamp(-2.0, 2.0);
    let on_target = if (r - target_radius).abs() < ON_TARGET_TOLERANCE {
        1.0
    } else {
        0.0
    };
    let energy = 0.5 * (k.vx * k.vx + k.vy * k.vy) - params.gm / r;

    [
        scaled_r_err,
        v_radial,
        v_tangential,
        1.0 - ship.initial_radius,
        on_target,
        energy,
        r * v_tangential,
    ]
}

/// Upload rejected; reported only to the uploading client
#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("model payload is empty")]
    Empty,

    #[error("model exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("model is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("model is not a valid artifact: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported model format {0:?}")]
    UnsupportedFormat(String),

    #[error("unsupported model version {0}")]
    UnsupportedVersion(u32),

    #[error("incompatible model: {0}")]
    Incompatible(String),

    #[error("layer {layer} contains non-finite parameters")]
    NonFinite { layer: usize },
}

/// Runtime failure of a loaded policy; the ship falls back to neutral for the tick
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InferenceError {
    #[error("expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("observation contains non-finite values")]
    NonFiniteObservation,

    #[error("policy produced a non-finite action")]
    NonFiniteOutput,
}
