//! Effector attachment: the target a chain of nodes is solved toward.

use armature_core::ConfigError;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Behavioral switches on an effector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EffectorFeatures {
    /// Rotate the target around the chain's base during weight blending
    /// instead of linearly interpolating it. Can be more appealing when the
    /// solved tree diverges a lot from the rest tree during weight
    /// transitions.
    #[serde(default)]
    pub weight_nlerp: bool,
}

/// Specifies how a chain of nodes should be solved.
///
/// An effector attaches to exactly one node (via
/// [`Tree::attach_effector`](crate::Tree::attach_effector)) and carries the
/// world-space target for that node, how strongly the solver pulls toward it
/// (`weight`), and how many ancestors participate (`chain_length`).
#[derive(Debug, Clone, PartialEq)]
pub struct Effector {
    /// World-space position the attached node should head for. Update this
    /// whenever there is a new target to solve for.
    pub target_position: Vector3<f32>,

    /// World-space rotation the attached node should head for. Only used
    /// when the solver's target-rotations feature is enabled.
    pub target_rotation: UnitQuaternion<f32>,

    /// Influence of the solver on the chain, in `[0, 1]`. 0 leaves the
    /// chain untouched, 1 pulls the tip all the way to the target. Useful
    /// for blending in and out, e.g. grounding a foot only while it is
    /// planted.
    pub weight: f32,

    /// Strength of the target-rotation pass on the tip joint.
    pub rotation_weight: f32,

    /// Per-ancestor falloff of the target-rotation correction. Each level
    /// toward the base receives the previous level's correction scaled by
    /// this factor.
    pub rotation_decay: f32,

    /// How many ancestor joints the chain spans. 0 extends the chain to the
    /// tree root. Changing this requires a solver rebuild.
    pub chain_length: u16,

    /// Behavioral switches.
    pub features: EffectorFeatures,
}

impl Default for Effector {
    fn default() -> Self {
        Self {
            target_position: Vector3::zeros(),
            target_rotation: UnitQuaternion::identity(),
            weight: 1.0,
            rotation_weight: 1.0,
            rotation_decay: 0.25,
            chain_length: 0,
            features: EffectorFeatures::default(),
        }
    }
}

impl Effector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effector with a world-space position target, everything else default.
    pub fn with_target(target_position: Vector3<f32>) -> Self {
        Self {
            target_position,
            ..Self::default()
        }
    }

    /// Check invariants on the configured values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWeight`] if `weight` is outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.weight) || !self.weight.is_finite() {
            return Err(ConfigError::InvalidWeight(self.weight));
        }
        Ok(())
    }
}
