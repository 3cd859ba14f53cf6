//! FABRIK sweeps and the rotation/constraint settling step shared by all
//! solver algorithms.
//!
//! The sweeps operate on world-space joint positions held in a
//! [`SegmentState`]; rotations are only touched in [`settle_rotations`],
//! strictly after position resolution.

use armature_tree::{Effector, NodeHandle, Tree};
use nalgebra::{UnitQuaternion, Vector3};

use crate::transform::{rotation_between, SegmentState};

/// Weight-blended target for a chain with the given current tip and base.
///
/// Plain mode lerps between the current tip and the target. With the
/// effector's `weight_nlerp` feature the current tip direction is instead
/// rotated around the chain base toward the target direction, with the
/// radius interpolated separately; degenerate directions fall back to the
/// lerp.
pub fn effective_target(
    effector: &Effector,
    tip: Vector3<f32>,
    base: Vector3<f32>,
) -> Vector3<f32> {
    let weight = effector.weight.clamp(0.0, 1.0);
    if effector.features.weight_nlerp {
        let current = tip - base;
        let desired = effector.target_position - base;
        if current.norm_squared() <= f32::EPSILON || desired.norm_squared() <= f32::EPSILON {
            return tip.lerp(&effector.target_position, weight);
        }
        let swing = rotation_between(&current, &desired);
        let partial = UnitQuaternion::identity().slerp(&swing, weight);
        let radius = current.norm() * (1.0 - weight) + desired.norm() * weight;
        base + partial.transform_vector(&current).normalize() * radius
    } else {
        tip.lerp(&effector.target_position, weight)
    }
}

/// Backward sweep (tip toward base): pin the tip at `target`, then walk
/// toward the base re-projecting each joint at its segment length along
/// the line to the joint's previous position.
pub fn backward_pass(state: &mut SegmentState, target: Vector3<f32>) {
    let count = state.positions.len();
    if count < 2 {
        return;
    }
    state.positions[count - 1] = target;
    for i in (0..count - 1).rev() {
        let pinned = state.positions[i + 1];
        let direction = direction_or_z(state.positions[i] - pinned);
        state.positions[i] = pinned + direction * state.lengths[i];
    }
}

/// Forward sweep (base toward tip): pin the base at `anchor`, then walk
/// toward the tip re-projecting each joint at its segment length.
pub fn forward_pass(state: &mut SegmentState, anchor: Vector3<f32>) {
    let count = state.positions.len();
    if count < 2 {
        return;
    }
    state.positions[0] = anchor;
    for i in 1..count {
        let pinned = state.positions[i - 1];
        let direction = direction_or_z(state.positions[i] - pinned);
        state.positions[i] = pinned + direction * state.lengths[i - 1];
    }
}

/// Normalized direction, falling back to +Z (the segment axis) for
/// degenerate inputs so coincident joints never produce NaN.
fn direction_or_z(v: Vector3<f32>) -> Vector3<f32> {
    let norm = v.norm();
    if norm <= f32::EPSILON {
        Vector3::z()
    } else {
        v / norm
    }
}

/// Re-derive each segment rotation from the resolved joint positions,
/// clamp it through the joint's constraint chain, and re-propagate
/// positions from the clamped rotations so segment lengths stay rigid.
///
/// `joints` is ordered base to tip; the constraint consulted for segment
/// `i` is the one attached to `joints[i]`, and it receives the segment's
/// local rotation. Runs strictly after the position sweeps, never
/// interleaved with them.
pub fn settle_rotations(
    tree: &Tree,
    state: &mut SegmentState,
    joints: &[NodeHandle],
    apply_constraints: bool,
) {
    let count = state.segment_count();
    // Unconstrained and constrained world-frame walks diverge as clamps
    // land; both are needed to express candidates in the updated frames.
    let mut old_world = state.base_frame;
    let mut new_world = state.base_frame;

    for i in 0..count {
        let old_segment = old_world * state.rotations[i];
        let desired = state.positions[i + 1] - state.positions[i];
        let candidate_world = if desired.norm_squared() <= f32::EPSILON {
            // Zero-length segment contributes no rotation change.
            old_segment
        } else {
            rotation_between(&(old_segment * Vector3::z()), &desired) * old_segment
        };

        let mut local = new_world.inverse() * candidate_world;
        if apply_constraints {
            if let Some(constraint) = tree.node(joints[i]).ok().and_then(|n| n.constraint()) {
                local = constraint.apply(local);
            }
        }

        old_world = old_segment;
        state.rotations[i] = local;
        new_world *= local;
        state.positions[i + 1] =
            state.positions[i] + new_world.transform_vector(&(Vector3::z() * state.lengths[i]));
    }
}

/// Rotate the tip toward the effector's target rotation, propagating a
/// correction diminished by `rotation_decay` per level toward the base,
/// then re-propagate positions. `scratch` is the buffer captured by
/// [`chain_to_segmental`](crate::transform::chain_to_segmental) for this
/// chain (its last entry is the tip's leftover rotation).
pub fn target_rotation_pass(
    state: &mut SegmentState,
    scratch: &[UnitQuaternion<f32>],
    effector: &Effector,
) {
    let count = state.segment_count();
    if count == 0 {
        return;
    }

    // World frame before each segment: prefixes[i] applies segments 0..i.
    let mut prefixes = Vec::with_capacity(count + 1);
    let mut acc = state.base_frame;
    prefixes.push(acc);
    for rotation in &state.rotations {
        acc *= *rotation;
        prefixes.push(acc);
    }

    let tip_world = prefixes[count] * scratch[count];
    let correction = effector.target_rotation * tip_world.inverse();

    let mut factor = effector.rotation_weight.clamp(0.0, 1.0);
    for i in (0..count).rev() {
        if factor <= f32::EPSILON {
            break;
        }
        let step = UnitQuaternion::identity().slerp(&correction, factor);
        // Pre-multiply in world space, expressed in the local slot. The
        // walk is tip to base, so prefixes below `i` stay valid.
        let parent = prefixes[i];
        state.rotations[i] = parent.inverse() * step * parent * state.rotations[i];
        factor *= effector.rotation_decay;
    }

    repropagate_positions(state);
}

/// Recompute joint positions from the base anchor and current rotations.
pub fn repropagate_positions(state: &mut SegmentState) {
    let mut world = state.base_frame;
    for i in 0..state.segment_count() {
        world *= state.rotations[i];
        state.positions[i + 1] =
            state.positions[i] + world.transform_vector(&(Vector3::z() * state.lengths[i]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn straight_state() -> SegmentState {
        SegmentState {
            positions: vec![
                Vector3::zeros(),
                Vector3::new(0.0, 0.0, 1.0),
                Vector3::new(0.0, 0.0, 2.0),
            ],
            rotations: vec![UnitQuaternion::identity(); 2],
            lengths: vec![1.0, 1.0],
            base_frame: UnitQuaternion::identity(),
            base_offset: Vector3::zeros(),
        }
    }

    #[test]
    fn backward_pass_pins_tip_and_keeps_lengths() {
        let mut state = straight_state();
        let target = Vector3::new(1.0, 0.0, 1.0);
        backward_pass(&mut state, target);

        assert_eq!(state.positions[2], target);
        for i in 0..2 {
            let length = (state.positions[i + 1] - state.positions[i]).norm();
            assert_relative_eq!(length, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn forward_pass_pins_base_and_keeps_lengths() {
        let mut state = straight_state();
        backward_pass(&mut state, Vector3::new(1.0, 0.0, 1.0));
        forward_pass(&mut state, Vector3::zeros());

        assert_eq!(state.positions[0], Vector3::zeros());
        for i in 0..2 {
            let length = (state.positions[i + 1] - state.positions[i]).norm();
            assert_relative_eq!(length, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn coincident_joints_fall_back_without_nan() {
        let mut state = straight_state();
        state.positions[1] = state.positions[2];
        let anchor = state.positions[2];
        backward_pass(&mut state, anchor);
        forward_pass(&mut state, Vector3::zeros());
        for position in &state.positions {
            assert!(position.x.is_finite() && position.y.is_finite() && position.z.is_finite());
        }
    }

    #[test]
    fn effective_target_lerp() {
        let effector = Effector {
            target_position: Vector3::new(2.0, 0.0, 0.0),
            weight: 0.5,
            ..Effector::new()
        };
        let blended = effective_target(&effector, Vector3::zeros(), Vector3::zeros());
        assert_relative_eq!(blended.x, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn effective_target_nlerp_rotates_around_base() {
        let mut effector = Effector {
            target_position: Vector3::new(2.0, 0.0, 0.0),
            weight: 0.5,
            ..Effector::new()
        };
        effector.features.weight_nlerp = true;

        // Current tip at radius 2 along +Y, target at radius 2 along +X.
        let tip = Vector3::new(0.0, 2.0, 0.0);
        let blended = effective_target(&effector, tip, Vector3::zeros());

        // Rotation around the base keeps the radius, unlike a lerp (which
        // would pass through radius sqrt(2)).
        assert_relative_eq!(blended.norm(), 2.0, epsilon = 1e-4);
        assert_relative_eq!(blended.x, blended.y, epsilon = 1e-4);
    }

    #[test]
    fn effective_target_weight_extremes() {
        let mut effector = Effector {
            target_position: Vector3::new(3.0, 1.0, 0.0),
            weight: 0.0,
            ..Effector::new()
        };
        let tip = Vector3::new(0.0, 2.0, 0.0);
        assert_eq!(effective_target(&effector, tip, Vector3::zeros()), tip);

        effector.weight = 1.0;
        assert_eq!(
            effective_target(&effector, tip, Vector3::zeros()),
            effector.target_position
        );
    }

    #[test]
    fn repropagate_follows_rotations() {
        let mut state = straight_state();
        state.rotations[0] = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f32::consts::FRAC_PI_2);
        repropagate_positions(&mut state);

        // First segment now points along +X.
        assert_relative_eq!(state.positions[1].x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(state.positions[1].z, 0.0, epsilon = 1e-5);
    }
}
