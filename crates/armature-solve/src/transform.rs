//! Coordinate-space transforms between the nodal and segmental
//! representations.
//!
//! **Nodal**: every node stores a local position/rotation relative to its
//! parent. This is what the host reads and writes.
//!
//! **Segmental**: every segment stores a rotation and a scalar length; the
//! child joint sits at `length` along the segment frame's +Z axis. Solvers
//! operate here because FABRIK moves joints along rigid-length segments.
//!
//! All composition uses unit quaternions with the conjugate as inverse.
//! Nothing renormalizes implicitly; callers composing many rotations are
//! responsible for renormalizing if drift matters to them.

use armature_tree::{NodeHandle, Tree};
use nalgebra::{UnitQuaternion, Vector3};

/// Transform a position from the space of `base` into the space of `tip`.
///
/// Walks from `tip` up to `base`; the recursion unwinds so the base-most
/// node's transform is applied first, each level subtracting the node's
/// local position and rotating by the conjugate of its local rotation.
/// `base = None` means world space.
pub fn node_pos_g2l(
    tree: &Tree,
    pos: &mut Vector3<f32>,
    base: Option<NodeHandle>,
    tip: Option<NodeHandle>,
) {
    if tip == base {
        return;
    }
    let Some(handle) = tip else {
        return;
    };
    let Ok(node) = tree.node(handle) else {
        return;
    };
    node_pos_g2l(tree, pos, base, node.parent());

    *pos -= node.position;
    *pos = node.rotation.inverse_transform_vector(pos);
}

/// Transform a position from the space of `tip` into the space of `base`.
///
/// Walks from `tip` toward `base`, applying rotation then translation at
/// each level. `base = None` means world space.
pub fn node_pos_l2g(
    tree: &Tree,
    pos: &mut Vector3<f32>,
    tip: Option<NodeHandle>,
    base: Option<NodeHandle>,
) {
    let mut current = tip;
    while current != base {
        let Some(handle) = current else {
            return;
        };
        let Ok(node) = tree.node(handle) else {
            return;
        };
        *pos = node.rotation.transform_vector(pos);
        *pos += node.position;
        current = node.parent();
    }
}

/// World-space position of a node.
pub fn world_position(tree: &Tree, node: NodeHandle) -> Vector3<f32> {
    let mut pos = Vector3::zeros();
    node_pos_l2g(tree, &mut pos, Some(node), None);
    pos
}

/// World-space rotation of a node (identity for a dead handle).
pub fn world_rotation(tree: &Tree, node: Option<NodeHandle>) -> UnitQuaternion<f32> {
    let mut rotation = UnitQuaternion::identity();
    let mut current = node;
    while let Some(handle) = current {
        let Ok(node) = tree.node(handle) else {
            break;
        };
        rotation = node.rotation * rotation;
        current = node.parent();
    }
    rotation
}

/// Shortest-arc rotation taking `from` onto `to`.
///
/// Degenerate inputs (zero-length vectors) contribute no rotation;
/// anti-parallel vectors rotate half a turn about an arbitrary
/// perpendicular axis instead of producing NaN.
pub fn rotation_between(from: &Vector3<f32>, to: &Vector3<f32>) -> UnitQuaternion<f32> {
    if from.norm_squared() <= f32::EPSILON || to.norm_squared() <= f32::EPSILON {
        return UnitQuaternion::identity();
    }
    UnitQuaternion::rotation_between(from, to).unwrap_or_else(|| {
        UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(orthogonal(from)), std::f32::consts::PI)
    })
}

/// Any vector perpendicular to `v` (for anti-parallel fallbacks).
fn orthogonal(v: &Vector3<f32>) -> Vector3<f32> {
    if v.x.abs() < 0.9 * v.norm() {
        v.cross(&Vector3::x())
    } else {
        v.cross(&Vector3::y())
    }
}

// ---------------------------------------------------------------------------
// Segmental representation
// ---------------------------------------------------------------------------

/// Working state of one chain in segmental space. Joint index 0 is the
/// chain base; joint `lengths.len()` is the tip.
///
/// `rotations[i]` orients the segment from joint `i` to joint `i + 1`,
/// relative to the previous segment frame (for `i = 0`, relative to the
/// chain base's parent frame). The child joint of segment `i` sits at
/// `lengths[i]` along the segment's local +Z.
#[derive(Debug, Clone, Default)]
pub struct SegmentState {
    /// World-space joint positions, base first (`lengths.len() + 1` entries).
    pub positions: Vec<Vector3<f32>>,
    /// Local segment rotations, one per segment.
    pub rotations: Vec<UnitQuaternion<f32>>,
    /// Rest length of each segment.
    pub lengths: Vec<f32>,
    /// World rotation of the chain base's parent frame.
    pub base_frame: UnitQuaternion<f32>,
    /// Base joint position in its parent's local frame.
    pub base_offset: Vector3<f32>,
}

impl SegmentState {
    pub fn segment_count(&self) -> usize {
        self.rotations.len()
    }
}

/// Transform a position from the local frame of `segment` (origin at the
/// segment's base joint) into the chain base's parent space, adding each
/// crossed segment's length along its local +Z.
pub fn seg_pos_l2g(state: &SegmentState, pos: &mut Vector3<f32>, segment: usize) {
    for i in (0..=segment).rev() {
        *pos = state.rotations[i].transform_vector(pos);
        *pos += if i == 0 {
            state.base_offset
        } else {
            Vector3::z() * state.lengths[i - 1]
        };
    }
}

/// Transform a position from the chain base's parent space into the local
/// frame of `segment`, subtracting each crossed segment's length along +Z.
pub fn seg_pos_g2l(state: &SegmentState, pos: &mut Vector3<f32>, segment: usize) {
    for i in 0..=segment {
        *pos -= if i == 0 {
            state.base_offset
        } else {
            Vector3::z() * state.lengths[i - 1]
        };
        *pos = state.rotations[i].inverse_transform_vector(pos);
    }
}

/// Convert a chain from nodal to segmental representation.
///
/// `joints` is ordered base to tip; `lengths` are the chain's cached rest
/// lengths (one per segment) — the conversion deliberately does not
/// measure the tree, so a host that moved joints without refreshing
/// distances solves against the stale lengths, exactly as documented on
/// `update_distances`. Per segment, the alignment rotation (local shortest
/// arc from +Z onto the child offset) is pushed into `scratch`, followed
/// by one leftover entry for the tip node's rotation — the components that
/// have no segment to live in. [`chain_to_nodal`] needs the same scratch
/// to restore nodal rotations; a round trip with no intervening edits
/// reproduces the originals.
pub fn chain_to_segmental(
    tree: &Tree,
    joints: &[NodeHandle],
    lengths: &[f32],
    scratch: &mut Vec<UnitQuaternion<f32>>,
) -> SegmentState {
    scratch.clear();

    let mut state = SegmentState::default();
    let Some(&base) = joints.first() else {
        return state;
    };
    let base_node = match tree.node(base) {
        Ok(node) => node,
        Err(_) => return state,
    };
    debug_assert_eq!(lengths.len() + 1, joints.len());

    state.base_frame = world_rotation(tree, base_node.parent());
    state.base_offset = base_node.position;
    state.positions.push(world_position(tree, base));

    // Accumulated world rotations: nodal (global) and segmental.
    let mut nodal_world = state.base_frame;
    let mut seg_world = state.base_frame;

    for (i, &handle) in joints.iter().enumerate() {
        let Ok(node) = tree.node(handle) else {
            continue;
        };
        nodal_world *= node.rotation;

        if let Some(&child) = joints.get(i + 1) {
            let Ok(child_node) = tree.node(child) else {
                continue;
            };
            let length = lengths[i];
            // Zero-length segments contribute no rotation.
            let align = rotation_between(&Vector3::z(), &child_node.position);
            let segment_world = nodal_world * align;

            state.rotations.push(seg_world.inverse() * segment_world);
            state.lengths.push(length);
            let tip = state.positions[i] + segment_world.transform_vector(&(Vector3::z() * length));
            state.positions.push(tip);

            scratch.push(align);
            seg_world = segment_world;
        } else {
            // Tip: no segment to carry this node's rotation. Stash the
            // leftover relative to the last segment frame.
            scratch.push(seg_world.inverse() * nodal_world);
        }
    }

    state
}

/// Convert a chain back from segmental to nodal representation, writing
/// local rotations into the tree.
///
/// `scratch` must be the buffer filled by [`chain_to_segmental`] for the
/// same chain. Local positions are untouched: segment lengths are rigid,
/// so the solved pose is expressible purely through rotations.
///
/// The walk is anchored at the chain base's FK-actual world pose, read
/// from the tree as it is now: when ancestors were rewritten after the
/// state was captured (chains merging into an already-written parent
/// chain), each segment re-aims at its solved joint position, which keeps
/// the residual second-order in the junction displacement. With an
/// untouched base the correction is exactly zero and the constrained
/// state rotations land verbatim. `skip_base` leaves the base joint's
/// rotation alone (for chains whose base is a junction owned by another
/// chain).
pub fn chain_to_nodal(
    tree: &mut Tree,
    joints: &[NodeHandle],
    state: &SegmentState,
    scratch: &[UnitQuaternion<f32>],
    skip_base: bool,
) {
    let Some(&base) = joints.first() else {
        return;
    };
    let Ok(base_node) = tree.node(base) else {
        return;
    };
    debug_assert_eq!(scratch.len(), joints.len());

    let base_frame = world_rotation(tree, base_node.parent());
    let mut fk_pos = world_position(tree, base);
    // FK-actual frames: the nodal frame of the previous joint and the
    // world rotation of the previous segment.
    let mut nodal_parent = base_frame;
    let mut seg_parent = base_frame;

    for (i, &handle) in joints.iter().enumerate() {
        if i < state.segment_count() {
            let current = seg_parent * state.rotations[i];
            let desired = state.positions[i + 1] - fk_pos;
            let aimed = if desired.norm_squared() <= f32::EPSILON {
                current
            } else {
                rotation_between(&(current * Vector3::z()), &desired) * current
            };

            // Undo the +Z alignment to recover the nodal frame.
            let nodal_world = aimed * scratch[i].inverse();
            let segment_world = if skip_base && i == 0 {
                // The junction's rotation belongs to the chain that owns
                // it; continue the walk from whatever it is now.
                nodal_parent = world_rotation(tree, Some(handle));
                nodal_parent * scratch[i]
            } else {
                if let Ok(node) = tree.node_mut(handle) {
                    node.rotation = nodal_parent.inverse() * nodal_world;
                }
                nodal_parent = nodal_world;
                aimed
            };

            fk_pos += segment_world.transform_vector(&(Vector3::z() * state.lengths[i]));
            seg_parent = segment_world;
        } else {
            // Tip: reapply the stashed leftover.
            let nodal_world = seg_parent * scratch[i];
            if !(skip_base && i == 0) {
                if let Ok(node) = tree.node_mut(handle) {
                    node.rotation = nodal_parent.inverse() * nodal_world;
                }
            }
            nodal_parent = nodal_world;
        }
    }
}

/// Write solved world positions back as nodal local positions, leaving
/// rotations untouched (used when joint rotations are disabled).
pub fn positions_to_nodal(tree: &mut Tree, joints: &[NodeHandle], state: &SegmentState) {
    for (i, &handle) in joints.iter().enumerate() {
        let Ok(node) = tree.node(handle) else {
            continue;
        };
        let parent = node.parent();
        let mut local = state.positions[i];
        node_pos_g2l(tree, &mut local, None, parent);
        if let Ok(node) = tree.node_mut(handle) {
            node.position = local;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use armature_core::NodeUid;
    use nalgebra::Unit;
    use rand::Rng;
    use rand_chacha::ChaCha8Rng;

    fn rest_lengths(tree: &Tree, joints: &[NodeHandle]) -> Vec<f32> {
        joints
            .iter()
            .skip(1)
            .map(|&j| tree.node(j).unwrap().position.norm())
            .collect()
    }

    fn assert_vec_eq(a: &Vector3<f32>, b: &Vector3<f32>, epsilon: f32) {
        assert_relative_eq!(a.x, b.x, epsilon = epsilon);
        assert_relative_eq!(a.y, b.y, epsilon = epsilon);
        assert_relative_eq!(a.z, b.z, epsilon = epsilon);
    }

    /// Straight 3-joint chain along +Y with a twist on the middle joint.
    fn bent_chain() -> (Tree, Vec<NodeHandle>) {
        let mut tree = Tree::new();
        let root = tree.create(NodeUid(0));
        let mid = tree.create_child(root, NodeUid(1)).unwrap();
        let tip = tree.create_child(mid, NodeUid(2)).unwrap();
        tree.node_mut(mid).unwrap().position = Vector3::new(0.0, 1.0, 0.0);
        tree.node_mut(mid).unwrap().rotation =
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.4);
        tree.node_mut(tip).unwrap().position = Vector3::new(0.0, 1.0, 0.0);
        (tree, vec![root, mid, tip])
    }

    #[test]
    fn l2g_then_g2l_is_identity() {
        let (tree, joints) = bent_chain();
        let tip = joints[2];

        let mut pos = Vector3::new(0.3, 0.7, -0.2);
        let original = pos;
        node_pos_l2g(&tree, &mut pos, Some(tip), None);
        node_pos_g2l(&tree, &mut pos, None, Some(tip));
        assert_vec_eq(&pos, &original, 1e-5);
    }

    #[test]
    fn l2g_respects_base_boundary() {
        let (tree, joints) = bent_chain();
        // Transform from tip space into mid space only: one level applied.
        let mut pos = Vector3::zeros();
        node_pos_l2g(&tree, &mut pos, Some(joints[2]), Some(joints[1]));
        assert_vec_eq(&pos, &Vector3::new(0.0, 1.0, 0.0), 1e-6);
    }

    #[test]
    fn world_position_accumulates_rotation() {
        let (tree, joints) = bent_chain();
        // Mid joint rotates 0.4 rad about X, so the tip offset (0,1,0)
        // leaves the Y axis.
        let tip = world_position(&tree, joints[2]);
        assert_relative_eq!(tip.y, 1.0 + 0.4f32.cos(), epsilon = 1e-5);
        assert_relative_eq!(tip.z, 0.4f32.sin(), epsilon = 1e-5);
    }

    #[test]
    fn segmental_positions_match_world_positions() {
        let (tree, joints) = bent_chain();
        let mut scratch = Vec::new();
        let state = chain_to_segmental(&tree, &joints, &rest_lengths(&tree, &joints), &mut scratch);

        assert_eq!(state.segment_count(), 2);
        assert_eq!(scratch.len(), 3);
        for (i, &joint) in joints.iter().enumerate() {
            assert_vec_eq(&state.positions[i], &world_position(&tree, joint), 1e-5);
        }
        assert_relative_eq!(state.lengths[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn seg_l2g_reaches_tip() {
        let (tree, joints) = bent_chain();
        let mut scratch = Vec::new();
        let state = chain_to_segmental(&tree, &joints, &rest_lengths(&tree, &joints), &mut scratch);

        // The point at `length` along the last segment's +Z is the tip.
        let mut pos = Vector3::z() * state.lengths[1];
        seg_pos_l2g(&state, &mut pos, 1);
        // Chain parent space is world space here (base has no parent).
        assert_vec_eq(&pos, &world_position(&tree, joints[2]), 1e-5);
    }

    #[test]
    fn seg_g2l_inverts_seg_l2g() {
        let (tree, joints) = bent_chain();
        let mut scratch = Vec::new();
        let state = chain_to_segmental(&tree, &joints, &rest_lengths(&tree, &joints), &mut scratch);

        let original = Vector3::new(0.2, -0.1, 0.5);
        let mut pos = original;
        seg_pos_l2g(&state, &mut pos, 1);
        seg_pos_g2l(&state, &mut pos, 1);
        assert_vec_eq(&pos, &original, 1e-5);
    }

    #[test]
    fn round_trip_restores_rotations() {
        let (mut tree, joints) = bent_chain();
        let before: Vec<_> = joints
            .iter()
            .map(|&j| tree.node(j).unwrap().rotation)
            .collect();

        let mut scratch = Vec::new();
        let state = chain_to_segmental(&tree, &joints, &rest_lengths(&tree, &joints), &mut scratch);
        chain_to_nodal(&mut tree, &joints, &state, &scratch, false);

        for (&joint, original) in joints.iter().zip(&before) {
            let after = tree.node(joint).unwrap().rotation;
            assert_relative_eq!(after.angle_to(original), 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn round_trip_random_chains() {
        use rand::SeedableRng;
        let mut rng = ChaCha8Rng::seed_from_u64(17);

        for _ in 0..20 {
            let depth = rng.gen_range(2..=10);
            let mut tree = Tree::new();
            let mut joints = vec![tree.create(NodeUid(0))];
            for i in 1..depth {
                let joint = tree.create_child(joints[i - 1], NodeUid(i as u64)).unwrap();
                let node = tree.node_mut(joint).unwrap();
                node.position = Vector3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                );
                let axis = Vector3::new(
                    rng.gen_range(-1.0..1.0f32),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                );
                if axis.norm_squared() > 1e-3 {
                    node.rotation = UnitQuaternion::from_axis_angle(
                        &Unit::new_normalize(axis),
                        rng.gen_range(-3.0..3.0),
                    );
                }
                joints.push(joint);
            }

            let before: Vec<_> = joints
                .iter()
                .map(|&j| tree.node(j).unwrap().rotation)
                .collect();
            let mut scratch = Vec::new();
            let state = chain_to_segmental(&tree, &joints, &rest_lengths(&tree, &joints), &mut scratch);
            chain_to_nodal(&mut tree, &joints, &state, &scratch, false);

            for (&joint, original) in joints.iter().zip(&before) {
                let after = tree.node(joint).unwrap().rotation;
                assert!(
                    after.angle_to(original) < 1e-4,
                    "depth {depth}: rotation drifted by {}",
                    after.angle_to(original)
                );
            }
        }
    }

    #[test]
    fn composition_drift_stays_bounded() {
        // No implicit renormalization: verify that repeated composition
        // of a unit rotation stays within epsilon of unit norm for the
        // lengths of chain this library works with.
        let step = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.123);
        let mut accumulated = UnitQuaternion::identity();
        for _ in 0..1000 {
            accumulated *= step;
        }
        assert_relative_eq!(accumulated.quaternion().norm(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn rotation_between_degenerate_inputs() {
        let zero = Vector3::zeros();
        let unit = Vector3::y();
        assert_eq!(rotation_between(&zero, &unit), UnitQuaternion::identity());

        // Anti-parallel input gets a half-turn, never NaN.
        let flip = rotation_between(&Vector3::z(), &(-Vector3::z()));
        assert_relative_eq!(flip.angle(), std::f32::consts::PI, epsilon = 1e-5);
        assert!(flip.quaternion().norm().is_finite());
    }
}
