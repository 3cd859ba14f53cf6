//! Analytic two-segment solver.
//!
//! Places the mid joint by the law of cosines in the first segment's local
//! frame (where the chain folds along +Z), keeping the bend in the plane
//! spanned by the current pose. One placement, no iteration.

use armature_tree::{NodeHandle, Tree};
use nalgebra::{Unit, UnitQuaternion, Vector3};

use crate::transform::{node_pos_g2l, node_pos_l2g, seg_pos_g2l, seg_pos_l2g, SegmentState};

/// Solve a two-segment chain toward `target_world`, updating the state's
/// mid and tip positions. Rotations are settled by the caller afterwards.
///
/// Unreachable targets stretch the chain straight toward the target;
/// targets inside the inner reach (`|l1 - l2|`) are pushed out to it. A
/// target coincident with the base leaves the pose untouched.
pub fn place_two_bone(
    tree: &Tree,
    state: &mut SegmentState,
    joints: &[NodeHandle],
    target_world: Vector3<f32>,
) {
    debug_assert_eq!(state.segment_count(), 2);
    let (l1, l2) = (state.lengths[0], state.lengths[1]);

    // Target into the chain base's parent space, then into the first
    // segment's frame: the base sits at the origin and the current mid
    // joint at (0, 0, l1).
    let chain_parent = tree.node(joints[0]).ok().and_then(|n| n.parent());
    let mut target = target_world;
    node_pos_g2l(tree, &mut target, None, chain_parent);
    seg_pos_g2l(state, &mut target, 0);

    let distance = target.norm();
    if distance <= f32::EPSILON {
        return;
    }
    let reach = (l1 - l2).abs().max(distance.min(l1 + l2));
    let toward_target = Unit::new_normalize(target);

    // Angle at the base between the target line and the first segment.
    let cos_base = ((l1 * l1 + reach * reach - l2 * l2) / (2.0 * l1 * reach)).clamp(-1.0, 1.0);
    let base_angle = cos_base.acos();

    // Bend in the plane holding the target line and the current first
    // segment (+Z in this frame); collinear poses pick an arbitrary plane.
    let normal = Vector3::z().cross(&toward_target);
    let bend_axis = if normal.norm_squared() <= f32::EPSILON {
        Vector3::x_axis()
    } else {
        Unit::new_normalize(normal)
    };
    let lift = UnitQuaternion::from_axis_angle(&bend_axis, -base_angle);

    let mut mid = lift.transform_vector(&toward_target) * l1;
    let mut tip = toward_target.into_inner() * reach;

    // Back out to world space through the same two hops.
    for pos in [&mut mid, &mut tip] {
        seg_pos_l2g(state, pos, 0);
        node_pos_l2g(tree, pos, chain_parent, None);
    }
    state.positions[1] = mid;
    state.positions[2] = tip;
}
