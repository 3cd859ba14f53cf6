//! Solver lifecycle and the per-algorithm solve loops.

use std::collections::HashMap;

use armature_core::{ConfigError, SolveError, SolverConfig, TreeError};
use armature_tree::{Effector, NodeHandle, SharedTree};
use log::{debug, trace};
use nalgebra::{UnitQuaternion, Vector3};

use crate::chain::ChainSet;
use crate::fabrik::{
    backward_pass, effective_target, forward_pass, settle_rotations, target_rotation_pass,
};
use crate::transform::{chain_to_nodal, chain_to_segmental, positions_to_nodal, SegmentState};
use crate::two_bone::place_two_bone;

/// Solver algorithm variants. The set is closed; dispatch is a `match`,
/// not a vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Iterative forward-and-backward reaching solver for arbitrary chains.
    #[default]
    Fabrik,
    /// Analytic law-of-cosines solver for two-segment chains.
    TwoBone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Created,
    TreeSet,
    Ready,
}

/// Outcome of one [`Solver::solve`] call.
///
/// Non-convergence is an expected outcome for unreachable targets, not an
/// error; the pose written back is the best found.
#[derive(Debug, Clone, Copy)]
pub struct SolveReport {
    /// Iterations actually run.
    pub iterations: u32,
    /// Total positional error across all effectors, in world units.
    pub error: f32,
    /// Whether every effector ended within tolerance.
    pub converged: bool,
}

/// IK solver over a shared node tree.
///
/// Lifecycle: `Created` → [`set_tree`](Solver::set_tree) → `TreeSet` →
/// [`rebuild`](Solver::rebuild) → `Ready` → [`solve`](Solver::solve)
/// (repeatable). Structural tree changes — adding or removing nodes or
/// effectors, changing a `chain_length` — require another `rebuild` before
/// the next `solve`.
pub struct Solver {
    algorithm: Algorithm,
    config: SolverConfig,
    tree: Option<SharedTree>,
    root: Option<NodeHandle>,
    chains: ChainSet,
    /// Per-chain joints, base to tip (cached at rebuild).
    joint_lists: Vec<Vec<NodeHandle>>,
    /// Per-chain rotation scratch: alignment rotations plus the tip
    /// leftover, reused across solves.
    scratch: Vec<Vec<UnitQuaternion<f32>>>,
    states: Vec<SegmentState>,
    /// Base nodes anchoring more than one root chain; their rotation is
    /// left untouched at write-back since no single chain owns it.
    contested_bases: Vec<NodeHandle>,
    stage: Stage,
}

impl Solver {
    /// Solver with default configuration.
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            config: SolverConfig::default(),
            tree: None,
            root: None,
            chains: ChainSet::default(),
            joint_lists: Vec::new(),
            scratch: Vec::new(),
            states: Vec::new(),
            contested_bases: Vec::new(),
            stage: Stage::Created,
        }
    }

    /// Solver with an explicit, validated configuration.
    ///
    /// # Errors
    ///
    /// Returns the validation error for out-of-range values.
    pub fn with_config(algorithm: Algorithm, config: SolverConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut solver = Self::new(algorithm);
        solver.config = config;
        Ok(solver)
    }

    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub const fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SolverConfig {
        &mut self.config
    }

    /// Point the solver at a tree, rooted at `root`. Any previously built
    /// chains are discarded; call [`rebuild`](Solver::rebuild) next.
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if `root` is dead in `tree`.
    pub fn set_tree(&mut self, tree: SharedTree, root: NodeHandle) -> Result<(), TreeError> {
        if !tree.borrow().contains(root) {
            return Err(TreeError::StaleHandle);
        }
        self.tree = Some(tree);
        self.root = Some(root);
        self.chains = ChainSet::default();
        self.joint_lists.clear();
        self.stage = Stage::TreeSet;
        Ok(())
    }

    /// Release the solver's reference to its tree, returning it. The
    /// solver drops back to the created state.
    pub fn unlink_tree(&mut self) -> Option<SharedTree> {
        self.root = None;
        self.chains = ChainSet::default();
        self.joint_lists.clear();
        self.stage = Stage::Created;
        self.tree.take()
    }

    /// Extract chains from the current tree and cache rest distances.
    ///
    /// # Errors
    ///
    /// [`SolveError::NoTree`] before [`set_tree`](Solver::set_tree);
    /// [`SolveError::UnsupportedChain`] if the algorithm cannot solve one
    /// of the extracted chains (the two-bone solver requires exactly two
    /// segments per chain and no junctions).
    pub fn rebuild(&mut self) -> Result<(), SolveError> {
        let shared = self.tree.clone().ok_or(SolveError::NoTree)?;
        let root = self.root.ok_or(SolveError::NoTree)?;
        let tree = shared.borrow();
        let chains = ChainSet::build(&tree, root);

        if self.algorithm == Algorithm::TwoBone {
            for chain in chains.chains() {
                let segments = chain.segment_count();
                if (segments != 2 && segments != 0) || !chain.children().is_empty() {
                    return Err(SolveError::UnsupportedChain { segments });
                }
            }
        }

        let count = chains.chains().len();
        self.joint_lists = chains.chains().iter().map(|c| c.joints_base_to_tip()).collect();
        self.scratch = vec![Vec::new(); count];
        self.states = vec![SegmentState::default(); count];

        let mut base_counts: HashMap<NodeHandle, u32> = HashMap::new();
        for chain in chains.chains() {
            if chain.parent().is_none() {
                *base_counts.entry(chain.base()).or_insert(0) += 1;
            }
        }
        self.contested_bases = base_counts
            .into_iter()
            .filter_map(|(handle, uses)| (uses > 1).then_some(handle))
            .collect();

        debug!("solver rebuilt: {count} chains");
        self.chains = chains;
        self.stage = Stage::Ready;
        Ok(())
    }

    /// Refresh cached segment rest lengths from current local positions.
    /// Call after structurally moving joints without changing topology.
    ///
    /// # Errors
    ///
    /// Same lifecycle errors as [`solve`](Solver::solve).
    pub fn update_distances(&mut self) -> Result<(), SolveError> {
        let shared = self.ready()?;
        self.chains.update_distances(&shared.borrow());
        Ok(())
    }

    fn ready(&self) -> Result<SharedTree, SolveError> {
        match self.stage {
            Stage::Created => Err(SolveError::NoTree),
            Stage::TreeSet => Err(SolveError::NotRebuilt),
            Stage::Ready => Ok(self.tree.clone().ok_or(SolveError::NoTree)?),
        }
    }

    /// Run one solve pass and write the resulting pose into the tree.
    ///
    /// # Errors
    ///
    /// [`SolveError::NoTree`] / [`SolveError::NotRebuilt`] on lifecycle
    /// misuse. Never errors on numerical grounds.
    pub fn solve(&mut self) -> Result<SolveReport, SolveError> {
        let shared = self.ready()?;
        let mut guard = shared.borrow_mut();
        let tree = &mut *guard;

        let chain_count = self.chains.chains().len();
        if chain_count == 0 {
            return Ok(SolveReport {
                iterations: 0,
                error: 0.0,
                converged: true,
            });
        }

        // Capture segmental states and per-chain blended targets.
        let mut targets: Vec<Option<(Vector3<f32>, Effector)>> = Vec::with_capacity(chain_count);
        for index in 0..chain_count {
            let chain = &self.chains.chains()[index];
            let lengths = chain.lengths_base_to_tip();
            self.states[index] = chain_to_segmental(
                tree,
                &self.joint_lists[index],
                &lengths,
                &mut self.scratch[index],
            );
            let entry = chain
                .effector()
                .and_then(|handle| tree.node(handle).ok().and_then(|n| n.effector()).cloned())
                .map(|effector| {
                    let state = &self.states[index];
                    let tip = state.positions.last().copied().unwrap_or_default();
                    let base = state.positions.first().copied().unwrap_or_default();
                    (effective_target(&effector, tip, base), effector)
                });
            targets.push(entry);
        }
        let anchors: Vec<Vector3<f32>> = self
            .states
            .iter()
            .map(|s| s.positions.first().copied().unwrap_or_default())
            .collect();

        let order = self.chains.solve_order().to_vec();
        let features = self.config.features;
        let tolerance = self.config.tolerance;
        let max_iterations = self.config.max_iterations.max(1);

        let mut iterations = 0;
        let mut total_error;
        let mut converged;

        match self.algorithm {
            Algorithm::Fabrik => {
                let mut desired_base = vec![Vector3::zeros(); chain_count];
                loop {
                    iterations += 1;

                    // Backward phase, tip-side chains first: each chain's
                    // sweep hands its desired base position to the chain
                    // it merges into; junctions take the centroid of every
                    // influence arriving at them.
                    for &index in &order {
                        let chain = &self.chains.chains()[index];
                        if self.states[index].segment_count() == 0 {
                            desired_base[index] = anchors[index];
                            continue;
                        }
                        let mut sum = Vector3::zeros();
                        let mut influences = 0u32;
                        for &child in chain.children() {
                            sum += desired_base[child];
                            influences += 1;
                        }
                        if let Some((target, _)) = &targets[index] {
                            sum += *target;
                            influences += 1;
                        }
                        if influences == 0 {
                            desired_base[index] = anchors[index];
                            continue;
                        }
                        backward_pass(&mut self.states[index], sum / influences as f32);
                        desired_base[index] = self.states[index].positions[0];
                    }

                    // Forward phase, base-side chains first: anchored at
                    // the original base, or at the junction position the
                    // parent chain just resolved.
                    for &index in order.iter().rev() {
                        let anchor = match self.chains.chains()[index].parent() {
                            None => anchors[index],
                            Some(parent) => self.states[parent]
                                .positions
                                .last()
                                .copied()
                                .unwrap_or_default(),
                        };
                        forward_pass(&mut self.states[index], anchor);
                        if features.joint_rotations {
                            settle_rotations(
                                tree,
                                &mut self.states[index],
                                &self.joint_lists[index],
                                features.constraints,
                            );
                        }
                    }

                    let (error, within) = measure_error(&self.states, &targets, tolerance);
                    total_error = error;
                    converged = within;
                    trace!("iteration {iterations}: error {total_error}");
                    if converged || iterations >= max_iterations {
                        break;
                    }
                }
            }
            Algorithm::TwoBone => {
                iterations = 1;
                for &index in &order {
                    if self.states[index].segment_count() != 2 {
                        continue;
                    }
                    if let Some((target, _)) = &targets[index] {
                        place_two_bone(tree, &mut self.states[index], &self.joint_lists[index], *target);
                        if features.joint_rotations {
                            settle_rotations(
                                tree,
                                &mut self.states[index],
                                &self.joint_lists[index],
                                features.constraints,
                            );
                        }
                    }
                }
                let (error, within) = measure_error(&self.states, &targets, tolerance);
                total_error = error;
                converged = within;
            }
        }

        // Decayed rotation correction toward the effector's target
        // rotation, after position convergence.
        if features.target_rotations && features.joint_rotations {
            for &index in &order {
                if let Some((_, effector)) = &targets[index] {
                    if self.states[index].segment_count() == 0 {
                        continue;
                    }
                    target_rotation_pass(&mut self.states[index], &self.scratch[index], effector);
                    if features.constraints {
                        settle_rotations(
                            tree,
                            &mut self.states[index],
                            &self.joint_lists[index],
                            true,
                        );
                    }
                }
            }
        }

        // Write back, base-side chains first so tip-side chains compose
        // against the ancestors' final rotations.
        for &index in order.iter().rev() {
            let chain = &self.chains.chains()[index];
            if features.joint_rotations {
                let skip_base =
                    chain.parent().is_some() || self.contested_bases.contains(&chain.base());
                chain_to_nodal(
                    tree,
                    &self.joint_lists[index],
                    &self.states[index],
                    &self.scratch[index],
                    skip_base,
                );
            } else {
                positions_to_nodal(tree, &self.joint_lists[index], &self.states[index]);
            }
        }

        debug!(
            "solve finished: {iterations} iterations, error {total_error}, converged {converged}"
        );
        Ok(SolveReport {
            iterations,
            error: total_error,
            converged,
        })
    }

    /// Visit every node that belongs to some chain, deduplicated, in
    /// solve order. Hosts use this to copy the solved pose out.
    ///
    /// # Errors
    ///
    /// Same lifecycle errors as [`solve`](Solver::solve).
    pub fn iterate_affected_nodes(&self, mut visit: impl FnMut(NodeHandle)) -> Result<(), SolveError> {
        self.ready()?;
        for handle in self.chains.affected_nodes() {
            visit(handle);
        }
        Ok(())
    }

    /// Visit the base node of every root chain.
    ///
    /// # Errors
    ///
    /// Same lifecycle errors as [`solve`](Solver::solve).
    pub fn iterate_base_nodes(&self, mut visit: impl FnMut(NodeHandle)) -> Result<(), SolveError> {
        self.ready()?;
        for handle in self.chains.base_nodes() {
            visit(handle);
        }
        Ok(())
    }

    /// Visit every node of the solver's tree, chains or not.
    ///
    /// # Errors
    ///
    /// [`SolveError::NoTree`] before [`set_tree`](Solver::set_tree).
    pub fn iterate_all_nodes(&self, mut visit: impl FnMut(NodeHandle)) -> Result<(), SolveError> {
        let shared = self.tree.clone().ok_or(SolveError::NoTree)?;
        let root = self.root.ok_or(SolveError::NoTree)?;
        shared.borrow().visit_subtree(root, &mut visit);
        Ok(())
    }
}

/// Total positional error across effector chains, plus whether every one
/// of them is within tolerance.
fn measure_error(
    states: &[SegmentState],
    targets: &[Option<(Vector3<f32>, Effector)>],
    tolerance: f32,
) -> (f32, bool) {
    let mut total = 0.0;
    let mut within = true;
    for (state, target) in states.iter().zip(targets) {
        if let Some((target, _)) = target {
            let tip = state.positions.last().copied().unwrap_or_default();
            let error = (tip - target).norm();
            total += error;
            if error >= tolerance {
                within = false;
            }
        }
    }
    (total, within)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use armature_core::NodeUid;
    use armature_tree::Tree;
    use nalgebra::Vector3;

    /// Chain of `count` joints spaced 1 apart along +Z, effector on the tip.
    fn chain_tree(count: usize) -> (SharedTree, NodeHandle, Vec<NodeHandle>) {
        let mut tree = Tree::new();
        let mut joints = vec![tree.create(NodeUid(0))];
        for i in 1..count {
            let joint = tree.create_child(joints[i - 1], NodeUid(i as u64)).unwrap();
            tree.node_mut(joint).unwrap().position = Vector3::new(0.0, 0.0, 1.0);
            joints.push(joint);
        }
        tree.attach_effector(joints[count - 1], Effector::new())
            .unwrap();
        let root = joints[0];
        (tree.into_shared(), root, joints)
    }

    #[test]
    fn lifecycle_errors() {
        let mut solver = Solver::new(Algorithm::Fabrik);
        assert_eq!(solver.solve().unwrap_err(), SolveError::NoTree);
        assert_eq!(solver.rebuild().unwrap_err(), SolveError::NoTree);

        let (shared, root, _) = chain_tree(3);
        solver.set_tree(shared, root).unwrap();
        assert_eq!(solver.solve().unwrap_err(), SolveError::NotRebuilt);
        assert_eq!(solver.update_distances().unwrap_err(), SolveError::NotRebuilt);

        solver.rebuild().unwrap();
        assert!(solver.solve().is_ok());
        assert!(solver.solve().is_ok()); // repeatable without rebuild

        assert!(solver.unlink_tree().is_some());
        assert_eq!(solver.solve().unwrap_err(), SolveError::NoTree);
    }

    #[test]
    fn set_tree_rejects_dead_root() {
        let (shared, root, _) = chain_tree(2);
        shared.borrow_mut().destroy(root).unwrap();
        let mut solver = Solver::new(Algorithm::Fabrik);
        assert_eq!(
            solver.set_tree(shared, root).unwrap_err(),
            TreeError::StaleHandle
        );
    }

    #[test]
    fn with_config_validates() {
        let config = SolverConfig {
            max_iterations: 0,
            ..SolverConfig::default()
        };
        assert!(Solver::with_config(Algorithm::Fabrik, config).is_err());
    }

    #[test]
    fn solve_reaches_reachable_target() {
        let (shared, root, joints) = chain_tree(3);
        let target = Vector3::new(1.0, 0.0, 1.0);
        shared
            .borrow_mut()
            .node_mut(joints[2])
            .unwrap()
            .effector_mut()
            .unwrap()
            .target_position = target;

        let mut solver = Solver::new(Algorithm::Fabrik);
        solver.set_tree(shared.clone(), root).unwrap();
        solver.rebuild().unwrap();
        let report = solver.solve().unwrap();

        assert!(report.converged, "error = {}", report.error);
        let tip = crate::transform::world_position(&shared.borrow(), joints[2]);
        assert_relative_eq!((tip - target).norm(), 0.0, epsilon = 2e-3);
    }

    #[test]
    fn solve_without_effectors_is_a_no_op() {
        let mut tree = Tree::new();
        let root = tree.create(NodeUid(0));
        let shared = tree.into_shared();

        let mut solver = Solver::new(Algorithm::Fabrik);
        solver.set_tree(shared, root).unwrap();
        solver.rebuild().unwrap();
        let report = solver.solve().unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn effector_on_root_solves_gracefully() {
        let mut tree = Tree::new();
        let root = tree.create(NodeUid(0));
        tree.attach_effector(root, Effector::with_target(Vector3::new(1.0, 0.0, 0.0)))
            .unwrap();
        let shared = tree.into_shared();

        let mut solver = Solver::new(Algorithm::Fabrik);
        solver.set_tree(shared, root).unwrap();
        solver.rebuild().unwrap();
        // Nothing to move; must not panic or loop.
        let report = solver.solve().unwrap();
        assert!(report.iterations <= solver.config().max_iterations);
    }

    #[test]
    fn two_bone_rejects_long_chain_at_rebuild() {
        let (shared, root, _) = chain_tree(4);
        let mut solver = Solver::new(Algorithm::TwoBone);
        solver.set_tree(shared, root).unwrap();
        assert_eq!(
            solver.rebuild().unwrap_err(),
            SolveError::UnsupportedChain { segments: 3 }
        );
    }

    #[test]
    fn two_bone_solves_in_one_iteration() {
        let (shared, root, joints) = chain_tree(3);
        shared
            .borrow_mut()
            .node_mut(joints[2])
            .unwrap()
            .effector_mut()
            .unwrap()
            .target_position = Vector3::new(1.0, 0.0, 1.0);

        let mut solver = Solver::new(Algorithm::TwoBone);
        solver.set_tree(shared.clone(), root).unwrap();
        solver.rebuild().unwrap();
        let report = solver.solve().unwrap();

        assert_eq!(report.iterations, 1);
        assert!(report.converged, "error = {}", report.error);
        let tip = crate::transform::world_position(&shared.borrow(), joints[2]);
        assert_relative_eq!((tip - Vector3::new(1.0, 0.0, 1.0)).norm(), 0.0, epsilon = 2e-3);
    }

    #[test]
    fn iteration_callbacks() {
        let (shared, root, joints) = chain_tree(3);
        let mut solver = Solver::new(Algorithm::Fabrik);
        solver.set_tree(shared, root).unwrap();

        // Affected/base iteration needs built chains.
        assert!(solver.iterate_affected_nodes(|_| {}).is_err());
        solver.rebuild().unwrap();

        let mut affected = Vec::new();
        solver.iterate_affected_nodes(|h| affected.push(h)).unwrap();
        assert_eq!(affected.len(), 3);

        let mut bases = Vec::new();
        solver.iterate_base_nodes(|h| bases.push(h)).unwrap();
        assert_eq!(bases, vec![joints[0]]);

        let mut all = 0;
        solver.iterate_all_nodes(|_| all += 1).unwrap();
        assert_eq!(all, 3);
    }

    #[test]
    fn two_solvers_share_one_tree() {
        let (shared, root, joints) = chain_tree(3);
        shared
            .borrow_mut()
            .node_mut(joints[2])
            .unwrap()
            .effector_mut()
            .unwrap()
            .target_position = Vector3::new(0.0, 1.0, 1.0);

        let mut first = Solver::new(Algorithm::Fabrik);
        first.set_tree(shared.clone(), root).unwrap();
        first.rebuild().unwrap();

        let mut second = Solver::new(Algorithm::Fabrik);
        second.set_tree(shared.clone(), root).unwrap();
        second.rebuild().unwrap();

        assert!(first.solve().unwrap().converged);
        // The second solver sees the already-posed tree and stays there.
        let report = second.solve().unwrap();
        assert!(report.converged);
    }
}
