//! Inverse-kinematics solvers for the armature node tree.
//!
//! Poses a skeletal tree so that effector-carrying joints reach their
//! world-space targets, subject to per-joint constraints.
//!
//! # Architecture
//!
//! ```text
//! Tree + Effectors ──► ChainSet ──► Solver (FABRIK / two-bone) ──► posed Tree
//! ```
//!
//! [`ChainSet`] walks the tree from every effector toward the root and
//! splits the walks at junctions. The [`Solver`] converts each chain into
//! the segmental representation ([`transform`]), runs the selected
//! algorithm with constraint clamping, and writes local rotations back
//! into the tree. Hosts copy the pose out through the iteration
//! callbacks.
//!
//! # Usage
//!
//! 1. Build a [`Tree`](armature_tree::Tree) and attach
//!    [`Effector`](armature_tree::Effector)s.
//! 2. Share it ([`Tree::into_shared`](armature_tree::Tree::into_shared))
//!    and hand it to a solver via [`Solver::set_tree`].
//! 3. [`Solver::rebuild`], then [`Solver::solve`] once per frame.
//! 4. Rebuild again after any structural change.

pub mod chain;
pub mod fabrik;
pub mod solver;
pub mod transform;
pub mod two_bone;

pub use chain::{Chain, ChainSet};
pub use solver::{Algorithm, SolveReport, Solver};
pub use transform::SegmentState;
