//! Skeletal node tree for the armature IK solver.
//!
//! Nodes live in a generational arena owned by a [`Tree`]; parent links are
//! non-owning back-references and handles are validated by generation, so a
//! handle to a destroyed node can never resolve to whatever reuses its slot.
//! Effectors and constraints attach directly to nodes.
//!
//! Trees are shared between solver instances as [`SharedTree`]
//! (`Rc<RefCell<Tree>>`). The reference count is deliberately non-atomic:
//! structural edits and solves on one tree must be serialized by the host,
//! and `Rc` being `!Send` makes the compiler enforce that.

pub mod arena;
pub mod constraint;
pub mod effector;
pub mod node;

pub use arena::{Arena, Handle};
pub use constraint::{Constraint, ConstraintKind};
pub use effector::{Effector, EffectorFeatures};
pub use node::{Node, NodeHandle, SharedTree, Tree};
