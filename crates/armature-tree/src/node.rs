//! The node tree: joints, links, and attachment plumbing.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use armature_core::{NodeUid, TreeError};
use nalgebra::{UnitQuaternion, Vector3};

use crate::arena::{Arena, Handle};
use crate::constraint::Constraint;
use crate::effector::Effector;

/// Handle to a node in a [`Tree`].
pub type NodeHandle = Handle;

/// Shared tree handle.
///
/// Multiple solver instances may hold clones of the same `SharedTree`
/// (overlapping subtrees included). `Rc` is `!Send`, which turns the
/// "serialize structural edits against solves" contract into a compile-time
/// guarantee rather than a convention.
pub type SharedTree = Rc<RefCell<Tree>>;

/// A joint in the hierarchy.
pub struct Node {
    uid: NodeUid,
    /// Local position relative to the parent.
    pub position: Vector3<f32>,
    /// Local rotation relative to the parent.
    pub rotation: UnitQuaternion<f32>,
    /// Opaque host payload. Shared (not deep-copied) on duplicate.
    pub user_data: Option<Rc<dyn Any>>,
    parent: Option<NodeHandle>,
    children: Vec<NodeHandle>,
    effector: Option<Effector>,
    constraint: Option<Box<Constraint>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("uid", &self.uid)
            .field("position", &self.position)
            .field("rotation", &self.rotation)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("effector", &self.effector)
            .field("constraint", &self.constraint)
            .finish_non_exhaustive()
    }
}

impl Node {
    fn new(uid: NodeUid) -> Self {
        Self {
            uid,
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            user_data: None,
            parent: None,
            children: Vec::new(),
            effector: None,
            constraint: None,
        }
    }

    pub const fn uid(&self) -> NodeUid {
        self.uid
    }

    pub const fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    /// Children in attachment order. Order is irrelevant to geometry but
    /// kept stable for reproducible iteration.
    pub fn children(&self) -> &[NodeHandle] {
        &self.children
    }

    pub const fn effector(&self) -> Option<&Effector> {
        self.effector.as_ref()
    }

    pub fn effector_mut(&mut self) -> Option<&mut Effector> {
        self.effector.as_mut()
    }

    pub fn constraint(&self) -> Option<&Constraint> {
        self.constraint.as_deref()
    }
}

/// Arena-owned tree of joints.
///
/// Child links are the owning direction; parent links are non-owning
/// back-references. All structural operations reject atomically: on error
/// the tree is untouched.
#[derive(Debug, Default)]
pub struct Tree {
    nodes: Arena<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap this tree for sharing between solvers.
    pub fn into_shared(self) -> SharedTree {
        Rc::new(RefCell::new(self))
    }

    /// Number of live nodes across all subtrees in this arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node: NodeHandle) -> bool {
        self.nodes.contains(node)
    }

    /// Borrow a node.
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn node(&self, handle: NodeHandle) -> Result<&Node, TreeError> {
        self.nodes.get(handle).ok_or(TreeError::StaleHandle)
    }

    /// Mutably borrow a node.
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn node_mut(&mut self, handle: NodeHandle) -> Result<&mut Node, TreeError> {
        self.nodes.get_mut(handle).ok_or(TreeError::StaleHandle)
    }

    /// Create a standalone node with an identity transform.
    pub fn create(&mut self, uid: NodeUid) -> NodeHandle {
        self.nodes.insert(Node::new(uid))
    }

    /// Create a node linked under `parent`.
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if `parent` is dead.
    pub fn create_child(&mut self, parent: NodeHandle, uid: NodeUid) -> Result<NodeHandle, TreeError> {
        if !self.nodes.contains(parent) {
            return Err(TreeError::StaleHandle);
        }
        let child = self.nodes.insert(Node::new(uid));
        let child_node = self.nodes.get_mut(child).expect("freshly inserted node");
        child_node.parent = Some(parent);
        self.nodes
            .get_mut(parent)
            .expect("parent checked above")
            .children
            .push(child);
        Ok(child)
    }

    /// Link an existing standalone node under `parent`.
    ///
    /// # Errors
    ///
    /// [`TreeError::AlreadyParented`] if `child` is still linked somewhere,
    /// [`TreeError::SelfParent`] / [`TreeError::WouldCycle`] if the link
    /// would make the tree cyclic, [`TreeError::StaleHandle`] for dead
    /// handles. The tree is unchanged on error.
    pub fn add_child(&mut self, parent: NodeHandle, child: NodeHandle) -> Result<(), TreeError> {
        if !self.nodes.contains(parent) || !self.nodes.contains(child) {
            return Err(TreeError::StaleHandle);
        }
        if parent == child {
            return Err(TreeError::SelfParent);
        }
        if self.node(child)?.parent.is_some() {
            return Err(TreeError::AlreadyParented);
        }
        if self.is_ancestor_of(child, parent) {
            return Err(TreeError::WouldCycle);
        }
        self.nodes.get_mut(child).expect("checked above").parent = Some(parent);
        self.nodes
            .get_mut(parent)
            .expect("checked above")
            .children
            .push(child);
        Ok(())
    }

    /// Detach `node` from its parent without destroying it. The subtree
    /// stays intact, rooted at `node`. Unlinking a root is a no-op.
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn unlink(&mut self, node: NodeHandle) -> Result<(), TreeError> {
        let parent = self.node(node)?.parent;
        if let Some(parent) = parent {
            let siblings = &mut self
                .nodes
                .get_mut(parent)
                .expect("parent back-reference is live")
                .children;
            siblings.retain(|&c| c != node);
            self.nodes.get_mut(node).expect("checked above").parent = None;
        }
        Ok(())
    }

    /// Destroy `node` and its whole subtree, top-down. The node is
    /// unlinked from its parent first, so the rest of the tree never sees
    /// a half-released subtree. Returns the number of nodes released.
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn destroy(&mut self, node: NodeHandle) -> Result<usize, TreeError> {
        self.unlink(node)?;
        let mut doomed = Vec::new();
        self.visit_subtree(node, &mut |handle| doomed.push(handle));
        for handle in &doomed {
            self.nodes.remove(*handle);
        }
        Ok(doomed.len())
    }

    /// Search descendants of `node` (direct and nested, depth-first in
    /// child attachment order) for the first node with `uid`.
    pub fn find_child(&self, node: NodeHandle, uid: NodeUid) -> Option<NodeHandle> {
        let parent = self.nodes.get(node)?;
        for &child in &parent.children {
            if self.nodes.get(child).map(Node::uid) == Some(uid) {
                return Some(child);
            }
            if let Some(found) = self.find_child(child, uid) {
                return Some(found);
            }
        }
        None
    }

    /// Deep-copy a single node, including its effector and constraint
    /// chain. The copy is standalone (no parent, no children).
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn duplicate(&mut self, node: NodeHandle) -> Result<NodeHandle, TreeError> {
        if !self.nodes.contains(node) {
            return Err(TreeError::StaleHandle);
        }
        Ok(self.clone_payload(node))
    }

    /// Deep-copy an entire subtree, including attachments, producing an
    /// independently owned copy rooted at the returned handle.
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn duplicate_subtree(&mut self, node: NodeHandle) -> Result<NodeHandle, TreeError> {
        if !self.nodes.contains(node) {
            return Err(TreeError::StaleHandle);
        }
        Ok(self.clone_subtree(node))
    }

    fn clone_payload(&mut self, src: NodeHandle) -> NodeHandle {
        let source = self.nodes.get(src).expect("validated by caller");
        let copy = Node {
            uid: source.uid,
            position: source.position,
            rotation: source.rotation,
            user_data: source.user_data.clone(),
            parent: None,
            children: Vec::new(),
            effector: source.effector.clone(),
            constraint: source.constraint.clone(),
        };
        self.nodes.insert(copy)
    }

    fn clone_subtree(&mut self, src: NodeHandle) -> NodeHandle {
        let copy = self.clone_payload(src);
        let children = self.nodes.get(src).expect("validated by caller").children.clone();
        for child in children {
            let child_copy = self.clone_subtree(child);
            self.nodes.get_mut(child_copy).expect("fresh copy").parent = Some(copy);
            self.nodes
                .get_mut(copy)
                .expect("fresh copy")
                .children
                .push(child_copy);
        }
        copy
    }

    /// True if `ancestor` appears on the parent walk from `node` to its
    /// root (a node is not its own ancestor).
    pub fn is_ancestor_of(&self, ancestor: NodeHandle, node: NodeHandle) -> bool {
        let mut current = self.nodes.get(node).and_then(|n| n.parent);
        while let Some(handle) = current {
            if handle == ancestor {
                return true;
            }
            current = self.nodes.get(handle).and_then(|n| n.parent);
        }
        false
    }

    /// Root of the subtree containing `node`.
    pub fn root_of(&self, node: NodeHandle) -> NodeHandle {
        let mut current = node;
        while let Some(parent) = self.nodes.get(current).and_then(|n| n.parent) {
            current = parent;
        }
        current
    }

    /// Pre-order traversal of the subtree rooted at `root`.
    pub fn visit_subtree(&self, root: NodeHandle, visit: &mut impl FnMut(NodeHandle)) {
        if !self.nodes.contains(root) {
            return;
        }
        visit(root);
        let children = self.nodes.get(root).expect("checked above").children.clone();
        for child in children {
            self.visit_subtree(child, visit);
        }
    }

    /// Number of nodes in the subtree rooted at `node` (itself included).
    pub fn subtree_size(&self, node: NodeHandle) -> usize {
        let mut count = 0;
        self.visit_subtree(node, &mut |_| count += 1);
        count
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    /// Attach an effector. At most one effector per node.
    ///
    /// # Errors
    ///
    /// [`TreeError::EffectorOccupied`] if the node already has one,
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn attach_effector(&mut self, node: NodeHandle, effector: Effector) -> Result<(), TreeError> {
        let target = self.node_mut(node)?;
        if target.effector.is_some() {
            return Err(TreeError::EffectorOccupied);
        }
        target.effector = Some(effector);
        Ok(())
    }

    /// Detach and return the node's effector.
    ///
    /// # Errors
    ///
    /// [`TreeError::NoEffector`] if nothing is attached,
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn detach_effector(&mut self, node: NodeHandle) -> Result<Effector, TreeError> {
        self.node_mut(node)?.effector.take().ok_or(TreeError::NoEffector)
    }

    /// Attach a constraint. If the node already carries a constraint chain
    /// the new constraint is appended at its tail.
    ///
    /// # Errors
    ///
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn attach_constraint(&mut self, node: NodeHandle, constraint: Constraint) -> Result<(), TreeError> {
        let target = self.node_mut(node)?;
        match &mut target.constraint {
            Some(head) => head.append(constraint),
            None => target.constraint = Some(Box::new(constraint)),
        }
        Ok(())
    }

    /// Detach and return the node's whole constraint chain.
    ///
    /// # Errors
    ///
    /// [`TreeError::NoConstraint`] if nothing is attached,
    /// [`TreeError::StaleHandle`] if the handle is dead.
    pub fn detach_constraint(&mut self, node: NodeHandle) -> Result<Constraint, TreeError> {
        self.node_mut(node)?
            .constraint
            .take()
            .map(|boxed| *boxed)
            .ok_or(TreeError::NoConstraint)
    }
}
