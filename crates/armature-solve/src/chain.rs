//! Chain extraction: walking the tree from each effector toward the root
//! and splitting at junctions.
//!
//! Each effector contributes one walk of at most `chain_length` ancestors
//! (0 = all the way to the solver root). Where walks share trailing nodes
//! the shared run is represented once: the junction node becomes the base
//! of every tip-side chain and the tip of the shared base-side chain, and
//! the solve order puts tip-side chains first so their influences merge at
//! the junction instead of overwriting each other.

use std::collections::HashMap;

use armature_tree::{NodeHandle, Tree};
use log::debug;

/// A contiguous run of joints treated as a rigid-length linkage.
#[derive(Debug, Clone)]
pub struct Chain {
    /// Joints ordered tip to base.
    nodes: Vec<NodeHandle>,
    /// Rest lengths; `lengths[i]` spans `nodes[i]` to `nodes[i + 1]`.
    lengths: Vec<f32>,
    /// The tip node, when it carries the driving effector.
    effector: Option<NodeHandle>,
    /// Chain this chain's base merges into.
    parent: Option<usize>,
    /// Chains merging into this chain's tip.
    children: Vec<usize>,
}

impl Chain {
    /// Joints ordered tip to base.
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Joints reordered base to tip (the order solvers iterate in).
    pub fn joints_base_to_tip(&self) -> Vec<NodeHandle> {
        self.nodes.iter().rev().copied().collect()
    }

    pub fn tip(&self) -> NodeHandle {
        self.nodes[0]
    }

    pub fn base(&self) -> NodeHandle {
        *self.nodes.last().expect("chains are never empty")
    }

    pub fn segment_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    /// Cached rest lengths in base-to-tip order.
    pub fn lengths_base_to_tip(&self) -> Vec<f32> {
        self.lengths.iter().rev().copied().collect()
    }

    pub fn total_length(&self) -> f32 {
        self.lengths.iter().sum()
    }

    pub const fn effector(&self) -> Option<NodeHandle> {
        self.effector
    }

    pub const fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

/// All chains extracted from one tree, plus their solve order.
#[derive(Debug, Clone, Default)]
pub struct ChainSet {
    chains: Vec<Chain>,
    /// Chain indices with every chain before the chain it merges into.
    order: Vec<usize>,
}

impl ChainSet {
    /// Extract chains for every effector reachable from `root`.
    pub fn build(tree: &Tree, root: NodeHandle) -> Self {
        let mut effector_nodes = Vec::new();
        tree.visit_subtree(root, &mut |handle| {
            if tree.node(handle).is_ok_and(|n| n.effector().is_some()) {
                effector_nodes.push(handle);
            }
        });

        // One walk per effector, tip first, bounded by chain_length.
        let mut walks: Vec<Vec<NodeHandle>> = Vec::with_capacity(effector_nodes.len());
        for &tip in &effector_nodes {
            let chain_length = tree
                .node(tip)
                .ok()
                .and_then(|n| n.effector())
                .map_or(0, |e| e.chain_length);
            let mut walk = vec![tip];
            let mut current = tip;
            let mut remaining = chain_length;
            loop {
                if current == root {
                    if chain_length != 0 && remaining > 0 {
                        debug!(
                            "effector chain_length {chain_length} clamped at the root \
                             ({remaining} joints short)"
                        );
                    }
                    break;
                }
                let Some(parent) = tree.node(current).ok().and_then(|n| n.parent()) else {
                    break;
                };
                walk.push(parent);
                current = parent;
                if chain_length != 0 {
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
            }
            walks.push(walk);
        }

        // Count how many walks pass through each node; the count rises
        // exactly where walks merge.
        let mut marks: HashMap<NodeHandle, u32> = HashMap::new();
        for walk in &walks {
            for &node in walk {
                *marks.entry(node).or_insert(0) += 1;
            }
        }

        // Cut each walk at its mark jumps. The junction node terminates
        // the tip-side piece and starts the base-side piece, so shared
        // runs come out identical across walks and dedupe below.
        let mut chains: Vec<Chain> = Vec::new();
        let mut seen: HashMap<Vec<NodeHandle>, usize> = HashMap::new();
        for walk in &walks {
            let mut piece = vec![walk[0]];
            for window in walk.windows(2) {
                let (node, toward_base) = (window[0], window[1]);
                piece.push(toward_base);
                if marks[&toward_base] > marks[&node] {
                    Self::push_piece(&mut chains, &mut seen, std::mem::take(&mut piece), tree);
                    piece.push(toward_base);
                }
            }
            // A trailing single junction node belongs to the previous
            // piece already; anything longer is a real chain. The sole
            // exception is a one-node walk (effector on the chain root).
            if piece.len() > 1 || walk.len() == 1 {
                Self::push_piece(&mut chains, &mut seen, piece, tree);
            }
        }

        // Link chains whose base is another chain's tip.
        let tips: HashMap<NodeHandle, usize> = chains
            .iter()
            .enumerate()
            .map(|(index, chain)| (chain.tip(), index))
            .collect();
        for index in 0..chains.len() {
            let base = chains[index].base();
            if base == chains[index].tip() {
                continue;
            }
            if let Some(&parent) = tips.get(&base) {
                chains[index].parent = Some(parent);
                chains[parent].children.push(index);
            }
        }

        // Solve order: post-order from the base-side chains, so every
        // chain comes before the one it merges into.
        let mut order = Vec::with_capacity(chains.len());
        let roots: Vec<usize> = (0..chains.len())
            .filter(|&i| chains[i].parent.is_none())
            .collect();
        for root_chain in roots {
            Self::post_order(&chains, root_chain, &mut order);
        }

        debug!(
            "chain set built: {} effectors, {} chains",
            effector_nodes.len(),
            chains.len()
        );

        let mut set = Self { chains, order };
        set.update_distances(tree);
        set
    }

    fn push_piece(
        chains: &mut Vec<Chain>,
        seen: &mut HashMap<Vec<NodeHandle>, usize>,
        piece: Vec<NodeHandle>,
        tree: &Tree,
    ) {
        if piece.is_empty() || seen.contains_key(&piece) {
            return;
        }
        let tip = piece[0];
        let effector = tree
            .node(tip)
            .is_ok_and(|n| n.effector().is_some())
            .then_some(tip);
        seen.insert(piece.clone(), chains.len());
        chains.push(Chain {
            lengths: vec![0.0; piece.len().saturating_sub(1)],
            nodes: piece,
            effector,
            parent: None,
            children: Vec::new(),
        });
    }

    fn post_order(chains: &[Chain], index: usize, order: &mut Vec<usize>) {
        for &child in &chains[index].children {
            Self::post_order(chains, child, order);
        }
        order.push(index);
    }

    /// Recompute cached rest lengths from current local positions. Must be
    /// called whenever base positions change structurally, not just during
    /// solve iteration.
    pub fn update_distances(&mut self, tree: &Tree) {
        for chain in &mut self.chains {
            for (i, length) in chain.lengths.iter_mut().enumerate() {
                // nodes[i] is the tip-side joint of the segment; its local
                // position is the offset from nodes[i + 1], its parent.
                *length = tree
                    .node(chain.nodes[i])
                    .map_or(0.0, |node| node.position.norm());
            }
        }
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    /// Indices in solve order (tip-side chains before base-side chains).
    pub fn solve_order(&self) -> &[usize] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Every node that appears in some chain, deduplicated, in solve order.
    pub fn affected_nodes(&self) -> Vec<NodeHandle> {
        let mut nodes = Vec::new();
        for &index in &self.order {
            for &node in &self.chains[index].nodes {
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }

    /// Base node of every chain that does not merge into another chain.
    pub fn base_nodes(&self) -> Vec<NodeHandle> {
        let mut nodes = Vec::new();
        for chain in &self.chains {
            if chain.parent.is_none() && !nodes.contains(&chain.base()) {
                nodes.push(chain.base());
            }
        }
        nodes
    }
}
