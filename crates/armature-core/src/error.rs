use thiserror::Error;

/// Top-level error type for the armature workspace.
#[derive(Debug, Error)]
pub enum ArmatureError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Solve error: {0}")]
    Solve(#[from] SolveError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Structural tree errors.
///
/// Copy + static messages for cheap propagation in hot paths. Every
/// operation that can return one of these rejects atomically: the tree is
/// left exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("Handle is stale or does not belong to this tree")]
    StaleHandle,

    #[error("Node already has a parent; unlink it first")]
    AlreadyParented,

    #[error("Linking would create a cycle")]
    WouldCycle,

    #[error("A node cannot be linked under itself")]
    SelfParent,

    #[error("Node already has an effector attached")]
    EffectorOccupied,

    #[error("Node has no effector attached")]
    NoEffector,

    #[error("Node has no constraint attached")]
    NoConstraint,
}

/// Solver lifecycle errors.
///
/// Numerical non-convergence is deliberately absent: an unreachable target
/// is an expected outcome reported through the solve report, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SolveError {
    #[error("Solver has no tree; call set_tree first")]
    NoTree,

    #[error("Chains are stale; call rebuild before solve")]
    NotRebuilt,

    #[error("Chain with {segments} segments is not supported by this algorithm")]
    UnsupportedChain { segments: usize },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("max_iterations must be >= 1")]
    InvalidMaxIterations,

    #[error("Invalid tolerance: {0} (must be > 0)")]
    InvalidTolerance(f32),

    #[error("Invalid effector weight: {0} (must be in [0, 1])")]
    InvalidWeight(f32),
}
