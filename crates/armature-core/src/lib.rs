// armature-core: ids, configuration, feature flags, and errors for the armature IK workspace.

pub mod config;
pub mod error;
pub mod types;

pub use config::{SolverConfig, SolverFeatures};
pub use error::{ArmatureError, ConfigError, SolveError, TreeError};
pub use types::NodeUid;
