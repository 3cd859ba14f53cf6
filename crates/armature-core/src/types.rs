use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, user-assigned node identifier.
///
/// Uids are carried by nodes for the host's benefit (lookup, retargeting,
/// serialization on the host side); the library never derives meaning from
/// them and does not enforce uniqueness across a tree. Searches such as
/// `find_child` return the first match in child insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeUid(pub u64);

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid:{}", self.0)
    }
}

impl From<u64> for NodeUid {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
