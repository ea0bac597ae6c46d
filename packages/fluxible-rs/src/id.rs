//! Transaction identifiers.
//!
//! A [`RootId`] is drawn once per root-level `execute_action` and shared by
//! every action that root transitively triggers. It is a correlation tag,
//! not a security token: uniqueness is probabilistic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest identifier ever drawn (2^53).
pub const MAX_ROOT_ID: u64 = 1 << 53;

/// Identifier shared by a root action invocation and all of its nested actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootId(u64);

impl RootId {
    /// Draw a new identifier uniformly from `[1, 2^53]`.
    pub fn generate() -> Self {
        Self(fastrand::u64(1..=MAX_ROOT_ID))
    }

    /// Get the numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<RootId> for u64 {
    fn from(id: RootId) -> u64 {
        id.0
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
