//! Type-safe identifier wrappers.
//!
//! Cells, walkers, and tasks are numbered with plain integers because the
//! numbering is meaningful: cell ids come from the discretization of state
//! space, walker ids are dense and iteration-local, and task ids are
//! allocated sequentially by the executor. The run itself gets a UUID v7 so
//! checkpoints and monitor records from different runs never mix.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a newtype wrapper around `u64` with standard derives.
macro_rules! define_index {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Return the inner integer value.
            pub const fn into_inner(self) -> u64 {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_index! {
    /// Identifier of a discretized region of state space.
    CellId
}

define_index! {
    /// Iteration-local identifier of a walker within a `System`.
    WalkerId
}

define_index! {
    /// Identifier of one submitted task replica.
    TaskId
}

/// Unique identifier for an AWE run, stable across resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new run identifier using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Return the inner [`Uuid`] value.
    pub const fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for RunId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_display_is_the_number() {
        assert_eq!(CellId(42).to_string(), "42");
        assert_eq!(WalkerId::from(7).into_inner(), 7);
    }

    #[test]
    fn index_serializes_transparently() {
        let json = serde_json::to_string(&CellId(13)).ok();
        assert_eq!(json.as_deref(), Some("13"));
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
        assert_ne!(RunId::new().into_inner(), Uuid::nil());
    }
}
