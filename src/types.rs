//! NewType wrappers for the identifiers that flow through the engine.
//!
//! Plan node ids, node execution ids, task ids and resume keys are all strings
//! on the wire; the wrappers keep them from being swapped by accident.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Adds a random (UUID v4) constructor to a newtype.
macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }
    };
}

newtype_string!(
    /// Identifier of one pipeline run (one instantiation of a plan).
    RunId
);
generated_id!(RunId);

newtype_string!(
    /// Identifier of a node inside a plan graph.
    ///
    /// Stable across runs of the same plan; many `NodeExecutionId`s can point
    /// at one `PlanNodeId`.
    PlanNodeId
);

newtype_string!(
    /// Identifier of one runtime instantiation of a plan node.
    NodeExecutionId
);
generated_id!(NodeExecutionId);

newtype_string!(
    /// Identifier of a unit of remote work.
    TaskId
);
generated_id!(TaskId);

newtype_string!(
    /// Identifier of a remote worker.
    WorkerId
);

newtype_string!(
    /// Opaque correlation key a suspended execution waits on.
    ResumeKey
);

newtype_string!(
    /// Name of a capacity-bounded resource.
    ResourceKey
);

impl ResumeKey {
    /// Key a parent waits on for one child branch to finish.
    pub fn for_child(child: &NodeExecutionId) -> Self {
        Self(format!("child:{}", child))
    }

    /// Key an `INTERVENTION_WAITING` node waits on.
    pub fn for_intervention(node_execution_id: &NodeExecutionId) -> Self {
        Self(format!("intervention:{}", node_execution_id))
    }

    /// Key a queued resource waiter is woken through.
    pub fn for_resource(resource_key: &ResourceKey, holder: &NodeExecutionId) -> Self {
        Self(format!("resource:{}:{}", resource_key, holder))
    }

    /// Key a task-chain step waits on: the task id itself.
    pub fn for_task(task_id: &TaskId) -> Self {
        Self(task_id.as_str().to_string())
    }
}
