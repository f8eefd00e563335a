//! Named operations available per target kind.
//!
//! Graph-object operations run as methods of a node or edge on the cluster
//! workers, so a name that the target kind does not provide is rejected at
//! dispatch instead of failing on every worker. Row and item operations are
//! free functions resolved by the worker and are not checked here.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use cnet_core::{Error, FunctionRef, Result, TargetKind};

/// Name → supported target kinds, built at startup.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, HashSet<TargetKind>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `name` can be applied to each of `kinds`.
    pub fn register(&mut self, name: impl Into<String>, kinds: &[TargetKind]) -> &mut Self {
        let name = name.into();
        debug!(function = %name, ?kinds, "Registered operation");
        self.operations
            .entry(name)
            .or_default()
            .extend(kinds.iter().copied());
        self
    }

    pub fn with(mut self, name: impl Into<String>, kinds: &[TargetKind]) -> Self {
        self.register(name, kinds);
        self
    }

    pub fn supports(&self, name: &str, kind: TargetKind) -> bool {
        self.operations
            .get(name)
            .is_some_and(|kinds| kinds.contains(&kind))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Reject named graph operations the target kind does not provide.
    ///
    /// Serialized callables carry their own code and always pass.
    pub fn check(&self, function: &FunctionRef, kind: TargetKind) -> Result<()> {
        let FunctionRef::Named(name) = function else {
            return Ok(());
        };
        if kind.is_graph() && !self.supports(name, kind) {
            return Err(Error::MissingOperation {
                function: name.clone(),
                kind: kind.to_string(),
            });
        }
        Ok(())
    }
}
