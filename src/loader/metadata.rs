//! Loader identity and the retry propagation decision.
//!
//! Every `execute` pushes the loader's identifier onto an ambient hierarchy
//! (oldest first), inherited from any enclosing loader invocation. The
//! hierarchy answers whether a retry signal should escape the current loader
//! or be consumed by it.

use uuid::Uuid;

/// Ordered identifiers of the enclosing loader invocations, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderMetadata {
    hierarchy: Vec<Uuid>,
}

impl LoaderMetadata {
    pub(crate) fn child_of(parent: Option<&LoaderMetadata>, id: Uuid) -> Self {
        let mut hierarchy = parent.map(|p| p.hierarchy.clone()).unwrap_or_default();
        hierarchy.push(id);
        Self { hierarchy }
    }

    pub fn hierarchy(&self) -> &[Uuid] {
        &self.hierarchy
    }

    /// The innermost loader's identifier.
    pub fn current(&self) -> Option<Uuid> {
        self.hierarchy.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.hierarchy.len()
    }

    pub(crate) fn should_propagate(&self, id: Uuid, policy: PropagateRetry) -> bool {
        match policy {
            PropagateRetry::Always => true,
            PropagateRetry::Never => false,
            PropagateRetry::HasOuterContext => self.hierarchy.len() > 1,
            PropagateRetry::HasSameOuterContext => {
                let len = self.hierarchy.len();
                len >= 2 && self.hierarchy[len - 2] == id
            }
        }
    }
}

/// Whether a retry signal escapes the loader that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagateRetry {
    Always,
    #[default]
    Never,
    /// Propagate only when an enclosing loader invocation exists.
    HasOuterContext,
    /// Propagate only when the invocation directly above belongs to the
    /// same loader (a recursive self-call).
    HasSameOuterContext,
}

impl From<bool> for PropagateRetry {
    fn from(flag: bool) -> Self {
        if flag {
            PropagateRetry::Always
        } else {
            PropagateRetry::Never
        }
    }
}
