//! Error types and the stable message constants they are built from.
//!
//! Message text is part of the public contract: callers assert on it, so the
//! raw strings live in [`messages`] and every error `Display` impl is derived
//! from them.

use crate::aspect::AdviceKind;
use crate::signal::Fault;

/// Stable message fragments used by the error types in this crate.
pub mod messages {
    /// A retry maximum was negative or not an integer.
    pub const RETRY_COUNT_INVALID: &str = "retry count must be a non-negative integer";
    /// A timeout delay was negative or non-finite.
    pub const TIMEOUT_DELAY_INVALID: &str = "timeout delay must be finite and non-negative";
    /// A dynamic timeout was constructed with a negative initial delay.
    pub const DYNAMIC_TIMEOUT_INITIAL_DELAY_NEGATIVE: &str =
        "dynamic timeout initial delay must be non-negative";
    /// A delay queued onto a dynamic timeout was negative.
    pub const DYNAMIC_TIMEOUT_QUEUE_DELAY_NEGATIVE: &str =
        "dynamic timeout queued delay must be non-negative";
    /// A dynamic timeout was mutated after it already rejected.
    pub const DYNAMIC_TIMEOUT_ALREADY_REJECTED: &str = "dynamic timeout has already rejected";
    /// A backoff strategy produced or consumed a negative delay.
    pub const BACKOFF_DELAY_NEGATIVE: &str = "backoff delay must stay non-negative";
    /// Two middlewares (or a middleware and a built-in) share a name.
    pub const DUPLICATE_MIDDLEWARE_NAME: &str = "duplicate middleware name";
    /// `determine_error` was invoked with an empty error list.
    pub const NO_ERROR_TO_DETERMINE: &str = "no error to determine";
    /// Two aspects in one process share a name.
    pub const DUPLICATE_ASPECT_NAME: &str = "duplicate aspect name";
    /// A `depends_on` entry names an aspect absent from the advice kind.
    pub const MISSING_DEPENDENCY: &str = "missing dependency";
    /// Two aspects in one execution level declare the same section.
    pub const SECTION_CONFLICT: &str = "section conflict";
    /// The dependency graph of an advice kind contains a cycle.
    pub const DEPENDENCY_CYCLE: &str = "dependency cycle";
    /// An advice read a section it did not declare in `uses`.
    pub const UNDECLARED_SECTION: &str = "undeclared section access";
}

/// Errors raised by [`SectionView`](crate::context::SectionView) accesses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SectionError {
    /// The section was not declared in the advice's `uses` list.
    #[error("{}: '{section}'", messages::UNDECLARED_SECTION)]
    Undeclared { section: String },
    /// The section is declared but absent from the shared context.
    #[error("section '{section}' is not present in the shared context")]
    Missing { section: String },
    /// The section exists but holds a value of a different type.
    #[error("section '{section}' holds a value of a different type")]
    TypeMismatch { section: String },
}

/// Errors raised by the ambient scope primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    /// No ambient scope is open on the current task.
    #[error("no ambient scope is open")]
    NoScope,
    /// The innermost scope has no parent to exit to.
    #[error("ambient scope has no parent to exit to")]
    NoParent,
    /// No enclosing scope binds the requested type.
    #[error("no ambient binding of type {type_name}")]
    NotBound { type_name: &'static str },
}

/// Errors detected while organizing aspects into a runnable process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessSetupError {
    /// Two aspects share one name.
    #[error("{}: '{aspect}'", messages::DUPLICATE_ASPECT_NAME)]
    DuplicateAspect { aspect: String },
    /// A dependency names an aspect that contributes no advice of this kind.
    #[error(
        "{}: '{dependency}' required by '{aspect}' in {kind}; available aspects: [{available}]",
        messages::MISSING_DEPENDENCY
    )]
    MissingDependency {
        aspect: String,
        dependency: String,
        kind: AdviceKind,
        available: String,
    },
    /// The dependency graph contains a cycle; `path` walks it.
    #[error("{} in {kind}: {path}", messages::DEPENDENCY_CYCLE)]
    DependencyCycle { kind: AdviceKind, path: String },
    /// Two entries in one execution level declare the same section.
    #[error(
        "{} in {kind}: section '{section}' declared by both '{first}' and '{second}'",
        messages::SECTION_CONFLICT
    )]
    SectionConflict {
        kind: AdviceKind,
        section: String,
        first: String,
        second: String,
    },
}

/// Errors raised when mutating a [`DynamicTimeout`](crate::timeout::DynamicTimeout)
/// that already rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutStateError {
    #[error("{}", messages::DYNAMIC_TIMEOUT_ALREADY_REJECTED)]
    AlreadyRejected,
}

/// Errors raised while constructing or addressing a loader.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoaderError {
    /// A middleware reuses a name already taken by another middleware.
    #[error("{}: '{name}'", messages::DUPLICATE_MIDDLEWARE_NAME)]
    DuplicateMiddleware { name: String },
    /// A middleware claims one of the reserved `__core__` names.
    #[error("middleware name '{name}' is reserved")]
    ReservedName { name: String },
    /// The backoff configuration starts from a negative or non-finite delay.
    #[error("{}", messages::BACKOFF_DELAY_NEGATIVE)]
    InvalidBackoff,
    /// The built-in aspects failed to organize.
    #[error(transparent)]
    Setup(#[from] ProcessSetupError),
    /// A per-invocation handle was used outside a loader invocation.
    #[error(transparent)]
    Scope(#[from] ScopeError),
    /// A per-invocation handle addressed a missing or mistyped section.
    #[error(transparent)]
    Section(#[from] SectionError),
}

/// Errors raised while parsing or validating raw configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{}: {value}", messages::RETRY_COUNT_INVALID)]
    RetryCount { value: i64 },
    #[error("{}: {value}", messages::TIMEOUT_DELAY_INVALID)]
    TimeoutDelay { value: f64 },
    #[error("{}: {value}", messages::DYNAMIC_TIMEOUT_INITIAL_DELAY_NEGATIVE)]
    InitialDelay { value: f64 },
    #[error("{}: {value}", messages::DYNAMIC_TIMEOUT_QUEUE_DELAY_NEGATIVE)]
    QueueDelay { value: f64 },
    #[error("{}: {value}", messages::BACKOFF_DELAY_NEGATIVE)]
    BackoffDelay { value: f64 },
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config io error: {0}")]
    Io(String),
}

/// Where a rejection was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOrigin {
    /// Raised by an advice body of the given kind.
    Advice(AdviceKind),
    /// Raised by the composed target.
    Target,
    /// Raised from an unexpected site; always halts the chain.
    Unknown,
}

/// One or more faults collected from a single site in the chain.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub errors: Vec<Fault>,
    pub origin: RejectionOrigin,
}

impl Rejection {
    /// Aggregate rejection raised by a batch of advice bodies.
    pub fn advice(kind: AdviceKind, errors: Vec<Fault>) -> Self {
        Self {
            errors,
            origin: RejectionOrigin::Advice(kind),
        }
    }

    /// Rejection raised by the composed target.
    pub fn target(fault: Fault) -> Self {
        Self {
            errors: vec![fault],
            origin: RejectionOrigin::Target,
        }
    }

    /// Rejection from a site the chain does not recognize.
    pub fn unknown(fault: Fault) -> Self {
        Self {
            errors: vec![fault],
            origin: RejectionOrigin::Unknown,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let origin = match self.origin {
            RejectionOrigin::Advice(kind) => format!("advice/{kind}"),
            RejectionOrigin::Target => "target".to_string(),
            RejectionOrigin::Unknown => "unknown".to_string(),
        };
        write!(f, "rejection from {origin}: [")?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for Rejection {}
