//! # Aspectflow
//!
//! An aspect-oriented process engine for asynchronous targets, plus a loader
//! that layers retry, timeout and backoff on top of it.
//!
//! Aspectflow models a wrapped invocation as **Aspects + Shared Context**:
//! - **Aspect**: a named bundle of advice attached to the five lifecycle
//!   points of a target invocation
//! - **Process**: organizes aspects into dependency-ordered batches around a
//!   single async target
//! - **Shared Context**: per-invocation sections that advice bodies read
//!   through restricted views
//!
//! ## Architecture
//!
//! ### Core
//! - `aspect`: advice kinds, advice entries and the aspect builder
//! - `process`: the organizer, batch executor, around resolver and chain
//! - `context`: ambient scopes and the shared context
//! - `signal`: control-flow sentinels with priorities, and [`Fault`]
//! - `timeout`: the dynamic deadline primitive
//!
//! ### Loader
//! - `loader`: the retry/timeout/backoff facade, built-in aspects, user
//!   middlewares and per-invocation handles
//! - `config`: serde-backed raw configuration with validation
//!
//! ## Execution model
//!
//! Per invocation the chain runs `before` → `around` → target →
//! (`afterReturning` | `afterThrowing`) → `after` inside an ambient scope,
//! then resolves collected rejections in two phases: one error is chosen and
//! offered for recovery, continued rejections are reported for observation.
//! The loader's built-in aspects feed retry signals back into this exit so a
//! failed attempt can re-enter the whole chain with its state carried over.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use aspectflow::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let loader: Loader<String> = Loader::builder(LoaderInput::new(
//!     RetryInput::new(2).retry_on(true),
//!     TimeoutInput::new(Duration::from_secs(5)),
//! ))
//! .build()
//! .unwrap();
//!
//! let result = loader.execute_fn(|| async { Ok("done".to_string()) }).await;
//! assert_eq!(result.unwrap(), ProcessOutput::Value("done".to_string()));
//! # }
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

pub mod aspect;
pub mod config;
pub mod context;
pub mod error;
pub mod loader;
pub mod process;
pub mod signal;
pub mod timeout;

// ============================================================================
// CORE RE-EXPORTS
// ============================================================================

// Aspect model
pub use aspect::{Advice, AdviceKind, AdviceResult, Aspect, TargetFn, TargetResult, target_fn};

// Process engine
pub use process::{
    AfterThrow, AroundApi, BuildOptions, ContextGenerator, ErrorAggregation, ExecutionStrategy,
    ExitHandle, KindOptions, Process, ProcessOptions, ProcessOutput,
};

// Shared context
pub use context::{Section, SectionView, SharedContext, SharedContextBuilder};

// Signals and faults
pub use signal::{Fault, RetrySignal, Signal, priority};

// Errors and stable messages
pub use error::{
    ConfigError, LoaderError, ProcessSetupError, Rejection, RejectionOrigin, ScopeError,
    SectionError, TimeoutStateError, messages,
};

// Dynamic deadline
pub use timeout::DynamicTimeout;

// Loader facade
pub use loader::{
    BackoffInput, BackoffStrategy, FallbackFactory, Loader, LoaderBuilder, LoaderInput,
    LoaderMetadata, Middleware, PropagateRetry, RetryCondition, RetryInput, Target, TimeoutInput,
    fallback_target, loader_options, middleware_options, retry_fallback, retry_immediately,
    retry_immediately_with,
};

// Configuration
pub use config::{LoaderConfig, LoaderSettings};

/// Convenient re-exports for common types and functions.
pub mod prelude {
    pub use crate::aspect::{
        Advice, AdviceKind, AdviceResult, Aspect, TargetFn, TargetResult, target_fn,
    };
    pub use crate::config::{LoaderConfig, LoaderSettings};
    pub use crate::context::{SectionView, SharedContext};
    pub use crate::error::{LoaderError, ProcessSetupError, Rejection, RejectionOrigin};
    pub use crate::loader::{
        BackoffInput, BackoffStrategy, Loader, LoaderInput, Middleware, PropagateRetry,
        RetryCondition, RetryInput, Target, TimeoutInput, fallback_target, loader_options,
        middleware_options, retry_fallback, retry_immediately, retry_immediately_with,
    };
    pub use crate::process::{AroundApi, BuildOptions, Process, ProcessOptions, ProcessOutput};
    pub use crate::signal::{Fault, RetrySignal, Signal};
    pub use crate::timeout::DynamicTimeout;
}
