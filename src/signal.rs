//! Signals and the fault currency of the engine.
//!
//! A [`Signal`] is a control-flow sentinel carrying a numeric priority; an
//! ordinary error ranks below every signal. Both travel through the chain as
//! a [`Fault`], the single cloneable error value used by advice bodies,
//! targets and the two-phase exit hooks. Signals are plain values: user code
//! may catch and inspect them, though they usually propagate.

use std::fmt;
use std::sync::Arc;

/// Fixed signal priorities, highest first.
pub mod priority {
    pub const MIDDLEWARE_INVALID: i32 = 100;
    pub const TIMEOUT: i32 = 90;
    pub const RETRY_EXCEEDED: i32 = 80;
    pub const RETRY: i32 = 70;
    /// Default for custom signals: above ordinary errors, below the built-ins.
    pub const CUSTOM_DEFAULT: i32 = 10;
    /// Ordinary (non-signal) errors.
    pub const ERROR: i32 = 0;
}

/// Payload of a retry signal.
#[derive(Debug, Clone)]
pub struct RetrySignal {
    /// The error that triggered the retry, when one exists.
    pub error_reason: Option<Box<Fault>>,
    /// Whether the signal escaped the loader that raised it.
    pub propagated: bool,
}

/// Typed control-flow sentinels with a defined priority ordering:
/// middleware-invalid > timeout > retry-exceeded > retry > custom signals >
/// ordinary errors.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A middleware or built-in aspect is misconfigured or misbehaving.
    MiddlewareInvalid { message: String },
    /// A pending deadline fired before the target settled.
    Timeout,
    /// The retry budget is exhausted.
    RetryExceeded { max_count: u32 },
    /// The current attempt should be retried.
    Retry(RetrySignal),
    /// A user-defined sentinel.
    Custom { name: String, priority: i32 },
}

impl Signal {
    /// A retry signal, optionally carrying the originating error.
    pub fn retry(error_reason: Option<Fault>) -> Self {
        Signal::Retry(RetrySignal {
            error_reason: error_reason.map(Box::new),
            propagated: false,
        })
    }

    /// A user-defined signal with an explicit priority.
    pub fn custom(name: impl Into<String>, priority: i32) -> Self {
        Signal::Custom {
            name: name.into(),
            priority,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            Signal::MiddlewareInvalid { .. } => priority::MIDDLEWARE_INVALID,
            Signal::Timeout => priority::TIMEOUT,
            Signal::RetryExceeded { .. } => priority::RETRY_EXCEEDED,
            Signal::Retry(_) => priority::RETRY,
            Signal::Custom { priority, .. } => *priority,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::MiddlewareInvalid { message } => write!(f, "middleware invalid: {message}"),
            Signal::Timeout => write!(f, "timeout"),
            Signal::RetryExceeded { max_count } => {
                write!(f, "retry exceeded (max {max_count})")
            }
            Signal::Retry(rs) => match (&rs.error_reason, rs.propagated) {
                (Some(reason), true) => write!(f, "retry (propagated, caused by: {reason})"),
                (Some(reason), false) => write!(f, "retry (caused by: {reason})"),
                (None, true) => write!(f, "retry (propagated)"),
                (None, false) => write!(f, "retry"),
            },
            Signal::Custom { name, priority } => write!(f, "signal '{name}' ({priority})"),
        }
    }
}

/// The error currency of the engine: either a signal or an ordinary error.
///
/// Faults are cheap to clone so they can be aggregated, re-raised across
/// retries and carried as a retry reason.
#[derive(Debug, Clone)]
pub enum Fault {
    Signal(Signal),
    Error(Arc<dyn std::error::Error + Send + Sync>),
}

impl Fault {
    pub fn signal(signal: Signal) -> Self {
        Fault::Signal(signal)
    }

    /// Wrap any error value.
    pub fn error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Fault::Error(Arc::new(error))
    }

    /// Wrap a bare message.
    pub fn msg(message: impl Into<String>) -> Self {
        Fault::Error(Arc::new(Message(message.into())))
    }

    pub fn is_signal(&self) -> bool {
        matches!(self, Fault::Signal(_))
    }

    pub fn as_signal(&self) -> Option<&Signal> {
        match self {
            Fault::Signal(s) => Some(s),
            Fault::Error(_) => None,
        }
    }

    pub fn as_retry(&self) -> Option<&RetrySignal> {
        match self {
            Fault::Signal(Signal::Retry(rs)) => Some(rs),
            _ => None,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            Fault::Signal(s) => s.priority(),
            Fault::Error(_) => priority::ERROR,
        }
    }

    /// The highest-priority signal in `faults`, ties broken by first
    /// occurrence; `None` when no fault is a signal.
    pub fn highest_signal(faults: &[Fault]) -> Option<&Fault> {
        let mut best: Option<&Fault> = None;
        for fault in faults.iter().filter(|f| f.is_signal()) {
            match best {
                Some(b) if fault.priority() <= b.priority() => {}
                _ => best = Some(fault),
            }
        }
        best
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Signal(s) => write!(f, "{s}"),
            Fault::Error(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Fault::Signal(_) => None,
            Fault::Error(e) => Some(e.as_ref()),
        }
    }
}

impl From<Signal> for Fault {
    fn from(signal: Signal) -> Self {
        Fault::Signal(signal)
    }
}

impl From<crate::error::SectionError> for Fault {
    fn from(error: crate::error::SectionError) -> Self {
        Fault::error(error)
    }
}

impl From<crate::error::ScopeError> for Fault {
    fn from(error: crate::error::ScopeError) -> Self {
        Fault::error(error)
    }
}

impl From<crate::error::LoaderError> for Fault {
    fn from(error: crate::error::LoaderError) -> Self {
        Fault::error(error)
    }
}

impl From<crate::error::TimeoutStateError> for Fault {
    fn from(error: crate::error::TimeoutStateError) -> Self {
        Fault::error(error)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);
