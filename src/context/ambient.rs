//! Ambient per-invocation scopes.
//!
//! A scope binds one typed value for the duration of a future and is visible
//! from any suspension point inside it, without threading the value through
//! parameters. Scopes nest; an inner binding of a type fully shadows outer
//! bindings of the same type. The binding type is the lookup key.
//!
//! Built on `tokio::task_local!`, so bindings survive every `.await` inside
//! the scoped future. Values are not inherited by spawned tasks; deferred
//! work that must observe a scope is re-entered through a [`Snapshot`].

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use crate::error::ScopeError;

tokio::task_local! {
    static CURRENT: ScopeFrame;
}

/// One link in the chain of open scopes.
#[derive(Clone)]
pub(crate) struct ScopeFrame {
    binding: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<ScopeFrame>>,
}

/// Opens a scope binding `value` and runs `body` inside it.
///
/// Any enclosing scope becomes the parent: [`current`] falls through to it
/// for types the new scope does not bind, and [`exit_outer`] returns to it.
pub async fn open<V, F>(value: V, body: F) -> F::Output
where
    V: Send + Sync + 'static,
    F: Future,
{
    let parent = CURRENT.try_with(|frame| frame.clone()).ok().map(Arc::new);
    let frame = ScopeFrame {
        binding: Arc::new(value),
        parent,
    };
    CURRENT.scope(frame, body).await
}

/// Like [`open`], producing the binding from a generator at entry.
pub async fn open_with<V, G, F>(generator: G, body: F) -> F::Output
where
    V: Send + Sync + 'static,
    G: FnOnce() -> V,
    F: Future,
{
    open(generator(), body).await
}

/// The nearest enclosing binding of type `V`.
pub fn current<V>() -> Result<Arc<V>, ScopeError>
where
    V: Send + Sync + 'static,
{
    let mut frame = CURRENT
        .try_with(|frame| frame.clone())
        .map_err(|_| ScopeError::NoScope)?;
    loop {
        if let Ok(value) = Arc::clone(&frame.binding).downcast::<V>() {
            return Ok(value);
        }
        match frame.parent {
            Some(parent) => frame = (*parent).clone(),
            None => {
                return Err(ScopeError::NotBound {
                    type_name: std::any::type_name::<V>(),
                });
            }
        }
    }
}

/// Runs `body` under the parent of the innermost scope.
///
/// Used when a nested invocation needs to push work onto the enclosing one.
pub async fn exit_outer<F>(body: F) -> Result<F::Output, ScopeError>
where
    F: Future,
{
    let parent = CURRENT
        .try_with(|frame| frame.parent.clone())
        .map_err(|_| ScopeError::NoScope)?;
    match parent {
        Some(parent) => Ok(CURRENT.scope((*parent).clone(), body).await),
        None => Err(ScopeError::NoParent),
    }
}

/// A captured scope chain that deferred work can re-enter.
///
/// Wrappers created during `around` advice capture a snapshot at composition
/// time, so the composed target observes the invocation's bindings even when
/// called from outside them.
#[derive(Clone)]
pub struct Snapshot {
    frame: Option<ScopeFrame>,
}

impl Snapshot {
    /// Captures whatever scope chain is open right now; empty when none is.
    pub fn capture() -> Self {
        Self {
            frame: CURRENT.try_with(|frame| frame.clone()).ok(),
        }
    }

    /// Runs `body` inside the captured chain.
    pub async fn enter<F>(&self, body: F) -> F::Output
    where
        F: Future,
    {
        match &self.frame {
            Some(frame) => CURRENT.scope(frame.clone(), body).await,
            None => body.await,
        }
    }
}
