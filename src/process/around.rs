//! Wrapper registration and resolution for `around` advice.
//!
//! Two pipelines accumulate during the around batch: target wrappers sit
//! closest to the target, result wrappers closest to the caller. For pushes
//! t1, t2, t3 the composition is `t3(t2(t1(target)))` — the last push is the
//! outermost among its pipeline. Between the two pipelines sits an ambient
//! snapshot, so deferred calls into the composed function still observe the
//! invocation's scope.

use std::sync::{Arc, Mutex, PoisonError};

use crate::aspect::{TargetFn, TargetWrapper};
use crate::context::ambient::Snapshot;

pub(crate) struct WrapperSet<T> {
    pub target: Vec<TargetWrapper<T>>,
    pub result: Vec<TargetWrapper<T>>,
}

impl<T> Default for WrapperSet<T> {
    fn default() -> Self {
        Self {
            target: Vec::new(),
            result: Vec::new(),
        }
    }
}

/// Registration handle passed to every `around` advice body.
pub struct AroundApi<T> {
    wrappers: Arc<Mutex<WrapperSet<T>>>,
}

impl<T> Clone for AroundApi<T> {
    fn clone(&self) -> Self {
        Self {
            wrappers: Arc::clone(&self.wrappers),
        }
    }
}

impl<T: Send + 'static> AroundApi<T> {
    pub(crate) fn new() -> Self {
        Self {
            wrappers: Arc::new(Mutex::new(WrapperSet::default())),
        }
    }

    /// Prepends `wrapper` to the pipeline closest to the target.
    pub fn attach_to_target<W>(&self, wrapper: W)
    where
        W: Fn(TargetFn<T>) -> TargetFn<T> + Send + Sync + 'static,
    {
        self.lock().target.push(Arc::new(wrapper));
    }

    /// Prepends `wrapper` to the pipeline closest to the caller.
    pub fn attach_to_result<W>(&self, wrapper: W)
    where
        W: Fn(TargetFn<T>) -> TargetFn<T> + Send + Sync + 'static,
    {
        self.lock().result.push(Arc::new(wrapper));
    }

    pub(crate) fn take(&self) -> WrapperSet<T> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WrapperSet<T>> {
        self.wrappers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Folds both pipelines around `target` and binds the ambient snapshot
/// between them.
pub(crate) fn resolve<T: Send + 'static>(set: WrapperSet<T>, target: TargetFn<T>) -> TargetFn<T> {
    let inner = set
        .target
        .into_iter()
        .fold(target, |wrapped, wrapper| wrapper(wrapped));
    let snapped = bind_snapshot(inner);
    set.result
        .into_iter()
        .fold(snapped, |wrapped, wrapper| wrapper(wrapped))
}

fn bind_snapshot<T: Send + 'static>(target: TargetFn<T>) -> TargetFn<T> {
    let snapshot = Snapshot::capture();
    Arc::new(move || {
        let target = Arc::clone(&target);
        let snapshot = snapshot.clone();
        Box::pin(async move { snapshot.enter(target()).await })
    })
}
