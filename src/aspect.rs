//! Aspects and their advice entries.
//!
//! An [`Aspect`] is a named bundle of up to five advice bodies, one per
//! [`AdviceKind`]. Bodies are async closures stored behind `Arc`, in the same
//! spirit as quick function-based components elsewhere in the ecosystem: no
//! trait to implement, just a closure per lifecycle point. Each advice may
//! declare the context sections it reads (`uses`) and the aspects it must run
//! after (`depends_on`).

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::SectionView;
use crate::process::around::AroundApi;
use crate::signal::Fault;

/// The five lifecycle points an aspect can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdviceKind {
    Before,
    Around,
    AfterReturning,
    AfterThrowing,
    After,
}

impl AdviceKind {
    pub const ALL: [AdviceKind; 5] = [
        AdviceKind::Before,
        AdviceKind::Around,
        AdviceKind::AfterReturning,
        AdviceKind::AfterThrowing,
        AdviceKind::After,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AdviceKind::Before => "before",
            AdviceKind::Around => "around",
            AdviceKind::AfterReturning => "afterReturning",
            AdviceKind::AfterThrowing => "afterThrowing",
            AdviceKind::After => "after",
        }
    }
}

impl std::fmt::Display for AdviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one advice body.
pub type AdviceResult = Result<(), Fault>;

/// Outcome of the (possibly wrapped) target.
pub type TargetResult<T> = Result<T, Fault>;

/// The async target a process wraps, callable any number of times.
pub type TargetFn<T> = Arc<dyn Fn() -> BoxFuture<'static, TargetResult<T>> + Send + Sync>;

/// A wrapper registered during `around` advice: target in, wrapped target out.
pub type TargetWrapper<T> = Arc<dyn Fn(TargetFn<T>) -> TargetFn<T> + Send + Sync>;

/// Body of `before`, `afterReturning` and `after` advice.
pub type EffectFn = Arc<dyn Fn(SectionView) -> BoxFuture<'static, AdviceResult> + Send + Sync>;

/// Body of `around` advice; registers wrappers through the [`AroundApi`].
pub type AroundFn<T> =
    Arc<dyn Fn(SectionView, AroundApi<T>) -> BoxFuture<'static, AdviceResult> + Send + Sync>;

/// Body of `afterThrowing` advice; receives the thrown fault.
pub type CatchFn = Arc<dyn Fn(SectionView, Fault) -> BoxFuture<'static, AdviceResult> + Send + Sync>;

/// One advice entry: a body plus its section and ordering declarations.
pub struct Advice<F> {
    pub(crate) body: F,
    pub(crate) uses: Vec<String>,
    pub(crate) depends_on: Vec<String>,
}

impl<F: Clone> Clone for Advice<F> {
    fn clone(&self) -> Self {
        Self {
            body: self.body.clone(),
            uses: self.uses.clone(),
            depends_on: self.depends_on.clone(),
        }
    }
}

impl<F> Advice<F> {
    /// Declares the sections this advice will read. Reading anything else
    /// errors at runtime.
    pub fn uses<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uses = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Declares the aspects this advice must run after, within its kind.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = names.into_iter().map(Into::into).collect();
        self
    }
}

impl Advice<EffectFn> {
    /// A side-effect advice body, usable for `before`, `afterReturning` and
    /// `after`.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(SectionView) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AdviceResult> + Send + 'static,
    {
        Self {
            body: Arc::new(move |view| Box::pin(body(view))),
            uses: Vec::new(),
            depends_on: Vec::new(),
        }
    }
}

impl<T: Send + 'static> Advice<AroundFn<T>> {
    /// An `around` advice body.
    pub fn around<F, Fut>(body: F) -> Self
    where
        F: Fn(SectionView, AroundApi<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AdviceResult> + Send + 'static,
    {
        Self {
            body: Arc::new(move |view, api| Box::pin(body(view, api))),
            uses: Vec::new(),
            depends_on: Vec::new(),
        }
    }
}

impl Advice<CatchFn> {
    /// An `afterThrowing` advice body.
    pub fn catching<F, Fut>(body: F) -> Self
    where
        F: Fn(SectionView, Fault) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AdviceResult> + Send + 'static,
    {
        Self {
            body: Arc::new(move |view, fault| Box::pin(body(view, fault))),
            uses: Vec::new(),
            depends_on: Vec::new(),
        }
    }
}

/// A named bundle of advice, at most one entry per kind.
pub struct Aspect<T> {
    pub(crate) name: String,
    pub(crate) before: Option<Advice<EffectFn>>,
    pub(crate) around: Option<Advice<AroundFn<T>>>,
    pub(crate) after_returning: Option<Advice<EffectFn>>,
    pub(crate) after_throwing: Option<Advice<CatchFn>>,
    pub(crate) after: Option<Advice<EffectFn>>,
}

impl<T> Aspect<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: None,
            around: None,
            after_returning: None,
            after_throwing: None,
            after: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn on_before(mut self, advice: Advice<EffectFn>) -> Self {
        self.before = Some(advice);
        self
    }

    pub fn on_around(mut self, advice: Advice<AroundFn<T>>) -> Self {
        self.around = Some(advice);
        self
    }

    pub fn on_after_returning(mut self, advice: Advice<EffectFn>) -> Self {
        self.after_returning = Some(advice);
        self
    }

    pub fn on_after_throwing(mut self, advice: Advice<CatchFn>) -> Self {
        self.after_throwing = Some(advice);
        self
    }

    pub fn on_after(mut self, advice: Advice<EffectFn>) -> Self {
        self.after = Some(advice);
        self
    }
}

/// Adapts a plain async closure into a [`TargetFn`].
pub fn target_fn<T, F, Fut>(f: F) -> TargetFn<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TargetResult<T>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}
