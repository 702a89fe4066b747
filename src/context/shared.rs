//! The per-invocation shared context and its restricted views.
//!
//! A [`SharedContext`] maps section keys to arbitrary values. It is built
//! once per invocation and its key set is immutable afterwards; section
//! values that need to change use interior mutability. Advice bodies never
//! see the whole context: each receives a [`SectionView`] limited to the
//! sections it declared, and any undeclared access errors.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SectionError;

/// A type-erased section value.
pub type Section = Arc<dyn Any + Send + Sync>;

/// Immutable map from section key to section value, generated fresh per
/// invocation and discarded at its end.
#[derive(Clone, Default)]
pub struct SharedContext {
    sections: HashMap<String, Section>,
}

impl SharedContext {
    pub fn builder() -> SharedContextBuilder {
        SharedContextBuilder::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sections.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Unrestricted typed access to a section.
    pub fn section<V>(&self, key: &str) -> Result<Arc<V>, SectionError>
    where
        V: Send + Sync + 'static,
    {
        let raw = self.sections.get(key).ok_or_else(|| SectionError::Missing {
            section: key.to_string(),
        })?;
        Arc::clone(raw)
            .downcast::<V>()
            .map_err(|_| SectionError::TypeMismatch {
                section: key.to_string(),
            })
    }

    pub(crate) fn raw(&self, key: &str) -> Option<&Section> {
        self.sections.get(key)
    }
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("SharedContext").field("keys", &keys).finish()
    }
}

/// Builder for a [`SharedContext`]; the key set freezes at `build()`.
#[derive(Default)]
pub struct SharedContextBuilder {
    sections: HashMap<String, Section>,
}

impl SharedContextBuilder {
    /// Adds a typed section. A repeated key overwrites the earlier value.
    pub fn section<V>(mut self, key: impl Into<String>, value: V) -> Self
    where
        V: Send + Sync + 'static,
    {
        self.sections.insert(key.into(), Arc::new(value));
        self
    }

    /// Adds an already type-erased section.
    pub fn raw_section(mut self, key: impl Into<String>, value: Section) -> Self {
        self.sections.insert(key.into(), value);
        self
    }

    pub fn build(self) -> SharedContext {
        SharedContext {
            sections: self.sections,
        }
    }
}

/// A projection of the shared context limited to declared sections.
#[derive(Clone)]
pub struct SectionView {
    context: Arc<SharedContext>,
    allowed: Arc<[String]>,
}

impl SectionView {
    pub(crate) fn new(context: Arc<SharedContext>, allowed: Arc<[String]>) -> Self {
        Self { context, allowed }
    }

    /// The section keys this view may read.
    pub fn declared(&self) -> &[String] {
        &self.allowed
    }

    /// Reads a declared section; undeclared keys error without touching the
    /// underlying context.
    pub fn section<V>(&self, key: &str) -> Result<Arc<V>, SectionError>
    where
        V: Send + Sync + 'static,
    {
        if !self.allowed.iter().any(|declared| declared == key) {
            return Err(SectionError::Undeclared {
                section: key.to_string(),
            });
        }
        self.context.section(key)
    }
}
