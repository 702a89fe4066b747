//! Invocation-scoped state: the ambient scope primitives and the shared
//! context with its restricted views.

pub mod ambient;
mod shared;

pub use shared::{Section, SectionView, SharedContext, SharedContextBuilder};
