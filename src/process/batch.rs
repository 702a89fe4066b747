//! Runs the organized levels of one advice kind.
//!
//! Entries within a level run concurrently and are all awaited before the
//! next level starts. Failures are collected per the kind's aggregation
//! policy: `Unit` raises after the first failing level, `All` keeps running
//! and raises the accumulated set once every level has settled.

use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use tracing::debug;

use crate::aspect::{AdviceKind, AdviceResult};
use crate::context::{SectionView, SharedContext};
use crate::error::Rejection;
use crate::process::organizer::{Levels, OrganizedEntry};
use crate::process::{ErrorAggregation, KindOptions};
use crate::signal::Fault;

pub(crate) async fn run_batches<F>(
    levels: &Levels<F>,
    kind: AdviceKind,
    options: &KindOptions,
    context: &Arc<SharedContext>,
    invoke: impl Fn(&OrganizedEntry<F>, SectionView) -> BoxFuture<'static, AdviceResult>,
) -> Result<(), Rejection> {
    let mut collected: Vec<Fault> = Vec::new();
    for level in levels {
        let running: Vec<_> = level
            .iter()
            .map(|entry| {
                let view = SectionView::new(Arc::clone(context), Arc::clone(&entry.uses));
                invoke(entry, view)
            })
            .collect();
        let mut failures: Vec<Fault> = join_all(running)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        if failures.is_empty() {
            continue;
        }
        debug!(kind = %kind, failures = failures.len(), "advice level rejected");
        match options.aggregation {
            ErrorAggregation::Unit => return Err(Rejection::advice(kind, failures)),
            ErrorAggregation::All => collected.append(&mut failures),
        }
    }
    if collected.is_empty() {
        Ok(())
    } else {
        Err(Rejection::advice(kind, collected))
    }
}
