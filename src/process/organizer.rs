//! Deterministic pre-computation of aspect advice into runnable levels.
//!
//! For each advice kind the organizer layers entries by their `depends_on`
//! edges (in-degree worklist), splits layers into single-entry levels for
//! sequential kinds, and verifies that no emitted level contains two entries
//! declaring the same section. Missing dependencies, cycles and section
//! conflicts all fail construction eagerly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::aspect::{Advice, AdviceKind, AroundFn, Aspect, CatchFn, EffectFn};
use crate::error::ProcessSetupError;
use crate::process::{BuildOptions, ExecutionStrategy};

/// One entry of an emitted level, ready to run.
pub(crate) struct OrganizedEntry<F> {
    pub name: String,
    pub uses: Arc<[String]>,
    pub body: F,
}

impl<F: Clone> Clone for OrganizedEntry<F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            uses: Arc::clone(&self.uses),
            body: self.body.clone(),
        }
    }
}

pub(crate) type Levels<F> = Vec<Vec<OrganizedEntry<F>>>;

/// The five batched level lists of one process.
pub(crate) struct OrganizedAdvice<T> {
    pub before: Levels<EffectFn>,
    pub around: Levels<AroundFn<T>>,
    pub after_returning: Levels<EffectFn>,
    pub after_throwing: Levels<CatchFn>,
    pub after: Levels<EffectFn>,
}

impl<T> std::fmt::Debug for OrganizedAdvice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrganizedAdvice").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> OrganizedAdvice<T> {
    pub fn organize(
        aspects: &[Aspect<T>],
        build: &BuildOptions,
    ) -> Result<Self, ProcessSetupError> {
        let mut seen = HashSet::new();
        for aspect in aspects {
            if !seen.insert(aspect.name.clone()) {
                return Err(ProcessSetupError::DuplicateAspect {
                    aspect: aspect.name.clone(),
                });
            }
        }

        Ok(Self {
            before: organize_kind(
                collect(aspects, |a| a.before.as_ref()),
                AdviceKind::Before,
                build.before.strategy,
            )?,
            around: organize_kind(
                collect(aspects, |a| a.around.as_ref()),
                AdviceKind::Around,
                build.around.strategy,
            )?,
            after_returning: organize_kind(
                collect(aspects, |a| a.after_returning.as_ref()),
                AdviceKind::AfterReturning,
                build.after_returning.strategy,
            )?,
            after_throwing: organize_kind(
                collect(aspects, |a| a.after_throwing.as_ref()),
                AdviceKind::AfterThrowing,
                build.after_throwing.strategy,
            )?,
            after: organize_kind(
                collect(aspects, |a| a.after.as_ref()),
                AdviceKind::After,
                build.after.strategy,
            )?,
        })
    }
}

fn collect<'a, T, F>(
    aspects: &'a [Aspect<T>],
    pick: impl Fn(&'a Aspect<T>) -> Option<&'a Advice<F>>,
) -> Vec<(&'a str, &'a Advice<F>)> {
    aspects
        .iter()
        .filter_map(|aspect| pick(aspect).map(|advice| (aspect.name.as_str(), advice)))
        .collect()
}

fn organize_kind<F: Clone>(
    entries: Vec<(&str, &Advice<F>)>,
    kind: AdviceKind,
    strategy: ExecutionStrategy,
) -> Result<Levels<F>, ProcessSetupError> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let index: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (*name, i))
        .collect();

    // Resolve dependency edges; unknown names fail with the available list.
    let mut prerequisites: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, (name, advice)) in entries.iter().enumerate() {
        let mut resolved = HashSet::new();
        for dependency in &advice.depends_on {
            let Some(&dep) = index.get(dependency.as_str()) else {
                let available = entries
                    .iter()
                    .map(|(n, _)| *n)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(ProcessSetupError::MissingDependency {
                    aspect: name.to_string(),
                    dependency: dependency.clone(),
                    kind,
                    available,
                });
            };
            if resolved.insert(dep) {
                prerequisites[i].push(dep);
            }
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (i, prereqs) in prerequisites.iter().enumerate() {
        for &dep in prereqs {
            dependents[dep].push(i);
        }
    }

    // In-degree worklist layering: layer 0 holds entries with no
    // prerequisites; removing a layer releases its dependents.
    let mut indegree: Vec<usize> = prerequisites.iter().map(Vec::len).collect();
    let mut ready: Vec<usize> = (0..entries.len()).filter(|&i| indegree[i] == 0).collect();
    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut placed = 0;
    while !ready.is_empty() {
        placed += ready.len();
        let mut next = Vec::new();
        for &i in &ready {
            for &dependent in &dependents[i] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        layers.push(std::mem::replace(&mut ready, next));
    }

    if placed < entries.len() {
        let stuck: HashSet<usize> = (0..entries.len()).filter(|&i| indegree[i] > 0).collect();
        let path = cycle_path(&entries, &prerequisites, &stuck);
        return Err(ProcessSetupError::DependencyCycle { kind, path });
    }

    let emitted: Vec<Vec<usize>> = match strategy {
        ExecutionStrategy::Parallel => layers,
        ExecutionStrategy::Sequential => layers
            .into_iter()
            .flat_map(|layer| layer.into_iter().map(|i| vec![i]))
            .collect(),
    };

    // Section exclusivity within each emitted level.
    for level in &emitted {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for &i in level {
            let (name, advice) = entries[i];
            for section in &advice.uses {
                if let Some(first) = owners.insert(section.as_str(), name) {
                    return Err(ProcessSetupError::SectionConflict {
                        kind,
                        section: section.clone(),
                        first: first.to_string(),
                        second: name.to_string(),
                    });
                }
            }
        }
    }

    Ok(emitted
        .into_iter()
        .map(|level| {
            level
                .into_iter()
                .map(|i| {
                    let (name, advice) = entries[i];
                    OrganizedEntry {
                        name: name.to_string(),
                        uses: advice.uses.clone().into(),
                        body: advice.body.clone(),
                    }
                })
                .collect()
        })
        .collect())
}

/// Walks prerequisite edges among stuck entries until one repeats.
fn cycle_path<F>(
    entries: &[(&str, &Advice<F>)],
    prerequisites: &[Vec<usize>],
    stuck: &HashSet<usize>,
) -> String {
    let start = *stuck.iter().min().unwrap_or(&0);
    let mut positions: HashMap<usize, usize> = HashMap::new();
    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(&pos) = positions.get(&current) {
            let mut names: Vec<&str> = path[pos..].iter().map(|&i| entries[i].0).collect();
            names.push(entries[current].0);
            return names.join(" -> ");
        }
        positions.insert(current, path.len());
        path.push(current);
        current = match prerequisites[current].iter().find(|dep| stuck.contains(dep)) {
            Some(&next) => next,
            None => return entries[current].0.to_string(),
        };
    }
}
