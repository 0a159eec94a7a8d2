//! Dependency graph over build units.
//!
//! Units are keyed by path and kept in registration order, which makes the
//! topological order and the ready frontier deterministic for identical
//! input. Edges point from a unit to the units it requires; object units
//! depend on their source, the linked image depends on every object.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    CSource,
    AsmSource,
    Object,
    LinkedImage,
}

impl UnitKind {
    pub fn is_source(self) -> bool {
        matches!(self, UnitKind::CSource | UnitKind::AsmSource)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Blocked,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitStatus::Succeeded | UnitStatus::Failed | UnitStatus::Blocked
        )
    }
}

/// One node of the graph: a source file, an object file, or the image.
#[derive(Debug, Clone)]
pub struct BuildUnit {
    pub path: PathBuf,
    pub kind: UnitKind,
    pub deps: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unit registered twice: {0}")]
    DuplicateUnit(PathBuf),
    #[error("unknown unit: {0}")]
    UnknownUnit(PathBuf),
    #[error("cyclic dependency: {}", format_cycle(.0))]
    Cycle(Vec<PathBuf>),
}

fn format_cycle(units: &[PathBuf]) -> String {
    units
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    units: IndexMap<PathBuf, BuildUnit>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unit(&mut self, path: impl Into<PathBuf>, kind: UnitKind) -> Result<(), GraphError> {
        let path = path.into();
        if self.units.contains_key(&path) {
            return Err(GraphError::DuplicateUnit(path));
        }
        self.units.insert(
            path.clone(),
            BuildUnit {
                path,
                kind,
                deps: vec![],
            },
        );
        Ok(())
    }

    /// Records that `from` requires `to` to have succeeded first.
    pub fn add_dependency(&mut self, from: &Path, to: &Path) -> Result<(), GraphError> {
        if !self.units.contains_key(to) {
            return Err(GraphError::UnknownUnit(to.to_path_buf()));
        }
        let unit = self
            .units
            .get_mut(from)
            .ok_or_else(|| GraphError::UnknownUnit(from.to_path_buf()))?;
        if !unit.deps.iter().any(|d| d == to) {
            unit.deps.push(to.to_path_buf());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&BuildUnit> {
        self.units.get(path)
    }

    pub fn units(&self) -> impl Iterator<Item = &BuildUnit> {
        self.units.values()
    }

    /// Kahn's algorithm: repeatedly remove zero-in-degree units, in
    /// registration order. Fails with the offending cycle if the graph
    /// cannot be fully ordered.
    pub fn topological_order(&self) -> Result<Vec<&BuildUnit>, GraphError> {
        let mut indegree: IndexMap<&Path, usize> = self
            .units
            .values()
            .map(|u| (u.path.as_path(), u.deps.len()))
            .collect();
        let mut dependents: HashMap<&Path, Vec<&Path>> = HashMap::new();
        for unit in self.units.values() {
            for dep in &unit.deps {
                dependents
                    .entry(dep.as_path())
                    .or_default()
                    .push(unit.path.as_path());
            }
        }

        let mut ready: VecDeque<&Path> = indegree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(path, _)| *path)
            .collect();
        let mut order = Vec::with_capacity(self.units.len());

        while let Some(path) = ready.pop_front() {
            if let Some(unit) = self.units.get(path) {
                order.push(unit);
            }
            for &dependent in dependents.get(path).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() == self.units.len() {
            Ok(order)
        } else {
            Err(GraphError::Cycle(self.extract_cycle(&indegree)))
        }
    }

    /// Walks unresolved dependency edges from the first leftover unit until
    /// a unit repeats; the slice from its first occurrence is a genuine
    /// cycle.
    fn extract_cycle(&self, indegree: &IndexMap<&Path, usize>) -> Vec<PathBuf> {
        let remaining: HashSet<&Path> = indegree
            .iter()
            .filter(|&(_, &degree)| degree > 0)
            .map(|(path, _)| *path)
            .collect();
        let Some(start) = self
            .units
            .keys()
            .map(PathBuf::as_path)
            .find(|p| remaining.contains(p))
        else {
            return vec![];
        };

        let mut trail: Vec<&Path> = vec![start];
        let mut seen: HashMap<&Path, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let Some(next) = self
                .units
                .get(current)
                .and_then(|u| u.deps.iter().find(|d| remaining.contains(d.as_path())))
            else {
                return trail.iter().map(|p| p.to_path_buf()).collect();
            };
            if let Some(&pos) = seen.get(next.as_path()) {
                return trail[pos..].iter().map(|p| p.to_path_buf()).collect();
            }
            seen.insert(next.as_path(), trail.len());
            trail.push(next.as_path());
            current = next.as_path();
        }
    }

    /// Pending units whose dependencies have all succeeded, in registration
    /// order.
    pub fn ready_frontier<'a>(
        &'a self,
        statuses: &IndexMap<PathBuf, UnitStatus>,
    ) -> Vec<&'a BuildUnit> {
        self.units
            .values()
            .filter(|unit| {
                statuses.get(&unit.path) == Some(&UnitStatus::Pending)
                    && unit
                        .deps
                        .iter()
                        .all(|dep| statuses.get(dep) == Some(&UnitStatus::Succeeded))
            })
            .collect()
    }

    /// Every unit reachable from `path` by reverse dependency edges.
    pub fn transitive_dependents(&self, path: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut visited: HashSet<&Path> = HashSet::from([path]);
        let mut queue: VecDeque<&Path> = VecDeque::from([path]);
        while let Some(current) = queue.pop_front() {
            for unit in self.units.values() {
                if unit.deps.iter().any(|d| d == current) && visited.insert(unit.path.as_path()) {
                    out.push(unit.path.clone());
                    queue.push_back(unit.path.as_path());
                }
            }
        }
        out
    }
}
