//! Frozen dependency graph for one planning round
//!
//! Adjacency list plus in-degree table; Kahn's algorithm orders the nodes
//! and rejects cycles at construction time.

use std::collections::{HashMap, HashSet, VecDeque};

use super::{Subtask, SubtaskStatus};
use crate::error::PlanningError;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    round: u32,
    subtasks: Vec<Subtask>,
    index: HashMap<String, usize>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Validate and freeze `subtasks`. Fails on duplicate ids, dependencies
    /// outside the graph and cycles.
    pub fn new(round: u32, subtasks: Vec<Subtask>) -> Result<Self, PlanningError> {
        let mut index = HashMap::with_capacity(subtasks.len());
        for (i, subtask) in subtasks.iter().enumerate() {
            if index.insert(subtask.id.clone(), i).is_some() {
                return Err(PlanningError::DuplicateSubtask(subtask.id.clone()));
            }
        }

        // Subtask id -> subtasks that depend on it
        let mut dependents: HashMap<String, Vec<String>> = subtasks
            .iter()
            .map(|s| (s.id.clone(), Vec::new()))
            .collect();
        let mut in_degree: HashMap<&str, usize> =
            subtasks.iter().map(|s| (s.id.as_str(), 0)).collect();

        for subtask in &subtasks {
            let mut seen = HashSet::new();
            for dependency in &subtask.depends_on {
                if !index.contains_key(dependency) {
                    return Err(PlanningError::UnknownDependency {
                        subtask: subtask.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                // a repeated dependency is one edge
                if !seen.insert(dependency.as_str()) {
                    continue;
                }
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(subtask.id.clone());
                *in_degree.entry(subtask.id.as_str()).or_insert(0) += 1;
            }
        }

        // Kahn, seeded in declaration order so the result is deterministic
        let mut queue: VecDeque<&str> = subtasks
            .iter()
            .filter(|s| in_degree.get(s.id.as_str()) == Some(&0))
            .map(|s| s.id.as_str())
            .collect();
        let mut order = Vec::with_capacity(subtasks.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        if order.len() < subtasks.len() {
            let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
            let stuck = subtasks
                .iter()
                .filter(|s| !ordered.contains(s.id.as_str()))
                .map(|s| s.id.clone())
                .collect();
            return Err(PlanningError::Cycle(stuck));
        }

        Ok(Self {
            round,
            subtasks,
            index,
            order,
        })
    }

    /// Planning round this graph belongs to
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.index.get(id).map(|&i| &self.subtasks[i])
    }

    /// Subtasks in declaration order
    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    /// A topological order of the subtask ids
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Pending subtasks whose dependencies have all succeeded, in
    /// topological order. Ids missing from `statuses` count as pending.
    pub fn ready(&self, statuses: &HashMap<String, SubtaskStatus>) -> Vec<String> {
        let status = |id: &str| {
            statuses
                .get(id)
                .copied()
                .unwrap_or(SubtaskStatus::Pending)
        };

        self.order
            .iter()
            .filter(|id| status(id) == SubtaskStatus::Pending)
            .filter(|id| {
                self.subtask(id).is_some_and(|subtask| {
                    subtask
                        .depends_on
                        .iter()
                        .all(|dep| status(dep) == SubtaskStatus::Succeeded)
                })
            })
            .cloned()
            .collect()
    }
}
