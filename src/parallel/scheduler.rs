//! Dependency scheduling for a batch of tasks.
//!
//! Only edges between tasks of the batch count: a `blocked_by` id the batch
//! does not contain was already satisfied when the tracker reported the task
//! as ready.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::tracker::Task;

type TaskIndex = usize;

/// Dependency graph over one batch of tasks.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index_map: HashMap<String, TaskIndex>,
    /// task -> tasks it waits on
    dependencies: Vec<Vec<TaskIndex>>,
    /// task -> tasks waiting on it
    dependents: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    /// Build the graph, rejecting duplicate ids and cycles.
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let mut index_map = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if index_map.insert(task.id.clone(), i).is_some() {
                bail!("Duplicate task id: {}", task.id);
            }
        }

        let mut dependencies = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.blocked_by {
                if let Some(&d) = index_map.get(dep)
                    && !dependencies[i].contains(&d)
                {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let graph = Self {
            tasks,
            index_map,
            dependencies,
            dependents,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// Kahn's algorithm; whatever never reaches in-degree zero is on a cycle.
    fn validate_no_cycles(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut queue: VecDeque<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0;

        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &dependent in &self.dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited != self.tasks.len() {
            let involved: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.tasks[i].id.as_str())
                .collect();
            bail!("Cycle detected in task dependencies. Involved tasks: {:?}", involved);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get_index(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    fn dependencies_satisfied(&self, index: TaskIndex, completed: &HashSet<TaskIndex>) -> bool {
        self.dependencies[index].iter().all(|d| completed.contains(d))
    }

    /// Longest chain of in-batch dependencies above the task (0 for roots).
    pub fn depth(&self, id: &str) -> usize {
        fn walk(graph: &TaskGraph, i: TaskIndex, memo: &mut HashMap<TaskIndex, usize>) -> usize {
            if let Some(&d) = memo.get(&i) {
                return d;
            }
            let d = graph.dependencies[i]
                .iter()
                .map(|&dep| walk(graph, dep, memo) + 1)
                .max()
                .unwrap_or(0);
            memo.insert(i, d);
            d
        }
        match self.get_index(id) {
            Some(i) => walk(self, i, &mut HashMap::new()),
            None => 0,
        }
    }
}

/// Where one task is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed { error: String },
    /// Not run because a dependency failed
    Skipped { dependency: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }
}

/// Tracks task status and hands out tasks whose dependencies completed.
#[derive(Debug)]
pub struct TaskScheduler {
    graph: TaskGraph,
    status: Vec<TaskStatus>,
    completed: HashSet<TaskIndex>,
}

impl TaskScheduler {
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        let graph = TaskGraph::build(tasks)?;
        let status = vec![TaskStatus::Pending; graph.len()];
        Ok(Self {
            graph,
            status,
            completed: HashSet::new(),
        })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn status(&self, id: &str) -> Option<&TaskStatus> {
        self.graph.get_index(id).map(|i| &self.status[i])
    }

    /// Groups of task ids that can run together, in dependency order.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut done: HashSet<TaskIndex> = HashSet::new();

        loop {
            let ready: Vec<TaskIndex> = (0..self.graph.len())
                .filter(|i| !done.contains(i) && self.graph.dependencies_satisfied(*i, &done))
                .collect();
            if ready.is_empty() {
                break;
            }
            done.extend(ready.iter().copied());
            waves.push(ready.iter().map(|&i| self.graph.tasks[i].id.clone()).collect());
        }
        waves
    }

    /// Pending tasks whose dependencies have all completed.
    pub fn ready(&self) -> Vec<Task> {
        (0..self.graph.len())
            .filter(|&i| {
                self.status[i] == TaskStatus::Pending
                    && self.graph.dependencies_satisfied(i, &self.completed)
            })
            .map(|i| self.graph.tasks[i].clone())
            .collect()
    }

    pub fn mark_running(&mut self, id: &str) {
        if let Some(i) = self.graph.get_index(id) {
            self.status[i] = TaskStatus::Running;
        }
    }

    pub fn mark_completed(&mut self, id: &str) {
        if let Some(i) = self.graph.get_index(id) {
            self.status[i] = TaskStatus::Completed;
            self.completed.insert(i);
        }
    }

    /// Mark a task failed and skip everything that transitively waits on it.
    /// Returns the ids that were skipped.
    pub fn mark_failed(&mut self, id: &str, error: &str) -> Vec<String> {
        let Some(i) = self.graph.get_index(id) else {
            return Vec::new();
        };
        self.status[i] = TaskStatus::Failed {
            error: error.to_string(),
        };

        let mut skipped = Vec::new();
        let mut queue: VecDeque<TaskIndex> = self.graph.dependents[i].iter().copied().collect();
        while let Some(d) = queue.pop_front() {
            if self.status[d].is_terminal() {
                continue;
            }
            self.status[d] = TaskStatus::Skipped {
                dependency: id.to_string(),
            };
            skipped.push(self.graph.tasks[d].id.clone());
            queue.extend(self.graph.dependents[d].iter().copied());
        }
        skipped
    }

    /// True once every task is terminal.
    pub fn is_finished(&self) -> bool {
        self.status.iter().all(|s| s.is_terminal())
    }

    pub fn running_count(&self) -> usize {
        self.status
            .iter()
            .filter(|s| **s == TaskStatus::Running)
            .count()
    }
}
