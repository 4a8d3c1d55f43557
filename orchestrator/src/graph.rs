//! Task dependency graph: validation, readiness and ordering.
//!
//! Tasks are addressed by their declaration index. Edges are stored as
//! index lists in both directions, so cycle detection is a plain traversal.

use crate::error::GraphError;
use crew_protocol::Agent;
use crew_protocol::Task;
use crew_protocol::TaskId;
use crew_protocol::TaskStatus;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

/// Decides which dependency statuses let a dependent start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadinessPolicy {
    /// Only a `Succeeded` dependency is satisfied.
    #[default]
    Strict,
    /// Any terminal dependency is satisfied, so skips and failures propagate
    /// as "done" rather than blocking.
    Lenient,
}

impl ReadinessPolicy {
    pub fn is_satisfied_by(self, status: TaskStatus) -> bool {
        match self {
            ReadinessPolicy::Strict => status == TaskStatus::Succeeded,
            ReadinessPolicy::Lenient => status.is_terminal(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    task_ids: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Validates the task set against the agent set and builds the graph.
    pub fn build(agents: &[Agent], tasks: &[Task]) -> Result<Self, GraphError> {
        if agents.is_empty() || tasks.is_empty() {
            return Err(GraphError::EmptyCrew);
        }

        let mut agent_ids = HashSet::new();
        for agent in agents {
            if !agent_ids.insert(&agent.id) {
                return Err(GraphError::DuplicateAgent {
                    agent_id: agent.id.clone(),
                });
            }
        }

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask {
                    task_id: task.id.clone(),
                });
            }
        }

        let mut dependencies = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            if !agent_ids.contains(&task.agent) {
                return Err(GraphError::UnknownAgent {
                    task_id: task.id.clone(),
                    agent_id: task.agent.clone(),
                });
            }
            for dependency in &task.dependencies {
                let Some(&dep) = index.get(dependency) else {
                    return Err(GraphError::MissingDependency {
                        task_id: task.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                if !dependencies[i].contains(&dep) {
                    dependencies[i].push(dep);
                    dependents[dep].push(i);
                }
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            let path: Vec<TaskId> = cycle.iter().map(|&i| tasks[i].id.clone()).collect();
            return Err(GraphError::Cycle {
                task_id: path[0].clone(),
                path,
            });
        }

        let order = topological_sort(&dependencies, &dependents);
        Ok(Self {
            task_ids: tasks.iter().map(|task| task.id.clone()).collect(),
            index,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    pub fn task_id(&self, index: usize) -> &TaskId {
        &self.task_ids[index]
    }

    pub fn index_of(&self, task_id: &TaskId) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    /// Direct dependencies of a task, in declaration order.
    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Dependency-respecting order; ties go to the earlier declared task.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Tasks not yet started whose dependencies all satisfy `policy`.
    ///
    /// `statuses` is indexed like the task list.
    pub fn ready_tasks(&self, statuses: &[TaskStatus], policy: ReadinessPolicy) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| matches!(statuses[i], TaskStatus::Pending | TaskStatus::Ready))
            .filter(|&i| {
                self.dependencies[i]
                    .iter()
                    .all(|&dep| policy.is_satisfied_by(statuses[dep]))
            })
            .collect()
    }

    /// Every task that depends on `index`, directly or transitively,
    /// in ascending index order.
    pub fn dependents_closure(&self, index: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.dependents[index].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents[next].iter().copied());
            }
        }
        seen.into_iter().collect()
    }

    /// Every task `index` depends on, directly or transitively.
    pub fn ancestors(&self, index: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.dependencies[index].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependencies[next].iter().copied());
            }
        }
        seen
    }

    /// Tasks with no dependents, in topological order.
    pub fn terminal_tasks(&self) -> Vec<usize> {
        self.order
            .iter()
            .copied()
            .filter(|&i| self.dependents[i].is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Returns the first cycle found as a path that starts and ends on the same node.
///
/// Walks with an explicit stack of `(node, next dependency cursor)` frames so
/// arbitrarily long chains cannot exhaust the thread stack.
fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    let mut frames: Vec<(usize, usize)> = Vec::new();

    for start in 0..dependencies.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::OnStack;
        frames.push((start, 0));

        while let Some(frame) = frames.last_mut() {
            let (node, cursor) = *frame;
            let Some(&next) = dependencies[node].get(cursor) else {
                marks[node] = Mark::Done;
                frames.pop();
                continue;
            };
            frame.1 += 1;

            match marks[next] {
                Mark::OnStack => {
                    let position = frames.iter().position(|&(n, _)| n == next)?;
                    let mut cycle: Vec<usize> =
                        frames[position..].iter().map(|&(n, _)| n).collect();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[next] = Mark::OnStack;
                    frames.push((next, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}

fn topological_sort(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut available: BTreeSet<usize> = (0..dependencies.len())
        .filter(|&i| remaining[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(next) = available.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                available.insert(dependent);
            }
        }
    }

    order
}
