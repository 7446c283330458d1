//! Dependency-ordered step scheduler.
//!
//! A [`Pipeline`] is an explicit DAG of named async steps over a shared
//! context. Steps run one at a time: the first ready step in insertion order
//! goes next. A step whose dependency failed or was canceled is canceled
//! without running, and the first failure cancels everything not yet
//! started. Completed steps are never undone.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use super::error::{PipelineError, SyncError};
use super::progress::ProgressTracker;

type StepFn<C> = Box<dyn Fn(Arc<C>) -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Canceled
        )
    }
}

/// Final state of every step, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub states: Vec<(&'static str, StepState)>,
}

impl RunReport {
    pub fn state(&self, step: &str) -> Option<StepState> {
        self.states
            .iter()
            .find(|(name, _)| *name == step)
            .map(|(_, state)| *state)
    }

    pub fn all_completed(&self) -> bool {
        self.states.iter().all(|(_, s)| *s == StepState::Completed)
    }

    pub fn count(&self, state: StepState) -> usize {
        self.states.iter().filter(|(_, s)| *s == state).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, state)) in self.states.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={state:?}")?;
        }
        Ok(())
    }
}

/// Write-once slot carrying one step's output to the steps after it.
pub struct StepOutput<T> {
    name: &'static str,
    slot: Arc<OnceLock<T>>,
}

impl<T> Clone for StepOutput<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for StepOutput<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepOutput")
            .field("name", &self.name)
            .field("set", &self.slot.get().is_some())
            .finish()
    }
}

impl<T> StepOutput<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(OnceLock::new()),
        }
    }

    /// Store the value. A second write is ignored.
    pub fn set(&self, value: T) {
        if self.slot.set(value).is_err() {
            tracing::warn!(output = self.name, "Step output written twice, keeping the first value");
        }
    }

    pub fn get(&self) -> Result<&T, SyncError> {
        self.slot.get().ok_or(SyncError::MissingInput(self.name))
    }
}

struct StepNode<C> {
    name: &'static str,
    deps: Vec<usize>,
    run: StepFn<C>,
}

/// Collects steps and validates the graph.
pub struct PipelineBuilder<C> {
    steps: Vec<(&'static str, Vec<&'static str>, StepFn<C>)>,
}

impl<C> Default for PipelineBuilder<C> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<C: Send + Sync + 'static> PipelineBuilder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step that runs after every step named in `deps`.
    pub fn step<F>(mut self, name: &'static str, deps: &[&'static str], run: F) -> Self
    where
        F: Fn(Arc<C>) -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync + 'static,
    {
        self.steps.push((name, deps.to_vec(), Box::new(run)));
        self
    }

    pub fn build(self) -> Result<Pipeline<C>, PipelineError> {
        let mut index: HashMap<&'static str, usize> = HashMap::new();
        for (i, (name, _, _)) in self.steps.iter().enumerate() {
            if index.insert(name, i).is_some() {
                return Err(PipelineError::DuplicateStep(name));
            }
        }

        let mut nodes = Vec::with_capacity(self.steps.len());
        for (name, deps, run) in self.steps {
            let deps = deps
                .into_iter()
                .map(|dep| {
                    index
                        .get(dep)
                        .copied()
                        .ok_or(PipelineError::UnknownDependency {
                            step: name,
                            dependency: dep,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            nodes.push(StepNode { name, deps, run });
        }

        detect_cycle(&nodes)?;
        Ok(Pipeline { nodes })
    }
}

/// Kahn's algorithm; whatever cannot be ordered is on (or behind) a cycle.
fn detect_cycle<C>(nodes: &[StepNode<C>]) -> Result<(), PipelineError> {
    let mut indegree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &dep in &node.deps {
            dependents[dep].push(i);
        }
    }

    let mut queue: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut ordered = 0;
    while let Some(i) = queue.pop() {
        ordered += 1;
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push(next);
            }
        }
    }

    if ordered == nodes.len() {
        Ok(())
    } else {
        let stuck = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, n)| n.name)
            .collect();
        Err(PipelineError::Cycle(stuck))
    }
}

/// A validated step graph. Reusable across runs.
pub struct Pipeline<C> {
    nodes: Vec<StepNode<C>>,
}

impl<C> fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| n.name))
            .finish()
    }
}

impl<C: Send + Sync + 'static> Pipeline<C> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|n| n.name).collect()
    }

    /// Run every step to a terminal state.
    ///
    /// Returns the per-step report and the run's single outcome: `Ok` only if
    /// every step completed, `Canceled` if `cancel` fired first, otherwise the
    /// first step error.
    pub async fn run(
        &self,
        ctx: Arc<C>,
        cancel: &CancellationToken,
        progress: &ProgressTracker,
    ) -> (RunReport, Result<(), SyncError>) {
        let mut states = vec![StepState::Pending; self.nodes.len()];
        let mut outcome: Result<(), SyncError> = Ok(());
        progress.start(self.nodes.len());

        loop {
            if cancel.is_cancelled() {
                let canceled = cancel_unstarted(&mut states);
                progress.finish_tasks(canceled);
                if outcome.is_ok() {
                    outcome = Err(SyncError::Canceled);
                }
                break;
            }

            // Promote or cancel pending steps based on their dependencies.
            for i in 0..self.nodes.len() {
                if states[i] != StepState::Pending {
                    continue;
                }
                let deps = &self.nodes[i].deps;
                if deps
                    .iter()
                    .any(|&d| matches!(states[d], StepState::Failed | StepState::Canceled))
                {
                    states[i] = StepState::Canceled;
                    progress.finish_tasks(1);
                } else if deps.iter().all(|&d| states[d] == StepState::Completed) {
                    states[i] = StepState::Ready;
                }
            }

            let Some(next) = states.iter().position(|s| *s == StepState::Ready) else {
                break;
            };

            let node = &self.nodes[next];
            states[next] = StepState::Running;
            tracing::debug!(step = node.name, "Step started");

            let result = (node.run)(Arc::clone(&ctx)).await;
            progress.finish_tasks(1);
            match result {
                Ok(()) => {
                    states[next] = StepState::Completed;
                    tracing::debug!(step = node.name, "Step completed");
                }
                Err(SyncError::Canceled) => {
                    states[next] = StepState::Canceled;
                    tracing::info!(step = node.name, "Step canceled");
                    let canceled = cancel_unstarted(&mut states);
                    progress.finish_tasks(canceled);
                    outcome = Err(SyncError::Canceled);
                    break;
                }
                Err(e) => {
                    states[next] = StepState::Failed;
                    tracing::warn!(step = node.name, error = %e, "Step failed, canceling remaining steps");
                    let canceled = cancel_unstarted(&mut states);
                    progress.finish_tasks(canceled);
                    outcome = Err(e);
                    break;
                }
            }
        }

        progress.finish_all();
        let report = RunReport {
            states: self
                .nodes
                .iter()
                .map(|n| n.name)
                .zip(states)
                .collect(),
        };
        (report, outcome)
    }
}

/// Cancel every step that has not started. Returns how many were canceled.
fn cancel_unstarted(states: &mut [StepState]) -> usize {
    let mut canceled = 0;
    for state in states.iter_mut() {
        if matches!(state, StepState::Pending | StepState::Ready) {
            *state = StepState::Canceled;
            canceled += 1;
        }
    }
    canceled
}
