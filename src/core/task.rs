//! Named tasks, hook bindings, and plan resolution.
//!
//! Task bodies and hook bindings live in two independent maps. A hook is
//! attached to a task *name*: replacing or disabling the task leaves its
//! hooks in place.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::action::{self, TaskAction, TaskContext};
use crate::error::{Error, Result};
use crate::utils::suggest;

#[derive(Clone)]
pub enum Step {
    /// Reference to another task by name.
    Task(String),
    /// Inline leaf action.
    Action(Arc<dyn TaskAction>),
}

impl Step {
    pub fn task(name: impl Into<String>) -> Self {
        Step::Task(name.into())
    }

    pub fn run(command: impl Into<String>) -> Self {
        Step::Action(action::command(command))
    }

    pub fn local(command: impl Into<String>) -> Self {
        Step::Action(action::local(command))
    }

    pub fn upload(from: impl Into<String>, to: impl Into<String>) -> Self {
        Step::Action(action::upload(from, to))
    }

    pub fn call<F>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> Result<String> + Send + Sync + 'static,
    {
        Step::Action(action::callback(label, f))
    }
}

impl From<&str> for Step {
    fn from(name: &str) -> Self {
        Step::Task(name.to_string())
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Task(name) => f.debug_tuple("Task").field(name).finish(),
            Step::Action(action) => f.debug_tuple("Action").field(&action.describe()).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub steps: Vec<Step>,
    pub enabled: bool,
    /// Recipe that supplied the task, if any.
    pub recipe: Option<String>,
    pub description: Option<String>,
}

impl Task {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            enabled: true,
            recipe: None,
            description: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn in_recipe(mut self, recipe: impl Into<String>) -> Self {
        self.recipe = Some(recipe.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookBinding {
    pub trigger: String,
    pub kind: HookKind,
    pub task: String,
}

/// One leaf action in a resolved plan, tagged with the task that owns it.
#[derive(Clone)]
pub struct PlannedStep {
    pub task: String,
    pub action: Arc<dyn TaskAction>,
}

impl PlannedStep {
    pub fn describe(&self) -> String {
        self.action.describe()
    }
}

impl fmt::Debug for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannedStep")
            .field("task", &self.task)
            .field("action", &self.action.describe())
            .finish()
    }
}

/// Resolved, ordered steps for one host.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub host: String,
    pub steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub index: usize,
    pub task: String,
    pub action: String,
}

/// One-based, printable form of resolved steps.
pub fn plan_entries(steps: &[PlannedStep]) -> Vec<PlanEntry> {
    steps
        .iter()
        .enumerate()
        .map(|(index, step)| PlanEntry {
            index: index + 1,
            task: step.task.clone(),
            action: step.describe(),
        })
        .collect()
}

impl ExecutionPlan {
    pub fn entries(&self) -> Vec<PlanEntry> {
        plan_entries(&self.steps)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct TaskGraph {
    tasks: HashMap<String, Task>,
    hooks: HashMap<String, Vec<HookBinding>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a task. Hooks bound to the name are kept.
    pub fn define(&mut self, name: impl Into<String>, steps: Vec<Step>) -> &mut Task {
        self.define_task(Task::new(name, steps))
    }

    pub fn define_task(&mut self, task: Task) -> &mut Task {
        match self.tasks.entry(task.name.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(task);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(task),
        }
    }

    pub fn disable(&mut self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    pub fn enable(&mut self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        if !self.tasks.contains_key(name) {
            return Err(self.not_found(name));
        }
        if let Some(task) = self.tasks.get_mut(name) {
            task.enabled = enabled;
        }
        Ok(())
    }

    /// Hooks on the same trigger and kind run in registration order.
    pub fn bind_hook(&mut self, trigger: impl Into<String>, kind: HookKind, task: impl Into<String>) {
        let trigger = trigger.into();
        self.hooks.entry(trigger.clone()).or_default().push(HookBinding {
            trigger,
            kind,
            task: task.into(),
        });
    }

    pub fn before(&mut self, trigger: impl Into<String>, task: impl Into<String>) {
        self.bind_hook(trigger, HookKind::Before, task);
    }

    pub fn after(&mut self, trigger: impl Into<String>, task: impl Into<String>) {
        self.bind_hook(trigger, HookKind::After, task);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn hooks(&self, trigger: &str, kind: HookKind) -> impl Iterator<Item = &HookBinding> + '_ {
        self.hooks
            .get(trigger)
            .into_iter()
            .flatten()
            .filter(move |binding| binding.kind == kind)
    }

    /// Every binding, grouped by trigger, triggers sorted.
    pub fn all_hooks(&self) -> Vec<&HookBinding> {
        let mut triggers: Vec<&String> = self.hooks.keys().collect();
        triggers.sort();
        triggers
            .into_iter()
            .flat_map(|t| self.hooks[t].iter())
            .collect()
    }

    /// Task names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Expand `root` into its ordered leaf actions.
    ///
    /// Depth-first: each task contributes its `before` hooks, then its own
    /// steps (none when disabled), then its `after` hooks. A task may appear
    /// more than once when reached from different branches; a task reached
    /// from inside its own expansion is a cycle.
    pub fn resolve(&self, root: &str) -> Result<Vec<PlannedStep>> {
        let mut out = Vec::new();
        let mut in_progress: Vec<&str> = Vec::new();
        self.expand(root, &mut out, &mut in_progress)?;
        Ok(out)
    }

    pub fn plan_for(&self, root: &str, host: &str) -> Result<ExecutionPlan> {
        Ok(ExecutionPlan {
            host: host.to_string(),
            steps: self.resolve(root)?,
        })
    }

    fn expand<'a>(
        &'a self,
        name: &'a str,
        out: &mut Vec<PlannedStep>,
        in_progress: &mut Vec<&'a str>,
    ) -> Result<()> {
        if in_progress.contains(&name) {
            let mut path: Vec<String> = in_progress.iter().map(|s| s.to_string()).collect();
            path.push(name.to_string());
            return Err(Error::task_cyclic(name, path));
        }

        let task = self.tasks.get(name).ok_or_else(|| self.not_found(name))?;
        in_progress.push(name);

        for binding in self.hooks(name, HookKind::Before) {
            self.expand(&binding.task, out, in_progress)?;
        }

        if task.enabled {
            for step in &task.steps {
                match step {
                    Step::Task(child) => self.expand(child, out, in_progress)?,
                    Step::Action(action) => out.push(PlannedStep {
                        task: task.name.clone(),
                        action: Arc::clone(action),
                    }),
                }
            }
        }

        for binding in self.hooks(name, HookKind::After) {
            self.expand(&binding.task, out, in_progress)?;
        }

        in_progress.pop();
        Ok(())
    }

    fn not_found(&self, name: &str) -> Error {
        let candidates: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        Error::task_not_found(name, suggest::similar_names(name, candidates))
    }
}
