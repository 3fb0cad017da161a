use clap::Args;
use serde::Serialize;

use hoist::task::HookBinding;

use super::{CmdResult, DeclarationArgs};

#[derive(Args)]
pub struct TasksArgs {
    #[command(flatten)]
    pub declaration: DeclarationArgs,
}

#[derive(Serialize)]
pub struct TaskSummary {
    name: String,
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipe: Option<String>,
    steps: Vec<String>,
}

#[derive(Serialize)]
pub struct TasksOutput {
    tasks: Vec<TaskSummary>,
    hooks: Vec<HookBinding>,
}

pub fn run(args: TasksArgs) -> CmdResult<TasksOutput> {
    let deployment = args.declaration.load()?;
    let graph = &deployment.tasks;

    let tasks = graph
        .names()
        .into_iter()
        .filter_map(|name| graph.task(name))
        .map(|task| TaskSummary {
            name: task.name.clone(),
            enabled: task.enabled,
            description: task.description.clone(),
            recipe: task.recipe.clone(),
            steps: task
                .steps
                .iter()
                .map(|step| match step {
                    hoist::task::Step::Task(name) => format!("task: {}", name),
                    hoist::task::Step::Action(action) => action.describe(),
                })
                .collect(),
        })
        .collect();

    let hooks = graph.all_hooks().into_iter().cloned().collect();

    Ok((TasksOutput { tasks, hooks }, 0))
}
