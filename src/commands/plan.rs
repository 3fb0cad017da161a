use clap::Args;
use serde::Serialize;

use hoist::task::{self, PlanEntry};

use super::{CmdResult, DeclarationArgs};

#[derive(Args)]
pub struct PlanArgs {
    /// Task to expand
    pub task: String,

    #[command(flatten)]
    pub declaration: DeclarationArgs,

    /// Only list hosts matching this name or glob (repeatable)
    #[arg(long = "host", value_name = "PATTERN")]
    pub hosts: Vec<String>,
}

#[derive(Serialize)]
pub struct PlanOutput {
    task: String,
    hosts: Vec<String>,
    steps: Vec<PlanEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery_task: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    recovery_steps: Vec<PlanEntry>,
}

/// Templates are not rendered; the plan is the same for every host.
pub fn run(args: PlanArgs) -> CmdResult<PlanOutput> {
    let deployment = args.declaration.load()?;
    let hosts = deployment
        .hosts
        .select(&args.hosts)?
        .into_iter()
        .map(|h| h.name().to_string())
        .collect();

    let steps = task::plan_entries(&deployment.tasks.resolve(&args.task)?);

    let recovery = deployment.settings.recovery_task();
    let (recovery_task, recovery_steps) = if deployment.tasks.contains(&recovery) {
        let steps = task::plan_entries(&deployment.tasks.resolve(&recovery)?);
        (Some(recovery), steps)
    } else {
        (None, Vec::new())
    };

    Ok((
        PlanOutput {
            task: args.task,
            hosts,
            steps,
            recovery_task,
            recovery_steps,
        },
        0,
    ))
}
