use clap::Args;

use hoist::cancel::{self, CancelToken};
use hoist::scheduler::{HostReport, RunReport, Scheduler};

use super::{CmdResult, DeclarationArgs};

#[derive(Args)]
pub struct RunArgs {
    /// Task to run (e.g. deploy)
    pub task: String,

    #[command(flatten)]
    pub declaration: DeclarationArgs,

    /// Only run on hosts matching this name or glob (repeatable)
    #[arg(long = "host", value_name = "PATTERN")]
    pub hosts: Vec<String>,

    /// Run hosts concurrently
    #[arg(long, conflicts_with = "sequential")]
    pub parallel: bool,

    /// Run hosts one after another
    #[arg(long)]
    pub sequential: bool,

    /// Maximum hosts running at once in parallel mode
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Report the planned steps without connecting to any host
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(args: RunArgs) -> CmdResult<RunReport> {
    let mut deployment = args.declaration.load()?;

    if args.parallel {
        deployment.settings.parallel = true;
    }
    if args.sequential {
        deployment.settings.parallel = false;
    }
    if args.max_parallel.is_some() {
        deployment.settings.max_parallel = args.max_parallel;
    }

    let hosts = deployment.hosts.select(&args.hosts)?;
    if hosts.is_empty() {
        return Err(hoist::Error::validation_invalid_argument(
            "host",
            "No hosts selected",
            None,
            Some(args.hosts.clone()),
        )
        .with_hint("Declare hosts under `hosts:` or check --host patterns"));
    }

    let mut settings = deployment.scheduler_config();
    settings.dry_run = args.dry_run;
    settings.cancel = CancelToken::interruptible();
    cancel::install_interrupt_handler()?;

    let executor = deployment.executor();
    let secrets = deployment.secrets();
    let report = Scheduler::new(
        &deployment.tasks,
        &deployment.config,
        &executor,
        secrets.as_ref(),
        settings,
    )
    .run(&args.task, &hosts)?;

    for host in report.failed_hosts() {
        eprintln!("{}", failure_line(host));
        for error in &host.recovery_errors {
            eprintln!("  recovery: {}", error.message);
        }
    }

    let exit_code = if report.success { 0 } else { 1 };
    Ok((report, exit_code))
}

fn failure_line(host: &HostReport) -> String {
    let state = host.state.as_str();
    match &host.failure {
        Some(failure) => match &failure.task {
            Some(task) => format!(
                "{} {}: {} failed: {}",
                host.host, state, task, failure.error.message
            ),
            None => format!("{} {}: {}", host.host, state, failure.error.message),
        },
        None => format!("{} {}", host.host, state),
    }
}
