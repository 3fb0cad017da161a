use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{config, hosts, plan, run, tasks};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "hoist")]
#[command(version = VERSION)]
#[command(about = "Run deployment tasks across remote hosts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task on the selected hosts
    Run(run::RunArgs),
    /// Show the expanded steps of a task
    Plan(plan::PlanArgs),
    /// List tasks and hooks
    Tasks(tasks::TasksArgs),
    /// List declared hosts
    Hosts(hosts::HostsArgs),
    /// Resolve a configuration value
    Config(config::ConfigArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let (json_result, exit_code) = commands::run_json(cli.command);
    let _ = output::print_json_result(json_result);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
