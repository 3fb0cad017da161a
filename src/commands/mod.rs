use clap::Args;
use std::path::PathBuf;

use hoist::declaration::{self, Deployment};

pub type CmdResult<T> = hoist::Result<(T, i32)>;

/// Locates the declaration file for commands that need one.
#[derive(Args, Debug, Clone, Default)]
pub struct DeclarationArgs {
    /// Declaration file (default: hoist.yml, .yaml, .json or .toml in the current directory)
    #[arg(long, short = 'f', value_name = "FILE")]
    pub file: Option<PathBuf>,
}

impl DeclarationArgs {
    pub fn path(&self) -> hoist::Result<PathBuf> {
        if let Some(file) = &self.file {
            return Ok(file.clone());
        }
        let cwd = std::env::current_dir().map_err(|e| {
            hoist::Error::internal_io(e.to_string(), Some("read current directory".to_string()))
        })?;
        declaration::find_default(&cwd)
    }

    pub fn load(&self) -> hoist::Result<Deployment> {
        Deployment::load(&self.path()?)
    }
}

pub mod config;
pub mod hosts;
pub mod plan;
pub mod run;
pub mod tasks;

macro_rules! dispatch {
    ($args:expr, $module:ident) => {
        crate::output::into_json_result($module::run($args))
    };
}

pub(crate) fn run_json(command: crate::Commands) -> (hoist::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Run(args) => dispatch!(args, run),
        crate::Commands::Plan(args) => dispatch!(args, plan),
        crate::Commands::Tasks(args) => dispatch!(args, tasks),
        crate::Commands::Hosts(args) => dispatch!(args, hosts),
        crate::Commands::Config(args) => dispatch!(args, config),
    }
}
