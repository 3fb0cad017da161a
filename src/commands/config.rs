use clap::Args;
use serde::Serialize;
use serde_json::Value;

use super::{CmdResult, DeclarationArgs};

#[derive(Args)]
pub struct ConfigArgs {
    /// Configuration key
    pub key: String,

    /// Resolve for this host (host-scoped values and attributes first)
    #[arg(long)]
    pub host: Option<String>,

    /// Value to report when the key is not set
    #[arg(long)]
    pub default: Option<String>,

    #[command(flatten)]
    pub declaration: DeclarationArgs,
}

#[derive(Serialize)]
pub struct ConfigOutput {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    value: Value,
    defaulted: bool,
}

pub fn run(args: ConfigArgs) -> CmdResult<ConfigOutput> {
    let deployment = args.declaration.load()?;
    let host = match &args.host {
        Some(name) => Some(deployment.hosts.get(name)?),
        None => None,
    };

    let (value, defaulted) = match (deployment.config.get(&args.key, host), args.default) {
        (Ok(value), _) => (value.clone(), false),
        (Err(_), Some(default)) => (Value::String(default), true),
        (Err(err), None) => return Err(err),
    };

    Ok((
        ConfigOutput {
            key: args.key,
            host: args.host,
            value,
            defaulted,
        },
        0,
    ))
}
