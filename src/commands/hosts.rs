use clap::Args;
use serde::Serialize;

use hoist::host::HostAttributes;

use super::{CmdResult, DeclarationArgs};

#[derive(Args)]
pub struct HostsArgs {
    #[command(flatten)]
    pub declaration: DeclarationArgs,

    /// Only list hosts matching this name or glob (repeatable)
    #[arg(long = "host", value_name = "PATTERN")]
    pub hosts: Vec<String>,
}

#[derive(Serialize)]
pub struct HostSummary {
    name: String,
    target: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    deploy_path: Option<String>,
    attributes: HostAttributes,
}

#[derive(Serialize)]
pub struct HostsOutput {
    hosts: Vec<HostSummary>,
}

pub fn run(args: HostsArgs) -> CmdResult<HostsOutput> {
    let deployment = args.declaration.load()?;
    let hosts = deployment
        .hosts
        .select(&args.hosts)?
        .into_iter()
        .map(|host| HostSummary {
            name: host.name().to_string(),
            target: host.ssh_target(),
            port: host.port(),
            deploy_path: host.deploy_path().map(str::to_string),
            attributes: host.attributes().clone(),
        })
        .collect();

    Ok((HostsOutput { hosts }, 0))
}
