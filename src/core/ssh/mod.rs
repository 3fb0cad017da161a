mod client;

pub use client::{
    execute_local_command, execute_local_command_in_dir, is_local_host, CommandOutput, SshClient,
    SshOptions,
};
