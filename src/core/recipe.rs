//! The `common` recipe: release layout, locking, secrets and rollback.
//!
//! Remote layout under `deploy_path`:
//!
//! ```text
//! .dep/deploy.lock       lock marker, holds "<user> <timestamp> <run id>"
//! .dep/latest_release    last release number
//! releases/<n>/          one directory per release
//! shared/                files and directories linked into every release
//! current -> releases/<n>
//! ```

use serde_json::{json, Value};

use crate::action::TaskContext;
use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::secrets::TempSecretFile;
use crate::ssh::is_local_host;
use crate::task::{Step, Task, TaskGraph};
use crate::utils::shell::{join_remote, quote_arg, quote_path};

pub const RECIPE_NAME: &str = "common";

pub const DEP_DIR: &str = ".dep";
pub const LOCK_FILE: &str = ".dep/deploy.lock";
pub const LATEST_RELEASE_FILE: &str = ".dep/latest_release";
pub const RELEASES_DIR: &str = "releases";
pub const SHARED_DIR: &str = "shared";
pub const CURRENT_LINK: &str = "current";

pub const DEFAULT_RECOVERY_TASK: &str = "deploy:failed";

fn defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("keep_releases", json!(10)),
        ("branch", json!("main")),
        ("secrets_env", json!("DOTENV")),
        ("secrets_file", json!(".env")),
        ("shared_dirs", json!([])),
        ("shared_files", json!([])),
        ("rsync_src", json!(".")),
        ("rsync_flags", json!("-az --delete")),
    ]
}

/// Register the recipe's defaults and tasks. Existing global values win.
pub fn install(graph: &mut TaskGraph, config: &mut ConfigStore) {
    for (key, value) in defaults() {
        if !config.contains(key, None) {
            config.set_global(key, value);
        }
    }

    let tasks = vec![
        Task::new("deploy:info", vec![Step::call("announce deploy", info)])
            .describe("Show what is being deployed"),
        Task::new("deploy:lock", vec![Step::call("acquire deploy lock", lock)])
            .describe("Lock the host against concurrent deploys"),
        Task::new("deploy:setup", vec![Step::call("create layout", setup)])
            .describe("Create the release layout"),
        Task::new("deploy:release", vec![Step::call("allocate release", release)])
            .describe("Allocate the next release directory"),
        Task::new("deploy:update_code", vec![Step::call("clone repository", update_code)])
            .describe("Clone the repository into the release"),
        Task::new("rsync", vec![Step::call("rsync sources", rsync)])
            .describe("Copy local sources into the release"),
        Task::new("deploy:shared", vec![Step::call("link shared paths", shared)])
            .describe("Link shared files and directories into the release"),
        Task::new("deploy:secrets", vec![Step::call("upload secrets", secrets)])
            .describe("Upload the secrets file to shared/"),
        Task::new("deploy:symlink", vec![Step::call("switch current", symlink)])
            .describe("Point current at the new release"),
        Task::new("deploy:unlock", vec![Step::call("release deploy lock", unlock)])
            .describe("Release the deploy lock taken by this run"),
        Task::new("deploy:unlock:force", vec![Step::call("remove deploy lock", force_unlock)])
            .describe("Remove the deploy lock whoever holds it"),
        Task::new("deploy:cleanup", vec![Step::call("prune releases", cleanup)])
            .describe("Remove releases beyond keep_releases"),
        Task::new("deploy:success", vec![Step::call("report success", success)])
            .describe("Report a finished deploy"),
        Task::new("deploy:failed", vec![]).describe("Runs after a failed deploy"),
        Task::new(
            "deploy:prepare",
            vec![
                "deploy:info".into(),
                "deploy:lock".into(),
                "deploy:setup".into(),
                "deploy:release".into(),
                "deploy:update_code".into(),
                "deploy:shared".into(),
            ],
        )
        .describe("Prepare a new release"),
        Task::new(
            "deploy:publish",
            vec![
                "deploy:symlink".into(),
                "deploy:unlock".into(),
                "deploy:cleanup".into(),
                "deploy:success".into(),
            ],
        )
        .describe("Publish the prepared release"),
        Task::new("deploy", vec!["deploy:prepare".into(), "deploy:publish".into()])
            .describe("Deploy the application"),
        Task::new("rollback", vec![Step::call("restore previous release", rollback)])
            .describe("Point current at the previous release"),
    ];

    for task in tasks {
        graph.define_task(task.in_recipe(RECIPE_NAME));
    }

    graph.after("deploy:failed", "deploy:unlock");
}

fn info(ctx: &mut TaskContext<'_>) -> Result<String> {
    let branch = ctx.get_str_or("branch", "main");
    let what = match ctx.get_str("repository") {
        Ok(repository) => format!("{} ({})", repository, branch),
        Err(_) => branch,
    };
    let line = format!("Deploying {} to {}", what, ctx.host().name());
    log_status!("deploy", "{}", line);
    Ok(line)
}

/// Run variable holding the marker contents written by this run's lock.
pub const LOCK_HOLDER_VAR: &str = "lock_holder";

/// `<user> <timestamp> <run id>`; the run id makes every holder unique.
fn lock_holder() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!(
        "{} {} {}",
        user,
        chrono::Utc::now().to_rfc3339(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Create the lock marker with noclobber in a single remote command; a
/// second command is never issued when the marker already exists.
fn lock(ctx: &mut TaskContext<'_>) -> Result<String> {
    let deploy_path = ctx.get_str("deploy_path")?;
    let dep_dir = join_remote(&deploy_path, &[DEP_DIR]);
    let lock_file = join_remote(&deploy_path, &[LOCK_FILE]);
    let holder = lock_holder();

    let command = format!(
        "mkdir -p {dep} && if (set -C; echo {holder} > {lock}) 2>/dev/null; then echo acquired; else echo locked; cat {lock}; fi",
        dep = quote_path(&dep_dir),
        holder = quote_arg(&holder),
        lock = quote_path(&lock_file),
    );

    let output = ctx.exec(&command)?;
    let mut lines = output.lines();
    match lines.next().map(str::trim) {
        Some("acquired") => {
            ctx.set(LOCK_HOLDER_VAR, holder);
            Ok(format!("locked {}", lock_file))
        }
        _ => {
            let holder = lines.collect::<Vec<_>>().join("\n").trim().to_string();
            let holder = if holder.is_empty() { None } else { Some(holder) };
            Err(Error::remote_host_locked(ctx.host().name(), lock_file, holder))
        }
    }
}

/// Remove the marker only if it still holds this run's holder line. A run
/// that never took the lock leaves any existing marker alone.
fn unlock(ctx: &mut TaskContext<'_>) -> Result<String> {
    let holder = match ctx.get(LOCK_HOLDER_VAR) {
        Ok(Value::String(holder)) => holder,
        _ => return Ok("lock not held by this run".to_string()),
    };
    let deploy_path = ctx.get_str("deploy_path")?;
    let lock_file = quote_path(&join_remote(&deploy_path, &[LOCK_FILE]));

    let command = format!(
        "if [ \"$(cat {lock} 2>/dev/null)\" = {holder} ]; then rm -f {lock}; echo released; else echo kept; fi",
        lock = lock_file,
        holder = quote_arg(&holder),
    );
    let output = ctx.exec(&command)?;
    if output.trim() == "released" {
        ctx.set(LOCK_HOLDER_VAR, Value::Null);
    } else {
        log_status!("deploy", "{}: lock marker no longer belongs to this run, leaving it", ctx.host().name());
    }
    Ok(output)
}

fn force_unlock(ctx: &mut TaskContext<'_>) -> Result<String> {
    let deploy_path = ctx.get_str("deploy_path")?;
    let lock_file = join_remote(&deploy_path, &[LOCK_FILE]);
    ctx.exec(&format!("rm -f {}", quote_path(&lock_file)))?;
    Ok(format!("removed {}", lock_file))
}

fn setup(ctx: &mut TaskContext<'_>) -> Result<String> {
    let deploy_path = ctx.get_str("deploy_path")?;
    let dirs: Vec<String> = [DEP_DIR, RELEASES_DIR, SHARED_DIR]
        .into_iter()
        .map(|dir| quote_path(&join_remote(&deploy_path, &[dir])))
        .collect();
    ctx.exec(&format!("mkdir -p {}", dirs.join(" ")))
}

fn update_code(ctx: &mut TaskContext<'_>) -> Result<String> {
    let repository = ctx.get_str("repository")?;
    let branch = ctx.get_str_or("branch", "main");
    let release_path = ctx.get_str("release_path")?;
    ctx.exec(&format!(
        "git clone --depth 1 --branch {} {} {}",
        quote_arg(&branch),
        quote_arg(&repository),
        quote_path(&release_path)
    ))
}

fn symlink(ctx: &mut TaskContext<'_>) -> Result<String> {
    let deploy_path = ctx.get_str("deploy_path")?;
    let release_path = ctx.get_str("release_path")?;
    ctx.exec(&format!(
        "cd {} && ln -nfs {} {current}.tmp && mv -fT {current}.tmp {current}",
        quote_path(&deploy_path),
        quote_path(&release_path),
        current = CURRENT_LINK,
    ))
}

fn release(ctx: &mut TaskContext<'_>) -> Result<String> {
    let deploy_path = ctx.get_str("deploy_path")?;
    let command = format!(
        "cd {} && mkdir -p {dep} {releases} && n=$(( $(cat {latest} 2>/dev/null || echo 0) + 1 )) && mkdir -p {releases}/$n && echo $n > {latest} && echo $n",
        quote_path(&deploy_path),
        dep = DEP_DIR,
        releases = RELEASES_DIR,
        latest = LATEST_RELEASE_FILE,
    );

    let output = ctx.exec(&command)?;
    let name = output.trim().to_string();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::internal_unexpected(format!(
            "Unexpected release number from '{}': {:?}",
            ctx.host().name(),
            output
        )));
    }

    let path = join_remote(&deploy_path, &[RELEASES_DIR, &name]);
    ctx.set("release_name", name.clone());
    ctx.set("release_path", path.clone());
    Ok(path)
}

fn rsync(ctx: &mut TaskContext<'_>) -> Result<String> {
    let release_path = ctx.get_str("release_path")?;
    let src = ctx.get_str_or("rsync_src", ".");
    let flags = ctx.get_str_or("rsync_flags", "-az --delete");

    let host = ctx.host();
    let mut ssh = format!("ssh -p {}", host.port());
    if let Some(identity) = host.identity_file() {
        ssh.push_str(&format!(" -i {}", quote_path(&shellexpand::tilde(identity))));
    }
    let dest = if is_local_host(host.hostname()) {
        release_path
    } else {
        format!("{}:{}", host.ssh_target(), release_path)
    };

    let command = format!(
        "rsync {} -e {} {}/ {}/",
        flags,
        quote_arg(&ssh),
        quote_path(&src),
        quote_path(&dest)
    );
    ctx.exec_local(&command)
}

fn shared(ctx: &mut TaskContext<'_>) -> Result<String> {
    let deploy_path = ctx.get_str("deploy_path")?;
    let release_path = ctx.get_str("release_path")?;
    let shared_root = join_remote(&deploy_path, &[SHARED_DIR]);

    let mut commands = Vec::new();
    for dir in ctx.get_list("shared_dirs") {
        let source = quote_path(&join_remote(&shared_root, &[&dir]));
        let target = quote_path(&join_remote(&release_path, &[&dir]));
        commands.push(format!(
            "mkdir -p {src} && rm -rf {dst} && mkdir -p \"$(dirname {dst})\" && ln -nfs {src} {dst}",
            src = source,
            dst = target
        ));
    }
    for file in ctx.get_list("shared_files") {
        let source = quote_path(&join_remote(&shared_root, &[&file]));
        let target = quote_path(&join_remote(&release_path, &[&file]));
        commands.push(format!(
            "mkdir -p \"$(dirname {src})\" && touch {src} && rm -f {dst} && mkdir -p \"$(dirname {dst})\" && ln -nfs {src} {dst}",
            src = source,
            dst = target
        ));
    }

    if commands.is_empty() {
        return Ok(String::new());
    }
    ctx.exec(&commands.join(" && "))
}

/// The local copy lives only for the duration of the upload and is removed
/// on every path out of this function.
fn secrets(ctx: &mut TaskContext<'_>) -> Result<String> {
    let name = ctx.get_str_or("secrets_env", "DOTENV");
    let host = ctx.host().name().to_string();
    let blob = ctx.secrets().secret(&name)?.ok_or_else(|| {
        Error::config_missing_key(&name, Some(host.clone()))
            .with_hint(format!("Provide the '{}' secret to the configured provider", name))
    })?;

    let file = TempSecretFile::write(&blob)?;
    log_status!("secrets", "Uploading '{}' to {}", name, host);
    let shared_dir = join_remote(&ctx.get_str("deploy_path")?, &[SHARED_DIR]);
    ctx.exec(&format!("mkdir -p {}", quote_path(&shared_dir)))?;
    ctx.upload(file.path(), "{{deploy_path}}/shared/{{secrets_file}}")?;
    ctx.render("{{deploy_path}}/shared/{{secrets_file}}")
}

fn cleanup(ctx: &mut TaskContext<'_>) -> Result<String> {
    let deploy_path = ctx.get_str("deploy_path")?;
    let keep = match ctx.get("keep_releases")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|keep| *keep > 0)
    .ok_or_else(|| {
        Error::config_invalid_value(
            "keep_releases",
            ctx.get_str("keep_releases").ok(),
            "Expected a positive number",
        )
    })?;

    let command = format!(
        "cd {} && ls -1 | sort -rn | tail -n +{} | while read -r old; do rm -rf \"$old\"; echo \"$old\"; done",
        quote_path(&join_remote(&deploy_path, &[RELEASES_DIR])),
        keep + 1
    );
    ctx.exec(&command)
}

fn success(ctx: &mut TaskContext<'_>) -> Result<String> {
    let line = format!("Deployed to {}", ctx.host().name());
    log_status!("deploy", "{}", line);
    Ok(line)
}

fn rollback(ctx: &mut TaskContext<'_>) -> Result<String> {
    let deploy_path = ctx.get_str("deploy_path")?;
    let releases = join_remote(&deploy_path, &[RELEASES_DIR]);
    let command = format!(
        "cd {dp} && cur=$(basename \"$(readlink {current})\") && prev=$(ls -1 {rel} | sort -n | awk -v c=\"$cur\" '$1+0 < c+0' | tail -n 1) && if [ -z \"$prev\" ]; then echo \"No release before $cur\" >&2; exit 1; fi && ln -nfs {rel}/\"$prev\" current.tmp && mv -fT current.tmp {current} && echo \"$prev\"",
        dp = quote_path(&deploy_path),
        rel = quote_path(&releases),
        current = CURRENT_LINK,
    );

    let previous = ctx.exec(&command)?.trim().to_string();
    log_status!("deploy", "Rolled {} back to release {}", ctx.host().name(), previous);
    Ok(previous)
}
