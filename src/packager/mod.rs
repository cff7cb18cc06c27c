//! Packager - turns a running script into a standalone desktop app.
//!
//! Writes a manifest, a launcher that re-spawns the script with the same
//! `PORT`, and a usage document, then runs the install step and launches
//! the result. Only the install step is observed: once the launcher is
//! spawned it is detached and its failures never reach the caller.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::process::Command as TokioCommand;

use crate::error::{CoreError, CoreResult};
use crate::script::{ScriptRegistry, ScriptSummary};
use crate::server::server_url;
use crate::utils;

/// Time the launcher gives the script before loading its URL.
pub const WARMUP_MS: u64 = 3000;
const MAX_NAME_LEN: usize = 64;

const LAUNCHER_TEMPLATE: &str = include_str!("launcher.js.tmpl");
const README_TEMPLATE: &str = include_str!("README.md.tmpl");

/// Write-once record of a packaged app.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagedAppDescriptor {
    pub name: String,
    pub directory_path: PathBuf,
    pub source_script: String,
    pub source_port: u16,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Packager {
    scripts: ScriptRegistry,
    apps_dir: PathBuf,
    install_command: String,
    launch_command: String,
}

impl Packager {
    pub fn new(
        scripts: ScriptRegistry,
        apps_dir: impl Into<PathBuf>,
        install_command: &str,
        launch_command: &str,
    ) -> Self {
        Self {
            scripts,
            apps_dir: apps_dir.into(),
            install_command: install_command.to_string(),
            launch_command: launch_command.to_string(),
        }
    }

    pub async fn package(&self, name: &str, source_port: u16) -> CoreResult<PackagedAppDescriptor> {
        let name = validate_app_name(name)?;

        let script = self
            .scripts
            .find_running_by_port(source_port)
            .await
            .ok_or(CoreError::NoActiveScript(source_port))?;

        let target_url = server_url(source_port);
        let directory_path = self.apps_dir.join(slugify(&name));
        tokio::fs::create_dir_all(&directory_path).await?;
        write_app_files(&directory_path, &name, &script, &target_url).await?;
        tracing::info!("Packaged '{}' into {}", name, directory_path.display());

        run_install(&self.install_command, &directory_path).await?;
        launch_detached(&self.launch_command, &directory_path);

        Ok(PackagedAppDescriptor {
            name,
            directory_path,
            source_script: script.command,
            source_port,
            created_at: Utc::now(),
        })
    }
}

/// Trimmed name of letters, digits, spaces, `-` and `_`.
pub fn validate_app_name(raw: &str) -> CoreResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(CoreError::InvalidInput("App name is required".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(CoreError::InvalidInput(format!(
            "App name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    let valid = name
        .chars()
        .all(|c| c.is_alphanumeric() || c == ' ' || c == '-' || c == '_');
    if !valid {
        return Err(CoreError::InvalidInput(
            "App name may only contain letters, digits, spaces, '-' and '_'".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Directory and package name: lowercase, runs of spaces become `-`.
pub fn slugify(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

fn manifest(name: &str, script: &ScriptSummary) -> serde_json::Value {
    json!({
        "name": slugify(name),
        "productName": name,
        "version": "1.0.0",
        "description": format!("{} - desktop wrapper for `{}`", name, script.command),
        "main": "launcher.js",
        "scripts": {
            "start": "electron ."
        },
        "devDependencies": {
            "electron": "^28.0.0"
        },
        "localwrap": {
            "sourceScript": script.command,
            "sourcePort": script.effective_port,
            "workingDirectory": script.working_dir,
        }
    })
}

fn render_launcher(name: &str, script: &ScriptSummary, target_url: &str) -> CoreResult<String> {
    let js = |value: &str| serde_json::to_string(value).map_err(anyhow::Error::from);
    Ok(LAUNCHER_TEMPLATE
        .replace("{{APP_NAME}}", &js(name)?)
        .replace("{{COMMAND}}", &js(&script.command)?)
        .replace("{{WORKING_DIR}}", &js(&script.working_dir.to_string_lossy())?)
        .replace("{{PORT}}", &script.effective_port.to_string())
        .replace("{{URL}}", &js(target_url)?)
        .replace("{{WARMUP_MS}}", &WARMUP_MS.to_string()))
}

fn render_readme(name: &str, script: &ScriptSummary, target_url: &str) -> String {
    README_TEMPLATE
        .replace("{{APP_NAME}}", name)
        .replace("{{COMMAND}}", &script.command)
        .replace("{{WORKING_DIR}}", &script.working_dir.to_string_lossy())
        .replace("{{PORT}}", &script.effective_port.to_string())
        .replace("{{URL}}", target_url)
        .replace("{{WARMUP_MS}}", &WARMUP_MS.to_string())
}

async fn write_app_files(dir: &Path, name: &str, script: &ScriptSummary, target_url: &str) -> CoreResult<()> {
    let manifest = serde_json::to_string_pretty(&manifest(name, script)).map_err(anyhow::Error::from)?;
    tokio::fs::write(dir.join("package.json"), manifest).await?;
    tokio::fs::write(dir.join("launcher.js"), render_launcher(name, script, target_url)?).await?;
    tokio::fs::write(dir.join("README.md"), render_readme(name, script, target_url)).await?;
    Ok(())
}

async fn run_install(command: &str, dir: &Path) -> CoreResult<()> {
    let (program, args) = utils::split_command(command)
        .ok_or_else(|| CoreError::InvalidInput("Install command is empty".to_string()))?;

    tracing::info!("Running '{}' in {}", command, dir.display());
    let mut cmd = TokioCommand::new(&program);
    cmd.args(&args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    utils::apply_creation_flags(&mut cmd);

    let output = cmd
        .output()
        .await
        .map_err(|source| CoreError::SpawnFailed { program, source })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    tracing::warn!(
        "Install step failed with {} in {}: {}",
        output.status,
        dir.display(),
        tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
    );
    Err(CoreError::InstallFailed(output.status.code()))
}

/// Fire and forget: failures here are only logged.
fn launch_detached(command: &str, dir: &Path) {
    let Some((program, args)) = utils::split_command(command) else {
        tracing::warn!("Launch command is empty, skipping launch");
        return;
    };

    let mut cmd = TokioCommand::new(&program);
    cmd.args(&args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);
    #[cfg(unix)]
    cmd.process_group(0);
    utils::apply_creation_flags(&mut cmd);

    match cmd.spawn() {
        Ok(child) => tracing::info!(
            "Launched '{}' from {} (PID {:?})",
            command,
            dir.display(),
            child.id()
        ),
        Err(e) => tracing::warn!("Failed to launch '{}' from {}: {}", command, dir.display(), e),
    }
}
