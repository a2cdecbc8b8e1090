//! Remote/local process spawning (§4.E "Launch"). Local-vs-remote optimization: if the
//! chosen host resolves to a local interface, spawn directly with no SSH involved.

use anyhow::{anyhow, Context, Result};
use kprov_core::prelude::*;
use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

pub fn ip_is_local(ip: &str) -> bool {
    TcpListener::bind((ip, 0)).is_ok()
}

pub fn kernel_log_path(kernel_id: &KernelId) -> std::path::PathBuf {
    let dir = std::env::var("GP_KERNEL_LOG_DIR").unwrap_or_else(|_| "/tmp".to_string());
    std::path::Path::new(&dir).join(format!("kernel-{kernel_id}.log"))
}

/// Spawns `argv` locally, redirecting stdout/stderr to the kernel log file. Returns the
/// child so the caller can track it for fast-fail detection.
pub fn spawn_local(argv: &[String], env: &HashMap<String, String>, log_path: &std::path::Path) -> Result<Child> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening kernel log file {}", log_path.display()))?;
    let stderr_file = log_file.try_clone().context("cloning kernel log file handle for stderr")?;

    let (program, rest) = argv.split_first().ok_or_else(|| anyhow!("empty argv"))?;
    Command::new(program)
        .args(rest)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .context("spawning local kernel process")
}

/// Builds the remote startup command: exported envs, then `nohup <argv> >> log 2>&1 & echo $!`.
pub fn build_remote_startup_command(argv: &[String], env: &HashMap<String, String>, kernel_spec_env: &HashMap<String, String>, log_path: &std::path::Path) -> String {
    let mut cmd = String::new();
    if let Some(kid) = env.get("KERNEL_ID") {
        cmd.push_str(&format!("export KERNEL_ID=\"{kid}\";"));
    }
    if let Some(user) = env.get("KERNEL_USERNAME") {
        cmd.push_str(&format!("export KERNEL_USERNAME=\"{user}\";"));
    }
    if let Some(impersonation) = env.get("GP_IMPERSONATION_ENABLED") {
        cmd.push_str(&format!("export GP_IMPERSONATION_ENABLED=\"{impersonation}\";"));
    }
    for (key, value) in kernel_spec_env {
        let escaped = serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\"")).replace('\'', "''");
        cmd.push_str(&format!("export {key}={escaped};"));
    }
    cmd.push_str("nohup");
    for arg in argv {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd.push_str(&format!(" >> {} 2>&1 & echo $!", log_path.display()));
    cmd
}

/// Executes `command` on `host` via `ssh`, returning stdout lines (falling back to stderr
/// when stdout is empty, matching the original's `_rsh`).
pub async fn rsh(host: &str, ssh_port: u16, user: Option<&str>, command: &str) -> Result<Vec<String>> {
    let mut cmd = Command::new("ssh");
    cmd.args(["-p", &ssh_port.to_string(), "-o", "BatchMode=yes"]);
    let target = match user {
        Some(u) => format!("{u}@{host}"),
        None => host.to_string(),
    };
    cmd.arg(&target).arg(command);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let child = cmd.spawn().context("spawning ssh for remote command execution")?;
    let output = tokio::time::timeout(Duration::from_secs(30), child.wait_with_output())
        .await
        .context("ssh remote command timed out after 30s")?
        .context("waiting for ssh remote command")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<String> = stdout.lines().map(|l| l.to_string()).filter(|l| !l.is_empty()).collect();
    if !lines.is_empty() {
        return Ok(lines);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(stderr.lines().map(|l| l.to_string()).collect())
}
