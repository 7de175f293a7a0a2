// Subprocess plumbing shared by the system managers.

use regex::Regex;
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

static CREDENTIAL_IN_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(://)([^@/\s]+)@").expect("static regex"));
static PASSWORD_FLAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(password[=:\s]+)\S+").expect("static regex"));

/// Redacts credentials that tools like to echo back in their errors.
pub fn scrub(input: &str) -> String {
    let pass1 = CREDENTIAL_IN_URL.replace_all(input, "$1[REDACTED]@");
    PASSWORD_FLAG.replace_all(&pass1, "$1[REDACTED]").trim().to_string()
}

/// Spawns the command, waits, and turns a non-zero exit into an error that
/// carries the (scrubbed) stderr. Returns stdout on success.
pub async fn run(cmd: &mut Command, label: &str) -> Result<String, String> {
    let output = cmd
        .output()
        .await
        .map_err(|e| format!("{} spawn error: {}", label, e))?;
    check(output, label)
}

/// Like `run`, but feeds `input` to the child's stdin so secrets never
/// appear in argv.
pub async fn run_with_input(cmd: &mut Command, input: &[u8], label: &str) -> Result<String, String> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("{} spawn error: {}", label, e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| format!("{}: stdin unavailable", label))?;
    stdin
        .write_all(input)
        .await
        .map_err(|e| format!("{}: failed to write stdin: {}", label, e))?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("{} wait error: {}", label, e))?;
    check(output, label)
}

pub fn check(output: Output, label: &str) -> Result<String, String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }

    let code = output.status.code().unwrap_or(-1);
    let stderr = scrub(&String::from_utf8_lossy(&output.stderr));
    warn!(label, code, %stderr, "external command failed");

    if stderr.is_empty() {
        Err(format!("{} exited with code {}", label, code))
    } else {
        Err(format!("{} failed: {}", label, stderr))
    }
}
