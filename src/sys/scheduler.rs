// src/sys/scheduler.rs

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::process::Command;
use tracing::info;

use crate::sys::command;
use crate::sys::systemd::{LinuxSystemdManager, ServiceManager};
use crate::sys::traits::{JobIntent, JobScheduler};
use crate::sys::validate;

const UNIT_PREFIX: &str = "sj-panel-job-";

/// Quotes one ExecStart argument. systemd expands `%` specifiers and `$`
/// variables, so both are escaped as well.
pub fn systemd_quote(arg: &str) -> String {
    let escaped = arg
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%")
        .replace('$', "$$");
    if escaped.is_empty() || escaped.chars().any(|c| c.is_whitespace() || c == '\'' || c == ';') || escaped != arg {
        format!("\"{}\"", escaped)
    } else {
        escaped
    }
}

pub fn render_units(intent: &JobIntent) -> (String, String) {
    let exec_start = std::iter::once(intent.binary.as_str())
        .chain(intent.args.iter().map(String::as_str))
        .map(systemd_quote)
        .collect::<Vec<_>>()
        .join(" ");

    // Type=oneshot: the process exits when done, systemd must not restart it.
    let service_content = format!(
        r#"[Unit]
Description=SJ Panel Scheduled Job: {job_name}
After=network.target

[Service]
Type=oneshot
User={user}
Group={user}
ExecStart={exec_start}

NoNewPrivileges=true
PrivateTmp=true
ProtectKernelTunables=true
ProtectControlGroups=true
"#,
        job_name = intent.name,
        user = intent.run_as_user,
        exec_start = exec_start
    );

    let timer_content = format!(
        r#"[Unit]
Description=SJ Panel Timer for {job_name}

[Timer]
OnCalendar={schedule}
# Fire on boot if the machine was down at the scheduled time.
Persistent=true
RandomizedDelaySec=60

[Install]
WantedBy=timers.target
"#,
        job_name = intent.name,
        schedule = intent.schedule
    );

    (service_content, timer_content)
}

pub struct SystemdTimerManager {
    systemd_dir: PathBuf,
    systemd: LinuxSystemdManager,
}

impl SystemdTimerManager {
    pub fn new(systemd_dir: PathBuf) -> Self {
        Self {
            systemd_dir,
            systemd: LinuxSystemdManager,
        }
    }

    fn unit_paths(&self, name: &str) -> (String, PathBuf, PathBuf) {
        let unit = format!("{}{}", UNIT_PREFIX, name);
        let service_path = self.systemd_dir.join(format!("{}.service", unit));
        let timer_path = self.systemd_dir.join(format!("{}.timer", unit));
        (unit, service_path, timer_path)
    }
}

fn check_job_name(name: &str) -> Result<(), String> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return Err(format!("Invalid job name '{}'", name));
    }
    Ok(())
}

#[async_trait]
impl JobScheduler for SystemdTimerManager {
    async fn schedule_job(&self, intent: &JobIntent) -> Result<(), String> {
        check_job_name(&intent.name)?;
        validate::on_calendar(&intent.schedule)?;

        let (unit, service_path, timer_path) = self.unit_paths(&intent.name);
        let (service_content, timer_content) = render_units(intent);

        fs::write(&service_path, service_content)
            .await
            .map_err(|e| format!("Failed to write service file: {}", e))?;
        fs::write(&timer_path, timer_content)
            .await
            .map_err(|e| format!("Failed to write timer file: {}", e))?;

        for path in [&service_path, &timer_path] {
            command::run(Command::new("chmod").arg("644").arg(path), "chmod").await?;
        }

        self.systemd.reload_daemon().await?;

        // Enable the timer, not the service.
        let timer_name = format!("{}.timer", unit);
        command::run(
            Command::new("systemctl").args(["enable", "--now", timer_name.as_str()]),
            "systemctl enable timer",
        )
        .await?;

        info!(job = %intent.name, schedule = %intent.schedule, "job scheduled");
        Ok(())
    }

    async fn unschedule_job(&self, name: &str) -> Result<(), String> {
        check_job_name(name)?;
        let (unit, service_path, timer_path) = self.unit_paths(name);

        // Already-disabled timers are fine; the unit files are what matter.
        let _ = Command::new("systemctl")
            .args(["disable", "--now", format!("{}.timer", unit).as_str()])
            .output()
            .await;

        for path in [&timer_path, &service_path] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(format!("Failed to remove {}: {}", path.display(), e)),
            }
        }

        self.systemd.reload_daemon().await?;
        info!(job = name, "job unscheduled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> JobIntent {
        JobIntent {
            name: "backup-example.com".to_string(),
            binary: "/usr/bin/curl".to_string(),
            args: vec![
                "--unix-socket".to_string(),
                "/var/run/sj-panel/panel.sock".to_string(),
                "-d".to_string(),
                r#"{"domain":"example.com"}"#.to_string(),
            ],
            schedule: "*-*-* 03:00:00".to_string(),
            run_as_user: "root".to_string(),
        }
    }

    #[test]
    fn quoting_escapes_specifiers_and_quotes() {
        assert_eq!(systemd_quote("plain"), "plain");
        assert_eq!(systemd_quote("two words"), "\"two words\"");
        assert_eq!(systemd_quote("100%"), "\"100%%\"");
        assert_eq!(systemd_quote("$HOME"), "\"$$HOME\"");
        assert_eq!(systemd_quote(r#"{"a":1}"#), r#""{\"a\":1}""#);
        assert_eq!(systemd_quote(""), "\"\"");
    }

    #[test]
    fn units_reference_job_and_schedule() {
        let (service, timer) = render_units(&intent());
        assert!(service.contains("Type=oneshot"));
        assert!(service.contains(
            r#"ExecStart=/usr/bin/curl --unix-socket /var/run/sj-panel/panel.sock -d "{\"domain\":\"example.com\"}""#
        ));
        assert!(timer.contains("OnCalendar=*-*-* 03:00:00"));
        assert!(timer.contains("Persistent=true"));
    }

    #[tokio::test]
    async fn rejects_bad_names_and_calendars() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = SystemdTimerManager::new(dir.path().to_path_buf());

        let mut bad_name = intent();
        bad_name.name = "../../etc/evil".to_string();
        assert!(scheduler.schedule_job(&bad_name).await.is_err());

        let mut bad_schedule = intent();
        bad_schedule.schedule = "daily\nExecStartPre=/bin/sh".to_string();
        assert!(scheduler.schedule_job(&bad_schedule).await.is_err());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
