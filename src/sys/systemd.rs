// src/sys/systemd.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::process::Command;
use tracing::info;

use crate::sys::command;
use crate::sys::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
        })
    }
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn reload_daemon(&self) -> Result<(), String>;
    async fn control(&self, action: ServiceAction, unit: &str) -> Result<(), String>;
    async fn is_active(&self, unit: &str) -> bool;
}

pub struct LinuxSystemdManager;

#[async_trait]
impl ServiceManager for LinuxSystemdManager {
    async fn reload_daemon(&self) -> Result<(), String> {
        command::run(Command::new("systemctl").arg("daemon-reload"), "systemctl daemon-reload").await?;
        Ok(())
    }

    async fn control(&self, action: ServiceAction, unit: &str) -> Result<(), String> {
        validate::unit_name(unit)?;
        let action_str = action.to_string();
        command::run(
            Command::new("systemctl").args([action_str.as_str(), unit]),
            &format!("systemctl {}", action_str),
        )
        .await?;
        info!(unit, %action, "service action applied");
        Ok(())
    }

    async fn is_active(&self, unit: &str) -> bool {
        if validate::unit_name(unit).is_err() {
            return false;
        }
        Command::new("systemctl")
            .args(["is-active", "--quiet", unit])
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
