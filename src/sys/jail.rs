use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::info;

use crate::sys::command;
use crate::sys::traits::SiteRootManager;

const PLACEHOLDER_INDEX: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Site provisioned</title></head>
<body><h1>It works.</h1><p>This site is managed by SJ Panel.</p></body>
</html>
"#;

/// True when `path` is a descendant of `root` without any `..` hops.
pub fn is_strictly_inside(root: &Path, path: &Path) -> bool {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    path != root && path.starts_with(root)
}

pub struct LinuxSiteRootManager {
    web_root: PathBuf,
}

impl LinuxSiteRootManager {
    pub fn new(web_root: PathBuf) -> Self {
        Self { web_root }
    }
}

#[async_trait]
impl SiteRootManager for LinuxSiteRootManager {
    async fn provision_root(&self, path: &Path, owner: &str) -> Result<(), String> {
        if !is_strictly_inside(&self.web_root, path) {
            return Err(format!("Refusing to provision {} outside {}", path.display(), self.web_root.display()));
        }
        if owner.is_empty() || !owner.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(format!("Invalid owner '{}'", owner));
        }

        fs::create_dir_all(path)
            .await
            .map_err(|e| format!("Filesystem Error: {}", e))?;

        // rwxr-x--- : the web server group reads, the world gets nothing.
        let mut perms = fs::metadata(path).await.map_err(|e| e.to_string())?.permissions();
        perms.set_mode(0o750);
        fs::set_permissions(path, perms).await.map_err(|e| e.to_string())?;

        let mut entries = fs::read_dir(path).await.map_err(|e| e.to_string())?;
        if entries.next_entry().await.map_err(|e| e.to_string())?.is_none() {
            fs::write(path.join("index.html"), PLACEHOLDER_INDEX)
                .await
                .map_err(|e| format!("Failed to write placeholder index: {}", e))?;
        }

        // Site directory (parent of public_html) is owned too, so logs and
        // backups can live next to the document root.
        let target = path
            .parent()
            .filter(|p| is_strictly_inside(&self.web_root, p))
            .unwrap_or(path);

        // -h: never follow symlinks planted inside the tree.
        command::run(
            Command::new("chown")
                .arg("-Rh")
                .arg(format!("{}:{}", owner, owner))
                .arg(target),
            "chown",
        )
        .await?;

        info!(path = %path.display(), owner, "document root provisioned");
        Ok(())
    }

    async fn remove_root(&self, path: &Path) -> Result<(), String> {
        if !is_strictly_inside(&self.web_root, path) {
            return Err(format!("Refusing to delete {} outside {}", path.display(), self.web_root.display()));
        }
        match fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(path = %path.display(), "document root removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("Failed to remove {}: {}", path.display(), e)),
        }
    }

    async fn root_exists(&self, path: &Path) -> bool {
        fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
    }
}
