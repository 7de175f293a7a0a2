// src/sys/cleanup.rs

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::sys::backup::ARCHIVE_SUFFIX;
use crate::sys::traits::RetentionManager;

pub struct SystemRetentionManager;

#[async_trait]
impl RetentionManager for SystemRetentionManager {
    async fn prune_old_backups(&self, backups_dir: &Path, keep_count: usize) -> Result<usize, String> {
        let mut entries = match fs::read_dir(backups_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(format!("Failed to read backups directory: {}", e)),
        };

        let mut paths: Vec<PathBuf> = Vec::new();

        // 1. Collect archives only; staging directories are left alone.
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_archive = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(ARCHIVE_SUFFIX));
            if is_archive && path.is_file() {
                paths.push(path);
            }
        }

        // 2. Name order is chronological: <domain>-<YYYYmmddHHMMSS>.tar.gz
        paths.sort();

        if paths.len() <= keep_count {
            return Ok(0);
        }

        let prune_count = paths.len() - keep_count;
        let mut deleted = 0;

        for path in &paths[..prune_count] {
            if let Err(e) = fs::remove_file(path).await {
                // One stubborn file must not fail the backup that triggered the prune.
                warn!(path = %path.display(), "failed to delete old backup: {}", e);
            } else {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(dir = %backups_dir.display(), deleted, "pruned old backups");
        }
        Ok(deleted)
    }
}
