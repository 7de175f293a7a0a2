// Site + database backups as a single tar.gz per run.
//
// Archive layout:
//   databases/<name>.sql   one mysqldump per database linked to the domain
//   <site dir name>/...    the domain's directory under the web root

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::sys::command;
use crate::sys::traits::{BackupArchive, BackupManager, BackupRequest, DatabaseEngine};
use crate::sys::validate;

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

pub fn archive_name(domain: &str, timestamp: &str) -> String {
    format!("{}-{}{}", domain, timestamp, ARCHIVE_SUFFIX)
}

/// Backup id is the archive file name without the suffix.
pub fn archive_id(path: &Path) -> Option<String> {
    path.file_name()?
        .to_str()?
        .strip_suffix(ARCHIVE_SUFFIX)
        .map(str::to_string)
}

pub struct TarBackupManager {
    backup_dir: PathBuf,
    db: Arc<dyn DatabaseEngine>,
}

impl TarBackupManager {
    pub fn new(backup_dir: PathBuf, db: Arc<dyn DatabaseEngine>) -> Self {
        Self { backup_dir, db }
    }

    fn staging_dir(&self, parent: &Path) -> Result<tempfile::TempDir, String> {
        tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)
            .map_err(|e| format!("Failed to create staging directory: {}", e))
    }
}

#[async_trait]
impl BackupManager for TarBackupManager {
    async fn create_backup(&self, request: &BackupRequest<'_>) -> Result<BackupArchive, String> {
        let domain = validate::domain_name(request.domain)?;
        let (site_parent, site_dir) = match (request.site_root.parent(), request.site_root.file_name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => return Err(format!("Invalid site root {}", request.site_root.display())),
        };

        let domain_dir = self.backup_dir.join(&domain);
        fs::create_dir_all(&domain_dir)
            .await
            .map_err(|e| format!("Failed to create backup directory: {}", e))?;

        let created_at = Utc::now();
        let archive = domain_dir.join(archive_name(&domain, &created_at.format("%Y%m%d%H%M%S").to_string()));
        if fs::metadata(&archive).await.is_ok() {
            return Err(format!("A backup for {} was already taken this second", domain));
        }

        // Staging lives next to the archives so the dumps never leave the
        // backup filesystem; the TempDir guard removes it on every path.
        let staging = self.staging_dir(&domain_dir)?;
        let dumps = staging.path().join("databases");
        fs::create_dir_all(&dumps).await.map_err(|e| e.to_string())?;

        for name in request.databases {
            self.db.dump_database(name, &dumps.join(format!("{}.sql", name))).await?;
        }

        let mut tar = Command::new("tar");
        tar.arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(staging.path())
            .arg("databases");
        if fs::metadata(request.site_root).await.is_ok() {
            tar.arg("-C").arg(site_parent).arg(site_dir);
        } else {
            warn!(domain = %domain, root = %request.site_root.display(), "site root missing, archiving databases only");
        }

        if let Err(e) = command::run(&mut tar, "tar create").await {
            let _ = fs::remove_file(&archive).await;
            return Err(e);
        }

        let size_bytes = fs::metadata(&archive).await.map(|m| m.len()).unwrap_or(0);
        info!(domain = %domain, archive = %archive.display(), size_bytes, "backup created");

        Ok(BackupArchive {
            path: archive,
            size_bytes,
            created_at,
        })
    }

    async fn restore_backup(&self, archive: &Path, site_root: &Path) -> Result<(), String> {
        if !archive.starts_with(&self.backup_dir) {
            return Err(format!("Refusing to restore {} from outside the backup directory", archive.display()));
        }
        let site_dir = site_root
            .file_name()
            .ok_or_else(|| format!("Invalid site root {}", site_root.display()))?;
        let parent = archive
            .parent()
            .ok_or_else(|| format!("Invalid archive path {}", archive.display()))?;

        let staging = self.staging_dir(parent)?;
        command::run(
            Command::new("tar").arg("-xzf").arg(archive).arg("-C").arg(staging.path()),
            "tar extract",
        )
        .await?;

        let extracted_site = staging.path().join(site_dir);
        if fs::metadata(&extracted_site).await.is_ok() {
            fs::create_dir_all(site_root).await.map_err(|e| e.to_string())?;
            // "dir/." copies contents, preserving ownership and modes.
            command::run(
                Command::new("cp")
                    .arg("-a")
                    .arg(extracted_site.join("."))
                    .arg(site_root),
                "cp restore",
            )
            .await?;
        }

        let dumps = staging.path().join("databases");
        if let Ok(mut entries) = fs::read_dir(&dumps).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Some(name) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(".sql"))
                else {
                    continue;
                };
                self.db.import_database(name, &path).await?;
            }
        }

        info!(archive = %archive.display(), root = %site_root.display(), "backup restored");
        Ok(())
    }

    async fn delete_backup(&self, archive: &Path) -> Result<(), String> {
        if !archive.starts_with(&self.backup_dir) {
            return Err(format!("Refusing to delete {} outside the backup directory", archive.display()));
        }
        match fs::remove_file(archive).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("Failed to delete {}: {}", archive.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::secrets::Credential;

    struct NoDatabases;

    #[async_trait]
    impl DatabaseEngine for NoDatabases {
        async fn create_database(&self, _: &str, _: &str, _: &Credential) -> Result<(), String> {
            Ok(())
        }
        async fn drop_database(&self, _: &str, _: &str) -> Result<(), String> {
            Ok(())
        }
        async fn set_password(&self, _: &str, _: &Credential) -> Result<(), String> {
            Ok(())
        }
        async fn dump_database(&self, name: &str, dest: &Path) -> Result<(), String> {
            fs::write(dest, format!("-- dump of {}\n", name)).await.map_err(|e| e.to_string())
        }
        async fn import_database(&self, _: &str, _: &Path) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn archive_ids_round_trip_names() {
        let name = archive_name("example.com", "20261018120000");
        assert_eq!(name, "example.com-20261018120000.tar.gz");
        assert_eq!(
            archive_id(Path::new("/var/backups/sj-panel/example.com").join(&name).as_path()).as_deref(),
            Some("example.com-20261018120000")
        );
        assert_eq!(archive_id(Path::new("/tmp/notes.txt")), None);
    }

    #[tokio::test]
    async fn create_and_restore_archive() {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = dir.path().join("backups");
        let site = dir.path().join("www").join("example.com");
        fs::create_dir_all(site.join("public_html")).await.unwrap();
        fs::write(site.join("public_html/index.html"), "hello").await.unwrap();

        let mgr = TarBackupManager::new(backup_dir.clone(), Arc::new(NoDatabases));
        let archive = mgr
            .create_backup(&BackupRequest {
                domain: "example.com",
                site_root: &site,
                databases: &["shop".to_string()],
            })
            .await
            .unwrap();

        assert!(archive.path.starts_with(backup_dir.join("example.com")));
        assert!(archive.size_bytes > 0);

        fs::write(site.join("public_html/index.html"), "defaced").await.unwrap();
        mgr.restore_backup(&archive.path, &site).await.unwrap();
        assert_eq!(fs::read_to_string(site.join("public_html/index.html")).await.unwrap(), "hello");

        mgr.delete_backup(&archive.path).await.unwrap();
        assert!(fs::metadata(&archive.path).await.is_err());
    }

    #[tokio::test]
    async fn refuses_paths_outside_backup_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TarBackupManager::new(dir.path().join("backups"), Arc::new(NoDatabases));
        assert!(mgr.delete_backup(Path::new("/etc/passwd")).await.is_err());
        assert!(mgr.restore_backup(Path::new("/etc/passwd"), dir.path()).await.is_err());
    }
}
