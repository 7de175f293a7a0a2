// Contracts between the reconciliation service and the host system.
// Every implementation shells out or calls an API once per operation and
// reports failures as human-readable strings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::sys::secrets::Credential;

// ==============================================================================
// 1. Ingress (Virtual Hosts)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
}

/// Everything needed to render one virtual host.
#[derive(Debug, Clone)]
pub struct SiteSpec {
    pub domain: String,
    pub aliases: Vec<String>,
    pub document_root: PathBuf,
    /// Reverse-proxy to 127.0.0.1:<port> instead of serving the root.
    pub upstream_port: Option<u16>,
    pub php_fpm_socket: Option<String>,
    pub tls: Option<TlsPaths>,
}

#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Creates or replaces the vhost. A config that fails the server's own
    /// syntax check is rolled back before the error is returned.
    async fn create_site(&self, site: &SiteSpec) -> Result<(), String>;

    async fn remove_site(&self, domain: &str) -> Result<(), String>;

    async fn site_exists(&self, domain: &str) -> bool;
}

// ==============================================================================
// 2. Document Roots
// ==============================================================================

#[async_trait]
pub trait SiteRootManager: Send + Sync {
    async fn provision_root(&self, path: &Path, owner: &str) -> Result<(), String>;

    /// Only paths strictly inside the web root may be removed.
    async fn remove_root(&self, path: &Path) -> Result<(), String>;

    async fn root_exists(&self, path: &Path) -> bool;
}

// ==============================================================================
// 3. Certificates
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertProvider {
    LetsEncrypt,
    Custom,
}

pub struct SslPayload {
    pub domain_name: String,
    pub fullchain_pem: String,
    /// The engine writes the key to disk and destroys the credential.
    pub privkey_pem: Credential,
}

#[async_trait]
pub trait SslEngine: Send + Sync {
    /// ACME issuance through the HTTP-01 webroot challenge.
    async fn issue_certificate(
        &self,
        domain: &str,
        aliases: &[String],
        webroot: &Path,
    ) -> Result<TlsPaths, String>;

    async fn install_certificate(&self, payload: SslPayload) -> Result<TlsPaths, String>;

    async fn remove_certificate(&self, domain: &str, provider: CertProvider) -> Result<(), String>;

    async fn certificate_expiry(&self, fullchain: &Path) -> Result<DateTime<Utc>, String>;
}

// ==============================================================================
// 4. Database Engine
// ==============================================================================

#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Creates the schema, a `'user'@'localhost'` account and the grant.
    async fn create_database(&self, name: &str, user: &str, password: &Credential) -> Result<(), String>;

    async fn drop_database(&self, name: &str, user: &str) -> Result<(), String>;

    async fn set_password(&self, user: &str, password: &Credential) -> Result<(), String>;

    async fn dump_database(&self, name: &str, dest: &Path) -> Result<(), String>;

    async fn import_database(&self, name: &str, src: &Path) -> Result<(), String>;
}

// ==============================================================================
// 5. Mail Server
// ==============================================================================

#[async_trait]
pub trait MailServer: Send + Sync {
    async fn add_mailbox(&self, email: &str, password: &Credential) -> Result<(), String>;
    async fn remove_mailbox(&self, email: &str) -> Result<(), String>;
    async fn set_mailbox_password(&self, email: &str, password: &Credential) -> Result<(), String>;
    async fn add_alias(&self, source: &str, destination: &str) -> Result<(), String>;
    async fn remove_alias(&self, source: &str, destination: &str) -> Result<(), String>;
}

// ==============================================================================
// 6. DNS Provider
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
        })
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "CNAME" => Ok(RecordType::Cname),
            "MX" => Ok(RecordType::Mx),
            "TXT" => Ok(RecordType::Txt),
            other => Err(format!("Unsupported record type '{}'", other)),
        }
    }
}

fn default_ttl() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordSpec {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Fully-qualified once validated; `@` and relative names are accepted on input.
    pub name: String,
    pub content: String,
    /// 1 means "automatic" at the provider.
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default)]
    pub priority: Option<u16>,
    #[serde(default)]
    pub proxied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    #[serde(flatten)]
    pub spec: DnsRecordSpec,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Resolves the hosted zone that owns `name` (walks up parent labels).
    async fn find_zone(&self, name: &str) -> Result<String, String>;

    async fn list_records(&self, zone: &str) -> Result<Vec<ProviderRecord>, String>;

    /// Updates the record with the same type and name if one exists,
    /// otherwise creates it. Returns the provider's record id.
    async fn upsert_record(&self, zone: &str, record: &DnsRecordSpec) -> Result<String, String>;

    async fn delete_record(&self, zone: &str, record_id: &str) -> Result<(), String>;
}

// ==============================================================================
// 7. Backups & Retention
// ==============================================================================

pub struct BackupRequest<'a> {
    pub domain: &'a str,
    pub site_root: &'a Path,
    pub databases: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArchive {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait BackupManager: Send + Sync {
    async fn create_backup(&self, request: &BackupRequest<'_>) -> Result<BackupArchive, String>;

    /// Restores site files into `site_root` and imports every bundled dump.
    async fn restore_backup(&self, archive: &Path, site_root: &Path) -> Result<(), String>;

    async fn delete_backup(&self, archive: &Path) -> Result<(), String>;
}

#[async_trait]
pub trait RetentionManager: Send + Sync {
    /// Deletes the oldest archives beyond `keep_count`; returns how many went.
    async fn prune_old_backups(&self, backups_dir: &Path, keep_count: usize) -> Result<usize, String>;
}

// ==============================================================================
// 8. Job Scheduling
// ==============================================================================

/// Discrete binary + args so nothing is interpreted by a shell.
pub struct JobIntent {
    pub name: String,
    pub binary: String,
    pub args: Vec<String>,
    /// Systemd OnCalendar format
    pub schedule: String,
    pub run_as_user: String,
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule_job(&self, intent: &JobIntent) -> Result<(), String>;
    async fn unschedule_job(&self, name: &str) -> Result<(), String>;
}

// ==============================================================================
// 9. Host Statistics
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostStats {
    pub hostname: String,
    pub cpu_percent: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_percent: f32,
    pub disk_total_bytes: u64,
    pub disk_available_bytes: u64,
    pub disk_percent: f32,
    pub uptime_secs: u64,
    pub load_average: [f64; 3],
}

#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn collect(&self) -> Result<HostStats, String>;
}
