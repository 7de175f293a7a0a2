// Test fixtures: a throwaway config and recording fakes for every host
// collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{PanelConfig, ProxyKind};
use crate::server::{Managers, PanelService};
use crate::sys::backup::{archive_id, archive_name};
use crate::sys::cleanup::SystemRetentionManager;
use crate::sys::secrets::Credential;
use crate::sys::systemd::{ServiceAction, ServiceManager};
use crate::sys::traits::{
    BackupArchive, BackupManager, BackupRequest, CertProvider, DatabaseEngine, DnsProvider, DnsRecordSpec, HostStats,
    JobIntent, JobScheduler, MailServer, ProviderRecord, ProxyManager, SiteRootManager, SiteSpec, SslEngine,
    SslPayload, StatsProvider, TlsPaths,
};

pub fn config(dir: &Path) -> PanelConfig {
    PanelConfig {
        socket_path: dir.join("panel.sock"),
        socket_gid: None,
        data_dir: dir.join("data"),
        web_root: dir.join("www"),
        web_user: "www-data".to_string(),
        proxy: ProxyKind::Nginx,
        proxy_dir: dir.join("nginx"),
        php_fpm_socket: Some("/run/php/php8.3-fpm.sock".to_string()),
        ssl_storage_dir: dir.join("ssl"),
        letsencrypt_dir: dir.join("letsencrypt"),
        acme_email: None,
        mysql_host: "localhost".to_string(),
        mysql_user: "root".to_string(),
        mysql_password: Credential::from(String::new()),
        mail_container: "mailserver".to_string(),
        cloudflare_token: None,
        server_ip: None,
        backup_dir: dir.join("backups"),
        backup_keep: 2,
        systemd_dir: dir.join("systemd"),
        managed_units: vec!["nginx".to_string(), "mysql".to_string(), "docker".to_string()],
    }
}

/// Shared call log. Every fake appends a short line per operation and can be
/// told to fail operations whose line starts with a given prefix.
#[derive(Clone, Default)]
pub struct Calls {
    log: Arc<Mutex<Vec<String>>>,
    fail_prefix: Arc<Mutex<Option<String>>>,
    missing_sites: Arc<Mutex<HashSet<String>>>,
    counter: Arc<AtomicUsize>,
}

impl Calls {
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    pub fn fail_on(&self, prefix: &str) {
        *self.fail_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn set_missing_site(&self, domain: &str) {
        self.missing_sites.lock().unwrap().insert(domain.to_string());
    }

    fn next(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, line: String) -> Result<(), String> {
        let failing = self
            .fail_prefix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|p| line.starts_with(p));
        self.log.lock().unwrap().push(line.clone());
        if failing { Err(format!("{} failed", line)) } else { Ok(()) }
    }
}

pub fn service() -> (PanelService, Calls, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let calls = Calls::default();
    let config = config(dir.path());
    let managers = managers(&config, &calls);
    (PanelService::with_managers(config, managers), calls, dir)
}

pub fn service_with_dns() -> (PanelService, Calls, tempfile::TempDir) {
    let calls = Calls::default();
    service_using_dns(Box::new(FakeDns(calls.clone())), calls)
}

/// A DNS-enabled service whose provider is supplied by the test.
pub fn service_using_dns(provider: Box<dyn DnsProvider>, calls: Calls) -> (PanelService, Calls, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.cloudflare_token = Some(Credential::from("cf-token".to_string()));
    config.server_ip = Some("203.0.113.10".to_string());
    let mut managers = managers(&config, &calls);
    managers.dns = Some(provider);
    (PanelService::with_managers(config, managers), calls, dir)
}

/// One-request-per-connection HTTP stub. Each request is logged as
/// `METHOD target [body]` and answered with the handler's status and JSON.
pub async fn fake_http<F>(handler: F) -> (String, Arc<Mutex<Vec<String>>>)
where
    F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let (method, target, body) = read_request(&mut socket).await;
            let line = if body.is_empty() {
                format!("{} {}", method, target)
            } else {
                format!("{} {} {}", method, target, body)
            };
            log.lock().unwrap().push(line);

            let (status, reply) = handler(&method, &target);
            let response = format!(
                "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                reply.len(),
                reply
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{}", addr), seen)
}

async fn read_request(socket: &mut TcpStream) -> (String, String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break buf.len();
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
    (method, target, body)
}

fn managers(config: &PanelConfig, calls: &Calls) -> Managers {
    Managers {
        proxy: Box::new(FakeProxy(calls.clone())),
        roots: Box::new(FakeRoots {
            calls: calls.clone(),
            web_root: config.web_root.clone(),
        }),
        ssl: Box::new(FakeSsl {
            calls: calls.clone(),
            live_dir: config.letsencrypt_dir.clone(),
        }),
        db: Arc::new(FakeDatabase(calls.clone())),
        mail: Box::new(FakeMail(calls.clone())),
        dns: None,
        backups: Box::new(FakeBackups {
            calls: calls.clone(),
            backup_dir: config.backup_dir.clone(),
        }),
        retention: Box::new(SystemRetentionManager),
        scheduler: Box::new(FakeScheduler(calls.clone())),
        services: Box::new(FakeServices(calls.clone())),
        stats: Box::new(FakeStats),
    }
}

struct FakeProxy(Calls);

#[async_trait]
impl ProxyManager for FakeProxy {
    async fn create_site(&self, site: &SiteSpec) -> Result<(), String> {
        self.0
            .record(format!("proxy.create {} tls={}", site.domain, site.tls.is_some()))
    }

    async fn remove_site(&self, domain: &str) -> Result<(), String> {
        self.0.record(format!("proxy.remove {}", domain))
    }

    async fn site_exists(&self, domain: &str) -> bool {
        !self.0.missing_sites.lock().unwrap().contains(domain)
    }
}

struct FakeRoots {
    calls: Calls,
    web_root: PathBuf,
}

impl FakeRoots {
    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.web_root).unwrap_or(path).display().to_string()
    }
}

#[async_trait]
impl SiteRootManager for FakeRoots {
    async fn provision_root(&self, path: &Path, _owner: &str) -> Result<(), String> {
        self.calls.record(format!("roots.provision {}", self.relative(path)))
    }

    async fn remove_root(&self, path: &Path) -> Result<(), String> {
        self.calls.record(format!("roots.remove {}", self.relative(path)))
    }

    async fn root_exists(&self, _path: &Path) -> bool {
        true
    }
}

struct FakeSsl {
    calls: Calls,
    live_dir: PathBuf,
}

impl FakeSsl {
    fn paths(&self, domain: &str) -> TlsPaths {
        TlsPaths {
            fullchain: self.live_dir.join(domain).join("fullchain.pem"),
            privkey: self.live_dir.join(domain).join("privkey.pem"),
        }
    }
}

#[async_trait]
impl SslEngine for FakeSsl {
    async fn issue_certificate(&self, domain: &str, aliases: &[String], _webroot: &Path) -> Result<TlsPaths, String> {
        let line = format!("ssl.issue {} {}", domain, aliases.join(" "));
        self.calls.record(line.trim_end().to_string())?;
        Ok(self.paths(domain))
    }

    async fn install_certificate(&self, payload: SslPayload) -> Result<TlsPaths, String> {
        self.calls.record(format!("ssl.install {}", payload.domain_name))?;
        let paths = self.paths(&payload.domain_name);
        payload.privkey_pem.destroy();
        Ok(paths)
    }

    async fn remove_certificate(&self, domain: &str, provider: CertProvider) -> Result<(), String> {
        let provider = match provider {
            CertProvider::LetsEncrypt => "letsencrypt",
            CertProvider::Custom => "custom",
        };
        self.calls.record(format!("ssl.remove {} {}", domain, provider))
    }

    async fn certificate_expiry(&self, fullchain: &Path) -> Result<DateTime<Utc>, String> {
        let domain = fullchain
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.record(format!("ssl.expiry {}", domain))?;
        Ok(Utc::now() + Duration::days(90))
    }
}

struct FakeDatabase(Calls);

#[async_trait]
impl DatabaseEngine for FakeDatabase {
    async fn create_database(&self, name: &str, user: &str, _password: &Credential) -> Result<(), String> {
        self.0.record(format!("db.create {} {}", name, user))
    }

    async fn drop_database(&self, name: &str, user: &str) -> Result<(), String> {
        self.0.record(format!("db.drop {} {}", name, user))
    }

    async fn set_password(&self, user: &str, _password: &Credential) -> Result<(), String> {
        self.0.record(format!("db.passwd {}", user))
    }

    async fn dump_database(&self, name: &str, dest: &Path) -> Result<(), String> {
        self.0.record(format!("db.dump {}", name))?;
        tokio::fs::write(dest, b"-- dump\n").await.map_err(|e| e.to_string())
    }

    async fn import_database(&self, name: &str, _src: &Path) -> Result<(), String> {
        self.0.record(format!("db.import {}", name))
    }
}

struct FakeMail(Calls);

#[async_trait]
impl MailServer for FakeMail {
    async fn add_mailbox(&self, email: &str, _password: &Credential) -> Result<(), String> {
        self.0.record(format!("mail.add {}", email))
    }

    async fn remove_mailbox(&self, email: &str) -> Result<(), String> {
        self.0.record(format!("mail.remove {}", email))
    }

    async fn set_mailbox_password(&self, email: &str, _password: &Credential) -> Result<(), String> {
        self.0.record(format!("mail.passwd {}", email))
    }

    async fn add_alias(&self, source: &str, destination: &str) -> Result<(), String> {
        self.0.record(format!("mail.alias.add {} {}", source, destination))
    }

    async fn remove_alias(&self, source: &str, destination: &str) -> Result<(), String> {
        self.0.record(format!("mail.alias.remove {} {}", source, destination))
    }
}

/// Treats the last two labels of any name as its zone.
struct FakeDns(Calls);

#[async_trait]
impl DnsProvider for FakeDns {
    async fn find_zone(&self, name: &str) -> Result<String, String> {
        self.0.record(format!("dns.find {}", name))?;
        let labels: Vec<&str> = name.split('.').collect();
        if labels.len() < 2 {
            return Err(format!("No zone for {}", name));
        }
        Ok(labels[labels.len() - 2..].join("."))
    }

    async fn list_records(&self, zone: &str) -> Result<Vec<ProviderRecord>, String> {
        self.0.record(format!("dns.list {}", zone))?;
        Ok(Vec::new())
    }

    async fn upsert_record(&self, zone: &str, record: &DnsRecordSpec) -> Result<String, String> {
        self.0.record(format!(
            "dns.upsert {} {} {} {}",
            zone, record.record_type, record.name, record.content
        ))?;
        Ok(format!("rec-{}", self.0.next()))
    }

    async fn delete_record(&self, zone: &str, record_id: &str) -> Result<(), String> {
        self.0.record(format!("dns.delete {} {}", zone, record_id))
    }
}

/// Writes small real archives so retention can prune them from disk.
struct FakeBackups {
    calls: Calls,
    backup_dir: PathBuf,
}

#[async_trait]
impl BackupManager for FakeBackups {
    async fn create_backup(&self, request: &BackupRequest<'_>) -> Result<BackupArchive, String> {
        let dir = self.backup_dir.join(request.domain);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| e.to_string())?;
        let path = dir.join(archive_name(request.domain, &format!("{:014}", self.calls.next())));
        tokio::fs::write(&path, b"archive").await.map_err(|e| e.to_string())?;

        self.calls
            .record(format!("backup.create {}", archive_id(&path).unwrap_or_default()))?;
        Ok(BackupArchive {
            path,
            size_bytes: 7,
            created_at: Utc::now(),
        })
    }

    async fn restore_backup(&self, archive: &Path, _site_root: &Path) -> Result<(), String> {
        self.calls
            .record(format!("backup.restore {}", archive_id(archive).unwrap_or_default()))
    }

    async fn delete_backup(&self, archive: &Path) -> Result<(), String> {
        self.calls
            .record(format!("backup.delete {}", archive_id(archive).unwrap_or_default()))?;
        tokio::fs::remove_file(archive).await.map_err(|e| e.to_string())
    }
}

struct FakeScheduler(Calls);

#[async_trait]
impl JobScheduler for FakeScheduler {
    async fn schedule_job(&self, intent: &JobIntent) -> Result<(), String> {
        self.0.record(format!("scheduler.add {} {}", intent.name, intent.schedule))
    }

    async fn unschedule_job(&self, name: &str) -> Result<(), String> {
        self.0.record(format!("scheduler.remove {}", name))
    }
}

struct FakeServices(Calls);

#[async_trait]
impl ServiceManager for FakeServices {
    async fn reload_daemon(&self) -> Result<(), String> {
        self.0.record("services.daemon-reload".to_string())
    }

    async fn control(&self, action: ServiceAction, unit: &str) -> Result<(), String> {
        self.0.record(format!("services.{} {}", action, unit))
    }

    async fn is_active(&self, _unit: &str) -> bool {
        true
    }
}

struct FakeStats;

#[async_trait]
impl StatsProvider for FakeStats {
    async fn collect(&self) -> Result<HostStats, String> {
        Ok(HostStats {
            hostname: "panel-test".to_string(),
            cpu_percent: 12.5,
            memory_total_bytes: 4 << 30,
            memory_used_bytes: 1 << 30,
            memory_percent: 25.0,
            disk_total_bytes: 100 << 30,
            disk_available_bytes: 60 << 30,
            disk_percent: 40.0,
            uptime_secs: 3600,
            load_average: [0.5, 0.4, 0.3],
        })
    }
}
