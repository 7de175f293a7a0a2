// src/server.rs
//
// PanelService reconciles JSON records with the host: validate, apply the
// external change, then persist. A failed external call leaves the records
// untouched; deletes tolerate external state that is already gone.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::config::{PanelConfig, ProxyKind};
use crate::error::{PanelError, Result};
use crate::models::{
    AliasRecord, BackupRecord, CertificateRecord, DatabaseRecord, DnsRecordEntry, DomainRecord, MailboxRecord,
    ScheduleRecord,
};
use crate::store::JsonStore;
use crate::sys::backup::{TarBackupManager, archive_id};
use crate::sys::cleanup::SystemRetentionManager;
use crate::sys::database::{MAX_USER_LEN, MysqlEngine};
use crate::sys::dns::CloudflareDns;
use crate::sys::jail::LinuxSiteRootManager;
use crate::sys::mail::DockerMailServer;
use crate::sys::proxy::{ApacheManager, NginxManager};
use crate::sys::scheduler::SystemdTimerManager;
use crate::sys::secrets::Credential;
use crate::sys::ssl::CertbotEngine;
use crate::sys::stats::SysinfoStats;
use crate::sys::systemd::{LinuxSystemdManager, ServiceAction, ServiceManager};
use crate::sys::traits::{
    BackupManager, BackupRequest, CertProvider, DatabaseEngine, DnsProvider, DnsRecordSpec, HostStats,
    JobIntent, JobScheduler, MailServer, ProviderRecord, ProxyManager, RecordType, RetentionManager, SiteRootManager,
    SiteSpec, SslEngine, SslPayload, StatsProvider, TlsPaths,
};
use crate::sys::validate;

const GENERATED_PASSWORD_LEN: usize = 24;

// ==============================================================================
// 1. Requests & Responses
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateDomain {
    pub name: String,
    #[serde(default)]
    pub upstream_port: Option<u16>,
    #[serde(default)]
    pub php: bool,
    #[serde(default)]
    pub create_dns: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateDomain {
    #[serde(default)]
    pub upstream_port: Option<u16>,
    #[serde(default)]
    pub php: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteDomain {
    #[serde(default)]
    pub purge_files: bool,
    #[serde(default)]
    pub cascade: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateDatabase {
    pub name: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<Credential>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PasswordChange {
    #[serde(default)]
    pub password: Option<Credential>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMailbox {
    pub email: String,
    pub password: Credential,
}

#[derive(Debug, Deserialize)]
pub struct AliasRequest {
    pub source: String,
    pub destination: String,
}

fn include_www_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct IssueCertificate {
    #[serde(default = "include_www_default")]
    pub include_www: bool,
}

impl Default for IssueCertificate {
    fn default() -> Self {
        Self { include_www: true }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadCertificate {
    pub fullchain_pem: String,
    pub privkey_pem: Credential,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleBackups {
    pub on_calendar: String,
}

/// A record plus the non-fatal problems hit while provisioning it.
#[derive(Debug, Serialize)]
pub struct Provisioned<T> {
    pub record: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DatabaseCreated {
    pub database: DatabaseRecord,
    /// Present only when the panel generated the password; shown once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PasswordRotated {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_password: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DriftReport {
    pub domain: String,
    pub vhost_present: bool,
    pub root_present: bool,
    pub certificate_present: bool,
    pub in_sync: bool,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub unit: String,
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct ResourceCounts {
    pub domains: usize,
    pub databases: usize,
    pub mailboxes: usize,
    pub certificates: usize,
    pub certificates_expiring: usize,
    pub backups: usize,
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub host: HostStats,
    pub services: Vec<ServiceStatus>,
    pub resources: ResourceCounts,
}

// ==============================================================================
// 2. Wiring
// ==============================================================================

/// The host-facing collaborators, injected so tests can substitute fakes.
pub struct Managers {
    pub proxy: Box<dyn ProxyManager>,
    pub roots: Box<dyn SiteRootManager>,
    pub ssl: Box<dyn SslEngine>,
    pub db: Arc<dyn DatabaseEngine>,
    pub mail: Box<dyn MailServer>,
    pub dns: Option<Box<dyn DnsProvider>>,
    pub backups: Box<dyn BackupManager>,
    pub retention: Box<dyn RetentionManager>,
    pub scheduler: Box<dyn JobScheduler>,
    pub services: Box<dyn ServiceManager>,
    pub stats: Box<dyn StatsProvider>,
}

impl Managers {
    pub fn system(config: &PanelConfig) -> Self {
        let db: Arc<dyn DatabaseEngine> = Arc::new(MysqlEngine::new(
            config.mysql_host.clone(),
            config.mysql_user.clone(),
            config.mysql_password.clone(),
        ));
        let proxy: Box<dyn ProxyManager> = match config.proxy {
            ProxyKind::Nginx => Box::new(NginxManager::new(config.proxy_dir.clone())),
            ProxyKind::Apache => Box::new(ApacheManager::new(config.proxy_dir.clone())),
        };

        Self {
            proxy,
            roots: Box::new(LinuxSiteRootManager::new(config.web_root.clone())),
            ssl: Box::new(CertbotEngine::new(
                config.letsencrypt_dir.clone(),
                config.ssl_storage_dir.clone(),
                config.acme_email.clone(),
            )),
            backups: Box::new(TarBackupManager::new(config.backup_dir.clone(), db.clone())),
            db,
            mail: Box::new(DockerMailServer::new(config.mail_container.clone())),
            dns: config
                .cloudflare_token
                .clone()
                .map(|token| Box::new(CloudflareDns::new(token)) as Box<dyn DnsProvider>),
            retention: Box::new(SystemRetentionManager),
            scheduler: Box::new(SystemdTimerManager::new(config.systemd_dir.clone())),
            services: Box::new(LinuxSystemdManager),
            stats: Box::new(SysinfoStats),
        }
    }
}

pub struct Stores {
    pub domains: JsonStore<DomainRecord>,
    pub databases: JsonStore<DatabaseRecord>,
    pub mailboxes: JsonStore<MailboxRecord>,
    pub aliases: JsonStore<AliasRecord>,
    pub certificates: JsonStore<CertificateRecord>,
    pub dns_records: JsonStore<DnsRecordEntry>,
    pub backups: JsonStore<BackupRecord>,
    pub schedules: JsonStore<ScheduleRecord>,
}

impl Stores {
    pub fn open(config: &PanelConfig) -> Self {
        let dir = &config.data_dir;
        Self {
            domains: JsonStore::new(dir, "domains"),
            databases: JsonStore::new(dir, "databases"),
            mailboxes: JsonStore::new(dir, "mailboxes"),
            aliases: JsonStore::new(dir, "aliases"),
            certificates: JsonStore::new(dir, "certificates"),
            dns_records: JsonStore::new(dir, "dns_records"),
            backups: JsonStore::new(dir, "backups"),
            schedules: JsonStore::new(dir, "backup_schedules"),
        }
    }
}

pub struct PanelService {
    config: PanelConfig,
    m: Managers,
    stores: Stores,
}

fn invalid(e: String) -> PanelError {
    PanelError::Invalid(e)
}

fn system(e: String) -> PanelError {
    PanelError::System(e)
}

impl PanelService {
    pub fn new(config: PanelConfig) -> Self {
        let managers = Managers::system(&config);
        Self::with_managers(config, managers)
    }

    pub fn with_managers(config: PanelConfig, managers: Managers) -> Self {
        Self {
            stores: Stores::open(&config),
            config,
            m: managers,
        }
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    fn site_dir(&self, domain: &str) -> PathBuf {
        self.config.web_root.join(domain)
    }

    fn site_spec(&self, record: &DomainRecord, tls: Option<TlsPaths>) -> SiteSpec {
        SiteSpec {
            domain: record.name.clone(),
            aliases: vec![format!("www.{}", record.name)],
            document_root: record.document_root.clone(),
            upstream_port: record.upstream_port,
            php_fpm_socket: if record.php { self.config.php_fpm_socket.clone() } else { None },
            tls,
        }
    }

    async fn require_domain(&self, name: &str) -> Result<DomainRecord> {
        self.stores
            .domains
            .get(name)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("domain {}", name)))
    }

    async fn current_tls(&self, domain: &str) -> Result<Option<TlsPaths>> {
        Ok(self.stores.certificates.get(domain).await?.map(|c| c.paths))
    }

    fn dns(&self) -> Result<&dyn DnsProvider> {
        self.m.dns.as_deref().ok_or(PanelError::Disabled("Cloudflare DNS"))
    }

    fn check_site_options(&self, upstream_port: Option<u16>, php: bool) -> Result<()> {
        if upstream_port == Some(0) {
            return Err(PanelError::Invalid("upstream port 0 is reserved".to_string()));
        }
        if php && upstream_port.is_some() {
            return Err(PanelError::Invalid("a site is either PHP or reverse-proxied, not both".to_string()));
        }
        if php && self.config.php_fpm_socket.is_none() {
            return Err(PanelError::Invalid("PHP requested but SJ_PHP_FPM_SOCKET is not set".to_string()));
        }
        Ok(())
    }

    // ==========================================================================
    // 3. Domains
    // ==========================================================================

    pub async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        Ok(self.stores.domains.list().await?)
    }

    pub async fn create_domain(&self, req: CreateDomain) -> Result<Provisioned<DomainRecord>> {
        let name = validate::domain_name(&req.name).map_err(invalid)?;
        self.check_site_options(req.upstream_port, req.php)?;
        if req.create_dns {
            self.dns()?;
            if self.config.server_ip.is_none() {
                return Err(PanelError::Invalid("DNS requested but SJ_SERVER_IP is not set".to_string()));
            }
        }
        if self.stores.domains.get(&name).await?.is_some() {
            return Err(PanelError::Conflict(format!("domain {} already exists", name)));
        }

        let now = Utc::now();
        let mut record = DomainRecord {
            document_root: self.site_dir(&name).join("public_html"),
            name,
            upstream_port: req.upstream_port,
            php: req.php,
            ssl: false,
            dns_zone: None,
            dns_record_id: None,
            created_at: now,
            updated_at: now,
        };

        self.m
            .roots
            .provision_root(&record.document_root, &self.config.web_user)
            .await
            .map_err(system)?;
        self.m
            .proxy
            .create_site(&self.site_spec(&record, None))
            .await
            .map_err(system)?;

        let mut warnings = Vec::new();
        if req.create_dns {
            match self.publish_address_record(&record.name).await {
                Ok((zone, id)) => {
                    record.dns_zone = Some(zone);
                    record.dns_record_id = Some(id);
                }
                Err(e) => {
                    warn!(domain = %record.name, "dns publish failed: {}", e);
                    warnings.push(format!("DNS record not created: {}", e));
                }
            }
        }

        self.stores.domains.upsert(record.clone()).await?;
        info!(domain = %record.name, "domain created");
        Ok(Provisioned { record, warnings })
    }

    pub async fn update_domain(&self, name: &str, req: UpdateDomain) -> Result<DomainRecord> {
        let name = validate::domain_name(name).map_err(invalid)?;
        self.check_site_options(req.upstream_port, req.php)?;
        let mut record = self.require_domain(&name).await?;

        record.upstream_port = req.upstream_port;
        record.php = req.php;
        let tls = self.current_tls(&name).await?;
        self.m
            .proxy
            .create_site(&self.site_spec(&record, tls))
            .await
            .map_err(system)?;

        let updated = self
            .stores
            .domains
            .update(&name, |d| {
                d.upstream_port = req.upstream_port;
                d.php = req.php;
                d.updated_at = Utc::now();
            })
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("domain {}", name)))?;
        info!(domain = %name, "domain updated");
        Ok(updated)
    }

    pub async fn delete_domain(&self, name: &str, opts: DeleteDomain) -> Result<Provisioned<DomainRecord>> {
        let name = validate::domain_name(name).map_err(invalid)?;
        let record = self.require_domain(&name).await?;

        let databases: Vec<DatabaseRecord> = self
            .stores
            .databases
            .list()
            .await?
            .into_iter()
            .filter(|d| d.domain.as_deref() == Some(name.as_str()))
            .collect();
        let mailboxes: Vec<MailboxRecord> = self
            .stores
            .mailboxes
            .list()
            .await?
            .into_iter()
            .filter(|m| m.domain == name)
            .collect();

        if !opts.cascade && (!databases.is_empty() || !mailboxes.is_empty()) {
            return Err(PanelError::Conflict(format!(
                "domain {} still owns {} database(s) and {} mailbox(es); delete them first or cascade",
                name,
                databases.len(),
                mailboxes.len()
            )));
        }

        for db in &databases {
            self.delete_database(&db.name).await?;
        }
        for mailbox in &mailboxes {
            self.delete_mailbox(&mailbox.email).await?;
        }
        let aliases: Vec<AliasRecord> = self
            .stores
            .aliases
            .list()
            .await?
            .into_iter()
            .filter(|a| a.source_domain() == name)
            .collect();
        for alias in &aliases {
            self.delete_alias(&alias.source, &alias.destination).await?;
        }

        let mut warnings = Vec::new();

        if self.stores.schedules.get(&name).await?.is_some() {
            if let Err(e) = self.unschedule_backups(&name).await {
                warnings.push(format!("Backup schedule not removed: {}", e));
            }
        }

        self.m.proxy.remove_site(&name).await.map_err(system)?;

        if let Some(cert) = self.stores.certificates.get(&name).await? {
            if let Err(e) = self.m.ssl.remove_certificate(&name, cert.provider).await {
                warnings.push(format!("Certificate not removed: {}", e));
            }
            self.stores.certificates.remove(&name).await?;
        }

        if let (Some(zone), Some(id)) = (&record.dns_zone, &record.dns_record_id) {
            match self.dns() {
                Ok(dns) => {
                    if let Err(e) = dns.delete_record(zone, id).await {
                        warnings.push(format!("DNS record {} not removed: {}", id, e));
                    }
                }
                Err(e) => warnings.push(format!("DNS record {} left in place: {}", id, e)),
            }
            self.stores.dns_records.remove(id).await?;
        }

        if opts.purge_files {
            if let Err(e) = self.m.roots.remove_root(&self.site_dir(&name)).await {
                warnings.push(format!("Site files not removed: {}", e));
            }
        }

        self.stores.domains.remove(&name).await?;
        info!(domain = %name, cascade = opts.cascade, purge = opts.purge_files, "domain deleted");
        Ok(Provisioned { record, warnings })
    }

    /// Compares every domain record with what is actually on disk.
    pub async fn verify_domains(&self) -> Result<Vec<DriftReport>> {
        let certificates: HashSet<String> = self
            .stores
            .certificates
            .list()
            .await?
            .into_iter()
            .map(|c| c.domain)
            .collect();

        let mut reports = Vec::new();
        for domain in self.stores.domains.list().await? {
            let vhost_present = self.m.proxy.site_exists(&domain.name).await;
            let root_present = self.m.roots.root_exists(&domain.document_root).await;
            let certificate_present = !domain.ssl || certificates.contains(&domain.name);
            let in_sync = vhost_present && root_present && certificate_present;
            if !in_sync {
                warn!(domain = %domain.name, vhost_present, root_present, certificate_present, "domain drift detected");
            }
            reports.push(DriftReport {
                domain: domain.name,
                vhost_present,
                root_present,
                certificate_present,
                in_sync,
            });
        }
        Ok(reports)
    }

    async fn publish_address_record(&self, name: &str) -> std::result::Result<(String, String), String> {
        let dns = self.dns().map_err(|e| e.to_string())?;
        let ip = self
            .config
            .server_ip
            .clone()
            .ok_or_else(|| "SJ_SERVER_IP is not set".to_string())?;
        let record_type = if ip.parse::<Ipv6Addr>().is_ok() { RecordType::Aaaa } else { RecordType::A };

        let zone = dns.find_zone(name).await?;
        let spec = validate::dns_record(
            &DnsRecordSpec {
                record_type,
                name: name.to_string(),
                content: ip,
                ttl: 1,
                priority: None,
                proxied: false,
            },
            &zone,
        )?;
        let id = dns.upsert_record(&zone, &spec).await?;

        self.stores
            .dns_records
            .upsert(DnsRecordEntry {
                id: id.clone(),
                zone: zone.clone(),
                spec,
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| e.to_string())?;
        Ok((zone, id))
    }

    // ==========================================================================
    // 4. Databases
    // ==========================================================================

    pub async fn list_databases(&self) -> Result<Vec<DatabaseRecord>> {
        Ok(self.stores.databases.list().await?)
    }

    pub async fn create_database(&self, req: CreateDatabase) -> Result<DatabaseCreated> {
        validate::db_identifier(&req.name, 64).map_err(invalid)?;
        let user = req.user.clone().unwrap_or_else(|| req.name.clone());
        validate::db_identifier(&user, MAX_USER_LEN).map_err(invalid)?;

        let domain = match &req.domain {
            Some(d) => {
                let d = validate::domain_name(d).map_err(invalid)?;
                self.require_domain(&d).await?;
                Some(d)
            }
            None => None,
        };

        if self.stores.databases.get(&req.name).await?.is_some() {
            return Err(PanelError::Conflict(format!("database {} already exists", req.name)));
        }
        if self.stores.databases.list().await?.iter().any(|d| d.user.eq_ignore_ascii_case(&user)) {
            return Err(PanelError::Conflict(format!("database user {} is already in use", user)));
        }

        let (password, generated) = match req.password {
            Some(pw) => {
                validate::password(&pw).map_err(invalid)?;
                (pw, false)
            }
            None => (Credential::generate(GENERATED_PASSWORD_LEN), true),
        };

        self.m
            .db
            .create_database(&req.name, &user, &password)
            .await
            .map_err(system)?;

        let record = DatabaseRecord {
            name: req.name,
            user,
            domain,
            created_at: Utc::now(),
        };
        self.stores.databases.upsert(record.clone()).await?;
        info!(database = %record.name, user = %record.user, "database created");

        Ok(DatabaseCreated {
            database: record,
            generated_password: generated.then(|| password.use_str(str::to_string)),
        })
    }

    pub async fn rotate_database_password(&self, name: &str, req: PasswordChange) -> Result<PasswordRotated> {
        let record = self
            .stores
            .databases
            .get(name)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("database {}", name)))?;

        let (password, generated) = match req.password {
            Some(pw) => {
                validate::password(&pw).map_err(invalid)?;
                (pw, false)
            }
            None => (Credential::generate(GENERATED_PASSWORD_LEN), true),
        };

        self.m.db.set_password(&record.user, &password).await.map_err(system)?;
        info!(database = %record.name, "database password rotated");
        Ok(PasswordRotated {
            generated_password: generated.then(|| password.use_str(str::to_string)),
        })
    }

    pub async fn delete_database(&self, name: &str) -> Result<DatabaseRecord> {
        let record = self
            .stores
            .databases
            .get(name)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("database {}", name)))?;

        self.m
            .db
            .drop_database(&record.name, &record.user)
            .await
            .map_err(system)?;
        self.stores.databases.remove(&record.name).await?;
        info!(database = %record.name, "database deleted");
        Ok(record)
    }

    // ==========================================================================
    // 5. Mail
    // ==========================================================================

    pub async fn list_mailboxes(&self) -> Result<Vec<MailboxRecord>> {
        Ok(self.stores.mailboxes.list().await?)
    }

    pub async fn create_mailbox(&self, req: CreateMailbox) -> Result<MailboxRecord> {
        let (email, domain) = validate::email(&req.email).map_err(invalid)?;
        validate::password(&req.password).map_err(invalid)?;
        self.require_domain(&domain).await?;
        if self.stores.mailboxes.get(&email).await?.is_some() {
            return Err(PanelError::Conflict(format!("mailbox {} already exists", email)));
        }

        self.m.mail.add_mailbox(&email, &req.password).await.map_err(system)?;

        let record = MailboxRecord {
            email,
            domain,
            created_at: Utc::now(),
        };
        self.stores.mailboxes.upsert(record.clone()).await?;
        info!(email = %record.email, "mailbox created");
        Ok(record)
    }

    pub async fn change_mailbox_password(&self, email: &str, password: Credential) -> Result<()> {
        let (email, _) = validate::email(email).map_err(invalid)?;
        validate::password(&password).map_err(invalid)?;
        if self.stores.mailboxes.get(&email).await?.is_none() {
            return Err(PanelError::NotFound(format!("mailbox {}", email)));
        }
        self.m
            .mail
            .set_mailbox_password(&email, &password)
            .await
            .map_err(system)?;
        info!(%email, "mailbox password changed");
        Ok(())
    }

    pub async fn delete_mailbox(&self, email: &str) -> Result<MailboxRecord> {
        let (email, _) = validate::email(email).map_err(invalid)?;
        let record = self
            .stores
            .mailboxes
            .get(&email)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("mailbox {}", email)))?;

        self.m.mail.remove_mailbox(&email).await.map_err(system)?;
        self.stores.mailboxes.remove(&email).await?;
        info!(%email, "mailbox deleted");
        Ok(record)
    }

    pub async fn list_aliases(&self) -> Result<Vec<AliasRecord>> {
        Ok(self.stores.aliases.list().await?)
    }

    pub async fn create_alias(&self, req: AliasRequest) -> Result<AliasRecord> {
        let (source, source_domain) = validate::email(&req.source).map_err(invalid)?;
        let (destination, _) = validate::email(&req.destination).map_err(invalid)?;
        if source == destination {
            return Err(PanelError::Invalid("an alias cannot point at itself".to_string()));
        }
        self.require_domain(&source_domain).await?;
        if self
            .stores
            .aliases
            .get(&AliasRecord::key_for(&source, &destination))
            .await?
            .is_some()
        {
            return Err(PanelError::Conflict(format!("alias {} -> {} already exists", source, destination)));
        }

        self.m.mail.add_alias(&source, &destination).await.map_err(system)?;

        let record = AliasRecord {
            source,
            destination,
            created_at: Utc::now(),
        };
        self.stores.aliases.upsert(record.clone()).await?;
        info!(source = %record.source, destination = %record.destination, "alias created");
        Ok(record)
    }

    pub async fn delete_alias(&self, source: &str, destination: &str) -> Result<AliasRecord> {
        let (source, _) = validate::email(source).map_err(invalid)?;
        let (destination, _) = validate::email(destination).map_err(invalid)?;
        let key = AliasRecord::key_for(&source, &destination);
        let record = self
            .stores
            .aliases
            .get(&key)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("alias {} -> {}", source, destination)))?;

        self.m.mail.remove_alias(&source, &destination).await.map_err(system)?;
        self.stores.aliases.remove(&key).await?;
        info!(%source, %destination, "alias deleted");
        Ok(record)
    }

    // ==========================================================================
    // 6. Certificates
    // ==========================================================================

    pub async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        Ok(self.stores.certificates.list().await?)
    }

    pub async fn issue_certificate(&self, domain: &str, req: IssueCertificate) -> Result<Provisioned<CertificateRecord>> {
        let name = validate::domain_name(domain).map_err(invalid)?;
        let record = self.require_domain(&name).await?;

        let aliases = if req.include_www { vec![format!("www.{}", name)] } else { Vec::new() };
        let paths = self
            .m
            .ssl
            .issue_certificate(&name, &aliases, &record.document_root)
            .await
            .map_err(system)?;

        self.attach_certificate(record, CertProvider::LetsEncrypt, paths).await
    }

    pub async fn upload_certificate(&self, domain: &str, req: UploadCertificate) -> Result<Provisioned<CertificateRecord>> {
        let name = validate::domain_name(domain).map_err(invalid)?;
        let record = self.require_domain(&name).await?;

        if !req.fullchain_pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(PanelError::Invalid("fullchain_pem is not a PEM certificate".to_string()));
        }
        if !req.privkey_pem.use_str(|k| k.contains("-----BEGIN") && k.contains("PRIVATE KEY-----")) {
            return Err(PanelError::Invalid("privkey_pem is not a PEM private key".to_string()));
        }

        let paths = self
            .m
            .ssl
            .install_certificate(SslPayload {
                domain_name: name,
                fullchain_pem: req.fullchain_pem,
                privkey_pem: req.privkey_pem,
            })
            .await
            .map_err(system)?;

        self.attach_certificate(record, CertProvider::Custom, paths).await
    }

    /// Records the certificate and switches the vhost to HTTPS.
    async fn attach_certificate(
        &self,
        domain: DomainRecord,
        provider: CertProvider,
        paths: TlsPaths,
    ) -> Result<Provisioned<CertificateRecord>> {
        let mut warnings = Vec::new();
        let expires_at = match self.m.ssl.certificate_expiry(&paths.fullchain).await {
            Ok(expiry) => Some(expiry),
            Err(e) => {
                warnings.push(format!("Expiry unknown: {}", e));
                None
            }
        };

        // The certificate exists on disk from here on; record it even if the
        // vhost switch below fails so it can be retried or removed.
        let cert = CertificateRecord {
            domain: domain.name.clone(),
            provider,
            paths: paths.clone(),
            expires_at,
            issued_at: Utc::now(),
        };
        self.stores.certificates.upsert(cert.clone()).await?;

        self.m
            .proxy
            .create_site(&self.site_spec(&domain, Some(paths)))
            .await
            .map_err(system)?;
        self.stores
            .domains
            .update(&domain.name, |d| {
                d.ssl = true;
                d.updated_at = Utc::now();
            })
            .await?;

        info!(domain = %domain.name, ?provider, "certificate attached");
        Ok(Provisioned { record: cert, warnings })
    }

    /// Re-reads expiry dates from disk (certbot renews behind our back).
    pub async fn refresh_certificates(&self) -> Result<Provisioned<Vec<CertificateRecord>>> {
        let mut warnings = Vec::new();
        for cert in self.stores.certificates.list().await? {
            match self.m.ssl.certificate_expiry(&cert.paths.fullchain).await {
                Ok(expiry) => {
                    self.stores
                        .certificates
                        .update(&cert.domain, |c| c.expires_at = Some(expiry))
                        .await?;
                }
                Err(e) => warnings.push(format!("{}: {}", cert.domain, e)),
            }
        }
        Ok(Provisioned {
            record: self.stores.certificates.list().await?,
            warnings,
        })
    }

    pub async fn delete_certificate(&self, domain: &str) -> Result<CertificateRecord> {
        let name = validate::domain_name(domain).map_err(invalid)?;
        let cert = self
            .stores
            .certificates
            .get(&name)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("certificate for {}", name)))?;

        // Back to plain HTTP before the files disappear, or nginx -t fails.
        if let Some(record) = self.stores.domains.get(&name).await? {
            self.m
                .proxy
                .create_site(&self.site_spec(&record, None))
                .await
                .map_err(system)?;
            self.stores
                .domains
                .update(&name, |d| {
                    d.ssl = false;
                    d.updated_at = Utc::now();
                })
                .await?;
        }

        self.m
            .ssl
            .remove_certificate(&name, cert.provider)
            .await
            .map_err(system)?;
        self.stores.certificates.remove(&name).await?;
        info!(domain = %name, "certificate deleted");
        Ok(cert)
    }

    // ==========================================================================
    // 7. DNS
    // ==========================================================================

    pub async fn list_dns_records(&self, zone: &str) -> Result<Vec<ProviderRecord>> {
        let zone = validate::domain_name(zone).map_err(invalid)?;
        self.dns()?.list_records(&zone).await.map_err(system)
    }

    pub async fn create_dns_record(&self, zone: &str, spec: DnsRecordSpec) -> Result<DnsRecordEntry> {
        let dns = self.dns()?;
        let zone = validate::domain_name(zone).map_err(invalid)?;
        let spec = validate::dns_record(&spec, &zone).map_err(invalid)?;

        let id = dns.upsert_record(&zone, &spec).await.map_err(system)?;
        let entry = DnsRecordEntry {
            id,
            zone,
            spec,
            created_at: Utc::now(),
        };
        self.stores.dns_records.upsert(entry.clone()).await?;
        info!(zone = %entry.zone, name = %entry.spec.name, id = %entry.id, "dns record created");
        Ok(entry)
    }

    pub async fn delete_dns_record(&self, zone: &str, id: &str) -> Result<()> {
        let dns = self.dns()?;
        let zone = validate::domain_name(zone).map_err(invalid)?;
        dns.delete_record(&zone, id).await.map_err(system)?;
        self.stores.dns_records.remove(id).await?;

        // A domain's own address record may be the one deleted.
        for domain in self.stores.domains.list().await? {
            if domain.dns_record_id.as_deref() == Some(id) {
                self.stores
                    .domains
                    .update(&domain.name, |d| {
                        d.dns_zone = None;
                        d.dns_record_id = None;
                    })
                    .await?;
            }
        }
        info!(%zone, id, "dns record deleted");
        Ok(())
    }

    // ==========================================================================
    // 8. Backups
    // ==========================================================================

    pub async fn list_backups(&self, domain: Option<&str>) -> Result<Vec<BackupRecord>> {
        let all = self.stores.backups.list().await?;
        Ok(match domain {
            Some(d) => all.into_iter().filter(|b| b.domain.eq_ignore_ascii_case(d)).collect(),
            None => all,
        })
    }

    pub async fn create_backup(&self, domain: &str) -> Result<Provisioned<BackupRecord>> {
        let name = validate::domain_name(domain).map_err(invalid)?;
        self.require_domain(&name).await?;

        let databases: Vec<String> = self
            .stores
            .databases
            .list()
            .await?
            .into_iter()
            .filter(|d| d.domain.as_deref() == Some(name.as_str()))
            .map(|d| d.name)
            .collect();
        let site_root = self.site_dir(&name);

        let archive = self
            .m
            .backups
            .create_backup(&BackupRequest {
                domain: &name,
                site_root: &site_root,
                databases: &databases,
            })
            .await
            .map_err(system)?;

        let id = archive_id(&archive.path)
            .ok_or_else(|| PanelError::System(format!("unexpected archive name {}", archive.path.display())))?;
        let record = BackupRecord {
            id,
            domain: name.clone(),
            path: archive.path,
            size_bytes: archive.size_bytes,
            created_at: archive.created_at,
        };
        self.stores.backups.upsert(record.clone()).await?;
        info!(domain = %name, id = %record.id, "backup recorded");

        let mut warnings = Vec::new();
        match self
            .m
            .retention
            .prune_old_backups(&self.config.backup_dir.join(&name), self.config.backup_keep)
            .await
        {
            Ok(0) => {}
            Ok(_) => self.forget_missing_backups(&name).await?,
            Err(e) => warnings.push(format!("Retention prune failed: {}", e)),
        }

        Ok(Provisioned { record, warnings })
    }

    async fn forget_missing_backups(&self, domain: &str) -> Result<()> {
        let mut missing = HashSet::new();
        for backup in self.list_backups(Some(domain)).await? {
            if !fs::try_exists(&backup.path).await.unwrap_or(false) {
                missing.insert(backup.id);
            }
        }
        if !missing.is_empty() {
            self.stores.backups.retain(|b| !missing.contains(&b.id)).await?;
        }
        Ok(())
    }

    pub async fn restore_backup(&self, id: &str) -> Result<BackupRecord> {
        let backup = self
            .stores
            .backups
            .get(id)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("backup {}", id)))?;
        self.require_domain(&backup.domain).await?;

        self.m
            .backups
            .restore_backup(&backup.path, &self.site_dir(&backup.domain))
            .await
            .map_err(system)?;
        info!(id, domain = %backup.domain, "backup restored");
        Ok(backup)
    }

    pub async fn delete_backup(&self, id: &str) -> Result<BackupRecord> {
        let backup = self
            .stores
            .backups
            .get(id)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("backup {}", id)))?;

        self.m.backups.delete_backup(&backup.path).await.map_err(system)?;
        self.stores.backups.remove(id).await?;
        info!(id, "backup deleted");
        Ok(backup)
    }

    fn backup_job(&self, domain: &str, on_calendar: &str) -> JobIntent {
        let body = serde_json::json!({ "domain": domain }).to_string();
        JobIntent {
            name: format!("backup-{}", domain),
            binary: "/usr/bin/curl".to_string(),
            args: vec![
                "--silent".to_string(),
                "--show-error".to_string(),
                "--fail".to_string(),
                "--unix-socket".to_string(),
                self.config.socket_path.display().to_string(),
                "-X".to_string(),
                "POST".to_string(),
                "-H".to_string(),
                "Content-Type: application/json".to_string(),
                "-d".to_string(),
                body,
                "http://localhost/backups".to_string(),
            ],
            schedule: on_calendar.trim().to_string(),
            run_as_user: "root".to_string(),
        }
    }

    pub async fn schedule_backups(&self, domain: &str, req: ScheduleBackups) -> Result<ScheduleRecord> {
        let name = validate::domain_name(domain).map_err(invalid)?;
        validate::on_calendar(&req.on_calendar).map_err(invalid)?;
        self.require_domain(&name).await?;

        self.m
            .scheduler
            .schedule_job(&self.backup_job(&name, &req.on_calendar))
            .await
            .map_err(system)?;

        let record = ScheduleRecord {
            domain: name,
            on_calendar: req.on_calendar.trim().to_string(),
            created_at: Utc::now(),
        };
        self.stores.schedules.upsert(record.clone()).await?;
        info!(domain = %record.domain, on_calendar = %record.on_calendar, "backups scheduled");
        Ok(record)
    }

    pub async fn unschedule_backups(&self, domain: &str) -> Result<ScheduleRecord> {
        let name = validate::domain_name(domain).map_err(invalid)?;
        let schedule = self
            .stores
            .schedules
            .get(&name)
            .await?
            .ok_or_else(|| PanelError::NotFound(format!("backup schedule for {}", name)))?;

        self.m
            .scheduler
            .unschedule_job(&format!("backup-{}", name))
            .await
            .map_err(system)?;
        self.stores.schedules.remove(&name).await?;
        info!(domain = %name, "backups unscheduled");
        Ok(schedule)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        Ok(self.stores.schedules.list().await?)
    }

    // ==========================================================================
    // 9. Dashboard
    // ==========================================================================

    pub async fn dashboard(&self) -> Result<Dashboard> {
        let host = self.m.stats.collect().await.map_err(system)?;

        let mut services = Vec::with_capacity(self.config.managed_units.len());
        for unit in &self.config.managed_units {
            services.push(ServiceStatus {
                unit: unit.clone(),
                active: self.m.services.is_active(unit).await,
            });
        }

        let now = Utc::now();
        let certificates = self.stores.certificates.list().await?;
        let resources = ResourceCounts {
            domains: self.stores.domains.list().await?.len(),
            databases: self.stores.databases.list().await?.len(),
            mailboxes: self.stores.mailboxes.list().await?.len(),
            certificates_expiring: certificates
                .iter()
                .filter(|c| c.days_remaining(now).is_some_and(|d| d < 14))
                .count(),
            certificates: certificates.len(),
            backups: self.stores.backups.list().await?.len(),
        };

        Ok(Dashboard {
            host,
            services,
            resources,
        })
    }

    pub async fn service_control(&self, unit: &str, action: ServiceAction) -> Result<()> {
        if !self.config.managed_units.iter().any(|u| u == unit) {
            return Err(PanelError::Invalid(format!("{} is not a managed service", unit)));
        }
        self.m.services.control(action, unit).await.map_err(system)?;
        info!(unit, %action, "service control");
        Ok(())
    }
}
