// Persisted resource records, one JSON file per type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::store::Record;
use crate::sys::traits::{CertProvider, DnsRecordSpec, TlsPaths};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub name: String,
    pub document_root: PathBuf,
    #[serde(default)]
    pub upstream_port: Option<u16>,
    #[serde(default)]
    pub php: bool,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub dns_zone: Option<String>,
    #[serde(default)]
    pub dns_record_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for DomainRecord {
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record for DatabaseRecord {
    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxRecord {
    pub email: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

impl Record for MailboxRecord {
    fn key(&self) -> String {
        self.email.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub source: String,
    pub destination: String,
    pub created_at: DateTime<Utc>,
}

impl AliasRecord {
    pub fn key_for(source: &str, destination: &str) -> String {
        format!("{}->{}", source, destination)
    }

    pub fn source_domain(&self) -> &str {
        self.source.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl Record for AliasRecord {
    fn key(&self) -> String {
        Self::key_for(&self.source, &self.destination)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub domain: String,
    pub provider: CertProvider,
    #[serde(flatten)]
    pub paths: TlsPaths,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
}

impl CertificateRecord {
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|exp| (exp - now).num_days())
    }
}

impl Record for CertificateRecord {
    fn key(&self) -> String {
        self.domain.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecordEntry {
    pub id: String,
    pub zone: String,
    #[serde(flatten)]
    pub spec: DnsRecordSpec,
    pub created_at: DateTime<Utc>,
}

impl Record for DnsRecordEntry {
    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub domain: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Record for BackupRecord {
    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub domain: String,
    pub on_calendar: String,
    pub created_at: DateTime<Utc>,
}

impl Record for ScheduleRecord {
    fn key(&self) -> String {
        self.domain.clone()
    }
}
