//! Cloudflare DNS provider.
//!
//! A thin client over the v4 REST API: zone lookup, record listing, and
//! create-or-update/delete of individual records. Authentication is a scoped
//! API token sent as a bearer header.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sys::secrets::Credential;
use crate::sys::traits::{DnsProvider, DnsRecordSpec, ProviderRecord, RecordType};
use crate::sys::validate;

const BASE_URL: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, Deserialize)]
struct CfMessage {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CfEnvelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CfMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CfZone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CfRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
    #[serde(default)]
    ttl: u32,
    #[serde(default)]
    priority: Option<u16>,
    #[serde(default)]
    proxied: Option<bool>,
}

#[derive(Debug, Serialize, PartialEq)]
struct CfRecordBody<'a> {
    #[serde(rename = "type")]
    record_type: String,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u16>,
    proxied: bool,
}

impl<'a> From<&'a DnsRecordSpec> for CfRecordBody<'a> {
    fn from(spec: &'a DnsRecordSpec) -> Self {
        Self {
            record_type: spec.record_type.to_string(),
            name: &spec.name,
            content: &spec.content,
            ttl: spec.ttl,
            priority: if spec.record_type == RecordType::Mx { spec.priority } else { None },
            proxied: spec.proxied,
        }
    }
}

impl CfRecord {
    /// Record types the panel does not manage (SRV, CAA, ...) are skipped.
    fn into_provider_record(self) -> Option<ProviderRecord> {
        let record_type = self.record_type.parse::<RecordType>().ok()?;
        Some(ProviderRecord {
            id: self.id,
            spec: DnsRecordSpec {
                record_type,
                name: self.name,
                content: self.content,
                ttl: self.ttl,
                priority: self.priority,
                proxied: self.proxied.unwrap_or(false),
            },
        })
    }
}

/// Unwraps the Cloudflare envelope, surfacing `errors[].message` on failure.
fn unwrap_envelope<T>(status: u16, body: &str) -> Result<T, String>
where
    T: DeserializeOwned,
{
    let envelope: CfEnvelope<T> = serde_json::from_str(body)
        .map_err(|e| format!("Cloudflare returned HTTP {} with an unreadable body: {}", status, e))?;

    if !envelope.success {
        let messages = envelope
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(format!("Cloudflare API error (HTTP {}): {}", status, messages));
    }
    envelope
        .result
        .ok_or_else(|| format!("Cloudflare returned HTTP {} without a result", status))
}

/// Cloudflare answers HTTP 404 or error 81044 for a record id it no longer has.
fn record_missing(status: u16, body: &str) -> bool {
    if status == 404 {
        return true;
    }
    serde_json::from_str::<CfEnvelope<serde_json::Value>>(body)
        .map(|envelope| envelope.errors.iter().any(|e| e.code == 81044))
        .unwrap_or(false)
}

/// Candidate zones for a host name, most specific first, never a bare TLD.
fn zone_candidates(name: &str) -> Vec<String> {
    let labels: Vec<&str> = name.split('.').collect();
    (0..labels.len().saturating_sub(1))
        .map(|i| labels[i..].join("."))
        .collect()
}

pub struct CloudflareDns {
    client: reqwest::Client,
    token: Credential,
    base_url: String,
}

impl CloudflareDns {
    pub fn new(token: Credential) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Points the client at a local endpoint, bypassing any proxy settings.
    #[cfg(test)]
    pub fn with_base_url(token: Credential, base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            token,
            base_url,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.token
            .use_str(|token| self.client.request(method, url).bearer_auth(token))
    }

    async fn fetch(&self, builder: RequestBuilder) -> Result<(u16, String), String> {
        let resp = builder
            .send()
            .await
            .map_err(|e| format!("Cloudflare request failed: {}", e))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Cloudflare response read failed: {}", e))?;
        Ok((status, body))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, String> {
        let (status, body) = self.fetch(builder).await?;
        unwrap_envelope(status, &body)
    }

    async fn zone_id(&self, zone: &str) -> Result<String, String> {
        let zones: Vec<CfZone> = self
            .send(self.request(Method::GET, "/zones").query(&[("name", zone)]))
            .await?;
        zones
            .into_iter()
            .find(|z| z.name.eq_ignore_ascii_case(zone))
            .map(|z| z.id)
            .ok_or_else(|| format!("Zone '{}' is not hosted on this Cloudflare account", zone))
    }

    async fn raw_records(&self, zone_id: &str) -> Result<Vec<CfRecord>, String> {
        self.send(
            self.request(Method::GET, &format!("/zones/{}/dns_records", zone_id))
                .query(&[("per_page", "500")]),
        )
        .await
    }

    /// The record of the same type and name, looked up server-side so large
    /// zones are not truncated by paging.
    async fn matching_record(&self, zone_id: &str, record: &DnsRecordSpec) -> Result<Option<CfRecord>, String> {
        let type_str = record.record_type.to_string();
        let found: Vec<CfRecord> = self
            .send(
                self.request(Method::GET, &format!("/zones/{}/dns_records", zone_id))
                    .query(&[("type", type_str.as_str()), ("name", record.name.as_str())]),
            )
            .await?;
        Ok(found
            .into_iter()
            .find(|r| r.record_type == type_str && r.name.eq_ignore_ascii_case(&record.name)))
    }
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    async fn find_zone(&self, name: &str) -> Result<String, String> {
        let name = validate::domain_name(name)?;
        for candidate in zone_candidates(&name) {
            let zones: Vec<CfZone> = self
                .send(self.request(Method::GET, "/zones").query(&[("name", candidate.as_str())]))
                .await?;
            if zones.iter().any(|z| z.name.eq_ignore_ascii_case(&candidate)) {
                debug!(%name, zone = %candidate, "resolved hosted zone");
                return Ok(candidate);
            }
        }
        Err(format!("No Cloudflare zone found for '{}'", name))
    }

    async fn list_records(&self, zone: &str) -> Result<Vec<ProviderRecord>, String> {
        let zone_id = self.zone_id(zone).await?;
        Ok(self
            .raw_records(&zone_id)
            .await?
            .into_iter()
            .filter_map(CfRecord::into_provider_record)
            .collect())
    }

    async fn upsert_record(&self, zone: &str, record: &DnsRecordSpec) -> Result<String, String> {
        let zone_id = self.zone_id(zone).await?;
        let existing = self.matching_record(&zone_id, record).await?;

        let body = CfRecordBody::from(record);
        let saved: CfRecord = match existing {
            Some(current) => {
                self.send(
                    self.request(Method::PUT, &format!("/zones/{}/dns_records/{}", zone_id, current.id))
                        .json(&body),
                )
                .await?
            }
            None => {
                self.send(
                    self.request(Method::POST, &format!("/zones/{}/dns_records", zone_id))
                        .json(&body),
                )
                .await?
            }
        };

        info!(zone, name = %record.name, record_type = %record.record_type, id = %saved.id, "dns record saved");
        Ok(saved.id)
    }

    async fn delete_record(&self, zone: &str, record_id: &str) -> Result<(), String> {
        if record_id.is_empty() || !record_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("Invalid record id '{}'", record_id));
        }
        let zone_id = self.zone_id(zone).await?;

        #[derive(Deserialize)]
        struct Deleted {
            #[allow(dead_code)]
            id: String,
        }
        let (status, body) = self
            .fetch(self.request(Method::DELETE, &format!("/zones/{}/dns_records/{}", zone_id, record_id)))
            .await?;
        if record_missing(status, &body) {
            info!(zone, id = record_id, "dns record already absent");
            return Ok(());
        }
        let _: Deleted = unwrap_envelope(status, &body)?;

        info!(zone, id = record_id, "dns record deleted");
        Ok(())
    }
}
