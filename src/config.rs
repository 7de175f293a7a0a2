// src/config.rs

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::sys::secrets::Credential;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    Nginx,
    Apache,
}

impl ProxyKind {
    pub fn unit(&self) -> &'static str {
        match self {
            ProxyKind::Nginx => "nginx",
            ProxyKind::Apache => "apache2",
        }
    }
}

impl FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nginx" => Ok(ProxyKind::Nginx),
            "apache" | "apache2" => Ok(ProxyKind::Apache),
            other => Err(format!("SJ_PROXY must be 'nginx' or 'apache', got '{}'", other)),
        }
    }
}

#[derive(Clone)]
pub struct PanelConfig {
    // Network & identity
    pub socket_path: PathBuf,
    pub socket_gid: Option<u32>,

    // State
    pub data_dir: PathBuf,

    // Web serving
    pub web_root: PathBuf,
    pub web_user: String,
    pub proxy: ProxyKind,
    pub proxy_dir: PathBuf,
    pub php_fpm_socket: Option<String>,

    // Certificates
    pub ssl_storage_dir: PathBuf,
    pub letsencrypt_dir: PathBuf,
    pub acme_email: Option<String>,

    // Collaborators
    pub mysql_host: String,
    pub mysql_user: String,
    pub mysql_password: Credential,
    pub mail_container: String,
    pub cloudflare_token: Option<Credential>,
    pub server_ip: Option<String>,

    // Backups & scheduling
    pub backup_dir: PathBuf,
    pub backup_keep: usize,
    pub systemd_dir: PathBuf,

    pub managed_units: Vec<String>,
}

impl fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelConfig")
            .field("socket_path", &self.socket_path)
            .field("data_dir", &self.data_dir)
            .field("web_root", &self.web_root)
            .field("proxy", &self.proxy)
            .field("mysql_host", &self.mysql_host)
            .field("mail_container", &self.mail_container)
            .field("dns_enabled", &self.cloudflare_token.is_some())
            .field("backup_dir", &self.backup_dir)
            .field("backup_keep", &self.backup_keep)
            .finish_non_exhaustive()
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn var_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn var_parse<T: FromStr>(key: &str) -> Result<Option<T>, String> {
    match var_opt(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("FATAL: {} must be numeric, got '{}'", key, raw)),
    }
}

/// Retention must keep at least the archive just written.
fn backup_keep(raw: Option<usize>) -> Result<usize, String> {
    match raw {
        Some(0) => Err("FATAL: SJ_BACKUP_KEEP must be at least 1".to_string()),
        Some(n) => Ok(n),
        None => Ok(7),
    }
}

impl PanelConfig {
    /// Reads `SJ_*` environment variables. Malformed numbers refuse startup.
    pub fn load() -> Result<Self, String> {
        let proxy: ProxyKind = var_or("SJ_PROXY", "nginx").parse()?;
        let default_proxy_dir = match proxy {
            ProxyKind::Nginx => "/etc/nginx",
            ProxyKind::Apache => "/etc/apache2",
        };

        let managed_units = var_opt("SJ_MANAGED_UNITS")
            .map(|raw| {
                raw.split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec![proxy.unit().to_string(), "mysql".to_string(), "docker".to_string()]);

        Ok(Self {
            socket_path: PathBuf::from(var_or("SJ_SOCKET_PATH", "/var/run/sj-panel/panel.sock")),
            socket_gid: var_parse("SJ_SOCKET_GID")?,

            data_dir: PathBuf::from(var_or("SJ_DATA_DIR", "/data")),

            web_root: PathBuf::from(var_or("SJ_WEB_ROOT", "/var/www")),
            web_user: var_or("SJ_WEB_USER", "www-data"),
            proxy,
            proxy_dir: PathBuf::from(var_or("SJ_PROXY_DIR", default_proxy_dir)),
            php_fpm_socket: var_opt("SJ_PHP_FPM_SOCKET"),

            ssl_storage_dir: PathBuf::from(var_or("SJ_SSL_DIR", "/etc/sj-panel/ssl")),
            letsencrypt_dir: PathBuf::from(var_or("SJ_LETSENCRYPT_DIR", "/etc/letsencrypt/live")),
            acme_email: var_opt("SJ_ACME_EMAIL"),

            mysql_host: var_or("SJ_MYSQL_HOST", "localhost"),
            mysql_user: var_or("SJ_MYSQL_USER", "root"),
            mysql_password: Credential::from(var_or("SJ_MYSQL_PASSWORD", "")),
            mail_container: var_or("SJ_MAIL_CONTAINER", "mailserver"),
            cloudflare_token: var_opt("SJ_CLOUDFLARE_TOKEN").map(Credential::from),
            server_ip: var_opt("SJ_SERVER_IP"),

            backup_dir: PathBuf::from(var_or("SJ_BACKUP_DIR", "/var/backups/sj-panel")),
            backup_keep: backup_keep(var_parse("SJ_BACKUP_KEEP")?)?,
            systemd_dir: PathBuf::from(var_or("SJ_SYSTEMD_DIR", "/etc/systemd/system")),

            managed_units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_kind_parses_aliases() {
        assert_eq!("nginx".parse::<ProxyKind>().unwrap(), ProxyKind::Nginx);
        assert_eq!("Apache2".parse::<ProxyKind>().unwrap(), ProxyKind::Apache);
        assert!("caddy".parse::<ProxyKind>().is_err());
        assert_eq!(ProxyKind::Apache.unit(), "apache2");
    }

    #[test]
    fn debug_output_hides_credentials() {
        let mut config = crate::testing::config(std::path::Path::new("/tmp/sj"));
        config.mysql_password = Credential::from("root-secret".to_string());
        config.cloudflare_token = Some(Credential::from("cf-secret".to_string()));
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("root-secret"));
        assert!(!rendered.contains("cf-secret"));
        assert!(rendered.contains("dns_enabled: true"));
    }

    #[test]
    fn backup_retention_keeps_at_least_one() {
        assert_eq!(backup_keep(None).unwrap(), 7);
        assert_eq!(backup_keep(Some(1)).unwrap(), 1);
        assert!(backup_keep(Some(0)).unwrap_err().contains("at least 1"));
    }
}
