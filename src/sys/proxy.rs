use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::sys::command;
use crate::sys::traits::{ProxyManager, SiteSpec};
use crate::sys::validate;

/// Restores the previous vhost (or removes the new one) after a failed
/// syntax check, so a bad render never survives a reload.
async fn rollback(config_path: &Path, enabled_link: &Path, previous: Option<String>, link_existed: bool) {
    match previous {
        Some(content) => {
            if let Err(e) = fs::write(config_path, content).await {
                warn!(path = %config_path.display(), "vhost rollback failed: {}", e);
            }
        }
        None => {
            let _ = fs::remove_file(config_path).await;
        }
    }
    if !link_existed {
        let _ = fs::remove_file(enabled_link).await;
    }
}

/// Shared write → link → test → reload sequence for both servers.
async fn apply_site(
    config_path: PathBuf,
    enabled_link: PathBuf,
    content: String,
    test_and_reload: impl std::future::Future<Output = Result<(), String>>,
) -> Result<(), String> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
    }
    if let Some(parent) = enabled_link.parent() {
        fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
    }

    let previous = fs::read_to_string(&config_path).await.ok();
    let link_existed = fs::symlink_metadata(&enabled_link).await.is_ok();

    fs::write(&config_path, content).await.map_err(|e| e.to_string())?;
    if !link_existed {
        fs::symlink(&config_path, &enabled_link).await.map_err(|e| e.to_string())?;
    }

    if let Err(e) = test_and_reload.await {
        rollback(&config_path, &enabled_link, previous, link_existed).await;
        return Err(e);
    }
    Ok(())
}

fn server_names(site: &SiteSpec) -> String {
    std::iter::once(site.domain.as_str())
        .chain(site.aliases.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

// ==============================================================================
// 1. Apache Implementation
// ==============================================================================
pub struct ApacheManager {
    base_path: PathBuf,
}

impl ApacheManager {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        (
            self.base_path.join("sites-available").join(format!("{}.conf", domain)),
            self.base_path.join("sites-enabled").join(format!("{}.conf", domain)),
        )
    }

    async fn test_and_reload() -> Result<(), String> {
        command::run(Command::new("apache2ctl").arg("configtest"), "apache2ctl configtest").await?;
        command::run(Command::new("systemctl").args(["reload", "apache2"]), "systemctl reload apache2").await?;
        Ok(())
    }
}

pub fn render_apache(site: &SiteSpec) -> String {
    let root = site.document_root.display();
    let aliases = if site.aliases.is_empty() {
        String::new()
    } else {
        format!("\n    ServerAlias {}", site.aliases.join(" "))
    };

    let mut body = format!(
        r#"    DocumentRoot {root}
    ErrorLog ${{APACHE_LOG_DIR}}/{domain}.error.log
    CustomLog ${{APACHE_LOG_DIR}}/{domain}.access.log combined
    Header always set X-Content-Type-Options "nosniff"
    <Directory {root}>
        Options -Indexes +FollowSymLinks
        AllowOverride All
        Require all granted
    </Directory>"#,
        root = root,
        domain = site.domain
    );

    if let Some(port) = site.upstream_port {
        body.push_str(&format!(
            r#"
    ProxyPreserveHost On
    ProxyPass /.well-known/acme-challenge/ !
    ProxyPass / http://127.0.0.1:{port}/
    ProxyPassReverse / http://127.0.0.1:{port}/"#,
            port = port
        ));
    } else if let Some(sock) = &site.php_fpm_socket {
        body.push_str(&format!(
            r#"
    <FilesMatch \.php$>
        SetHandler "proxy:unix:{sock}|fcgi://localhost"
    </FilesMatch>"#,
            sock = sock
        ));
    }

    match &site.tls {
        None => format!(
            "<VirtualHost *:80>\n    ServerName {domain}{aliases}\n{body}\n</VirtualHost>\n",
            domain = site.domain,
            aliases = aliases,
            body = body
        ),
        Some(tls) => format!(
            r#"<VirtualHost *:80>
    ServerName {domain}{aliases}
    DocumentRoot {root}
    RewriteEngine On
    RewriteCond %{{REQUEST_URI}} !^/\.well-known/acme-challenge/
    RewriteRule ^ https://%{{HTTP_HOST}}%{{REQUEST_URI}} [L,R=301]
</VirtualHost>

<VirtualHost *:443>
    ServerName {domain}{aliases}
    SSLEngine on
    SSLCertificateFile {fullchain}
    SSLCertificateKeyFile {privkey}
{body}
</VirtualHost>
"#,
            domain = site.domain,
            aliases = aliases,
            root = root,
            fullchain = tls.fullchain.display(),
            privkey = tls.privkey.display(),
            body = body
        ),
    }
}

#[async_trait]
impl ProxyManager for ApacheManager {
    async fn create_site(&self, site: &SiteSpec) -> Result<(), String> {
        validate::domain_name(&site.domain)?;
        let (config_path, enabled_link) = self.paths(&site.domain);

        apply_site(config_path, enabled_link, render_apache(site), Self::test_and_reload()).await?;
        info!(domain = %site.domain, tls = site.tls.is_some(), "apache vhost applied");
        Ok(())
    }

    async fn remove_site(&self, domain: &str) -> Result<(), String> {
        validate::domain_name(domain)?;
        let (config_path, enabled_link) = self.paths(domain);
        let _ = fs::remove_file(enabled_link).await;
        let _ = fs::remove_file(config_path).await;
        Self::test_and_reload().await
    }

    async fn site_exists(&self, domain: &str) -> bool {
        let (config_path, enabled_link) = self.paths(domain);
        fs::metadata(config_path).await.is_ok() && fs::symlink_metadata(enabled_link).await.is_ok()
    }
}

// ==============================================================================
// 2. Nginx Implementation
// ==============================================================================
pub struct NginxManager {
    base_path: PathBuf,
}

impl NginxManager {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        (
            self.base_path.join("sites-available").join(domain),
            self.base_path.join("sites-enabled").join(domain),
        )
    }

    async fn test_and_reload() -> Result<(), String> {
        command::run(Command::new("nginx").arg("-t"), "nginx -t").await?;
        command::run(Command::new("systemctl").args(["reload", "nginx"]), "systemctl reload nginx").await?;
        Ok(())
    }
}

fn nginx_locations(site: &SiteSpec) -> String {
    let mut out = format!(
        r#"    root {root};
    index index.html index.htm index.php;

    access_log /var/log/nginx/{domain}.access.log;
    error_log /var/log/nginx/{domain}.error.log;

    add_header X-Content-Type-Options "nosniff" always;

    location ^~ /.well-known/acme-challenge/ {{
        root {root};
        allow all;
    }}
"#,
        root = site.document_root.display(),
        domain = site.domain
    );

    if let Some(port) = site.upstream_port {
        out.push_str(&format!(
            r#"
    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
"#,
            port = port
        ));
    } else {
        let fallback = if site.php_fpm_socket.is_some() {
            "/index.php?$query_string"
        } else {
            "=404"
        };
        out.push_str(&format!(
            r#"
    location / {{
        try_files $uri $uri/ {fallback};
    }}
"#,
            fallback = fallback
        ));
        if let Some(sock) = &site.php_fpm_socket {
            out.push_str(&format!(
                r#"
    location ~ \.php$ {{
        include snippets/fastcgi-php.conf;
        fastcgi_pass unix:{sock};
    }}
"#,
                sock = sock
            ));
        }
    }

    out.push_str(
        r#"
    location ~ /\.(?!well-known) {
        deny all;
    }
"#,
    );
    out
}

pub fn render_nginx(site: &SiteSpec) -> String {
    let names = server_names(site);
    let locations = nginx_locations(site);

    match &site.tls {
        None => format!(
            "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {names};\n\n{locations}}}\n",
            names = names,
            locations = locations
        ),
        Some(tls) => format!(
            r#"server {{
    listen 80;
    listen [::]:80;
    server_name {names};

    location ^~ /.well-known/acme-challenge/ {{
        root {root};
        allow all;
    }}

    location / {{
        return 301 https://$host$request_uri;
    }}
}}

server {{
    listen 443 ssl;
    listen [::]:443 ssl;
    http2 on;
    server_name {names};

    ssl_certificate {fullchain};
    ssl_certificate_key {privkey};
    ssl_protocols TLSv1.2 TLSv1.3;

{locations}}}
"#,
            names = names,
            root = site.document_root.display(),
            fullchain = tls.fullchain.display(),
            privkey = tls.privkey.display(),
            locations = locations
        ),
    }
}

#[async_trait]
impl ProxyManager for NginxManager {
    async fn create_site(&self, site: &SiteSpec) -> Result<(), String> {
        validate::domain_name(&site.domain)?;
        let (config_path, enabled_link) = self.paths(&site.domain);

        apply_site(config_path, enabled_link, render_nginx(site), Self::test_and_reload()).await?;
        info!(domain = %site.domain, tls = site.tls.is_some(), "nginx vhost applied");
        Ok(())
    }

    async fn remove_site(&self, domain: &str) -> Result<(), String> {
        validate::domain_name(domain)?;
        let (config_path, enabled_link) = self.paths(domain);
        let _ = fs::remove_file(enabled_link).await;
        let _ = fs::remove_file(config_path).await;
        Self::test_and_reload().await
    }

    async fn site_exists(&self, domain: &str) -> bool {
        let (config_path, enabled_link) = self.paths(domain);
        fs::metadata(config_path).await.is_ok() && fs::symlink_metadata(enabled_link).await.is_ok()
    }
}
