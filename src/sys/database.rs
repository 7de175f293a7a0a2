// MySQL / MariaDB administration through the stock client binaries.
//
// Admin credentials travel in a transient --defaults-extra-file (0600) and
// SQL travels over stdin, so neither shows up in the process table.

use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::info;
use zeroize::Zeroizing;

use crate::sys::command;
use crate::sys::secrets::Credential;
use crate::sys::traits::DatabaseEngine;
use crate::sys::validate;

/// MySQL account names are capped at 32 characters.
pub const MAX_USER_LEN: usize = 32;

/// Quotes a string literal for MySQL: backslashes and single quotes escaped.
pub fn sql_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Option-file value quoting (double quotes, backslash escapes).
fn option_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn create_statements(name: &str, user: &str, password: &str) -> Zeroizing<String> {
    Zeroizing::new(format!(
        "CREATE DATABASE IF NOT EXISTS `{name}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;\n\
         CREATE USER IF NOT EXISTS '{user}'@'localhost' IDENTIFIED BY {pw};\n\
         GRANT ALL PRIVILEGES ON `{name}`.* TO '{user}'@'localhost';\n\
         FLUSH PRIVILEGES;\n",
        name = name,
        user = user,
        pw = sql_quote(password)
    ))
}

pub fn drop_statements(name: &str, user: &str) -> String {
    format!(
        "DROP DATABASE IF EXISTS `{name}`;\nDROP USER IF EXISTS '{user}'@'localhost';\nFLUSH PRIVILEGES;\n",
        name = name,
        user = user
    )
}

pub fn password_statements(user: &str, password: &str) -> Zeroizing<String> {
    Zeroizing::new(format!(
        "ALTER USER '{user}'@'localhost' IDENTIFIED BY {pw};\nFLUSH PRIVILEGES;\n",
        user = user,
        pw = sql_quote(password)
    ))
}

pub struct MysqlEngine {
    host: String,
    admin_user: String,
    admin_password: Credential,
}

impl MysqlEngine {
    pub fn new(host: String, admin_user: String, admin_password: Credential) -> Self {
        Self {
            host,
            admin_user,
            admin_password,
        }
    }

    /// The file is deleted when the returned handle drops.
    fn defaults_file(&self) -> Result<NamedTempFile, String> {
        let mut file = NamedTempFile::new().map_err(|e| format!("Failed to create credentials file: {}", e))?;
        let body = self.admin_password.use_str(|pw| {
            Zeroizing::new(format!(
                "[client]\nuser={}\npassword={}\nhost={}\n",
                option_quote(&self.admin_user),
                option_quote(pw),
                option_quote(&self.host)
            ))
        });
        file.write_all(body.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| format!("Failed to write credentials file: {}", e))?;
        Ok(file)
    }

    fn client(&self, binary: &str, defaults: &NamedTempFile) -> Command {
        let mut cmd = Command::new(binary);
        // Must be the first option or the client ignores it.
        cmd.arg(format!("--defaults-extra-file={}", defaults.path().display()));
        cmd
    }

    async fn run_sql(&self, sql: &str, label: &str) -> Result<(), String> {
        let defaults = self.defaults_file()?;
        command::run_with_input(self.client("mysql", &defaults).arg("--batch"), sql.as_bytes(), label)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl DatabaseEngine for MysqlEngine {
    async fn create_database(&self, name: &str, user: &str, password: &Credential) -> Result<(), String> {
        validate::db_identifier(name, 64)?;
        validate::db_identifier(user, MAX_USER_LEN)?;

        let sql = password.use_str(|pw| create_statements(name, user, pw));
        self.run_sql(&sql, "mysql create database").await?;
        info!(database = name, user, "database provisioned");
        Ok(())
    }

    async fn drop_database(&self, name: &str, user: &str) -> Result<(), String> {
        validate::db_identifier(name, 64)?;
        validate::db_identifier(user, MAX_USER_LEN)?;

        self.run_sql(&drop_statements(name, user), "mysql drop database").await?;
        info!(database = name, user, "database dropped");
        Ok(())
    }

    async fn set_password(&self, user: &str, password: &Credential) -> Result<(), String> {
        validate::db_identifier(user, MAX_USER_LEN)?;

        let sql = password.use_str(|pw| password_statements(user, pw));
        self.run_sql(&sql, "mysql alter user").await?;
        info!(user, "database password rotated");
        Ok(())
    }

    async fn dump_database(&self, name: &str, dest: &Path) -> Result<(), String> {
        validate::db_identifier(name, 64)?;

        let defaults = self.defaults_file()?;
        command::run(
            self.client("mysqldump", &defaults)
                .args(["--single-transaction", "--routines", "--triggers"])
                .arg(format!("--result-file={}", dest.display()))
                .arg(name),
            "mysqldump",
        )
        .await?;
        Ok(())
    }

    async fn import_database(&self, name: &str, src: &Path) -> Result<(), String> {
        validate::db_identifier(name, 64)?;

        let dump = std::fs::File::open(src).map_err(|e| format!("Failed to open dump {}: {}", src.display(), e))?;
        let defaults = self.defaults_file()?;
        command::run(
            self.client("mysql", &defaults).arg(name).stdin(Stdio::from(dump)),
            "mysql import",
        )
        .await?;
        info!(database = name, "database restored from dump");
        Ok(())
    }
}
