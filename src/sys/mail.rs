// docker-mailserver administration via `docker exec <container> setup ...`.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;
use zeroize::Zeroizing;

use crate::sys::command;
use crate::sys::secrets::Credential;
use crate::sys::traits::MailServer;
use crate::sys::validate;

pub struct DockerMailServer {
    container: String,
}

impl DockerMailServer {
    pub fn new(container: String) -> Self {
        Self { container }
    }

    fn setup(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("exec").arg(&self.container).arg("setup");
        cmd
    }

    /// `docker exec -i`: the setup script prompts for the password on stdin
    /// when it is omitted from the command line.
    fn interactive_setup(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("exec").arg("-i").arg(&self.container).arg("setup");
        cmd
    }

    async fn with_password(&self, args: [&str; 3], password: &Credential, label: &str) -> Result<(), String> {
        let line = password.use_secret(|pw| {
            let mut buf = Zeroizing::new(Vec::with_capacity(pw.len() + 1));
            buf.extend_from_slice(pw);
            buf.push(b'\n');
            buf
        });
        command::run_with_input(self.interactive_setup().args(args), &line, label).await?;
        Ok(())
    }

    fn checked(address: &str) -> Result<String, String> {
        validate::email(address).map(|(normalized, _)| normalized)
    }
}

/// The setup script's complaint when deleting an entry that is not there.
fn already_absent(err: &str) -> bool {
    let err = err.to_ascii_lowercase();
    err.contains("does not exist") || err.contains("not found")
}

/// Deletes tolerate entries that are already gone.
fn absent_ok(result: Result<String, String>) -> Result<bool, String> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if already_absent(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl MailServer for DockerMailServer {
    async fn add_mailbox(&self, email: &str, password: &Credential) -> Result<(), String> {
        let email = Self::checked(email)?;
        validate::password(password)?;

        self.with_password(["email", "add", email.as_str()], password, "setup email add")
            .await?;
        info!(%email, "mailbox created");
        Ok(())
    }

    async fn remove_mailbox(&self, email: &str) -> Result<(), String> {
        let email = Self::checked(email)?;
        let removed = absent_ok(
            command::run(self.setup().args(["email", "del", "-y", email.as_str()]), "setup email del").await,
        )?;
        info!(%email, removed, "mailbox removed");
        Ok(())
    }

    async fn set_mailbox_password(&self, email: &str, password: &Credential) -> Result<(), String> {
        let email = Self::checked(email)?;
        validate::password(password)?;

        self.with_password(["email", "update", email.as_str()], password, "setup email update")
            .await?;
        info!(%email, "mailbox password changed");
        Ok(())
    }

    async fn add_alias(&self, source: &str, destination: &str) -> Result<(), String> {
        let source = Self::checked(source)?;
        let destination = Self::checked(destination)?;
        command::run(
            self.setup().args(["alias", "add", source.as_str(), destination.as_str()]),
            "setup alias add",
        )
        .await?;
        info!(%source, %destination, "alias created");
        Ok(())
    }

    async fn remove_alias(&self, source: &str, destination: &str) -> Result<(), String> {
        let source = Self::checked(source)?;
        let destination = Self::checked(destination)?;
        let removed = absent_ok(
            command::run(
                self.setup().args(["alias", "del", source.as_str(), destination.as_str()]),
                "setup alias del",
            )
            .await,
        )?;
        info!(%source, %destination, removed, "alias removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_targets_configured_container() {
        let server = DockerMailServer::new("mailserver".to_string());
        let cmd = server.setup();
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(cmd.as_std().get_program(), "docker");
        assert_eq!(args, vec!["exec", "mailserver", "setup"]);

        let cmd = server.interactive_setup();
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, vec!["exec", "-i", "mailserver", "setup"]);
    }

    #[test]
    fn missing_entries_count_as_removed() {
        assert_eq!(absent_ok(Ok(String::new())), Ok(true));
        assert_eq!(
            absent_ok(Err("setup email del failed: 'info@example.com' does not exist".to_string())),
            Ok(false)
        );
        assert_eq!(
            absent_ok(Err("setup alias del failed: Alias \"sales@example.com\" not found".to_string())),
            Ok(false)
        );
        assert!(absent_ok(Err("setup email del failed: container mailserver is not running".to_string())).is_err());
    }

    #[tokio::test]
    async fn invalid_addresses_are_rejected_before_docker() {
        let server = DockerMailServer::new("mailserver".to_string());
        assert!(server.remove_mailbox("not-an-address").await.is_err());
        assert!(server.add_alias("a@example.com", "-rf@").await.is_err());
        let err = server
            .add_mailbox("info@example.com", &Credential::from("short".to_string()))
            .await
            .unwrap_err();
        assert!(err.contains("between 8 and 128"));
    }
}
