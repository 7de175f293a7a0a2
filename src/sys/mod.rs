// Host-facing managers. The service layer only sees the traits.

pub mod traits;     // Global contracts
pub mod secrets;    // Memory hygiene (Credential)
pub mod validate;   // Input gate for config files, SQL and argv
pub mod command;    // Subprocess plumbing
pub mod proxy;      // Ingress (Nginx/Apache)
pub mod jail;       // Document roots
pub mod ssl;        // Certificate management
pub mod database;   // MySQL/MariaDB
pub mod mail;       // docker-mailserver
pub mod dns;        // Cloudflare
pub mod backup;     // Archives
pub mod cleanup;    // Backup retention
pub mod scheduler;  // Systemd timers
pub mod systemd;    // Service control
pub mod stats;      // Dashboard sampling
