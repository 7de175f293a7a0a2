// JSON-over-UDS surface. Every reply uses the same envelope so callers can
// branch on `success` without inspecting status codes.

use axum::{
    Json, Router,
    extract::{
        FromRequest, FromRequestParts, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::PanelError;
use crate::models::{
    AliasRecord, BackupRecord, CertificateRecord, DatabaseRecord, DnsRecordEntry, DomainRecord, MailboxRecord,
    ScheduleRecord,
};
use crate::server::{
    AliasRequest, CreateDatabase, CreateDomain, CreateMailbox, Dashboard, DatabaseCreated, DeleteDomain, DriftReport,
    IssueCertificate, PanelService, PasswordChange, PasswordRotated, Provisioned, ScheduleBackups, UpdateDomain,
    UploadCertificate,
};
use crate::sys::secrets::Credential;
use crate::sys::systemd::ServiceAction;
use crate::sys::traits::{DnsRecordSpec, ProviderRecord};

#[derive(Debug, Serialize)]
pub struct PanelResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> PanelResponse<T> {
    fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_message: String::new(),
            data: Some(data),
        }
    }
}

type Reply<T> = Result<Json<PanelResponse<T>>, PanelError>;
type Created<T> = Result<(StatusCode, Json<PanelResponse<T>>), PanelError>;

fn reply<T>(message: impl Into<String>, data: T) -> Reply<T> {
    Ok(Json(PanelResponse::ok(message, data)))
}

fn created<T>(message: impl Into<String>, data: T) -> Created<T> {
    Ok((StatusCode::CREATED, Json(PanelResponse::ok(message, data))))
}

impl PanelError {
    fn status(&self) -> StatusCode {
        match self {
            PanelError::Invalid(_) => StatusCode::BAD_REQUEST,
            PanelError::NotFound(_) => StatusCode::NOT_FOUND,
            PanelError::Conflict(_) => StatusCode::CONFLICT,
            PanelError::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            PanelError::System(_) => StatusCode::BAD_GATEWAY,
            PanelError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let PanelError::Store(e) = &self {
            error!("state store failure: {}", e);
        }
        let body = PanelResponse::<()> {
            success: false,
            message: String::new(),
            error_message: self.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

// Extractors whose rejections use the envelope instead of axum's plain text.

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(PanelError))]
struct JsonBody<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(PanelError))]
struct UrlPath<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(PanelError))]
struct UrlQuery<T>(T);

impl From<JsonRejection> for PanelError {
    fn from(rejection: JsonRejection) -> Self {
        PanelError::Invalid(rejection.body_text())
    }
}

impl From<PathRejection> for PanelError {
    fn from(rejection: PathRejection) -> Self {
        PanelError::Invalid(rejection.body_text())
    }
}

impl From<QueryRejection> for PanelError {
    fn from(rejection: QueryRejection) -> Self {
        PanelError::Invalid(rejection.body_text())
    }
}

pub fn router(service: Arc<PanelService>) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/services/{unit}/{action}", post(control_service))
        .route("/domains", get(list_domains).post(create_domain))
        .route("/domains/drift", get(verify_domains))
        .route("/domains/{name}", put(update_domain).delete(delete_domain))
        .route("/databases", get(list_databases).post(create_database))
        .route("/databases/{name}", delete(delete_database))
        .route("/databases/{name}/password", post(rotate_database_password))
        .route("/mailboxes", get(list_mailboxes).post(create_mailbox))
        .route("/mailboxes/{email}", delete(delete_mailbox))
        .route("/mailboxes/{email}/password", post(change_mailbox_password))
        .route("/aliases", get(list_aliases).post(create_alias).delete(delete_alias))
        .route("/certificates", get(list_certificates))
        .route("/certificates/refresh", post(refresh_certificates))
        .route("/certificates/{domain}", delete(delete_certificate))
        .route("/certificates/{domain}/issue", post(issue_certificate))
        .route("/certificates/{domain}/upload", post(upload_certificate))
        .route("/dns/{zone}", get(list_dns_records).post(create_dns_record))
        .route("/dns/{zone}/{id}", delete(delete_dns_record))
        .route("/backups", get(list_backups).post(create_backup))
        .route("/backups/schedules", get(list_schedules))
        .route("/backups/schedule/{domain}", put(schedule_backups).delete(unschedule_backups))
        .route("/backups/{id}", delete(delete_backup))
        .route("/backups/{id}/restore", post(restore_backup))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

type Svc = State<Arc<PanelService>>;

// --- Dashboard ---

async fn stats(State(svc): Svc) -> Reply<Dashboard> {
    reply("", svc.dashboard().await?)
}

async fn control_service(State(svc): Svc, UrlPath((unit, action)): UrlPath<(String, ServiceAction)>) -> Reply<()> {
    svc.service_control(&unit, action).await?;
    reply(format!("systemctl {} {} succeeded", action, unit), ())
}

// --- Domains ---

async fn list_domains(State(svc): Svc) -> Reply<Vec<DomainRecord>> {
    reply("", svc.list_domains().await?)
}

async fn create_domain(State(svc): Svc, JsonBody(req): JsonBody<CreateDomain>) -> Created<Provisioned<DomainRecord>> {
    let provisioned = svc.create_domain(req).await?;
    created(format!("Domain {} created", provisioned.record.name), provisioned)
}

async fn update_domain(State(svc): Svc, UrlPath(name): UrlPath<String>, JsonBody(req): JsonBody<UpdateDomain>) -> Reply<DomainRecord> {
    let record = svc.update_domain(&name, req).await?;
    reply(format!("Domain {} updated", record.name), record)
}

async fn delete_domain(
    State(svc): Svc,
    UrlPath(name): UrlPath<String>,
    UrlQuery(opts): UrlQuery<DeleteDomain>,
) -> Reply<Provisioned<DomainRecord>> {
    let removed = svc.delete_domain(&name, opts).await?;
    reply(format!("Domain {} deleted", removed.record.name), removed)
}

async fn verify_domains(State(svc): Svc) -> Reply<Vec<DriftReport>> {
    let reports = svc.verify_domains().await?;
    let drifted = reports.iter().filter(|r| !r.in_sync).count();
    reply(format!("{} of {} domains drifted", drifted, reports.len()), reports)
}

// --- Databases ---

async fn list_databases(State(svc): Svc) -> Reply<Vec<DatabaseRecord>> {
    reply("", svc.list_databases().await?)
}

async fn create_database(State(svc): Svc, JsonBody(req): JsonBody<CreateDatabase>) -> Created<DatabaseCreated> {
    let result = svc.create_database(req).await?;
    created(format!("Database {} created", result.database.name), result)
}

async fn rotate_database_password(
    State(svc): Svc,
    UrlPath(name): UrlPath<String>,
    JsonBody(req): JsonBody<PasswordChange>,
) -> Reply<PasswordRotated> {
    let rotated = svc.rotate_database_password(&name, req).await?;
    reply(format!("Password for database {} changed", name), rotated)
}

async fn delete_database(State(svc): Svc, UrlPath(name): UrlPath<String>) -> Reply<DatabaseRecord> {
    let record = svc.delete_database(&name).await?;
    reply(format!("Database {} deleted", record.name), record)
}

// --- Mail ---

#[derive(Debug, Deserialize)]
struct MailboxPassword {
    password: Credential,
}

async fn list_mailboxes(State(svc): Svc) -> Reply<Vec<MailboxRecord>> {
    reply("", svc.list_mailboxes().await?)
}

async fn create_mailbox(State(svc): Svc, JsonBody(req): JsonBody<CreateMailbox>) -> Created<MailboxRecord> {
    let record = svc.create_mailbox(req).await?;
    created(format!("Mailbox {} created", record.email), record)
}

async fn change_mailbox_password(
    State(svc): Svc,
    UrlPath(email): UrlPath<String>,
    JsonBody(req): JsonBody<MailboxPassword>,
) -> Reply<()> {
    svc.change_mailbox_password(&email, req.password).await?;
    reply(format!("Password for {} changed", email), ())
}

async fn delete_mailbox(State(svc): Svc, UrlPath(email): UrlPath<String>) -> Reply<MailboxRecord> {
    let record = svc.delete_mailbox(&email).await?;
    reply(format!("Mailbox {} deleted", record.email), record)
}

async fn list_aliases(State(svc): Svc) -> Reply<Vec<AliasRecord>> {
    reply("", svc.list_aliases().await?)
}

async fn create_alias(State(svc): Svc, JsonBody(req): JsonBody<AliasRequest>) -> Created<AliasRecord> {
    let record = svc.create_alias(req).await?;
    created(format!("Alias {} -> {} created", record.source, record.destination), record)
}

async fn delete_alias(State(svc): Svc, JsonBody(req): JsonBody<AliasRequest>) -> Reply<AliasRecord> {
    let record = svc.delete_alias(&req.source, &req.destination).await?;
    reply(format!("Alias {} -> {} deleted", record.source, record.destination), record)
}

// --- Certificates ---

async fn list_certificates(State(svc): Svc) -> Reply<Vec<CertificateRecord>> {
    reply("", svc.list_certificates().await?)
}

async fn issue_certificate(
    State(svc): Svc,
    UrlPath(domain): UrlPath<String>,
    UrlQuery(req): UrlQuery<IssueCertificate>,
) -> Created<Provisioned<CertificateRecord>> {
    let issued = svc.issue_certificate(&domain, req).await?;
    created(format!("Certificate issued for {}", issued.record.domain), issued)
}

async fn upload_certificate(
    State(svc): Svc,
    UrlPath(domain): UrlPath<String>,
    JsonBody(req): JsonBody<UploadCertificate>,
) -> Created<Provisioned<CertificateRecord>> {
    let installed = svc.upload_certificate(&domain, req).await?;
    created(format!("Certificate installed for {}", installed.record.domain), installed)
}

async fn refresh_certificates(State(svc): Svc) -> Reply<Provisioned<Vec<CertificateRecord>>> {
    reply("Certificate expiry refreshed", svc.refresh_certificates().await?)
}

async fn delete_certificate(State(svc): Svc, UrlPath(domain): UrlPath<String>) -> Reply<CertificateRecord> {
    let cert = svc.delete_certificate(&domain).await?;
    reply(format!("Certificate for {} deleted", cert.domain), cert)
}

// --- DNS ---

async fn list_dns_records(State(svc): Svc, UrlPath(zone): UrlPath<String>) -> Reply<Vec<ProviderRecord>> {
    reply("", svc.list_dns_records(&zone).await?)
}

async fn create_dns_record(
    State(svc): Svc,
    UrlPath(zone): UrlPath<String>,
    JsonBody(spec): JsonBody<DnsRecordSpec>,
) -> Created<DnsRecordEntry> {
    let entry = svc.create_dns_record(&zone, spec).await?;
    created(format!("{} record {} saved", entry.spec.record_type, entry.spec.name), entry)
}

async fn delete_dns_record(State(svc): Svc, UrlPath((zone, id)): UrlPath<(String, String)>) -> Reply<()> {
    svc.delete_dns_record(&zone, &id).await?;
    reply(format!("DNS record {} deleted", id), ())
}

// --- Backups ---

#[derive(Debug, Deserialize)]
struct BackupFilter {
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackupTarget {
    domain: String,
}

async fn list_backups(State(svc): Svc, UrlQuery(filter): UrlQuery<BackupFilter>) -> Reply<Vec<BackupRecord>> {
    reply("", svc.list_backups(filter.domain.as_deref()).await?)
}

async fn create_backup(State(svc): Svc, JsonBody(req): JsonBody<BackupTarget>) -> Created<Provisioned<BackupRecord>> {
    let backup = svc.create_backup(&req.domain).await?;
    created(format!("Backup {} created", backup.record.id), backup)
}

async fn restore_backup(State(svc): Svc, UrlPath(id): UrlPath<String>) -> Reply<BackupRecord> {
    let backup = svc.restore_backup(&id).await?;
    reply(format!("Backup {} restored", backup.id), backup)
}

async fn delete_backup(State(svc): Svc, UrlPath(id): UrlPath<String>) -> Reply<BackupRecord> {
    let backup = svc.delete_backup(&id).await?;
    reply(format!("Backup {} deleted", backup.id), backup)
}

async fn list_schedules(State(svc): Svc) -> Reply<Vec<ScheduleRecord>> {
    reply("", svc.list_schedules().await?)
}

async fn schedule_backups(
    State(svc): Svc,
    UrlPath(domain): UrlPath<String>,
    JsonBody(req): JsonBody<ScheduleBackups>,
) -> Reply<ScheduleRecord> {
    let schedule = svc.schedule_backups(&domain, req).await?;
    reply(
        format!("Backups for {} scheduled at {}", schedule.domain, schedule.on_calendar),
        schedule,
    )
}

async fn unschedule_backups(State(svc): Svc, UrlPath(domain): UrlPath<String>) -> Reply<ScheduleRecord> {
    let schedule = svc.unschedule_backups(&domain).await?;
    reply(format!("Backup schedule for {} removed", schedule.domain), schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    fn app() -> (Router, testing::Calls, tempfile::TempDir) {
        let (svc, calls, dir) = testing::service();
        (router(Arc::new(svc)), calls, dir)
    }

    #[tokio::test]
    async fn domain_lifecycle_over_http() {
        let (app, _calls, _dir) = app();

        let (status, body) = call(&app, Method::POST, "/domains", Some(json!({ "name": "example.com" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Domain example.com created");
        assert_eq!(body["data"]["record"]["name"], "example.com");

        let (status, body) = call(&app, Method::GET, "/domains", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

        let (status, body) = call(&app, Method::POST, "/domains", Some(json!({ "name": "example.com" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert!(body.get("data").is_none());

        let (status, _) = call(&app, Method::DELETE, "/domains/example.com?purge_files=true", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::DELETE, "/domains/example.com", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn errors_map_to_statuses() {
        let (app, calls, _dir) = app();

        let (status, body) = call(&app, Method::POST, "/domains", Some(json!({ "name": "bad name" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error_message"].as_str().unwrap().starts_with("invalid input"));

        let (status, _) = call(&app, Method::GET, "/dns/example.com", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        calls.fail_on("proxy.create");
        let (status, body) = call(&app, Method::POST, "/domains", Some(json!({ "name": "example.com" }))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error_message"], "proxy.create example.com tls=false failed");
    }

    #[tokio::test]
    async fn generated_database_password_is_returned() {
        let (app, _calls, _dir) = app();
        let (status, body) = call(&app, Method::POST, "/databases", Some(json!({ "name": "shop" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["database"]["user"], "shop");
        assert_eq!(body["data"]["generated_password"].as_str().map(str::len), Some(24));

        let (status, body) = call(
            &app,
            Method::POST,
            "/databases/shop/password",
            Some(json!({ "password": "a-new-password" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].get("generated_password").is_none());
    }

    #[tokio::test]
    async fn service_control_path_parses_action() {
        let (app, calls, _dir) = app();
        let (status, _) = call(&app, Method::POST, "/services/nginx/restart", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(calls.take(), vec!["services.restart nginx"]);

        let (status, body) = call(&app, Method::POST, "/services/nginx/explode", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error_message"].as_str().unwrap().starts_with("invalid input"));
        assert!(calls.take().is_empty());
    }

    #[tokio::test]
    async fn malformed_requests_use_the_envelope() {
        let (app, calls, _dir) = app();

        let (status, body) = call(&app, Method::POST, "/domains", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error_message"].as_str().unwrap().starts_with("invalid input"));

        let (status, body) = call(&app, Method::POST, "/databases", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(&app, Method::DELETE, "/domains/example.com?cascade=maybe", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(calls.take().is_empty());
    }

    #[tokio::test]
    async fn backups_routes_do_not_collide() {
        let (app, calls, _dir) = app();
        call(&app, Method::POST, "/domains", Some(json!({ "name": "example.com" }))).await;

        let (status, _) = call(
            &app,
            Method::PUT,
            "/backups/schedule/example.com",
            Some(json!({ "on_calendar": "daily" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, Method::GET, "/backups/schedules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["domain"], "example.com");

        let (status, body) = call(&app, Method::POST, "/backups", Some(json!({ "domain": "example.com" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["record"]["id"].as_str().unwrap().to_string();

        calls.take();
        let (status, _) = call(&app, Method::POST, &format!("/backups/{}/restore", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(calls.take(), vec![format!("backup.restore {}", id)]);
    }
}
