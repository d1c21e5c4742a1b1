use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cache::{NameCache, TokenCache};
use crate::config::IdentityConfig;
use crate::error::{AuditError, Result};

pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
pub const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Authorization context derived from a validated token. Created per
/// request and handed to the policy evaluator and the query service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthContext {
    pub roles: Vec<String>,
    pub auth: HashMap<String, String>,
}

impl AuthContext {
    /// The tenant scope for storage queries; empty when the token carries
    /// no project scope.
    pub fn tenant_id(&self) -> String {
        self.auth.get("project_id").cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenEntity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScopedTokenEntity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: TokenEntity,
}

/// The slice of the identity provider's token-introspection response the
/// service consumes. Immutable once parsed; cached until `expires_at`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRecord {
    #[serde(default)]
    pub domain: TokenEntity,
    #[serde(default)]
    pub project: ScopedTokenEntity,
    #[serde(default)]
    pub user: ScopedTokenEntity,
    #[serde(default)]
    pub roles: Vec<TokenEntity>,
    pub expires_at: DateTime<Utc>,
}

impl Default for TokenRecord {
    fn default() -> Self {
        Self {
            domain: TokenEntity::default(),
            project: ScopedTokenEntity::default(),
            user: ScopedTokenEntity::default(),
            roles: Vec::new(),
            expires_at: Utc::now(),
        }
    }
}

#[derive(Deserialize)]
struct TokenEnvelope {
    token: TokenRecord,
}

impl TokenRecord {
    /// Flattens the token into the auth-key map consumed by policy rules.
    /// Project keys are mirrored under the legacy `tenant_*` aliases;
    /// empty values are omitted entirely.
    pub fn to_context(&self) -> AuthContext {
        let mut auth = HashMap::new();
        let pairs = [
            ("user_id", &self.user.id),
            ("user_name", &self.user.name),
            ("user_domain_id", &self.user.domain.id),
            ("user_domain_name", &self.user.domain.name),
            ("domain_id", &self.domain.id),
            ("domain_name", &self.domain.name),
            ("project_id", &self.project.id),
            ("project_name", &self.project.name),
            ("project_domain_id", &self.project.domain.id),
            ("project_domain_name", &self.project.domain.name),
            ("tenant_id", &self.project.id),
            ("tenant_name", &self.project.name),
            ("tenant_domain_id", &self.project.domain.id),
            ("tenant_domain_name", &self.project.domain.name),
        ];
        for (key, value) in pairs {
            if !value.is_empty() {
                auth.insert(key.to_string(), value.clone());
            }
        }

        AuthContext {
            roles: self.roles.iter().map(|role| role.name.clone()).collect(),
            auth,
        }
    }
}

/// Username/password credentials for a token exchange.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub user_domain_name: String,
    pub project_name: String,
}

impl From<&IdentityConfig> for Credentials {
    fn from(config: &IdentityConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            user_domain_name: config.user_domain_name.clone(),
            project_name: config.project_name.clone(),
        }
    }
}

/// The operations the core consumes from the identity provider. Two
/// variants exist: the HTTP client and the in-memory mock.
#[async_trait]
pub trait Identity: Send + Sync {
    /// Resolves a bearer token into an authorization context, serving from
    /// the token cache when a live entry exists.
    async fn validate_token(&self, token: &str) -> Result<AuthContext>;

    /// Exchanges credentials for a fresh token's context. Does not touch
    /// the token cache.
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthContext>;

    async fn domain_name(&self, id: &str) -> Result<String>;
    async fn project_name(&self, id: &str) -> Result<String>;
    async fn user_name(&self, id: &str) -> Result<String>;
    async fn role_name(&self, id: &str) -> Result<String>;
    async fn group_name(&self, id: &str) -> Result<String>;

    /// Reverse lookup of a user id by name.
    async fn user_id(&self, name: &str) -> Result<String>;

    /// Renews the service-account token used for outbound provider calls.
    async fn refresh_token(&self) -> Result<()>;
}

/// The per-kind name caches shared by every identity variant.
#[derive(Default)]
struct NameCaches {
    domain_names: NameCache,
    project_names: NameCache,
    user_names: NameCache,
    user_ids: NameCache,
    role_names: NameCache,
    group_names: NameCache,
}

impl NameCaches {
    /// Seeds the caches with every (id, name) pair a validated token
    /// carries: both scopes, their domains, the user (in both directions)
    /// and each role.
    fn absorb_token(&self, record: &TokenRecord) {
        if !record.domain.id.is_empty() && !record.domain.name.is_empty() {
            self.domain_names
                .put(record.domain.id.as_str(), record.domain.name.as_str());
        }
        if !record.project.domain.id.is_empty() && !record.project.domain.name.is_empty() {
            self.domain_names.put(
                record.project.domain.id.as_str(),
                record.project.domain.name.as_str(),
            );
        }
        if !record.project.id.is_empty() && !record.project.name.is_empty() {
            self.project_names
                .put(record.project.id.as_str(), record.project.name.as_str());
        }
        if !record.user.id.is_empty() && !record.user.name.is_empty() {
            self.user_names
                .put(record.user.id.as_str(), record.user.name.as_str());
            self.user_ids
                .put(record.user.name.as_str(), record.user.id.as_str());
        }
        for role in &record.roles {
            if !role.id.is_empty() && !role.name.is_empty() {
                self.role_names.put(role.id.as_str(), role.name.as_str());
            }
        }
    }
}

struct ServiceAccount {
    token_id: String,
    identity_endpoint: String,
}

/// HTTP client for the identity provider. Process-wide singleton; all
/// caches live inside it. Outbound calls authenticate with a
/// service-account token that is refreshed on demand under a mutex.
pub struct HttpIdentity {
    http: reqwest::Client,
    config: IdentityConfig,
    base_url: String,
    service: tokio::sync::Mutex<ServiceAccount>,
    tokens: TokenCache,
    names: NameCaches,
}

impl HttpIdentity {
    pub fn new(config: IdentityConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|err| AuditError::Config(format!("cannot build identity client: {err}")))?;
        let base_url = normalize_endpoint(&config.auth_url);

        Ok(Self {
            http,
            config,
            base_url: base_url.clone(),
            service: tokio::sync::Mutex::new(ServiceAccount {
                token_id: String::new(),
                identity_endpoint: base_url,
            }),
            tokens: TokenCache::new(),
            names: NameCaches::default(),
        })
    }

    async fn service_credentials(&self) -> Result<(String, String)> {
        {
            let state = self.service.lock().await;
            if !state.token_id.is_empty() {
                return Ok((state.identity_endpoint.clone(), state.token_id.clone()));
            }
        }

        self.refresh_service_token().await?;

        let state = self.service.lock().await;
        if state.token_id.is_empty() {
            return Err(AuditError::Identity(
                "service account token unavailable".into(),
            ));
        }
        Ok((state.identity_endpoint.clone(), state.token_id.clone()))
    }

    /// Fetches a fresh service-account token and reinstalls the identity
    /// endpoint from the returned service catalog. All refresh attempts
    /// are serialized by the service-account mutex; the stored token id is
    /// cleared before the exchange so a failure leaves no stale token.
    async fn refresh_service_token(&self) -> Result<()> {
        let mut state = self.service.lock().await;
        state.token_id.clear();

        debug!("requesting service account token");
        let url = format!("{}/v3/auth/tokens", self.base_url);
        let credentials = Credentials::from(&self.config);
        let response = self
            .http
            .post(&url)
            .json(&password_auth_body(&credentials))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Identity(format!(
                "service account authentication failed with status {status}"
            )));
        }

        let token_id = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                AuditError::Identity("token response is missing the subject token header".into())
            })?;
        let payload: Value = response.json().await.map_err(transport_error)?;

        state.identity_endpoint =
            endpoint_from_catalog(&payload).unwrap_or_else(|| self.base_url.clone());
        state.token_id = token_id;
        debug!(endpoint = %state.identity_endpoint, "service account token refreshed");
        Ok(())
    }

    /// Sends a provider request with the service-account token attached.
    /// A 401 triggers exactly one token refresh and retry before the
    /// response is surfaced.
    async fn send_with_service_token<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str, &str) -> reqwest::RequestBuilder,
    {
        let (endpoint, token) = self.service_credentials().await?;
        let response = build(&endpoint, &token).send().await.map_err(transport_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("service account token rejected, refreshing");
        self.refresh_service_token().await?;
        let (endpoint, token) = self.service_credentials().await?;
        build(&endpoint, &token).send().await.map_err(transport_error)
    }

    async fn provider_get(&self, path: &str) -> Result<Value> {
        let response = self
            .send_with_service_token(|endpoint, token| {
                self.http
                    .get(format!("{endpoint}/v3/{path}"))
                    .header(AUTH_TOKEN_HEADER, token)
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Identity(format!(
                "identity provider returned {status} for {path}"
            )));
        }
        response.json().await.map_err(transport_error)
    }

    /// Single-entity GET, e.g. `domains/{id}` unwrapped from `{"domain": {...}}`.
    async fn fetch_name(&self, collection: &str, key: &str, id: &str) -> Result<String> {
        let payload = self.provider_get(&format!("{collection}/{id}")).await?;
        payload
            .get(key)
            .and_then(|entity| entity.get("name"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                AuditError::Identity(format!("malformed {key} response for id {id}"))
            })
    }

    fn update_caches(&self, token: &str, record: &TokenRecord) {
        self.tokens.insert(token, record.clone());
        self.names.absorb_token(record);
    }
}

#[async_trait]
impl Identity for HttpIdentity {
    async fn validate_token(&self, token: &str) -> Result<AuthContext> {
        if let Some(record) = self.tokens.get(token) {
            debug!("token cache hit");
            return Ok(record.to_context());
        }

        let response = self
            .send_with_service_token(|endpoint, service_token| {
                self.http
                    .get(format!("{endpoint}/v3/auth/tokens"))
                    .header(AUTH_TOKEN_HEADER, service_token)
                    .header(SUBJECT_TOKEN_HEADER, token)
            })
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            return Err(AuditError::Unauthenticated(
                "token is invalid or expired".into(),
            ));
        }
        if !status.is_success() {
            return Err(AuditError::Identity(format!(
                "token validation failed with status {status}"
            )));
        }

        let envelope: TokenEnvelope = response.json().await.map_err(transport_error)?;
        self.update_caches(token, &envelope.token);
        Ok(envelope.token.to_context())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthContext> {
        let url = format!("{}/v3/auth/tokens", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&password_auth_body(credentials))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND) {
            return Err(AuditError::Unauthenticated("invalid credentials".into()));
        }
        if !status.is_success() {
            return Err(AuditError::Identity(format!(
                "authentication failed with status {status}"
            )));
        }

        let envelope: TokenEnvelope = response.json().await.map_err(transport_error)?;
        Ok(envelope.token.to_context())
    }

    async fn domain_name(&self, id: &str) -> Result<String> {
        self.names
            .domain_names
            .get_or_fetch(id, || self.fetch_name("domains", "domain", id))
            .await
    }

    async fn project_name(&self, id: &str) -> Result<String> {
        self.names
            .project_names
            .get_or_fetch(id, || self.fetch_name("projects", "project", id))
            .await
    }

    async fn user_name(&self, id: &str) -> Result<String> {
        self.names
            .user_names
            .get_or_fetch(id, || async {
                let name = self.fetch_name("users", "user", id).await?;
                self.names.user_ids.put(name.as_str(), id);
                Ok(name)
            })
            .await
    }

    async fn role_name(&self, id: &str) -> Result<String> {
        self.names
            .role_names
            .get_or_fetch(id, || self.fetch_name("roles", "role", id))
            .await
    }

    async fn group_name(&self, id: &str) -> Result<String> {
        self.names
            .group_names
            .get_or_fetch(id, || self.fetch_name("groups", "group", id))
            .await
    }

    async fn user_id(&self, name: &str) -> Result<String> {
        self.names
            .user_ids
            .get_or_fetch(name, || async {
                let response = self
                    .send_with_service_token(|endpoint, token| {
                        self.http
                            .get(format!("{endpoint}/v3/users"))
                            .query(&[("name", name)])
                            .header(AUTH_TOKEN_HEADER, token)
                    })
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(AuditError::Identity(format!(
                        "user search returned {status}"
                    )));
                }
                let payload: Value = response.json().await.map_err(transport_error)?;
                let users = payload
                    .get("users")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let id = match users.len() {
                    0 => {
                        return Err(AuditError::Identity(format!(
                            "no user found with name {name}"
                        )));
                    }
                    1 => entity_id(&users[0]),
                    _ => {
                        warn!(user_name = name, "multiple users share this name, using the first match");
                        entity_id(&users[0])
                    }
                };
                let id = id.ok_or_else(|| {
                    AuditError::Identity(format!("malformed user search response for {name}"))
                })?;
                self.names.user_names.put(id.as_str(), name);
                Ok(id)
            })
            .await
    }

    async fn refresh_token(&self) -> Result<()> {
        self.refresh_service_token().await
    }
}

fn entity_id(entity: &Value) -> Option<String> {
    entity.get("id").and_then(Value::as_str).map(str::to_owned)
}

fn password_auth_body(credentials: &Credentials) -> Value {
    let mut auth = json!({
        "identity": {
            "methods": ["password"],
            "password": {
                "user": {
                    "name": credentials.username,
                    "domain": {"name": credentials.user_domain_name},
                    "password": credentials.password,
                }
            }
        }
    });
    if !credentials.project_name.is_empty() {
        auth["scope"] = json!({
            "project": {
                "name": credentials.project_name,
                "domain": {"name": credentials.user_domain_name},
            }
        });
    }
    json!({ "auth": auth })
}

/// Strips the trailing slash and a `/v3` suffix so paths can be appended
/// uniformly.
fn normalize_endpoint(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed.strip_suffix("/v3").unwrap_or(trimmed).to_string()
}

/// Picks the public identity endpoint out of a token response's service
/// catalog.
fn endpoint_from_catalog(payload: &Value) -> Option<String> {
    let catalog = payload.get("token")?.get("catalog")?.as_array()?;
    let identity = catalog
        .iter()
        .find(|entry| entry.get("type").and_then(Value::as_str) == Some("identity"))?;
    let endpoints = identity.get("endpoints")?.as_array()?;
    let public = endpoints
        .iter()
        .find(|endpoint| endpoint.get("interface").and_then(Value::as_str) == Some("public"))?;
    let url = public.get("url")?.as_str()?;
    Some(normalize_endpoint(url))
}

fn transport_error(err: reqwest::Error) -> AuditError {
    if err.is_timeout() {
        AuditError::Cancelled
    } else {
        AuditError::Identity(err.to_string())
    }
}

/// In-memory identity variant backed by fixture directories. Shares the
/// cache layout of [`HttpIdentity`] and counts simulated provider calls so
/// tests can assert on cache behavior.
#[derive(Default)]
pub struct MockIdentity {
    tokens: TokenCache,
    names: NameCaches,
    known_tokens: HashMap<String, TokenRecord>,
    directory: HashMap<(&'static str, String), String>,
    validations: AtomicUsize,
    lookups: AtomicUsize,
}

impl MockIdentity {
    /// Fixture ids matching the mock storage blobs.
    pub const USER_ID: &'static str =
        "eb5cd8f904b06e8b2a6eb86c8b04c08e6efb89b92da77905cc8c475f30b0b812";
    pub const PROJECT_ID: &'static str = "ae63ddf2076d4342a56eb049e37a7621";
    pub const TARGET_PROJECT_ID: &'static str = "b3b70c8271a845709f9a03030e705da7";
    pub const DOMAIN_ID: &'static str = "2be8f29c2c6a4f1e9c4cd4e64dfc2a40";

    pub fn new() -> Self {
        let mut mock = Self::default();
        mock.add_directory_entry("project", Self::PROJECT_ID, "customer-project");
        mock.add_directory_entry("project", Self::TARGET_PROJECT_ID, "decommissioned-project");
        mock.add_directory_entry("project", "6a030751147a45c0863c3b5bde32c744", "other-project");
        mock.add_directory_entry("user", Self::USER_ID, "svc-provisioning");
        mock.add_directory_entry("domain", Self::DOMAIN_ID, "corp");
        mock.add_directory_entry("role", "f13e4b87a7b14d9d87dfa04b54e94cc5", "audit_viewer");
        mock.add_directory_entry("group", "0a64ce1458aa4e01b211c0b93a340ff0", "cloud-admins");
        mock.add_token("t-auditor", mock.default_token_record());
        mock
    }

    pub fn add_directory_entry(
        &mut self,
        kind: &'static str,
        id: impl Into<String>,
        name: impl Into<String>,
    ) {
        self.directory.insert((kind, id.into()), name.into());
    }

    pub fn add_token(&mut self, token: impl Into<String>, record: TokenRecord) {
        self.known_tokens.insert(token.into(), record);
    }

    /// A project-scoped token matching the fixture directory.
    pub fn default_token_record(&self) -> TokenRecord {
        TokenRecord {
            domain: TokenEntity::default(),
            project: ScopedTokenEntity {
                id: Self::PROJECT_ID.into(),
                name: "customer-project".into(),
                domain: TokenEntity {
                    id: Self::DOMAIN_ID.into(),
                    name: "corp".into(),
                },
            },
            user: ScopedTokenEntity {
                id: Self::USER_ID.into(),
                name: "svc-provisioning".into(),
                domain: TokenEntity {
                    id: Self::DOMAIN_ID.into(),
                    name: "corp".into(),
                },
            },
            roles: vec![TokenEntity {
                id: "f13e4b87a7b14d9d87dfa04b54e94cc5".into(),
                name: "audit_viewer".into(),
            }],
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    /// Number of simulated token-introspection calls.
    pub fn validation_calls(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    /// Number of simulated single-entity and search lookups.
    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    async fn lookup(&self, kind: &'static str, cache: &NameCache, id: &str) -> Result<String> {
        cache
            .get_or_fetch(id, || async {
                self.lookups.fetch_add(1, Ordering::SeqCst);
                self.directory
                    .get(&(kind, id.to_string()))
                    .cloned()
                    .ok_or_else(|| {
                        AuditError::Identity(format!("no {kind} found with id {id}"))
                    })
            })
            .await
    }
}

#[async_trait]
impl Identity for MockIdentity {
    async fn validate_token(&self, token: &str) -> Result<AuthContext> {
        if let Some(record) = self.tokens.get(token) {
            return Ok(record.to_context());
        }

        self.validations.fetch_add(1, Ordering::SeqCst);
        let record = self
            .known_tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuditError::Unauthenticated("token is invalid or expired".into()))?;
        self.tokens.insert(token, record.clone());
        self.names.absorb_token(&record);
        Ok(record.to_context())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthContext> {
        self.known_tokens
            .values()
            .find(|record| record.user.name == credentials.username)
            .map(TokenRecord::to_context)
            .ok_or_else(|| AuditError::Unauthenticated("invalid credentials".into()))
    }

    async fn domain_name(&self, id: &str) -> Result<String> {
        self.lookup("domain", &self.names.domain_names, id).await
    }

    async fn project_name(&self, id: &str) -> Result<String> {
        self.lookup("project", &self.names.project_names, id).await
    }

    async fn user_name(&self, id: &str) -> Result<String> {
        self.lookup("user", &self.names.user_names, id).await
    }

    async fn role_name(&self, id: &str) -> Result<String> {
        self.lookup("role", &self.names.role_names, id).await
    }

    async fn group_name(&self, id: &str) -> Result<String> {
        self.lookup("group", &self.names.group_names, id).await
    }

    async fn user_id(&self, name: &str) -> Result<String> {
        self.names
            .user_ids
            .get_or_fetch(name, || async {
                self.lookups.fetch_add(1, Ordering::SeqCst);
                self.directory
                    .iter()
                    .find(|((kind, _), entry)| *kind == "user" && entry.as_str() == name)
                    .map(|((_, id), _)| id.clone())
                    .ok_or_else(|| {
                        AuditError::Identity(format!("no user found with name {name}"))
                    })
            })
            .await
    }

    async fn refresh_token(&self) -> Result<()> {
        Ok(())
    }
}
