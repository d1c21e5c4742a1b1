use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{MatchedPath, Path, Query, Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Config,
    error::{AuditError, Result},
    events::{self, ListEvent},
    filter::EventFilter,
    identity::{AUTH_TOKEN_HEADER, AuthContext, HttpIdentity, Identity},
    policy::Policy,
    storage::{ElasticStore, Event, Storage},
};

/// Shared per-process state: the identity service, the event store, the
/// compiled policy and the enrichment switch. Constructed once at startup
/// and cloned into every request.
#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<dyn Identity>,
    pub storage: Arc<dyn Storage>,
    pub policy: Arc<Policy>,
    pub enrich: bool,
}

/// Policy action per route. Kept as data so new routes declare their
/// action alongside the path.
const ROUTE_ACTIONS: &[(&str, &str)] = &[
    ("/v1/events", "event:list"),
    ("/v1/events/{id}", "event:show"),
    ("/v1/attributes/{name}", "event:list"),
];

fn route_action(path: &str) -> Option<&'static str> {
    ROUTE_ACTIONS
        .iter()
        .find(|(route, _)| *route == path)
        .map(|(_, action)| *action)
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/events", get(list_events))
        .route("/v1/events/{id}", get(show_event))
        .route("/v1/attributes/{name}", get(list_attribute_values))
        .layer(middleware::from_fn_with_state(state.clone(), authorize))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
}

/// Starts the API server against the real identity provider and search
/// backend. Blocks until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let identity: Arc<dyn Identity> = Arc::new(HttpIdentity::new(config.identity.clone())?);
    identity.refresh_token().await?;

    let storage: Arc<dyn Storage> = Arc::new(ElasticStore::new(config.storage.clone())?);
    let policy = match &config.policy.file {
        Some(path) => Arc::new(Policy::from_file(path)?),
        None => {
            warn!("no policy file configured, any authenticated context may read events");
            Arc::new(Policy::permissive())
        }
    };

    let state = AppState {
        identity,
        storage,
        policy,
        enrich: config.service.enrich_identity_events,
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("starting auditdbx API server on {addr}");
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AuditError::Config(format!("cannot bind {addr}: {err}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AuditError::Storage(err.to_string()))?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Per-request gate: token → context via the identity service, then the
/// matched route's action through the policy evaluator. The resulting
/// context is attached for the handlers.
async fn authorize(
    State(state): State<AppState>,
    matched: MatchedPath,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let token = subject_token(request.headers()).ok_or_else(|| {
        AuditError::Unauthenticated(format!("missing {AUTH_TOKEN_HEADER} header"))
    })?;
    let context = state.identity.validate_token(&token).await?;

    let action = route_action(matched.as_str()).ok_or(AuditError::Forbidden)?;
    if !state.policy.enforce(action, &context) {
        warn!(
            action,
            user_id = context.auth.get("user_id").map(String::as_str).unwrap_or(""),
            "request denied by policy"
        );
        return Err(AuditError::Forbidden);
    }

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

pub(crate) fn subject_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTH_TOKEN_HEADER)?;
    let value = value.to_str().ok()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Serialize)]
struct EventList {
    events: Vec<ListEvent>,
    total: u32,
}

async fn list_events(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<EventList>> {
    let filter = EventFilter::from_query_pairs(params)?;
    let (events, total) = events::get_events(
        &filter,
        &context.tenant_id(),
        state.identity.as_ref(),
        state.storage.as_ref(),
        state.enrich,
    )
    .await?;
    Ok(Json(EventList { events, total }))
}

async fn show_event(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Event>> {
    let event = events::get_event(
        &id,
        &context.tenant_id(),
        state.identity.as_ref(),
        state.storage.as_ref(),
        state.enrich,
    )
    .await?;
    Ok(Json(event))
}

async fn list_attribute_values(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Json<Vec<String>>> {
    let values =
        events::get_attributes(&name, &context.tenant_id(), state.storage.as_ref()).await?;
    Ok(Json(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn every_route_declares_a_policy_action() {
        assert_eq!(route_action("/v1/events"), Some("event:list"));
        assert_eq!(route_action("/v1/events/{id}"), Some("event:show"));
        assert_eq!(route_action("/v1/attributes/{name}"), Some("event:list"));
        assert_eq!(route_action("/v1/unknown"), None);
    }

    #[test]
    fn subject_token_requires_a_non_empty_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(subject_token(&headers), None);

        headers.insert(AUTH_TOKEN_HEADER, HeaderValue::from_static("  "));
        assert_eq!(subject_token(&headers), None);

        headers.insert(AUTH_TOKEN_HEADER, HeaderValue::from_static("t-123"));
        assert_eq!(subject_token(&headers).as_deref(), Some("t-123"));
    }
}
