#![deny(unsafe_code)]
//! amebo-daemon
//!
//! The HTTP surface: wires the Store, Schema Cache, Credential Vault,
//! Catalog, Publisher, Dispatcher, and Replay components behind one Axum
//! router, and is the single place that translates typed
//! [`amebo_core::Error`] values into HTTP responses.

pub mod middleware;

use amebo_catalog::{ActionFilter, ApplicationFilter, Catalog, Page, SubscriptionFilter};
use amebo_core::model::{Action, Event, Subscription};
use amebo_core::{Error, Result};
use amebo_publisher::{PublishEnvelope, Publisher};
use amebo_replay::Replayer;
use amebo_store::{QueryValue, Store};
use amebo_vault::{AuthScheme, Vault};
use axum::body::Bytes;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Process-wide state shared by every handler and the background
/// Dispatcher: one explicit container constructed at startup and passed
/// by reference.
#[derive(Clone)]
pub struct AppState {
    /// Direct store access, used by handlers the Catalog doesn't cover
    /// (gist listing with join metadata).
    pub store: Store,
    /// Authenticates `/v1/tokens` and gates protected listing routes.
    pub vault: Vault,
    /// CRUD over applications, actions, subscriptions.
    pub catalog: Catalog,
    /// The publish pipeline.
    pub publisher: Publisher,
    /// Manual gist redelivery.
    pub replayer: Replayer,
}

/// The single boundary translator from [`amebo_core::Error`] to an HTTP
/// response.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            Error::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            Error::NoCreds => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "authentication required" }),
            ),
            Error::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            Error::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, json!({ "error": msg })),
            Error::SchemaViolation(errs) => (StatusCode::NOT_ACCEPTABLE, json!({ "errors": errs })),
            Error::BadInput(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            Error::WrongContentType => (
                StatusCode::IM_A_TEAPOT,
                json!({ "error": self.0.to_string() }),
            ),
            Error::UpstreamUnavailable { status, body } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "upstream_status": status, "body": body }),
            ),
            Error::UpstreamError(msg) => (StatusCode::BAD_GATEWAY, json!({ "error": msg })),
            Error::Store(msg) => (
                StatusCode::from_u16(426).expect("426 is a valid HTTP status code"),
                json!({ "error": msg }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// A `Json<T>`-like extractor that enforces the uniform content-type
/// convention: a mutating request without an `application/json` content
/// type is rejected with 418, not axum's default 415.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("application/json") {
            return Err(ApiError(Error::WrongContentType));
        }
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|err| ApiError(Error::BadInput(err.to_string())))?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|err| ApiError(Error::BadInput(format!("malformed JSON body: {err}"))))?;
        Ok(Self(value))
    }
}

/// Builds the Axum router with every route, wrapped in the request-id,
/// request-logging, and CORS middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/tokens", post(post_tokens))
        .route("/v1/applications", get(list_applications).post(post_application))
        .route("/v1/applications/{id}", put(put_application))
        .route("/v1/actions", get(list_actions).post(post_action))
        .route("/v1/events", get(list_events).post(post_event))
        .route("/v1/subscriptions", get(list_subscriptions).post(post_subscription))
        .route("/v1/gists", get(list_gists))
        .route("/v1/regists/{id}", post(post_regist))
        .layer(axum::middleware::from_fn(middleware::request_logger))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(middleware::cors_layer())
        .with_state(state)
}

async fn require_token(state: &AppState, jar: &CookieJar, headers: &axum::http::HeaderMap) -> Result<()> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| jar.get("Authentication").map(|c| c.value().to_string()))
        .ok_or(Error::NoCreds)?;
    state.vault.verify(&token)?;
    Ok(())
}

fn pagination_page(catalog: &Catalog, q: &ListQuery) -> Page {
    catalog.page(q.page, q.pagination)
}

/// Query parameters shared by every listing endpoint.
#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    id: Option<i64>,
    name: Option<String>,
    application_id: Option<i64>,
    action_id: Option<i64>,
    subscription_id: Option<i64>,
    timeline: Option<String>,
    page: Option<u32>,
    pagination: Option<u32>,
}

// -- /v1/tokens -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenRequest {
    scheme: String,
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
}

async fn post_tokens(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<TokenRequest>,
) -> std::result::Result<(StatusCode, CookieJar, Json<TokenResponse>), ApiError> {
    let scheme = AuthScheme::parse(&req.scheme)
        .ok_or_else(|| Error::BadInput(format!("unknown scheme '{}'", req.scheme)))?;
    let token = state
        .vault
        .authenticate(scheme, &req.username, &req.password)
        .await?;

    let cookie = Cookie::build(("Authentication", token.clone()))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(time::Duration::seconds(amebo_vault::TOKEN_MAX_AGE_SECS))
        .build();
    let jar = CookieJar::new().add(cookie);
    Ok((StatusCode::ACCEPTED, jar, Json(TokenResponse { token })))
}

// -- /v1/applications -------------------------------------------------------

/// An application as returned over HTTP: `secret` is never serialized back
/// to clients (see `amebo_core::model::Application`'s doc comment).
#[derive(Debug, Serialize)]
struct ApplicationOut {
    id: i64,
    name: String,
    address: String,
    created_at: DateTime<Utc>,
}

impl From<amebo_core::model::Application> for ApplicationOut {
    fn from(app: amebo_core::model::Application) -> Self {
        Self {
            id: app.id,
            name: app.name,
            address: app.address,
            created_at: app.created_at,
        }
    }
}

async fn list_applications(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
) -> std::result::Result<Json<Vec<ApplicationOut>>, ApiError> {
    require_token(&state, &jar, &headers).await?;
    let filter = ApplicationFilter {
        id: q.id,
        name: q.name.clone(),
        timeline: q.timeline.clone(),
    };
    let page = pagination_page(&state.catalog, &q);
    let apps = state.catalog.list_applications(&filter, page).await?;
    Ok(Json(apps.into_iter().map(ApplicationOut::from).collect()))
}

#[derive(Debug, Deserialize)]
struct NewApplication {
    name: String,
    address: String,
    secret: String,
}

async fn post_application(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<NewApplication>,
) -> std::result::Result<(StatusCode, Json<ApplicationOut>), ApiError> {
    let app = state
        .catalog
        .insert_application(&req.name, &req.address, &req.secret)
        .await?;
    Ok((StatusCode::CREATED, Json(ApplicationOut::from(app))))
}

#[derive(Debug, Deserialize)]
struct UpdateApplicationAddress {
    secret: String,
    address: String,
}

async fn put_application(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    AppJson(req): AppJson<UpdateApplicationAddress>,
) -> std::result::Result<(StatusCode, Json<ApplicationOut>), ApiError> {
    let app = state
        .catalog
        .update_application_address(id, &req.secret, &req.address)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ApplicationOut::from(app))))
}

// -- /v1/actions ------------------------------------------------------------

async fn list_actions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
) -> std::result::Result<Json<Vec<Action>>, ApiError> {
    require_token(&state, &jar, &headers).await?;
    let filter = ActionFilter {
        id: q.id,
        name: q.name.clone(),
        application_id: q.application_id,
        timeline: q.timeline.clone(),
    };
    let page = pagination_page(&state.catalog, &q);
    Ok(Json(state.catalog.list_actions(&filter, page).await?))
}

#[derive(Debug, Deserialize)]
struct NewAction {
    name: String,
    application: String,
    secret: String,
    schemata: Value,
}

async fn post_action(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<NewAction>,
) -> std::result::Result<(StatusCode, Json<Action>), ApiError> {
    let schemata = serde_json::to_string(&req.schemata)
        .map_err(|err| Error::BadInput(format!("schemata is not serializable: {err}")))?;
    let action = state
        .catalog
        .insert_action(&req.name, &req.application, &req.secret, &schemata)
        .await?;
    Ok((StatusCode::CREATED, Json(action)))
}

// -- /v1/events ---------------------------------------------------------

async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
) -> std::result::Result<Json<Vec<Event>>, ApiError> {
    require_token(&state, &jar, &headers).await?;
    let mut fb = amebo_store::FilterBuilder::new(state.store.is_postgres(), 1);
    fb.eq("id", q.id).eq("action_id", q.action_id);
    let cutoff = q
        .timeline
        .as_deref()
        .map(parse_timeline_cutoff)
        .transpose()?;
    fb.timeline("created_at", cutoff);
    let (clause, mut params) = fb.build();

    let page = pagination_page(&state.catalog, &q);
    let table = state.store.qualify("events");
    let (limit_ph, offset_ph) = limit_offset_placeholders(&state.store, params.len());
    let sql = format!(
        "SELECT id, action_id, deduper, payload, sleep_until, created_at FROM {table}{clause} ORDER BY id LIMIT {limit_ph} OFFSET {offset_ph}"
    );
    params.push(QueryValue::Int(i64::from(page.pagination)));
    params.push(QueryValue::Int(i64::from((page.page - 1) * page.pagination)));
    Ok(Json(state.store.many(&sql, &params).await?))
}

async fn post_event(
    State(state): State<Arc<AppState>>,
    AppJson(envelope): AppJson<PublishEnvelope>,
) -> std::result::Result<(StatusCode, Json<Event>), ApiError> {
    let event = state.publisher.publish(envelope).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

// -- /v1/subscriptions -----------------------------------------------------

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
) -> std::result::Result<Json<Vec<Subscription>>, ApiError> {
    require_token(&state, &jar, &headers).await?;
    let filter = SubscriptionFilter {
        id: q.id,
        application_id: q.application_id,
        action_id: q.action_id,
        timeline: q.timeline.clone(),
    };
    let page = pagination_page(&state.catalog, &q);
    Ok(Json(state.catalog.list_subscriptions(&filter, page).await?))
}

#[derive(Debug, Deserialize)]
struct NewSubscription {
    application: String,
    secret: String,
    action: String,
    handler: String,
    max_retries: Option<i32>,
}

async fn post_subscription(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<NewSubscription>,
) -> std::result::Result<(StatusCode, Json<Subscription>), ApiError> {
    let sub = state
        .catalog
        .insert_subscription(&req.application, &req.secret, &req.action, &req.handler, req.max_retries)
        .await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

// -- /v1/gists ------------------------------------------------------------

#[derive(Debug, Serialize, sqlx::FromRow)]
struct GistOut {
    id: i64,
    event_id: i64,
    subscription_id: i64,
    completed: bool,
    retries: i32,
    sleep_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    action: String,
    endpoint: String,
}

async fn list_gists(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
    jar: CookieJar,
    headers: axum::http::HeaderMap,
) -> std::result::Result<Json<Vec<GistOut>>, ApiError> {
    require_token(&state, &jar, &headers).await?;
    let mut fb = amebo_store::FilterBuilder::new(state.store.is_postgres(), 1);
    fb.eq("g.id", q.id).eq("g.subscription_id", q.subscription_id);
    let cutoff = q
        .timeline
        .as_deref()
        .map(parse_timeline_cutoff)
        .transpose()?;
    fb.timeline("g.created_at", cutoff);
    let (clause, mut params) = fb.build();

    let page = pagination_page(&state.catalog, &q);
    let gists = state.store.qualify("gists");
    let events = state.store.qualify("events");
    let subscriptions = state.store.qualify("subscriptions");
    let actions = state.store.qualify("actions");
    let (limit_ph, offset_ph) = limit_offset_placeholders(&state.store, params.len());
    let sql = format!(
        "SELECT g.id AS id, g.event_id AS event_id, g.subscription_id AS subscription_id, \
         g.completed AS completed, g.retries AS retries, g.sleep_until AS sleep_until, \
         g.created_at AS created_at, a.name AS action, s.handler AS endpoint \
         FROM {gists} g \
         JOIN {events} e ON g.event_id = e.id \
         JOIN {subscriptions} s ON g.subscription_id = s.id \
         JOIN {actions} a ON e.action_id = a.id{clause} \
         ORDER BY g.id LIMIT {limit_ph} OFFSET {offset_ph}"
    );
    params.push(QueryValue::Int(i64::from(page.pagination)));
    params.push(QueryValue::Int(i64::from((page.page - 1) * page.pagination)));
    Ok(Json(state.store.many(&sql, &params).await?))
}

// -- /v1/regists/:id --------------------------------------------------------

#[derive(Debug, Serialize)]
struct RegistResponse {
    gist: i64,
    proxied: Option<Value>,
}

async fn post_regist(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> std::result::Result<(StatusCode, Json<RegistResponse>), ApiError> {
    let result = state.replayer.replay(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RegistResponse {
            gist: result.gist.id,
            proxied: result.proxied,
        }),
    ))
}

// -- shared helpers -----------------------------------------------------

fn parse_timeline_cutoff(raw: &str) -> Result<String> {
    let timeline = amebo_store::Timeline::parse(raw)
        .ok_or_else(|| Error::BadInput(format!("unknown timeline '{raw}'")))?;
    Ok((Utc::now() - chrono::Duration::days(timeline.days())).to_rfc3339())
}

fn limit_offset_placeholders(store: &Store, filter_params: usize) -> (String, String) {
    if store.is_postgres() {
        let limit = 1 + filter_params;
        (format!("${limit}"), format!("${}", limit + 1))
    } else {
        ("?".to_string(), "?".to_string())
    }
}
