use crate::diode::{ProxyRegistry, ProxyStatus};
use crate::events::{Category, EventEntry, EventLog};
use crate::filetransfer::StagingArea;
use crate::groups::{GroupError, GroupManager, ObservationBoard};
use crate::model::Observation;
use crate::retention::{CacheInfo, CacheItem, RetentionIndex};
use crate::settings::{Setting, SettingsStore};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub index: Arc<RetentionIndex>,
    pub staging: StagingArea,
    pub proxies: Arc<ProxyRegistry>,
    pub settings: SettingsStore,
    pub groups: Arc<GroupManager>,
    pub board: ObservationBoard,
    pub events: EventLog,
}

type HttpResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Debug, Deserialize)]
struct ResendRequest {
    items: Vec<CacheItem>,
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    queued: usize,
}

#[derive(Debug, Deserialize)]
struct ReplayRequest {
    filename: String,
}

#[derive(Debug, Serialize)]
struct ReplayResponse {
    sent: usize,
}

#[derive(Debug, Serialize)]
struct SettingResponse {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SettingUpdate {
    value: String,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    accepted: usize,
}

#[derive(Debug, Serialize)]
struct GroupResponse {
    group: String,
    running: bool,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn group_status(err: &GroupError) -> StatusCode {
    match err {
        GroupError::Unknown(_) => StatusCode::NOT_FOUND,
        GroupError::AlreadyRunning(_) | GroupError::NotRunning(_) => StatusCode::CONFLICT,
        GroupError::NoTags(_) => StatusCode::BAD_REQUEST,
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_cache(State(state): State<HttpState>) -> HttpResult<CacheInfo> {
    let index = state.index.clone();
    let info = tokio::task::spawn_blocking(move || index.refresh())
        .await
        .map_err(internal)?
        .map_err(internal)?;
    Ok(Json(info))
}

async fn post_resend(
    State(state): State<HttpState>,
    Json(payload): Json<ResendRequest>,
) -> HttpResult<QueuedResponse> {
    let queued = tokio::task::spawn_blocking(move || {
        state
            .index
            .resend(&payload.items, &state.staging, &state.proxies)
    })
    .await
    .map_err(internal)?;
    Ok(Json(QueuedResponse { queued }))
}

async fn post_send_all(State(state): State<HttpState>) -> HttpResult<QueuedResponse> {
    if state.proxies.is_empty() {
        return Ok(Json(QueuedResponse { queued: 0 }));
    }
    let index = state.index.clone();
    let staging = state.staging.clone();
    let queued = tokio::task::spawn_blocking(move || index.send_all(&staging))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    state.events.log(
        Category::Info,
        "Cache send all",
        format!("{queued} cache files queued for transfer"),
    );
    Ok(Json(QueuedResponse { queued }))
}

async fn post_replay(
    State(state): State<HttpState>,
    Json(payload): Json<ReplayRequest>,
) -> HttpResult<ReplayResponse> {
    let sent = state
        .index
        .replay(&payload.filename, &state.proxies)
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    Ok(Json(ReplayResponse { sent }))
}

async fn list_settings(State(state): State<HttpState>) -> Json<BTreeMap<String, Setting>> {
    Json(state.settings.all())
}

async fn get_setting(
    State(state): State<HttpState>,
    Path(key): Path<String>,
) -> HttpResult<SettingResponse> {
    let value = state
        .settings
        .get(&key)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown setting {key}")))?;
    Ok(Json(SettingResponse { key, value }))
}

async fn put_setting(
    State(state): State<HttpState>,
    Path(key): Path<String>,
    Json(payload): Json<SettingUpdate>,
) -> HttpResult<SettingResponse> {
    state
        .settings
        .put(&key, &payload.value)
        .map_err(internal)?;
    state.events.log(
        Category::Info,
        "Setting changed",
        format!("{key} = {}", payload.value),
    );
    Ok(Json(SettingResponse {
        key,
        value: payload.value,
    }))
}

async fn post_observations(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    Json(payload): Json<HashMap<String, Observation>>,
) -> HttpResult<AcceptedResponse> {
    if !state.groups.configs().any(|g| g.name == name) {
        return Err((StatusCode::NOT_FOUND, format!("unknown group {name}")));
    }
    let accepted = state.board.record(&name, payload);
    Ok(Json(AcceptedResponse { accepted }))
}

async fn list_groups(State(state): State<HttpState>) -> Json<Vec<GroupResponse>> {
    let groups = state
        .groups
        .configs()
        .map(|g| GroupResponse {
            group: g.name.clone(),
            running: state.groups.is_running(&g.name),
        })
        .collect();
    Json(groups)
}

async fn post_group_start(
    State(state): State<HttpState>,
    Path(name): Path<String>,
) -> HttpResult<GroupResponse> {
    state
        .groups
        .start(&name)
        .map_err(|err| (group_status(&err), err.to_string()))?;
    Ok(Json(GroupResponse {
        group: name,
        running: true,
    }))
}

async fn post_group_stop(
    State(state): State<HttpState>,
    Path(name): Path<String>,
) -> HttpResult<GroupResponse> {
    state
        .groups
        .stop(&name)
        .await
        .map_err(|err| (group_status(&err), err.to_string()))?;
    Ok(Json(GroupResponse {
        group: name,
        running: false,
    }))
}

async fn get_proxies(State(state): State<HttpState>) -> Json<Vec<ProxyStatus>> {
    Json(state.proxies.statuses())
}

async fn get_proxy(
    State(state): State<HttpState>,
    Path(id): Path<u32>,
) -> HttpResult<ProxyStatus> {
    let proxy = state
        .proxies
        .get(id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown proxy {id}")))?;
    Ok(Json(proxy.status()))
}

async fn get_events(
    State(state): State<HttpState>,
    Query(query): Query<EventsQuery>,
) -> HttpResult<Vec<EventEntry>> {
    let events = state.events.clone();
    let limit = query.limit.unwrap_or(100);
    let entries = tokio::task::spawn_blocking(move || events.recent(limit))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    Ok(Json(entries))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/cache", get(get_cache))
        .route("/v1/cache/resend", post(post_resend))
        .route("/v1/cache/send-all", post(post_send_all))
        .route("/v1/cache/replay", post(post_replay))
        .route("/v1/settings", get(list_settings))
        .route("/v1/settings/{key}", get(get_setting).put(put_setting))
        .route("/v1/groups", get(list_groups))
        .route("/v1/groups/{name}/observations", post(post_observations))
        .route("/v1/groups/{name}/start", post(post_group_start))
        .route("/v1/groups/{name}/stop", post(post_group_stop))
        .route("/v1/proxies", get(get_proxies))
        .route("/v1/proxies/{id}", get(get_proxy))
        .route("/v1/events", get(get_events))
        .with_state(state)
}
