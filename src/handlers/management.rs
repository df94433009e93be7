//! Management surface (§6): read-only queries and mutators over endpoints,
//! groups, configuration, and usage history.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::handlers::AppState;
use crate::tracking::UsageFilter;

#[derive(Debug, Serialize)]
pub struct EndpointView {
    pub name: String,
    pub group: String,
    pub priority: u32,
    pub healthy: bool,
    pub never_checked: bool,
    pub last_check: Option<chrono::DateTime<chrono::Utc>>,
    pub last_response_time_ms: Option<u64>,
    pub in_cooldown: bool,
}

pub async fn list_endpoints(State(state): State<AppState>) -> Json<Vec<EndpointView>> {
    let mut out = Vec::new();
    for endpoint in state.registry().list() {
        let status = endpoint.snapshot().await;
        out.push(EndpointView {
            name: status.name,
            group: status.group,
            priority: status.priority,
            healthy: status.healthy,
            never_checked: status.never_checked,
            last_check: status.last_check,
            last_response_time_ms: status.last_response_time_ms,
            in_cooldown: status.in_cooldown,
        });
    }
    Json(out)
}

#[derive(Debug, Deserialize)]
pub struct PriorityUpdate {
    pub priority: u32,
}

pub async fn update_priority(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<PriorityUpdate>,
) -> Response {
    match state.registry().set_priority(&name, body.priority).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Validation(e).into_response(),
    }
}

pub async fn trigger_health_check(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let client = reqwest::Client::new();
    match state.registry().check_now(&client, &name).await {
        Ok(healthy) => Json(serde_json::json!({ "name": name, "healthy": healthy })).into_response(),
        Err(e) => AppError::Validation(e).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub name: String,
    pub priority: u32,
    pub paused: bool,
    pub force_activated: bool,
    pub in_cooldown: bool,
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
}

impl From<crate::groups::GroupStatus> for GroupView {
    fn from(s: crate::groups::GroupStatus) -> Self {
        Self {
            name: s.name,
            priority: s.priority,
            paused: s.paused,
            force_activated: s.force_activated,
            in_cooldown: s.in_cooldown,
            healthy_endpoints: s.healthy_endpoints,
            total_endpoints: s.total_endpoints,
        }
    }
}

pub async fn list_groups(State(state): State<AppState>) -> Json<Vec<GroupView>> {
    Json(state.groups().all_statuses().await.into_iter().map(GroupView::from).collect())
}

pub async fn pause_group(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    state.groups().pause(&name).await;
    StatusCode::NO_CONTENT
}

pub async fn resume_group(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    state.groups().resume(&name).await;
    StatusCode::NO_CONTENT
}

pub async fn force_activate_group(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    state.groups().force_activate(&name).await;
    StatusCode::NO_CONTENT
}

pub async fn read_config(State(state): State<AppState>) -> Json<crate::config::Config> {
    Json(state.config().clone())
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub start_ts: Option<String>,
    pub end_ts: Option<String>,
    pub status: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

impl From<UsageQuery> for UsageFilter {
    fn from(q: UsageQuery) -> Self {
        Self {
            start_ts: q.start_ts,
            end_ts: q.end_ts,
            status: q.status,
            model: q.model,
            endpoint: q.endpoint,
            group: q.group,
            limit: q.limit,
            offset: q.offset,
        }
    }
}

pub async fn query_usage(State(state): State<AppState>, Query(query): Query<UsageQuery>) -> Response {
    match state.tracker().query(query.into()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => AppError::Internal(e).into_response(),
    }
}

pub async fn export_usage_csv(State(state): State<AppState>, Query(query): Query<UsageQuery>) -> Response {
    match state.tracker().export_csv(query.into()).await {
        Ok(csv) => ([("content-type", "text/csv")], csv).into_response(),
        Err(e) => AppError::Internal(e).into_response(),
    }
}

pub async fn export_usage_json(State(state): State<AppState>, Query(query): Query<UsageQuery>) -> Response {
    match state.tracker().export_json(query.into()).await {
        Ok(json) => ([("content-type", "application/json")], json).into_response(),
        Err(e) => AppError::Internal(e).into_response(),
    }
}
