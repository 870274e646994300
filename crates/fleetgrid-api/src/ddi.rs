//! Device protocol handlers.
//!
//! Bodies are the bare DDI documents from [`fleetgrid_ddi::wire`]; only
//! failures use the API envelope.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use fleetgrid_ddi::wire::{ActionFeedback, ConfigData};
use fleetgrid_ddi::{DdiError, Tagged};
use fleetgrid_state::ActionId;
use serde::{Deserialize, Serialize};

use crate::ApiState;
use crate::extract::{JsonBody, PeerAddr};
use crate::response::{error_response, failure};

type DevicePath = Path<(String, String)>;
type ActionPath = Path<(String, String, String)>;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(rename = "actionHistory")]
    action_history: Option<i64>,
}

fn ddi_failure(e: &DdiError) -> Response {
    failure(e.kind(), e)
}

/// Ids that are not numbers cannot name an action.
fn parse_action_id(raw: &str) -> Result<ActionId, Response> {
    raw.parse()
        .map_err(|_| error_response(&format!("action not found: {raw}"), StatusCode::NOT_FOUND))
}

/// Quoted entity tag for a document validator.
fn entity_tag(etag: &str) -> String {
    format!("\"{etag}\"")
}

fn if_none_match(headers: &HeaderMap, tag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate == tag || candidate.strip_prefix("W/") == Some(tag))
}

/// 200 with the document and its ETag, or 304 when the client already has it.
fn tagged_response<T: Serialize>(headers: &HeaderMap, doc: Tagged<T>) -> Response {
    let tag = entity_tag(&doc.etag);
    let Ok(value) = HeaderValue::from_str(&tag) else {
        return Json(doc.body).into_response();
    };
    if if_none_match(headers, &tag) {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, value)]).into_response();
    }
    (StatusCode::OK, [(header::ETAG, value)], Json(doc.body)).into_response()
}

/// GET /{tenant}/controller/v1/{controllerId}
pub async fn poll(
    State(state): State<ApiState>,
    Path((tenant, controller_id)): DevicePath,
    PeerAddr(address): PeerAddr,
    headers: HeaderMap,
) -> Response {
    match state
        .gateway
        .poll(&tenant, &controller_id, address.as_deref(), Utc::now())
    {
        Ok(doc) => tagged_response(&headers, doc),
        Err(e) => ddi_failure(&e),
    }
}

/// GET /{tenant}/controller/v1/{controllerId}/deploymentBase/{actionId}
pub async fn deployment_base(
    State(state): State<ApiState>,
    Path((tenant, controller_id, action_id)): ActionPath,
    query: Result<Query<HistoryQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return error_response(&e.body_text(), StatusCode::BAD_REQUEST),
    };
    let action_id = match parse_action_id(&action_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.gateway.deployment_base(
        &tenant,
        &controller_id,
        action_id,
        query.action_history,
        Utc::now(),
    ) {
        Ok(doc) => tagged_response(&headers, doc),
        Err(e) => ddi_failure(&e),
    }
}

/// GET /{tenant}/controller/v1/{controllerId}/installedBase/{actionId}
pub async fn installed_base(
    State(state): State<ApiState>,
    Path((tenant, controller_id, action_id)): ActionPath,
    query: Result<Query<HistoryQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return error_response(&e.body_text(), StatusCode::BAD_REQUEST),
    };
    let action_id = match parse_action_id(&action_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.gateway.installed_base(
        &tenant,
        &controller_id,
        action_id,
        query.action_history,
        Utc::now(),
    ) {
        Ok(doc) => tagged_response(&headers, doc),
        Err(e) => ddi_failure(&e),
    }
}

/// POST /{tenant}/controller/v1/{controllerId}/deploymentBase/{actionId}/feedback
pub async fn deployment_feedback(
    State(state): State<ApiState>,
    Path((tenant, controller_id, action_id)): ActionPath,
    JsonBody(body): JsonBody<ActionFeedback>,
) -> Response {
    let action_id = match parse_action_id(&action_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state
        .gateway
        .deployment_feedback(&tenant, &controller_id, action_id, body, Utc::now())
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => ddi_failure(&e),
    }
}

/// GET /{tenant}/controller/v1/{controllerId}/cancelAction/{actionId}
pub async fn cancel_action(
    State(state): State<ApiState>,
    Path((tenant, controller_id, action_id)): ActionPath,
    headers: HeaderMap,
) -> Response {
    let action_id = match parse_action_id(&action_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.gateway.cancel_action(&tenant, &controller_id, action_id) {
        Ok(doc) => tagged_response(&headers, doc),
        Err(e) => ddi_failure(&e),
    }
}

/// POST /{tenant}/controller/v1/{controllerId}/cancelAction/{actionId}/feedback
pub async fn cancel_feedback(
    State(state): State<ApiState>,
    Path((tenant, controller_id, action_id)): ActionPath,
    JsonBody(body): JsonBody<ActionFeedback>,
) -> Response {
    let action_id = match parse_action_id(&action_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state
        .gateway
        .cancel_feedback(&tenant, &controller_id, action_id, body, Utc::now())
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => ddi_failure(&e),
    }
}

/// PUT /{tenant}/controller/v1/{controllerId}/configData
pub async fn config_data(
    State(state): State<ApiState>,
    Path((tenant, controller_id)): DevicePath,
    JsonBody(body): JsonBody<ConfigData>,
) -> Response {
    match state
        .gateway
        .config_data(&tenant, &controller_id, body, Utc::now())
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => ddi_failure(&e),
    }
}
