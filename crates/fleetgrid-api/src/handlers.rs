//! Management API handlers.
//!
//! Each handler calls into the deployment or rollout manager and returns
//! the result in the [`ApiResponse`](crate::response) envelope.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use fleetgrid_deploy::{AssignOutcome, AssignmentRequest};
use fleetgrid_rollout::{RolloutCreate, TotalTargetCountStatus};
use fleetgrid_state::{DistributionSet, SoftwareModule};
use fleet_core::ErrorKind;
use serde::Deserialize;

use crate::ApiState;
use crate::extract::JsonBody;
use crate::response::{ApiResponse, error_response, failure};

fn parse_id(raw: &str, what: &str) -> Result<u64, Response> {
    raw.parse()
        .map_err(|_| error_response(&format!("{what} not found: {raw}"), StatusCode::NOT_FOUND))
}

macro_rules! id_or_return {
    ($raw:expr, $what:expr) => {
        match parse_id(&$raw, $what) {
            Ok(id) => id,
            Err(resp) => return resp,
        }
    };
}

// ── Distribution sets ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NewDistributionSet {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub modules: Vec<SoftwareModule>,
}

/// POST /rest/v1/{tenant}/distributionsets
pub async fn create_distribution_set(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
    JsonBody(req): JsonBody<NewDistributionSet>,
) -> Response {
    if req.name.trim().is_empty() || req.version.trim().is_empty() {
        return error_response("name and version are required", StatusCode::BAD_REQUEST);
    }
    let ds = DistributionSet {
        id: 0,
        tenant,
        name: req.name,
        version: req.version,
        modules: req.modules,
        created_at: Utc::now(),
    };
    match state.deployments.store().create_distribution_set(ds) {
        Ok(ds) => (StatusCode::CREATED, ApiResponse::ok(ds)).into_response(),
        Err(e) => failure(ErrorKind::Internal, &e),
    }
}

/// GET /rest/v1/{tenant}/distributionsets/{id}
pub async fn get_distribution_set(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "distribution set");
    match state.deployments.store().get_distribution_set(&tenant, id) {
        Ok(Some(ds)) => ApiResponse::ok(ds).into_response(),
        Ok(None) => error_response("distribution set not found", StatusCode::NOT_FOUND),
        Err(e) => failure(ErrorKind::Internal, &e),
    }
}

// ── Targets ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NewTarget {
    pub controller_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// POST /rest/v1/{tenant}/targets
pub async fn create_target(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
    JsonBody(req): JsonBody<NewTarget>,
) -> Response {
    if req.controller_id.trim().is_empty() {
        return error_response("controller_id is required", StatusCode::BAD_REQUEST);
    }
    match state
        .deployments
        .create_target(&tenant, &req.controller_id, req.attributes, Utc::now())
    {
        Ok(target) => (StatusCode::CREATED, ApiResponse::ok(target)).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// GET /rest/v1/{tenant}/targets/{controllerId}
pub async fn get_target(
    State(state): State<ApiState>,
    Path((tenant, controller_id)): Path<(String, String)>,
) -> Response {
    match state.deployments.target(&tenant, &controller_id) {
        Ok(target) => ApiResponse::ok(target).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// POST /rest/v1/{tenant}/targets/{controllerId}/assignments
pub async fn assign(
    State(state): State<ApiState>,
    Path((tenant, controller_id)): Path<(String, String)>,
    JsonBody(req): JsonBody<AssignmentRequest>,
) -> Response {
    match state
        .deployments
        .assign(&tenant, &controller_id, &req, Utc::now())
    {
        Ok(AssignOutcome::Assigned { action, canceled }) => (
            StatusCode::CREATED,
            ApiResponse::ok(serde_json::json!({
                "action": action,
                "canceled": canceled,
            })),
        )
            .into_response(),
        Ok(AssignOutcome::AlreadyAssigned { action_id }) => error_response(
            &format!("distribution set already assigned by action {action_id}"),
            StatusCode::CONFLICT,
        ),
        Err(e) => failure(e.kind(), &e),
    }
}

/// GET /rest/v1/{tenant}/targets/{controllerId}/actions
pub async fn list_target_actions(
    State(state): State<ApiState>,
    Path((tenant, controller_id)): Path<(String, String)>,
) -> Response {
    match state.deployments.actions(&tenant, &controller_id) {
        Ok(actions) => ApiResponse::ok(actions).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

// ── Actions ────────────────────────────────────────────────────

/// GET /rest/v1/{tenant}/actions/{actionId}
pub async fn get_action(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "action");
    match state.deployments.action(&tenant, id) {
        Ok(action) => ApiResponse::ok(action).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// GET /rest/v1/{tenant}/actions/{actionId}/status
pub async fn action_history(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "action");
    let history = state
        .deployments
        .action(&tenant, id)
        .and_then(|_| state.deployments.history(id));
    match history {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// POST /rest/v1/{tenant}/actions/{actionId}/cancel
pub async fn cancel_action(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "action");
    match state.deployments.cancel(&tenant, id, Utc::now()) {
        Ok(cancel) => (StatusCode::CREATED, ApiResponse::ok(cancel)).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// POST /rest/v1/{tenant}/actions/{actionId}/rejectCancel
///
/// `actionId` names the cancel-action.
pub async fn reject_cancel(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "action");
    match state.deployments.reject_cancel(&tenant, id, Utc::now()) {
        Ok(cancel) => ApiResponse::ok(cancel).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

// ── Rollouts ───────────────────────────────────────────────────

/// GET /rest/v1/{tenant}/rollouts
pub async fn list_rollouts(State(state): State<ApiState>, Path(tenant): Path<String>) -> Response {
    match state.rollouts.list(&tenant) {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// POST /rest/v1/{tenant}/rollouts
pub async fn create_rollout(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
    JsonBody(req): JsonBody<RolloutCreate>,
) -> Response {
    match state.rollouts.create(&tenant, &req, Utc::now()) {
        Ok(detail) => (StatusCode::CREATED, ApiResponse::ok(detail)).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// GET /rest/v1/{tenant}/rollouts/{id}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "rollout");
    match state.rollouts.get(&tenant, id) {
        Ok(detail) => ApiResponse::ok(detail).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// DELETE /rest/v1/{tenant}/rollouts/{id}
pub async fn delete_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "rollout");
    match state.rollouts.delete(&tenant, id) {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// GET /rest/v1/{tenant}/rollouts/{id}/groups
pub async fn rollout_groups(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "rollout");
    match state.rollouts.group_counts(&tenant, id) {
        Ok(groups) => {
            let mut total = TotalTargetCountStatus::default();
            for g in &groups {
                total.merge(&g.counts);
            }
            ApiResponse::ok(serde_json::json!({
                "total": total,
                "groups": groups,
            }))
            .into_response()
        }
        Err(e) => failure(e.kind(), &e),
    }
}

/// POST /rest/v1/{tenant}/rollouts/{id}/start
pub async fn start_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "rollout");
    match state.rollouts.start(&tenant, id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// POST /rest/v1/{tenant}/rollouts/{id}/pause
pub async fn pause_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "rollout");
    match state.rollouts.pause(&tenant, id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// POST /rest/v1/{tenant}/rollouts/{id}/resume
pub async fn resume_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "rollout");
    match state.rollouts.resume(&tenant, id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

/// POST /rest/v1/{tenant}/rollouts/{id}/stop
pub async fn stop_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(String, String)>,
) -> Response {
    let id = id_or_return!(id, "rollout");
    match state.rollouts.stop(&tenant, id, Utc::now()) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => failure(e.kind(), &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, header};
    use fleet_core::FleetConfig;
    use fleetgrid_deploy::DeploymentManager;
    use fleetgrid_rollout::{RolloutManager, StoreTargetSelector};
    use fleetgrid_state::StateStore;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::build_router;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let config = Arc::new(FleetConfig::default());
        let deployments = DeploymentManager::new(store.clone(), config.clone());
        let selector = Arc::new(StoreTargetSelector::new(store.clone()));
        let rollouts = RolloutManager::new(store, config, selector);
        ApiState::new(deployments, rollouts)
    }

    async fn call(state: &ApiState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn seed(state: &ApiState) {
        let (status, _) = call(
            state,
            "POST",
            "/rest/v1/acme/distributionsets",
            Some(json!({"name": "firmware", "version": "2.0"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        for id in ["dev-1", "dev-2"] {
            let (status, _) = call(
                state,
                "POST",
                "/rest/v1/acme/targets",
                Some(json!({"controller_id": id})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
    }

    #[tokio::test]
    async fn target_registration() {
        let state = test_state();
        seed(&state).await;

        let (status, body) = call(&state, "GET", "/rest/v1/acme/targets/dev-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["controller_id"], "dev-1");

        let (status, _) = call(
            &state,
            "POST",
            "/rest/v1/acme/targets",
            Some(json!({"controller_id": "dev-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&state, "GET", "/rest/v1/other/targets/dev-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn assign_cancel_and_reject() {
        let state = test_state();
        seed(&state).await;

        let (status, body) = call(
            &state,
            "POST",
            "/rest/v1/acme/targets/dev-1/assignments",
            Some(json!({"distribution_set": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let action_id = body["data"]["action"]["id"].as_u64().unwrap();

        let (status, _) = call(
            &state,
            "POST",
            "/rest/v1/acme/targets/dev-1/assignments",
            Some(json!({"distribution_set": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &state,
            "POST",
            &format!("/rest/v1/acme/actions/{action_id}/cancel"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let cancel_id = body["data"]["id"].as_u64().unwrap();

        let (status, body) = call(
            &state,
            "POST",
            &format!("/rest/v1/acme/actions/{cancel_id}/rejectCancel"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "CANCEL_REJECTED");

        let (_, body) = call(&state, "GET", &format!("/rest/v1/acme/actions/{action_id}"), None).await;
        assert_eq!(body["data"]["status"], "RUNNING");

        let (status, body) = call(
            &state,
            "GET",
            &format!("/rest/v1/acme/actions/{action_id}/status"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn assignment_validation() {
        let state = test_state();
        seed(&state).await;

        let (status, _) = call(
            &state,
            "POST",
            "/rest/v1/acme/targets/dev-1/assignments",
            Some(json!({"distribution_set": 1, "weight": 5000})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            "POST",
            "/rest/v1/acme/targets/dev-1/assignments",
            Some(json!({"distribution_set": 99})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&state, "GET", "/rest/v1/acme/actions/abc", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rollout_lifecycle() {
        let state = test_state();
        seed(&state).await;

        let (status, body) = call(
            &state,
            "POST",
            "/rest/v1/acme/rollouts",
            Some(json!({
                "name": "wave",
                "target_filter": "dev-*",
                "distribution_set": 1,
                "amount_groups": 2,
                "error_condition": {"kind": "THRESHOLD", "expression": "50"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["status"], "READY");
        assert_eq!(body["data"]["groups"].as_array().unwrap().len(), 2);
        let id = body["data"]["id"].as_u64().unwrap();

        let (status, body) = call(&state, "POST", &format!("/rest/v1/acme/rollouts/{id}/start"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "RUNNING");

        let (status, _) = call(&state, "POST", &format!("/rest/v1/acme/rollouts/{id}/start"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&state, "GET", &format!("/rest/v1/acme/rollouts/{id}/groups"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"]["total"], 2);

        let (status, _) = call(&state, "DELETE", &format!("/rest/v1/acme/rollouts/{id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&state, "POST", &format!("/rest/v1/acme/rollouts/{id}/stop"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, "DELETE", &format!("/rest/v1/acme/rollouts/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&state, "GET", "/rest/v1/acme/rollouts", None).await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_rollout_request() {
        let state = test_state();
        seed(&state).await;
        let (status, _) = call(
            &state,
            "POST",
            "/rest/v1/acme/rollouts",
            Some(json!({"name": "x", "target_filter": "*", "distribution_set": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            "POST",
            "/rest/v1/acme/rollouts",
            Some(json!({"name": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
