//! fleetgrid-api — HTTP surface of FleetGrid.
//!
//! Two route families share one router: the device protocol that targets
//! poll, and a management API for operators.
//!
//! # Device routes
//!
//! All under `/{tenant}/controller/v1/{controllerId}`:
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `` | Poll; registers unknown targets |
//! | GET | `/deploymentBase/{actionId}` | Deployment instructions (`?actionHistory=N`) |
//! | POST | `/deploymentBase/{actionId}/feedback` | Deployment progress |
//! | GET | `/installedBase/{actionId}` | The installed deployment |
//! | GET | `/cancelAction/{actionId}` | Cancel instructions |
//! | POST | `/cancelAction/{actionId}/feedback` | Cancel progress |
//! | PUT | `/configData` | Device attributes |
//!
//! # Management routes
//!
//! All under `/rest/v1/{tenant}`:
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/distributionsets` | Create a distribution set |
//! | GET | `/distributionsets/{id}` | Get a distribution set |
//! | POST | `/targets` | Register a target |
//! | GET | `/targets/{controllerId}` | Get a target |
//! | POST | `/targets/{controllerId}/assignments` | Assign a distribution set |
//! | GET | `/targets/{controllerId}/actions` | List a target's actions |
//! | GET | `/actions/{actionId}` | Get an action |
//! | GET | `/actions/{actionId}/status` | Status history of an action |
//! | POST | `/actions/{actionId}/cancel` | Request cancellation |
//! | POST | `/actions/{actionId}/rejectCancel` | Reject a pending cancellation |
//! | GET, POST | `/rollouts` | List or create rollouts |
//! | GET, DELETE | `/rollouts/{id}` | Get or delete a rollout |
//! | GET | `/rollouts/{id}/groups` | Per-group action counts |
//! | POST | `/rollouts/{id}/{start,pause,resume,stop}` | Rollout lifecycle |

pub mod ddi;
pub mod extract;
pub mod handlers;
pub mod response;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};
use fleetgrid_ddi::DdiGateway;
use fleetgrid_deploy::DeploymentManager;
use fleetgrid_rollout::RolloutManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub gateway: DdiGateway,
    pub deployments: DeploymentManager,
    pub rollouts: RolloutManager,
}

impl ApiState {
    pub fn new(deployments: DeploymentManager, rollouts: RolloutManager) -> Self {
        Self {
            gateway: DdiGateway::new(deployments.clone()),
            deployments,
            rollouts,
        }
    }
}

/// Build the complete router (device protocol + management API).
pub fn build_router(state: ApiState) -> Router {
    const DEVICE: &str = "/{tenant}/controller/v1/{controller_id}";
    const MGMT: &str = "/rest/v1/{tenant}";

    let device_routes = Router::new()
        .route(DEVICE, get(ddi::poll))
        .route(&format!("{DEVICE}/deploymentBase/{{action_id}}"), get(ddi::deployment_base))
        .route(
            &format!("{DEVICE}/deploymentBase/{{action_id}}/feedback"),
            post(ddi::deployment_feedback),
        )
        .route(&format!("{DEVICE}/installedBase/{{action_id}}"), get(ddi::installed_base))
        .route(&format!("{DEVICE}/cancelAction/{{action_id}}"), get(ddi::cancel_action))
        .route(
            &format!("{DEVICE}/cancelAction/{{action_id}}/feedback"),
            post(ddi::cancel_feedback),
        )
        .route(&format!("{DEVICE}/configData"), put(ddi::config_data))
        .route_layer(middleware::from_fn(extract::require_json_accept));

    let mgmt_routes = Router::new()
        .route(&format!("{MGMT}/distributionsets"), post(handlers::create_distribution_set))
        .route(&format!("{MGMT}/distributionsets/{{id}}"), get(handlers::get_distribution_set))
        .route(&format!("{MGMT}/targets"), post(handlers::create_target))
        .route(&format!("{MGMT}/targets/{{controller_id}}"), get(handlers::get_target))
        .route(
            &format!("{MGMT}/targets/{{controller_id}}/assignments"),
            post(handlers::assign),
        )
        .route(
            &format!("{MGMT}/targets/{{controller_id}}/actions"),
            get(handlers::list_target_actions),
        )
        .route(&format!("{MGMT}/actions/{{id}}"), get(handlers::get_action))
        .route(&format!("{MGMT}/actions/{{id}}/status"), get(handlers::action_history))
        .route(&format!("{MGMT}/actions/{{id}}/cancel"), post(handlers::cancel_action))
        .route(&format!("{MGMT}/actions/{{id}}/rejectCancel"), post(handlers::reject_cancel))
        .route(
            &format!("{MGMT}/rollouts"),
            get(handlers::list_rollouts).post(handlers::create_rollout),
        )
        .route(
            &format!("{MGMT}/rollouts/{{id}}"),
            get(handlers::get_rollout).delete(handlers::delete_rollout),
        )
        .route(&format!("{MGMT}/rollouts/{{id}}/groups"), get(handlers::rollout_groups))
        .route(&format!("{MGMT}/rollouts/{{id}}/start"), post(handlers::start_rollout))
        .route(&format!("{MGMT}/rollouts/{{id}}/pause"), post(handlers::pause_rollout))
        .route(&format!("{MGMT}/rollouts/{{id}}/resume"), post(handlers::resume_rollout))
        .route(&format!("{MGMT}/rollouts/{{id}}/stop"), post(handlers::stop_rollout));

    Router::new()
        .merge(device_routes)
        .merge(mgmt_routes)
        .with_state(state)
}
