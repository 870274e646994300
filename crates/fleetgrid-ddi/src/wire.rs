//! JSON documents exchanged with devices.
//!
//! Field names follow the established DDI conventions (camelCase,
//! `_links` with `href`s, ids as strings).

use std::collections::BTreeMap;

use fleetgrid_deploy::{ConfigDataMode, Execution, Feedback, FinishedResult, Progress};
use fleetgrid_state::{Artifact, SoftwareModule, Status};
use serde::{Deserialize, Serialize};

use crate::handling::{HandlingType, MaintenanceWindowStatus};

// ── Poll ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerBase {
    pub config: ControllerConfig,
    #[serde(rename = "_links")]
    pub links: ControllerLinks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub polling: Polling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polling {
    /// `HH:mm:ss`
    pub sleep: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerLinks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_base: Option<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_action: Option<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_data: Option<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_base: Option<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

impl Link {
    pub fn new(href: impl Into<String>) -> Self {
        Self { href: href.into() }
    }
}

// ── Deployment ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentBase {
    pub id: String,
    pub deployment: DeploymentDirective,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_history: Option<ActionHistory>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDirective {
    pub download: HandlingType,
    pub update: HandlingType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_window: Option<MaintenanceWindowStatus>,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub part: String,
    pub name: String,
    pub version: String,
    pub artifacts: Vec<ChunkArtifact>,
}

impl From<&SoftwareModule> for Chunk {
    fn from(module: &SoftwareModule) -> Self {
        Self {
            part: module.part.clone(),
            name: module.name.clone(),
            version: module.version.clone(),
            artifacts: module.artifacts.iter().map(ChunkArtifact::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkArtifact {
    pub filename: String,
    pub size: u64,
    pub hashes: Hashes,
}

impl From<&Artifact> for ChunkArtifact {
    fn from(artifact: &Artifact) -> Self {
        Self {
            filename: artifact.filename.clone(),
            size: artifact.size,
            hashes: Hashes {
                sha256: artifact.sha256.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hashes {
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionHistory {
    pub status: Status,
    pub messages: Vec<String>,
}

// ── Cancel ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBase {
    pub id: String,
    pub cancel_action: CancelInstruction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInstruction {
    pub stop_id: String,
}

// ── Feedback ──────────────────────────────────────────────────────

/// Body of a deployment or cancel feedback call.
///
/// The action id travels in the path; an `id` member in the body is
/// accepted and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFeedback {
    pub status: FeedbackStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStatus {
    pub execution: Execution,
    pub result: FeedbackResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResult {
    #[serde(default)]
    pub finished: FinishedResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

impl ActionFeedback {
    pub fn new(execution: Execution, finished: FinishedResult) -> Self {
        Self {
            status: FeedbackStatus {
                execution,
                result: FeedbackResult {
                    finished,
                    progress: None,
                },
                code: None,
                details: Vec::new(),
            },
        }
    }

    pub fn into_feedback(self) -> Feedback {
        Feedback {
            execution: self.status.execution,
            finished: self.status.result.finished,
            code: self.status.code,
            progress: self.status.result.progress,
            messages: self.status.details,
        }
    }
}

// ── Config data ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    #[serde(default)]
    pub mode: ConfigDataMode,
    pub data: BTreeMap<String, String>,
}
