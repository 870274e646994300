//! Device-reported progress on an action.

use serde::{Deserialize, Serialize};

/// Where the device is in executing an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    Scheduled,
    Proceeding,
    Resumed,
    Download,
    Downloaded,
    Retrieved,
    Rejected,
    Canceled,
    Closed,
}

/// Outcome reported together with an execution value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishedResult {
    #[default]
    None,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub cnt: u32,
    pub of: u32,
}

/// One feedback call, independent of its wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub execution: Execution,
    pub finished: FinishedResult,
    pub code: Option<i32>,
    pub progress: Option<Progress>,
    pub messages: Vec<String>,
}

impl Feedback {
    pub fn new(execution: Execution, finished: FinishedResult) -> Self {
        Self {
            execution,
            finished,
            code: None,
            progress: None,
            messages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.messages = messages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Messages as stored in the status log, with progress prepended.
    pub fn log_messages(&self) -> Vec<String> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(progress) = self.progress {
            messages.push(format!("progress {}/{}", progress.cnt, progress.of));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}
