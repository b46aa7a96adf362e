use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered stages of the upload → validate → process → run workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStage {
    Upload,
    ParametersPending,
    Validated,
    Processing,
    ReadyToRun,
    Running,
    Finished,
}

impl WizardStage {
    pub fn label(self) -> &'static str {
        match self {
            WizardStage::Upload => "upload",
            WizardStage::ParametersPending => "params",
            WizardStage::Validated => "validated",
            WizardStage::Processing => "processing",
            WizardStage::ReadyToRun => "ready_to_run",
            WizardStage::Running => "running",
            WizardStage::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Testing,
    Training,
}

pub const DEFAULT_SAVE_FILENAME: &str = "processed_data";
pub const DEFAULT_SEGMENTS: u32 = 5;

/// User-chosen trim/segment inputs for validation and processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentParameters {
    pub trim_seconds: f64,
    pub y_segments: u32,
}

impl Default for SegmentParameters {
    fn default() -> Self {
        Self {
            trim_seconds: 0.0,
            y_segments: DEFAULT_SEGMENTS,
        }
    }
}

impl SegmentParameters {
    /// Defaults applied right after an upload: no trim, at most five segments.
    pub fn for_upload(max_possible_segments: u64) -> Self {
        let capped = max_possible_segments.min(u64::from(DEFAULT_SEGMENTS));
        Self {
            trim_seconds: 0.0,
            y_segments: capped as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Line,
    Completed,
    Error,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(kind: LogKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    pub fn line(text: impl Into<String>) -> Self {
        Self::new(LogKind::Line, text)
    }
}

/// Readiness of the server-held session, derived from a `/debug_session` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionReadiness {
    Ready { client_id: String },
    NotReady { reason: String },
    Unreachable { reason: String },
}

impl SessionReadiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionReadiness::Ready { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            SessionReadiness::Ready { client_id } => format!("session ready (client {client_id})"),
            SessionReadiness::NotReady { reason } => format!("session not ready: {reason}"),
            SessionReadiness::Unreachable { reason } => {
                format!("session check failed: {reason}")
            }
        }
    }
}
