//! Result payloads returned by [`StandaloneDapBackend`](crate::StandaloneDapBackend) operations.

use crate::tracker::{FrameInfo, OutputLine, StopInfo, ThreadInfo, TrackedBreakpoint, VariableInfo};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub state: String,
    pub language: String,
    pub program: String,
    pub request: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<FrameInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_log: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub adapter: String,
}

/// Outcome of continue/step: where execution paused, or that it ended.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<FrameInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartResult {
    /// `native` when the adapter restarted itself, `relaunch` otherwise.
    pub mode: String,
    pub state: String,
    pub breakpoints_restored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<FrameInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakpointResult {
    pub breakpoint: TrackedBreakpoint,
    pub relocated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveBreakpointResult {
    pub removed: bool,
    pub file: String,
    pub line: u32,
    pub remaining: Vec<TrackedBreakpoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakpointList {
    pub breakpoints: Vec<TrackedBreakpoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub active: bool,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<FrameInfo>,
    pub threads: Vec<ThreadInfo>,
    pub breakpoints: Vec<TrackedBreakpoint>,
    pub recent_output: Vec<OutputLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

impl StatusReport {
    pub fn idle() -> Self {
        Self {
            active: false,
            state: "idle".to_string(),
            error: None,
            language: None,
            program: None,
            adapter_pid: None,
            stop: None,
            location: None,
            threads: Vec::new(),
            breakpoints: Vec::new(),
            recent_output: Vec::new(),
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariablesResult {
    pub scope: String,
    pub thread_id: i64,
    pub frame_id: i64,
    pub variables: Vec<VariableInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub expression: String,
    pub result: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackTraceResult {
    pub thread_id: i64,
    pub frames: Vec<FrameInfo>,
}
