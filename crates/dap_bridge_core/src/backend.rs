//! Standalone debugging backend
//!
//! Sequences the protocol client, process manager and state tracker into the
//! high-level debugging operations. One session is active at a time; starting
//! a new one tears the previous one down first.
//!
//! Every public operation runs under the configured operation deadline. Resume
//! operations (continue, step, restart) hold the session's resume slot until the
//! adapter reports the next stop, so a second resume or any read fails fast with
//! `OperationInProgress` instead of racing the pending stop.

use crate::client::EventListener;
use crate::config::{language_for_path, DebugConfig, RequestKind};
use crate::process::{AdapterProcess, DebugAdapterManager, ProcessState, SessionRequest};
use crate::protocol::{
    EvaluateResponseBody, Event, ScopesResponseBody, SetBreakpointsArguments,
    SetBreakpointsResponseBody, Source, SourceBreakpoint, StackTraceResponseBody,
    ThreadsResponseBody, VariablesResponseBody,
};
use crate::tracker::{
    DebugStateTracker, FrameInfo, RunState, RunStatus, ScopeInfo, TrackedBreakpoint,
    VariableInfo,
};
use crate::types::{
    BreakpointList, BreakpointResult, EvaluationResult, ExecutionResult, RemoveBreakpointResult,
    RestartResult, StackTraceResult, StartResult, StatusReport, StopResult, VariablesResult,
};
use crate::{DapError, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STATUS_OUTPUT_LINES: usize = 20;
const DEFAULT_SCOPE: &str = "local";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartParams {
    pub file_path: String,
    pub working_directory: Option<String>,
    pub configuration_name: Option<String>,
}

impl StartParams {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            ..Default::default()
        }
    }
}

struct ResolvedStart {
    language: String,
    program: PathBuf,
    cwd: PathBuf,
    request: SessionRequest,
}

struct DebugSession {
    language: String,
    program: PathBuf,
    cwd: PathBuf,
    params: StartParams,
    request: SessionRequest,
    process: Arc<AdapterProcess>,
    tracker: Arc<DebugStateTracker>,
    resume_slot: Mutex<Option<&'static str>>,
    breakpoint_lock: tokio::sync::Mutex<()>,
    watcher: JoinHandle<()>,
}

struct ResumeGuard<'a> {
    slot: &'a Mutex<Option<&'static str>>,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl DebugSession {
    fn claim_resume(&self, operation: &'static str) -> Result<ResumeGuard<'_>> {
        let mut slot = self
            .resume_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = *slot {
            return Err(DapError::OperationInProgress {
                operation: current.to_string(),
            });
        }
        *slot = Some(operation);
        Ok(ResumeGuard {
            slot: &self.resume_slot,
        })
    }

    /// Reads are refused while a resume is about to invalidate what they return.
    fn ensure_no_resume(&self) -> Result<()> {
        match *self
            .resume_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(current) => Err(DapError::OperationInProgress {
                operation: current.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn require_stopped(&self) -> Result<()> {
        match self.tracker.run_state() {
            RunState::Stopped(_) => Ok(()),
            other => Err(DapError::NotStopped {
                state: other.as_str().to_string(),
            }),
        }
    }

    fn source_path(&self, file: &str) -> String {
        let path = Path::new(file);
        if path.is_absolute() {
            file.to_string()
        } else {
            self.cwd.join(path).to_string_lossy().into_owned()
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// A launch that never reached a session, kept so status can report why.
struct FailedLaunch {
    language: String,
    program: PathBuf,
    tracker: Arc<DebugStateTracker>,
}

pub struct StandaloneDapBackend {
    config: Arc<DebugConfig>,
    manager: DebugAdapterManager,
    session: RwLock<Option<Arc<DebugSession>>>,
    failed_launch: RwLock<Option<FailedLaunch>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl StandaloneDapBackend {
    pub fn new(config: DebugConfig) -> Self {
        let config = Arc::new(config);
        Self {
            manager: DebugAdapterManager::new(config.clone()),
            config,
            session: RwLock::new(None),
            failed_launch: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    async fn with_deadline<T>(
        &self,
        operation: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = match tokio::time::timeout(self.config.timeouts.operation(), work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation,
                    "Operation exceeded {}ms deadline", self.config.timeouts.operation_ms
                );
                Err(DapError::RequestTimeout {
                    command: operation.to_string(),
                    seq: None,
                })
            }
        };

        if let Err(e) = &result {
            if e.is_fatal() {
                if let Some(session) = self.session.read().await.clone() {
                    session.tracker.mark_failed(e.to_string());
                }
            }
        }
        result
    }

    async fn current_session(&self) -> Option<Arc<DebugSession>> {
        self.session.read().await.clone()
    }

    async fn active_session(&self) -> Result<Arc<DebugSession>> {
        let session = self
            .current_session()
            .await
            .ok_or(DapError::NoActiveSession)?;
        if !session.tracker.run_state().is_active() {
            return Err(DapError::NoActiveSession);
        }
        Ok(session)
    }

    // --- Lifecycle ---

    pub async fn start_debugging(&self, params: StartParams) -> Result<StartResult> {
        self.with_deadline("start_debugging", async {
            let _lifecycle = self.lifecycle.lock().await;
            self.start_locked(params).await.map(|(_, result)| result)
        })
        .await
    }

    async fn start_locked(&self, params: StartParams) -> Result<(Arc<DebugSession>, StartResult)> {
        self.failed_launch.write().await.take();
        let previous = self.session.write().await.take();
        if let Some(previous) = previous {
            info!("Stopping previous debug session before starting a new one");
            self.shutdown_session(&previous).await;
        }

        let resolved = resolve_start(&self.config, &params)?;
        info!(
            language = %resolved.language,
            program = %resolved.program.display(),
            "Starting debug session"
        );

        let tracker = Arc::new(DebugStateTracker::new());
        tracker.begin_launch();
        let listener: EventListener = {
            let tracker = tracker.clone();
            Arc::new(move |event: &Event| tracker.apply_event(event))
        };

        let process = match self
            .manager
            .launch(&resolved.language, &resolved.request, vec![listener])
            .await
        {
            Ok(process) => process,
            Err(e) => {
                tracker.mark_failed(e.to_string());
                *self.failed_launch.write().await = Some(FailedLaunch {
                    language: resolved.language,
                    program: resolved.program,
                    tracker,
                });
                return Err(e);
            }
        };
        tracker.mark_initialized(process.capabilities());

        let stop_on_entry = resolved
            .request
            .arguments
            .get("stopOnEntry")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if stop_on_entry {
            let mut status_rx = tracker.subscribe();
            let entered = tokio::time::timeout(
                self.config.timeouts.initialized_wait(),
                wait_for_stop(&mut status_rx, 0),
            )
            .await;
            if entered.is_err() {
                debug!("No entry stop reported, session continues running");
            }
        }

        let watcher = spawn_watcher(process.clone(), tracker.clone());
        let session = Arc::new(DebugSession {
            language: resolved.language,
            program: resolved.program,
            cwd: resolved.cwd,
            params,
            request: resolved.request,
            process,
            tracker,
            resume_slot: Mutex::new(None),
            breakpoint_lock: tokio::sync::Mutex::new(()),
            watcher,
        });
        *self.session.write().await = Some(session.clone());

        let location = match session.tracker.run_state() {
            RunState::Stopped(_) => {
                self.refresh_threads(&session, session.tracker.stop_epoch())
                    .await?;
                self.top_frame(&session).await
            }
            _ => None,
        };
        let result = StartResult {
            state: session.tracker.run_state().as_str().to_string(),
            language: session.language.clone(),
            program: session.program.to_string_lossy().into_owned(),
            request: session.request.kind.as_str().to_string(),
            adapter_pid: session.process.pid(),
            stop: session.tracker.last_stop(),
            location,
            traffic_log: session
                .process
                .traffic_log_path()
                .map(|path| path.to_string_lossy().into_owned()),
        };
        Ok((session, result))
    }

    pub async fn stop_debugging(&self) -> Result<StopResult> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self
            .session
            .write()
            .await
            .take()
            .ok_or(DapError::NoActiveSession)?;
        let adapter = self.shutdown_session(&session).await;
        Ok(StopResult {
            state: session.tracker.run_state().as_str().to_string(),
            exit_code: session.tracker.exit_code(),
            adapter: adapter.describe(),
        })
    }

    async fn shutdown_session(&self, session: &DebugSession) -> ProcessState {
        self.manager.terminate().await;
        // Covers a session whose adapter is no longer the manager's active one.
        session.process.terminate(&self.config.timeouts).await;
        session.tracker.mark_terminated();
        let state = session.process.state();
        info!(language = %session.language, "Debug session stopped, adapter {}", state.describe());
        state
    }

    pub async fn restart_debugging(&self) -> Result<RestartResult> {
        self.with_deadline("restart_debugging", async {
            let _lifecycle = self.lifecycle.lock().await;
            let session = self.active_session().await?;

            if session.tracker.capabilities().supports_restart_request {
                let _resume = session.claim_resume("restart_debugging")?;
                let mut status_rx = session.tracker.subscribe();
                let ticket = session.tracker.begin_restart()?;
                let epoch = ticket.epoch;
                let arguments = json!({ "arguments": Value::Object(session.request.arguments.clone()) });
                if let Err(e) = session
                    .process
                    .client()
                    .send_request("restart", Some(arguments), self.config.timeouts.request())
                    .await
                {
                    if !e.is_fatal() {
                        session.tracker.abort_resume(ticket);
                    }
                    return Err(e);
                }

                let status = wait_for_stop(&mut status_rx, epoch).await?;
                let location = if status.state == RunState::Terminated {
                    None
                } else {
                    self.refresh_threads(&session, status.stop_epoch).await?;
                    self.top_frame(&session).await
                };
                info!("Adapter restarted the debuggee in place");
                return Ok(RestartResult {
                    mode: "native".to_string(),
                    state: session.tracker.run_state().as_str().to_string(),
                    breakpoints_restored: 0,
                    stop: session.tracker.last_stop(),
                    location,
                });
            }

            let saved = {
                let _resume = session.claim_resume("restart_debugging")?;
                let mut by_file: BTreeMap<String, Vec<SourceBreakpoint>> = BTreeMap::new();
                for bp in session.tracker.breakpoints() {
                    by_file.entry(bp.file.clone()).or_default().push(desired_from(&bp));
                }
                by_file
            };
            let params = session.params.clone();
            drop(session);

            let (session, started) = self.start_locked(params).await?;
            let mut restored = 0;
            for (file, desired) in saved {
                let _breakpoints = session.breakpoint_lock.lock().await;
                match self.apply_breakpoints(&session, &file, desired).await {
                    Ok(tracked) => restored += tracked.len(),
                    Err(e) => warn!(file = %file, "Failed to restore breakpoints: {}", e),
                }
            }
            info!("Relaunched debug session, restored {} breakpoint(s)", restored);
            Ok(RestartResult {
                mode: "relaunch".to_string(),
                state: session.tracker.run_state().as_str().to_string(),
                breakpoints_restored: restored,
                stop: session.tracker.last_stop(),
                location: started.location,
            })
        })
        .await
    }

    // --- Execution control ---

    pub async fn continue_execution(&self) -> Result<ExecutionResult> {
        self.with_deadline("continue_execution", self.resume("continue_execution", "continue"))
            .await
    }

    pub async fn step_over(&self) -> Result<ExecutionResult> {
        self.with_deadline("step_over", self.resume("step_over", "next"))
            .await
    }

    pub async fn step_into(&self) -> Result<ExecutionResult> {
        self.with_deadline("step_into", self.resume("step_into", "stepIn"))
            .await
    }

    pub async fn step_out(&self) -> Result<ExecutionResult> {
        self.with_deadline("step_out", self.resume("step_out", "stepOut"))
            .await
    }

    /// Send `command` and wait for the stop (or end) that answers it.
    async fn resume(&self, operation: &'static str, command: &str) -> Result<ExecutionResult> {
        let session = self.active_session().await?;
        let _resume = session.claim_resume(operation)?;
        let thread_id = self.resolve_thread(&session).await?;

        let mut status_rx = session.tracker.subscribe();
        let ticket = session.tracker.begin_resume()?;
        let epoch = ticket.epoch;
        debug!(operation, thread_id, epoch, "Resuming debuggee");

        if let Err(e) = session
            .process
            .client()
            .send_request(command, Some(json!({ "threadId": thread_id })), self.config.timeouts.request())
            .await
        {
            if !e.is_fatal() {
                session.tracker.abort_resume(ticket);
            }
            return Err(e);
        }

        let status = wait_for_stop(&mut status_rx, epoch).await?;
        if status.state == RunState::Terminated {
            return Ok(ExecutionResult {
                state: status.state.as_str().to_string(),
                stop: None,
                location: None,
                exit_code: session.tracker.exit_code(),
            });
        }

        self.refresh_threads(&session, status.stop_epoch).await?;
        let location = self.top_frame(&session).await;
        Ok(ExecutionResult {
            state: session.tracker.run_state().as_str().to_string(),
            stop: session.tracker.last_stop(),
            location,
            exit_code: None,
        })
    }

    async fn resolve_thread(&self, session: &DebugSession) -> Result<i64> {
        if let Some(thread_id) = session.tracker.stopped_thread() {
            return Ok(thread_id);
        }
        self.refresh_threads(session, session.tracker.stop_epoch())
            .await?;
        session
            .tracker
            .stopped_thread()
            .ok_or_else(|| DapError::InvalidResponse("adapter reported no threads".to_string()))
    }

    async fn refresh_threads(&self, session: &DebugSession, epoch: u64) -> Result<()> {
        let response = session
            .process
            .client()
            .send_request("threads", None, self.config.timeouts.request())
            .await;
        match response {
            Ok(response) => {
                let body: ThreadsResponseBody = response.body_as()?;
                if !session.tracker.set_threads(epoch, body.threads) {
                    debug!(epoch, "Thread list arrived after the debuggee moved on");
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Failed to refresh thread list: {}", e);
                Ok(())
            }
        }
    }

    // --- Inspection ---

    async fn frames_for(&self, session: &DebugSession, thread_id: i64) -> Result<Vec<FrameInfo>> {
        if let Some(frames) = session.tracker.frames(thread_id) {
            return Ok(frames);
        }
        session.require_stopped()?;
        let epoch = session.tracker.stop_epoch();
        let response = session
            .process
            .client()
            .send_request(
                "stackTrace",
                Some(json!({ "threadId": thread_id, "startFrame": 0 })),
                self.config.timeouts.request(),
            )
            .await?;
        let body: StackTraceResponseBody = response.body_as()?;
        session
            .tracker
            .store_frames(epoch, thread_id, body.stack_frames)
            .ok_or_else(|| moved_on(session))
    }

    async fn scopes_for(&self, session: &DebugSession, frame_id: i64) -> Result<Vec<ScopeInfo>> {
        if let Some(scopes) = session.tracker.scopes(frame_id) {
            return Ok(scopes);
        }
        let epoch = session.tracker.stop_epoch();
        let response = session
            .process
            .client()
            .send_request(
                "scopes",
                Some(json!({ "frameId": frame_id })),
                self.config.timeouts.request(),
            )
            .await?;
        let body: ScopesResponseBody = response.body_as()?;
        session
            .tracker
            .store_scopes(epoch, frame_id, body.scopes)
            .ok_or_else(|| moved_on(session))
    }

    async fn variables_for(
        &self,
        session: &DebugSession,
        variables_reference: i64,
    ) -> Result<Vec<VariableInfo>> {
        if let Some(variables) = session.tracker.variables(variables_reference) {
            return Ok(variables);
        }
        let epoch = session.tracker.stop_epoch();
        let response = session
            .process
            .client()
            .send_request(
                "variables",
                Some(json!({ "variablesReference": variables_reference })),
                self.config.timeouts.request(),
            )
            .await?;
        let body: VariablesResponseBody = response.body_as()?;
        session
            .tracker
            .store_variables(epoch, variables_reference, body.variables)
            .ok_or_else(|| moved_on(session))
    }

    /// Top frame of the stopped thread; failures only cost the location.
    async fn top_frame(&self, session: &DebugSession) -> Option<FrameInfo> {
        let thread_id = session.tracker.stopped_thread()?;
        match self.frames_for(session, thread_id).await {
            Ok(frames) => frames.into_iter().next(),
            Err(e) => {
                debug!("No location for thread {}: {}", thread_id, e);
                None
            }
        }
    }

    /// Ensure a stopped, idle session and the thread to inspect.
    async fn inspectable(&self, thread_id: Option<i64>) -> Result<(Arc<DebugSession>, i64)> {
        let session = self.active_session().await?;
        session.ensure_no_resume()?;
        session.require_stopped()?;
        let thread_id = match thread_id {
            Some(thread_id) => thread_id,
            None => self.resolve_thread(&session).await?,
        };
        Ok((session, thread_id))
    }

    pub async fn get_stack_trace(&self, thread_id: Option<i64>) -> Result<StackTraceResult> {
        self.with_deadline("get_stack_trace", async {
            let (session, thread_id) = self.inspectable(thread_id).await?;
            let frames = self.frames_for(&session, thread_id).await?;
            Ok(StackTraceResult { thread_id, frames })
        })
        .await
    }

    pub async fn get_variables(&self, scope: Option<&str>) -> Result<VariablesResult> {
        self.with_deadline("get_variables", async {
            let (session, thread_id) = self.inspectable(None).await?;
            let frames = self.frames_for(&session, thread_id).await?;
            let frame = frames.first().ok_or_else(|| {
                DapError::InvalidResponse(format!("thread {thread_id} has no stack frames"))
            })?;

            let scopes = self.scopes_for(&session, frame.id).await?;
            let wanted = scope.unwrap_or(DEFAULT_SCOPE);
            let chosen = match_scope(&scopes, wanted).ok_or_else(|| {
                let available: Vec<&str> = scopes.iter().map(|s| s.name.as_str()).collect();
                DapError::InvalidArgument(format!(
                    "Unknown scope '{wanted}'. Available scopes: {}",
                    available.join(", ")
                ))
            })?;

            let variables = self
                .variables_for(&session, chosen.variables_reference)
                .await?;
            Ok(VariablesResult {
                scope: chosen.name.clone(),
                thread_id,
                frame_id: frame.id,
                variables,
            })
        })
        .await
    }

    pub async fn evaluate_expression(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> Result<EvaluationResult> {
        self.with_deadline("evaluate_expression", async {
            if expression.trim().is_empty() {
                return Err(DapError::InvalidArgument(
                    "expression must not be empty".to_string(),
                ));
            }
            let (session, thread_id) = self.inspectable(None).await?;
            let frame_id = match frame_id {
                Some(frame_id) => frame_id,
                None => self
                    .frames_for(&session, thread_id)
                    .await?
                    .first()
                    .map(|frame| frame.id)
                    .ok_or_else(|| {
                        DapError::InvalidResponse(format!("thread {thread_id} has no stack frames"))
                    })?,
            };

            let response = session
                .process
                .client()
                .send_request(
                    "evaluate",
                    Some(json!({ "expression": expression, "frameId": frame_id, "context": "repl" })),
                    self.config.timeouts.request(),
                )
                .await?;
            let body: EvaluateResponseBody = response.body_as()?;
            Ok(EvaluationResult {
                expression: expression.to_string(),
                result: body.result,
                type_name: body.type_name,
                variables_reference: body.variables_reference,
            })
        })
        .await
    }

    pub async fn get_debug_status(&self) -> Result<StatusReport> {
        self.with_deadline("get_debug_status", async {
            let Some(session) = self.current_session().await else {
                return Ok(self.failed_launch_report().await);
            };
            session.ensure_no_resume()?;

            let state = session.tracker.run_state();
            let location = match state {
                RunState::Stopped(_) => self.top_frame(&session).await,
                _ => None,
            };
            let error = match &state {
                RunState::Failed(reason) => Some(reason.clone()),
                _ => None,
            };
            Ok(StatusReport {
                active: state.is_active(),
                state: state.as_str().to_string(),
                error,
                language: Some(session.language.clone()),
                program: Some(session.program.to_string_lossy().into_owned()),
                adapter_pid: session.process.pid(),
                stop: session.tracker.last_stop(),
                location,
                threads: session.tracker.threads(),
                breakpoints: session.tracker.breakpoints(),
                recent_output: session.tracker.recent_output(STATUS_OUTPUT_LINES),
                exit_code: session.tracker.exit_code(),
            })
        })
        .await
    }

    async fn failed_launch_report(&self) -> StatusReport {
        let failed = self.failed_launch.read().await;
        let Some(failed) = failed.as_ref() else {
            return StatusReport::idle();
        };
        let state = failed.tracker.run_state();
        let error = match &state {
            RunState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        StatusReport {
            state: state.as_str().to_string(),
            error,
            language: Some(failed.language.clone()),
            program: Some(failed.program.to_string_lossy().into_owned()),
            recent_output: failed.tracker.recent_output(STATUS_OUTPUT_LINES),
            ..StatusReport::idle()
        }
    }

    // --- Breakpoints ---

    pub async fn add_breakpoint(
        &self,
        file_path: &str,
        line: u32,
        condition: Option<String>,
    ) -> Result<BreakpointResult> {
        self.with_deadline("add_breakpoint", async {
            if line == 0 {
                return Err(DapError::InvalidArgument(
                    "line numbers start at 1".to_string(),
                ));
            }
            let session = self.active_session().await?;
            let file = session.source_path(file_path);
            let _breakpoints = session.breakpoint_lock.lock().await;

            let mut desired: Vec<SourceBreakpoint> = session
                .tracker
                .breakpoints_for(&file)
                .iter()
                .filter(|bp| bp.line != line && bp.requested_line != line)
                .map(desired_from)
                .collect();
            desired.push(SourceBreakpoint { line, condition });

            let tracked = self
                .apply_breakpoints(&session, &file, desired)
                .await
                .map_err(|e| match e {
                    DapError::RequestFailed { message, .. } => DapError::BreakpointRejected {
                        file: file.clone(),
                        line,
                        reason: message,
                    },
                    other => other,
                })?;

            let breakpoint = tracked
                .iter()
                .find(|bp| bp.requested_line == line)
                .cloned()
                .ok_or_else(|| {
                DapError::BreakpointRejected {
                    file: file.clone(),
                    line,
                    reason: "adapter did not acknowledge the breakpoint".to_string(),
                }
            })?;
            if !breakpoint.verified {
                info!(
                    file = %file,
                    line,
                    "Breakpoint not verified yet: {}",
                    breakpoint.message.as_deref().unwrap_or("no reason given")
                );
            }
            Ok(BreakpointResult {
                relocated: breakpoint.line != line,
                breakpoint,
            })
        })
        .await
    }

    pub async fn remove_breakpoint(&self, file_path: &str, line: u32) -> Result<RemoveBreakpointResult> {
        self.with_deadline("remove_breakpoint", async {
            let session = self.active_session().await?;
            let file = session.source_path(file_path);
            let _breakpoints = session.breakpoint_lock.lock().await;

            let current = session.tracker.breakpoints_for(&file);
            let (removed, kept): (Vec<TrackedBreakpoint>, Vec<TrackedBreakpoint>) = current
                .into_iter()
                .partition(|bp| bp.line == line || bp.requested_line == line);
            if removed.is_empty() {
                return Ok(RemoveBreakpointResult {
                    removed: false,
                    file,
                    line,
                    remaining: kept,
                });
            }

            let desired: Vec<SourceBreakpoint> = kept.iter().map(desired_from).collect();
            let remaining = self.apply_breakpoints(&session, &file, desired).await?;
            Ok(RemoveBreakpointResult {
                removed: true,
                file,
                line,
                remaining,
            })
        })
        .await
    }

    pub async fn list_breakpoints(&self) -> Result<BreakpointList> {
        self.with_deadline("list_breakpoints", async {
            let session = self.active_session().await?;
            session.ensure_no_resume()?;
            Ok(BreakpointList {
                breakpoints: session.tracker.breakpoints(),
            })
        })
        .await
    }

    /// Send the complete desired set for `file` and reconcile with the answer.
    async fn apply_breakpoints(
        &self,
        session: &DebugSession,
        file: &str,
        desired: Vec<SourceBreakpoint>,
    ) -> Result<Vec<TrackedBreakpoint>> {
        let arguments = SetBreakpointsArguments {
            source: Source {
                name: Path::new(file)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()),
                path: Some(file.to_string()),
            },
            lines: desired.iter().map(|bp| bp.line).collect(),
            breakpoints: desired.clone(),
        };
        let response = session
            .process
            .client()
            .send_request(
                "setBreakpoints",
                Some(serde_json::to_value(arguments)?),
                self.config.timeouts.request(),
            )
            .await?;
        let body: SetBreakpointsResponseBody = response.body_as()?;
        Ok(session
            .tracker
            .reconcile_breakpoints(file, &desired, &body.breakpoints))
    }
}

fn desired_from(bp: &TrackedBreakpoint) -> SourceBreakpoint {
    SourceBreakpoint {
        line: bp.requested_line,
        condition: bp.condition.clone(),
    }
}

fn moved_on(session: &DebugSession) -> DapError {
    DapError::NotStopped {
        state: session.tracker.run_state().as_str().to_string(),
    }
}

/// Resolves once the stop epoch passes `after_epoch` or the session ends.
async fn wait_for_stop(rx: &mut watch::Receiver<RunStatus>, after_epoch: u64) -> Result<RunStatus> {
    let status = rx
        .wait_for(|status| status.stop_epoch > after_epoch || status.state.is_finished())
        .await
        .map_err(|_| DapError::transport_closed("session tracker dropped"))?
        .clone();
    if let RunState::Failed(reason) = &status.state {
        return Err(DapError::transport_closed(reason.clone()));
    }
    Ok(status)
}

/// Marks the session failed when the adapter dies or its stream breaks
/// without a stop having been requested.
fn spawn_watcher(process: Arc<AdapterProcess>, tracker: Arc<DebugStateTracker>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = process.client().clone();
        let mut state_rx = process.subscribe_state();
        let exited = async {
            state_rx
                .wait_for(ProcessState::is_terminal)
                .await
                .map(|state| state.describe())
                .unwrap_or_else(|_| "adapter supervisor stopped".to_string())
        };

        let (cause, framing) = tokio::select! {
            closure = client.wait_closed() => (closure.to_error().to_string(), closure.framing),
            description = exited => (format!("adapter process {description}"), false),
        };

        if process.is_terminating() {
            return;
        }
        if framing {
            warn!("Killing adapter after protocol framing error");
            process.kill();
        }
        tracker.mark_failed(cause);
    })
}

fn resolve_start(config: &DebugConfig, params: &StartParams) -> Result<ResolvedStart> {
    if params.file_path.trim().is_empty() {
        return Err(DapError::InvalidArgument("file_path must not be empty".to_string()));
    }

    let (language, kind, overrides) = match &params.configuration_name {
        Some(name) => {
            let configuration = config.configuration(name)?;
            (
                configuration.language.clone(),
                configuration.request,
                configuration.arguments.clone(),
            )
        }
        None => {
            let language = language_for_path(Path::new(&params.file_path))
                .ok_or_else(|| DapError::UnknownAdapter(params.file_path.clone()))?;
            (language.to_string(), RequestKind::Launch, Map::new())
        }
    };

    let base_dir = match &params.working_directory {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()?,
    };
    let program = {
        let path = Path::new(&params.file_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    };
    let cwd = match &params.working_directory {
        Some(dir) => PathBuf::from(dir),
        None => program
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(base_dir),
    };

    let mut base = Map::new();
    base.insert("program".to_string(), json!(program.to_string_lossy()));
    base.insert("cwd".to_string(), json!(cwd.to_string_lossy()));
    base.insert("stopOnEntry".to_string(), json!(true));
    let arguments = config.request_arguments(&language, base, &overrides);

    Ok(ResolvedStart {
        language,
        program,
        cwd,
        request: SessionRequest { kind, arguments },
    })
}

/// Case-insensitive match tolerating plurals: `local` finds `Locals`.
fn match_scope<'a>(scopes: &'a [ScopeInfo], wanted: &str) -> Option<&'a ScopeInfo> {
    let normalize = |name: &str| {
        let lower = name.trim().to_lowercase();
        lower.strip_suffix('s').map(str::to_string).unwrap_or(lower)
    };
    let wanted = normalize(wanted);
    scopes
        .iter()
        .find(|scope| normalize(&scope.name) == wanted)
        .or_else(|| {
            scopes
                .iter()
                .find(|scope| normalize(&scope.name).starts_with(&wanted))
        })
}
