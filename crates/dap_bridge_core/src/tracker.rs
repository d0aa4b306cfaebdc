//! Session state tracker
//!
//! Folds the adapter's event stream and the backend's completed requests into
//! one consistent model of a debug session. Every transition away from
//! `Stopped` clears the frame/scope/variable caches in the same critical
//! section that changes the run state. Cached data is tagged with the stop
//! epoch it was fetched in, so a response that lands after the debuggee moved
//! on is discarded instead of being served.

use crate::protocol::{
    Breakpoint, BreakpointEventBody, Capabilities, CapabilitiesEventBody, Event, ExitedEventBody,
    OutputEventBody, Scope, SourceBreakpoint, StackFrame, StoppedEventBody, Thread,
    ThreadEventBody, Variable,
};
use crate::{DapError, Result};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const MAX_OUTPUT_LINES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    Exception,
    Pause,
    Entry,
    Other(String),
}

impl StopReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "breakpoint" | "function breakpoint" | "data breakpoint" | "instruction breakpoint" => {
                StopReason::Breakpoint
            }
            "step" => StopReason::Step,
            "exception" => StopReason::Exception,
            "pause" => StopReason::Pause,
            "entry" => StopReason::Entry,
            other => StopReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Exception => "exception",
            StopReason::Pause => "pause",
            StopReason::Entry => "entry",
            StopReason::Other(reason) => reason,
        }
    }
}

impl Serialize for StopReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Launching,
    Initialized,
    Running,
    Stopped(StopReason),
    Terminated,
    Failed(String),
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Launching => "launching",
            RunState::Initialized => "initialized",
            RunState::Running => "running",
            RunState::Stopped(_) => "stopped",
            RunState::Terminated => "terminated",
            RunState::Failed(_) => "failed",
        }
    }

    /// Initialized, Running or Stopped.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunState::Initialized | RunState::Running | RunState::Stopped(_)
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RunState::Terminated | RunState::Failed(_))
    }
}

/// What the watch channel publishes on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunStatus {
    pub state: RunState,
    pub stop_epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopInfo {
    pub reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub all_threads_stopped: bool,
    pub hit_breakpoint_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableInfo {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
}

impl From<Variable> for VariableInfo {
    fn from(variable: Variable) -> Self {
        Self {
            name: variable.name,
            value: variable.value,
            type_name: variable.type_name,
            variables_reference: variable.variables_reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeInfo {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
    #[serde(skip)]
    pub variables: Option<Vec<VariableInfo>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameInfo {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    #[serde(skip)]
    pub scopes: Option<Vec<ScopeInfo>>,
}

impl From<StackFrame> for FrameInfo {
    fn from(frame: StackFrame) -> Self {
        let file = frame
            .source
            .and_then(|source| source.path.or(source.name));
        Self {
            id: frame.id,
            name: frame.name,
            file,
            line: frame.line,
            column: frame.column,
            scopes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
    /// Fetched lazily; `None` until first requested in the current stop.
    #[serde(skip)]
    pub frames: Option<Vec<FrameInfo>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedBreakpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub file: String,
    pub requested_line: u32,
    /// Line the adapter placed the breakpoint on.
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub output: String,
}

/// Handed out by [`DebugStateTracker::begin_resume`] so a rejected resume can be undone.
#[derive(Debug, Clone)]
pub struct ResumeTicket {
    pub epoch: u64,
    previous_state: RunState,
    previous_stop: Option<StopInfo>,
}

#[derive(Default)]
struct SessionState {
    run_state: RunState,
    stop_epoch: u64,
    last_stop: Option<StopInfo>,
    capabilities: Capabilities,
    threads: BTreeMap<i64, ThreadInfo>,
    breakpoints: BTreeMap<String, Vec<TrackedBreakpoint>>,
    output: VecDeque<OutputLine>,
    exit_code: Option<i64>,
}

impl SessionState {
    fn invalidate_frames(&mut self) {
        for thread in self.threads.values_mut() {
            thread.frames = None;
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.run_state != next {
            debug!("Session state {} -> {}", self.run_state.as_str(), next.as_str());
        }
        if !matches!(next, RunState::Stopped(_)) {
            self.invalidate_frames();
            self.last_stop = None;
        }
        self.run_state = next;
    }

    fn accepts_cache(&self, epoch: u64) -> bool {
        epoch == self.stop_epoch && matches!(self.run_state, RunState::Stopped(_))
    }
}

pub struct DebugStateTracker {
    inner: Mutex<SessionState>,
    status_tx: watch::Sender<RunStatus>,
}

impl Default for DebugStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugStateTracker {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(RunStatus::default());
        Self {
            inner: Mutex::new(SessionState::default()),
            status_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &SessionState) {
        self.status_tx.send_replace(RunStatus {
            state: state.run_state.clone(),
            stop_epoch: state.stop_epoch,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    pub fn run_state(&self) -> RunState {
        self.lock().run_state.clone()
    }

    pub fn stop_epoch(&self) -> u64 {
        self.lock().stop_epoch
    }

    pub fn last_stop(&self) -> Option<StopInfo> {
        self.lock().last_stop.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.lock().capabilities.clone()
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.lock().exit_code
    }

    pub fn begin_launch(&self) {
        let mut state = self.lock();
        state.transition(RunState::Launching);
        self.publish(&state);
    }

    /// Handshake finished. A stop reported during the handshake is kept.
    pub fn mark_initialized(&self, capabilities: Capabilities) {
        let mut state = self.lock();
        state.capabilities.merge(&capabilities);
        if state.run_state == RunState::Launching {
            state.transition(RunState::Initialized);
            self.publish(&state);
        }
    }

    pub fn mark_failed(&self, error: impl Into<String>) {
        let mut state = self.lock();
        if state.run_state.is_finished() {
            return;
        }
        let error = error.into();
        warn!("Debug session failed: {}", error);
        state.transition(RunState::Failed(error));
        self.publish(&state);
    }

    pub fn mark_terminated(&self) {
        let mut state = self.lock();
        if state.run_state.is_finished() {
            return;
        }
        state.transition(RunState::Terminated);
        self.publish(&state);
    }

    /// Enter `Running` for a continue/step, clearing cached frames first.
    pub fn begin_resume(&self) -> Result<ResumeTicket> {
        let mut state = self.lock();
        if !matches!(
            state.run_state,
            RunState::Initialized | RunState::Stopped(_)
        ) {
            return Err(DapError::NotStopped {
                state: state.run_state.as_str().to_string(),
            });
        }
        let ticket = ResumeTicket {
            epoch: state.stop_epoch,
            previous_state: state.run_state.clone(),
            previous_stop: state.last_stop.clone(),
        };
        state.transition(RunState::Running);
        self.publish(&state);
        Ok(ticket)
    }

    /// Same as [`begin_resume`](Self::begin_resume) but also valid while running.
    pub fn begin_restart(&self) -> Result<ResumeTicket> {
        let mut state = self.lock();
        if !state.run_state.is_active() {
            return Err(DapError::NoActiveSession);
        }
        let ticket = ResumeTicket {
            epoch: state.stop_epoch,
            previous_state: state.run_state.clone(),
            previous_stop: state.last_stop.clone(),
        };
        state.transition(RunState::Running);
        self.publish(&state);
        Ok(ticket)
    }

    /// Roll back a resume the adapter refused, unless something else happened since.
    pub fn abort_resume(&self, ticket: ResumeTicket) {
        let mut state = self.lock();
        if state.run_state != RunState::Running || state.stop_epoch != ticket.epoch {
            return;
        }
        state.run_state = ticket.previous_state;
        state.last_stop = ticket.previous_stop;
        self.publish(&state);
    }

    /// Apply one adapter event. Registered as a client event listener.
    pub fn apply_event(&self, event: &Event) -> std::result::Result<(), String> {
        match event.event.as_str() {
            "stopped" => {
                let body: StoppedEventBody = event.body_as()?;
                self.apply_stopped(body);
            }
            "continued" => {
                let mut state = self.lock();
                if matches!(state.run_state, RunState::Stopped(_)) {
                    state.transition(RunState::Running);
                    self.publish(&state);
                }
            }
            "exited" => {
                let body: ExitedEventBody = event.body_as()?;
                info!("Debuggee exited with code {}", body.exit_code);
                let mut state = self.lock();
                state.exit_code = Some(body.exit_code);
                if !state.run_state.is_finished() {
                    state.transition(RunState::Terminated);
                    self.publish(&state);
                }
            }
            "terminated" => self.mark_terminated(),
            "output" => {
                let body: OutputEventBody = event.body_as()?;
                let mut state = self.lock();
                if state.output.len() >= MAX_OUTPUT_LINES {
                    state.output.pop_front();
                }
                state.output.push_back(OutputLine {
                    category: body.category,
                    output: body.output,
                });
            }
            "thread" => {
                let body: ThreadEventBody = event.body_as()?;
                let mut state = self.lock();
                match body.reason.as_str() {
                    "exited" => {
                        state.threads.remove(&body.thread_id);
                    }
                    _ => {
                        state
                            .threads
                            .entry(body.thread_id)
                            .or_insert_with(|| ThreadInfo {
                                id: body.thread_id,
                                name: format!("Thread {}", body.thread_id),
                                frames: None,
                            });
                    }
                }
            }
            "breakpoint" => {
                let body: BreakpointEventBody = event.body_as()?;
                self.apply_breakpoint_event(&body.reason, &body.breakpoint);
            }
            "capabilities" => {
                let body: CapabilitiesEventBody = event.body_as()?;
                debug!(capabilities = ?body.capabilities, "Adapter updated its capabilities");
                self.lock().capabilities.merge(&body.capabilities);
            }
            "initialized" | "process" | "module" | "loadedSource" => {}
            other => debug!("Ignoring unhandled adapter event '{}'", other),
        }
        Ok(())
    }

    fn apply_stopped(&self, body: StoppedEventBody) {
        let mut state = self.lock();
        if state.run_state.is_finished() {
            debug!("Ignoring stopped event after session end");
            return;
        }

        let reason = StopReason::parse(&body.reason);
        state.stop_epoch += 1;
        state.invalidate_frames();
        if let Some(thread_id) = body.thread_id {
            state.threads.entry(thread_id).or_insert_with(|| ThreadInfo {
                id: thread_id,
                name: format!("Thread {thread_id}"),
                frames: None,
            });
        }
        state.last_stop = Some(StopInfo {
            reason: reason.clone(),
            description: body.description,
            thread_id: body.thread_id,
            text: body.text,
            all_threads_stopped: body.all_threads_stopped,
            hit_breakpoint_ids: body.hit_breakpoint_ids,
        });
        debug!(
            epoch = state.stop_epoch,
            "Session stopped ({})",
            reason.as_str()
        );
        state.run_state = RunState::Stopped(reason);
        self.publish(&state);
    }

    fn apply_breakpoint_event(&self, reason: &str, reported: &Breakpoint) {
        let Some(id) = reported.id else {
            debug!("Ignoring breakpoint event without id");
            return;
        };
        let mut state = self.lock();
        for tracked in state.breakpoints.values_mut() {
            if reason == "removed" {
                tracked.retain(|bp| bp.id != Some(id));
                continue;
            }
            if let Some(bp) = tracked.iter_mut().find(|bp| bp.id == Some(id)) {
                bp.verified = reported.verified;
                if let Some(line) = reported.line {
                    bp.line = line;
                }
                bp.message = reported.message.clone();
            }
        }
        state.breakpoints.retain(|_, tracked| !tracked.is_empty());
    }

    /// Threads known right now, without frames.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.lock().threads.values().cloned().collect()
    }

    /// Replace the thread list; returns false when `epoch` is stale.
    pub fn set_threads(&self, epoch: u64, threads: Vec<Thread>) -> bool {
        let mut state = self.lock();
        if epoch != state.stop_epoch || state.run_state.is_finished() {
            return false;
        }
        let mut previous = std::mem::take(&mut state.threads);
        state.threads = threads
            .into_iter()
            .map(|thread| {
                let frames = previous.remove(&thread.id).and_then(|t| t.frames);
                (
                    thread.id,
                    ThreadInfo {
                        id: thread.id,
                        name: thread.name,
                        frames,
                    },
                )
            })
            .collect();
        true
    }

    /// Thread the last stop was reported on, else the lowest known thread id.
    pub fn stopped_thread(&self) -> Option<i64> {
        let state = self.lock();
        state
            .last_stop
            .as_ref()
            .and_then(|stop| stop.thread_id)
            .or_else(|| state.threads.keys().next().copied())
    }

    pub fn frames(&self, thread_id: i64) -> Option<Vec<FrameInfo>> {
        self.lock()
            .threads
            .get(&thread_id)
            .and_then(|thread| thread.frames.clone())
    }

    pub fn store_frames(
        &self,
        epoch: u64,
        thread_id: i64,
        frames: Vec<StackFrame>,
    ) -> Option<Vec<FrameInfo>> {
        let mut state = self.lock();
        if !state.accepts_cache(epoch) {
            debug!(epoch, "Discarding stack frames from a previous stop");
            return None;
        }
        let frames: Vec<FrameInfo> = frames.into_iter().map(FrameInfo::from).collect();
        let thread = state.threads.entry(thread_id).or_insert_with(|| ThreadInfo {
            id: thread_id,
            name: format!("Thread {thread_id}"),
            frames: None,
        });
        thread.frames = Some(frames.clone());
        Some(frames)
    }

    fn find_frame<'a>(state: &'a mut SessionState, frame_id: i64) -> Option<&'a mut FrameInfo> {
        state
            .threads
            .values_mut()
            .filter_map(|thread| thread.frames.as_mut())
            .flatten()
            .find(|frame| frame.id == frame_id)
    }

    pub fn scopes(&self, frame_id: i64) -> Option<Vec<ScopeInfo>> {
        let mut state = self.lock();
        Self::find_frame(&mut state, frame_id).and_then(|frame| frame.scopes.clone())
    }

    pub fn store_scopes(
        &self,
        epoch: u64,
        frame_id: i64,
        scopes: Vec<Scope>,
    ) -> Option<Vec<ScopeInfo>> {
        let mut state = self.lock();
        if !state.accepts_cache(epoch) {
            return None;
        }
        let frame = Self::find_frame(&mut state, frame_id)?;
        let scopes: Vec<ScopeInfo> = scopes
            .into_iter()
            .map(|scope| ScopeInfo {
                name: scope.name,
                variables_reference: scope.variables_reference,
                expensive: scope.expensive,
                variables: None,
            })
            .collect();
        frame.scopes = Some(scopes.clone());
        Some(scopes)
    }

    pub fn variables(&self, variables_reference: i64) -> Option<Vec<VariableInfo>> {
        let state = self.lock();
        state
            .threads
            .values()
            .filter_map(|thread| thread.frames.as_ref())
            .flatten()
            .filter_map(|frame| frame.scopes.as_ref())
            .flatten()
            .find(|scope| scope.variables_reference == variables_reference)
            .and_then(|scope| scope.variables.clone())
    }

    pub fn store_variables(
        &self,
        epoch: u64,
        variables_reference: i64,
        variables: Vec<Variable>,
    ) -> Option<Vec<VariableInfo>> {
        let mut state = self.lock();
        if !state.accepts_cache(epoch) {
            return None;
        }
        let variables: Vec<VariableInfo> = variables.into_iter().map(VariableInfo::from).collect();
        let scope = state
            .threads
            .values_mut()
            .filter_map(|thread| thread.frames.as_mut())
            .flatten()
            .filter_map(|frame| frame.scopes.as_mut())
            .flatten()
            .find(|scope| scope.variables_reference == variables_reference);
        if let Some(scope) = scope {
            scope.variables = Some(variables.clone());
        }
        Some(variables)
    }

    /// Replace the tracked set for `file` with the adapter's answer to a
    /// `setBreakpoints` carrying `requested`.
    ///
    /// A full answer is paired by position. A short one is matched by adapter
    /// id against the previous set, then by line; requests nothing answered
    /// are dropped.
    pub fn reconcile_breakpoints(
        &self,
        file: &str,
        requested: &[SourceBreakpoint],
        reported: &[Breakpoint],
    ) -> Vec<TrackedBreakpoint> {
        let track = |wanted: &SourceBreakpoint, actual: &Breakpoint| TrackedBreakpoint {
            id: actual.id,
            file: file.to_string(),
            requested_line: wanted.line,
            line: actual.line.unwrap_or(wanted.line),
            condition: wanted.condition.clone(),
            verified: actual.verified,
            message: actual.message.clone(),
        };

        let tracked: Vec<TrackedBreakpoint> = if reported.len() == requested.len() {
            requested
                .iter()
                .zip(reported)
                .map(|(wanted, actual)| track(wanted, actual))
                .collect()
        } else {
            warn!(
                file,
                "Adapter answered {} breakpoint(s) for {} requested",
                reported.len(),
                requested.len()
            );
            let previous = self.breakpoints_for(file);
            let mut answers: Vec<Option<&Breakpoint>> = vec![None; requested.len()];
            for actual in reported {
                let known_line = actual.id.and_then(|id| {
                    previous
                        .iter()
                        .find(|bp| bp.id == Some(id))
                        .map(|bp| bp.requested_line)
                });
                let slot = (0..requested.len()).find(|&i| {
                    answers[i].is_none()
                        && (known_line == Some(requested[i].line)
                            || actual.line == Some(requested[i].line))
                });
                match slot {
                    Some(i) => answers[i] = Some(actual),
                    None => debug!(file, line = ?actual.line, "Unmatched breakpoint in adapter answer"),
                }
            }
            requested
                .iter()
                .zip(answers)
                .filter_map(|(wanted, actual)| actual.map(|actual| track(wanted, actual)))
                .collect()
        };

        let mut state = self.lock();
        if tracked.is_empty() {
            state.breakpoints.remove(file);
        } else {
            state.breakpoints.insert(file.to_string(), tracked.clone());
        }
        tracked
    }

    pub fn breakpoints(&self) -> Vec<TrackedBreakpoint> {
        self.lock().breakpoints.values().flatten().cloned().collect()
    }

    pub fn breakpoints_for(&self, file: &str) -> Vec<TrackedBreakpoint> {
        self.lock()
            .breakpoints
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    /// Files with at least one tracked breakpoint.
    pub fn breakpoint_files(&self) -> Vec<String> {
        self.lock().breakpoints.keys().cloned().collect()
    }

    pub fn recent_output(&self, limit: usize) -> Vec<OutputLine> {
        let state = self.lock();
        let skip = state.output.len().saturating_sub(limit);
        state.output.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, body: serde_json::Value) -> Event {
        Event {
            seq: 0,
            event: name.to_string(),
            body: Some(body),
        }
    }

    fn frame(id: i64, line: u32) -> StackFrame {
        serde_json::from_value(json!({
            "id": id, "name": "main", "line": line, "column": 1,
            "source": { "path": "/w/main.py" }
        }))
        .unwrap()
    }

    fn stopped_tracker() -> DebugStateTracker {
        let tracker = DebugStateTracker::new();
        tracker.begin_launch();
        tracker.mark_initialized(Capabilities::default());
        tracker
            .apply_event(&event("stopped", json!({ "reason": "entry", "threadId": 1 })))
            .unwrap();
        tracker
    }

    #[test]
    fn test_lifecycle_transitions() {
        let tracker = DebugStateTracker::new();
        assert_eq!(tracker.run_state(), RunState::Idle);
        tracker.begin_launch();
        assert_eq!(tracker.run_state(), RunState::Launching);
        tracker.mark_initialized(Capabilities::default());
        assert_eq!(tracker.run_state(), RunState::Initialized);

        let ticket = tracker.begin_resume().unwrap();
        assert_eq!(ticket.epoch, 0);
        assert_eq!(tracker.run_state(), RunState::Running);

        tracker
            .apply_event(&event("stopped", json!({ "reason": "breakpoint", "threadId": 1 })))
            .unwrap();
        assert_eq!(tracker.run_state(), RunState::Stopped(StopReason::Breakpoint));
        assert_eq!(tracker.stop_epoch(), 1);
        assert_eq!(tracker.stopped_thread(), Some(1));

        tracker.apply_event(&event("exited", json!({ "exitCode": 0 }))).unwrap();
        assert_eq!(tracker.run_state(), RunState::Terminated);
        assert_eq!(tracker.exit_code(), Some(0));

        tracker.mark_failed("late crash");
        assert_eq!(tracker.run_state(), RunState::Terminated);
    }

    #[test]
    fn test_stop_during_handshake_survives_initialization() {
        let tracker = DebugStateTracker::new();
        tracker.begin_launch();
        tracker
            .apply_event(&event("stopped", json!({ "reason": "entry", "threadId": 7 })))
            .unwrap();
        tracker.mark_initialized(Capabilities::default());
        assert_eq!(tracker.run_state(), RunState::Stopped(StopReason::Entry));
    }

    #[test]
    fn test_resume_clears_frames_before_returning() {
        let tracker = stopped_tracker();
        let epoch = tracker.stop_epoch();
        assert!(tracker.store_frames(epoch, 1, vec![frame(100, 3)]).is_some());
        assert_eq!(tracker.frames(1).unwrap()[0].line, 3);

        tracker.begin_resume().unwrap();
        assert!(tracker.frames(1).is_none());
        assert!(tracker.last_stop().is_none());
    }

    #[test]
    fn test_stale_epoch_cache_writes_are_rejected() {
        let tracker = stopped_tracker();
        let stale = tracker.stop_epoch();
        tracker.begin_resume().unwrap();
        tracker
            .apply_event(&event("stopped", json!({ "reason": "step", "threadId": 1 })))
            .unwrap();

        assert!(tracker.store_frames(stale, 1, vec![frame(100, 3)]).is_none());
        assert!(tracker.frames(1).is_none());
        assert!(tracker
            .store_frames(tracker.stop_epoch(), 1, vec![frame(200, 4)])
            .is_some());
    }

    #[test]
    fn test_stopped_event_invalidates_cached_variables() {
        let tracker = stopped_tracker();
        let epoch = tracker.stop_epoch();
        tracker.store_frames(epoch, 1, vec![frame(100, 3)]);
        tracker.store_scopes(
            epoch,
            100,
            vec![Scope {
                name: "Locals".into(),
                variables_reference: 1001,
                expensive: false,
            }],
        );
        let vars: Vec<Variable> =
            serde_json::from_value(json!([{ "name": "x", "value": "1", "variablesReference": 0 }]))
                .unwrap();
        tracker.store_variables(epoch, 1001, vars);
        assert_eq!(tracker.variables(1001).unwrap()[0].value, "1");

        tracker
            .apply_event(&event("stopped", json!({ "reason": "pause", "threadId": 1 })))
            .unwrap();
        assert!(tracker.variables(1001).is_none());
        assert!(tracker.scopes(100).is_none());
    }

    #[test]
    fn test_resume_requires_stopped_or_initialized() {
        let tracker = stopped_tracker();
        tracker.begin_resume().unwrap();
        let err = tracker.begin_resume().unwrap_err();
        assert!(matches!(err, DapError::NotStopped { ref state } if state == "running"));
    }

    #[test]
    fn test_abort_resume_restores_previous_stop() {
        let tracker = stopped_tracker();
        let ticket = tracker.begin_resume().unwrap();
        tracker.abort_resume(ticket);
        assert_eq!(tracker.run_state(), RunState::Stopped(StopReason::Entry));
        assert_eq!(tracker.stopped_thread(), Some(1));
    }

    #[test]
    fn test_reconcile_replaces_previous_set() {
        let tracker = DebugStateTracker::new();
        let requested = |lines: &[u32]| -> Vec<SourceBreakpoint> {
            lines
                .iter()
                .map(|&line| SourceBreakpoint {
                    line,
                    condition: None,
                })
                .collect()
        };
        let verified = |lines: &[u32]| -> Vec<Breakpoint> {
            lines
                .iter()
                .map(|&line| Breakpoint {
                    verified: true,
                    line: Some(line),
                    ..Default::default()
                })
                .collect()
        };

        tracker.reconcile_breakpoints("/w/main.py", &requested(&[10, 20]), &verified(&[10, 20]));
        tracker.reconcile_breakpoints("/w/main.py", &requested(&[20]), &verified(&[20]));

        let lines: Vec<u32> = tracker.breakpoints().iter().map(|bp| bp.line).collect();
        assert_eq!(lines, vec![20]);

        tracker.reconcile_breakpoints("/w/main.py", &[], &[]);
        assert!(tracker.breakpoint_files().is_empty());
    }

    fn source_breakpoint(line: u32, condition: Option<&str>) -> SourceBreakpoint {
        SourceBreakpoint {
            line,
            condition: condition.map(str::to_string),
        }
    }

    #[test]
    fn test_reconcile_keeps_relocated_line_and_request() {
        let tracker = DebugStateTracker::new();
        let requested = vec![source_breakpoint(3, Some("x > 1")), source_breakpoint(9, None)];
        let reported = vec![
            Breakpoint {
                id: Some(5),
                verified: true,
                line: Some(4),
                ..Default::default()
            },
            Breakpoint {
                id: Some(6),
                verified: true,
                line: Some(9),
                ..Default::default()
            },
        ];

        let tracked = tracker.reconcile_breakpoints("/w/main.py", &requested, &reported);
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[0].requested_line, 3);
        assert_eq!(tracked[0].line, 4);
        assert_eq!(tracked[0].condition.as_deref(), Some("x > 1"));
        assert_eq!(tracked[1].line, 9);
    }

    #[test]
    fn test_reconcile_short_answer_matches_by_line() {
        let tracker = DebugStateTracker::new();
        let requested = vec![source_breakpoint(10, Some("x > 1")), source_breakpoint(5, None)];
        let reported = vec![Breakpoint {
            id: Some(7),
            verified: true,
            line: Some(5),
            ..Default::default()
        }];

        let tracked = tracker.reconcile_breakpoints("/w/main.py", &requested, &reported);
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].requested_line, 5);
        assert_eq!(tracked[0].line, 5);
        assert_eq!(tracked[0].id, Some(7));
        assert!(tracked[0].condition.is_none());
        assert_eq!(tracker.breakpoints(), tracked);
    }

    #[test]
    fn test_reconcile_short_answer_matches_relocated_by_id() {
        let tracker = DebugStateTracker::new();
        tracker.reconcile_breakpoints(
            "/w/main.py",
            &[source_breakpoint(3, Some("x > 1"))],
            &[Breakpoint {
                id: Some(5),
                verified: true,
                line: Some(4),
                ..Default::default()
            }],
        );

        let requested = vec![source_breakpoint(3, Some("x > 1")), source_breakpoint(30, None)];
        let reported = vec![Breakpoint {
            id: Some(5),
            verified: true,
            line: Some(4),
            ..Default::default()
        }];
        let tracked = tracker.reconcile_breakpoints("/w/main.py", &requested, &reported);
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].requested_line, 3);
        assert_eq!(tracked[0].line, 4);
        assert_eq!(tracked[0].condition.as_deref(), Some("x > 1"));
    }

    #[test]
    fn test_capabilities_event_extends_handshake_set() {
        let tracker = DebugStateTracker::new();
        tracker.begin_launch();
        tracker.mark_initialized(Capabilities {
            supports_terminate_request: true,
            ..Default::default()
        });
        assert!(!tracker.capabilities().supports_restart_request);

        tracker
            .apply_event(&event(
                "capabilities",
                json!({ "capabilities": { "supportsRestartRequest": true } }),
            ))
            .unwrap();
        let caps = tracker.capabilities();
        assert!(caps.supports_restart_request);
        assert!(caps.supports_terminate_request);
    }

    #[test]
    fn test_breakpoint_event_updates_verification() {
        let tracker = DebugStateTracker::new();
        tracker.reconcile_breakpoints(
            "/w/main.py",
            &[SourceBreakpoint {
                line: 12,
                condition: None,
            }],
            &[Breakpoint {
                id: Some(2),
                verified: false,
                ..Default::default()
            }],
        );

        tracker
            .apply_event(&event(
                "breakpoint",
                json!({ "reason": "changed", "breakpoint": { "id": 2, "verified": true, "line": 13 } }),
            ))
            .unwrap();
        let bp = &tracker.breakpoints()[0];
        assert!(bp.verified);
        assert_eq!(bp.line, 13);

        tracker
            .apply_event(&event(
                "breakpoint",
                json!({ "reason": "removed", "breakpoint": { "id": 2 } }),
            ))
            .unwrap();
        assert!(tracker.breakpoints().is_empty());
    }

    #[test]
    fn test_output_ring_buffer_is_bounded() {
        let tracker = DebugStateTracker::new();
        for i in 0..(MAX_OUTPUT_LINES + 10) {
            tracker
                .apply_event(&event("output", json!({ "category": "stdout", "output": format!("line {i}\n") })))
                .unwrap();
        }
        let all = tracker.recent_output(usize::MAX);
        assert_eq!(all.len(), MAX_OUTPUT_LINES);
        assert_eq!(all[0].output, "line 10\n");
        let tail = tracker.recent_output(2);
        assert_eq!(tail[1].output, format!("line {}\n", MAX_OUTPUT_LINES + 9));
    }

    #[test]
    fn test_malformed_and_unknown_events() {
        let tracker = stopped_tracker();
        assert!(tracker
            .apply_event(&event("stopped", json!({ "reason": 42 })))
            .is_err());
        assert!(tracker.apply_event(&event("progressStart", json!({}))).is_ok());
        assert_eq!(tracker.run_state(), RunState::Stopped(StopReason::Entry));
    }

    #[tokio::test]
    async fn test_watch_publishes_stop_epoch() {
        let tracker = stopped_tracker();
        let mut rx = tracker.subscribe();
        tracker.begin_resume().unwrap();
        tracker
            .apply_event(&event("stopped", json!({ "reason": "step", "threadId": 1 })))
            .unwrap();
        let status = rx.wait_for(|s| s.stop_epoch == 2).await.unwrap().clone();
        assert_eq!(status.state, RunState::Stopped(StopReason::Step));
    }
}
