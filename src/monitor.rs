use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use axum::response::sse::Event;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::metrics::{Caller, push_bounded, tail};

pub const MAX_EVENTS: usize = 1000;
pub const MAX_HISTORY: usize = 500;
pub const MAX_CALLER_ACTIVITY: usize = 200;
pub const STALE_AFTER: Duration = Duration::from_secs(300);
const STATUS_EVENTS: usize = 50;
const STATUS_ACTIVITY: usize = 20;
const PROMPT_PREVIEW_CHARS: usize = 100;
const ERROR_PREVIEW_CHARS: usize = 200;

/// Dashboard events, kept in the ring and fanned out over SSE.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    TaskStart {
        task_id: String,
        prompt: String,
        url: String,
        caller: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        web_project_name: Option<String>,
        time: String,
    },
    TaskStep {
        task_id: String,
        step: String,
        details: Value,
        time: String,
    },
    TaskComplete {
        task_id: String,
        success: bool,
        action_count: usize,
        response_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        time: String,
    },
    CacheHit {
        task_id: String,
        time: String,
    },
    Error {
        task_id: String,
        error_type: String,
        error_message: String,
        time: String,
    },
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::TaskStart { .. } => "task_start",
            MonitorEvent::TaskStep { .. } => "task_step",
            MonitorEvent::TaskComplete { .. } => "task_complete",
            MonitorEvent::CacheHit { .. } => "cache_hit",
            MonitorEvent::Error { .. } => "error",
        }
    }

    pub fn to_sse_event(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(self.name()).data(data)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ActiveTask {
    task_id: String,
    prompt: String,
    url: String,
    caller: String,
    status: &'static str,
    current_step: String,
    actions_generated: usize,
    start_time: String,
    #[serde(skip)]
    started: Instant,
}

#[derive(Debug, Clone, Serialize)]
struct CompletedTask {
    task_id: String,
    prompt: String,
    url: String,
    caller: String,
    success: bool,
    action_count: usize,
    response_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    time: String,
}

#[derive(Default)]
struct State {
    events: VecDeque<MonitorEvent>,
    active: HashMap<String, ActiveTask>,
    history: VecDeque<CompletedTask>,
    activity: VecDeque<Value>,
}

impl State {
    fn push(&mut self, event: MonitorEvent) {
        push_bounded(&mut self.events, event, MAX_EVENTS);
    }

    fn prune_stale(&mut self, now: Instant) -> usize {
        let before = self.active.len();
        self.active
            .retain(|_, task| now.saturating_duration_since(task.started) <= STALE_AFTER);
        before - self.active.len()
    }
}

/// Live view of in-flight and recent tasks. Only external callers are
/// tracked.
pub struct LiveMonitor {
    state: Mutex<State>,
    events_tx: broadcast::Sender<MonitorEvent>,
}

impl Default for LiveMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveMonitor {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State::default()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events_tx.subscribe()
    }

    fn publish(&self, state: &mut State, event: MonitorEvent) {
        state.push(event.clone());
        let _ = self.events_tx.send(event);
    }

    pub fn task_start(
        &self,
        caller: &Caller,
        task_id: &str,
        prompt: &str,
        url: &str,
        web_project_name: Option<&str>,
    ) {
        self.task_start_at(caller, task_id, prompt, url, web_project_name, Instant::now());
    }

    /// Registers the task and drops active entries abandoned mid-request.
    fn task_start_at(
        &self,
        caller: &Caller,
        task_id: &str,
        prompt: &str,
        url: &str,
        web_project_name: Option<&str>,
        started: Instant,
    ) {
        if !caller.is_counted() {
            return;
        }
        let time = now();
        let mut state = self.state.lock();
        let pruned = state.prune_stale(started);
        if pruned > 0 {
            debug!(pruned, "dropped stale active tasks");
        }
        state.active.insert(
            task_id.to_string(),
            ActiveTask {
                task_id: task_id.to_string(),
                prompt: prompt.to_string(),
                url: url.to_string(),
                caller: caller.addr.clone(),
                status: "processing",
                current_step: "initializing".into(),
                actions_generated: 0,
                start_time: time.clone(),
                started,
            },
        );
        self.publish(
            &mut state,
            MonitorEvent::TaskStart {
                task_id: task_id.to_string(),
                prompt: prompt.chars().take(PROMPT_PREVIEW_CHARS).collect(),
                url: url.to_string(),
                caller: caller.addr.clone(),
                web_project_name: web_project_name.map(str::to_string),
                time,
            },
        );
        info!(task_id, caller = %caller.addr, "task started");
    }

    pub fn task_step(&self, caller: &Caller, task_id: &str, step: &str, details: Value) {
        if !caller.is_counted() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(task) = state.active.get_mut(task_id) {
            task.current_step = step.to_string();
            if let Some(count) = details.get("action_count").and_then(Value::as_u64) {
                task.actions_generated = count as usize;
            }
        }
        self.publish(
            &mut state,
            MonitorEvent::TaskStep {
                task_id: task_id.to_string(),
                step: step.to_string(),
                details,
                time: now(),
            },
        );
        debug!(task_id, step, "task step");
    }

    pub fn task_complete(
        &self,
        caller: &Caller,
        task_id: &str,
        success: bool,
        action_count: usize,
        elapsed: Duration,
        error: Option<&str>,
    ) {
        if !caller.is_counted() {
            return;
        }
        let time = now();
        let response_time = elapsed.as_secs_f64();
        let error = error.map(str::to_string);
        let mut state = self.state.lock();
        let (prompt, url) = state
            .active
            .remove(task_id)
            .map(|task| (task.prompt, task.url))
            .unwrap_or_default();

        push_bounded(
            &mut state.history,
            CompletedTask {
                task_id: task_id.to_string(),
                prompt,
                url,
                caller: caller.addr.clone(),
                success,
                action_count,
                response_time,
                error: error.clone(),
                time: time.clone(),
            },
            MAX_HISTORY,
        );
        push_bounded(
            &mut state.activity,
            json!({
                "caller": caller.addr,
                "task_id": task_id,
                "success": success,
                "response_time": response_time,
                "time": time,
            }),
            MAX_CALLER_ACTIVITY,
        );
        self.publish(
            &mut state,
            MonitorEvent::TaskComplete {
                task_id: task_id.to_string(),
                success,
                action_count,
                response_time,
                error,
                time,
            },
        );
        info!(task_id, success, action_count, response_time, "task complete");
    }

    pub fn cache_hit(&self, caller: &Caller, task_id: &str) {
        if !caller.is_counted() {
            return;
        }
        let mut state = self.state.lock();
        self.publish(
            &mut state,
            MonitorEvent::CacheHit {
                task_id: task_id.to_string(),
                time: now(),
            },
        );
    }

    pub fn error(&self, caller: &Caller, task_id: &str, error_type: &str, message: &str) {
        if !caller.is_counted() {
            return;
        }
        let mut state = self.state.lock();
        self.publish(
            &mut state,
            MonitorEvent::Error {
                task_id: task_id.to_string(),
                error_type: error_type.to_string(),
                error_message: message.chars().take(ERROR_PREVIEW_CHARS).collect(),
                time: now(),
            },
        );
    }

    /// Recent events, newest last, optionally filtered by event name.
    pub fn recent_events(&self, limit: usize, kind: Option<&str>) -> Vec<MonitorEvent> {
        let state = self.state.lock();
        let matching: VecDeque<MonitorEvent> = state
            .events
            .iter()
            .filter(|e| kind.is_none_or(|k| e.name() == k))
            .cloned()
            .collect();
        tail(&matching, limit)
    }

    pub fn live_status(&self) -> Value {
        self.live_status_at(Instant::now())
    }

    fn live_status_at(&self, now_instant: Instant) -> Value {
        let mut state = self.state.lock();
        let pruned = state.prune_stale(now_instant);
        if pruned > 0 {
            debug!(pruned, "dropped stale active tasks");
        }
        let active: HashMap<&String, &ActiveTask> = state.active.iter().collect();
        json!({
            "active_tasks": active,
            "active_task_count": state.active.len(),
            "recent_events": tail(&state.events, STATUS_EVENTS),
            "recent_caller_activity": tail(&state.activity, STATUS_ACTIVITY),
            "completed_tasks": state.history.len(),
            "total_events": state.events.len(),
            "timestamp": now(),
        })
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
