use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::cache::PlanCache;
use crate::learning::LearningStore;
use crate::metrics::{Caller, Metrics, RequestMeta};
use crate::monitor::LiveMonitor;
use crate::optimizer::ResponseSizeOptimizer;
use crate::planner::{self, PlanSource, Planner};
use crate::types::{Envelope, EnvelopeFields, Selector, TaskClass, TaskRequest, screenshot_value};
use crate::validator;

/// Tasks whose chosen selectors can still receive feedback.
pub const FEEDBACK_WINDOW: usize = 500;

/// Largest `/solve_task` body read. Anything bigger gets the fallback
/// envelope.
pub const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

struct RecentTask {
    task_id: String,
    class: TaskClass,
    chosen: Vec<Selector>,
}

/// Long-lived objects shared by every handler.
pub struct AppState {
    pub planner: Arc<dyn Planner>,
    pub store: Arc<LearningStore>,
    pub metrics: Metrics,
    pub monitor: LiveMonitor,
    pub cache: PlanCache,
    pub optimizer: ResponseSizeOptimizer,
    pub trust_forwarded_for: bool,
    pub agent_type: String,
    recent: Mutex<VecDeque<RecentTask>>,
    started: Instant,
}

impl AppState {
    pub fn new(planner: Arc<dyn Planner>, store: Arc<LearningStore>) -> Self {
        Self {
            planner,
            store,
            metrics: Metrics::new(),
            monitor: LiveMonitor::new(),
            cache: PlanCache::default(),
            optimizer: ResponseSizeOptimizer::default(),
            trust_forwarded_for: false,
            agent_type: "rules".into(),
            recent: Mutex::new(VecDeque::with_capacity(FEEDBACK_WINDOW)),
            started: Instant::now(),
        }
    }

    pub fn with_cache(mut self, cache: PlanCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    /// The `/solve_task` pipeline. Total: every path yields a valid envelope.
    pub async fn solve(&self, caller: &Caller, body: &[u8]) -> Envelope {
        let started = Instant::now();

        let task = match TaskRequest::from_slice(body) {
            Ok(task) => task,
            Err(e) => {
                let id = TaskRequest::salvage_id(body).unwrap_or_default();
                return self.reject(caller, id, started, &e.to_string());
            }
        };

        let fields = EnvelopeFields::for_task(&task.id);
        self.monitor.task_start(
            caller,
            &task.id,
            &task.prompt,
            &task.url,
            task.web_project_name.as_deref(),
        );

        let (plan, cache_hit) = match self.cache.get(&task.prompt, &task.url) {
            Some(plan) => {
                self.monitor.cache_hit(caller, &task.id);
                (plan, true)
            }
            None => (
                planner::plan_or_fallback(Arc::clone(&self.planner), &task).await,
                false,
            ),
        };
        self.monitor.task_step(
            caller,
            &task.id,
            "planned",
            json!({
                "action_count": plan.actions.len(),
                "task_type": plan.class,
                "source": plan.source,
                "cache_hit": cache_hit,
            }),
        );

        let mut error_type: Option<&'static str> =
            (plan.source == PlanSource::Fallback).then_some("planner_error");

        let mut actions = match plan
            .actions
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
        {
            Ok(actions) => actions,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "could not encode planned actions");
                error_type = Some("encode_error");
                vec![screenshot_value()]
            }
        };

        if !validator::validate_logged(&mut actions, "planned").is_ok() {
            error_type = Some("validation_error");
            self.monitor
                .error(caller, &task.id, "validation_error", "planned actions failed validation");
            actions = vec![screenshot_value()];
        }

        let mut actions = self.optimizer.optimize(actions, &fields);
        if !validator::validate_logged(&mut actions, "optimized").is_ok() {
            error_type = Some("validation_error");
            self.monitor
                .error(caller, &task.id, "validation_error", "optimized actions failed validation");
            actions = vec![screenshot_value()];
        }

        if !cache_hit && plan.source != PlanSource::Fallback {
            self.cache.insert(&task.prompt, &task.url, plan.clone());
        }
        if !plan.chosen.is_empty() {
            self.remember(&task.id, plan.class, plan.chosen.clone());
        }

        let elapsed = started.elapsed();
        let success = error_type.is_none();
        let action_kinds: Vec<String> = actions
            .iter()
            .filter_map(|a| a["type"].as_str().map(str::to_string))
            .collect();
        let selector_kinds: Vec<String> = actions
            .iter()
            .filter_map(|a| a["selector"]["type"].as_str().map(str::to_string))
            .collect();

        self.metrics.record_request(&RequestMeta {
            task_id: task.id.clone(),
            success,
            elapsed,
            class: plan.class,
            caller: caller.clone(),
            cache_hit,
            source: plan.source,
            error_type: error_type.map(str::to_string),
            action_kinds,
            selector_kinds,
            url: task.url.clone(),
            prompt: task.prompt.clone(),
        });
        self.monitor.task_complete(
            caller,
            &task.id,
            success,
            actions.len(),
            elapsed,
            error_type,
        );
        info!(
            task_id = %task.id,
            task_type = %plan.class,
            source = plan.source.as_str(),
            actions = actions.len(),
            cache_hit,
            elapsed_ms = elapsed.as_millis() as u64,
            "solve_task done"
        );

        Envelope::new(actions, fields)
    }

    /// Fallback envelope for a request that could not be read or parsed.
    pub fn reject(&self, caller: &Caller, id: String, started: Instant, reason: &str) -> Envelope {
        warn!(task_id = %id, error = %reason, "malformed solve_task request");
        self.monitor.error(caller, &id, "request_error", reason);
        let envelope = Envelope::fallback(EnvelopeFields::for_task(&id));
        self.metrics.record_request(&RequestMeta {
            task_id: id,
            success: false,
            elapsed: started.elapsed(),
            class: TaskClass::Generic,
            caller: caller.clone(),
            cache_hit: false,
            source: PlanSource::Fallback,
            error_type: Some("request_error".into()),
            action_kinds: vec!["ScreenshotAction".into()],
            selector_kinds: Vec::new(),
            url: String::new(),
            prompt: String::new(),
        });
        envelope
    }

    fn remember(&self, task_id: &str, class: TaskClass, chosen: Vec<Selector>) {
        let mut recent = self.recent.lock();
        recent.retain(|t| t.task_id != task_id);
        if recent.len() == FEEDBACK_WINDOW {
            recent.pop_front();
        }
        recent.push_back(RecentTask {
            task_id: task_id.to_string(),
            class,
            chosen,
        });
    }

    fn take_recent(&self, task_id: &str) -> Option<RecentTask> {
        let mut recent = self.recent.lock();
        let index = recent.iter().position(|t| t.task_id == task_id)?;
        recent.remove(index)
    }
}

/// Caller address: the first `X-Forwarded-For` entry when trusted, otherwise
/// the socket peer.
pub struct CallerAddr(pub Caller);

impl FromRequestParts<Arc<AppState>> for CallerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if state.trust_forwarded_for {
            let forwarded = parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = forwarded {
                return Ok(CallerAddr(Caller::parse(addr)));
            }
        }
        let caller = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| Caller::from_ip(addr.ip()))
            .unwrap_or_else(Caller::unknown);
        Ok(CallerAddr(caller))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route(
            "/solve_task",
            post(solve_task_handler).layer(DefaultBodyLimit::disable()),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/live", get(live_handler))
        .route("/live/stream", get(live_stream_handler))
        .route("/feedback", post(feedback_handler))
        .route("/learning/stats", get(learning_stats_handler))
        .route("/dashboard", get(dashboard_handler))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(Duration::from_secs(600))
}

async fn solve_task_handler(
    State(state): State<Arc<AppState>>,
    CallerAddr(caller): CallerAddr,
    body: Body,
) -> Json<Envelope> {
    let started = Instant::now();
    match to_bytes(body, MAX_REQUEST_BYTES).await {
        Ok(bytes) => Json(state.solve(&caller, &bytes).await),
        Err(e) => {
            let reason = format!("request body unreadable or over {MAX_REQUEST_BYTES} bytes: {e}");
            Json(state.reject(&caller, String::new(), started, &reason))
        }
    }
}

async fn root_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "agent_type": state.agent_type,
        "endpoints": {
            "solve_task": "/solve_task",
            "health": "/health",
            "metrics": "/metrics",
            "live": "/live",
            "live_stream": "/live/stream",
            "feedback": "/feedback",
            "learning_stats": "/learning/stats",
            "dashboard": "/dashboard",
        },
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "agent_type": state.agent_type,
        "uptime_seconds": state.started.elapsed().as_secs(),
        "cache_entries": state.cache.len(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.metrics.snapshot())
}

async fn live_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.monitor.live_status())
}

async fn live_stream_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.monitor.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn dashboard_handler() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

#[derive(Debug, Deserialize)]
struct FeedbackPayload {
    task_id: String,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    score: Option<f64>,
}

async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FeedbackPayload>,
) -> (StatusCode, Json<Value>) {
    let Some(success) = payload
        .success
        .or_else(|| payload.score.map(|score| score >= 0.5))
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": "success or score is required"})),
        );
    };
    let Some(task) = state.take_recent(&payload.task_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "message": "unknown task_id"})),
        );
    };

    let mut due = false;
    for selector in &task.chosen {
        due |= state.store.record(selector, Some(task.class), success);
    }
    info!(
        task_id = %payload.task_id,
        success,
        selectors = task.chosen.len(),
        "feedback recorded"
    );
    if due {
        let store = Arc::clone(&state.store);
        tokio::task::spawn_blocking(move || store.checkpoint_logged());
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "task_id": payload.task_id,
            "recorded": task.chosen.len(),
        })),
    )
}

async fn learning_stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "status": "success", "stats": state.store.stats() }))
}

const DASHBOARD_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Solver Dashboard</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    padding: 24px 32px;
  }
  header {
    display: flex;
    align-items: center;
    gap: 12px;
    margin-bottom: 24px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; }
  header .dot {
    width: 8px; height: 8px;
    border-radius: 50%;
    background: #f59e0b;
  }
  header .dot.live { background: #22c55e; }
  .cards {
    display: grid;
    grid-template-columns: repeat(auto-fit, minmax(180px, 1fr));
    gap: 16px;
    margin-bottom: 24px;
  }
  .card {
    background: #12121c;
    border: 1px solid #1a1a2e;
    border-radius: 8px;
    padding: 16px;
  }
  .card .value { font-size: 26px; font-weight: 600; color: #22c55e; }
  .card .label { font-size: 12px; color: #888; margin-top: 4px; }
  .panels { display: grid; grid-template-columns: 1fr 1fr; gap: 16px; }
  section {
    background: #12121c;
    border: 1px solid #1a1a2e;
    border-radius: 8px;
    padding: 16px;
  }
  section h2 { font-size: 14px; color: #aaa; margin-bottom: 12px; }
  table { width: 100%; border-collapse: collapse; font-size: 13px; }
  th, td { text-align: left; padding: 6px 4px; border-bottom: 1px solid #1a1a2e; }
  th { color: #888; font-weight: 500; }
  #events { max-height: 420px; overflow-y: auto; font-size: 13px; }
  .event { padding: 6px 0; border-bottom: 1px solid #1a1a2e; }
  .event .kind { color: #60a5fa; margin-right: 8px; }
  .event.error .kind { color: #ef4444; }
  .event.task_complete .kind { color: #22c55e; }
</style>
</head>
<body>
<header>
  <div class="dot" id="dot"></div>
  <h1>Solver Dashboard</h1>
</header>

<div class="cards">
  <div class="card"><div class="value" id="total">-</div><div class="label">Requests</div></div>
  <div class="card"><div class="value" id="success">-</div><div class="label">Success rate</div></div>
  <div class="card"><div class="value" id="p95">-</div><div class="label">p95 response</div></div>
  <div class="card"><div class="value" id="cache">-</div><div class="label">Cache hit rate</div></div>
  <div class="card"><div class="value" id="health">-</div><div class="label">Health score</div></div>
</div>

<div class="panels">
  <section>
    <h2>Task types</h2>
    <div id="types"></div>
    <h2 style="margin-top:16px">Errors</h2>
    <div id="errors"></div>
  </section>
  <section>
    <h2>Live events</h2>
    <div id="events"></div>
  </section>
</div>

<script>
  const esc = s => String(s).replace(/&/g,'&amp;').replace(/</g,'&lt;');

  function table(head, rows) {
    if (!rows.length) return '<span style="color:#555">none yet</span>';
    return '<table><tr>' + head.map(h => '<th>' + h + '</th>').join('') + '</tr>' +
      rows.map(r => '<tr>' + r.map(c => '<td>' + esc(c) + '</td>').join('') + '</tr>').join('') +
      '</table>';
  }

  async function refresh() {
    try {
      const m = await (await fetch('/metrics')).json();
      document.getElementById('total').textContent = m.overview.total_requests;
      document.getElementById('success').textContent = m.overview.success_rate + '%';
      document.getElementById('p95').textContent = m.performance.p95_response_time + 's';
      document.getElementById('cache').textContent = m.caching.cache_hit_rate + '%';
      document.getElementById('health').textContent = m.health_score;
      document.getElementById('types').innerHTML = table(
        ['Type', 'Total', 'Success', 'Avg'],
        Object.entries(m.task_types).map(([k, v]) =>
          [k, v.total, v.success_rate + '%', v.avg_response_time + 's']));
      document.getElementById('errors').innerHTML = table(
        ['Error', 'Count'], Object.entries(m.errors.error_types));
    } catch (e) {
      console.error('metrics refresh failed', e);
    }
  }

  const events = document.getElementById('events');
  function addEvent(kind, text) {
    const div = document.createElement('div');
    div.className = 'event ' + kind;
    div.innerHTML = '<span class="kind">' + kind + '</span>' + esc(text);
    events.prepend(div);
    while (events.children.length > 200) events.lastChild.remove();
  }

  const es = new EventSource('/live/stream');
  es.onopen = () => document.getElementById('dot').classList.add('live');
  es.onerror = () => document.getElementById('dot').classList.remove('live');

  es.addEventListener('task_start', e => {
    const d = JSON.parse(e.data);
    addEvent('task_start', d.task_id + ' ' + d.prompt);
  });
  es.addEventListener('task_step', e => {
    const d = JSON.parse(e.data);
    addEvent('task_step', d.task_id + ' ' + d.step);
  });
  es.addEventListener('task_complete', e => {
    const d = JSON.parse(e.data);
    addEvent('task_complete', d.task_id + ' ' + d.action_count + ' actions in ' +
      d.response_time.toFixed(3) + 's' + (d.success ? '' : ' (failed)'));
    refresh();
  });
  es.addEventListener('cache_hit', e => {
    addEvent('cache_hit', JSON.parse(e.data).task_id);
  });
  es.addEventListener('error', e => {
    if (!e.data) return;
    const d = JSON.parse(e.data);
    addEvent('error', d.task_id + ' ' + d.error_type + ': ' + d.error_message);
  });

  refresh();
  setInterval(refresh, 5000);
</script>
</body>
</html>
"##;
