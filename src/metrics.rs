use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::planner::PlanSource;
use crate::types::TaskClass;

pub const RESERVOIR_SIZE: usize = 1000;
const RECENT_ERRORS: usize = 100;
const CALLER_ACTIVITY: usize = 200;
/// Distinct caller addresses kept in the per-caller tally.
pub const MAX_TRACKED_CALLERS: usize = 1000;
const TREND_POINTS: usize = 60;
const PROMPT_PREVIEW_CHARS: usize = 200;

const LOOPBACK_NAMES: [&str; 4] = ["127.0.0.1", "localhost", "::1", "none"];
const PRIVATE_PREFIXES: [&str; 3] = ["192.168.", "10.", "172.16."];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerClass {
    Loopback,
    Private,
    External,
    Unknown,
}

/// Network origin of a request, classified for metrics filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub addr: String,
    pub class: CallerClass,
}

impl Caller {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self::parse(&ip.to_canonical().to_string())
    }

    /// Classifies a textual address such as a forwarded-for entry.
    pub fn parse(raw: &str) -> Self {
        let addr = raw.trim().to_string();
        let lower = addr.to_ascii_lowercase();
        let class = if lower.is_empty() {
            CallerClass::Unknown
        } else if LOOPBACK_NAMES.contains(&lower.as_str())
            || lower
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.to_canonical().is_loopback())
        {
            CallerClass::Loopback
        } else if PRIVATE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            CallerClass::Private
        } else {
            CallerClass::External
        };
        Self { addr, class }
    }

    pub fn unknown() -> Self {
        Self {
            addr: String::new(),
            class: CallerClass::Unknown,
        }
    }

    /// Only external callers show up in metrics and the live monitor.
    pub fn is_counted(&self) -> bool {
        self.class == CallerClass::External
    }
}

/// Everything the handler knows about one finished request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub task_id: String,
    pub success: bool,
    pub elapsed: Duration,
    pub class: TaskClass,
    pub caller: Caller,
    pub cache_hit: bool,
    pub source: PlanSource,
    pub error_type: Option<String>,
    pub action_kinds: Vec<String>,
    pub selector_kinds: Vec<String>,
    pub url: String,
    pub prompt: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    total: u64,
    success: u64,
    seconds: f64,
}

impl Tally {
    fn add(&mut self, success: bool, seconds: f64) {
        self.total += 1;
        if success {
            self.success += 1;
        }
        self.seconds += seconds;
    }

    fn to_json(self) -> Value {
        let avg = if self.total == 0 {
            0.0
        } else {
            self.seconds / self.total as f64
        };
        json!({
            "total": self.total,
            "success": self.success,
            "success_rate": percent(self.success, self.total),
            "avg_response_time": round(avg, 3),
        })
    }
}

struct Inner {
    started: Instant,
    total: u64,
    successful: u64,
    failed: u64,
    seconds_sum: f64,
    reservoir: Vec<f64>,
    observed: u64,
    task_types: BTreeMap<TaskClass, Tally>,
    agents: BTreeMap<&'static str, Tally>,
    cache_hits: u64,
    cache_misses: u64,
    error_types: BTreeMap<String, u64>,
    recent_errors: VecDeque<Value>,
    callers: HashMap<String, u64>,
    caller_activity: VecDeque<Value>,
    action_kinds: BTreeMap<String, u64>,
    selector_kinds: BTreeMap<String, u64>,
    trend: VecDeque<Value>,
}

impl Inner {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            total: 0,
            successful: 0,
            failed: 0,
            seconds_sum: 0.0,
            reservoir: Vec::with_capacity(RESERVOIR_SIZE),
            observed: 0,
            task_types: BTreeMap::new(),
            agents: BTreeMap::new(),
            cache_hits: 0,
            cache_misses: 0,
            error_types: BTreeMap::new(),
            recent_errors: VecDeque::with_capacity(RECENT_ERRORS),
            callers: HashMap::new(),
            caller_activity: VecDeque::with_capacity(CALLER_ACTIVITY),
            action_kinds: BTreeMap::new(),
            selector_kinds: BTreeMap::new(),
            trend: VecDeque::with_capacity(TREND_POINTS),
        }
    }

    /// Bumps the caller's tally. When the map is full a new address replaces
    /// the least active one.
    fn count_caller(&mut self, addr: &str) {
        if let Some(count) = self.callers.get_mut(addr) {
            *count += 1;
            return;
        }
        if self.callers.len() >= MAX_TRACKED_CALLERS {
            let quietest = self
                .callers
                .iter()
                .min_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(addr, _)| addr.clone());
            if let Some(quietest) = quietest {
                self.callers.remove(&quietest);
            }
        }
        self.callers.insert(addr.to_string(), 1);
    }

    /// Weighted 0-100 score: half success rate, 30% speed, 20% uptime.
    fn health_score(&self, uptime_secs: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let success = self.successful as f64 * 100.0 / self.total as f64;
        let avg = self.seconds_sum / self.total as f64;
        let speed = (100.0 - avg * 10.0).max(0.0);
        let uptime = (uptime_secs / 3600.0 * 10.0).min(100.0);
        round(success * 0.5 + speed * 0.3 + uptime * 0.2, 2)
    }

    /// Algorithm R: every observation has an equal chance of being sampled.
    fn sample(&mut self, seconds: f64) {
        self.observed += 1;
        if self.reservoir.len() < RESERVOIR_SIZE {
            self.reservoir.push(seconds);
            return;
        }
        let slot = (rand::random::<f64>() * self.observed as f64) as u64;
        if let Some(entry) = self.reservoir.get_mut(slot as usize) {
            *entry = seconds;
        }
    }
}

/// Process-wide request counters. Requests from loopback, private or
/// unknown addresses are ignored.
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Returns whether the request was counted.
    pub fn record_request(&self, meta: &RequestMeta) -> bool {
        if !meta.caller.is_counted() {
            return false;
        }
        let seconds = meta.elapsed.as_secs_f64();
        let now = chrono::Utc::now().to_rfc3339();
        let mut inner = self.inner.lock();

        inner.total += 1;
        if meta.success {
            inner.successful += 1;
        } else {
            inner.failed += 1;
        }
        inner.seconds_sum += seconds;
        inner.sample(seconds);

        inner
            .task_types
            .entry(meta.class)
            .or_default()
            .add(meta.success, seconds);
        inner
            .agents
            .entry(meta.source.as_str())
            .or_default()
            .add(meta.success, seconds);

        if meta.cache_hit {
            inner.cache_hits += 1;
        } else {
            inner.cache_misses += 1;
        }

        if let Some(kind) = &meta.error_type {
            *inner.error_types.entry(kind.clone()).or_insert(0) += 1;
            push_bounded(
                &mut inner.recent_errors,
                json!({"time": now, "type": kind, "task_type": meta.class}),
                RECENT_ERRORS,
            );
        }

        inner.count_caller(&meta.caller.addr);
        let prompt: String = meta.prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
        push_bounded(
            &mut inner.caller_activity,
            json!({
                "time": now,
                "ip": meta.caller.addr,
                "task_id": meta.task_id,
                "success": meta.success,
                "response_time": round(seconds, 3),
                "task_type": meta.class,
                "task_url": meta.url,
                "task_prompt": prompt,
                "cache_hit": meta.cache_hit,
            }),
            CALLER_ACTIVITY,
        );

        for kind in &meta.action_kinds {
            *inner.action_kinds.entry(kind.clone()).or_insert(0) += 1;
        }
        for kind in &meta.selector_kinds {
            *inner.selector_kinds.entry(kind.clone()).or_insert(0) += 1;
        }

        let point = json!({
            "time": now,
            "success_rate": percent(inner.successful, inner.total),
            "avg_response_time": round(inner.seconds_sum / inner.total as f64, 3),
        });
        push_bounded(&mut inner.trend, point, TREND_POINTS);
        true
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.lock().total
    }

    /// Consistent copy of every aggregate, taken under the lock.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock();
        let uptime = inner.started.elapsed().as_secs_f64();
        let avg = if inner.total == 0 {
            0.0
        } else {
            inner.seconds_sum / inner.total as f64
        };
        let mut sorted = inner.reservoir.clone();
        sorted.sort_by(f64::total_cmp);

        let mut top: Vec<(&String, &u64)> = inner.callers.iter().collect();
        top.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top_callers: Vec<Value> = top
            .into_iter()
            .take(10)
            .map(|(ip, requests)| json!({"ip": ip, "requests": requests}))
            .collect();

        let task_types: BTreeMap<&str, Value> = inner
            .task_types
            .iter()
            .map(|(class, tally)| (class.as_str(), tally.to_json()))
            .collect();
        let agents: BTreeMap<&str, Value> = inner
            .agents
            .iter()
            .map(|(source, tally)| (*source, tally.to_json()))
            .collect();
        let lookups = inner.cache_hits + inner.cache_misses;
        let per_minute = if uptime > 0.0 {
            round(inner.total as f64 / (uptime / 60.0), 2)
        } else {
            0.0
        };

        json!({
            "overview": {
                "total_requests": inner.total,
                "successful_requests": inner.successful,
                "failed_requests": inner.failed,
                "success_rate": percent(inner.successful, inner.total),
                "uptime_seconds": round(uptime, 1),
                "uptime_hours": round(uptime / 3600.0, 2),
            },
            "performance": {
                "avg_response_time": round(avg, 3),
                "p50_response_time": round(percentile(&sorted, 50.0), 3),
                "p95_response_time": round(percentile(&sorted, 95.0), 3),
                "p99_response_time": round(percentile(&sorted, 99.0), 3),
                "samples": sorted.len(),
                "requests_per_minute": per_minute,
            },
            "task_types": task_types,
            "agents": agents,
            "caching": {
                "cache_hits": inner.cache_hits,
                "cache_misses": inner.cache_misses,
                "cache_hit_rate": percent(inner.cache_hits, lookups),
            },
            "errors": {
                "total_errors": inner.failed,
                "error_types": inner.error_types,
                "recent_errors": tail(&inner.recent_errors, 10),
            },
            "callers": {
                "unique_callers": inner.callers.len(),
                "top_callers": top_callers,
                "recent_activity": tail(&inner.caller_activity, 20),
            },
            "actions": inner.action_kinds,
            "selectors": inner.selector_kinds,
            "trends": tail(&inner.trend, TREND_POINTS),
            "health_score": inner.health_score(uptime),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round(part as f64 * 100.0 / whole as f64, 2)
    }
}

fn round(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

pub(crate) fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    if ring.len() == cap {
        ring.pop_front();
    }
    ring.push_back(item);
}

pub(crate) fn tail<T: Clone>(ring: &VecDeque<T>, n: usize) -> Vec<T> {
    ring.iter().skip(ring.len().saturating_sub(n)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(addr: &str, success: bool) -> RequestMeta {
        RequestMeta {
            task_id: "t".into(),
            success,
            elapsed: Duration::from_millis(120),
            class: TaskClass::Navigate,
            caller: Caller::parse(addr),
            cache_hit: false,
            source: PlanSource::Rules,
            error_type: None,
            action_kinds: vec!["NavigateAction".into(), "ScreenshotAction".into()],
            selector_kinds: Vec::new(),
            url: "https://example.com".into(),
            prompt: "go".into(),
        }
    }

    #[test]
    fn classifies_callers() {
        let cases = [
            ("127.0.0.1", CallerClass::Loopback),
            ("127.0.0.2", CallerClass::Loopback),
            ("::1", CallerClass::Loopback),
            ("localhost", CallerClass::Loopback),
            ("192.168.1.4", CallerClass::Private),
            ("10.0.0.8", CallerClass::Private),
            ("172.16.5.5", CallerClass::Private),
            ("203.0.113.5", CallerClass::External),
            ("", CallerClass::Unknown),
        ];
        for (addr, class) in cases {
            assert_eq!(Caller::parse(addr).class, class, "{addr}");
        }
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert_eq!(Caller::from_ip(mapped).class, CallerClass::Loopback);
    }

    #[test]
    fn internal_callers_are_not_counted() {
        let metrics = Metrics::new();
        for addr in ["127.0.0.1", "::1", "10.1.2.3", "192.168.0.2", "172.16.0.1"] {
            assert!(!metrics.record_request(&meta(addr, true)));
        }
        assert_eq!(metrics.snapshot()["overview"]["total_requests"], 0);

        assert!(metrics.record_request(&meta("203.0.113.5", true)));
        let snap = metrics.snapshot();
        assert_eq!(snap["overview"]["total_requests"], 1);
        assert_eq!(snap["callers"]["top_callers"][0]["ip"], "203.0.113.5");
        assert_eq!(snap["actions"]["NavigateAction"], 1);
        assert_eq!(snap["task_types"]["navigate"]["total"], 1);
    }

    #[test]
    fn errors_and_cache_tallies() {
        let metrics = Metrics::new();
        let mut failed = meta("198.51.100.7", false);
        failed.error_type = Some("request_error".into());
        metrics.record_request(&failed);
        let mut hit = meta("198.51.100.7", true);
        hit.cache_hit = true;
        metrics.record_request(&hit);

        let snap = metrics.snapshot();
        assert_eq!(snap["overview"]["failed_requests"], 1);
        assert_eq!(snap["errors"]["error_types"]["request_error"], 1);
        assert_eq!(snap["caching"]["cache_hit_rate"], 50.0);
        assert_eq!(snap["overview"]["success_rate"], 50.0);
    }

    #[test]
    fn reservoir_stays_bounded() {
        let metrics = Metrics::new();
        for _ in 0..(RESERVOIR_SIZE + 500) {
            metrics.record_request(&meta("203.0.113.9", true));
        }
        let snap = metrics.snapshot();
        assert_eq!(snap["performance"]["samples"], RESERVOIR_SIZE);
        assert_eq!(snap["performance"]["p50_response_time"], 0.12);
        assert_eq!(
            snap["callers"]["recent_activity"].as_array().unwrap().len(),
            20
        );
    }

    #[test]
    fn caller_tally_is_capped() {
        let metrics = Metrics::new();
        metrics.record_request(&meta("198.51.100.1", true));
        metrics.record_request(&meta("198.51.100.1", true));
        for i in 0..MAX_TRACKED_CALLERS {
            metrics.record_request(&meta(&format!("203.0.{}.{}", i / 250, i % 250 + 1), true));
        }
        let snap = metrics.snapshot();
        assert_eq!(snap["callers"]["unique_callers"], MAX_TRACKED_CALLERS);
        assert_eq!(snap["callers"]["top_callers"][0]["ip"], "198.51.100.1");
        assert_eq!(snap["callers"]["top_callers"][0]["requests"], 2);
    }

    #[test]
    fn health_score_weights_success_and_speed() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot()["health_score"], 0.0);
        metrics.record_request(&meta("203.0.113.5", true));
        let score = metrics.snapshot()["health_score"].as_f64().unwrap();
        assert!((79.6..79.7).contains(&score), "{score}");
    }

    #[test]
    fn nearest_rank_percentiles() {
        let data: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&data, 50.0), 50.0);
        assert_eq!(percentile(&data, 95.0), 95.0);
        assert_eq!(percentile(&data, 99.0), 99.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[3.0], 1.0), 3.0);
    }
}
