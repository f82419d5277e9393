use std::io;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::types::{EnvelopeFields, screenshot_value};

/// Serialized envelope ceiling; leaves headroom under a 1 MiB transport limit.
pub const MAX_RESPONSE_BYTES: usize = 900 * 1024;
pub const MAX_ACTIONS: usize = 200;
pub const MAX_SCREENSHOTS: usize = 10;
pub const MAX_SELECTOR_VALUE_CHARS: usize = 200;
const MIN_PRIORITY_KEEP: usize = 10;

const ESSENTIAL_FIELDS: [&str; 13] = [
    "type",
    "action_type",
    "selector",
    "url",
    "text",
    "value",
    "duration",
    "timeSeconds",
    "direction",
    "down",
    "up",
    "left",
    "right",
];
const SELECTOR_FIELDS: [&str; 4] = ["type", "value", "attribute", "caseSensitive"];

/// Which pass produced the final list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Unchanged,
    CountCap,
    StripFields,
    ThinScreenshots,
    TruncateSelectors,
    Prioritize,
    Prefix,
    Exhausted,
}

#[derive(Serialize)]
struct Measured<'a> {
    actions: &'a [Value],
    web_agent_id: &'a str,
    recording: &'a str,
    id: &'a str,
    task_id: &'a str,
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compacts action lists until the response envelope fits the byte and count
/// ceilings. Never returns an empty list.
#[derive(Debug, Clone)]
pub struct ResponseSizeOptimizer {
    pub max_bytes: usize,
    pub max_actions: usize,
}

impl Default for ResponseSizeOptimizer {
    fn default() -> Self {
        Self {
            max_bytes: MAX_RESPONSE_BYTES,
            max_actions: MAX_ACTIONS,
        }
    }
}

impl ResponseSizeOptimizer {
    /// Compact UTF-8 length of the envelope carrying `actions`.
    pub fn response_size(&self, actions: &[Value], fields: &EnvelopeFields) -> usize {
        let mut counter = ByteCounter(0);
        let measured = Measured {
            actions,
            web_agent_id: &fields.web_agent_id,
            recording: &fields.recording,
            id: &fields.id,
            task_id: &fields.task_id,
        };
        match serde_json::to_writer(&mut counter, &measured) {
            Ok(()) => counter.0,
            Err(_) => usize::MAX,
        }
    }

    fn fits(&self, actions: &[Value], fields: &EnvelopeFields) -> bool {
        self.response_size(actions, fields) <= self.max_bytes
    }

    pub fn optimize(&self, actions: Vec<Value>, fields: &EnvelopeFields) -> Vec<Value> {
        let (optimized, pass) = self.optimize_with_pass(actions, fields);
        if pass != Pass::Unchanged {
            info!(
                task_id = %fields.task_id,
                ?pass,
                actions = optimized.len(),
                bytes = self.response_size(&optimized, fields),
                "response compacted"
            );
        }
        optimized
    }

    pub fn optimize_with_pass(
        &self,
        mut actions: Vec<Value>,
        fields: &EnvelopeFields,
    ) -> (Vec<Value>, Pass) {
        if actions.is_empty() {
            warn!(task_id = %fields.task_id, "optimizer given no actions, emitting screenshot");
            return (vec![screenshot_value()], Pass::Exhausted);
        }

        let capped = actions.len() > self.max_actions;
        if capped {
            warn!(
                task_id = %fields.task_id,
                count = actions.len(),
                limit = self.max_actions,
                "action count over limit, truncating"
            );
            actions.truncate(self.max_actions);
        }

        if self.fits(&actions, fields) {
            if capped {
                return (thin_screenshots(actions), Pass::CountCap);
            }
            return (actions, Pass::Unchanged);
        }
        debug!(
            task_id = %fields.task_id,
            bytes = self.response_size(&actions, fields),
            limit = self.max_bytes,
            "response over size limit"
        );

        let actions: Vec<Value> = actions.into_iter().map(strip_fields).collect();
        if self.fits(&actions, fields) {
            return (actions, Pass::StripFields);
        }

        let actions = thin_screenshots(actions);
        if self.fits(&actions, fields) {
            return (actions, Pass::ThinScreenshots);
        }

        let actions: Vec<Value> = actions.into_iter().map(truncate_selector).collect();
        if self.fits(&actions, fields) {
            return (actions, Pass::TruncateSelectors);
        }

        let actions = prioritize(actions);
        if self.fits(&actions, fields) {
            return (actions, Pass::Prioritize);
        }

        let (mut lo, mut hi) = (0usize, actions.len());
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            if self.fits(&actions[..mid], fields) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        if lo == 0 {
            warn!(task_id = %fields.task_id, "no action fits the size limit, emitting screenshot");
            return (vec![screenshot_value()], Pass::Exhausted);
        }
        let mut actions = actions;
        actions.truncate(lo);
        (actions, Pass::Prefix)
    }
}

fn action_kind(action: &Value) -> &str {
    action
        .get("type")
        .or_else(|| action.get("action_type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn is_screenshot(action: &Value) -> bool {
    matches!(action_kind(action), "ScreenshotAction" | "screenshot")
}

fn strip_fields(action: Value) -> Value {
    match action {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| key.starts_with('_') || ESSENTIAL_FIELDS.contains(&key.as_str()))
                .collect(),
        ),
        other => other,
    }
}

/// Keeps the first and last screenshot plus every fifth in between, capped at
/// `MAX_SCREENSHOTS`.
fn thin_screenshots(actions: Vec<Value>) -> Vec<Value> {
    let total = actions.iter().filter(|a| is_screenshot(a)).count();
    if total <= MAX_SCREENSHOTS {
        return actions;
    }
    let mut seen = 0;
    let mut middle_budget = MAX_SCREENSHOTS - 2;
    actions
        .into_iter()
        .filter(|action| {
            if !is_screenshot(action) {
                return true;
            }
            seen += 1;
            if seen == 1 || seen == total {
                return true;
            }
            if seen % 5 == 0 && middle_budget > 0 {
                middle_budget -= 1;
                return true;
            }
            false
        })
        .collect()
}

fn truncate_selector(action: Value) -> Value {
    let mut map = match action {
        Value::Object(map) => map,
        other => return other,
    };
    if let Some(Value::Object(selector)) = map.remove("selector") {
        let trimmed: Map<String, Value> = selector
            .into_iter()
            .filter(|(key, _)| SELECTOR_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| match value {
                Value::String(s) if key == "value" && s.chars().count() > MAX_SELECTOR_VALUE_CHARS => {
                    (key, Value::String(s.chars().take(MAX_SELECTOR_VALUE_CHARS).collect()))
                }
                other => (key, other),
            })
            .collect();
        map.insert("selector".into(), Value::Object(trimmed));
    }
    Value::Object(map)
}

fn priority(action: &Value) -> u8 {
    let kind = action_kind(action).trim_end_matches("Action").to_ascii_lowercase();
    match kind.as_str() {
        "navigate" | "goto" => 5,
        "click" | "type" => 4,
        "scroll" => 3,
        "wait" => 2,
        "screenshot" => 1,
        _ => 0,
    }
}

/// Keeps the highest-priority 80% (at least ten), in original order. The
/// first and last actions get a +2 boost; ties favour earlier actions.
fn prioritize(actions: Vec<Value>) -> Vec<Value> {
    let len = actions.len();
    let keep = MIN_PRIORITY_KEEP.max(len * 4 / 5);
    if keep >= len {
        return actions;
    }
    let mut scored: Vec<(u8, usize)> = actions
        .iter()
        .enumerate()
        .map(|(i, action)| {
            let boost = if i == 0 || i == len - 1 { 2 } else { 0 };
            (priority(action) + boost, i)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    let mut kept = vec![false; len];
    for (_, i) in scored.into_iter().take(keep) {
        kept[i] = true;
    }
    actions
        .into_iter()
        .zip(kept)
        .filter_map(|(action, keep)| keep.then_some(action))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> EnvelopeFields {
        EnvelopeFields::for_task("task-1")
    }

    fn screenshots(actions: &[Value]) -> usize {
        actions.iter().filter(|a| is_screenshot(a)).count()
    }

    #[test]
    fn small_lists_pass_through() {
        let actions = vec![
            json!({"type": "NavigateAction", "url": "https://example.com", "_note": "x"}),
            json!({"type": "ScreenshotAction"}),
        ];
        let (out, pass) = ResponseSizeOptimizer::default().optimize_with_pass(actions.clone(), &fields());
        assert_eq!(pass, Pass::Unchanged);
        assert_eq!(out, actions);
    }

    #[test]
    fn measures_compact_envelope() {
        let opt = ResponseSizeOptimizer::default();
        let actions = vec![json!({"type": "ScreenshotAction"})];
        let expected = serde_json::to_vec(&json!({
            "actions": actions,
            "web_agent_id": "task-1",
            "recording": "",
            "id": "task-1",
            "task_id": "task-1",
        }))
        .unwrap()
        .len();
        assert_eq!(opt.response_size(&actions, &fields()), expected);
    }

    #[test]
    fn ten_thousand_large_actions_fit() {
        let action = json!({
            "type": "TypeAction",
            "selector": {"type": "cssSelector", "value": "#q"},
            "text": "x".repeat(10_000),
            "metadata": "y".repeat(2_000),
        });
        let actions = vec![action; 10_000];
        let opt = ResponseSizeOptimizer::default();
        let out = opt.optimize(actions, &fields());
        assert!(!out.is_empty());
        assert!(out.len() <= MAX_ACTIONS);
        assert!(opt.response_size(&out, &fields()) <= MAX_RESPONSE_BYTES);
        assert!(out.iter().all(|a| a.get("metadata").is_none()));
    }

    #[test]
    fn count_cap_thins_screenshots() {
        let actions: Vec<Value> = (0..1000)
            .map(|i| {
                if i % 2 == 0 {
                    json!({"type": "ScreenshotAction"})
                } else {
                    json!({"type": "WaitAction", "timeSeconds": 1})
                }
            })
            .collect();
        let (out, pass) = ResponseSizeOptimizer::default().optimize_with_pass(actions, &fields());
        assert_eq!(pass, Pass::CountCap);
        assert!(out.len() <= MAX_ACTIONS);
        assert!(screenshots(&out) <= MAX_SCREENSHOTS);
    }

    #[test]
    fn oversize_screenshots_are_thinned() {
        let actions: Vec<Value> = (0..150)
            .map(|_| json!({"type": "ScreenshotAction", "_blob": "z".repeat(8_000)}))
            .collect();
        let (out, pass) = ResponseSizeOptimizer::default().optimize_with_pass(actions, &fields());
        assert_eq!(pass, Pass::ThinScreenshots);
        assert_eq!(screenshots(&out), MAX_SCREENSHOTS);
    }

    #[test]
    fn single_unfittable_action_becomes_screenshot() {
        let opt = ResponseSizeOptimizer {
            max_bytes: 256,
            max_actions: MAX_ACTIONS,
        };
        let actions = vec![json!({"type": "TypeAction", "text": "x".repeat(1_000),
            "selector": {"type": "cssSelector", "value": "#q"}})];
        let (out, pass) = opt.optimize_with_pass(actions, &fields());
        assert_eq!(pass, Pass::Exhausted);
        assert_eq!(out, vec![json!({"type": "ScreenshotAction"})]);
    }

    #[test]
    fn empty_input_becomes_screenshot() {
        let out = ResponseSizeOptimizer::default().optimize(Vec::new(), &fields());
        assert_eq!(out, vec![json!({"type": "ScreenshotAction"})]);
    }

    #[test]
    fn selector_truncation_keeps_required_fields() {
        let action = json!({
            "type": "ClickAction",
            "selector": {
                "type": "attributeValueSelector",
                "attribute": "data-testid",
                "value": "v".repeat(500),
                "caseSensitive": false,
                "note": "dropped"
            }
        });
        let out = truncate_selector(action);
        let selector = &out["selector"];
        assert_eq!(selector["value"].as_str().unwrap().len(), 200);
        assert_eq!(selector["attribute"], "data-testid");
        assert_eq!(selector["caseSensitive"], false);
        assert!(selector.get("note").is_none());
    }

    #[test]
    fn strip_keeps_scroll_directions() {
        let out = strip_fields(json!({"type": "ScrollAction", "down": 300, "extra": 1, "_keep": 2}));
        assert_eq!(out, json!({"type": "ScrollAction", "down": 300, "_keep": 2}));
    }

    #[test]
    fn prioritize_prefers_core_actions_in_order() {
        let mut actions = vec![json!({"type": "NavigateAction", "url": "u"})];
        for _ in 0..18 {
            actions.push(json!({"type": "WaitAction", "timeSeconds": 1}));
            actions.push(json!({"type": "ClickAction", "selector": {"type": "cssSelector", "value": "#b"}}));
        }
        actions.push(json!({"type": "ScreenshotAction"}));
        let out = prioritize(actions);
        assert_eq!(out.len(), 30);
        assert_eq!(out[0]["type"], "NavigateAction");
        assert_eq!(out.last().unwrap()["type"], "ScreenshotAction");
        let clicks = out.iter().filter(|a| a["type"] == "ClickAction").count();
        assert_eq!(clicks, 18);
    }
}
