use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::extract;
use crate::planner::{self, Plan, PlanError, PlanSource, Planner, RulePlanner};
use crate::types::{Action, TaskRequest};
use crate::validator;

const SYSTEM_PROMPT: &str = r#"You are a web automation expert. Produce the browser actions that complete the user's task on the given site.

Action types (field names are exact):
- {"type":"NavigateAction","url":"https://..."}
- {"type":"WaitAction","timeSeconds":1.5}
- {"type":"ClickAction","selector":SELECTOR}
- {"type":"TypeAction","selector":SELECTOR,"text":"..."}
- {"type":"ScrollAction","down":true}
- {"type":"ScreenshotAction"}

Selector types:
- {"type":"tagContainsSelector","value":"Login","caseSensitive":false}
- {"type":"attributeValueSelector","attribute":"name","value":"username","caseSensitive":false}
- {"type":"cssSelector","value":"button[type='submit']"}
- {"type":"xpathSelector","value":"//button"}

Rules:
1. Return ONLY a JSON array of actions. No markdown, no explanation.
2. Prefer attributeValueSelector or tagContainsSelector. Use xpathSelector sparingly.
3. Keep the sequence short (at most 30 actions) and end with one ScreenshotAction."#;

/// Chat-completions backend. Any failure degrades to the rule planner.
pub struct LlmPlanner {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    rules: RulePlanner,
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, task: &TaskRequest) -> Result<Plan, PlanError> {
        match tokio::time::timeout(self.timeout, self.ask(task)).await {
            Ok(Ok(actions)) => {
                let params = extract::extract(&task.prompt);
                let class = extract::classify(&task.prompt, &params);
                info!(task_id = %task.id, actions = actions.len(), "using LLM plan");
                Ok(Plan::new(class, actions, PlanSource::Llm))
            }
            Ok(Err(e)) => {
                let reason = format!("{e:#}");
                warn!(task_id = %task.id, error = %reason, "LLM planning failed, using rules");
                Ok(self.rules.build(task))
            }
            Err(_) => {
                warn!(
                    task_id = %task.id,
                    error = %PlanError::Timeout(self.timeout),
                    "LLM planning timed out, using rules"
                );
                Ok(self.rules.build(task))
            }
        }
    }
}

impl LlmPlanner {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        store: Arc<crate::learning::LearningStore>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
            rules: RulePlanner::new(store),
        })
    }

    async fn ask(&self, task: &TaskRequest) -> Result<Vec<Action>> {
        let mut user = format!(
            "Task: {}\nURL: {}\n\nReturn ONLY the JSON array of actions.",
            task.prompt, task.url
        );
        if let Some(project) = &task.web_project_name {
            user.push_str(&format!("\nWeb project: {project}"));
        }
        if let Some(seed) = task.seed {
            user.push_str(&format!("\nSeed: {seed}"));
        }
        if let Some(spec) = &task.specifications {
            user.push_str(&format!("\nSpecifications: {spec}"));
        }

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-API-Key", &self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": user},
                ],
                "temperature": 0.3,
                "max_tokens": 1000,
            }))
            .send()
            .await?;

        let status = response.status();
        let json_resp: Value = response.json().await?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            return Err(anyhow!("LLM API error ({}): {}", status, err_msg));
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("No content in LLM response: {}", json_resp))?;

        debug!(task_id = %task.id, content, "LLM replied");
        parse_actions(content)
    }
}

/// Turns an LLM reply into typed actions: strips fences, takes the outermost
/// JSON array, upgrades legacy shapes, validates, then caps the length.
pub fn parse_actions(content: &str) -> Result<Vec<Action>> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let start = cleaned
        .find('[')
        .ok_or_else(|| anyhow!("LLM reply has no JSON array"))?;
    let end = cleaned
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow!("LLM reply has no JSON array"))?;

    let raw: Vec<Value> = serde_json::from_str(&cleaned[start..=end])
        .map_err(|e| anyhow!("Failed to parse LLM actions: {}", e))?;
    let mut values: Vec<Value> = raw.into_iter().map(upgrade_legacy).collect();
    if values.is_empty() {
        return Err(anyhow!("LLM returned an empty action list"));
    }

    let report = validator::validate(&mut values);
    if let Some(first) = report.first() {
        return Err(anyhow!("LLM actions failed validation: {}", first));
    }

    let mut actions = values
        .into_iter()
        .map(serde_json::from_value::<Action>)
        .collect::<Result<Vec<_>, _>>()?;
    for action in &mut actions {
        if let Action::Wait { time_seconds } = action {
            *time_seconds = planner::clamp_wait(*time_seconds);
        }
    }
    if actions.last() != Some(&Action::Screenshot) {
        actions.push(Action::Screenshot);
    }
    Ok(planner::cap_actions(actions))
}

/// Maps the older `action_type`/`duration`/`direction`/string-selector shape
/// onto the wire schema. Objects already in wire shape pass through.
fn upgrade_legacy(action: Value) -> Value {
    let mut map = match action {
        Value::Object(map) => map,
        other => return other,
    };

    let kind = map
        .get("type")
        .or_else(|| map.get("action_type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    map.remove("action_type");
    let short = kind.trim_end_matches("Action").to_ascii_lowercase();
    let wire = match short.as_str() {
        "navigate" | "goto" => "NavigateAction",
        "click" => "ClickAction",
        "type" | "input" => "TypeAction",
        "wait" => "WaitAction",
        "scroll" => "ScrollAction",
        "screenshot" => "ScreenshotAction",
        _ => return Value::Object(map),
    };
    map.insert("type".into(), Value::String(wire.into()));

    match wire {
        "WaitAction" => {
            if !map.contains_key("timeSeconds") && !map.contains_key("time_seconds") {
                if let Some(duration) = map.remove("duration") {
                    map.insert("timeSeconds".into(), duration);
                }
            }
        }
        "ScrollAction" => {
            if let Some(direction) = map.remove("direction") {
                let direction = direction
                    .as_str()
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_else(|| "down".into());
                let key = match direction.as_str() {
                    "up" | "left" | "right" => direction,
                    _ => "down".to_string(),
                };
                map.entry(key).or_insert(Value::Bool(true));
            }
        }
        _ => {}
    }

    if let Some(Value::String(raw)) = map.get("selector").cloned() {
        let mut selector = Map::new();
        selector.insert("type".into(), Value::String("cssSelector".into()));
        selector.insert("value".into(), Value::String(raw));
        map.insert("selector".into(), Value::Object(selector));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Selector;

    #[test]
    fn parses_fenced_reply() {
        let reply = "```json\n[{\"type\":\"NavigateAction\",\"url\":\"https://example.com\"},{\"type\":\"WaitAction\",\"time_seconds\":1}]\n```";
        let actions = parse_actions(reply).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::Navigate {
                    url: "https://example.com".into()
                },
                Action::Wait { time_seconds: 1.0 },
                Action::Screenshot,
            ]
        );
    }

    #[test]
    fn extracts_array_from_chatter() {
        let reply = "Sure! Here you go: [{\"type\":\"ScreenshotAction\"}] Hope it helps.";
        assert_eq!(parse_actions(reply).unwrap(), vec![Action::Screenshot]);
    }

    #[test]
    fn upgrades_legacy_shapes() {
        let reply = r##"[
            {"action_type": "click", "selector": "#login"},
            {"action_type": "wait", "duration": 30},
            {"action_type": "scroll", "direction": "UP"}
        ]"##;
        let actions = parse_actions(reply).unwrap();
        assert_eq!(
            actions[0],
            Action::Click {
                selector: Selector::css("#login")
            }
        );
        assert_eq!(actions[1], Action::Wait { time_seconds: 10.0 });
        assert_eq!(
            actions[2],
            Action::scroll(crate::types::ScrollDirection::Up)
        );
    }

    #[test]
    fn rejects_invalid_or_empty_replies() {
        assert!(parse_actions("no json here").is_err());
        assert!(parse_actions("[]").is_err());
        assert!(parse_actions(r#"[{"type":"ClickAction","selector":{"type":"cssSelector","value":""}}]"#).is_err());
        assert!(parse_actions(r#"[{"type":"HoverAction"}]"#).is_err());
    }

    #[tokio::test]
    async fn unreachable_backend_degrades_to_rules() {
        let store = Arc::new(crate::learning::LearningStore::ephemeral());
        let planner = LlmPlanner::new(
            "http://127.0.0.1:9/v1/chat/completions",
            "test-key",
            "test-model",
            Duration::from_secs(2),
            store,
        )
        .unwrap();
        let task = TaskRequest::new("t", "Navigate to example.com", "https://example.com");
        let plan = planner.plan(&task).await.unwrap();
        assert_eq!(plan.source, PlanSource::Rules);
        assert_eq!(plan.actions.last(), Some(&Action::Screenshot));
    }
}
