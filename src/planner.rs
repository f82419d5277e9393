use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::extract::{self, PromptParams};
use crate::learning::{LearningStore, MIN_RATE};
use crate::selectors::ElementSpec;
use crate::types::{
    Action, MAX_PLANNED_ACTIONS, MAX_WAIT_SECONDS, MIN_WAIT_SECONDS, Selector, TaskClass,
    TaskRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("planner backend failed: {0}")]
    Backend(String),
    #[error("planner backend timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("planner backend returned unusable output: {0}")]
    InvalidOutput(String),
    #[error("planner produced no actions")]
    Empty,
    #[error("planner fault: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Rules,
    Llm,
    Fallback,
}

impl PlanSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanSource::Rules => "rules",
            PlanSource::Llm => "llm",
            PlanSource::Fallback => "fallback",
        }
    }
}

/// Candidate actions plus what the feedback loop needs to learn from them.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub class: TaskClass,
    pub actions: Vec<Action>,
    /// Selectors picked for Click/Type actions, in action order.
    pub chosen: Vec<Selector>,
    pub source: PlanSource,
}

impl Plan {
    pub fn new(class: TaskClass, actions: Vec<Action>, source: PlanSource) -> Self {
        let chosen = actions.iter().filter_map(Action::selector).cloned().collect();
        Self {
            class,
            actions,
            chosen,
            source,
        }
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &TaskRequest) -> Result<Plan, PlanError>;
}

/// Deterministic keyword-driven planner.
pub struct RulePlanner {
    store: Arc<LearningStore>,
}

#[async_trait]
impl Planner for RulePlanner {
    async fn plan(&self, task: &TaskRequest) -> Result<Plan, PlanError> {
        Ok(self.build(task))
    }
}

impl RulePlanner {
    pub fn new(store: Arc<LearningStore>) -> Self {
        Self { store }
    }

    pub fn build(&self, task: &TaskRequest) -> Plan {
        let params = extract::extract(&task.prompt);
        let class = extract::classify(&task.prompt, &params);
        let target = navigation_target(&task.url, &params);
        debug!(task_id = %task.id, %class, url = ?target, "classified task");

        let mut steps = Vec::new();
        let opening_wait = if let Some(url) = &target {
            steps.push(Action::Navigate { url: url.clone() });
            true
        } else {
            false
        };
        let nav_wait = |steps: &mut Vec<Action>, seconds| {
            if opening_wait {
                steps.push(wait(seconds));
            }
        };

        match class {
            TaskClass::Login | TaskClass::FormFill => {
                let label = if class == TaskClass::Login { "Login" } else { "Submit" };
                let fields = self.credential_steps(&params, class);
                if fields.is_empty() && class == TaskClass::FormFill {
                    nav_wait(&mut steps, 1.0);
                } else {
                    steps.push(wait(1.5));
                    steps.extend(fields);
                    steps.push(Action::Click {
                        selector: self.choose(&ElementSpec::submit(label), class),
                    });
                    steps.push(wait(2.0));
                }
            }
            TaskClass::Search => {
                steps.push(wait(1.5));
                let query = params
                    .search_query
                    .clone()
                    .or_else(|| params.quoted.first().cloned());
                if let Some(query) = query {
                    steps.push(Action::Type {
                        selector: self.choose(&ElementSpec::search(), class),
                        text: query,
                    });
                }
                steps.push(Action::Click {
                    selector: self.choose(&ElementSpec::submit("Search"), class),
                });
                steps.push(wait(2.0));
            }
            TaskClass::Navigate => nav_wait(&mut steps, 1.5),
            TaskClass::ClickOnly => {
                let target = params
                    .quoted
                    .first()
                    .cloned()
                    .or_else(|| params.click_target.clone());
                match target {
                    Some(label) => {
                        steps.push(wait(1.5));
                        steps.push(Action::Click {
                            selector: self.choose(&ElementSpec::click(&label), class),
                        });
                        steps.push(wait(1.0));
                    }
                    None => nav_wait(&mut steps, 1.0),
                }
            }
            TaskClass::WaitObserve => {
                steps.push(wait(params.wait_seconds.unwrap_or(2.0)));
            }
            TaskClass::Generic => nav_wait(&mut steps, 1.0),
        }

        if let Some(direction) = params.scroll {
            steps.push(Action::scroll(direction));
            steps.push(wait(1.0));
        }
        steps.push(Action::Screenshot);

        Plan::new(class, cap_actions(steps), PlanSource::Rules)
    }

    fn credential_steps(&self, params: &PromptParams, class: TaskClass) -> Vec<Action> {
        let mut steps = Vec::new();
        let identity = match (&params.username, &params.email) {
            (Some(user), _) => Some((ElementSpec::username(), user)),
            (None, Some(email)) => Some((ElementSpec::email(), email)),
            (None, None) => None,
        };
        if let Some((spec, text)) = identity {
            steps.push(Action::Type {
                selector: self.choose(&spec, class),
                text: text.clone(),
            });
        }
        if class == TaskClass::FormFill
            && let (Some(_), Some(email)) = (&params.username, &params.email)
        {
            steps.push(Action::Type {
                selector: self.choose(&ElementSpec::email(), class),
                text: email.clone(),
            });
        }
        if let Some(password) = &params.password {
            steps.push(Action::Type {
                selector: self.choose(&ElementSpec::password(), class),
                text: password.clone(),
            });
        }
        steps
    }

    /// Highest-rate candidate at or above the floor; the first candidate when
    /// none qualifies. Ties keep candidate order.
    fn choose(&self, spec: &ElementSpec, class: TaskClass) -> Selector {
        let candidates = spec.candidates();
        let mut best: Option<(f64, usize)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            let rate = self.store.success_rate_for(candidate, class);
            if rate < MIN_RATE {
                continue;
            }
            if best.is_none_or(|(top, _)| rate > top) {
                best = Some((rate, i));
            }
        }
        let index = best.map_or(0, |(_, i)| i);
        debug!(element = spec.kind, %class, index, rate = ?best.map(|(r, _)| r), "chose selector");
        let [first, second, third] = candidates;
        match index {
            1 => second,
            2 => third,
            _ => first,
        }
    }
}

fn wait(seconds: f64) -> Action {
    Action::Wait {
        time_seconds: clamp_wait(seconds),
    }
}

pub fn clamp_wait(seconds: f64) -> f64 {
    if seconds.is_nan() {
        return MIN_WAIT_SECONDS;
    }
    seconds.clamp(MIN_WAIT_SECONDS, MAX_WAIT_SECONDS)
}

/// Request URL, else a URL written in the prompt; a path hint is joined onto
/// whichever base was found.
fn navigation_target(request_url: &str, params: &PromptParams) -> Option<String> {
    let base = Some(request_url.trim())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .or_else(|| params.url.clone())?;
    let Some(path) = &params.path else {
        return Some(base);
    };
    match url::Url::parse(&base).and_then(|u| u.join(path)) {
        Ok(joined) => Some(joined.to_string()),
        Err(e) => {
            debug!(%base, %path, error = %e, "could not join path hint");
            Some(base)
        }
    }
}

/// Keeps at most `MAX_PLANNED_ACTIONS`, shedding waits and scrolls first and
/// always retaining the final screenshot.
pub(crate) fn cap_actions(actions: Vec<Action>) -> Vec<Action> {
    if actions.len() <= MAX_PLANNED_ACTIONS {
        return actions;
    }
    let last = actions.len() - 1;
    let mut kept: Vec<Action> = actions
        .into_iter()
        .enumerate()
        .filter(|(i, action)| {
            *i == last
                || matches!(
                    action,
                    Action::Navigate { .. } | Action::Type { .. } | Action::Click { .. }
                )
        })
        .map(|(_, action)| action)
        .collect();
    if kept.len() > MAX_PLANNED_ACTIONS {
        let tail = kept.pop();
        kept.truncate(MAX_PLANNED_ACTIONS - 1);
        kept.extend(tail);
    }
    kept
}

/// The two-step plan returned when planning fails outright.
pub fn fallback_plan(task: &TaskRequest) -> Plan {
    let url = Some(task.url.trim())
        .filter(|u| !u.is_empty())
        .unwrap_or("about:blank")
        .to_string();
    let params = extract::extract(&task.prompt);
    Plan::new(
        extract::classify(&task.prompt, &params),
        vec![Action::Navigate { url }, Action::Screenshot],
        PlanSource::Fallback,
    )
}

/// Runs the planner on its own task so that errors and panics both turn into
/// the fallback plan.
pub async fn plan_or_fallback(planner: Arc<dyn Planner>, task: &TaskRequest) -> Plan {
    let owned = task.clone();
    let joined = tokio::spawn(async move { planner.plan(&owned).await }).await;
    match joined {
        Ok(Ok(plan)) if !plan.actions.is_empty() => plan,
        Ok(Ok(_)) => {
            warn!(task_id = %task.id, error = %PlanError::Empty, "using fallback plan");
            fallback_plan(task)
        }
        Ok(Err(e)) => {
            warn!(task_id = %task.id, error = %e, "planner failed, using fallback plan");
            fallback_plan(task)
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "planner task aborted, using fallback plan");
            fallback_plan(task)
        }
    }
}
