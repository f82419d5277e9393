use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single step of the replay protocol.
///
/// Tag values and field names are the wire contract with the replay harness:
/// the tag is the `type` key and per-variant fields are camelCase. The
/// snake_case spellings are accepted on ingress only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "NavigateAction")]
    Navigate { url: String },
    #[serde(rename = "WaitAction")]
    Wait {
        #[serde(rename = "timeSeconds", alias = "time_seconds")]
        time_seconds: f64,
    },
    #[serde(rename = "ScreenshotAction")]
    Screenshot,
    #[serde(rename = "ClickAction")]
    Click { selector: Selector },
    #[serde(rename = "TypeAction")]
    Type { selector: Selector, text: String },
    #[serde(rename = "ScrollAction")]
    Scroll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        down: Option<ScrollAmount>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up: Option<ScrollAmount>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        left: Option<ScrollAmount>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        right: Option<ScrollAmount>,
    },
}

impl Action {
    /// Wire tag of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "NavigateAction",
            Action::Wait { .. } => "WaitAction",
            Action::Screenshot => "ScreenshotAction",
            Action::Click { .. } => "ClickAction",
            Action::Type { .. } => "TypeAction",
            Action::Scroll { .. } => "ScrollAction",
        }
    }

    pub fn selector(&self) -> Option<&Selector> {
        match self {
            Action::Click { selector } | Action::Type { selector, .. } => Some(selector),
            _ => None,
        }
    }

    pub fn scroll(direction: ScrollDirection) -> Self {
        let flag = Some(ScrollAmount::Flag(true));
        let (mut down, mut up, mut left, mut right) = (None, None, None, None);
        match direction {
            ScrollDirection::Down => down = flag,
            ScrollDirection::Up => up = flag,
            ScrollDirection::Left => left = flag,
            ScrollDirection::Right => right = flag,
        }
        Action::Scroll {
            down,
            up,
            left,
            right,
        }
    }
}

/// Scroll direction values are either a flag or a pixel amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScrollAmount {
    Flag(bool),
    Pixels(f64),
}

impl ScrollAmount {
    pub fn is_truthy(self) -> bool {
        match self {
            ScrollAmount::Flag(flag) => flag,
            ScrollAmount::Pixels(px) => px != 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Down,
    Up,
    Left,
    Right,
}

/// Element locator used by click and type actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Selector {
    #[serde(rename = "tagContainsSelector")]
    TagContains {
        value: String,
        #[serde(rename = "caseSensitive", alias = "case_sensitive", default)]
        case_sensitive: bool,
    },
    #[serde(rename = "attributeValueSelector")]
    AttributeValue {
        attribute: String,
        value: String,
        #[serde(rename = "caseSensitive", alias = "case_sensitive", default)]
        case_sensitive: bool,
    },
    #[serde(rename = "cssSelector")]
    Css { value: String },
    #[serde(rename = "xpathSelector")]
    Xpath { value: String },
}

/// Coarse task category derived from the prompt. Declaration order is the
/// classification tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskClass {
    Login,
    FormFill,
    Search,
    Navigate,
    ClickOnly,
    WaitObserve,
    Generic,
}

impl TaskClass {
    pub const ALL: [TaskClass; 7] = [
        TaskClass::Login,
        TaskClass::FormFill,
        TaskClass::Search,
        TaskClass::Navigate,
        TaskClass::ClickOnly,
        TaskClass::WaitObserve,
        TaskClass::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskClass::Login => "login",
            TaskClass::FormFill => "form-fill",
            TaskClass::Search => "search",
            TaskClass::Navigate => "navigate",
            TaskClass::ClickOnly => "click-only",
            TaskClass::WaitObserve => "wait-observe",
            TaskClass::Generic => "generic",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.as_str() == name)
    }
}

impl std::fmt::Display for TaskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound `/solve_task` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specifications: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("request missing required 'id' field")]
    MissingId,
    #[error("request field '{0}' has the wrong type")]
    WrongType(&'static str),
}

impl TaskRequest {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parses a request body. Numeric ids are accepted and stringified;
    /// missing `prompt`/`url` become empty strings.
    pub fn from_slice(body: &[u8]) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        let Value::Object(mut map) = value else {
            return Err(RequestError::NotAnObject);
        };

        let id = match map.remove("id") {
            Some(Value::String(id)) => id,
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Null) | None => return Err(RequestError::MissingId),
            Some(_) => return Err(RequestError::WrongType("id")),
        };
        let prompt = optional_string(&mut map, "prompt")?.unwrap_or_default();
        let url = optional_string(&mut map, "url")?.unwrap_or_default();
        let seed = match map.remove("seed") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::Null) | None => None,
            Some(_) => return Err(RequestError::WrongType("seed")),
        };
        let web_project_name = optional_string(&mut map, "web_project_name")?;
        let specifications = map.remove("specifications").filter(|v| !v.is_null());

        Ok(Self {
            id,
            prompt,
            url,
            seed,
            web_project_name,
            specifications,
        })
    }

    /// Best-effort id recovery for requests that failed to parse.
    pub fn salvage_id(body: &[u8]) -> Option<String> {
        let value: Value = serde_json::from_slice(body).ok()?;
        match value.get("id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn optional_string(
    map: &mut serde_json::Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, RequestError> {
    match map.remove(key) {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(RequestError::WrongType(key)),
    }
}

/// Identity fields that travel with the action list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeFields {
    pub web_agent_id: String,
    pub recording: String,
    pub id: String,
    pub task_id: String,
}

impl EnvelopeFields {
    pub fn for_task(task_id: &str) -> Self {
        Self {
            web_agent_id: task_id.to_string(),
            recording: String::new(),
            id: task_id.to_string(),
            task_id: task_id.to_string(),
        }
    }
}

/// Response body of `/solve_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub actions: Vec<Value>,
    pub web_agent_id: String,
    pub recording: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Envelope {
    pub fn new(actions: Vec<Value>, fields: EnvelopeFields) -> Self {
        let EnvelopeFields {
            web_agent_id,
            recording,
            id,
            task_id,
        } = fields;
        Self {
            actions,
            web_agent_id,
            recording,
            id: Some(id).filter(|id| !id.is_empty()),
            task_id: Some(task_id).filter(|id| !id.is_empty()),
        }
    }

    /// The one-action envelope used whenever the hot path fails.
    pub fn fallback(fields: EnvelopeFields) -> Self {
        Self::new(vec![screenshot_value()], fields)
    }
}

pub fn screenshot_value() -> Value {
    serde_json::json!({ "type": "ScreenshotAction" })
}

pub const MAX_PLANNED_ACTIONS: usize = 30;
pub const MIN_WAIT_SECONDS: f64 = 0.5;
pub const MAX_WAIT_SECONDS: f64 = 10.0;
