use serde_json::{Map, Value};
use tracing::error;

use crate::selectors::{ATTRIBUTE_VALUE, CSS, DEFAULT_CASE_SENSITIVE, TAG_CONTAINS, XPATH};

const SCROLL_DIRECTIONS: [&str; 4] = ["down", "up", "left", "right"];

/// Why a single action was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("action list cannot be empty")]
    Empty,
    #[error("{0} must be a JSON object")]
    NotAnObject(&'static str),
    #[error("{0} missing required 'type' field")]
    MissingType(&'static str),
    #[error("unknown action type '{0}'")]
    UnknownActionType(String),
    #[error("unknown selector type '{0}'")]
    UnknownSelectorType(String),
    #[error("{owner} missing required '{field}' field")]
    MissingField { owner: String, field: &'static str },
    #[error("{owner} field '{field}' must be a {expected}")]
    WrongKind {
        owner: String,
        field: &'static str,
        expected: &'static str,
    },
    #[error("{owner} field '{field}' must not be empty")]
    EmptyValue { owner: String, field: &'static str },
    #[error("ScrollAction must set at least one of down, up, left, right")]
    NoScrollDirection,
}

/// A validation failure and the position of the action that caused it.
/// `index` is `None` for list-level failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionError {
    pub index: Option<usize>,
    pub error: ValidationError,
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(index) => write!(f, "action {index}: {}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<ActionError>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn first(&self) -> Option<&ActionError> {
        self.errors.first()
    }
}

/// Normalizes every action in place and collects the first failure of each.
pub fn validate(actions: &mut [Value]) -> ValidationReport {
    if actions.is_empty() {
        return ValidationReport {
            errors: vec![ActionError {
                index: None,
                error: ValidationError::Empty,
            }],
        };
    }

    let errors = actions
        .iter_mut()
        .enumerate()
        .filter_map(|(index, action)| {
            validate_action(action).err().map(|error| ActionError {
                index: Some(index),
                error,
            })
        })
        .collect();
    ValidationReport { errors }
}

/// Validates and logs failures at error level with the offending action.
pub fn validate_logged(actions: &mut [Value], context: &str) -> ValidationReport {
    let report = validate(actions);
    for failure in &report.errors {
        let offending = failure
            .index
            .and_then(|i| actions.get(i))
            .map(Value::to_string)
            .unwrap_or_default();
        error!(context, %failure, action = %offending, "action failed validation");
    }
    report
}

pub fn validate_action(action: &mut Value) -> Result<(), ValidationError> {
    let Value::Object(map) = action else {
        return Err(ValidationError::NotAnObject("action"));
    };
    let kind = match map.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => {
            return Err(ValidationError::WrongKind {
                owner: "action".into(),
                field: "type",
                expected: "string",
            });
        }
        None => return Err(ValidationError::MissingType("action")),
    };

    match kind.as_str() {
        "NavigateAction" => match map.get("url") {
            Some(Value::String(_)) => Ok(()),
            Some(_) => Err(wrong_kind(&kind, "url", "string")),
            None => Err(missing(&kind, "url")),
        },
        "WaitAction" => {
            rename_snake(map, "time_seconds", "timeSeconds");
            match map.get("timeSeconds") {
                Some(Value::Number(_)) => Ok(()),
                Some(_) => Err(wrong_kind(&kind, "timeSeconds", "number")),
                None => Err(missing(&kind, "timeSeconds")),
            }
        }
        "ScreenshotAction" => Ok(()),
        "ClickAction" => validate_selector_field(map, &kind),
        "TypeAction" => {
            match map.get("text") {
                Some(Value::String(_)) => {}
                Some(_) => return Err(wrong_kind(&kind, "text", "string")),
                None => return Err(missing(&kind, "text")),
            }
            validate_selector_field(map, &kind)
        }
        "ScrollAction" => {
            if SCROLL_DIRECTIONS
                .iter()
                .any(|d| map.get(*d).is_some_and(is_truthy))
            {
                Ok(())
            } else {
                Err(ValidationError::NoScrollDirection)
            }
        }
        _ => Err(ValidationError::UnknownActionType(kind)),
    }
}

fn validate_selector_field(map: &mut Map<String, Value>, owner: &str) -> Result<(), ValidationError> {
    let Some(selector) = map.get_mut("selector") else {
        return Err(missing(owner, "selector"));
    };
    validate_selector(selector)
}

pub fn validate_selector(selector: &mut Value) -> Result<(), ValidationError> {
    let Value::Object(map) = selector else {
        return Err(ValidationError::NotAnObject("selector"));
    };
    let kind = match map.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => {
            return Err(ValidationError::WrongKind {
                owner: "selector".into(),
                field: "type",
                expected: "string",
            });
        }
        None => return Err(ValidationError::MissingType("selector")),
    };

    match kind.as_str() {
        TAG_CONTAINS => {
            normalize_case_sensitive(map, &kind)?;
            require_text(map, &kind, "value")
        }
        ATTRIBUTE_VALUE => {
            normalize_case_sensitive(map, &kind)?;
            require_text(map, &kind, "attribute")?;
            require_text(map, &kind, "value")
        }
        CSS | XPATH => require_text(map, &kind, "value"),
        _ => Err(ValidationError::UnknownSelectorType(kind)),
    }
}

fn normalize_case_sensitive(map: &mut Map<String, Value>, owner: &str) -> Result<(), ValidationError> {
    rename_snake(map, "case_sensitive", "caseSensitive");
    match map.get("caseSensitive") {
        Some(Value::Bool(_)) => Ok(()),
        Some(_) => Err(wrong_kind(owner, "caseSensitive", "boolean")),
        None => {
            map.insert("caseSensitive".into(), Value::Bool(DEFAULT_CASE_SENSITIVE));
            Ok(())
        }
    }
}

fn require_text(map: &Map<String, Value>, owner: &str, field: &'static str) -> Result<(), ValidationError> {
    match map.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(Value::String(_)) => Err(ValidationError::EmptyValue {
            owner: owner.to_string(),
            field,
        }),
        Some(_) => Err(wrong_kind(owner, field, "string")),
        None => Err(missing(owner, field)),
    }
}

/// Moves `snake` to `camel`. When both are present the camelCase value wins
/// and the snake_case twin is dropped.
fn rename_snake(map: &mut Map<String, Value>, snake: &str, camel: &str) {
    if let Some(value) = map.remove(snake) {
        if !map.contains_key(camel) {
            map.insert(camel.to_string(), value);
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn missing(owner: &str, field: &'static str) -> ValidationError {
    ValidationError::MissingField {
        owner: owner.to_string(),
        field,
    }
}

fn wrong_kind(owner: &str, field: &'static str, expected: &'static str) -> ValidationError {
    ValidationError::WrongKind {
        owner: owner.to_string(),
        field,
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snake_case_wait_is_rewritten() {
        let mut actions = vec![json!({"type": "WaitAction", "time_seconds": 2.5})];
        assert!(validate(&mut actions).is_ok());
        assert_eq!(actions[0]["timeSeconds"], json!(2.5));
        assert!(actions[0].get("time_seconds").is_none());
    }

    #[test]
    fn snake_twin_dropped_when_camel_present() {
        let mut action = json!({"type": "WaitAction", "timeSeconds": 1, "time_seconds": 9});
        validate_action(&mut action).unwrap();
        assert_eq!(action, json!({"type": "WaitAction", "timeSeconds": 1}));
    }

    #[test]
    fn snake_case_selector_flag_is_rewritten() {
        let mut action = json!({
            "type": "ClickAction",
            "selector": {"type": "tagContainsSelector", "value": "Go", "case_sensitive": true}
        });
        validate_action(&mut action).unwrap();
        assert_eq!(action["selector"]["caseSensitive"], json!(true));
        assert!(action["selector"].get("case_sensitive").is_none());
    }

    #[test]
    fn missing_case_sensitive_defaults_false() {
        let mut action = json!({
            "type": "TypeAction",
            "text": "alice",
            "selector": {"type": "attributeValueSelector", "attribute": "name", "value": "username"}
        });
        validate_action(&mut action).unwrap();
        assert_eq!(action["selector"]["caseSensitive"], json!(false));
    }

    #[test]
    fn non_numeric_wait_rejected() {
        let mut action = json!({"type": "WaitAction", "timeSeconds": "2"});
        assert!(matches!(
            validate_action(&mut action),
            Err(ValidationError::WrongKind { field: "timeSeconds", .. })
        ));
    }

    #[test]
    fn empty_selector_value_rejected() {
        let mut action = json!({"type": "ClickAction", "selector": {"type": "cssSelector", "value": ""}});
        assert!(matches!(
            validate_action(&mut action),
            Err(ValidationError::EmptyValue { field: "value", .. })
        ));

        let mut action = json!({
            "type": "ClickAction",
            "selector": {"type": "attributeValueSelector", "attribute": "", "value": "x"}
        });
        assert!(matches!(
            validate_action(&mut action),
            Err(ValidationError::EmptyValue { field: "attribute", .. })
        ));
    }

    #[test]
    fn unknown_types_rejected() {
        let mut action = json!({"type": "HoverAction"});
        assert!(matches!(
            validate_action(&mut action),
            Err(ValidationError::UnknownActionType(_))
        ));
        let mut action = json!({"type": "ClickAction", "selector": {"type": "idSelector", "value": "a"}});
        assert!(matches!(
            validate_action(&mut action),
            Err(ValidationError::UnknownSelectorType(_))
        ));
    }

    #[test]
    fn scroll_needs_truthy_direction() {
        let mut ok = json!({"type": "ScrollAction", "down": 300});
        assert!(validate_action(&mut ok).is_ok());
        let mut bad = json!({"type": "ScrollAction", "down": false, "up": 0});
        assert_eq!(validate_action(&mut bad), Err(ValidationError::NoScrollDirection));
    }

    #[test]
    fn navigate_url_must_be_string() {
        let mut ok = json!({"type": "NavigateAction", "url": "not a url"});
        assert!(validate_action(&mut ok).is_ok());
        let mut bad = json!({"type": "NavigateAction", "url": 5});
        assert!(validate_action(&mut bad).is_err());
    }

    #[test]
    fn report_collects_positions() {
        let mut actions = vec![
            json!({"type": "ScreenshotAction"}),
            json!({"type": "TypeAction", "selector": {"type": "cssSelector", "value": "#q"}}),
            json!({"nope": true}),
        ];
        let report = validate(&mut actions);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].index, Some(1));
        assert_eq!(report.errors[1].index, Some(2));
        assert!(report.errors[0].to_string().starts_with("action 1:"));
    }

    #[test]
    fn empty_list_rejected() {
        let report = validate(&mut []);
        assert_eq!(report.first().map(|e| &e.error), Some(&ValidationError::Empty));
    }
}
