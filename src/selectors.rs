use crate::types::Selector;

pub const TAG_CONTAINS: &str = "tagContainsSelector";
pub const ATTRIBUTE_VALUE: &str = "attributeValueSelector";
pub const CSS: &str = "cssSelector";
pub const XPATH: &str = "xpathSelector";

pub const DEFAULT_CASE_SENSITIVE: bool = false;

/// Characters of the selector value that participate in a fingerprint.
const FINGERPRINT_VALUE_CHARS: usize = 50;

impl Selector {
    pub fn tag_contains(value: impl Into<String>) -> Self {
        Selector::TagContains {
            value: value.into(),
            case_sensitive: DEFAULT_CASE_SENSITIVE,
        }
    }

    pub fn attribute(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Selector::AttributeValue {
            attribute: attribute.into(),
            value: value.into(),
            case_sensitive: DEFAULT_CASE_SENSITIVE,
        }
    }

    pub fn css(value: impl Into<String>) -> Self {
        Selector::Css {
            value: value.into(),
        }
    }

    pub fn xpath(value: impl Into<String>) -> Self {
        Selector::Xpath {
            value: value.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Selector::TagContains { .. } => TAG_CONTAINS,
            Selector::AttributeValue { .. } => ATTRIBUTE_VALUE,
            Selector::Css { .. } => CSS,
            Selector::Xpath { .. } => XPATH,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Selector::TagContains { value, .. }
            | Selector::AttributeValue { value, .. }
            | Selector::Css { value }
            | Selector::Xpath { value } => value,
        }
    }

    /// Learning-store key: `type:attribute:value` for attribute selectors and
    /// `type:value` otherwise, with the value cut to its first 50 characters.
    pub fn fingerprint(&self) -> String {
        let value: String = self.value().chars().take(FINGERPRINT_VALUE_CHARS).collect();
        match self {
            Selector::AttributeValue { attribute, .. } => {
                format!("{}:{}:{}", self.kind(), attribute, value)
            }
            _ => format!("{}:{}", self.kind(), value),
        }
    }
}

/// How the planner can locate one logical page element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSpec {
    /// Element name for logs, e.g. `"password"`.
    pub kind: &'static str,
    pub attribute: &'static str,
    pub key: String,
    pub label: String,
    pub css: String,
}

impl ElementSpec {
    /// Candidates in ranking order: attribute, visible label, css fallback.
    pub fn candidates(&self) -> [Selector; 3] {
        [
            Selector::attribute(self.attribute, self.key.clone()),
            Selector::tag_contains(self.label.clone()),
            Selector::css(self.css.clone()),
        ]
    }

    pub fn username() -> Self {
        Self {
            kind: "username",
            attribute: "name",
            key: "username".into(),
            label: "Username".into(),
            css: "input[name='username']".into(),
        }
    }

    pub fn email() -> Self {
        Self {
            kind: "email",
            attribute: "name",
            key: "email".into(),
            label: "Email".into(),
            css: "input[type='email']".into(),
        }
    }

    pub fn password() -> Self {
        Self {
            kind: "password",
            attribute: "name",
            key: "password".into(),
            label: "Password".into(),
            css: "input[type='password']".into(),
        }
    }

    pub fn search() -> Self {
        Self {
            kind: "search",
            attribute: "name",
            key: "search".into(),
            label: "Search".into(),
            css: "input[type='search']".into(),
        }
    }

    pub fn submit(label: &str) -> Self {
        Self {
            kind: "button",
            attribute: "data-testid",
            key: format!("{}-button", slug(label)),
            label: label.to_string(),
            css: "button[type='submit']".into(),
        }
    }

    /// A clickable element known only by its visible text.
    pub fn click(label: &str) -> Self {
        let label = label.trim();
        Self {
            kind: "click",
            attribute: "id",
            key: slug(label),
            label: label.to_string(),
            css: format!("[aria-label='{}']", label.replace('\'', "\\'")),
        }
    }
}

fn slug(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for ch in label.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("element");
    }
    out
}
