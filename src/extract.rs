//! Prompt classification and literal extraction.
//!
//! Everything here is pattern matching over the raw prompt; nothing tries to
//! understand the page.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{ScrollDirection, TaskClass};

static QUOTED: Lazy<Regex> = Lazy::new(|| re(r#""([^"]+)"|'([^'\s][^']*)'"#));
static USERNAME: Lazy<Regex> = Lazy::new(|| {
    re(r#"(?i)\b(?:username|user\s+name|uname|user|login)\s*[:=]\s*['"]?([^\s'",]+)"#)
});
static PASSWORD: Lazy<Regex> =
    Lazy::new(|| re(r#"(?i)\b(?:password|passwd|pass|pwd)\s*[:=]\s*['"]?([^\s'",]+)"#));
static EMAIL: Lazy<Regex> =
    Lazy::new(|| re(r#"(?i)\b(?:e-?mail|mail)\s*[:=]?\s*['"]?([^\s'",<>]+@[^\s'",]+)"#));
/// Words a credential capture can land on when the prompt leaves the value
/// blank, e.g. `username: and password:`.
static NOT_A_VALUE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)^(?:and|then|with|or|on|in|at|to|using|(?:user(?:\s*name)?|uname|login|pass(?:word|wd)?|pwd|e-?mail|mail)\s*[:=].*)$")
});
static WAIT: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\b(\d+(?:\.\d+)?)\s*(?:seconds?|secs?|s)\b"));
static URL: Lazy<Regex> = Lazy::new(|| re(r#"(?i)\b(?:https?://|www\.)[^\s'"<>]+"#));
static PATH: Lazy<Regex> = Lazy::new(|| re(r"(?:^|\s)(/[\w\-./?=&%]*)"));
static SEARCH: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:search(?:\s+for)?|find|look\s+for|query)\s+(?:the\s+|a\s+|an\s+)?(.+?)(?:\s+(?:on|in|at|and|then|using)\b|[.,;!?]|$)")
});
static CLICK: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:click|press|tap|select|choose|toggle)\s+(?:on\s+)?(?:the\s+|a\s+|an\s+)?(.+?)(?:\s+(?:button|link|tab|option|element|on|in|and|then)\b|[.,;!?]|$)")
});
static SCROLL: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\bscroll(?:ing|s)?\b(?:\s+(?:the\s+page\s+)?(up|down|left|right))?"));

static CLASS_KEYWORDS: Lazy<Vec<(TaskClass, Regex)>> = Lazy::new(|| {
    vec![
        (
            TaskClass::Login,
            re(r"(?i)\b(?:login|log\s+in|logon|sign\s*in|authenticate)\b"),
        ),
        (
            TaskClass::FormFill,
            re(r"(?i)\b(?:fill|form|register|registration|sign\s*up|submit)\b"),
        ),
        (
            TaskClass::Search,
            re(r"(?i)\b(?:search|find|look\s+for|query)\b"),
        ),
        (
            TaskClass::Navigate,
            re(r"(?i)\b(?:navigate|go\s+to|visit|open|browse)\b"),
        ),
        (
            TaskClass::ClickOnly,
            re(r"(?i)\b(?:click|press|tap|select|choose|toggle)\b"),
        ),
        (
            TaskClass::WaitObserve,
            re(r"(?i)\b(?:wait|observe|watch|scroll|screenshot)\b"),
        ),
    ]
});

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static prompt regex")
}

/// Literals pulled out of a prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptParams {
    pub quoted: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
    pub wait_seconds: Option<f64>,
    pub url: Option<String>,
    pub path: Option<String>,
    pub search_query: Option<String>,
    pub click_target: Option<String>,
    pub scroll: Option<ScrollDirection>,
}

impl PromptParams {
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some() || self.email.is_some()
    }
}

pub fn extract(prompt: &str) -> PromptParams {
    let quoted = QUOTED
        .captures_iter(prompt)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let url = URL.find(prompt).map(|m| {
        let url = clean(m.as_str());
        if url.to_ascii_lowercase().starts_with("www.") {
            format!("https://{url}")
        } else {
            url
        }
    });

    let path = PATH
        .captures(prompt)
        .and_then(|c| c.get(1))
        .map(|m| clean(m.as_str()))
        .filter(|p| p.len() > 1);

    let scroll = SCROLL.captures(prompt).map(|c| {
        match c.get(1).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
            Some("up") => ScrollDirection::Up,
            Some("left") => ScrollDirection::Left,
            Some("right") => ScrollDirection::Right,
            _ => ScrollDirection::Down,
        }
    });

    PromptParams {
        quoted,
        username: credential(&USERNAME, prompt),
        password: credential(&PASSWORD, prompt),
        email: credential(&EMAIL, prompt),
        wait_seconds: WAIT
            .captures(prompt)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok()),
        url,
        path,
        search_query: capture(&SEARCH, prompt),
        click_target: capture(&CLICK, prompt),
        scroll,
    }
}

/// First class in declaration order whose keywords appear in the prompt.
/// Credential literals alone are enough for form-fill.
pub fn classify(prompt: &str, params: &PromptParams) -> TaskClass {
    for (class, keywords) in CLASS_KEYWORDS.iter() {
        let hit = keywords.is_match(prompt)
            || (*class == TaskClass::FormFill && params.has_credentials());
        if hit {
            return *class;
        }
    }
    TaskClass::Generic
}

fn capture(pattern: &Regex, prompt: &str) -> Option<String> {
    pattern
        .captures(prompt)
        .and_then(|c| c.get(1))
        .map(|m| clean(m.as_str()))
        .filter(|s| !s.is_empty())
}

/// First labelled value that is really a value and not the next word of the
/// sentence.
fn credential(pattern: &Regex, prompt: &str) -> Option<String> {
    pattern
        .captures_iter(prompt)
        .filter_map(|c| c.get(1))
        .map(|m| clean(m.as_str()))
        .find(|v| !v.is_empty() && !NOT_A_VALUE.is_match(v))
}

fn clean(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .trim_end_matches(['.', ',', ';', ':', '!', '?', ')'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_literals() {
        let prompt = "Login with username:alice and password:pw123 on /login";
        let params = extract(prompt);
        assert_eq!(params.username.as_deref(), Some("alice"));
        assert_eq!(params.password.as_deref(), Some("pw123"));
        assert_eq!(params.path.as_deref(), Some("/login"));
        assert_eq!(classify(prompt, &params), TaskClass::Login);
    }

    #[test]
    fn credentials_keep_placeholders() {
        let params = extract("Sign up with username: user<web_agent_id>, email: 'a@b.com'");
        assert_eq!(params.username.as_deref(), Some("user<web_agent_id>"));
        assert_eq!(params.email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn blank_credentials_are_not_filled_with_neighbours() {
        let params = extract("Login with username: and password:");
        assert_eq!(params.username, None);
        assert_eq!(params.password, None);

        let params = extract("Login with username: then password: s3cret");
        assert_eq!(params.username, None);
        assert_eq!(params.password.as_deref(), Some("s3cret"));

        let params = extract("Login with username: password:pw");
        assert_eq!(params.username, None);
        assert_eq!(params.password.as_deref(), Some("pw"));
    }

    #[test]
    fn credentials_imply_form_fill() {
        let prompt = "Use email: bob@example.com and password = hunter2";
        let params = extract(prompt);
        assert_eq!(classify(prompt, &params), TaskClass::FormFill);
    }

    #[test]
    fn wait_seconds() {
        let params = extract("Wait 2 seconds then take a screenshot");
        assert_eq!(params.wait_seconds, Some(2.0));
        assert_eq!(
            classify("Wait 2 seconds then take a screenshot", &params),
            TaskClass::WaitObserve
        );
    }

    #[test]
    fn urls_from_prompt() {
        let params = extract("Open www.example.org/shop, then look around.");
        assert_eq!(params.url.as_deref(), Some("https://www.example.org/shop"));
        let params = extract("visit https://example.com/a?b=1.");
        assert_eq!(params.url.as_deref(), Some("https://example.com/a?b=1"));
        assert_eq!(params.path, None);
    }

    #[test]
    fn search_query_and_click_target() {
        let params = extract("Search for red shoes on the store");
        assert_eq!(params.search_query.as_deref(), Some("red shoes"));

        let params = extract("Click the Add to Cart button");
        assert_eq!(params.click_target.as_deref(), Some("Add to Cart"));

        let params = extract(r#"Search for "blue hat" and open it"#);
        assert_eq!(params.quoted, vec!["blue hat".to_string()]);
    }

    #[test]
    fn scroll_direction_defaults_down() {
        assert_eq!(extract("scroll and look").scroll, Some(ScrollDirection::Down));
        assert_eq!(extract("Scroll up a bit").scroll, Some(ScrollDirection::Up));
        assert_eq!(extract("nothing here").scroll, None);
    }

    #[test]
    fn classification_order() {
        let cases = [
            ("Sign in and search for cats", TaskClass::Login),
            ("Fill the contact form", TaskClass::FormFill),
            ("Find the cheapest flight", TaskClass::Search),
            ("Navigate to example.com and take a screenshot", TaskClass::Navigate),
            ("Click the month view", TaskClass::ClickOnly),
            ("Take a screenshot", TaskClass::WaitObserve),
            ("", TaskClass::Generic),
            ("do something", TaskClass::Generic),
        ];
        for (prompt, expected) in cases {
            assert_eq!(classify(prompt, &extract(prompt)), expected, "{prompt}");
        }
    }
}
