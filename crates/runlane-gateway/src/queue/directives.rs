//! Inline control directives: `/queue`, `/think` and `/status`.
//!
//! Directives are stripped from the message body. A body that is nothing but
//! directives is answered synchronously and never reaches a lane.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use runlane_core::{DropPolicy, QueueMode, ThinkLevel};

static THINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^/(?:thinking|think|t)(?::(.*))?$").expect("static regex is valid")
});
static QUEUE_OPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(debounce|cap|drop):(.+)$").expect("static regex is valid")
});
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+)(ms|s|m)?$").expect("static regex is valid"));

/// A `/think` directive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThinkDirective {
    /// Level to set. `None` with no `raw` asks for the current level.
    pub level: Option<ThinkLevel>,
    /// The unrecognized level text, if any.
    pub raw: Option<String>,
}

/// A `/queue` directive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueDirective {
    pub reset: bool,
    pub mode: Option<QueueMode>,
    pub debounce: Option<Duration>,
    pub cap: Option<usize>,
    pub drop_policy: Option<DropPolicy>,
    /// Option tokens that could not be parsed.
    pub errors: Vec<String>,
}

impl QueueDirective {
    /// Whether the directive changes anything (as opposed to a bare query).
    pub const fn has_changes(&self) -> bool {
        self.reset || self.sets_values()
    }

    /// Whether the directive sets at least one setting.
    pub const fn sets_values(&self) -> bool {
        self.mode.is_some()
            || self.debounce.is_some()
            || self.cap.is_some()
            || self.drop_policy.is_some()
    }
}

/// Directives found in a message body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedDirectives {
    /// Body with directives removed and whitespace collapsed.
    pub cleaned: String,
    pub think: Option<ThinkDirective>,
    pub queue: Option<QueueDirective>,
    pub status: bool,
}

impl ParsedDirectives {
    pub const fn has_directive(&self) -> bool {
        self.think.is_some() || self.queue.is_some() || self.status
    }

    /// Only directives, no content to run.
    pub const fn is_directive_only(&self) -> bool {
        self.has_directive() && self.cleaned.is_empty()
    }
}

/// Extract directives from `body`.
pub fn parse_directives(body: &str) -> ParsedDirectives {
    let tokens: Vec<&str> = body.split_whitespace().collect();
    let mut parsed = ParsedDirectives::default();
    let mut kept = Vec::with_capacity(tokens.len());

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        i += 1;

        if let Some(caps) = THINK_RE.captures(token) {
            let inline = caps.get(1).map(|m| m.as_str().trim()).filter(|s| !s.is_empty());
            let directive = if let Some(raw) = inline {
                ThinkDirective {
                    level: ThinkLevel::normalize(raw),
                    raw: ThinkLevel::normalize(raw).is_none().then(|| raw.to_string()),
                }
            } else if let Some(level) = tokens.get(i).and_then(|t| ThinkLevel::normalize(t)) {
                i += 1;
                ThinkDirective {
                    level: Some(level),
                    raw: None,
                }
            } else {
                ThinkDirective::default()
            };
            parsed.think = Some(directive);
            continue;
        }

        if token.eq_ignore_ascii_case("/queue") {
            let mut directive = QueueDirective::default();
            while let Some(next) = tokens.get(i) {
                if !apply_queue_token(&mut directive, next) {
                    break;
                }
                i += 1;
            }
            parsed.queue = Some(directive);
            continue;
        }

        if token.eq_ignore_ascii_case("/status") {
            parsed.status = true;
            continue;
        }

        kept.push(token);
    }

    parsed.cleaned = kept.join(" ");
    parsed
}

/// Consume one `/queue` argument. Returns `false` when the token is not a
/// queue argument and belongs to the message body.
fn apply_queue_token(directive: &mut QueueDirective, token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    if matches!(lower.as_str(), "reset" | "default" | "clear") {
        directive.reset = true;
        return true;
    }
    if directive.mode.is_none() {
        if let Some(mode) = QueueMode::parse(&lower) {
            directive.mode = Some(mode);
            return true;
        }
    }
    let Some(caps) = QUEUE_OPTION_RE.captures(token) else {
        return false;
    };
    let key = caps[1].to_ascii_lowercase();
    let value = caps[2].trim();
    match key.as_str() {
        "debounce" => match parse_duration(value) {
            Some(d) => directive.debounce = Some(d),
            None => directive.errors.push(token.to_string()),
        },
        "cap" => match value.parse::<usize>() {
            Ok(n) if n > 0 => directive.cap = Some(n),
            _ => directive.errors.push(token.to_string()),
        },
        _ => match DropPolicy::parse(value) {
            Some(p) => directive.drop_policy = Some(p),
            None => directive.errors.push(token.to_string()),
        },
    }
    true
}

/// Parse `500`, `500ms`, `2s` or `1m`. Bare numbers are milliseconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let caps = DURATION_RE.captures(raw.trim())?;
    let n: u64 = caps[1].parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
    match unit.as_deref() {
        None | Some("ms") => Some(Duration::from_millis(n)),
        Some("s") => Some(Duration::from_secs(n)),
        Some("m") => n.checked_mul(60).map(Duration::from_secs),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_has_no_directives() {
        let parsed = parse_directives("  hello   there ");
        assert!(!parsed.has_directive());
        assert_eq!(parsed.cleaned, "hello there");
    }

    #[test]
    fn think_with_inline_and_separate_level() {
        let parsed = parse_directives("/think:high solve this");
        assert_eq!(parsed.think.as_ref().and_then(|t| t.level), Some(ThinkLevel::High));
        assert_eq!(parsed.cleaned, "solve this");

        let parsed = parse_directives("please /t low");
        assert_eq!(parsed.think.as_ref().and_then(|t| t.level), Some(ThinkLevel::Low));
        assert_eq!(parsed.cleaned, "please");
    }

    #[test]
    fn think_without_level_keeps_following_text() {
        let parsed = parse_directives("/think about cats");
        assert_eq!(parsed.think, Some(ThinkDirective::default()));
        assert_eq!(parsed.cleaned, "about cats");
    }

    #[test]
    fn invalid_inline_level_is_reported() {
        let parsed = parse_directives("/think:loud");
        let think = parsed.think.clone().unwrap_or_default();
        assert_eq!(think.level, None);
        assert_eq!(think.raw.as_deref(), Some("loud"));
        assert!(parsed.is_directive_only());
    }

    #[test]
    fn slash_words_are_not_think() {
        let parsed = parse_directives("/temperature check");
        assert!(parsed.think.is_none());
        assert_eq!(parsed.cleaned, "/temperature check");
    }

    #[test]
    fn queue_directive_with_options() {
        let parsed = parse_directives("/queue collect debounce:2s cap:5 drop:old");
        let queue = parsed.queue.clone().unwrap_or_default();
        assert_eq!(queue.mode, Some(QueueMode::Collect));
        assert_eq!(queue.debounce, Some(Duration::from_secs(2)));
        assert_eq!(queue.cap, Some(5));
        assert_eq!(queue.drop_policy, Some(DropPolicy::Old));
        assert!(queue.errors.is_empty());
        assert!(parsed.is_directive_only());
    }

    #[test]
    fn queue_stops_at_body_text() {
        let parsed = parse_directives("/queue interrupt stop what you are doing");
        assert_eq!(
            parsed.queue.as_ref().and_then(|q| q.mode),
            Some(QueueMode::Interrupt)
        );
        assert_eq!(parsed.cleaned, "stop what you are doing");
        assert!(!parsed.is_directive_only());
    }

    #[test]
    fn bare_queue_is_a_query() {
        let parsed = parse_directives("/queue");
        assert!(parsed.queue.as_ref().is_some_and(|q| !q.has_changes()));
        assert!(parsed.is_directive_only());
    }

    #[test]
    fn queue_reset_and_bad_option() {
        let parsed = parse_directives("/queue reset cap:zero");
        let queue = parsed.queue.unwrap_or_default();
        assert!(queue.reset);
        assert_eq!(queue.errors, vec!["cap:zero".to_string()]);
    }

    #[test]
    fn status_is_directive_only() {
        assert!(parse_directives("/status").is_directive_only());
        assert!(parse_directives("/STATUS").status);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("soon"), None);
    }
}
