//! Thinking levels accepted by agent runs.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkLevel {
    Off,
    Minimal,
    Low,
    Medium,
    High,
    #[serde(rename = "xhigh")]
    XHigh,
}

impl ThinkLevel {
    pub const ALL: [Self; 6] = [
        Self::Off,
        Self::Minimal,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::XHigh,
    ];

    /// Normalize user input, accepting common aliases.
    pub fn normalize(raw: &str) -> Option<Self> {
        let key = raw.trim().to_ascii_lowercase();
        match key.as_str() {
            "off" | "none" | "disable" | "disabled" => Some(Self::Off),
            "on" | "enable" | "enabled" | "low" | "thinkhard" | "think-hard" => Some(Self::Low),
            "min" | "minimal" | "think" => Some(Self::Minimal),
            "mid" | "med" | "medium" | "harder" | "thinkharder" | "think-harder" => {
                Some(Self::Medium)
            }
            "high" | "ultra" | "ultrathink" | "max" | "highest" => Some(Self::High),
            "xhigh" | "x-high" | "x_high" => Some(Self::XHigh),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::XHigh => "xhigh",
        }
    }

    /// Value sent in a session patch. `off` clears the override.
    pub const fn patch_value(self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            other => Some(other.as_str()),
        }
    }

    /// Comma-separated list of canonical levels, for error messages.
    pub fn format_levels() -> String {
        Self::ALL
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ThinkLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_aliases() {
        assert_eq!(ThinkLevel::normalize("ON"), Some(ThinkLevel::Low));
        assert_eq!(ThinkLevel::normalize("think"), Some(ThinkLevel::Minimal));
        assert_eq!(ThinkLevel::normalize("harder"), Some(ThinkLevel::Medium));
        assert_eq!(ThinkLevel::normalize("ultra"), Some(ThinkLevel::High));
        assert_eq!(ThinkLevel::normalize("x-high"), Some(ThinkLevel::XHigh));
        assert_eq!(ThinkLevel::normalize("loud"), None);
    }

    #[test]
    fn off_clears_patch() {
        assert_eq!(ThinkLevel::Off.patch_value(), None);
        assert_eq!(ThinkLevel::High.patch_value(), Some("high"));
    }

    #[test]
    fn levels_listing() {
        assert_eq!(
            ThinkLevel::format_levels(),
            "off, minimal, low, medium, high, xhigh"
        );
    }
}
