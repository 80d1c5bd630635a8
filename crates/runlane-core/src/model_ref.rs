//! `provider/model` references.

use crate::config::UNKNOWN_PROVIDER;

/// A model reference split into provider and model id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelRef {
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Split `provider/model`. A reference without a slash has no provider.
pub fn split_model_ref(raw: Option<&str>) -> ModelRef {
    let Some(trimmed) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return ModelRef::default();
    };
    match trimmed.split_once('/') {
        Some((provider, model)) if !model.trim().is_empty() => {
            let provider = provider.trim().to_ascii_lowercase();
            ModelRef {
                provider: (!provider.is_empty()).then_some(provider),
                model: Some(model.trim().to_string()),
            }
        }
        _ => ModelRef {
            provider: None,
            model: Some(trimmed.to_string()),
        },
    }
}

/// Provider bucket for a model reference, `unknown` when unresolvable.
pub fn resolve_provider(raw: Option<&str>) -> String {
    split_model_ref(raw)
        .provider
        .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_provider_and_model() {
        let r = split_model_ref(Some("OpenAI/gpt-5"));
        assert_eq!(r.provider.as_deref(), Some("openai"));
        assert_eq!(r.model.as_deref(), Some("gpt-5"));
    }

    #[test]
    fn bare_model_has_no_provider() {
        let r = split_model_ref(Some("gpt-5"));
        assert_eq!(r.provider, None);
        assert_eq!(r.model.as_deref(), Some("gpt-5"));
        assert_eq!(split_model_ref(Some("  ")), ModelRef::default());
        assert_eq!(split_model_ref(None), ModelRef::default());
    }

    #[test]
    fn unresolvable_provider_is_unknown() {
        assert_eq!(resolve_provider(Some("gpt-5")), "unknown");
        assert_eq!(resolve_provider(None), "unknown");
        assert_eq!(resolve_provider(Some("anthropic/claude")), "anthropic");
    }
}
